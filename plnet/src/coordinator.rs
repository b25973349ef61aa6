//! # The connection lifecycle coordinator
//!
//! One event loop, one handler. Everything that mutates the broker session,
//! the peer records, or the callback tables goes through [`NodeIn`] events
//! on this loop: API calls, transport events, engine events, and timer
//! firings. Transport and engine loops are piped into this loop; the
//! coordinator posts back into them through stored handles, so no state is
//! ever touched from a foreign thread.
//!
//! The routing lives here; the actual state machines are implemented in
//! [`crate::session`] (broker session), [`crate::peer`] (per-peer
//! negotiations) and [`crate::relay`] (socket-message relay), all as
//! methods on [`Coordinator`].

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use plarch::{
    event_loop::{EventHandler, EventLoop},
    rtc::{RtcOut, RtcSpawner, SessionSdp},
    socket::{SocketLoop, SocketOut, SocketSpawner},
    tasks::Timer,
};

use crate::{
    codec::{AckStatus, Envelope, Outgoing},
    config::{BrokerEndpoint, LocalIdentity, Settings},
    dispatch::Dispatcher,
    framing::Chunk,
    peer::{ConnectFailedReason, PeerKey, Peers, Role},
    relay::{SendSocketError, StatusCheckError},
    session::{BrokerError, Session},
    store::{BrokerCallbacks, IncomingPolicy, PeerCallbacks, RelayHandler, Reply, Shared},
};

pub type NodeLoop = EventLoop<NodeIn, NodeEvent>;

/// Everything the coordinator reacts to.
#[derive(Debug, Clone)]
pub enum NodeIn {
    /// A public API call.
    Call(ApiCall),
    /// An event from the signaling transport, tagged with the transport
    /// generation it belongs to.
    Socket(u64, SocketOut),
    /// An event from one peer's engine.
    Rtc(PeerKey, RtcOut),
    /// A per-peer connection-attempt timer fired.
    PeerTimeout { key: PeerKey, session_id: String },
    /// The broker authentication timer fired.
    AuthTimeout { transport_gen: u64 },
    /// The reconnect backoff elapsed.
    ReconnectNow { epoch: u64 },
    /// An acknowledgement was not received in time.
    AckTimeout { seq: u64 },
    /// The incoming-connection predicate came back from the executor.
    AcceptVerdict {
        remote: String,
        session_id: String,
        description: SessionSdp,
        accepted: bool,
    },
}

/// Public API calls, posted by [`crate::node::Node`].
#[derive(Clone)]
pub enum ApiCall {
    ConnectBroker {
        endpoint: BrokerEndpoint,
        callbacks: BrokerCallbacks,
        timeout: Duration,
        done: Reply<Result<(), BrokerError>>,
    },
    DisconnectBroker {
        done: Reply<()>,
    },
    AllowIncoming {
        policy: IncomingPolicy,
    },
    DisallowIncoming,
    RegisterRelay {
        channel: String,
        handler: RelayHandler,
    },
    UnregisterRelay {
        channel: String,
    },
    ConnectNode {
        remote: String,
        callbacks: PeerCallbacks,
        timeout: Duration,
        done: Reply<Result<(), ConnectFailedReason>>,
    },
    DisconnectNode {
        remote: String,
    },
    SendMessage {
        remote: String,
        chunks: Vec<Chunk>,
    },
    SendSocketMsg {
        to: String,
        channel: String,
        content: String,
        done: Reply<Result<(), SendSocketError>>,
    },
    QueryConnected {
        ids: Vec<String>,
        done: Reply<Result<HashMap<String, bool>, StatusCheckError>>,
    },
}

impl fmt::Debug for ApiCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApiCall::ConnectBroker { .. } => "ConnectBroker",
            ApiCall::DisconnectBroker { .. } => "DisconnectBroker",
            ApiCall::AllowIncoming { .. } => "AllowIncoming",
            ApiCall::DisallowIncoming => "DisallowIncoming",
            ApiCall::RegisterRelay { .. } => "RegisterRelay",
            ApiCall::UnregisterRelay { .. } => "UnregisterRelay",
            ApiCall::ConnectNode { .. } => "ConnectNode",
            ApiCall::DisconnectNode { .. } => "DisconnectNode",
            ApiCall::SendMessage { .. } => "SendMessage",
            ApiCall::SendSocketMsg { .. } => "SendSocketMsg",
            ApiCall::QueryConnected { .. } => "QueryConnected",
        };
        write!(f, "ApiCall::{name}")
    }
}

/// Observable node events; tests and embedding code tap these.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    BrokerConnected,
    BrokerReconnecting,
    BrokerDisconnected,
    PeerConnected {
        remote: String,
        role: Role,
    },
    PeerFailed {
        remote: String,
        role: Role,
        reason: ConnectFailedReason,
    },
    PeerDisconnected {
        remote: String,
        role: Role,
    },
    MessageReceived {
        from: String,
        channel: String,
        payload: Vec<u8>,
    },
    SocketMsgReceived {
        from: String,
        channel: String,
        content: String,
    },
}

/// What to do with the acknowledgement of an emitted frame.
pub(crate) enum AckWaiter {
    Attempt {
        key: PeerKey,
        session_id: String,
    },
    Candidate {
        key: PeerKey,
        session_id: String,
    },
    Relay(Reply<Result<(), SendSocketError>>),
    Query(Reply<Result<HashMap<String, bool>, StatusCheckError>>),
}

pub struct Coordinator {
    pub(crate) identity: LocalIdentity,
    pub(crate) settings: Settings,
    pub(crate) shared: Arc<Shared>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) handle: NodeLoop,
    pub(crate) socket_spawner: SocketSpawner,
    pub(crate) rtc_spawner: RtcSpawner,
    pub(crate) socket: Option<SocketLoop>,
    pub(crate) session: Session,
    pub(crate) peers: Peers,
    pub(crate) seq: u64,
    pub(crate) pending_acks: HashMap<u64, AckWaiter>,
    pub(crate) ack_timers: HashMap<u64, Timer>,
}

impl Coordinator {
    /// Builds the coordinator loop. The node is idle until a
    /// `ConnectBroker` call arrives.
    pub fn start(
        identity: LocalIdentity,
        settings: Settings,
        shared: Arc<Shared>,
        dispatcher: Dispatcher,
        socket_spawner: SocketSpawner,
        rtc_spawner: RtcSpawner,
    ) -> anyhow::Result<NodeLoop> {
        let handle: NodeLoop = EventLoop::new();
        handle.add_handler(Box::new(Self {
            identity,
            settings,
            shared,
            dispatcher,
            handle: handle.clone(),
            socket_spawner,
            rtc_spawner,
            socket: None,
            session: Session::new(),
            peers: Peers::default(),
            seq: 0,
            pending_acks: HashMap::new(),
            ack_timers: HashMap::new(),
        }))?;
        Ok(handle)
    }

    async fn call(&mut self, call: ApiCall) -> Vec<NodeEvent> {
        match call {
            ApiCall::ConnectBroker {
                endpoint,
                callbacks,
                timeout,
                done,
            } => self.connect_broker(endpoint, callbacks, timeout, done).await,
            ApiCall::DisconnectBroker { done } => self.disconnect_broker(done),
            ApiCall::AllowIncoming { policy } => {
                self.shared.set_incoming_policy(Some(policy));
                vec![]
            }
            ApiCall::DisallowIncoming => {
                self.shared.set_incoming_policy(None);
                vec![]
            }
            ApiCall::RegisterRelay { channel, handler } => {
                self.shared.set_relay_handler(&channel, Some(handler));
                vec![]
            }
            ApiCall::UnregisterRelay { channel } => {
                self.shared.set_relay_handler(&channel, None);
                vec![]
            }
            ApiCall::ConnectNode {
                remote,
                callbacks,
                timeout,
                done,
            } => self.connect_node(remote, callbacks, timeout, done).await,
            ApiCall::DisconnectNode { remote } => self.disconnect_node(&remote),
            ApiCall::SendMessage { remote, chunks } => self.send_chunks(&remote, chunks),
            ApiCall::SendSocketMsg {
                to,
                channel,
                content,
                done,
            } => self.send_socket_msg(to, channel, content, done),
            ApiCall::QueryConnected { ids, done } => self.query_connected(ids, done),
        }
    }

    /// Assigns the next sequence number and pushes one frame onto the
    /// transport, optionally registering interest in its acknowledgement.
    pub(crate) fn emit_frame(
        &mut self,
        frame: Outgoing,
        waiter: Option<AckWaiter>,
        ack_timer: bool,
    ) -> anyhow::Result<u64> {
        let Some(socket) = &self.socket else {
            anyhow::bail!("no signaling transport");
        };
        self.seq += 1;
        let seq = self.seq;
        socket.post(plarch::socket::SocketIn::Send(frame.encode(seq)))?;
        if let Some(waiter) = waiter {
            self.pending_acks.insert(seq, waiter);
            if ack_timer {
                let handle = self.handle.clone();
                self.ack_timers.insert(
                    seq,
                    Timer::after(self.settings.ack_timeout, move || {
                        let _ = handle.post(NodeIn::AckTimeout { seq });
                    }),
                );
            }
        }
        Ok(seq)
    }

    /// Envelope for a message from this node to `to` within one session.
    pub(crate) fn envelope(&self, to: &str, session_id: &str) -> Envelope {
        Envelope {
            platform_from: self.identity.platform.clone(),
            version_from: self.identity.version.clone(),
            from: self.identity.node_id.clone(),
            to: to.to_string(),
            session_id: session_id.to_string(),
        }
    }

    /// Envelope answering an incoming message on its own session.
    pub(crate) fn reply_envelope(&self, env: &Envelope) -> Envelope {
        self.envelope(&env.from, &env.session_id)
    }

    /// Messages addressed to somebody else are dropped.
    pub(crate) fn for_me(&self, env: &Envelope) -> bool {
        if env.to != self.identity.node_id {
            log::debug!(
                "Dropping message for {} (we are {})",
                env.to,
                self.identity.node_id
            );
            return false;
        }
        true
    }

    fn on_ack(&mut self, seq: u64, status: AckStatus, data: Option<serde_json::Value>) -> Vec<NodeEvent> {
        self.ack_timers.remove(&seq);
        match self.pending_acks.remove(&seq) {
            Some(AckWaiter::Attempt { key, session_id }) => {
                self.attempt_ack(&key, &session_id, status)
            }
            Some(AckWaiter::Candidate { key, session_id }) => {
                self.candidate_ack(&key, &session_id, seq, status)
            }
            Some(AckWaiter::Relay(done)) => {
                done.send(crate::relay::relay_ack_result(status));
                vec![]
            }
            Some(AckWaiter::Query(done)) => {
                done.send(crate::relay::query_ack_result(status, data));
                vec![]
            }
            None => {
                log::debug!("Acknowledgement for unknown seq {seq}");
                vec![]
            }
        }
    }

    fn on_ack_timeout(&mut self, seq: u64) -> Vec<NodeEvent> {
        self.ack_timers.remove(&seq);
        match self.pending_acks.remove(&seq) {
            Some(AckWaiter::Relay(done)) => done.send(Err(SendSocketError::UnknownError)),
            Some(AckWaiter::Query(done)) => done.send(Err(StatusCheckError::UnknownError)),
            // Peer negotiations are bounded by their own attempt timer.
            Some(_) | None => {}
        }
        vec![]
    }
}

#[async_trait]
impl EventHandler<NodeIn, NodeEvent> for Coordinator {
    async fn events(&mut self, inputs: Vec<NodeIn>) -> Vec<NodeEvent> {
        let mut out = vec![];
        for msg in inputs {
            log::trace!("{}: processing {msg:?}", self.identity.node_id);
            out.extend(match msg {
                NodeIn::Call(call) => self.call(call).await,
                NodeIn::Socket(generation, event) => self.handle_socket(generation, event).await,
                NodeIn::Rtc(key, event) => self.handle_rtc(key, event),
                NodeIn::PeerTimeout { key, session_id } => self.peer_timeout(&key, &session_id),
                NodeIn::AuthTimeout { transport_gen } => self.auth_timeout(transport_gen),
                NodeIn::ReconnectNow { epoch } => self.reconnect_now(epoch).await,
                NodeIn::AckTimeout { seq } => self.on_ack_timeout(seq),
                NodeIn::AcceptVerdict {
                    remote,
                    session_id,
                    description,
                    accepted,
                } => {
                    self.accept_verdict(remote, session_id, description, accepted)
                        .await
                }
            });
        }
        out
    }
}

impl Coordinator {
    pub(crate) async fn handle_socket(&mut self, generation: u64, event: SocketOut) -> Vec<NodeEvent> {
        if generation != self.session.transport_gen {
            log::trace!("Dropping stale transport event {event:?}");
            return vec![];
        }
        match event {
            SocketOut::Connected => {
                log::debug!("{}: transport is up, awaiting AUTHENTICATED", self.identity.node_id);
                vec![]
            }
            SocketOut::Message(text) => self.route_frame(&text).await,
            SocketOut::Closed(reason) => self.socket_closed(reason),
            SocketOut::Error(e) => {
                log::debug!("Transport error: {e}");
                vec![]
            }
        }
    }

    async fn route_frame(&mut self, text: &str) -> Vec<NodeEvent> {
        use crate::codec::{decode, DecodeError, Incoming};
        match decode(text) {
            Ok(Incoming::Authenticated { config }) => self.on_authenticated(config),
            Ok(Incoming::Ack { seq, status, data }) => self.on_ack(seq, status, data),
            Ok(Incoming::Attempt { env, description }) => self.on_attempt(env, description),
            Ok(Incoming::Acceptance { env, description }) => self.on_acceptance(env, description),
            Ok(Incoming::Refusal { env }) => {
                self.peer_rejected(env, ConnectFailedReason::ConnectionRefusedByRemoteNode)
            }
            Ok(Incoming::IncomingNotAllowed { env }) => self.peer_rejected(
                env,
                ConnectFailedReason::ConnectionsNotAllowedOnRemoteNode,
            ),
            Ok(Incoming::IceToResponder { env, candidate }) => {
                self.remote_candidate(env, candidate, Role::Responder)
            }
            Ok(Incoming::IceToInitiator { env, candidate }) => {
                self.remote_candidate(env, candidate, Role::Initiator)
            }
            Ok(Incoming::SocketMsg {
                from,
                to,
                channel,
                content,
            }) => self.incoming_socket_msg(from, to, channel, content),
            Err(DecodeError::BadRtcConfiguration(e)) => self.bad_rtc_configuration(&e),
            Err(e) => {
                log::debug!("Discarding frame: {e}");
                vec![]
            }
        }
    }
}
