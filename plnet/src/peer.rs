//! # Per-peer connection state machines
//!
//! One [`PeerRecord`] per negotiation, keyed by the remote node id and the
//! local [`Role`]. Initiator and responder share the record shape and most
//! of the machinery; the differences are who creates the data channel,
//! which message types go out at each step, and which callbacks fire on
//! success. A record owns its engine, its attempt timer, its ICE buffers
//! and its reassembly state; removing the record tears all of that down.
//!
//! Session discipline: every signaling message carries the session id of
//! the negotiation it belongs to, and messages with a stale session id are
//! dropped. A record makes exactly one terminal transition.

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use plarch::{
    rtc::{IceCandidate, RtcIn, RtcLoop, RtcOut, SdpKind, SessionSdp},
    tasks::Timer,
};

use crate::{
    codec::{AckStatus, Envelope, Outgoing},
    coordinator::{AckWaiter, Coordinator, NodeEvent, NodeIn},
    framing::{Assembler, Chunk},
    store::{PeerCallbacks, Reply},
};

/// Why a connection attempt ended without a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectFailedReason {
    #[error("the local node is not connected to the broker")]
    LocalNodeNotConnectedToBroker,
    #[error("tried to connect to self")]
    TriedToConnectToSelf,
    #[error("already connected to the remote node")]
    AlreadyConnectedToRemoteNode,
    #[error("the connection attempt was closed by the user")]
    ConnectionAttemptClosedByUser,
    #[error("the connection attempt timed out")]
    ConnectionTimeout,
    #[error("the remote node is not connected to the broker")]
    RemoteNodeNotConnectedToBroker,
    #[error("the connection negotiation failed")]
    ConnectionNegotiationError,
    #[error("the remote node refused the connection")]
    ConnectionRefusedByRemoteNode,
    #[error("the remote node does not allow incoming connections")]
    ConnectionsNotAllowedOnRemoteNode,
}

/// The local role in one negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

/// States of one negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Created,
    AwaitingLocalDescription,
    AwaitingRemoteDescription,
    IceExchange,
    DataChannelOpening,
    Connected,
}

/// Identifies one record: remote node id plus local role.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub remote: String,
    pub role: Role,
}

impl PeerKey {
    pub fn new(remote: &str, role: Role) -> Self {
        Self {
            remote: remote.to_string(),
            role,
        }
    }
}

/// One negotiation with one remote node.
pub struct PeerRecord {
    pub remote: String,
    pub role: Role,
    pub session_id: String,
    pub state: PeerState,
    pub engine: Option<RtcLoop>,
    /// Remote candidates that arrived before the remote description.
    pub ice_buffer: Vec<IceCandidate>,
    /// Locally gathered candidates waiting for the broker acknowledgement,
    /// in emit order.
    pub outbox: Vec<(u64, IceCandidate)>,
    pub remote_description_set: bool,
    pub timer: Option<Timer>,
    pub callbacks: PeerCallbacks,
    /// Completes the `connect_to_node` future of an initiator.
    pub done: Option<Reply<Result<(), ConnectFailedReason>>>,
    pub assembler: Assembler,
}

impl PeerRecord {
    fn new(
        remote: &str,
        role: Role,
        session_id: &str,
        callbacks: PeerCallbacks,
        reassembly_cap: usize,
    ) -> Self {
        Self {
            remote: remote.to_string(),
            role,
            session_id: session_id.to_string(),
            state: PeerState::Created,
            engine: None,
            ice_buffer: vec![],
            outbox: vec![],
            remote_description_set: false,
            timer: None,
            callbacks,
            done: None,
            assembler: Assembler::new(reassembly_cap),
        }
    }
}

impl std::fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PeerRecord({} {:?} {:?})",
            self.remote, self.role, self.state
        )
    }
}

/// An inbound CONNECTION_ATTEMPT whose accept predicate is still running on
/// the executor. Remote candidates that race ahead are buffered here.
#[derive(Debug)]
pub struct PendingAttempt {
    pub session_id: String,
    pub ice: Vec<IceCandidate>,
}

/// The peer containers: one map per role, plus the attempts awaiting their
/// accept verdict.
#[derive(Debug, Default)]
pub struct Peers {
    pub initiators: HashMap<String, PeerRecord>,
    pub responders: HashMap<String, PeerRecord>,
    pub attempts: HashMap<String, PendingAttempt>,
}

impl Peers {
    pub fn get_mut(&mut self, key: &PeerKey) -> Option<&mut PeerRecord> {
        self.map_mut(key.role).get_mut(&key.remote)
    }

    pub fn remove(&mut self, key: &PeerKey) -> Option<PeerRecord> {
        self.map_mut(key.role).remove(&key.remote)
    }

    pub fn insert(&mut self, record: PeerRecord) {
        self.map_mut(record.role).insert(record.remote.clone(), record);
    }

    /// True if any record exists for this remote, in either role.
    pub fn knows(&self, remote: &str) -> bool {
        self.initiators.contains_key(remote) || self.responders.contains_key(remote)
    }

    /// True if a record for this remote reached `Connected`, other than the
    /// one identified by `except`.
    pub fn other_connected(&self, remote: &str, except: Role) -> bool {
        let other = match except {
            Role::Initiator => &self.responders,
            Role::Responder => &self.initiators,
        };
        other
            .get(remote)
            .map(|record| record.state == PeerState::Connected)
            .unwrap_or(false)
    }

    pub fn drain_all(&mut self) -> Vec<PeerRecord> {
        self.attempts.clear();
        self.initiators
            .drain()
            .chain(self.responders.drain())
            .map(|(_, record)| record)
            .collect()
    }

    fn map_mut(&mut self, role: Role) -> &mut HashMap<String, PeerRecord> {
        match role {
            Role::Initiator => &mut self.initiators,
            Role::Responder => &mut self.responders,
        }
    }
}

impl Coordinator {
    /// `connect_to_node`: run the immediate refusal checks, then allocate
    /// the record and kick the engine.
    pub(crate) async fn connect_node(
        &mut self,
        remote: String,
        callbacks: PeerCallbacks,
        timeout: std::time::Duration,
        done: Reply<Result<(), ConnectFailedReason>>,
    ) -> Vec<NodeEvent> {
        if remote == self.identity.node_id {
            done.send(Err(ConnectFailedReason::TriedToConnectToSelf));
            return vec![];
        }
        if !self.session.is_authenticated() {
            done.send(Err(ConnectFailedReason::LocalNodeNotConnectedToBroker));
            return vec![];
        }
        if self.peers.knows(&remote) {
            done.send(Err(ConnectFailedReason::AlreadyConnectedToRemoteNode));
            return vec![];
        }

        let session_id = Uuid::new_v4().to_string();
        let key = PeerKey::new(&remote, Role::Initiator);
        match self.spawn_engine(&key).await {
            Ok(engine) => {
                let mut record = PeerRecord::new(
                    &remote,
                    Role::Initiator,
                    &session_id,
                    callbacks,
                    self.settings.reassembly_cap,
                );
                record.done = Some(done);
                record.timer = Some(self.attempt_timer(&key, &session_id, timeout));
                record.state = PeerState::AwaitingLocalDescription;
                engine.post(RtcIn::Initiate).ok();
                record.engine = Some(engine);
                self.peers.insert(record);
                vec![]
            }
            Err(e) => {
                log::warn!("Couldn't create an engine for {remote}: {e}");
                let reason = ConnectFailedReason::ConnectionNegotiationError;
                done.send(Err(reason));
                self.fire_failed(&remote, &callbacks, reason);
                vec![NodeEvent::PeerFailed {
                    remote,
                    role: Role::Initiator,
                    reason,
                }]
            }
        }
    }

    /// An inbound CONNECTION_ATTEMPT. The accept predicate runs on the
    /// executor; its verdict is posted back as an event.
    pub(crate) fn on_attempt(&mut self, env: Envelope, description: SessionSdp) -> Vec<NodeEvent> {
        if !self.for_me(&env) {
            return vec![];
        }
        if !self.shared.incoming_allowed() {
            let reply = self.reply_envelope(&env);
            self.emit_frame(Outgoing::IncomingNotAllowed { env: reply }, None, false)
                .ok();
            return vec![];
        }
        if description.kind != SdpKind::Offer {
            log::debug!("Connection attempt without an offer, dropping");
            return vec![];
        }
        if self.peers.responders.contains_key(&env.from)
            || self.peers.attempts.contains_key(&env.from)
        {
            log::debug!(
                "Dropping connection attempt from {}: negotiation already in progress",
                env.from
            );
            return vec![];
        }
        let Some(policy) = self.shared.incoming_policy() else {
            let reply = self.reply_envelope(&env);
            self.emit_frame(Outgoing::IncomingNotAllowed { env: reply }, None, false)
                .ok();
            return vec![];
        };

        self.peers.attempts.insert(
            env.from.clone(),
            PendingAttempt {
                session_id: env.session_id.clone(),
                ice: vec![],
            },
        );

        let handle = self.handle.clone();
        let accept = policy.accept.clone();
        let remote = env.from.clone();
        let lane = format!("accept:{remote}");
        self.dispatcher.run(
            &lane,
            Box::new(move || {
                let accepted = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    accept(&remote, &env.platform_from, &env.version_from)
                }))
                .unwrap_or(false);
                let _ = handle.post(NodeIn::AcceptVerdict {
                    remote,
                    session_id: env.session_id,
                    description,
                    accepted,
                });
            }),
        );
        vec![]
    }

    pub(crate) async fn accept_verdict(
        &mut self,
        remote: String,
        session_id: String,
        description: SessionSdp,
        accepted: bool,
    ) -> Vec<NodeEvent> {
        match self.peers.attempts.get(&remote) {
            Some(pending) if pending.session_id == session_id => {}
            _ => {
                log::debug!("Stale accept verdict for {remote}");
                return vec![];
            }
        }
        let pending = self.peers.attempts.remove(&remote).expect("just checked");

        if !self.session.is_authenticated() {
            log::debug!("Broker went away while deciding on {remote}");
            return vec![];
        }
        if !accepted {
            let env = self.envelope(&remote, &session_id);
            self.emit_frame(Outgoing::Refusal { env }, None, false).ok();
            return vec![];
        }
        if self.peers.responders.contains_key(&remote) {
            log::debug!("A responder record for {remote} appeared meanwhile");
            return vec![];
        }

        let callbacks = self
            .shared
            .incoming_policy()
            .map(|policy| policy.callbacks)
            .unwrap_or_default();
        let key = PeerKey::new(&remote, Role::Responder);
        match self.spawn_engine(&key).await {
            Ok(engine) => {
                let mut record = PeerRecord::new(
                    &remote,
                    Role::Responder,
                    &session_id,
                    callbacks,
                    self.settings.reassembly_cap,
                );
                record.timer = Some(self.attempt_timer(
                    &key,
                    &session_id,
                    self.settings.attempt_timeout,
                ));
                record.state = PeerState::AwaitingLocalDescription;
                record.remote_description_set = true;
                engine.post(RtcIn::ApplyOffer(description)).ok();
                for candidate in pending.ice {
                    engine.post(RtcIn::AddCandidate(candidate)).ok();
                }
                record.engine = Some(engine);
                self.peers.insert(record);
                vec![]
            }
            Err(e) => {
                log::warn!("Couldn't create an engine for {remote}: {e}");
                let env = self.envelope(&remote, &session_id);
                self.emit_frame(Outgoing::Refusal { env }, None, false).ok();
                vec![]
            }
        }
    }

    /// CONNECTION_ACCEPTANCE: the answer for one of our attempts.
    pub(crate) fn on_acceptance(&mut self, env: Envelope, description: SessionSdp) -> Vec<NodeEvent> {
        if !self.for_me(&env) {
            return vec![];
        }
        let Some(record) = self.peers.initiators.get_mut(&env.from) else {
            log::debug!("Acceptance from {} without an attempt", env.from);
            return vec![];
        };
        if record.session_id != env.session_id {
            log::debug!("Acceptance with a stale session id, dropping");
            return vec![];
        }
        if record.state != PeerState::AwaitingRemoteDescription {
            log::debug!(
                "Duplicate acceptance in state {:?}, ignoring",
                record.state
            );
            return vec![];
        }
        if description.kind != SdpKind::Answer {
            log::debug!("Acceptance without an answer, dropping");
            return vec![];
        }
        if let Some(engine) = &record.engine {
            engine.post(RtcIn::ApplyAnswer(description)).ok();
            record.remote_description_set = true;
            for candidate in record.ice_buffer.drain(..) {
                engine.post(RtcIn::AddCandidate(candidate)).ok();
            }
        }
        record.state = PeerState::IceExchange;
        vec![]
    }

    /// CONNECTION_REFUSAL or INCOMING_CONNECTIONS_NOT_ALLOWED for one of
    /// our attempts.
    pub(crate) fn peer_rejected(&mut self, env: Envelope, reason: ConnectFailedReason) -> Vec<NodeEvent> {
        if !self.for_me(&env) {
            return vec![];
        }
        let key = PeerKey::new(&env.from, Role::Initiator);
        let known = self
            .peers
            .get_mut(&key)
            .map(|record| record.session_id == env.session_id)
            .unwrap_or(false);
        if !known {
            log::debug!("Rejection for an unknown negotiation, dropping");
            return vec![];
        }
        self.fail_record(&key, reason)
    }

    /// A trickled candidate from the remote side. `role` is OUR role in the
    /// negotiation the message belongs to.
    pub(crate) fn remote_candidate(
        &mut self,
        env: Envelope,
        candidate: IceCandidate,
        role: Role,
    ) -> Vec<NodeEvent> {
        if !self.for_me(&env) {
            return vec![];
        }
        let key = PeerKey::new(&env.from, role);
        if let Some(record) = self.peers.get_mut(&key) {
            if record.session_id != env.session_id {
                log::debug!("Candidate with a stale session id, dropping");
                return vec![];
            }
            if record.remote_description_set {
                if let Some(engine) = &record.engine {
                    engine.post(RtcIn::AddCandidate(candidate)).ok();
                }
            } else {
                record.ice_buffer.push(candidate);
            }
            return vec![];
        }
        // The accept predicate may still be running.
        if role == Role::Responder {
            if let Some(pending) = self.peers.attempts.get_mut(&env.from) {
                if pending.session_id == env.session_id {
                    pending.ice.push(candidate);
                    return vec![];
                }
            }
        }
        log::debug!("Candidate for an unknown negotiation, dropping");
        vec![]
    }

    /// Events from one peer's engine.
    pub(crate) fn handle_rtc(&mut self, key: PeerKey, event: RtcOut) -> Vec<NodeEvent> {
        if self.peers.get_mut(&key).is_none() {
            log::trace!("Engine event for a gone record {key:?}, dropping");
            return vec![];
        }
        match event {
            RtcOut::LocalDescription(description) => self.local_description(&key, description),
            RtcOut::LocalCandidate(candidate) => self.local_candidate(&key, candidate),
            RtcOut::LinkEstablished => {
                let record = self.peers.get_mut(&key).expect("checked above");
                if record.state == PeerState::IceExchange {
                    record.state = PeerState::DataChannelOpening;
                }
                vec![]
            }
            RtcOut::ChannelOpen => self.channel_open(&key),
            RtcOut::ChannelMessage(text) => self.channel_message(&key, &text),
            RtcOut::Failed(error) => {
                log::debug!("Engine failure for {key:?}: {error}");
                self.peer_broken(&key)
            }
            RtcOut::Closed => self.peer_broken(&key),
        }
    }

    /// The engine produced our local description: send it out, in the
    /// message type our role requires.
    fn local_description(&mut self, key: &PeerKey, description: SessionSdp) -> Vec<NodeEvent> {
        let session_id = {
            let record = self.peers.get_mut(key).expect("caller checked");
            match (key.role, description.kind) {
                (Role::Initiator, SdpKind::Offer) => {
                    record.state = PeerState::AwaitingRemoteDescription;
                }
                (Role::Responder, SdpKind::Answer) => {
                    record.state = PeerState::IceExchange;
                }
                _ => {
                    log::debug!(
                        "Unexpected local description {:?} for {key:?}",
                        description.kind
                    );
                    return vec![];
                }
            }
            record.session_id.clone()
        };
        let env = self.envelope(&key.remote, &session_id);
        let frame = match key.role {
            Role::Initiator => Outgoing::Attempt { env, description },
            Role::Responder => Outgoing::Acceptance { env, description },
        };
        let waiter = (key.role == Role::Initiator).then(|| AckWaiter::Attempt {
            key: key.clone(),
            session_id: session_id.clone(),
        });
        if self.emit_frame(frame, waiter, false).is_err() {
            return self.fail_record(key, ConnectFailedReason::LocalNodeNotConnectedToBroker);
        }
        vec![]
    }

    /// A locally gathered candidate: trickle it to the remote side and park
    /// it in the outbox until the broker acknowledges the relay.
    fn local_candidate(&mut self, key: &PeerKey, candidate: IceCandidate) -> Vec<NodeEvent> {
        let session_id = {
            let record = self.peers.get_mut(key).expect("caller checked");
            record.session_id.clone()
        };
        let env = self.envelope(&key.remote, &session_id);
        let frame = match key.role {
            Role::Initiator => Outgoing::IceToResponder {
                env,
                candidate: candidate.clone(),
            },
            Role::Responder => Outgoing::IceToInitiator {
                env,
                candidate: candidate.clone(),
            },
        };
        let waiter = AckWaiter::Candidate {
            key: key.clone(),
            session_id,
        };
        match self.emit_frame(frame, Some(waiter), false) {
            Ok(seq) => {
                let record = self.peers.get_mut(key).expect("caller checked");
                record.outbox.push((seq, candidate));
            }
            Err(e) => log::debug!("Couldn't trickle a candidate: {e}"),
        }
        vec![]
    }

    /// The acknowledgement for one CONNECTION_ATTEMPT frame.
    pub(crate) fn attempt_ack(
        &mut self,
        key: &PeerKey,
        session_id: &str,
        status: AckStatus,
    ) -> Vec<NodeEvent> {
        let known = self
            .peers
            .get_mut(key)
            .map(|record| record.session_id == session_id)
            .unwrap_or(false);
        if !known {
            return vec![];
        }
        let reason = match status {
            AckStatus::Ok => return vec![],
            AckStatus::NotConnected => ConnectFailedReason::RemoteNodeNotConnectedToBroker,
            AckStatus::Disabled => ConnectFailedReason::ConnectionsNotAllowedOnRemoteNode,
            AckStatus::Unauthorized | AckStatus::Error => {
                ConnectFailedReason::ConnectionNegotiationError
            }
        };
        self.fail_record(key, reason)
    }

    /// The acknowledgement for one trickled candidate.
    pub(crate) fn candidate_ack(
        &mut self,
        key: &PeerKey,
        session_id: &str,
        seq: u64,
        status: AckStatus,
    ) -> Vec<NodeEvent> {
        let Some(record) = self.peers.get_mut(key) else {
            return vec![];
        };
        if record.session_id != session_id {
            return vec![];
        }
        if status != AckStatus::Ok {
            log::debug!("Candidate relay for {key:?} was not accepted: {status:?}");
        }
        record.outbox.retain(|(s, _)| *s != seq);
        vec![]
    }

    /// The data channel opened: the negotiation is done.
    fn channel_open(&mut self, key: &PeerKey) -> Vec<NodeEvent> {
        let (remote, callbacks, done) = {
            let record = self.peers.get_mut(key).expect("caller checked");
            if record.state == PeerState::Connected {
                return vec![];
            }
            record.timer = None;
            record.state = PeerState::Connected;
            (
                record.remote.clone(),
                record.callbacks.clone(),
                record.done.take(),
            )
        };
        log::info!(
            "{}: connected to {remote} as {:?}",
            self.identity.node_id,
            key.role
        );
        self.shared.add_connected_peer(&remote);
        if let Some(done) = done {
            done.send(Ok(()));
        }
        if let Some(cb) = callbacks.on_connected {
            let peer = remote.clone();
            self.dispatcher.run(&remote, Box::new(move || cb(&peer)));
        }
        vec![NodeEvent::PeerConnected {
            remote,
            role: key.role,
        }]
    }

    /// A payload chunk arrived on the data channel.
    fn channel_message(&mut self, key: &PeerKey, text: &str) -> Vec<NodeEvent> {
        let Some(chunk) = Chunk::decode(text) else {
            return vec![];
        };
        let (remote, callbacks, complete) = {
            let record = self.peers.get_mut(key).expect("caller checked");
            let complete = record.assembler.insert(chunk);
            (record.remote.clone(), record.callbacks.clone(), complete)
        };
        let Some((channel, payload)) = complete else {
            return vec![];
        };
        if let Some(cb) = callbacks.on_message {
            let from = remote.clone();
            let chan = channel.clone();
            let bytes = payload.clone();
            self.dispatcher
                .run(&remote, Box::new(move || cb(&chan, &from, &bytes)));
        }
        vec![NodeEvent::MessageReceived {
            from: remote,
            channel,
            payload,
        }]
    }

    /// The engine reported failure or closure.
    fn peer_broken(&mut self, key: &PeerKey) -> Vec<NodeEvent> {
        let connected = self
            .peers
            .get_mut(key)
            .map(|record| record.state == PeerState::Connected)
            .unwrap_or(false);
        if connected {
            self.close_record(key)
        } else {
            self.fail_record(key, ConnectFailedReason::ConnectionNegotiationError)
        }
    }

    /// The per-attempt timer fired.
    pub(crate) fn peer_timeout(&mut self, key: &PeerKey, session_id: &str) -> Vec<NodeEvent> {
        let pending = self
            .peers
            .get_mut(key)
            .map(|record| {
                record.session_id == session_id && record.state != PeerState::Connected
            })
            .unwrap_or(false);
        if !pending {
            return vec![];
        }
        log::debug!("Connection attempt to {} timed out", key.remote);
        self.fail_record(key, ConnectFailedReason::ConnectionTimeout)
    }

    /// User-requested disconnect from one node, in both roles.
    pub(crate) fn disconnect_node(&mut self, remote: &str) -> Vec<NodeEvent> {
        let mut out = vec![];
        for role in [Role::Initiator, Role::Responder] {
            let key = PeerKey::new(remote, role);
            let Some(record) = self.peers.get_mut(&key) else {
                continue;
            };
            if record.state == PeerState::Connected {
                out.extend(self.close_record(&key));
            } else {
                out.extend(
                    self.fail_record(&key, ConnectFailedReason::ConnectionAttemptClosedByUser),
                );
            }
        }
        out
    }

    /// Pushes the chunks of one logical message over whichever record is
    /// connected.
    pub(crate) fn send_chunks(&mut self, remote: &str, chunks: Vec<Chunk>) -> Vec<NodeEvent> {
        let open_engine = |record: Option<&PeerRecord>| {
            record
                .filter(|record| record.state == PeerState::Connected)
                .and_then(|record| record.engine.clone())
        };
        let engine = open_engine(self.peers.initiators.get(remote))
            .or_else(|| open_engine(self.peers.responders.get(remote)));
        match engine {
            Some(engine) => {
                for chunk in chunks {
                    engine.post(RtcIn::Send(chunk.encode())).ok();
                }
            }
            None => log::warn!("Dropping message to {remote}: not connected"),
        }
        vec![]
    }

    /// The broker went away: every record still negotiating fails now, in
    /// this event tick. Established connections are left alone.
    pub(crate) fn fail_pending_peers(&mut self, reason: ConnectFailedReason) -> Vec<NodeEvent> {
        self.peers.attempts.clear();
        let pending: Vec<PeerKey> = self
            .peers
            .initiators
            .values()
            .chain(self.peers.responders.values())
            .filter(|record| record.state != PeerState::Connected)
            .map(|record| PeerKey::new(&record.remote, record.role))
            .collect();
        let mut out = vec![];
        for key in pending {
            out.extend(self.fail_record(&key, reason));
        }
        out
    }

    /// Broker disconnect requested by the user: all records go, connected
    /// ones as disconnects, negotiating ones as user-closed failures.
    pub(crate) fn close_all_peers(&mut self) -> Vec<NodeEvent> {
        let records = self.peers.drain_all();
        let mut out = vec![];
        for mut record in records {
            record.timer = None;
            if let Some(engine) = record.engine.take() {
                engine.post(RtcIn::Close).ok();
            }
            let key = PeerKey::new(&record.remote, record.role);
            if record.state == PeerState::Connected {
                self.shared.remove_connected_peer(&record.remote);
                self.fire_disconnected(&record.remote, &record.callbacks);
                out.push(NodeEvent::PeerDisconnected {
                    remote: key.remote,
                    role: key.role,
                });
            } else {
                let reason = ConnectFailedReason::ConnectionAttemptClosedByUser;
                if let Some(done) = record.done.take() {
                    done.send(Err(reason));
                }
                self.fire_failed(&record.remote, &record.callbacks, reason);
                out.push(NodeEvent::PeerFailed {
                    remote: key.remote,
                    role: key.role,
                    reason,
                });
            }
            self.dispatcher.drop_lane(&record.remote);
        }
        out
    }

    /// Removes a negotiating record with its single terminal failure.
    pub(crate) fn fail_record(&mut self, key: &PeerKey, reason: ConnectFailedReason) -> Vec<NodeEvent> {
        let Some(mut record) = self.peers.remove(key) else {
            return vec![];
        };
        record.timer = None;
        if let Some(engine) = record.engine.take() {
            engine.post(RtcIn::Close).ok();
        }
        if let Some(done) = record.done.take() {
            done.send(Err(reason));
        }
        self.fire_failed(&record.remote, &record.callbacks, reason);
        if !self.peers.knows(&record.remote) {
            self.dispatcher.drop_lane(&record.remote);
        }
        vec![NodeEvent::PeerFailed {
            remote: record.remote,
            role: key.role,
            reason,
        }]
    }

    /// Removes a connected record; the remote stays reachable only if the
    /// opposite-role record is still connected.
    pub(crate) fn close_record(&mut self, key: &PeerKey) -> Vec<NodeEvent> {
        let Some(mut record) = self.peers.remove(key) else {
            return vec![];
        };
        record.timer = None;
        if let Some(engine) = record.engine.take() {
            engine.post(RtcIn::Close).ok();
        }
        if !self.peers.other_connected(&record.remote, key.role) {
            self.shared.remove_connected_peer(&record.remote);
        }
        self.fire_disconnected(&record.remote, &record.callbacks);
        if !self.peers.knows(&record.remote) {
            self.dispatcher.drop_lane(&record.remote);
        }
        vec![NodeEvent::PeerDisconnected {
            remote: record.remote,
            role: key.role,
        }]
    }

    pub(crate) fn fire_failed(
        &self,
        remote: &str,
        callbacks: &PeerCallbacks,
        reason: ConnectFailedReason,
    ) {
        if let Some(cb) = callbacks.on_failed.clone() {
            let peer = remote.to_string();
            self.dispatcher
                .run(remote, Box::new(move || cb(&peer, reason)));
        }
    }

    fn fire_disconnected(&self, remote: &str, callbacks: &PeerCallbacks) {
        if let Some(cb) = callbacks.on_disconnected.clone() {
            let peer = remote.to_string();
            self.dispatcher.run(remote, Box::new(move || cb(&peer)));
        }
    }

    async fn spawn_engine(&mut self, key: &PeerKey) -> anyhow::Result<RtcLoop> {
        let config = self
            .session
            .rtc_config
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no rtc configuration yet"))?;
        let engine = (self.rtc_spawner)(config).await?;
        let key = key.clone();
        let handle = self.handle.clone();
        engine.pipe(
            handle,
            Box::new(move |event| Some(NodeIn::Rtc(key.clone(), event))),
        )?;
        Ok(engine)
    }

    fn attempt_timer(
        &self,
        key: &PeerKey,
        session_id: &str,
        timeout: std::time::Duration,
    ) -> Timer {
        let handle = self.handle.clone();
        let key = key.clone();
        let session_id = session_id.to_string();
        Timer::after(timeout, move || {
            let _ = handle.post(NodeIn::PeerTimeout { key, session_id });
        })
    }
}
