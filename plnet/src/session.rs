//! # The broker session
//!
//! State machine for connecting to, authenticating with, and disconnecting
//! from the broker. The session owns the signaling transport and the
//! reconnect policy; the transport itself never reconnects. All transitions
//! run on the coordinator loop, totally ordered with every peer-record
//! transition.

use thiserror::Error;

use plarch::{rtc::RtcConfig, socket::SocketIn, tasks::Timer};

use crate::{
    config::BrokerEndpoint,
    coordinator::{AckWaiter, Coordinator, NodeEvent, NodeIn},
    peer::ConnectFailedReason,
    relay::{SendSocketError, StatusCheckError},
    store::{BrokerCallbacks, Reply},
};

/// Why connecting to the broker failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("this client is already connected to a broker")]
    LocalClientAlreadyConnected,
    #[error("unknown broker error")]
    UnknownError,
    #[error("socket error")]
    SocketError,
    #[error("a client with the same id is already connected")]
    ClientWithSameIdAlreadyConnected,
    #[error("the broker refused the authentication")]
    Unauthorized,
    #[error("the rtc configuration sent by the broker could not be parsed")]
    ErrorParsingRtcConfiguration,
    #[error("unsupported architecture")]
    UnsupportedArchitecture,
}

/// The session states. `rtc_config` is only valid in `Authenticated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticated,
    Disconnecting,
    Disconnected,
}

/// Session bookkeeping owned by the coordinator.
#[derive(Debug)]
pub struct Session {
    pub state: SessionState,
    pub endpoint: Option<BrokerEndpoint>,
    pub callbacks: BrokerCallbacks,
    pub rtc_config: Option<RtcConfig>,
    pub reconnect_attempts: u32,
    /// True while an unsolicited outage is being bridged; the reconnecting
    /// callback fires once per outage.
    pub reconnecting: bool,
    /// Bumped by every user connect/disconnect; stale reconnect timers
    /// carry the old value and are ignored.
    pub epoch: u64,
    /// Bumped for every transport instance; stale transport events carry
    /// the old value and are ignored.
    pub transport_gen: u64,
    pub auth_timeout: std::time::Duration,
    pub auth_timer: Option<Timer>,
    pub reconnect_timer: Option<Timer>,
    pub pending_connect: Option<Reply<Result<(), BrokerError>>>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            endpoint: None,
            callbacks: BrokerCallbacks::default(),
            rtc_config: None,
            reconnect_attempts: 0,
            reconnecting: false,
            epoch: 0,
            transport_gen: 0,
            auth_timeout: std::time::Duration::from_secs(30),
            auth_timer: None,
            reconnect_timer: None,
            pending_connect: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub(crate) async fn connect_broker(
        &mut self,
        endpoint: BrokerEndpoint,
        callbacks: BrokerCallbacks,
        timeout: std::time::Duration,
        done: Reply<Result<(), BrokerError>>,
    ) -> Vec<NodeEvent> {
        if !matches!(
            self.session.state,
            SessionState::Idle | SessionState::Disconnected
        ) {
            done.send(Err(BrokerError::LocalClientAlreadyConnected));
            return vec![];
        }
        self.session.epoch += 1;
        self.session.state = SessionState::Connecting;
        self.session.endpoint = Some(endpoint);
        self.session.callbacks = callbacks;
        self.session.reconnect_attempts = 0;
        self.session.reconnecting = false;
        self.session.auth_timeout = timeout;
        self.session.pending_connect = Some(done);
        self.open_transport().await
    }

    /// Creates a fresh transport for the stored endpoint and starts the
    /// authentication timer.
    pub(crate) async fn open_transport(&mut self) -> Vec<NodeEvent> {
        let endpoint = self
            .session
            .endpoint
            .clone()
            .expect("open_transport without an endpoint");
        let url = endpoint.socket_url(&self.identity);
        self.session.transport_gen += 1;
        let generation = self.session.transport_gen;
        match (self.socket_spawner)(url).await {
            Ok(socket) => {
                socket
                    .pipe(
                        self.handle.clone(),
                        Box::new(move |event| Some(NodeIn::Socket(generation, event))),
                    )
                    .err()
                    .map(|e| log::error!("Couldn't pipe the transport: {e}"));
                socket
                    .post(SocketIn::Connect)
                    .err()
                    .map(|e| log::error!("Couldn't start the transport: {e}"));
                self.socket = Some(socket);
                let handle = self.handle.clone();
                self.session.auth_timer = Some(Timer::after(self.session.auth_timeout, move || {
                    let _ = handle.post(NodeIn::AuthTimeout {
                        transport_gen: generation,
                    });
                }));
                vec![]
            }
            Err(e) => {
                log::warn!("Couldn't create the signaling transport: {e}");
                self.connect_attempt_failed(BrokerError::SocketError)
            }
        }
    }

    pub(crate) fn on_authenticated(&mut self, config: RtcConfig) -> Vec<NodeEvent> {
        if self.session.state != SessionState::Connecting {
            log::debug!(
                "Ignoring AUTHENTICATED in state {:?}",
                self.session.state
            );
            return vec![];
        }
        log::info!("{}: authenticated with the broker", self.identity.node_id);
        self.session.auth_timer = None;
        self.session.state = SessionState::Authenticated;
        self.session.reconnect_attempts = 0;
        self.session.reconnecting = false;
        self.session.rtc_config = Some(config);
        self.shared.set_broker_connected(true);
        if let Some(done) = self.session.pending_connect.take() {
            done.send(Ok(()));
        }
        vec![NodeEvent::BrokerConnected]
    }

    /// An AUTHENTICATED frame arrived but its configuration didn't check.
    pub(crate) fn bad_rtc_configuration(&mut self, error: &str) -> Vec<NodeEvent> {
        log::warn!("Broker sent an unusable rtc configuration: {error}");
        if self.session.state != SessionState::Connecting {
            return vec![];
        }
        self.connect_attempt_failed(BrokerError::ErrorParsingRtcConfiguration)
    }

    pub(crate) fn socket_closed(&mut self, reason: Option<String>) -> Vec<NodeEvent> {
        match self.session.state {
            SessionState::Connecting => {
                let error = match reason.as_deref() {
                    Some("UNAUTHORIZED") => BrokerError::Unauthorized,
                    Some("CLIENT_WITH_SAME_ID_ALREADY_CONNECTED") => {
                        BrokerError::ClientWithSameIdAlreadyConnected
                    }
                    _ => BrokerError::SocketError,
                };
                self.connect_attempt_failed(error)
            }
            SessionState::Authenticated => self.broker_lost(),
            SessionState::Disconnecting
            | SessionState::Disconnected
            | SessionState::Idle => vec![],
        }
    }

    /// One connect attempt is over. With a caller waiting this ends the
    /// session; during an outage it feeds the backoff loop instead.
    pub(crate) fn connect_attempt_failed(&mut self, error: BrokerError) -> Vec<NodeEvent> {
        self.session.auth_timer = None;
        self.drop_transport();
        if let Some(done) = self.session.pending_connect.take() {
            self.session.state = SessionState::Disconnected;
            done.send(Err(error));
            return vec![];
        }
        self.schedule_reconnect()
    }

    /// The transport died while authenticated. Every peer still in its
    /// handshake fails in this same tick; established connections survive
    /// on their own.
    fn broker_lost(&mut self) -> Vec<NodeEvent> {
        log::warn!("{}: lost the broker connection", self.identity.node_id);
        self.shared.set_broker_connected(false);
        self.session.rtc_config = None;
        self.drop_transport();
        let mut out = self.drain_pending_acks();
        out.extend(self.fail_pending_peers(ConnectFailedReason::LocalNodeNotConnectedToBroker));
        if !self.session.reconnecting {
            self.session.reconnecting = true;
            if let Some(cb) = self.session.callbacks.on_reconnecting.clone() {
                self.dispatcher.run("broker", Box::new(move || cb()));
            }
            out.push(NodeEvent::BrokerReconnecting);
        }
        out.extend(self.schedule_reconnect());
        out
    }

    fn schedule_reconnect(&mut self) -> Vec<NodeEvent> {
        let policy = self.settings.reconnect.clone();
        if !policy.enabled || self.session.reconnect_attempts >= policy.max_attempts {
            return self.session_over();
        }
        self.session.state = SessionState::Connecting;
        self.session.reconnect_attempts += 1;
        let delay = policy.delay(self.session.reconnect_attempts);
        log::debug!(
            "Reconnect attempt {} in {delay:?}",
            self.session.reconnect_attempts
        );
        let epoch = self.session.epoch;
        let handle = self.handle.clone();
        self.session.reconnect_timer = Some(Timer::after(delay, move || {
            let _ = handle.post(NodeIn::ReconnectNow { epoch });
        }));
        vec![]
    }

    pub(crate) async fn reconnect_now(&mut self, epoch: u64) -> Vec<NodeEvent> {
        if epoch != self.session.epoch || self.session.state != SessionState::Connecting {
            return vec![];
        }
        self.session.reconnect_timer = None;
        self.open_transport().await
    }

    pub(crate) fn auth_timeout(&mut self, transport_gen: u64) -> Vec<NodeEvent> {
        if transport_gen != self.session.transport_gen
            || self.session.state != SessionState::Connecting
        {
            return vec![];
        }
        log::debug!("Authentication with the broker timed out");
        self.connect_attempt_failed(BrokerError::UnknownError)
    }

    /// User-requested disconnect: close every peer record in this tick,
    /// then drop the transport.
    pub(crate) fn disconnect_broker(&mut self, done: Reply<()>) -> Vec<NodeEvent> {
        if matches!(
            self.session.state,
            SessionState::Idle | SessionState::Disconnected
        ) {
            done.send(());
            return vec![];
        }
        self.session.epoch += 1;
        self.session.auth_timer = None;
        self.session.reconnect_timer = None;
        self.session.reconnecting = false;
        self.session.state = SessionState::Disconnecting;

        let mut out = self.close_all_peers();
        out.extend(self.drain_pending_acks());

        self.shared.set_broker_connected(false);
        self.session.rtc_config = None;
        self.drop_transport();
        self.session.state = SessionState::Disconnected;
        if let Some(pending) = self.session.pending_connect.take() {
            pending.send(Err(BrokerError::UnknownError));
        }
        done.send(());
        out
    }

    /// The reconnect attempts are exhausted (or reconnection is disabled).
    fn session_over(&mut self) -> Vec<NodeEvent> {
        self.session.state = SessionState::Disconnected;
        self.session.reconnecting = false;
        self.session.rtc_config = None;
        if let Some(cb) = self.session.callbacks.on_disconnected.clone() {
            self.dispatcher.run("broker", Box::new(move || cb()));
        }
        vec![NodeEvent::BrokerDisconnected]
    }

    fn drop_transport(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.post(SocketIn::Disconnect).ok();
        }
        self.session.transport_gen += 1;
    }

    /// Nothing emitted on a dead transport will ever be acknowledged.
    fn drain_pending_acks(&mut self) -> Vec<NodeEvent> {
        for (_, waiter) in self.pending_acks.drain() {
            match waiter {
                AckWaiter::Relay(done) => {
                    done.send(Err(SendSocketError::NotConnectedToBroker))
                }
                AckWaiter::Query(done) => {
                    done.send(Err(StatusCheckError::NotConnectedToBroker))
                }
                AckWaiter::Attempt { .. } | AckWaiter::Candidate { .. } => {}
            }
        }
        self.ack_timers.clear();
        vec![]
    }
}
