//! Process-wide shared state and the callback tables. Everything in here is
//! written from inside event handlers only; other threads read flags through
//! atomics, callback maps through a mutex, and the connected-peer set
//! through a watch channel.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::{oneshot, watch};

use crate::peer::ConnectFailedReason;

/// Callback with the remote node id.
pub type PeerIdCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Callback with the remote node id and the failure reason.
pub type PeerFailedCallback = Arc<dyn Fn(&str, ConnectFailedReason) + Send + Sync>;
/// Callback with `(channel, from, payload)` for a delivered message.
pub type PeerMessageCallback = Arc<dyn Fn(&str, &str, &[u8]) + Send + Sync>;
/// Callback with `(from, content)` for a relayed socket message.
pub type RelayHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Predicate over `(remote, platform, version)` deciding whether an
/// incoming connection is accepted.
pub type AcceptPredicate = Arc<dyn Fn(&str, &str, &str) -> bool + Send + Sync>;
/// Broker lifecycle callback.
pub type BrokerStateCallback = Arc<dyn Fn() + Send + Sync>;

/// Per-peer application callbacks, dispatched on the executor and never on
/// the event loop.
#[derive(Clone, Default)]
pub struct PeerCallbacks {
    pub on_connected: Option<PeerIdCallback>,
    pub on_failed: Option<PeerFailedCallback>,
    pub on_disconnected: Option<PeerIdCallback>,
    pub on_message: Option<PeerMessageCallback>,
}

impl PeerCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    pub fn on_failed(
        mut self,
        f: impl Fn(&str, ConnectFailedReason) + Send + Sync + 'static,
    ) -> Self {
        self.on_failed = Some(Arc::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Arc::new(f));
        self
    }

    pub fn on_message(
        mut self,
        f: impl Fn(&str, &str, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for PeerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerCallbacks")
    }
}

/// Policy for incoming connections: the accept predicate plus the callbacks
/// installed on every accepted peer.
#[derive(Clone)]
pub struct IncomingPolicy {
    pub accept: AcceptPredicate,
    pub callbacks: PeerCallbacks,
}

impl IncomingPolicy {
    pub fn new(
        accept: impl Fn(&str, &str, &str) -> bool + Send + Sync + 'static,
        callbacks: PeerCallbacks,
    ) -> Self {
        Self {
            accept: Arc::new(accept),
            callbacks,
        }
    }

    /// Accepts every incoming connection.
    pub fn accept_all(callbacks: PeerCallbacks) -> Self {
        Self::new(|_, _, _| true, callbacks)
    }
}

impl fmt::Debug for IncomingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IncomingPolicy")
    }
}

/// Broker lifecycle callbacks.
#[derive(Clone, Default)]
pub struct BrokerCallbacks {
    pub on_reconnecting: Option<BrokerStateCallback>,
    pub on_disconnected: Option<BrokerStateCallback>,
}

impl BrokerCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_reconnecting(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_reconnecting = Some(Arc::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for BrokerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BrokerCallbacks")
    }
}

/// A clonable slot around a oneshot sender, so completion handles can travel
/// inside `Clone` event types. The first `send` wins.
pub struct Reply<T>(Arc<Mutex<Option<oneshot::Sender<T>>>>);

impl<T: Send + 'static> Reply<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    /// Completes the reply; later calls and replies nobody waits for are
    /// silently dropped.
    pub fn send(&self, value: T) {
        if let Some(tx) = self.0.lock().expect("reply lock poisoned").take() {
            let _ = tx.send(value);
        }
    }
}

impl<T> Clone for Reply<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reply")
    }
}

/// The cross-thread face of the store.
pub struct Shared {
    broker_connected: AtomicBool,
    incoming_allowed: AtomicBool,
    incoming_policy: Mutex<Option<IncomingPolicy>>,
    relay_handlers: Mutex<HashMap<String, RelayHandler>>,
    connected_tx: watch::Sender<HashSet<String>>,
    connected_rx: watch::Receiver<HashSet<String>>,
}

impl Shared {
    pub fn new() -> Arc<Self> {
        let (connected_tx, connected_rx) = watch::channel(HashSet::new());
        Arc::new(Self {
            broker_connected: AtomicBool::new(false),
            incoming_allowed: AtomicBool::new(false),
            incoming_policy: Mutex::new(None),
            relay_handlers: Mutex::new(HashMap::new()),
            connected_tx,
            connected_rx,
        })
    }

    pub fn broker_connected(&self) -> bool {
        self.broker_connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_broker_connected(&self, connected: bool) {
        self.broker_connected.store(connected, Ordering::Release);
    }

    pub fn incoming_allowed(&self) -> bool {
        self.incoming_allowed.load(Ordering::Acquire)
    }

    pub(crate) fn set_incoming_policy(&self, policy: Option<IncomingPolicy>) {
        self.incoming_allowed
            .store(policy.is_some(), Ordering::Release);
        *self.incoming_policy.lock().expect("policy lock poisoned") = policy;
    }

    pub fn incoming_policy(&self) -> Option<IncomingPolicy> {
        self.incoming_policy
            .lock()
            .expect("policy lock poisoned")
            .clone()
    }

    pub(crate) fn set_relay_handler(&self, channel: &str, handler: Option<RelayHandler>) {
        let mut handlers = self.relay_handlers.lock().expect("relay lock poisoned");
        match handler {
            Some(handler) => {
                handlers.insert(channel.to_string(), handler);
            }
            None => {
                handlers.remove(channel);
            }
        }
    }

    pub fn relay_handler(&self, channel: &str) -> Option<RelayHandler> {
        self.relay_handlers
            .lock()
            .expect("relay lock poisoned")
            .get(channel)
            .cloned()
    }

    pub fn peer_connected(&self, remote: &str) -> bool {
        self.connected_rx.borrow().contains(remote)
    }

    /// A watch receiver over the set of connected peers, for callers that
    /// want to await changes.
    pub fn connected_peers(&self) -> watch::Receiver<HashSet<String>> {
        self.connected_rx.clone()
    }

    pub(crate) fn add_connected_peer(&self, remote: &str) {
        self.connected_tx.send_modify(|set| {
            set.insert(remote.to_string());
        });
    }

    pub(crate) fn remove_connected_peer(&self, remote: &str) {
        self.connected_tx.send_modify(|set| {
            set.remove(remote);
        });
    }
}
