//! # The public surface
//!
//! [`Node`] wraps the coordinator loop with a call-style API. Async methods
//! resolve through reply slots; the `_sync` variants post the same calls
//! and block the calling thread on an [`AwaitGuard`], the only place a
//! caller thread ever blocks. Cross-thread reads (`is_connected_to_broker`
//! and friends) go through the shared store, never through loop state.

use std::{collections::HashMap, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::oneshot;

use plarch::{
    guard::AwaitGuard,
    rtc::{rtc_spawner, RtcSpawner},
    socket::{SocketClient, SocketSpawner},
};

use crate::{
    config::{BrokerEndpoint, LocalIdentity, Settings},
    coordinator::{ApiCall, Coordinator, NodeEvent, NodeIn, NodeLoop},
    dispatch::Dispatcher,
    framing,
    peer::ConnectFailedReason,
    relay::{SendSocketError, StatusCheckError},
    session::BrokerError,
    store::{BrokerCallbacks, IncomingPolicy, PeerCallbacks, Reply, Shared},
};

/// Extra slack the sync façades wait beyond the operation's own timeout, so
/// the loop-side timer fires first and the caller sees the precise error.
const GUARD_MARGIN: Duration = Duration::from_secs(5);

/// Why a direct message could not be handed to the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("the remote id must not be empty")]
    EmptyId,
    #[error("the channel must not be empty")]
    EmptyChannel,
    #[error("no open connection to the remote node")]
    NotConnectedToRemote,
    #[error("the payload is too large for the chunk counter")]
    MessageTooLarge,
}

/// A node of the network: connects to the broker, dials other nodes, and
/// exchanges messages with them. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    identity: LocalIdentity,
    settings: Settings,
    shared: Arc<Shared>,
    handle: NodeLoop,
    runtime: tokio::runtime::Handle,
}

impl Node {
    /// Starts a node with the default transports: a WebSocket to the broker
    /// and the native WebRTC engine. Must be called from a runtime context.
    pub fn start(identity: LocalIdentity, settings: Settings) -> anyhow::Result<Self> {
        Self::start_with(identity, settings, SocketClient::spawner(), rtc_spawner())
    }

    /// Starts a node with injected transport and engine factories; tests
    /// substitute in-process fakes here.
    pub fn start_with(
        identity: LocalIdentity,
        settings: Settings,
        socket_spawner: SocketSpawner,
        rtc_spawner: RtcSpawner,
    ) -> anyhow::Result<Self> {
        let shared = Shared::new();
        let dispatcher = Dispatcher::new();
        let handle = Coordinator::start(
            identity.clone(),
            settings.clone(),
            Arc::clone(&shared),
            dispatcher,
            socket_spawner,
            rtc_spawner,
        )?;
        Ok(Self {
            identity,
            settings,
            shared,
            handle,
            runtime: tokio::runtime::Handle::current(),
        })
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    // Broker session

    pub async fn connect_to_broker(
        &self,
        endpoint: BrokerEndpoint,
        callbacks: BrokerCallbacks,
        timeout: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let rx = self.post_connect_broker(endpoint, callbacks, timeout)?;
        rx.await.unwrap_or(Err(BrokerError::UnknownError))
    }

    /// Blocking variant for callers outside the async world. Do not call
    /// from a runtime thread.
    pub fn connect_to_broker_sync(
        &self,
        endpoint: BrokerEndpoint,
        callbacks: BrokerCallbacks,
        timeout: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let wait = timeout.unwrap_or(self.settings.connect_timeout) + GUARD_MARGIN;
        let rx = self.post_connect_broker(endpoint, callbacks, timeout)?;
        self.block_on_reply(rx, wait)
            .unwrap_or(Err(BrokerError::UnknownError))
    }

    fn post_connect_broker(
        &self,
        endpoint: BrokerEndpoint,
        callbacks: BrokerCallbacks,
        timeout: Option<Duration>,
    ) -> Result<oneshot::Receiver<Result<(), BrokerError>>, BrokerError> {
        let (done, rx) = Reply::new();
        self.post(ApiCall::ConnectBroker {
            endpoint,
            callbacks,
            timeout: timeout.unwrap_or(self.settings.connect_timeout),
            done,
        })
        .map_err(|_| BrokerError::UnknownError)?;
        Ok(rx)
    }

    pub async fn disconnect_from_broker(&self) {
        let (done, rx) = Reply::new();
        if self.post(ApiCall::DisconnectBroker { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Blocking variant; see [`Node::connect_to_broker_sync`].
    pub fn disconnect_from_broker_sync(&self) {
        let (done, rx) = Reply::new();
        if self.post(ApiCall::DisconnectBroker { done }).is_ok() {
            let _ = self.block_on_reply(rx, Duration::from_secs(60));
        }
    }

    pub fn is_connected_to_broker(&self) -> bool {
        self.shared.broker_connected()
    }

    // Incoming connections

    pub fn allow_incoming_connections(&self, policy: IncomingPolicy) {
        self.post(ApiCall::AllowIncoming { policy }).ok();
    }

    pub fn disallow_incoming_connections(&self) {
        self.post(ApiCall::DisallowIncoming).ok();
    }

    // Direct connections

    pub async fn connect_to_node(
        &self,
        remote: &str,
        callbacks: PeerCallbacks,
        timeout: Option<Duration>,
    ) -> Result<Peer, ConnectFailedReason> {
        let rx = self.post_connect_node(remote, callbacks, timeout)?;
        match rx.await {
            Ok(Ok(())) => Ok(self.peer(remote)),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err(ConnectFailedReason::ConnectionNegotiationError),
        }
    }

    /// Dials several nodes concurrently; resolves once every attempt ended.
    pub async fn connect_to_many(
        &self,
        remotes: &[String],
        callbacks: PeerCallbacks,
        timeout: Option<Duration>,
    ) -> HashMap<String, Result<(), ConnectFailedReason>> {
        let receivers: Vec<_> = remotes
            .iter()
            .map(|remote| {
                (
                    remote.clone(),
                    self.post_connect_node(remote, callbacks.clone(), timeout),
                )
            })
            .collect();
        let mut results = HashMap::new();
        for (remote, rx) in receivers {
            let result = match rx {
                Ok(rx) => rx
                    .await
                    .unwrap_or(Err(ConnectFailedReason::ConnectionNegotiationError)),
                Err(reason) => Err(reason),
            };
            results.insert(remote, result);
        }
        results
    }

    /// Blocking variant of [`Node::connect_to_many`]; the calling thread
    /// waits on an [`AwaitGuard`]. Do not call from a runtime thread.
    pub fn connect_to_many_sync(
        &self,
        remotes: &[String],
        callbacks: PeerCallbacks,
        timeout: Option<Duration>,
    ) -> HashMap<String, Result<(), ConnectFailedReason>> {
        let wait = timeout.unwrap_or(self.settings.attempt_timeout) + GUARD_MARGIN;
        let node = self.clone();
        let remotes = remotes.to_vec();
        let guard = AwaitGuard::new();
        let stepper = guard.clone();
        self.runtime.spawn(async move {
            let results = node.connect_to_many(&remotes, callbacks, timeout).await;
            stepper.step_down(results);
        });
        guard.wait_timeout(wait).unwrap_or_default()
    }

    fn post_connect_node(
        &self,
        remote: &str,
        callbacks: PeerCallbacks,
        timeout: Option<Duration>,
    ) -> Result<oneshot::Receiver<Result<(), ConnectFailedReason>>, ConnectFailedReason> {
        if remote.is_empty() {
            return Err(ConnectFailedReason::ConnectionNegotiationError);
        }
        let (done, rx) = Reply::new();
        self.post(ApiCall::ConnectNode {
            remote: remote.to_string(),
            callbacks,
            timeout: timeout.unwrap_or(self.settings.attempt_timeout),
            done,
        })
        .map_err(|_| ConnectFailedReason::ConnectionNegotiationError)?;
        Ok(rx)
    }

    pub fn disconnect_from_node(&self, remote: &str) {
        self.post(ApiCall::DisconnectNode {
            remote: remote.to_string(),
        })
        .ok();
    }

    pub fn is_connected_to_node(&self, remote: &str) -> bool {
        self.shared.peer_connected(remote)
    }

    /// A handle for a connected remote node.
    pub fn peer(&self, remote: &str) -> Peer {
        Peer {
            remote: remote.to_string(),
            node: self.clone(),
        }
    }

    // Messaging

    /// Sends bytes over the open data channel to `remote`.
    pub fn send(&self, remote: &str, channel: &str, payload: &[u8]) -> Result<(), SendError> {
        if remote.is_empty() {
            return Err(SendError::EmptyId);
        }
        if channel.is_empty() {
            return Err(SendError::EmptyChannel);
        }
        if !self.shared.peer_connected(remote) {
            return Err(SendError::NotConnectedToRemote);
        }
        let chunks = framing::chunkify(channel, payload, self.settings.chunk_bytes)
            .map_err(|_| SendError::MessageTooLarge)?;
        self.post(ApiCall::SendMessage {
            remote: remote.to_string(),
            chunks,
        })
        .map_err(|_| SendError::NotConnectedToRemote)
    }

    /// Sends a short message through the broker relay; works without a
    /// direct connection.
    pub async fn send_socket_msg(
        &self,
        remote: &str,
        channel: &str,
        content: &str,
    ) -> Result<(), SendSocketError> {
        let rx = self.post_socket_msg(remote, channel, content)?;
        rx.await.unwrap_or(Err(SendSocketError::UnknownError))
    }

    /// Blocking variant; see [`Node::connect_to_broker_sync`].
    pub fn send_socket_msg_sync(
        &self,
        remote: &str,
        channel: &str,
        content: &str,
    ) -> Result<(), SendSocketError> {
        let rx = self.post_socket_msg(remote, channel, content)?;
        self.block_on_reply(rx, self.settings.ack_timeout + GUARD_MARGIN)
            .unwrap_or(Err(SendSocketError::UnknownError))
    }

    fn post_socket_msg(
        &self,
        remote: &str,
        channel: &str,
        content: &str,
    ) -> Result<oneshot::Receiver<Result<(), SendSocketError>>, SendSocketError> {
        if remote.is_empty() {
            return Err(SendSocketError::EmptyId);
        }
        if channel.is_empty() {
            return Err(SendSocketError::EmptyChannel);
        }
        if remote == self.identity.node_id {
            return Err(SendSocketError::TriedToSendMsgToSelf);
        }
        let (done, rx) = Reply::new();
        self.post(ApiCall::SendSocketMsg {
            to: remote.to_string(),
            channel: channel.to_string(),
            content: content.to_string(),
            done,
        })
        .map_err(|_| SendSocketError::UnknownError)?;
        Ok(rx)
    }

    /// Registers the handler invoked for relayed messages on `channel`.
    pub fn on_socket_msg(
        &self,
        channel: &str,
        handler: impl Fn(&str, &str) + Send + Sync + 'static,
    ) {
        self.post(ApiCall::RegisterRelay {
            channel: channel.to_string(),
            handler: Arc::new(handler),
        })
        .ok();
    }

    pub fn remove_socket_msg_handler(&self, channel: &str) {
        self.post(ApiCall::UnregisterRelay {
            channel: channel.to_string(),
        })
        .ok();
    }

    // Broker queries

    /// Asks the broker which of the given nodes are currently connected.
    pub async fn are_nodes_connected(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, bool>, StatusCheckError> {
        let (done, rx) = Reply::new();
        self.post(ApiCall::QueryConnected {
            ids: ids.to_vec(),
            done,
        })
        .map_err(|_| StatusCheckError::UnknownError)?;
        rx.await.unwrap_or(Err(StatusCheckError::UnknownError))
    }

    /// Blocking variant; see [`Node::connect_to_broker_sync`].
    pub fn are_nodes_connected_sync(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, bool>, StatusCheckError> {
        let (done, rx) = Reply::new();
        self.post(ApiCall::QueryConnected {
            ids: ids.to_vec(),
            done,
        })
        .map_err(|_| StatusCheckError::UnknownError)?;
        self.block_on_reply(rx, self.settings.ack_timeout + GUARD_MARGIN)
            .unwrap_or(Err(StatusCheckError::UnknownError))
    }

    // Observation

    /// A channel observing all [`NodeEvent`]s of this node.
    pub fn tap_events(
        &self,
    ) -> anyhow::Result<tokio::sync::mpsc::UnboundedReceiver<NodeEvent>> {
        Ok(self.handle.get_tap()?.0)
    }

    /// The raw coordinator loop, for embedding into larger event systems.
    pub fn event_loop(&self) -> &NodeLoop {
        &self.handle
    }

    fn post(&self, call: ApiCall) -> anyhow::Result<()> {
        self.handle.post(NodeIn::Call(call))
    }

    /// Bridges a oneshot onto an [`AwaitGuard`] so a plain thread can block
    /// on it. The guard is fresh per call and never reused.
    fn block_on_reply<T: Send + 'static>(
        &self,
        rx: oneshot::Receiver<T>,
        timeout: Duration,
    ) -> Option<T> {
        let guard = AwaitGuard::new();
        let stepper = guard.clone();
        self.runtime.spawn(async move {
            if let Ok(value) = rx.await {
                stepper.step_down(value);
            }
        });
        guard.wait_timeout(timeout)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({})", self.identity.node_id)
    }
}

/// A connected remote node.
#[derive(Clone)]
pub struct Peer {
    remote: String,
    node: Node,
}

impl Peer {
    pub fn id(&self) -> &str {
        &self.remote
    }

    pub fn is_connected(&self) -> bool {
        self.node.is_connected_to_node(&self.remote)
    }

    pub fn send(&self, channel: &str, payload: &[u8]) -> Result<(), SendError> {
        self.node.send(&self.remote, channel, payload)
    }

    pub fn disconnect(&self) {
        self.node.disconnect_from_node(&self.remote);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer({})", self.remote)
    }
}
