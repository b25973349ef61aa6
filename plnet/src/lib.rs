//! # plnet - broker-mediated peer-to-peer connections
//!
//! plnet lets application nodes find one another through a central
//! signaling server (the *broker*) and then talk directly over WebRTC data
//! channels. A node connects to the broker once, and from then on can act
//! as initiator (dialing other nodes) and responder (accepting or refusing
//! incoming dials) at the same time, with different peers. For short
//! messages, or when no direct connection exists, the broker can relay
//! channel-addressed messages over the signaling socket.
//!
//! ## How it hangs together
//!
//! All state lives behind one [`plarch::event_loop::EventLoop`]: the broker
//! session, every per-peer negotiation, and the callback tables. Transport
//! frames, WebRTC engine callbacks and timer firings are *posted* onto that
//! loop and handled in arrival order, so the whole library behaves like a
//! single-threaded state machine. Application callbacks are dispatched on
//! the executor, never on the loop.
//!
//! ## Example
//!
//! ```no_run
//! use plnet::prelude::*;
//!
//! async fn run() -> anyhow::Result<()> {
//!     let node = Node::start(LocalIdentity::new("alice")?, Settings::default())?;
//!     node.connect_to_broker(
//!         BrokerEndpoint::new("ws://localhost:8765"),
//!         BrokerCallbacks::new(),
//!         None,
//!     )
//!     .await?;
//!
//!     let peer = node
//!         .connect_to_node("bob", PeerCallbacks::new(), None)
//!         .await?;
//!     peer.send("chat", b"hi")?;
//!     Ok(())
//! }
//! ```
//!
//! For tests and simulations, [`testing`] provides an in-process broker
//! and a loopback engine; see `tests/scenarios.rs` for complete two-node
//! setups.

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod framing;
pub mod node;
pub mod peer;
pub mod relay;
pub mod session;
pub mod store;
pub mod testing;

pub use plarch::start_logging;

/// The common imports of an embedding application.
pub mod prelude {
    pub use crate::config::{BrokerEndpoint, LocalIdentity, Settings};
    pub use crate::coordinator::NodeEvent;
    pub use crate::node::{Node, Peer, SendError};
    pub use crate::peer::ConnectFailedReason;
    pub use crate::relay::{SendSocketError, StatusCheckError};
    pub use crate::session::BrokerError;
    pub use crate::store::{BrokerCallbacks, IncomingPolicy, PeerCallbacks};
}
