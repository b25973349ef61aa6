//! # The WebRTC engine capability
//!
//! One negotiation gets one engine, represented as an
//! [`EventLoop<RtcIn, RtcOut>`] created by an [`RtcSpawner`]. The layer
//! above drives the handshake by posting [`RtcIn`] commands and observes
//! the engine through [`RtcOut`] events; it never touches WebRTC types
//! directly. Engines are one-shot: once closed or failed they are dropped
//! together with the negotiation that owned them.

use futures::future::BoxFuture;

use crate::event_loop::EventLoop;

mod engine;
pub use engine::{rtc_spawner, RtcEngine};

pub type RtcLoop = EventLoop<RtcIn, RtcOut>;

/// Creates a fresh engine for one negotiation with the given configuration.
pub type RtcSpawner =
    Box<dyn Fn(RtcConfig) -> BoxFuture<'static, anyhow::Result<RtcLoop>> + Send + Sync>;

/// The kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpKind {
    pub fn as_wire(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Rollback => "rollback",
        }
    }

    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "offer" => Some(SdpKind::Offer),
            "answer" => Some(SdpKind::Answer),
            "pranswer" => Some(SdpKind::Pranswer),
            "rollback" => Some(SdpKind::Rollback),
            _ => None,
        }
    }
}

/// A session description travelling between the two sides of a negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSdp {
    pub kind: SdpKind,
    pub sdp: String,
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub server_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
/// Commands for one engine.
pub enum RtcIn {
    /// Create the data channel, produce an offer and apply it locally.
    Initiate,
    /// Apply the remote offer and produce an answer.
    ApplyOffer(SessionSdp),
    /// Apply the remote answer.
    ApplyAnswer(SessionSdp),
    /// Apply a remote ICE candidate. Callers buffer candidates until the
    /// remote description is in place.
    AddCandidate(IceCandidate),
    /// Send a text payload over the data channel; queued until the channel
    /// opens.
    Send(String),
    /// Retry sending the queued payloads.
    Flush,
    /// Tear the connection down.
    Close,
}

#[derive(Debug, Clone, PartialEq)]
/// Events reported by one engine.
pub enum RtcOut {
    /// The local description produced by `Initiate` or `ApplyOffer`.
    LocalDescription(SessionSdp),
    /// A locally gathered ICE candidate, ready to be trickled.
    LocalCandidate(IceCandidate),
    /// The peer connection is up, the data channel is still opening.
    LinkEstablished,
    /// The data channel is open.
    ChannelOpen,
    /// A text payload arrived on the data channel.
    ChannelMessage(String),
    /// Negotiation or transport failure; the engine is unusable.
    Failed(String),
    /// The connection is closed.
    Closed,
}

/// One ICE server entry of an [`RtcConfig`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Which ICE candidates may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPolicy {
    #[default]
    All,
    Relay,
    NoHost,
    None,
}

impl TransportPolicy {
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "all" => Some(Self::All),
            "relay" => Some(Self::Relay),
            "nohost" => Some(Self::NoHost),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// How media and data lines are bundled onto transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BundlePolicy {
    #[default]
    Balanced,
    MaxCompat,
    MaxBundle,
}

impl BundlePolicy {
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "balanced" => Some(Self::Balanced),
            "max-compat" => Some(Self::MaxCompat),
            "max-bundle" => Some(Self::MaxBundle),
            _ => None,
        }
    }
}

/// Whether RTCP multiplexing is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RtcpMuxPolicy {
    #[default]
    Require,
    Negotiate,
}

impl RtcpMuxPolicy {
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "require" => Some(Self::Require),
            "negotiate" => Some(Self::Negotiate),
            _ => None,
        }
    }
}

/// Engine configuration, pushed by the broker after authentication.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
    pub transport_policy: TransportPolicy,
    pub bundle_policy: BundlePolicy,
    pub rtcp_mux_policy: RtcpMuxPolicy,
    /// Received from the broker but informational only.
    pub candidate_pool_size: Option<i64>,
}
