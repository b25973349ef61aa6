//! # In-process simulation harness
//!
//! Everything needed to run whole-node scenarios without a network or a
//! real WebRTC stack: [`BrokerHub`], an event-loop broker that speaks the
//! full wire protocol, and [`LoopbackNet`], whose engines pair up in
//! memory and deliver data-channel payloads directly. Both plug into
//! [`crate::node::Node::start_with`] through the regular spawner types.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use plarch::{
    event_loop::{EventHandler, EventLoop},
    rtc::{IceCandidate, RtcIn, RtcLoop, RtcOut, RtcSpawner, SdpKind, SessionSdp},
    socket::{SocketIn, SocketLoop, SocketOut, SocketSpawner},
    tasks::wait_ms,
};

use crate::{
    config::{percent_decode, LocalIdentity, ReconnectPolicy, Settings},
    node::Node,
};

/// Settings with short timers, for tests.
pub fn test_settings() -> Settings {
    Settings {
        connect_timeout: std::time::Duration::from_secs(5),
        attempt_timeout: std::time::Duration::from_secs(5),
        ack_timeout: std::time::Duration::from_secs(2),
        reconnect: ReconnectPolicy {
            enabled: false,
            ..ReconnectPolicy::default()
        },
        ..Settings::default()
    }
}

/// The configuration the hub pushes in its AUTHENTICATED message.
pub fn test_rtc_configuration() -> Value {
    json!({
        "iceServers": [{"urls": ["stun:stun.example.org:3478"]}],
        "iceTransportPolicy": "all",
        "bundlePolicy": "balanced",
        "rtcpMuxPolicy": "require",
        "iceCandidatePoolSize": 0,
    })
}

/// Starts a node wired to the given hub and loopback net.
pub fn test_node(hub: &HubLoop, net: &LoopbackNet, name: &str) -> anyhow::Result<Node> {
    test_node_with(hub, net, name, test_settings())
}

/// Same as [`test_node`] with custom settings.
pub fn test_node_with(
    hub: &HubLoop,
    net: &LoopbackNet,
    name: &str,
    settings: Settings,
) -> anyhow::Result<Node> {
    Node::start_with(
        LocalIdentity::new(name)?,
        settings,
        hub_socket_spawner(hub.clone()),
        net.spawner(),
    )
}

/// Polls `cond` every 20ms until it holds or `ms` elapsed.
pub async fn wait_for(mut cond: impl FnMut() -> bool, ms: u64) -> bool {
    for _ in 0..ms.div_ceil(20) {
        if cond() {
            return true;
        }
        wait_ms(20).await;
    }
    cond()
}

pub type HubLoop = EventLoop<HubIn, HubOut>;

#[derive(Debug, Clone)]
pub enum HubIn {
    /// A node's transport registered with the hub.
    Register {
        node: String,
        auth: Option<String>,
        link: SocketLoop,
    },
    /// A frame emitted by a node.
    FromNode { node: String, text: String },
    /// A node's transport disconnected on its own.
    Unregister { node: String },
    /// Test hook: kill a node's connection from the broker side.
    Drop {
        node: String,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubOut {
    Registered(String),
    Dropped(String),
}

/// An in-process broker. Authenticates registering nodes (rejecting those
/// whose auth data is `"deny"` and duplicate ids), relays negotiation and
/// socket-exchange frames by their `to` field, and acknowledges every
/// emitted frame.
pub struct BrokerHub {
    nodes: HashMap<String, SocketLoop>,
    rtc_configuration: Value,
}

impl BrokerHub {
    pub fn start() -> anyhow::Result<HubLoop> {
        Self::start_with(test_rtc_configuration())
    }

    pub fn start_with(rtc_configuration: Value) -> anyhow::Result<HubLoop> {
        let hub: HubLoop = EventLoop::new();
        hub.add_handler(Box::new(Self {
            nodes: HashMap::new(),
            rtc_configuration,
        }))?;
        Ok(hub)
    }

    fn register(&mut self, node: String, auth: Option<String>, link: SocketLoop) -> Vec<HubOut> {
        if auth.as_deref() == Some("deny") {
            link.post_out(SocketOut::Closed(Some("UNAUTHORIZED".into())))
                .ok();
            return vec![];
        }
        if self.nodes.contains_key(&node) {
            link.post_out(SocketOut::Closed(Some(
                "CLIENT_WITH_SAME_ID_ALREADY_CONNECTED".into(),
            )))
            .ok();
            return vec![];
        }
        link.post_out(SocketOut::Connected).ok();
        let authenticated = json!({
            "type": "AUTHENTICATED",
            "rtcConfiguration": self.rtc_configuration,
        });
        link.post_out(SocketOut::Message(authenticated.to_string()))
            .ok();
        self.nodes.insert(node.clone(), link);
        vec![HubOut::Registered(node)]
    }

    fn from_node(&mut self, node: String, text: String) -> Vec<HubOut> {
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            log::warn!("Hub received invalid json from {node}");
            return vec![];
        };
        let Some(seq) = frame.get("seq").and_then(Value::as_u64) else {
            log::warn!("Hub received a frame without seq from {node}");
            return vec![];
        };
        let kind = frame.get("type").and_then(Value::as_str).unwrap_or("");

        let (status, data) = match kind {
            "ARE_NODES_CONNECTED_TO_BROKER" => {
                let ids: Vec<String> = frame
                    .get("ids")
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let statuses: Vec<Value> = ids
                    .iter()
                    .map(|id| json!({"id": id, "connected": self.nodes.contains_key(id)}))
                    .collect();
                ("OK", Some(Value::Array(statuses)))
            }
            _ => {
                // Everything else is relayed to its target verbatim.
                let target = frame.get("to").and_then(Value::as_str).unwrap_or("");
                match self.nodes.get(target) {
                    Some(link) => {
                        link.post_out(SocketOut::Message(text.clone())).ok();
                        ("OK", None)
                    }
                    None => ("NOT_CONNECTED", None),
                }
            }
        };

        if let Some(link) = self.nodes.get(&node) {
            let mut ack = json!({"type": "ACK", "seq": seq, "status": status});
            if let Some(data) = data {
                ack["data"] = data;
            }
            link.post_out(SocketOut::Message(ack.to_string())).ok();
        }
        vec![]
    }

    fn drop_node(&mut self, node: String, reason: Option<String>) -> Vec<HubOut> {
        if let Some(link) = self.nodes.remove(&node) {
            link.post_out(SocketOut::Closed(reason)).ok();
            return vec![HubOut::Dropped(node)];
        }
        vec![]
    }
}

#[async_trait]
impl EventHandler<HubIn, HubOut> for BrokerHub {
    async fn events(&mut self, inputs: Vec<HubIn>) -> Vec<HubOut> {
        let mut out = vec![];
        for msg in inputs {
            out.extend(match msg {
                HubIn::Register { node, auth, link } => self.register(node, auth, link),
                HubIn::FromNode { node, text } => self.from_node(node, text),
                HubIn::Unregister { node } => {
                    self.nodes.remove(&node);
                    vec![]
                }
                HubIn::Drop { node, reason } => self.drop_node(node, reason),
            });
        }
        out
    }
}

/// A hub link that swallows every frame; register it to simulate a node
/// that is online at the broker but never answers.
pub fn ghost_link() -> anyhow::Result<SocketLoop> {
    struct Swallow {}
    #[async_trait]
    impl EventHandler<SocketIn, SocketOut> for Swallow {
        async fn events(&mut self, _: Vec<SocketIn>) -> Vec<SocketOut> {
            vec![]
        }
    }
    let event_loop: SocketLoop = EventLoop::new();
    event_loop.add_handler(Box::new(Swallow {}))?;
    Ok(event_loop)
}

/// A [`SocketSpawner`] whose transports talk to a [`BrokerHub`] instead of
/// a network.
pub fn hub_socket_spawner(hub: HubLoop) -> SocketSpawner {
    Box::new(move |url| {
        let hub = hub.clone();
        Box::pin(async move {
            let query = query_params(&url);
            let node = query.get("id").cloned().unwrap_or_default();
            let auth = query.get("data").cloned();
            let event_loop: SocketLoop = EventLoop::new();
            event_loop.add_handler(Box::new(HubSocket {
                hub,
                node,
                auth,
                event_loop: event_loop.clone(),
            }))?;
            Ok(event_loop)
        })
    })
}

fn query_params(url: &str) -> HashMap<String, String> {
    url.split_once('?')
        .map(|(_, query)| query)
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), percent_decode(value)))
        .collect()
}

struct HubSocket {
    hub: HubLoop,
    node: String,
    auth: Option<String>,
    event_loop: SocketLoop,
}

#[async_trait]
impl EventHandler<SocketIn, SocketOut> for HubSocket {
    async fn events(&mut self, inputs: Vec<SocketIn>) -> Vec<SocketOut> {
        let mut out = vec![];
        for msg in inputs {
            match msg {
                SocketIn::Connect => {
                    self.hub
                        .post(HubIn::Register {
                            node: self.node.clone(),
                            auth: self.auth.clone(),
                            link: self.event_loop.clone(),
                        })
                        .ok();
                }
                SocketIn::Send(text) => {
                    self.hub
                        .post(HubIn::FromNode {
                            node: self.node.clone(),
                            text,
                        })
                        .ok();
                }
                SocketIn::Disconnect => {
                    self.hub
                        .post(HubIn::Unregister {
                            node: self.node.clone(),
                        })
                        .ok();
                    out.push(SocketOut::Closed(None));
                }
            }
        }
        out
    }
}

/// Pairs loopback engines by the token embedded in their fake SDP. One
/// instance is shared by all nodes of a test.
#[derive(Clone, Default)]
pub struct LoopbackNet {
    offers: Arc<Mutex<HashMap<String, RtcLoop>>>,
    answers: Arc<Mutex<HashMap<String, RtcLoop>>>,
    fail_next: Arc<AtomicBool>,
}

impl LoopbackNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next initiated negotiation fail, as a negotiation error.
    pub fn fail_next_negotiation(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }

    pub fn spawner(&self) -> RtcSpawner {
        let net = self.clone();
        Box::new(move |_config| {
            let net = net.clone();
            Box::pin(async move {
                let event_loop: RtcLoop = EventLoop::new();
                event_loop.add_handler(Box::new(LoopbackEngine {
                    net,
                    event_loop: event_loop.clone(),
                    peer: None,
                    queue: vec![],
                    open: false,
                }))?;
                Ok(event_loop)
            })
        })
    }
}

fn sdp_token(sdp: &str) -> Option<&str> {
    sdp.split_once("loopback=").map(|(_, token)| token)
}

struct LoopbackEngine {
    net: LoopbackNet,
    event_loop: RtcLoop,
    peer: Option<RtcLoop>,
    queue: Vec<String>,
    open: bool,
}

impl LoopbackEngine {
    fn flush(&mut self) {
        if !self.open {
            return;
        }
        if let Some(peer) = &self.peer {
            for payload in self.queue.drain(..) {
                peer.post_out(RtcOut::ChannelMessage(payload)).ok();
            }
        }
    }

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:0 1 udp 1 127.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            server_url: None,
        }
    }
}

#[async_trait]
impl EventHandler<RtcIn, RtcOut> for LoopbackEngine {
    async fn events(&mut self, inputs: Vec<RtcIn>) -> Vec<RtcOut> {
        let mut out = vec![];
        for msg in inputs {
            match msg {
                RtcIn::Initiate => {
                    if self.net.fail_next.swap(false, Ordering::Relaxed) {
                        out.push(RtcOut::Failed("injected negotiation failure".into()));
                        continue;
                    }
                    let token = Uuid::new_v4().to_string();
                    self.net
                        .offers
                        .lock()
                        .unwrap()
                        .insert(token.clone(), self.event_loop.clone());
                    out.push(RtcOut::LocalDescription(SessionSdp {
                        kind: SdpKind::Offer,
                        sdp: format!("v=0 loopback={token}"),
                    }));
                    out.push(RtcOut::LocalCandidate(Self::candidate()));
                }
                RtcIn::ApplyOffer(offer) => {
                    let Some(token) = sdp_token(&offer.sdp).map(str::to_string) else {
                        out.push(RtcOut::Failed("offer without a loopback token".into()));
                        continue;
                    };
                    let Some(initiator) = self.net.offers.lock().unwrap().remove(&token) else {
                        out.push(RtcOut::Failed("unknown loopback token".into()));
                        continue;
                    };
                    self.net
                        .answers
                        .lock()
                        .unwrap()
                        .insert(token.clone(), self.event_loop.clone());
                    self.peer = Some(initiator);
                    self.open = true;
                    out.push(RtcOut::LocalDescription(SessionSdp {
                        kind: SdpKind::Answer,
                        sdp: format!("v=0 loopback={token}"),
                    }));
                    out.push(RtcOut::LocalCandidate(Self::candidate()));
                    out.push(RtcOut::LinkEstablished);
                    out.push(RtcOut::ChannelOpen);
                    self.flush();
                }
                RtcIn::ApplyAnswer(answer) => {
                    let Some(token) = sdp_token(&answer.sdp).map(str::to_string) else {
                        out.push(RtcOut::Failed("answer without a loopback token".into()));
                        continue;
                    };
                    let Some(responder) = self.net.answers.lock().unwrap().remove(&token) else {
                        out.push(RtcOut::Failed("unknown loopback token".into()));
                        continue;
                    };
                    self.peer = Some(responder);
                    self.open = true;
                    out.push(RtcOut::LinkEstablished);
                    out.push(RtcOut::ChannelOpen);
                    self.flush();
                }
                RtcIn::AddCandidate(candidate) => {
                    log::trace!("Loopback ignoring candidate {candidate:?}");
                }
                RtcIn::Send(payload) => {
                    self.queue.push(payload);
                    self.flush();
                }
                RtcIn::Flush => self.flush(),
                RtcIn::Close => {
                    if let Some(peer) = self.peer.take() {
                        peer.post_out(RtcOut::Closed).ok();
                    }
                    self.open = false;
                    out.push(RtcOut::Closed);
                }
            }
        }
        out
    }
}
