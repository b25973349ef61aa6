//! The native engine: a wrapper around the `webrtc` crate that turns its
//! callback world into [`RtcOut`] events posted on the engine's loop. The
//! callbacks registered here are trampolines: they post and return,
//! nothing else.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures::lock::Mutex;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        setting_engine::SettingEngine, APIBuilder,
    },
    data_channel::{
        data_channel_init::RTCDataChannelInit, data_channel_message::DataChannelMessage,
        RTCDataChannel,
    },
    ice::mdns::MulticastDnsMode,
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        policy::{
            bundle_policy::RTCBundlePolicy, ice_transport_policy::RTCIceTransportPolicy,
            rtcp_mux_policy::RTCRtcpMuxPolicy,
        },
        sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
};

use super::{IceCandidate, IceServer, RtcConfig, RtcIn, RtcLoop, RtcOut, SdpKind, SessionSdp};
use crate::event_loop::{EventHandler, EventLoop};

/// An [`super::RtcSpawner`] producing native engines.
pub fn rtc_spawner() -> super::RtcSpawner {
    Box::new(|config| Box::pin(RtcEngine::start(config)))
}

fn ice_server(entry: IceServer) -> RTCIceServer {
    let mut server = RTCIceServer {
        urls: entry.urls,
        ..Default::default()
    };
    if let Some(username) = entry.username {
        server.username = username;
    }
    if let Some(credential) = entry.credential {
        server.credential = credential;
    }
    server
}

fn transport_policy(policy: super::TransportPolicy) -> RTCIceTransportPolicy {
    match policy {
        super::TransportPolicy::All => RTCIceTransportPolicy::All,
        super::TransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        // Not expressible with this engine; fall back to everything.
        super::TransportPolicy::NoHost | super::TransportPolicy::None => {
            log::warn!("Unsupported ICE transport policy {policy:?}, using 'all'");
            RTCIceTransportPolicy::All
        }
    }
}

fn bundle_policy(policy: super::BundlePolicy) -> RTCBundlePolicy {
    match policy {
        super::BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
        super::BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
        super::BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
    }
}

fn rtcp_mux_policy(policy: super::RtcpMuxPolicy) -> RTCRtcpMuxPolicy {
    match policy {
        super::RtcpMuxPolicy::Require => RTCRtcpMuxPolicy::Require,
        super::RtcpMuxPolicy::Negotiate => RTCRtcpMuxPolicy::Negotiate,
    }
}

/// One peer connection plus its data channel, driven entirely through the
/// engine loop.
pub struct RtcEngine {
    connection: RTCPeerConnection,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    event_loop: RtcLoop,
    // Payloads queued while the channel is still opening.
    queue: Vec<String>,
    // Set on Close; silences all remaining engine callbacks.
    gone: Arc<AtomicBool>,
}

impl RtcEngine {
    pub async fn start(config: RtcConfig) -> anyhow::Result<RtcLoop> {
        let event_loop: RtcLoop = EventLoop::new();
        let mut engine = RtcEngine {
            connection: Self::make_connection(config).await?,
            channel: Arc::new(Mutex::new(None)),
            event_loop: event_loop.clone(),
            queue: vec![],
            gone: Arc::new(AtomicBool::new(false)),
        };
        engine.register_connection_callbacks();
        event_loop.add_handler(Box::new(engine))?;
        Ok(event_loop)
    }

    async fn make_connection(config: RtcConfig) -> anyhow::Result<RTCPeerConnection> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media)?;

        // mdns can flood the local network with requests, so turn it off.
        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.into_iter().map(ice_server).collect(),
            ice_transport_policy: transport_policy(config.transport_policy),
            bundle_policy: bundle_policy(config.bundle_policy),
            rtcp_mux_policy: rtcp_mux_policy(config.rtcp_mux_policy),
            ..Default::default()
        };

        Ok(api.new_peer_connection(rtc_config).await?)
    }

    fn register_connection_callbacks(&mut self) {
        let event_loop = self.event_loop.clone();
        let gone = Arc::clone(&self.gone);
        self.connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if gone.load(Ordering::Relaxed) {
                    return Box::pin(async {});
                }
                let event_loop = event_loop.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            event_loop
                                .post_out(RtcOut::LocalCandidate(IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                    server_url: None,
                                }))
                                .err()
                                .map(|e| log::warn!("Candidate queued but not processed: {e:?}"));
                        }
                        Err(e) => log::warn!("Couldn't serialize ICE candidate: {e:?}"),
                    }
                })
            }));

        let event_loop = self.event_loop.clone();
        let gone = Arc::clone(&self.gone);
        self.connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                log::trace!("Peer connection state has changed: {state}");
                if gone.load(Ordering::Relaxed) {
                    return Box::pin(async {});
                }
                let event_loop = event_loop.clone();
                Box::pin(async move {
                    let report = match state {
                        RTCPeerConnectionState::Connected => Some(RtcOut::LinkEstablished),
                        RTCPeerConnectionState::Failed => {
                            Some(RtcOut::Failed("peer connection failed".into()))
                        }
                        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                            Some(RtcOut::Closed)
                        }
                        _ => None,
                    };
                    if let Some(report) = report {
                        event_loop
                            .post_out(report)
                            .err()
                            .map(|e| log::warn!("State queued but not processed: {e:?}"));
                    }
                })
            },
        ));
    }

    async fn register_data_channel(
        channel_slot: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
        channel: Arc<RTCDataChannel>,
        event_loop: RtcLoop,
        gone: Arc<AtomicBool>,
    ) {
        let open_loop = event_loop.clone();
        let open_gone = Arc::clone(&gone);
        channel.on_open(Box::new(move || {
            if open_gone.load(Ordering::Relaxed) {
                return Box::pin(async {});
            }
            log::trace!("Data channel is open");
            Box::pin(async move {
                open_loop
                    .post_out(RtcOut::ChannelOpen)
                    .err()
                    .map(|e| log::warn!("Open queued but not processed: {e:?}"));
                open_loop
                    .post(RtcIn::Flush)
                    .err()
                    .map(|e| log::warn!("Flush queued but not processed: {e:?}"));
            })
        }));
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            if gone.load(Ordering::Relaxed) {
                return Box::pin(async {});
            }
            let text = match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("Dropping non-utf8 payload: {e:?}");
                    return Box::pin(async {});
                }
            };
            let event_loop = event_loop.clone();
            Box::pin(async move {
                event_loop
                    .post_out(RtcOut::ChannelMessage(text))
                    .err()
                    .map(|e| log::warn!("Payload queued but not processed: {e:?}"));
            })
        }));
        channel_slot.lock().await.replace(channel);
    }

    /// Create the data channel and the offer. The channel is ordered with
    /// unlimited retransmits so application payloads are reliable.
    async fn initiate(&mut self) -> anyhow::Result<SessionSdp> {
        let channel = self
            .connection
            .create_data_channel(
                "data",
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        Self::register_data_channel(
            Arc::clone(&self.channel),
            channel,
            self.event_loop.clone(),
            Arc::clone(&self.gone),
        )
        .await;

        let offer = self.connection.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.connection.set_local_description(offer).await?;
        Ok(SessionSdp {
            kind: SdpKind::Offer,
            sdp,
        })
    }

    /// Apply the remote offer, wait for the in-band data channel and
    /// produce the answer.
    async fn apply_offer(&mut self, remote: SessionSdp) -> anyhow::Result<SessionSdp> {
        let channel_slot = Arc::clone(&self.channel);
        let event_loop = self.event_loop.clone();
        let gone = Arc::clone(&self.gone);
        self.connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                if gone.load(Ordering::Relaxed) {
                    return Box::pin(async {});
                }
                log::trace!("New data channel {} {}", channel.label(), channel.id());
                let channel_slot = Arc::clone(&channel_slot);
                let event_loop = event_loop.clone();
                let gone = Arc::clone(&gone);
                Box::pin(async move {
                    Self::register_data_channel(channel_slot, channel, event_loop, gone).await;
                })
            }));

        self.connection
            .set_remote_description(RTCSessionDescription::offer(remote.sdp)?)
            .await?;
        let answer = self.connection.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.connection.set_local_description(answer).await?;
        Ok(SessionSdp {
            kind: SdpKind::Answer,
            sdp,
        })
    }

    async fn apply_answer(&mut self, remote: SessionSdp) -> anyhow::Result<()> {
        self.connection
            .set_remote_description(RTCSessionDescription::answer(remote.sdp)?)
            .await?;
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> anyhow::Result<()> {
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        let channel = self.channel.lock().await;
        let Some(channel) = channel.as_ref() else {
            return Ok(());
        };
        if channel.ready_state()
            != webrtc::data_channel::data_channel_state::RTCDataChannelState::Open
        {
            return Ok(());
        }
        for payload in self.queue.drain(..) {
            channel.send_text(payload).await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.gone.store(true, Ordering::Relaxed);
        // The channel goes first, then the connection that owns it.
        if let Some(channel) = self.channel.lock().await.take() {
            channel
                .close()
                .await
                .err()
                .map(|e| log::warn!("While closing the data channel: {e:?}"));
        }
        self.connection
            .close()
            .await
            .err()
            .map(|e| log::warn!("While closing the peer connection: {e:?}"));
    }

    async fn event(&mut self, msg: RtcIn) -> anyhow::Result<Option<RtcOut>> {
        Ok(match msg {
            RtcIn::Initiate => Some(RtcOut::LocalDescription(self.initiate().await?)),
            RtcIn::ApplyOffer(remote) => {
                Some(RtcOut::LocalDescription(self.apply_offer(remote).await?))
            }
            RtcIn::ApplyAnswer(remote) => {
                self.apply_answer(remote).await?;
                None
            }
            RtcIn::AddCandidate(candidate) => {
                self.add_candidate(candidate).await?;
                None
            }
            RtcIn::Send(payload) => {
                self.queue.push(payload);
                self.flush().await?;
                None
            }
            RtcIn::Flush => {
                self.flush().await?;
                None
            }
            RtcIn::Close => {
                self.close().await;
                Some(RtcOut::Closed)
            }
        })
    }
}

#[async_trait]
impl EventHandler<RtcIn, RtcOut> for RtcEngine {
    async fn events(&mut self, inputs: Vec<RtcIn>) -> Vec<RtcOut> {
        let mut out = vec![];
        for msg in inputs {
            let setup = !matches!(msg, RtcIn::Send(_) | RtcIn::Flush);
            match self.event(msg).await {
                Ok(Some(reply)) => out.push(reply),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("RtcEngine({:p}): {e:?}", self);
                    if setup {
                        out.push(RtcOut::Failed(e.to_string()));
                    }
                }
            }
        }
        out
    }
}
