//! # The signaling wire codec
//!
//! One JSON object per socket frame. Every client→broker frame carries a
//! `type` tag and a `seq` number; the broker acknowledges each one with an
//! `ACK` frame echoing the `seq`. Broker→client frames are decoded in two
//! stages: a *parsable* form where every field is optional, promoted by
//! [`ParsableFrame::checked`] into the [`Incoming`] enum where every
//! required field is present. A frame that fails the promotion is dropped
//! with a debug log; it is never fatal.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use plarch::rtc::{
    BundlePolicy, IceCandidate, IceServer, RtcConfig, RtcpMuxPolicy, SdpKind, SessionSdp,
    TransportPolicy,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(String),
    #[error("unknown message type {0}")]
    UnknownType(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("bad value for {0}")]
    BadValue(&'static str),
    #[error("bad rtc configuration: {0}")]
    BadRtcConfiguration(String),
}

/// The sender/receiver header carried by every negotiation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub platform_from: String,
    pub version_from: String,
    pub from: String,
    pub to: String,
    pub session_id: String,
}

/// Acknowledgement status for one emitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Ok,
    Error,
    Unauthorized,
    NotConnected,
    Disabled,
}

impl AckStatus {
    pub fn as_wire(&self) -> &'static str {
        match self {
            AckStatus::Ok => "OK",
            AckStatus::Error => "ERROR",
            AckStatus::Unauthorized => "UNAUTHORIZED",
            AckStatus::NotConnected => "NOT_CONNECTED",
            AckStatus::Disabled => "DISABLED",
        }
    }

    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "OK" => Some(AckStatus::Ok),
            "ERROR" => Some(AckStatus::Error),
            "UNAUTHORIZED" => Some(AckStatus::Unauthorized),
            "NOT_CONNECTED" => Some(AckStatus::NotConnected),
            "DISABLED" => Some(AckStatus::Disabled),
            _ => None,
        }
    }
}

/// One entry of the `ARE_NODES_CONNECTED_TO_BROKER` acknowledgement data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConnectedStatus {
    pub id: String,
    pub connected: bool,
}

/// A fully checked broker→client message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Authenticated {
        config: RtcConfig,
    },
    Ack {
        seq: u64,
        status: AckStatus,
        data: Option<Value>,
    },
    Attempt {
        env: Envelope,
        description: SessionSdp,
    },
    Acceptance {
        env: Envelope,
        description: SessionSdp,
    },
    Refusal {
        env: Envelope,
    },
    IncomingNotAllowed {
        env: Envelope,
    },
    IceToResponder {
        env: Envelope,
        candidate: IceCandidate,
    },
    IceToInitiator {
        env: Envelope,
        candidate: IceCandidate,
    },
    SocketMsg {
        from: String,
        to: String,
        channel: String,
        content: String,
    },
}

/// Decodes one frame, logging and reporting why it was discarded.
pub fn decode(text: &str) -> Result<Incoming, DecodeError> {
    let parsable: ParsableFrame =
        serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;
    parsable.checked()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ParsableFrame {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub seq: Option<u64>,
    pub status: Option<String>,
    pub data: Option<Value>,
    pub platform_from: Option<String>,
    pub version_from: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub session_id: Option<String>,
    pub session_description: Option<ParsableSdp>,
    pub candidate: Option<ParsableCandidate>,
    pub channel: Option<String>,
    pub content: Option<String>,
    pub rtc_configuration: Option<ParsableRtcConfiguration>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ParsableSdp {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub sdp: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ParsableCandidate {
    pub sdp: Option<String>,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    pub server_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ParsableRtcConfiguration {
    pub ice_servers: Option<Vec<ParsableIceServer>>,
    pub ice_transport_policy: Option<String>,
    pub bundle_policy: Option<String>,
    pub rtcp_mux_policy: Option<String>,
    pub ice_candidate_pool_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ParsableIceServer {
    pub urls: Option<Vec<String>>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ParsableFrame {
    /// Promotes the frame, validating required fields and normalizing the
    /// string enums.
    pub fn checked(self) -> Result<Incoming, DecodeError> {
        let kind = self.kind.clone().ok_or(DecodeError::MissingField("type"))?;
        match kind.as_str() {
            "AUTHENTICATED" => {
                let config = self
                    .rtc_configuration
                    .ok_or(DecodeError::BadRtcConfiguration("missing".into()))?;
                Ok(Incoming::Authenticated {
                    config: check_rtc_config(config)?,
                })
            }
            "ACK" => {
                let seq = self.seq.ok_or(DecodeError::MissingField("seq"))?;
                let raw = self.status.ok_or(DecodeError::MissingField("status"))?;
                let status =
                    AckStatus::from_wire(&raw).ok_or(DecodeError::BadValue("status"))?;
                Ok(Incoming::Ack {
                    seq,
                    status,
                    data: self.data,
                })
            }
            "CONNECTION_ATTEMPT" => {
                let description = check_sdp(
                    self.session_description
                        .clone()
                        .ok_or(DecodeError::MissingField("sessionDescription"))?,
                )?;
                Ok(Incoming::Attempt {
                    env: self.envelope()?,
                    description,
                })
            }
            "CONNECTION_ACCEPTANCE" => {
                let description = check_sdp(
                    self.session_description
                        .clone()
                        .ok_or(DecodeError::MissingField("sessionDescription"))?,
                )?;
                Ok(Incoming::Acceptance {
                    env: self.envelope()?,
                    description,
                })
            }
            "CONNECTION_REFUSAL" => Ok(Incoming::Refusal {
                env: self.envelope()?,
            }),
            "INCOMING_CONNECTIONS_NOT_ALLOWED" => Ok(Incoming::IncomingNotAllowed {
                env: self.envelope()?,
            }),
            "ICE_CANDIDATES_EXCHANGE_INITIATOR_TO_RESPONDER" => {
                let candidate = check_candidate(
                    self.candidate
                        .clone()
                        .ok_or(DecodeError::MissingField("candidate"))?,
                )?;
                Ok(Incoming::IceToResponder {
                    env: self.envelope()?,
                    candidate,
                })
            }
            "ICE_CANDIDATES_EXCHANGE_RESPONDER_TO_INITIATOR" => {
                let candidate = check_candidate(
                    self.candidate
                        .clone()
                        .ok_or(DecodeError::MissingField("candidate"))?,
                )?;
                Ok(Incoming::IceToInitiator {
                    env: self.envelope()?,
                    candidate,
                })
            }
            "SOCKET_MSG_EXCHANGE" => Ok(Incoming::SocketMsg {
                from: self.from.ok_or(DecodeError::MissingField("from"))?,
                to: self.to.ok_or(DecodeError::MissingField("to"))?,
                channel: self.channel.ok_or(DecodeError::MissingField("channel"))?,
                content: self.content.ok_or(DecodeError::MissingField("content"))?,
            }),
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }

    fn envelope(&self) -> Result<Envelope, DecodeError> {
        Ok(Envelope {
            platform_from: self
                .platform_from
                .clone()
                .ok_or(DecodeError::MissingField("platformFrom"))?,
            version_from: self
                .version_from
                .clone()
                .ok_or(DecodeError::MissingField("versionFrom"))?,
            from: self.from.clone().ok_or(DecodeError::MissingField("from"))?,
            to: self.to.clone().ok_or(DecodeError::MissingField("to"))?,
            session_id: self
                .session_id
                .clone()
                .ok_or(DecodeError::MissingField("sessionId"))?,
        })
    }
}

fn check_sdp(raw: ParsableSdp) -> Result<SessionSdp, DecodeError> {
    let kind_raw = raw
        .kind
        .ok_or(DecodeError::MissingField("sessionDescription.type"))?;
    let kind = SdpKind::from_wire(&kind_raw).ok_or_else(|| {
        log::debug!("Unknown sdp type {kind_raw}");
        DecodeError::BadValue("sessionDescription.type")
    })?;
    Ok(SessionSdp {
        kind,
        sdp: raw
            .sdp
            .ok_or(DecodeError::MissingField("sessionDescription.sdp"))?,
    })
}

fn check_candidate(raw: ParsableCandidate) -> Result<IceCandidate, DecodeError> {
    Ok(IceCandidate {
        candidate: raw.sdp.ok_or(DecodeError::MissingField("candidate.sdp"))?,
        sdp_mid: raw.sdp_mid,
        sdp_mline_index: raw.sdp_mline_index,
        server_url: raw.server_url,
    })
}

fn check_rtc_config(raw: ParsableRtcConfiguration) -> Result<RtcConfig, DecodeError> {
    let servers = raw
        .ice_servers
        .ok_or(DecodeError::BadRtcConfiguration("no iceServers".into()))?;
    let mut ice_servers = vec![];
    for server in servers {
        let urls = server
            .urls
            .filter(|urls| !urls.is_empty())
            .ok_or(DecodeError::BadRtcConfiguration("iceServer without urls".into()))?;
        ice_servers.push(IceServer {
            urls,
            username: server.username,
            credential: server.password,
        });
    }
    Ok(RtcConfig {
        ice_servers,
        transport_policy: parse_policy(
            raw.ice_transport_policy,
            TransportPolicy::from_wire,
            "iceTransportPolicy",
        ),
        bundle_policy: parse_policy(raw.bundle_policy, BundlePolicy::from_wire, "bundlePolicy"),
        rtcp_mux_policy: parse_policy(
            raw.rtcp_mux_policy,
            RtcpMuxPolicy::from_wire,
            "rtcpMuxPolicy",
        ),
        candidate_pool_size: raw.ice_candidate_pool_size,
    })
}

// Unknown policy strings are logged and treated as absent.
fn parse_policy<T: Default>(
    raw: Option<String>,
    parse: fn(&str) -> Option<T>,
    name: &'static str,
) -> T {
    match raw {
        Some(value) => parse(&value).unwrap_or_else(|| {
            log::debug!("Unknown {name} value {value}, using the default");
            T::default()
        }),
        None => T::default(),
    }
}

/// A client→broker frame ready to be emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Attempt {
        env: Envelope,
        description: SessionSdp,
    },
    Acceptance {
        env: Envelope,
        description: SessionSdp,
    },
    Refusal {
        env: Envelope,
    },
    IncomingNotAllowed {
        env: Envelope,
    },
    IceToResponder {
        env: Envelope,
        candidate: IceCandidate,
    },
    IceToInitiator {
        env: Envelope,
        candidate: IceCandidate,
    },
    SocketMsg {
        from: String,
        to: String,
        channel: String,
        content: String,
    },
    NodesConnected {
        ids: Vec<String>,
    },
}

impl Outgoing {
    pub fn encode(&self, seq: u64) -> String {
        let mut frame = match self {
            Outgoing::Attempt { env, description } => {
                let mut map = envelope_map(env, "CONNECTION_ATTEMPT");
                map.insert("sessionDescription".into(), sdp_value(description));
                map
            }
            Outgoing::Acceptance { env, description } => {
                let mut map = envelope_map(env, "CONNECTION_ACCEPTANCE");
                map.insert("sessionDescription".into(), sdp_value(description));
                map
            }
            Outgoing::Refusal { env } => envelope_map(env, "CONNECTION_REFUSAL"),
            Outgoing::IncomingNotAllowed { env } => {
                envelope_map(env, "INCOMING_CONNECTIONS_NOT_ALLOWED")
            }
            Outgoing::IceToResponder { env, candidate } => {
                let mut map =
                    envelope_map(env, "ICE_CANDIDATES_EXCHANGE_INITIATOR_TO_RESPONDER");
                map.insert("candidate".into(), candidate_value(candidate));
                map
            }
            Outgoing::IceToInitiator { env, candidate } => {
                let mut map =
                    envelope_map(env, "ICE_CANDIDATES_EXCHANGE_RESPONDER_TO_INITIATOR");
                map.insert("candidate".into(), candidate_value(candidate));
                map
            }
            Outgoing::SocketMsg {
                from,
                to,
                channel,
                content,
            } => {
                let mut map = Map::new();
                map.insert("type".into(), "SOCKET_MSG_EXCHANGE".into());
                map.insert("from".into(), from.clone().into());
                map.insert("to".into(), to.clone().into());
                map.insert("channel".into(), channel.clone().into());
                map.insert("content".into(), content.clone().into());
                map
            }
            Outgoing::NodesConnected { ids } => {
                let mut map = Map::new();
                map.insert("type".into(), "ARE_NODES_CONNECTED_TO_BROKER".into());
                map.insert("ids".into(), json!(ids));
                map
            }
        };
        frame.insert("seq".into(), seq.into());
        Value::Object(frame).to_string()
    }
}

fn envelope_map(env: &Envelope, kind: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("type".into(), kind.into());
    map.insert("platformFrom".into(), env.platform_from.clone().into());
    map.insert("versionFrom".into(), env.version_from.clone().into());
    map.insert("from".into(), env.from.clone().into());
    map.insert("to".into(), env.to.clone().into());
    map.insert("sessionId".into(), env.session_id.clone().into());
    map
}

fn sdp_value(description: &SessionSdp) -> Value {
    json!({
        "type": description.kind.as_wire(),
        "sdp": description.sdp,
    })
}

fn candidate_value(candidate: &IceCandidate) -> Value {
    let mut map = Map::new();
    map.insert("sdp".into(), candidate.candidate.clone().into());
    map.insert("sdpMid".into(), json!(candidate.sdp_mid));
    map.insert("sdpMLineIndex".into(), json!(candidate.sdp_mline_index));
    if let Some(url) = &candidate.server_url {
        map.insert("serverUrl".into(), url.clone().into());
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plarch::start_logging;

    fn envelope() -> Envelope {
        Envelope {
            platform_from: "rust".into(),
            version_from: "0.1.0".into(),
            from: "alice".into(),
            to: "bob".into(),
            session_id: "d3b07384-0000-4000-8000-000000000000".into(),
        }
    }

    #[test]
    fn attempt_round_trip() -> anyhow::Result<()> {
        start_logging();

        let msg = Outgoing::Attempt {
            env: envelope(),
            description: SessionSdp {
                kind: SdpKind::Offer,
                sdp: "v=0".into(),
            },
        };
        let text = msg.encode(7);
        log::debug!("Frame is: {text}");

        match decode(&text)? {
            Incoming::Attempt { env, description } => {
                assert_eq!(envelope(), env);
                assert_eq!(SdpKind::Offer, description.kind);
                assert_eq!("v=0", description.sdp);
            }
            other => panic!("unexpected message {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn candidate_round_trip() -> anyhow::Result<()> {
        let msg = Outgoing::IceToResponder {
            env: envelope(),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2113937151 192.0.2.1 54400 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                server_url: None,
            },
        };
        match decode(&msg.encode(1))? {
            Incoming::IceToResponder { candidate, .. } => {
                assert_eq!(Some(0), candidate.sdp_mline_index);
                assert!(candidate.candidate.starts_with("candidate:1"));
            }
            other => panic!("unexpected message {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn missing_fields_are_rejected() {
        let text = r#"{"type":"CONNECTION_ATTEMPT","from":"alice","to":"bob"}"#;
        assert_eq!(
            Err(DecodeError::MissingField("sessionDescription")),
            decode(text)
        );

        let text = r#"{"type":"CONNECTION_REFUSAL","from":"alice","to":"bob","sessionId":"s"}"#;
        assert_eq!(Err(DecodeError::MissingField("platformFrom")), decode(text));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_eq!(
            Err(DecodeError::UnknownType("SOMETHING_NEW".into())),
            decode(r#"{"type":"SOMETHING_NEW"}"#)
        );
    }

    #[test]
    fn authenticated_with_unknown_policies_falls_back_to_defaults() -> anyhow::Result<()> {
        let text = r#"{
            "type": "AUTHENTICATED",
            "rtcConfiguration": {
                "iceServers": [{"urls": ["stun:stun.example.org:3478"], "username": "u"}],
                "iceTransportPolicy": "quantum",
                "bundlePolicy": "max-bundle",
                "iceCandidatePoolSize": 4
            }
        }"#;
        match decode(text)? {
            Incoming::Authenticated { config } => {
                assert_eq!(1, config.ice_servers.len());
                assert_eq!(TransportPolicy::All, config.transport_policy);
                assert_eq!(BundlePolicy::MaxBundle, config.bundle_policy);
                assert_eq!(Some(4), config.candidate_pool_size);
            }
            other => panic!("unexpected message {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn broken_rtc_configuration_is_reported() {
        let text = r#"{"type":"AUTHENTICATED","rtcConfiguration":{"iceServers":[{}]}}"#;
        assert!(matches!(
            decode(text),
            Err(DecodeError::BadRtcConfiguration(_))
        ));
    }

    #[test]
    fn ack_with_data() -> anyhow::Result<()> {
        let text = r#"{"type":"ACK","seq":3,"status":"OK","data":[{"id":"bob","connected":true}]}"#;
        match decode(text)? {
            Incoming::Ack { seq, status, data } => {
                assert_eq!(3, seq);
                assert_eq!(AckStatus::Ok, status);
                let statuses: Vec<NodeConnectedStatus> =
                    serde_json::from_value(data.expect("data"))?;
                assert_eq!("bob", statuses[0].id);
                assert!(statuses[0].connected);
            }
            other => panic!("unexpected message {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn unknown_sdp_kind_is_rejected() {
        let text = r#"{
            "type": "CONNECTION_ATTEMPT",
            "platformFrom": "rust", "versionFrom": "0.1.0",
            "from": "alice", "to": "bob", "sessionId": "s",
            "sessionDescription": {"type": "monologue", "sdp": "v=0"}
        }"#;
        assert_eq!(
            Err(DecodeError::BadValue("sessionDescription.type")),
            decode(text)
        );
    }
}
