//! Node identity, broker endpoint and tunables. The identity is set once at
//! process start and never changes; everything else has defaults that work
//! against a local broker.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Version string reported to the broker and to remote nodes.
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Runtime identifier reported to the broker and to remote nodes.
pub const PLATFORM: &str = "rust";

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("the node id must not be empty")]
    EmptyNodeId,
}

/// Who this node is. Immutable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub node_id: String,
    pub platform: String,
    pub version: String,
}

impl LocalIdentity {
    pub fn new(node_id: &str) -> Result<Self, IdentityError> {
        if node_id.is_empty() {
            return Err(IdentityError::EmptyNodeId);
        }
        Ok(Self {
            node_id: node_id.to_string(),
            platform: PLATFORM.to_string(),
            version: LIB_VERSION.to_string(),
        })
    }
}

/// Where the broker lives, with optional opaque authentication data that is
/// passed along in the socket handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub address: String,
    pub auth_data: Option<String>,
}

impl BrokerEndpoint {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            auth_data: None,
        }
    }

    pub fn with_auth(address: &str, auth_data: &str) -> Self {
        Self {
            address: address.to_string(),
            auth_data: Some(auth_data.to_string()),
        }
    }

    /// The full connect URL: address plus the handshake query string
    /// `id={nodeId}&version={version}&runtime={platform}[&data={authData}]`.
    pub fn socket_url(&self, identity: &LocalIdentity) -> String {
        let sep = if self.address.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}id={}&version={}&runtime={}",
            self.address,
            sep,
            percent_encode(&identity.node_id),
            percent_encode(&identity.version),
            percent_encode(&identity.platform),
        );
        if let Some(auth) = &self.auth_data {
            url.push_str("&data=");
            url.push_str(&percent_encode(auth));
        }
        url
    }
}

/// Minimal percent-encoding for query-string values.
pub fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Reverses [`percent_encode`]. Invalid escapes are kept verbatim.
pub fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            if let Some(hex) = raw.get(i + 1..i + 3) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Backoff schedule and attempt cap for broker reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `n` (1-based): `min(base * 2^(n-1), cap)` with
    /// ±10% jitter so a fleet of nodes doesn't stampede the broker.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1).min(16));
        let raw = self
            .base
            .saturating_mul(factor.min(u32::MAX as u64) as u32)
            .min(self.cap);
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        raw.mul_f64(jitter)
    }
}

/// All the tunables in one place.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Default timeout for connecting and authenticating with the broker.
    pub connect_timeout: Duration,
    /// Default timeout for one peer connection attempt.
    pub attempt_timeout: Duration,
    /// How long to wait for a broker acknowledgement before giving up.
    pub ack_timeout: Duration,
    /// Raw payload bytes per data-channel chunk, before JSON and base64
    /// overhead. Must stay well under typical SCTP message limits.
    pub chunk_bytes: usize,
    /// How many incomplete incoming messages are kept per peer before the
    /// oldest one is evicted.
    pub reassembly_cap: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            chunk_bytes: 15 * 1024,
            reassembly_cap: 32,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_carries_the_handshake() {
        let identity = LocalIdentity::new("alice node").unwrap();
        let endpoint = BrokerEndpoint::with_auth("ws://localhost:8765", "tok&en");
        let url = endpoint.socket_url(&identity);
        assert!(url.starts_with("ws://localhost:8765?id=alice%20node&version="));
        assert!(url.contains("&runtime=rust"));
        assert!(url.ends_with("&data=tok%26en"));
    }

    #[test]
    fn percent_round_trip() {
        let raw = "weird id/with?chars&=%";
        assert_eq!(raw, percent_decode(&percent_encode(raw)));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = ReconnectPolicy::default();
        for attempt in 1..=20 {
            let delay = policy.delay(attempt);
            assert!(delay <= Duration::from_secs(33), "attempt {attempt}: {delay:?}");
        }
        assert!(policy.delay(1) <= Duration::from_millis(600));
        assert!(policy.delay(10) >= Duration::from_secs(20));
    }

    #[test]
    fn empty_node_id_is_refused() {
        assert!(LocalIdentity::new("").is_err());
    }
}
