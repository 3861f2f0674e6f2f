use std::time::Duration;

use rand::RngCore;

use super::retry::ReconnectPolicy;

/// Identity carried in the `handshake` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: String,
    pub platform: String,
    pub version: String,
}

impl ClientInfo {
    /// Random per-process identifier, e.g. `swaram-3f9a0c1d2e4b5a69`.
    pub fn generate_id() -> String {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("swaram-{}", hex::encode(bytes))
    }
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            client_id: Self::generate_id(),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Session tuning. Everything has a usable default.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Tried in order when `connect` is called without a URL.
    pub candidate_urls: Vec<String>,
    /// Upper bound on a single dial attempt.
    pub dial_timeout: Duration,
    /// Upper bound from transport open to `handshake_ack`.
    pub handshake_timeout: Duration,
    pub client: ClientInfo,
    pub reconnect: ReconnectPolicy,
    /// Maximum pending records; the oldest is evicted beyond this.
    pub max_pending: usize,
    /// Send a `ping` this often while connected. Zero disables it.
    pub keepalive_interval: Option<Duration>,
}

impl SessionConfig {
    /// The keepalive period, if one is enabled.
    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive_interval.filter(|every| !every.is_zero())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            candidate_urls: vec!["ws://127.0.0.1:8765".into()],
            dial_timeout: Duration::from_secs(8),
            handshake_timeout: Duration::from_secs(10),
            client: ClientInfo::default(),
            reconnect: ReconnectPolicy::default(),
            max_pending: 256,
            keepalive_interval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_unique() {
        let a = ClientInfo::generate_id();
        let b = ClientInfo::generate_id();
        assert!(a.starts_with("swaram-"));
        assert_eq!(a.len(), "swaram-".len() + 16);
        assert_ne!(a, b);
    }

    #[test]
    fn defaults() {
        let c = SessionConfig::default();
        assert_eq!(c.dial_timeout, Duration::from_secs(8));
        assert_eq!(c.handshake_timeout, Duration::from_secs(10));
        assert_eq!(c.max_pending, 256);
        assert!(c.keepalive_interval.is_none());
        assert_eq!(c.client.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn zero_keepalive_is_disabled() {
        let mut c = SessionConfig {
            keepalive_interval: Some(Duration::ZERO),
            ..Default::default()
        };
        assert_eq!(c.keepalive(), None);
        c.keepalive_interval = Some(Duration::from_secs(5));
        assert_eq!(c.keepalive(), Some(Duration::from_secs(5)));
    }
}
