//! Configuration for the streaming client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use swaram_core::{
    CaptureConfig, ClientInfo, DetectionMode, ReconnectPolicy, SessionConfig,
};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Detection server endpoints.
    pub server: ServerConfig,
    /// Backoff after a lost connection.
    pub reconnect: ReconnectConfig,
    /// Frame pacing.
    pub capture: CaptureSection,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Candidate URLs, tried in order.
    pub urls: Vec<String>,
    /// Per-URL dial timeout in seconds.
    pub dial_timeout_secs: u64,
    /// Bound on welcome + handshake_ack, in seconds.
    pub handshake_timeout_secs: u64,
    /// Ping interval while connected, in seconds. 0 disables.
    pub keepalive_secs: u64,
    /// Maximum records held while disconnected.
    pub max_pending: usize,
    /// Identifier sent in the handshake. Empty means generate one.
    pub client_id: String,
}

/// Reconnection backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
}

/// Frame capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// Target frames per second (1..=60).
    pub fps: u32,
    /// `sign`, `lip` or `both`.
    pub mode: DetectionMode,
    /// Directory of JPEG frames to replay.
    pub frames_dir: PathBuf,
    /// Per-capture timeout in milliseconds.
    pub capture_timeout_ms: u64,
    /// Stop after this many consecutive refused frames. 0 disables.
    pub max_rejected_streak: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            urls: vec!["ws://127.0.0.1:8765".into(), "ws://localhost:8765".into()],
            dial_timeout_secs: 8,
            handshake_timeout_secs: 10,
            keepalive_secs: 0,
            max_pending: 256,
            client_id: String::new(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 1.5,
            max_delay_secs: 30,
            max_attempts: 10,
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            fps: 10,
            mode: DetectionMode::Both,
            frames_dir: PathBuf::from("frames"),
            capture_timeout_ms: 2_000,
            max_rejected_streak: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ClientConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Session settings with out-of-range values pulled back in.
    pub fn to_session_config(&self) -> SessionConfig {
        let server = &self.server;
        let client = if server.client_id.trim().is_empty() {
            ClientInfo::default()
        } else {
            ClientInfo {
                client_id: server.client_id.trim().to_owned(),
                ..ClientInfo::default()
            }
        };

        SessionConfig {
            candidate_urls: server.urls.clone(),
            dial_timeout: Duration::from_secs(server.dial_timeout_secs.clamp(1, 120)),
            handshake_timeout: Duration::from_secs(server.handshake_timeout_secs.clamp(1, 120)),
            client,
            reconnect: self.reconnect.to_policy(),
            max_pending: server.max_pending.max(1),
            keepalive_interval: (server.keepalive_secs > 0)
                .then(|| Duration::from_secs(server.keepalive_secs)),
        }
    }

    pub fn to_capture_config(&self) -> CaptureConfig {
        let capture = &self.capture;
        CaptureConfig {
            frame_rate_hz: capture.fps.clamp(1, 60),
            mode: capture.mode,
            capture_timeout: Duration::from_millis(capture.capture_timeout_ms.max(10)),
            max_rejected_streak: (capture.max_rejected_streak > 0)
                .then_some(capture.max_rejected_streak),
        }
    }
}

impl ReconnectConfig {
    pub fn to_policy(&self) -> ReconnectPolicy {
        let initial_delay = Duration::from_millis(self.initial_delay_ms.max(10));
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.clamp(1.0, 10.0)
        } else {
            1.5
        };
        ReconnectPolicy {
            initial_delay,
            multiplier,
            max_delay: Duration::from_secs(self.max_delay_secs).max(initial_delay),
            max_attempts: self.max_attempts,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&ClientConfig::default()).unwrap();
        assert!(text.contains("[server]"));
        assert!(text.contains("urls"));
        assert!(text.contains("mode = \"both\""));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: ClientConfig = toml::from_str(
            r#"
            [capture]
            fps = 25
            mode = "lip"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.capture.fps, 25);
        assert_eq!(parsed.capture.mode, DetectionMode::Lip);
        assert_eq!(parsed.server.dial_timeout_secs, 8);
        assert_eq!(parsed.reconnect.max_attempts, 10);
    }

    #[test]
    fn load_from_file_and_fallbacks() {
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("good.toml");
        std::fs::write(&good, "[server]\nurls = [\"ws://10.0.0.5:9000\"]\n").unwrap();
        assert_eq!(
            ClientConfig::load(&good).server.urls,
            vec!["ws://10.0.0.5:9000".to_string()]
        );

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[capture]\nmode = \"telepathy\"\n").unwrap();
        assert_eq!(ClientConfig::load(&bad).capture.mode, DetectionMode::Both);

        let missing = dir.path().join("missing.toml");
        assert_eq!(ClientConfig::load(&missing).capture.fps, 10);
    }

    #[test]
    fn generated_default_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swaram-client.toml");
        std::fs::write(&path, toml::to_string_pretty(&ClientConfig::default()).unwrap()).unwrap();
        let cfg = ClientConfig::load(&path);
        assert_eq!(cfg.server.max_pending, 256);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn conversions_clamp() {
        let mut cfg = ClientConfig::default();
        cfg.capture.fps = 120;
        cfg.server.keepalive_secs = 15;
        cfg.server.client_id = "kiosk-7".into();
        cfg.reconnect.multiplier = f64::NAN;
        cfg.capture.max_rejected_streak = 50;

        let capture = cfg.to_capture_config();
        assert_eq!(capture.frame_rate_hz, 60);
        assert_eq!(capture.max_rejected_streak, Some(50));

        let session = cfg.to_session_config();
        assert_eq!(session.keepalive_interval, Some(Duration::from_secs(15)));
        assert_eq!(session.client.client_id, "kiosk-7");
        assert_eq!(session.reconnect.multiplier, 1.5);
        assert_eq!(session.reconnect.max_delay, Duration::from_secs(30));

        cfg.capture.fps = 0;
        assert_eq!(cfg.to_capture_config().frame_rate_hz, 1);
    }
}
