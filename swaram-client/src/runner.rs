//! Wires a [`Session`] and a [`CaptureLoop`] together for one run of the
//! client, and turns session events into log lines.

use std::future::Future;
use std::sync::Arc;

use swaram_core::{
    CaptureLoop, CaptureStats, ControlCommand, SendOutcome, Session, SwaramError,
};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::source::DirectorySource;

/// One client run: connect, stream until asked to stop, then hang up.
pub struct Runner {
    config: ClientConfig,
    session: Session,
    lost: Arc<Notify>,
}

impl Runner {
    pub fn new(config: ClientConfig) -> Self {
        let session = Session::new(config.to_session_config());
        let lost = Arc::new(Notify::new());
        install_sinks(&session, Arc::clone(&lost));
        Self {
            config,
            session,
            lost,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run until `shutdown` resolves or reconnection is exhausted.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<CaptureStats, SwaramError> {
        tokio::pin!(shutdown);

        let source = DirectorySource::open(&self.config.capture.frames_dir).await?;
        info!(
            frames = source.len(),
            dir = %self.config.capture.frames_dir.display(),
            "frame source ready"
        );

        tokio::select! {
            connected = self.connect_with_retry() => { connected?; }
            _ = &mut shutdown => {
                info!("shutdown requested before connecting");
                self.session.disconnect();
                return Ok(CaptureStats::default());
            }
        }

        let capture_config = self.config.to_capture_config();
        self.session.send_control(ControlCommand::Start);
        self.session.change_mode(capture_config.mode);

        let capture = CaptureLoop::new(
            Arc::new(source),
            Arc::new(self.session.clone()),
            capture_config,
        );

        let result = tokio::select! {
            r = capture.run() => r,
            _ = &mut shutdown => {
                info!("shutdown requested");
                Ok(())
            }
            _ = self.lost.notified() => {
                error!("server unreachable, giving up");
                Err(SwaramError::Transport("reconnect attempts exhausted".into()))
            }
        };
        capture.stop();

        if self.session.send_control(ControlCommand::Stop) != SendOutcome::Sent {
            debug!("stop not delivered, connection is down");
        }
        self.session.disconnect();

        let stats = capture.stats();
        info!(
            frames = stats.frame_count,
            sent = stats.frames_sent,
            rejected = stats.rejected,
            skipped_busy = stats.skipped_busy,
            failures = stats.failures,
            "capture finished"
        );
        result.map(|()| stats)
    }

    /// Explicit connects until one succeeds, spaced by the reconnect
    /// policy. Once connected, the session handles later losses itself.
    async fn connect_with_retry(&self) -> Result<String, SwaramError> {
        let policy = self.config.reconnect.to_policy();
        let mut attempt = 0;
        loop {
            match self.session.connect(None).await {
                Ok(url) => return Ok(url),
                Err(e @ (SwaramError::Config(_) | SwaramError::InvalidState { .. })) => {
                    return Err(e);
                }
                Err(e) if policy.allows(attempt) => {
                    let delay = policy.delay_for(attempt);
                    attempt += 1;
                    warn!(attempt, ?delay, error = %e, "connect failed, retrying");
                    // a handshake timeout may have armed the session's own retry
                    self.session.disconnect();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Log every session event. A terminal disconnect wakes `lost`.
fn install_sinks(session: &Session, lost: Arc<Notify>) {
    session.on_connecting(|e| {
        info!(attempt = e.attempt, candidates = ?e.candidates, "connecting");
    });
    session.on_handshaking(|e| debug!(url = %e.url, epoch = e.epoch, "awaiting handshake"));
    session.on_connected(|e| {
        info!(url = %e.url, epoch = e.epoch, flushed = e.flushed, "connected");
    });
    session.on_disconnected(move |e| {
        warn!(epoch = e.epoch, reason = ?e.reason, plan = ?e.reconnect, "disconnected");
        if e.is_terminal() {
            lost.notify_one();
        }
    });
    session.on_welcome(|w| {
        info!(
            server = w.server_version.as_deref().unwrap_or("unknown"),
            modes = ?w.supported_modes,
            "server welcome"
        );
    });
    session.on_detection(|d| {
        info!(
            frame_id = d.frame_id.as_deref().unwrap_or("-"),
            mode = ?d.mode,
            detection = %d.detection,
            "detection"
        );
    });
    session.on_translation(|t| {
        info!(frame_id = t.frame_id.as_deref().unwrap_or("-"), data = %t.data, "translation");
    });
    session.on_stats(|s| {
        debug!(fps = ?s.fps, queue = ?s.queue_size, latency = ?s.latency, "server stats");
    });
    session.on_error(|e| warn!(message = %e.message, "server error"));
    session.on_mode_changed(|m| info!(mode = ?m.mode, "server mode changed"));
    session.on_control_response(|c| {
        debug!(command = ?c.command, status = ?c.status, "control response");
    });
    session.on_health(|h| debug!(status = ?h.status, connections = ?h.connections, "health"));
    session.on_status(|s| debug!(message = ?s.message, position = ?s.queue_position, "status"));
    session.on_pong(|p| debug!(sent_at = ?p.client_timestamp, "pong"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_frames_dir_fails_before_dialing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClientConfig::default();
        config.capture.frames_dir = dir.path().join("nope");

        let runner = Runner::new(config);
        let err = runner.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, SwaramError::Capture(_)));
        assert!(runner.session().phase().is_disconnected());
    }

    #[tokio::test]
    async fn shutdown_while_connecting_returns_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0001.jpg"), b"\xff\xd8").unwrap();

        let unreachable = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            format!("ws://{}", listener.local_addr().unwrap())
        };
        let mut config = ClientConfig::default();
        config.server.urls = vec![unreachable];
        config.capture.frames_dir = dir.path().to_path_buf();

        let runner = Runner::new(config);
        let stats = runner
            .run(tokio::time::sleep(std::time::Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(stats, CaptureStats::default());
        assert!(runner.session().phase().is_disconnected());
    }
}
