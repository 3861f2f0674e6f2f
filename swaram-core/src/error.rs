//! Domain-specific error types for the streaming session.
//!
//! All fallible operations return `Result<T, SwaramError>`.
//! Frame source failures use the narrower [`CaptureError`] so the capture
//! loop can contain them without touching connection state.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the Swaram client core.
#[derive(Debug, Error)]
pub enum SwaramError {
    // ── Connection Errors ────────────────────────────────────────
    /// No candidate URL could be reached within the dial timeout.
    #[error("dial failed for {} candidate(s): {last_error}", attempted.len())]
    Dial {
        attempted: Vec<String>,
        last_error: String,
    },

    /// The transport failed mid-session.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server did not greet or acknowledge within the bound.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The operation is not valid in the session's current phase.
    #[error("cannot {operation} while {phase}")]
    InvalidState {
        operation: &'static str,
        phase: String,
    },

    /// The operation was superseded by an explicit disconnect.
    #[error("operation cancelled by disconnect")]
    Cancelled,

    // ── Protocol Errors ──────────────────────────────────────────
    /// An inbound payload was malformed or unroutable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Encoding an outbound record failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Capture Errors ───────────────────────────────────────────
    /// The frame source failed.
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    // ── Application Errors ───────────────────────────────────────
    /// Configuration could not be used.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Local I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwaramError {
    /// Whether the lifecycle state machine treats this as a dropped link
    /// (and therefore engages the reconnection policy).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::HandshakeTimeout(_))
    }
}

// ── CaptureError ─────────────────────────────────────────────────

/// Failure of a single frame capture. Always recoverable: the capture
/// loop logs it and skips the cycle.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device or backing store is not available right now.
    #[error("frame source unavailable: {0}")]
    Unavailable(String),

    /// The capture exceeded its deadline.
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),

    /// Reading the frame failed at the I/O layer.
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic capture failure with a human-readable message.
    #[error("capture failed: {0}")]
    Failed(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<serde_json::Error> for SwaramError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            SwaramError::Protocol(e.to_string())
        } else {
            SwaramError::Encoding(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SwaramError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SwaramError::Transport(e.to_string())
    }
}
