//! Connection lifecycle state machine for one session.
//!
//! Provides a `ConnectionPhase` enum that models the lifecycle of a
//! single physical connection, with validated transitions that return
//! `Result` instead of panicking.

use std::time::{Duration, Instant};

use crate::error::SwaramError;

// ── ConnectionPhase ──────────────────────────────────────────────

/// The current phase of the session's connection.
///
/// ```text
///  Disconnected ──► Connecting ──► Handshaking ──► Connected
///       ▲                │          (greeted?)          │
///       │                ▼               │              │
///       └────────────────┴───────────────┴──────────────┘
/// ```
///
/// The protocol is server-speaks-first: `Handshaking` starts when the
/// transport opens, `greeted` flips once the server's `welcome` has been
/// answered with our handshake, and only the server's acknowledgment
/// moves the phase to `Connected`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// No active connection. Initial / terminal state.
    #[default]
    Disconnected,

    /// Dialing candidate URLs.
    Connecting,

    /// Transport is open; waiting for `welcome` and then `handshake_ack`.
    Handshaking {
        /// `welcome` received and our handshake sent.
        greeted: bool,
    },

    /// Handshake acknowledged; frames may flow.
    Connected {
        /// When the connection entered the `Connected` state.
        since: Instant,
    },
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Handshaking { .. } => write!(f, "Handshaking"),
            Self::Connected { .. } => write!(f, "Connected"),
        }
    }
}

impl ConnectionPhase {
    /// Returns `true` when the handshake is complete and traffic may flow.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    pub fn is_handshaking(&self) -> bool {
        matches!(self, Self::Handshaking { .. })
    }

    /// How long the connection has been in the `Connected` state.
    ///
    /// Returns `None` for any other phase.
    pub fn connected_duration(&self) -> Option<Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Connecting`.
    ///
    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), SwaramError> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            other => Err(SwaramError::InvalidState {
                operation: "connect",
                phase: other.to_string(),
            }),
        }
    }

    /// Transition to `Handshaking` once the transport reports open.
    ///
    /// Valid from: `Connecting`.
    pub fn transport_open(&mut self) -> Result<(), SwaramError> {
        match self {
            Self::Connecting => {
                *self = Self::Handshaking { greeted: false };
                Ok(())
            }
            other => Err(SwaramError::InvalidState {
                operation: "open transport",
                phase: other.to_string(),
            }),
        }
    }

    /// Record that the server's `welcome` arrived and our handshake went out.
    ///
    /// Valid from: `Handshaking` before the greeting.
    pub fn greeted(&mut self) -> Result<(), SwaramError> {
        match self {
            Self::Handshaking { greeted: false } => {
                *self = Self::Handshaking { greeted: true };
                Ok(())
            }
            other => Err(SwaramError::InvalidState {
                operation: "accept welcome",
                phase: other.to_string(),
            }),
        }
    }

    /// Transition to `Connected`.
    ///
    /// Valid from: `Handshaking` after the greeting.
    pub fn complete_handshake(&mut self) -> Result<(), SwaramError> {
        match self {
            Self::Handshaking { greeted: true } => {
                *self = Self::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            other => Err(SwaramError::InvalidState {
                operation: "complete handshake",
                phase: other.to_string(),
            }),
        }
    }

    /// Force-reset to `Disconnected` regardless of current state.
    ///
    /// Returns the phase that was left.
    pub fn force_disconnect(&mut self) -> ConnectionPhase {
        std::mem::take(self)
    }
}

// ── Tests ────────────────────────────────────────────────────────
