//! # swaram-core
//!
//! Streaming client core for the Swaram sign/lip detection server.
//!
//! This crate contains:
//! - **Message**: `OutboundMessage` / `InboundMessage` wire records (JSON text frames)
//! - **Network**: `Connection`, one WebSocket split into writer and reader tasks
//! - **State**: `ConnectionPhase`, the validated lifecycle state machine
//! - **Session**: dialing, server-speaks-first handshake, epoch-checked
//!   reconnection, the pending queue and inbound dispatch to event sinks
//! - **Capture**: `CaptureLoop`, frame-rate pacing with single-capture backpressure
//! - **Error**: `SwaramError` / `CaptureError`, typed `thiserror` hierarchy

pub mod capture;
pub mod error;
pub mod message;
pub mod network;
pub mod session;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{CaptureConfig, CaptureLoop, CaptureStats, FrameSink, FrameSource};
pub use error::{CaptureError, SwaramError};
pub use message::{
    ControlCommand, DetectionMode, InboundMessage, MonotonicClock, OutboundKind, OutboundMessage,
};
pub use network::{CloseCause, Connection, LinkHandler};
pub use session::{
    ClientInfo, ConnectedEvent, ConnectingEvent, DisconnectEvent, DisconnectReason,
    HandshakingEvent, ReconnectPlan, ReconnectPolicy, SendOutcome, Session, SessionConfig,
    SessionEvent,
};
pub use state::ConnectionPhase;
