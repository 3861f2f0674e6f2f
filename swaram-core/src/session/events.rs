//! Events the session reports to the presentation layer.
//!
//! Lifecycle events (`Connecting`, `Handshaking`, `Connected`,
//! `Disconnected`) fire exactly once per phase transition, in the order
//! the transitions happened. The remaining
//! variants are inbound server records routed by tag.

use std::sync::Arc;
use std::time::Duration;

use crate::message::{
    ControlResponse, Detection, Health, InboundMessage, ModeChanged, Pong, ServerError, Stats,
    Status, Translation, Welcome,
};

// ── Lifecycle payloads ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectingEvent {
    /// 0 for an explicit `connect`, otherwise the reconnect attempt number.
    pub attempt: u32,
    /// URLs that will be tried, in order.
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakingEvent {
    pub url: String,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedEvent {
    pub url: String,
    pub epoch: u64,
    /// Pending messages delivered on entry.
    pub flushed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    ClientClosed,
    /// Every candidate URL failed to dial.
    DialFailed(String),
    /// The server closed the socket.
    ServerClosed { code: Option<u16>, reason: String },
    /// Read/write failure on an open socket.
    Transport(String),
    /// No `welcome`/`handshake_ack` within the bound.
    HandshakeTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPlan {
    /// A retry timer is armed.
    Scheduled { attempt: u32, delay: Duration },
    /// The attempt budget is spent; nothing further will happen on its own.
    Exhausted,
    /// No retry applies (explicit disconnect or failed explicit connect).
    NotPlanned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    /// URL of the connection that was lost, if one had been opened.
    pub url: Option<String>,
    pub epoch: u64,
    pub reason: DisconnectReason,
    pub reconnect: ReconnectPlan,
}

impl DisconnectEvent {
    /// Reconnection gave up.
    pub fn is_terminal(&self) -> bool {
        matches!(self.reconnect, ReconnectPlan::Exhausted)
    }
}

// ── SessionEvent ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connecting(ConnectingEvent),
    Handshaking(HandshakingEvent),
    Connected(ConnectedEvent),
    Disconnected(DisconnectEvent),
    Welcome(Welcome),
    Detection(Detection),
    Translation(Translation),
    Stats(Stats),
    Error(ServerError),
    ModeChanged(ModeChanged),
    ControlResponse(ControlResponse),
    Health(Health),
    Status(Status),
    Pong(Pong),
}

impl SessionEvent {
    /// Route an inbound record to its event category.
    ///
    /// `HandshakeAck` is consumed by the handshake and `Unknown` is
    /// dropped, so neither maps to an event.
    pub fn from_inbound(message: InboundMessage) -> Option<Self> {
        match message {
            InboundMessage::Welcome(m) => Some(Self::Welcome(m)),
            InboundMessage::Detection(m) => Some(Self::Detection(m)),
            InboundMessage::Translation(m) => Some(Self::Translation(m)),
            InboundMessage::Stats(m) => Some(Self::Stats(m)),
            InboundMessage::Error(m) => Some(Self::Error(m)),
            InboundMessage::ModeChanged(m) => Some(Self::ModeChanged(m)),
            InboundMessage::ControlResponse(m) => Some(Self::ControlResponse(m)),
            InboundMessage::Health(m) => Some(Self::Health(m)),
            InboundMessage::Status(m) => Some(Self::Status(m)),
            InboundMessage::Pong(m) => Some(Self::Pong(m)),
            InboundMessage::HandshakeAck(_) | InboundMessage::Unknown(_) => None,
        }
    }
}

// ── EventSinks ───────────────────────────────────────────────────

pub type Sink<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

/// One optional callback per event category. Cloning shares the callbacks.
#[derive(Clone, Default)]
pub struct EventSinks {
    pub(crate) connecting: Option<Sink<ConnectingEvent>>,
    pub(crate) handshaking: Option<Sink<HandshakingEvent>>,
    pub(crate) connected: Option<Sink<ConnectedEvent>>,
    pub(crate) disconnected: Option<Sink<DisconnectEvent>>,
    pub(crate) welcome: Option<Sink<Welcome>>,
    pub(crate) detection: Option<Sink<Detection>>,
    pub(crate) translation: Option<Sink<Translation>>,
    pub(crate) stats: Option<Sink<Stats>>,
    pub(crate) error: Option<Sink<ServerError>>,
    pub(crate) mode_changed: Option<Sink<ModeChanged>>,
    pub(crate) control_response: Option<Sink<ControlResponse>>,
    pub(crate) health: Option<Sink<Health>>,
    pub(crate) status: Option<Sink<Status>>,
    pub(crate) pong: Option<Sink<Pong>>,
}

fn call<T>(sink: &Option<Sink<T>>, payload: &T) -> bool {
    match sink {
        Some(f) => {
            f(payload);
            true
        }
        None => false,
    }
}

impl EventSinks {
    /// Deliver one event. Returns `true` if a sink was registered for it.
    pub fn emit(&self, event: &SessionEvent) -> bool {
        match event {
            SessionEvent::Connecting(e) => call(&self.connecting, e),
            SessionEvent::Handshaking(e) => call(&self.handshaking, e),
            SessionEvent::Connected(e) => call(&self.connected, e),
            SessionEvent::Disconnected(e) => call(&self.disconnected, e),
            SessionEvent::Welcome(e) => call(&self.welcome, e),
            SessionEvent::Detection(e) => call(&self.detection, e),
            SessionEvent::Translation(e) => call(&self.translation, e),
            SessionEvent::Stats(e) => call(&self.stats, e),
            SessionEvent::Error(e) => call(&self.error, e),
            SessionEvent::ModeChanged(e) => call(&self.mode_changed, e),
            SessionEvent::ControlResponse(e) => call(&self.control_response, e),
            SessionEvent::Health(e) => call(&self.health, e),
            SessionEvent::Status(e) => call(&self.status, e),
            SessionEvent::Pong(e) => call(&self.pong, e),
        }
    }
}

impl std::fmt::Debug for EventSinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSinks")
            .field("connected", &self.connected.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .field("detection", &self.detection.is_some())
            .field("translation", &self.translation.is_some())
            .finish_non_exhaustive()
    }
}
