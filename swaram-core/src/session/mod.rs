//! The streaming session: one logical client-to-server relationship that
//! may span many physical connections ("epochs").
//!
//! All mutable state lives behind a single mutex so that a phase
//! transition or a queue mutation is indivisible with respect to inbound
//! delivery on the reader task. Events are recorded in an outbox while the
//! lock is held, so their order is the order of the transitions, and are
//! delivered to sinks by one thread at a time after it is released. A sink
//! may call back into the session, including to register sinks.

pub mod config;
pub mod events;
pub mod queue;
pub mod retry;

pub use config::{ClientInfo, SessionConfig};
pub use events::{
    ConnectedEvent, ConnectingEvent, DisconnectEvent, DisconnectReason, EventSinks,
    HandshakingEvent, ReconnectPlan, SessionEvent,
};
pub use queue::PendingQueue;
pub use retry::{ReconnectPolicy, RetryScheduler, RetryTicket};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::SwaramError;
use crate::message::{
    ControlCommand, ControlResponse, Detection, DetectionMode, Health, HandshakeAck,
    InboundMessage, ModeChanged, MonotonicClock, OutboundMessage, Pong, ServerError, Stats,
    Status, Translation, Welcome,
};
use crate::network::{self, CloseCause, Connection, LinkHandler, WsStream};
use crate::state::ConnectionPhase;

// ── SendOutcome ──────────────────────────────────────────────────

/// What the send path did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the live connection's writer.
    Sent,
    /// Held in the pending queue until the next `Connected` transition.
    Queued,
    /// Discarded (frames outside `Connected`, or unencodable records).
    Dropped,
}

impl SendOutcome {
    /// Sent or queued.
    pub fn is_accepted(self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

// ── Internal state ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialOrigin {
    Explicit,
    Retry,
}

type HandshakeWaiter = oneshot::Sender<Result<String, SwaramError>>;

struct SessionState {
    phase: ConnectionPhase,
    epoch: u64,
    handshake_complete: bool,
    connection: Option<Connection>,
    queue: PendingQueue,
    reconnect_attempt: u32,
    retry: RetryScheduler,
    /// URLs of the last explicit `connect`; retries dial these.
    targets: Vec<String>,
    /// URL of the last connection that reached `Connected`.
    last_url: Option<String>,
    /// Identifies the dial in flight. Bumped to abandon it.
    dial_serial: u64,
    dial_origin: DialOrigin,
    /// Set by `disconnect`, cleared by `connect`.
    explicit_close: bool,
    handshake_waiter: Option<HandshakeWaiter>,
    frame_serial: u64,
    /// Events awaiting delivery, in transition order.
    outbox: VecDeque<SessionEvent>,
    /// A thread is draining `outbox`.
    dispatching: bool,
}

impl SessionState {
    fn new(max_pending: usize) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            epoch: 0,
            handshake_complete: false,
            connection: None,
            queue: PendingQueue::new(max_pending),
            reconnect_attempt: 0,
            retry: RetryScheduler::new(),
            targets: Vec::new(),
            last_url: None,
            dial_serial: 0,
            dial_origin: DialOrigin::Explicit,
            explicit_close: false,
            handshake_waiter: None,
            frame_serial: 0,
            outbox: VecDeque::new(),
            dispatching: false,
        }
    }

    /// Retry order: the last good URL first, then the rest.
    fn retry_targets(&self) -> Vec<String> {
        let mut targets = Vec::with_capacity(self.targets.len());
        if let Some(url) = &self.last_url {
            targets.push(url.clone());
        }
        for url in &self.targets {
            if !targets.contains(url) {
                targets.push(url.clone());
            }
        }
        targets
    }

    /// Whether the live connection belongs to `epoch`.
    fn owns(&self, epoch: u64) -> bool {
        self.connection.as_ref().is_some_and(|c| c.epoch() == epoch)
    }

    fn publish(&mut self, event: SessionEvent) {
        self.outbox.push_back(event);
    }

    fn fail_waiter(&mut self, err: SwaramError) {
        if let Some(waiter) = self.handshake_waiter.take() {
            let _ = waiter.send(Err(err));
        }
    }
}

struct SessionInner {
    config: SessionConfig,
    clock: MonotonicClock,
    state: Mutex<SessionState>,
    sinks: RwLock<EventSinks>,
    weak_self: Weak<SessionInner>,
}

/// Releases the dispatcher role if a sink panics mid-delivery.
struct DispatchGuard<'a>(&'a SessionInner);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().dispatching = false;
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

/// Cheap, cloneable handle to one session. Dropping the last handle
/// closes the active connection and stops any pending retry.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("Session")
            .field("phase", &st.phase)
            .field("epoch", &st.epoch)
            .field("pending", &st.queue.len())
            .field("retry_armed", &st.retry.is_armed())
            .finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let inner = Arc::new_cyclic(|weak_self| SessionInner {
            state: Mutex::new(SessionState::new(config.max_pending)),
            config,
            clock: MonotonicClock::new(),
            sinks: RwLock::new(EventSinks::default()),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Dial and complete the handshake. Resolves with the URL in use once
    /// the session is `Connected`.
    ///
    /// With `url == None` the configured candidates are tried in order;
    /// the first to accept wins. If all fail the call returns
    /// [`SwaramError::Dial`] and no retry is armed. Once a transport is
    /// open, later losses are handled by the reconnection policy.
    pub async fn connect(&self, url: Option<&str>) -> Result<String, SwaramError> {
        let targets = match url {
            Some(url) => vec![url.to_owned()],
            None => self.inner.config.candidate_urls.clone(),
        };
        if targets.is_empty() {
            return Err(SwaramError::Config("no candidate URLs configured".into()));
        }

        let (tx, rx) = oneshot::channel();
        let serial = {
            let mut guard = self.inner.lock();
            let st = &mut *guard;
            st.phase.begin_connect()?;
            st.explicit_close = false;
            st.retry.cancel();
            st.reconnect_attempt = 0;
            st.targets = targets.clone();
            st.dial_serial += 1;
            st.dial_origin = DialOrigin::Explicit;
            st.handshake_waiter = Some(tx);
            st.publish(SessionEvent::Connecting(ConnectingEvent {
                attempt: 0,
                candidates: targets.clone(),
            }));
            st.dial_serial
        };
        self.inner.dispatch();

        // The dial runs detached so that dropping this future cannot strand
        // the session in `Connecting`.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.dial_and_attach(serial, targets).await })
            .await
            .map_err(|e| SwaramError::Transport(format!("dial task failed: {e}")))??;

        rx.await.unwrap_or(Err(SwaramError::Cancelled))
    }

    /// Close with a normal-closure code, discard the pending queue and
    /// disarm any retry. Synchronous: when this returns no retry tied to
    /// the old epoch can dial.
    pub fn disconnect(&self) {
        {
            let mut guard = self.inner.lock();
            let st = &mut *guard;
            st.explicit_close = true;
            st.retry.cancel();
            st.dial_serial += 1;
            st.handshake_complete = false;
            let dropped = st.queue.clear();
            let url = st.connection.take().map(|conn| {
                conn.close();
                conn.url().to_owned()
            });
            st.fail_waiter(SwaramError::Cancelled);

            let previous = st.phase.force_disconnect();
            if !previous.is_disconnected() {
                info!(epoch = st.epoch, dropped, "session disconnected by client");
                let epoch = st.epoch;
                st.publish(SessionEvent::Disconnected(DisconnectEvent {
                    url,
                    epoch,
                    reason: DisconnectReason::ClientClosed,
                    reconnect: ReconnectPlan::NotPlanned,
                }));
            }
        }
        self.inner.dispatch();
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Direct send while `Connected`, otherwise queue (non-frames) or
    /// drop (frames). A failed direct send falls back to the queue.
    pub fn send_message(&self, msg: OutboundMessage) -> SendOutcome {
        let mut guard = self.inner.lock();
        SessionInner::send_or_queue(&mut guard, msg)
    }

    /// Send one captured frame. Returns `false` without queueing anything
    /// until the handshake has completed on the current connection.
    pub fn send_frame(&self, payload: Bytes, mode: DetectionMode) -> bool {
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        if !st.handshake_complete {
            debug!(phase = %st.phase, "frame rejected before handshake");
            return false;
        }
        st.frame_serial += 1;
        let frame_id = format!("frame_{}", st.frame_serial);
        let msg = OutboundMessage::Frame {
            frame: payload,
            mode,
            frame_id,
            timestamp: self.inner.clock.now(),
        };
        SessionInner::send_or_queue(st, msg).is_accepted()
    }

    pub fn send_control(&self, command: ControlCommand) -> SendOutcome {
        self.send_message(OutboundMessage::Control {
            command,
            timestamp: self.inner.clock.now(),
        })
    }

    pub fn change_mode(&self, mode: DetectionMode) -> SendOutcome {
        self.send_message(OutboundMessage::ModeChange {
            mode,
            timestamp: self.inner.clock.now(),
        })
    }

    pub fn ping(&self) -> SendOutcome {
        self.send_message(OutboundMessage::Ping {
            timestamp: self.inner.clock.now(),
        })
    }

    // ── Introspection ────────────────────────────────────────────

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.lock().phase.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().phase.is_connected()
    }

    pub fn handshake_complete(&self) -> bool {
        self.inner.lock().handshake_complete
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// URL of the open transport, if any.
    pub fn current_url(&self) -> Option<String> {
        self.inner
            .lock()
            .connection
            .as_ref()
            .map(|c| c.url().to_owned())
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.lock().reconnect_attempt
    }
}

// ── Sink registration ────────────────────────────────────────────

macro_rules! sink_registrations {
    ($($(#[$doc:meta])* $method:ident => $field:ident : $payload:ty;)*) => {
        impl Session {
            $(
                $(#[$doc])*
                pub fn $method<F>(&self, sink: F)
                where
                    F: Fn(&$payload) + Send + Sync + 'static,
                {
                    self.inner.sinks_mut().$field = Some(Arc::new(sink));
                }
            )*
        }
    };
}

sink_registrations! {
    /// Dialing started (explicit connect or a reconnect attempt).
    on_connecting => connecting: ConnectingEvent;
    /// Transport open, waiting for the server.
    on_handshaking => handshaking: HandshakingEvent;
    /// Handshake acknowledged.
    on_connected => connected: ConnectedEvent;
    /// Left any non-disconnected phase. Carries the reconnect plan.
    on_disconnected => disconnected: DisconnectEvent;
    /// Server greeting, for diagnostics. The handshake reply is automatic.
    on_welcome => welcome: Welcome;
    on_detection => detection: Detection;
    on_translation => translation: Translation;
    on_stats => stats: Stats;
    on_error => error: ServerError;
    on_mode_changed => mode_changed: ModeChanged;
    on_control_response => control_response: ControlResponse;
    on_health => health: Health;
    on_status => status: Status;
    on_pong => pong: Pong;
}

// ── SessionInner ─────────────────────────────────────────────────

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sinks_mut(&self) -> std::sync::RwLockWriteGuard<'_, EventSinks> {
        self.sinks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drain the outbox to the sinks without holding any lock during a
    /// call. If another thread is already draining, it delivers our events
    /// too, after the ones recorded before them.
    fn dispatch(&self) {
        {
            let mut st = self.lock();
            if st.dispatching {
                return;
            }
            st.dispatching = true;
        }
        let _unwind = DispatchGuard(self);
        loop {
            let event = {
                let mut st = self.lock();
                match st.outbox.pop_front() {
                    Some(event) => event,
                    None => {
                        st.dispatching = false;
                        return;
                    }
                }
            };
            let sinks = self
                .sinks
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            sinks.emit(&event);
        }
    }

    // ── Send path ────────────────────────────────────────────────

    fn send_or_queue(st: &mut SessionState, msg: OutboundMessage) -> SendOutcome {
        if st.phase.is_connected() {
            if let Some(conn) = st.connection.as_ref() {
                let text = match msg.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(kind = %msg.kind(), error = %e, "dropping unencodable record");
                        return SendOutcome::Dropped;
                    }
                };
                match conn.send_text(text) {
                    Ok(()) => return SendOutcome::Sent,
                    Err(e) => {
                        debug!(kind = %msg.kind(), error = %e, "direct send failed, queueing");
                    }
                }
            }
            return Self::enqueue(st, msg);
        }

        if msg.is_frame() {
            debug!(phase = %st.phase, "frame dropped while not connected");
            return SendOutcome::Dropped;
        }
        Self::enqueue(st, msg)
    }

    fn enqueue(st: &mut SessionState, msg: OutboundMessage) -> SendOutcome {
        if let Some(evicted) = st.queue.push(msg) {
            warn!(
                kind = %evicted.kind(),
                capacity = st.queue.capacity(),
                "pending queue full, evicted oldest record"
            );
        }
        SendOutcome::Queued
    }

    /// Drain the queue FIFO over the live connection. Stops at the first
    /// send failure; the remainder waits for the next connection.
    fn flush_pending(st: &mut SessionState) -> usize {
        let Some(conn) = st.connection.as_ref() else {
            return 0;
        };
        st.queue.flush(|msg| match msg.encode() {
            Ok(text) => conn.send_text(text),
            Err(e) => {
                error!(kind = %msg.kind(), error = %e, "dropping unencodable queued record");
                Ok(())
            }
        })
    }

    // ── Dialing ──────────────────────────────────────────────────

    fn dial_is_current(&self, serial: u64) -> bool {
        let st = self.lock();
        st.dial_serial == serial && matches!(st.phase, ConnectionPhase::Connecting)
    }

    /// Try each target in order; attach the first that opens.
    async fn dial_and_attach(
        self: Arc<Self>,
        serial: u64,
        targets: Vec<String>,
    ) -> Result<(), SwaramError> {
        let mut last_error = String::from("no candidates");
        for url in &targets {
            if !self.dial_is_current(serial) {
                return Err(SwaramError::Cancelled);
            }
            debug!(url = %url, "dialing");
            match network::dial(url, self.config.dial_timeout).await {
                Ok(stream) => return self.attach(serial, url.clone(), stream),
                Err(e) => {
                    warn!(url = %url, error = %e, "dial failed");
                    last_error = e.to_string();
                }
            }
        }

        let err = SwaramError::Dial {
            attempted: targets,
            last_error,
        };
        self.dial_failed(serial, &err);
        Err(err)
    }

    /// Install a freshly opened transport as the next epoch.
    fn attach(&self, serial: u64, url: String, stream: WsStream) -> Result<(), SwaramError> {
        let epoch = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.dial_serial != serial || !matches!(st.phase, ConnectionPhase::Connecting) {
                debug!(url = %url, "dial superseded, dropping transport");
                return Err(SwaramError::Cancelled);
            }
            st.phase.transport_open()?;
            st.epoch += 1;
            st.handshake_complete = false;
            let handler: Weak<dyn LinkHandler> = self.weak_self.clone();
            let epoch = st.epoch;
            // recorded before the reader starts, so it precedes any inbound event
            st.publish(SessionEvent::Handshaking(HandshakingEvent {
                url: url.clone(),
                epoch,
            }));
            st.connection = Some(Connection::spawn(stream, epoch, url.clone(), handler));
            info!(epoch, url = %url, "transport open, awaiting welcome");
            epoch
        };

        self.spawn_handshake_watchdog(epoch);
        if let Some(every) = self.config.keepalive() {
            self.spawn_keepalive(epoch, every);
        }
        self.dispatch();
        Ok(())
    }

    fn dial_failed(&self, serial: u64, err: &SwaramError) {
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.dial_serial != serial || !matches!(st.phase, ConnectionPhase::Connecting) {
                return;
            }
            st.phase.force_disconnect();
            // an explicit connect reports through its return value
            st.handshake_waiter.take();

            let reconnect = match st.dial_origin {
                DialOrigin::Explicit => ReconnectPlan::NotPlanned,
                DialOrigin::Retry => self.plan_retry(st),
            };
            let epoch = st.epoch;
            st.publish(SessionEvent::Disconnected(DisconnectEvent {
                url: None,
                epoch,
                reason: DisconnectReason::DialFailed(err.to_string()),
                reconnect,
            }));
        }
        self.dispatch();
    }

    // ── Reconnection ─────────────────────────────────────────────

    /// Arm the next retry, or report exhaustion. Caller holds the lock.
    fn plan_retry(&self, st: &mut SessionState) -> ReconnectPlan {
        if st.explicit_close {
            return ReconnectPlan::NotPlanned;
        }
        let policy = &self.config.reconnect;
        let attempt = st.reconnect_attempt;
        if !policy.allows(attempt) {
            warn!(attempts = attempt, "reconnect attempts exhausted");
            return ReconnectPlan::Exhausted;
        }
        let delay = policy.delay_for(attempt);
        let ticket = st.retry.schedule(st.epoch, attempt);
        info!(attempt = attempt + 1, ?delay, "reconnect scheduled");
        self.spawn_retry_timer(ticket, delay);
        ReconnectPlan::Scheduled {
            attempt: attempt + 1,
            delay,
        }
    }

    fn spawn_retry_timer(&self, ticket: RetryTicket, delay: Duration) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire_retry(ticket);
            }
        });
    }

    fn fire_retry(self: Arc<Self>, ticket: RetryTicket) {
        let (serial, targets, attempt) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let epoch = st.epoch;
            if !st.retry.claim(ticket, epoch) {
                debug!(
                    ticket_epoch = ticket.epoch,
                    epoch, "stale reconnect timer ignored"
                );
                return;
            }
            if st.explicit_close || st.phase.begin_connect().is_err() {
                debug!(phase = %st.phase, "reconnect timer fired outside Disconnected");
                return;
            }
            st.reconnect_attempt += 1;
            st.dial_serial += 1;
            st.dial_origin = DialOrigin::Retry;
            let targets = st.retry_targets();
            st.publish(SessionEvent::Connecting(ConnectingEvent {
                attempt: st.reconnect_attempt,
                candidates: targets.clone(),
            }));
            (st.dial_serial, targets, st.reconnect_attempt)
        };

        info!(attempt, "reconnecting");
        self.dispatch();
        tokio::spawn(async move {
            // failures are reported through dial_failed
            let _ = self.dial_and_attach(serial, targets).await;
        });
    }

    /// Tear down the current epoch after a transport-level loss.
    fn lose_connection(
        &self,
        st: &mut SessionState,
        reason: DisconnectReason,
        err: SwaramError,
    ) {
        let url = st.connection.take().map(|conn| {
            conn.close();
            conn.url().to_owned()
        });
        st.phase.force_disconnect();
        st.handshake_complete = false;
        st.fail_waiter(err);
        let reconnect = self.plan_retry(st);
        let epoch = st.epoch;
        st.publish(SessionEvent::Disconnected(DisconnectEvent {
            url,
            epoch,
            reason,
            reconnect,
        }));
    }

    // ── Per-epoch tasks ──────────────────────────────────────────

    fn spawn_handshake_watchdog(&self, epoch: u64) {
        let weak = self.weak_self.clone();
        let timeout = self.config.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.handshake_expired(epoch, timeout);
            }
        });
    }

    fn handshake_expired(&self, epoch: u64, timeout: Duration) {
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.epoch != epoch || !st.phase.is_handshaking() {
                return;
            }
            warn!(epoch, ?timeout, "handshake timed out");
            self.lose_connection(
                st,
                DisconnectReason::HandshakeTimeout,
                SwaramError::HandshakeTimeout(timeout),
            );
        }
        self.dispatch();
    }

    fn spawn_keepalive(&self, epoch: u64, every: Duration) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.keepalive_tick(epoch) {
                    break;
                }
            }
        });
    }

    /// Returns `false` once the epoch has ended.
    fn keepalive_tick(&self, epoch: u64) -> bool {
        let mut guard = self.lock();
        let st = &mut *guard;
        if !st.connection.as_ref().is_some_and(|c| c.epoch() == epoch && !c.is_closed()) {
            return false;
        }
        if st.phase.is_connected() {
            let ping = OutboundMessage::Ping {
                timestamp: self.clock.now(),
            };
            Self::send_or_queue(st, ping);
        }
        true
    }

    // ── Inbound ──────────────────────────────────────────────────

    fn on_welcome(&self, st: &mut SessionState, welcome: Welcome) {
        if !matches!(st.phase, ConnectionPhase::Handshaking { greeted: false }) {
            warn!(phase = %st.phase, "unexpected welcome");
            st.publish(SessionEvent::Welcome(welcome));
            return;
        }

        let info = &self.config.client;
        let handshake = OutboundMessage::Handshake {
            client: info.client_id.clone(),
            platform: info.platform.clone(),
            version: info.version.clone(),
            timestamp: self.clock.now(),
        };
        let sent = match (handshake.encode(), st.connection.as_ref()) {
            (Ok(text), Some(conn)) => conn.send_text(text),
            (Err(e), _) => Err(e),
            (_, None) => Err(SwaramError::Transport("no connection".into())),
        };
        if let Err(e) = sent {
            // the transport is closing; its close callback handles the rest
            warn!(error = %e, "could not send handshake");
            return;
        }
        if let Err(e) = st.phase.greeted() {
            warn!(error = %e, "handshake state out of sync");
            return;
        }
        debug!(epoch = st.epoch, "welcome received, handshake sent");
        st.publish(SessionEvent::Welcome(welcome));
    }

    fn on_handshake_ack(&self, st: &mut SessionState, _ack: HandshakeAck) {
        if let Err(e) = st.phase.complete_handshake() {
            warn!(error = %e, "handshake_ack out of order, ignored");
            return;
        }
        st.handshake_complete = true;
        st.reconnect_attempt = 0;
        st.retry.cancel();

        let url = st
            .connection
            .as_ref()
            .map(|c| c.url().to_owned())
            .unwrap_or_default();
        st.last_url = Some(url.clone());
        let flushed = Self::flush_pending(st);
        info!(epoch = st.epoch, url = %url, flushed, "session connected");

        if let Some(waiter) = st.handshake_waiter.take() {
            let _ = waiter.send(Ok(url.clone()));
        }
        let epoch = st.epoch;
        st.publish(SessionEvent::Connected(ConnectedEvent {
            url,
            epoch,
            flushed,
        }));
    }
}

impl LinkHandler for SessionInner {
    fn on_text(&self, epoch: u64, text: &str) {
        let message = match InboundMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(epoch, error = %e, "dropping malformed record");
                return;
            }
        };

        {
            let mut guard = self.lock();
            let st = &mut *guard;
            if !st.owns(epoch) {
                debug!(epoch, current = st.epoch, "record from stale connection");
                return;
            }
            match message {
                InboundMessage::Welcome(w) => self.on_welcome(st, w),
                InboundMessage::HandshakeAck(ack) => self.on_handshake_ack(st, ack),
                InboundMessage::Unknown(tag) => {
                    debug!(epoch, tag = %tag, "ignoring record with unknown type");
                }
                other => st.outbox.extend(SessionEvent::from_inbound(other)),
            }
        }
        self.dispatch();
    }

    fn on_closed(&self, epoch: u64, cause: CloseCause) {
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            if !st.owns(epoch) {
                debug!(epoch, "close from stale connection");
                return;
            }
            warn!(epoch, %cause, "connection lost");
            let err = SwaramError::Transport(cause.to_string());
            let reason = match cause {
                CloseCause::Remote { code, reason } => DisconnectReason::ServerClosed { code, reason },
                CloseCause::Error(e) => DisconnectReason::Transport(e),
            };
            self.lose_connection(st, reason, err);
        }
        self.dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use crate::message::OutboundKind;

    fn session() -> Session {
        Session::new(SessionConfig {
            candidate_urls: vec![],
            ..Default::default()
        })
    }

    #[test]
    fn frames_rejected_before_handshake() {
        let s = session();
        assert!(!s.send_frame(Bytes::from_static(b"jpeg"), DetectionMode::Both));
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn control_queues_while_disconnected() {
        let s = session();
        assert_eq!(s.send_control(ControlCommand::Start), SendOutcome::Queued);
        assert_eq!(s.change_mode(DetectionMode::Lip), SendOutcome::Queued);
        assert_eq!(s.pending_len(), 2);
    }

    #[test]
    fn frame_message_dropped_while_disconnected() {
        let s = session();
        let frame = OutboundMessage::Frame {
            frame: Bytes::from_static(b"x"),
            mode: DetectionMode::Sign,
            frame_id: "f".into(),
            timestamp: 0.0,
        };
        assert_eq!(s.send_message(frame), SendOutcome::Dropped);
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn disconnect_clears_queue_and_is_silent_when_idle() {
        let s = session();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        s.on_disconnected(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        s.send_control(ControlCommand::Pause);
        s.disconnect();
        assert_eq!(s.pending_len(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connect_without_candidates_is_config_error() {
        let s = session();
        let err = s.connect(None).await.unwrap_err();
        assert!(matches!(err, SwaramError::Config(_)));
        assert!(s.phase().is_disconnected());
    }

    #[tokio::test]
    async fn failed_explicit_dial_reports_once_without_retry() {
        let s = session();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&events);
        s.on_disconnected(move |ev| e.lock().unwrap().push(ev.clone()));

        let closed = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let err = s
            .connect(Some(&format!("ws://{closed}")))
            .await
            .unwrap_err();
        assert!(matches!(err, SwaramError::Dial { .. }));
        assert!(s.phase().is_disconnected());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reconnect, ReconnectPlan::NotPlanned);
        assert!(matches!(events[0].reason, DisconnectReason::DialFailed(_)));
    }

    fn control(command: ControlCommand) -> OutboundMessage {
        OutboundMessage::Control {
            command,
            timestamp: 1.0,
        }
    }

    /// State as it stands once the handshake on `conn` has completed.
    fn connected_state(conn: Connection) -> SessionState {
        let mut st = SessionState::new(8);
        st.phase.begin_connect().unwrap();
        st.phase.transport_open().unwrap();
        st.phase.greeted().unwrap();
        st.phase.complete_handshake().unwrap();
        st.epoch = conn.epoch();
        st.handshake_complete = true;
        st.connection = Some(conn);
        st
    }

    #[test]
    fn failed_direct_send_falls_back_to_queue() {
        let (conn, _rx) = Connection::detached(1, "ws://test");
        let mut st = connected_state(conn);
        st.connection.as_ref().unwrap().close();

        let outcome = SessionInner::send_or_queue(&mut st, control(ControlCommand::Pause));
        assert_eq!(outcome, SendOutcome::Queued);

        // frames follow the same fallback while Connected
        let frame = OutboundMessage::Frame {
            frame: Bytes::from_static(b"x"),
            mode: DetectionMode::Sign,
            frame_id: "frame_1".into(),
            timestamp: 2.0,
        };
        assert_eq!(SessionInner::send_or_queue(&mut st, frame), SendOutcome::Queued);
        let kinds: Vec<_> = st.queue.iter().map(OutboundMessage::kind).collect();
        assert_eq!(kinds, vec![OutboundKind::Control, OutboundKind::Frame]);
    }

    #[test]
    fn live_send_goes_straight_to_writer() {
        let (conn, mut rx) = Connection::detached(1, "ws://test");
        let mut st = connected_state(conn);

        let outcome = SessionInner::send_or_queue(&mut st, control(ControlCommand::Start));
        assert_eq!(outcome, SendOutcome::Sent);
        assert!(st.queue.is_empty());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn flush_delivers_oldest_first() {
        let (conn, mut rx) = Connection::detached(1, "ws://test");
        let mut st = connected_state(conn);
        for command in [ControlCommand::Start, ControlCommand::Pause, ControlCommand::Resume] {
            st.queue.push(control(command));
        }

        assert_eq!(SessionInner::flush_pending(&mut st), 3);
        assert!(st.queue.is_empty());
        let mut commands = Vec::new();
        while let Ok(WsMessage::Text(text)) = rx.try_recv() {
            let record: serde_json::Value = serde_json::from_str(&text).unwrap();
            commands.push(record["command"].as_str().unwrap().to_owned());
        }
        assert_eq!(commands, vec!["start", "pause", "resume"]);
    }

    #[test]
    fn flush_over_closed_connection_keeps_queue_in_order() {
        let (conn, _rx) = Connection::detached(1, "ws://test");
        let mut st = connected_state(conn);
        st.queue.push(control(ControlCommand::Start));
        st.queue.push(OutboundMessage::Ping { timestamp: 2.0 });
        st.connection.as_ref().unwrap().close();

        assert_eq!(SessionInner::flush_pending(&mut st), 0);
        let stamps: Vec<f64> = st.queue.iter().map(OutboundMessage::timestamp).collect();
        assert_eq!(stamps, vec![1.0, 2.0]);
    }

    #[test]
    fn sink_may_register_sinks_and_call_back() {
        let s = session();
        let hits = Arc::new(AtomicUsize::new(0));
        let (inner_s, h) = (s.clone(), Arc::clone(&hits));
        s.on_disconnected(move |_| {
            let h = Arc::clone(&h);
            inner_s.on_connected(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            });
            inner_s.disconnect();
        });

        let (conn, _rx) = Connection::detached(3, "ws://test");
        *s.inner.lock() = connected_state(conn);
        s.disconnect();

        assert!(s.phase().is_disconnected());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn events_leave_in_transition_order() {
        let s = session();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        s.on_handshaking(move |_| o.lock().unwrap().push("handshaking"));
        let o = Arc::clone(&order);
        s.on_welcome(move |_| o.lock().unwrap().push("welcome"));
        let o = Arc::clone(&order);
        s.on_connected(move |_| o.lock().unwrap().push("connected"));

        // a handshaking event still waiting in the outbox when the
        // reader delivers welcome and ack
        let (conn, mut rx) = Connection::detached(1, "ws://test");
        {
            let mut st = s.inner.lock();
            st.phase.begin_connect().unwrap();
            st.phase.transport_open().unwrap();
            st.epoch = 1;
            st.connection = Some(conn);
            st.publish(SessionEvent::Handshaking(HandshakingEvent {
                url: "ws://test".into(),
                epoch: 1,
            }));
        }
        s.inner.on_text(1, r#"{"type":"welcome"}"#);
        assert!(rx.try_recv().is_ok());
        s.inner.on_text(1, r#"{"type":"handshake_ack"}"#);

        assert!(s.is_connected());
        assert_eq!(*order.lock().unwrap(), vec!["handshaking", "welcome", "connected"]);
    }

    #[tokio::test]
    async fn stale_link_callbacks_are_ignored() {
        let s = session();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        s.on_detection(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        // no connection exists for epoch 7
        s.inner.on_text(7, r#"{"type":"detection","detection":{}}"#);
        s.inner.on_closed(7, CloseCause::Error("boom".into()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(s.phase().is_disconnected());
    }
}
