//! Frame-rate pacing with single-capture backpressure.
//!
//! The [`CaptureLoop`] ticks at the configured rate and starts at most one
//! capture at a time. A tick that finds a capture still in flight is
//! skipped, so a slow camera lowers the effective frame rate instead of
//! building a backlog.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{CaptureError, SwaramError};
use crate::message::DetectionMode;
use crate::session::Session;

// ── Collaborators ────────────────────────────────────────────────

/// Produces one compressed frame per call. Never called concurrently by
/// the same loop.
#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    async fn capture(&self) -> Result<Bytes, CaptureError>;
}

/// Accepts captured frames. `true` means sent or queued, not delivered.
pub trait FrameSink: Send + Sync + 'static {
    fn send_frame(&self, payload: Bytes, mode: DetectionMode) -> bool;
}

impl FrameSink for Session {
    fn send_frame(&self, payload: Bytes, mode: DetectionMode) -> bool {
        Session::send_frame(self, payload, mode)
    }
}

// ── CaptureConfig ────────────────────────────────────────────────

/// Configuration for [`CaptureLoop`].
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Target frames per second (1..=60).
    pub frame_rate_hz: u32,
    /// Detection mode stamped on every frame.
    pub mode: DetectionMode,
    /// A capture running longer than this counts as failed.
    pub capture_timeout: Duration,
    /// Stop after this many consecutive frames the sink refused.
    pub max_rejected_streak: Option<u32>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_rate_hz: 10,
            mode: DetectionMode::Both,
            capture_timeout: Duration::from_secs(2),
            max_rejected_streak: None,
        }
    }
}

fn frame_interval(hz: u32) -> Duration {
    Duration::from_secs_f64(1.0 / hz.clamp(1, 60) as f64)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Settings {
    interval: Duration,
    mode: DetectionMode,
}

// ── CaptureStats ─────────────────────────────────────────────────

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Captures forwarded to the sink.
    pub frame_count: u64,
    /// Frames the sink accepted.
    pub frames_sent: u64,
    /// Frames the sink refused.
    pub rejected: u64,
    /// Ticks skipped because a capture was in flight.
    pub skipped_busy: u64,
    /// Ticks skipped because they arrived sooner than one interval.
    pub skipped_early: u64,
    /// Captures that failed or timed out.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frame_count: AtomicU64,
    frames_sent: AtomicU64,
    rejected: AtomicU64,
    skipped_busy: AtomicU64,
    skipped_early: AtomicU64,
    failures: AtomicU64,
    rejected_streak: AtomicU32,
}

impl Counters {
    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frame_count: self.frame_count.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            skipped_busy: self.skipped_busy.load(Ordering::Relaxed),
            skipped_early: self.skipped_early.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Clears the in-flight flag however the capture task ends.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ── CaptureLoop ──────────────────────────────────────────────────

/// Paces a [`FrameSource`] into a [`FrameSink`].
///
/// # Lifetime
///
/// [`run`](Self::run) drives the loop until [`stop`](Self::stop) is called
/// (from any task) or the rejected-frame policy trips. Mode and frame rate
/// may be changed while running.
pub struct CaptureLoop {
    source: Arc<dyn FrameSource>,
    sink: Arc<dyn FrameSink>,
    capture_timeout: Duration,
    max_rejected_streak: Option<u32>,
    settings: watch::Sender<Settings>,
    in_flight: Arc<AtomicBool>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
}

impl CaptureLoop {
    pub fn new(
        source: Arc<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
        config: CaptureConfig,
    ) -> Self {
        let (settings, _) = watch::channel(Settings {
            interval: frame_interval(config.frame_rate_hz),
            mode: config.mode,
        });
        Self {
            source,
            sink,
            capture_timeout: config.capture_timeout,
            max_rejected_streak: config.max_rejected_streak,
            settings,
            in_flight: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Whether a capture is outstanding right now.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> DetectionMode {
        self.settings.borrow().mode
    }

    pub fn frame_interval(&self) -> Duration {
        self.settings.borrow().interval
    }

    /// Applies to the next capture.
    pub fn set_mode(&self, mode: DetectionMode) {
        self.settings.send_modify(|s| s.mode = mode);
    }

    /// Clamped to 1..=60. Restarts the tick schedule.
    pub fn set_frame_rate(&self, hz: u32) {
        let interval = frame_interval(hz);
        self.settings.send_if_modified(|s| {
            let changed = s.interval != interval;
            s.interval = interval;
            changed
        });
    }

    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    pub fn frame_count(&self) -> u64 {
        self.counters.frame_count.load(Ordering::Relaxed)
    }

    /// Run until stopped.
    ///
    /// Returns [`SwaramError::Cancelled`] if the rejected-frame policy
    /// stopped the loop, `Ok(())` on an explicit stop.
    pub async fn run(&self) -> Result<(), SwaramError> {
        let mut settings_rx = self.settings.subscribe();
        let mut interval = settings_rx.borrow_and_update().interval;
        let mut ticker = Self::ticker(Instant::now(), interval);
        let mut last_started: Option<Instant> = None;

        info!(?interval, mode = %self.mode(), "capture loop started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = settings_rx.borrow_and_update().interval;
                    if next != interval {
                        debug!(from = ?interval, to = ?next, "frame interval changed");
                        interval = next;
                        ticker = Self::ticker(Instant::now() + interval, interval);
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }
            self.on_tick(interval, &mut last_started);
        }

        let stats = self.stats();
        info!(
            frames = stats.frame_count,
            busy = stats.skipped_busy,
            early = stats.skipped_early,
            failures = stats.failures,
            "capture loop stopped"
        );
        match self.max_rejected_streak {
            Some(limit) if self.counters.rejected_streak.load(Ordering::Relaxed) >= limit => {
                Err(SwaramError::Cancelled)
            }
            _ => Ok(()),
        }
    }

    fn ticker(start: Instant, period: Duration) -> tokio::time::Interval {
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    /// `last_started` is when the previous capture actually began, which a
    /// late tick pushes back from its scheduled instant.
    fn on_tick(&self, interval: Duration, last_started: &mut Option<Instant>) {
        let now = Instant::now();
        if self.in_flight.load(Ordering::Acquire) {
            self.counters.skipped_busy.fetch_add(1, Ordering::Relaxed);
            trace!("capture in flight, tick skipped");
            return;
        }
        if let Some(prev) = *last_started {
            if now.saturating_duration_since(prev) < interval {
                self.counters.skipped_early.fetch_add(1, Ordering::Relaxed);
                trace!("tick arrived early, skipped");
                return;
            }
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.counters.skipped_busy.fetch_add(1, Ordering::Relaxed);
            return;
        }
        *last_started = Some(now);

        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let source = Arc::clone(&self.source);
        let sink = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);
        let shutdown = self.shutdown.clone();
        let timeout = self.capture_timeout;
        let limit = self.max_rejected_streak;
        let mode = self.mode();

        tokio::spawn(async move {
            let _guard = guard;
            let captured = match tokio::time::timeout(timeout, source.capture()).await {
                Ok(result) => result,
                Err(_) => Err(CaptureError::Timeout(timeout)),
            };

            let payload = match captured {
                Ok(payload) => payload,
                Err(e) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "capture failed, skipping cycle");
                    return;
                }
            };

            if shutdown.is_cancelled() {
                trace!("capture finished after stop, frame discarded");
                return;
            }
            let n = counters.frame_count.fetch_add(1, Ordering::Relaxed) + 1;
            if sink.send_frame(payload, mode) {
                counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                counters.rejected_streak.store(0, Ordering::Relaxed);
                trace!(frame = n, %mode, "frame forwarded");
                return;
            }

            counters.rejected.fetch_add(1, Ordering::Relaxed);
            let streak = counters.rejected_streak.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(frame = n, streak, "frame rejected by session");
            if let Some(limit) = limit {
                if streak >= limit && !shutdown.is_cancelled() {
                    warn!(streak, "session refusing frames, stopping capture");
                    shutdown.cancel();
                }
            }
        });
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sleeps `delay` per capture and records peak concurrency.
    struct SlowSource {
        delay: Duration,
        active: AtomicU32,
        peak: AtomicU32,
        calls: AtomicU32,
    }

    impl SlowSource {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                active: AtomicU32::new(0),
                peak: AtomicU32::new(0),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl FrameSource for SlowSource {
        async fn capture(&self) -> Result<Bytes, CaptureError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"\xff\xd8jpeg"))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl FrameSource for FailingSource {
        async fn capture(&self) -> Result<Bytes, CaptureError> {
            Err(CaptureError::Unavailable("camera busy".into()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        accept: bool,
        modes: Mutex<Vec<DetectionMode>>,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, _payload: Bytes, mode: DetectionMode) -> bool {
            self.modes.lock().unwrap().push(mode);
            self.accept
        }
    }

    fn accepting() -> Arc<RecordingSink> {
        Arc::new(RecordingSink {
            accept: true,
            ..Default::default()
        })
    }

    fn config(hz: u32) -> CaptureConfig {
        CaptureConfig {
            frame_rate_hz: hz,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_never_overlaps() {
        // 10 Hz ticks, 350 ms captures
        let source = Arc::new(SlowSource::new(Duration::from_millis(350)));
        let sink = accepting();
        let capture = Arc::new(CaptureLoop::new(source.clone(), sink.clone(), config(10)));

        let runner = Arc::clone(&capture);
        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_secs(2)).await;
        capture.stop();
        task.await.unwrap().unwrap();

        assert_eq!(source.peak.load(Ordering::SeqCst), 1);
        let stats = capture.stats();
        assert!(stats.skipped_busy > 0);
        assert!(stats.frame_count >= 4, "{stats:?}");
        assert!(u64::from(source.calls.load(Ordering::SeqCst)) <= stats.frame_count + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_source_runs_at_configured_rate() {
        let source = Arc::new(SlowSource::new(Duration::from_millis(1)));
        let sink = accepting();
        let capture = Arc::new(CaptureLoop::new(source, sink.clone(), config(5)));

        let runner = Arc::clone(&capture);
        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        capture.stop();
        task.await.unwrap().unwrap();

        // ticks at 0, 200, 400, 600, 800, 1000 ms
        assert_eq!(capture.stats().frames_sent, 6);
        assert_eq!(capture.stats().skipped_busy, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_and_loop_keeps_ticking() {
        let capture = Arc::new(CaptureLoop::new(
            Arc::new(FailingSource),
            accepting(),
            config(10),
        ));

        let runner = Arc::clone(&capture);
        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(450)).await;
        capture.stop();
        task.await.unwrap().unwrap();

        let stats = capture.stats();
        assert_eq!(stats.failures, 5);
        assert_eq!(stats.frame_count, 0);
        assert!(!capture.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn capture_timeout_clears_in_flight() {
        let source = Arc::new(SlowSource::new(Duration::from_secs(60)));
        let capture = Arc::new(CaptureLoop::new(
            source,
            accepting(),
            CaptureConfig {
                frame_rate_hz: 10,
                capture_timeout: Duration::from_millis(250),
                ..Default::default()
            },
        ));

        let runner = Arc::clone(&capture);
        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        capture.stop();
        task.await.unwrap().unwrap();

        assert!(capture.stats().failures >= 2);
        assert_eq!(capture.stats().frame_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_streak_stops_loop() {
        let sink = Arc::new(RecordingSink::default());
        let capture = Arc::new(CaptureLoop::new(
            Arc::new(SlowSource::new(Duration::from_millis(1))),
            sink.clone(),
            CaptureConfig {
                frame_rate_hz: 10,
                max_rejected_streak: Some(3),
                ..Default::default()
            },
        ));

        let result = tokio::time::timeout(Duration::from_secs(5), capture.run()).await;
        assert!(matches!(result, Ok(Err(SwaramError::Cancelled))));
        assert_eq!(capture.stats().rejected, 3);
        assert!(capture.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn mode_change_applies_to_next_frame() {
        let sink = accepting();
        let capture = Arc::new(CaptureLoop::new(
            Arc::new(SlowSource::new(Duration::from_millis(1))),
            sink.clone(),
            config(10),
        ));

        let runner = Arc::clone(&capture);
        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        capture.set_mode(DetectionMode::Sign);
        tokio::time::sleep(Duration::from_millis(100)).await;
        capture.stop();
        task.await.unwrap().unwrap();

        let modes = sink.modes.lock().unwrap().clone();
        assert_eq!(modes, vec![DetectionMode::Both, DetectionMode::Sign]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_tick_does_not_crowd_next_capture() {
        // 10 Hz; captures start at 0 and 100 ms
        let sink = accepting();
        let capture = Arc::new(CaptureLoop::new(
            Arc::new(SlowSource::new(Duration::from_millis(1))),
            sink.clone(),
            config(10),
        ));

        let runner = Arc::clone(&capture);
        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(190)).await;

        // stall: the 200 ms tick is observed at 340 ms, the next at 400 ms
        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::time::sleep(Duration::from_millis(110)).await;
        capture.stop();
        task.await.unwrap().unwrap();

        let stats = capture.stats();
        assert_eq!(stats.skipped_early, 1, "{stats:?}");
        assert_eq!(stats.frame_count, 3, "{stats:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn capture_in_flight_at_stop_is_not_forwarded() {
        let sink = accepting();
        let capture = Arc::new(CaptureLoop::new(
            Arc::new(SlowSource::new(Duration::from_millis(300))),
            sink.clone(),
            config(1),
        ));

        let runner = Arc::clone(&capture);
        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(capture.is_in_flight());
        capture.stop();
        task.await.unwrap().unwrap();

        // let the capture finish
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!capture.is_in_flight());
        assert!(sink.modes.lock().unwrap().is_empty());
        assert_eq!(capture.stats().frame_count, 0);
    }

    #[test]
    fn frame_rate_is_clamped() {
        let capture = CaptureLoop::new(Arc::new(FailingSource), accepting(), config(0));
        assert_eq!(capture.frame_interval(), Duration::from_secs(1));
        capture.set_frame_rate(500);
        assert_eq!(capture.frame_interval(), Duration::from_secs_f64(1.0 / 60.0));
    }
}
