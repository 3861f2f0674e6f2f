//! Reconnection backoff and the epoch-checked retry scheduler.
//!
//! A retry is never cancelled by aborting its timer. Each armed retry is
//! identified by a [`RetryTicket`] that records the epoch it was armed in;
//! when the timer fires the ticket is presented back to the scheduler and
//! only honoured if it is still the armed one and the epoch has not moved.

use std::time::Duration;

/// Exponential backoff with a cap and an attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether retry number `attempt` (zero-based) is within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Identity of one armed retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTicket {
    /// Session epoch when the retry was armed.
    pub epoch: u64,
    /// Zero-based retry number.
    pub attempt: u32,
    serial: u64,
}

/// Holds at most one armed retry.
#[derive(Debug, Default)]
pub struct RetryScheduler {
    armed: Option<RetryTicket>,
    next_serial: u64,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a retry, replacing any previously armed one.
    pub fn schedule(&mut self, epoch: u64, attempt: u32) -> RetryTicket {
        self.next_serial += 1;
        let ticket = RetryTicket {
            epoch,
            attempt,
            serial: self.next_serial,
        };
        self.armed = Some(ticket);
        ticket
    }

    /// Disarm. A timer already sleeping on the old ticket becomes a no-op.
    pub fn cancel(&mut self) -> Option<RetryTicket> {
        self.armed.take()
    }

    /// Consume the armed retry if `ticket` is still current.
    ///
    /// Returns `false` (and leaves the scheduler untouched) when the ticket
    /// was replaced or cancelled, or when the session epoch has advanced
    /// since it was armed.
    pub fn claim(&mut self, ticket: RetryTicket, current_epoch: u64) -> bool {
        match self.armed {
            Some(armed) if armed == ticket && ticket.epoch == current_epoch => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(1), Duration::from_millis(1500));
        assert_eq!(p.delay_for(2), Duration::from_millis(2250));
        assert_eq!(p.delay_for(20), Duration::from_secs(30));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn budget() {
        let p = ReconnectPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        assert!(p.allows(0));
        assert!(p.allows(1));
        assert!(!p.allows(2));
    }

    #[test]
    fn claim_honours_current_ticket_once() {
        let mut s = RetryScheduler::new();
        let t = s.schedule(4, 0);
        assert!(s.claim(t, 4));
        assert!(!s.claim(t, 4));
        assert!(!s.is_armed());
    }

    #[test]
    fn stale_epoch_is_rejected() {
        let mut s = RetryScheduler::new();
        let t = s.schedule(4, 0);
        assert!(!s.claim(t, 5));
        // still armed: a mismatched claim does not consume
        assert!(s.is_armed());
    }

    #[test]
    fn rescheduling_invalidates_previous_ticket() {
        let mut s = RetryScheduler::new();
        let first = s.schedule(1, 0);
        let second = s.schedule(1, 1);
        assert!(!s.claim(first, 1));
        assert!(s.claim(second, 1));
    }

    #[test]
    fn cancelled_ticket_is_noop() {
        let mut s = RetryScheduler::new();
        let t = s.schedule(2, 0);
        assert_eq!(s.cancel(), Some(t));
        assert!(!s.claim(t, 2));
    }
}
