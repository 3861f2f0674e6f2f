//! Ordered buffer of outbound records waiting for a connected session.

use std::collections::VecDeque;

use tracing::warn;

use crate::error::SwaramError;
use crate::message::OutboundMessage;

/// FIFO of not-yet-sent records. Insertion order is delivery order.
///
/// Bounded: pushing onto a full queue evicts the oldest entry.
#[derive(Debug)]
pub struct PendingQueue {
    items: VecDeque<OutboundMessage>,
    capacity: usize,
    evicted: u64,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    /// Append a record. Returns the evicted head when the queue was full.
    pub fn push(&mut self, msg: OutboundMessage) -> Option<OutboundMessage> {
        let evicted = if self.items.len() >= self.capacity {
            self.evicted += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(msg);
        evicted
    }

    pub fn front(&self) -> Option<&OutboundMessage> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<OutboundMessage> {
        self.items.pop_front()
    }

    /// Offer records to `send` oldest first, removing each one it takes.
    ///
    /// Stops at the first error; that record and everything behind it stay
    /// queued in their original order. Returns how many were taken.
    pub fn flush<F>(&mut self, mut send: F) -> usize
    where
        F: FnMut(&OutboundMessage) -> Result<(), SwaramError>,
    {
        let mut taken = 0;
        while let Some(msg) = self.items.front() {
            if let Err(e) = send(msg) {
                warn!(error = %e, remaining = self.items.len(), "flush interrupted");
                break;
            }
            self.items.pop_front();
            taken += 1;
        }
        taken
    }

    /// Drop everything. Returns how many records were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total records evicted by overflow since construction.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ControlCommand, DetectionMode};

    fn control(command: ControlCommand, timestamp: f64) -> OutboundMessage {
        OutboundMessage::Control { command, timestamp }
    }

    #[test]
    fn preserves_insertion_order() {
        let mut q = PendingQueue::new(8);
        q.push(control(ControlCommand::Start, 1.0));
        q.push(OutboundMessage::ModeChange {
            mode: DetectionMode::Lip,
            timestamp: 2.0,
        });
        q.push(control(ControlCommand::Pause, 3.0));

        let stamps: Vec<f64> = q.iter().map(OutboundMessage::timestamp).collect();
        assert_eq!(stamps, vec![1.0, 2.0, 3.0]);
        assert_eq!(q.pop_front().unwrap().timestamp(), 1.0);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut q = PendingQueue::new(2);
        assert!(q.push(control(ControlCommand::Start, 1.0)).is_none());
        assert!(q.push(control(ControlCommand::Stop, 2.0)).is_none());
        let evicted = q.push(control(ControlCommand::Resume, 3.0)).unwrap();
        assert_eq!(evicted.timestamp(), 1.0);
        assert_eq!(q.front().unwrap().timestamp(), 2.0);
        assert_eq!(q.evicted(), 1);
    }

    #[test]
    fn flush_stops_at_first_failure() {
        let mut q = PendingQueue::new(8);
        for (i, command) in [
            ControlCommand::Start,
            ControlCommand::Pause,
            ControlCommand::Resume,
            ControlCommand::Stop,
        ]
        .into_iter()
        .enumerate()
        {
            q.push(control(command, i as f64));
        }

        let mut delivered = Vec::new();
        let taken = q.flush(|msg| {
            if delivered.len() == 2 {
                return Err(SwaramError::Transport("writer task has exited".into()));
            }
            delivered.push(msg.timestamp());
            Ok(())
        });

        assert_eq!(taken, 2);
        assert_eq!(delivered, vec![0.0, 1.0]);
        let left: Vec<f64> = q.iter().map(OutboundMessage::timestamp).collect();
        assert_eq!(left, vec![2.0, 3.0]);
    }

    #[test]
    fn clear_reports_count() {
        let mut q = PendingQueue::new(4);
        q.push(control(ControlCommand::Start, 1.0));
        q.push(control(ControlCommand::Stop, 2.0));
        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let q = PendingQueue::new(0);
        assert_eq!(q.capacity(), 1);
    }
}
