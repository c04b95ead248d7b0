//! When to persist the checkpoint.

use super::queue::{CheckpointQueue, ContiguityMode};
use crate::types::StreamPosition;
use std::time::{Duration, Instant};

/// Two-threshold checkpoint policy.
///
/// `count` is the number of contiguously processed messages since the last
/// write. A write is due immediately when `count >= max_count`, and on a
/// clock tick when `count >= min_count` and `after` has elapsed since the
/// last write. Below `min_count` a tick never writes.
///
/// Only a confirmed write moves the written mark. A write that fails
/// leaves the count where it was, so the same frontier becomes due again.
#[derive(Debug)]
pub struct CheckpointPolicy {
    queue: CheckpointQueue,
    min_count: u64,
    max_count: u64,
    after: Duration,
    last_written_sequence: u64,
    last_written: Option<StreamPosition>,
    /// Issued and not yet confirmed.
    pending: Option<(u64, StreamPosition)>,
    last_write_at: Instant,
}

impl CheckpointPolicy {
    pub fn new(min_count: u64, max_count: u64, after: Duration, mode: ContiguityMode, now: Instant) -> Self {
        Self {
            queue: CheckpointQueue::new(mode),
            min_count,
            max_count: max_count.max(1),
            after,
            last_written_sequence: 0,
            last_written: None,
            pending: None,
            last_write_at: now,
        }
    }

    /// Seed with the checkpoint loaded at startup.
    pub fn with_loaded(mut self, checkpoint: Option<StreamPosition>) -> Self {
        self.last_written = checkpoint;
        self
    }

    pub fn message_processed(&mut self, sequence: u64, position: StreamPosition) {
        self.queue.processed(sequence, position);
        self.queue.advance();
    }

    /// Contiguously processed messages not yet covered by a write.
    pub fn count_since_write(&self) -> u64 {
        self.queue.frontier_sequence().saturating_sub(self.last_written_sequence)
    }

    pub fn last_written(&self) -> Option<StreamPosition> {
        self.last_written
    }

    /// Frontier that may be written, given the lowest unacknowledged sequence.
    fn candidate(&self, lowest_outstanding: Option<u64>) -> Option<(u64, StreamPosition)> {
        let (sequence, position) = self.queue.frontier()?;
        if sequence <= self.last_written_sequence {
            return None;
        }
        if lowest_outstanding.map_or(false, |lowest| sequence >= lowest) {
            return None;
        }
        if self.last_written.map_or(false, |written| position <= written) {
            return None;
        }
        Some((sequence, position))
    }

    /// Count-based rule, evaluated after acknowledgements.
    pub fn due_on_ack(&self, lowest_outstanding: Option<u64>) -> Option<(u64, StreamPosition)> {
        if self.count_since_write() < self.max_count {
            return None;
        }
        self.candidate(lowest_outstanding)
    }

    /// Time-based rule, evaluated on clock ticks.
    pub fn due_on_tick(&self, now: Instant, lowest_outstanding: Option<u64>) -> Option<(u64, StreamPosition)> {
        let count = self.count_since_write();
        if count == 0 || count < self.min_count {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last_write_at);
        if count < self.max_count && elapsed < self.after {
            return None;
        }
        self.candidate(lowest_outstanding)
    }

    /// Record that a write of `(sequence, position)` was issued.
    pub fn write_started(&mut self, sequence: u64, position: StreamPosition, now: Instant) {
        self.pending = Some((sequence, position));
        self.last_write_at = now;
    }

    /// The issued write finished. Success commits it, failure discards it.
    pub fn write_completed(&mut self, succeeded: bool) {
        let Some((sequence, position)) = self.pending.take() else {
            return;
        };
        if succeeded {
            self.last_written_sequence = self.last_written_sequence.max(sequence);
            self.last_written = self.last_written.max(Some(position));
        }
    }

    pub fn write_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(min: u64, max: u64, now: Instant) -> CheckpointPolicy {
        CheckpointPolicy::new(min, max, Duration::from_secs(2), ContiguityMode::Contiguous, now)
    }

    fn process(policy: &mut CheckpointPolicy, seqs: &[u64]) {
        for &s in seqs {
            policy.message_processed(s, StreamPosition::Event(s as i64 - 1));
        }
    }

    #[test]
    fn test_max_forces_write() {
        let now = Instant::now();
        let mut p = policy(1, 2, now);
        process(&mut p, &[1]);
        assert!(p.due_on_ack(None).is_none());

        process(&mut p, &[2]);
        assert_eq!(p.due_on_ack(None), Some((2, StreamPosition::Event(1))));
    }

    #[test]
    fn test_min_blocks_tick() {
        let now = Instant::now();
        let mut p = policy(2, 10, now);
        process(&mut p, &[1]);
        assert!(p.due_on_tick(now + Duration::from_secs(5), None).is_none());

        process(&mut p, &[2]);
        assert!(p.due_on_tick(now + Duration::from_secs(1), None).is_none());
        assert_eq!(
            p.due_on_tick(now + Duration::from_secs(5), None),
            Some((2, StreamPosition::Event(1)))
        );
    }

    #[test]
    fn test_gap_and_lowest_outstanding_block() {
        let now = Instant::now();
        let mut p = policy(1, 1, now);
        process(&mut p, &[2, 3]);
        assert!(p.due_on_ack(None).is_none());

        process(&mut p, &[1]);
        assert!(p.due_on_ack(Some(3)).is_none());
        assert!(p.due_on_ack(Some(4)).is_some());
    }

    #[test]
    fn test_never_regresses() {
        let now = Instant::now();
        let mut p = policy(1, 1, now).with_loaded(Some(StreamPosition::Event(10)));
        // position 0..2 sits below the loaded checkpoint
        process(&mut p, &[1, 2]);
        assert!(p.due_on_ack(None).is_none());

        let mut p = policy(1, 1, now);
        process(&mut p, &[1, 2]);
        let (seq, pos) = p.due_on_ack(None).unwrap();
        p.write_started(seq, pos, now);
        p.write_completed(true);
        assert_eq!(p.count_since_write(), 0);
        assert!(p.due_on_ack(None).is_none());
    }

    #[test]
    fn test_failed_write_becomes_due_again() {
        let now = Instant::now();
        let mut p = policy(1, 1, now);
        process(&mut p, &[1]);
        let (seq, pos) = p.due_on_ack(None).unwrap();
        p.write_started(seq, pos, now);
        assert!(p.write_pending());

        p.write_completed(false);
        assert!(!p.write_pending());
        assert_eq!(p.last_written(), None);
        assert_eq!(p.count_since_write(), 1);
        assert_eq!(
            p.due_on_tick(now + Duration::from_secs(60), None),
            Some((1, StreamPosition::Event(0)))
        );
    }
}
