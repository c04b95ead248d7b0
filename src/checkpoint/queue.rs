//! Contiguous-prefix tracking over processed subscription sequences.

use crate::types::StreamPosition;
use std::collections::BTreeMap;

/// How the frontier advances over a contiguous run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContiguityMode {
    /// Every entry of a contiguous run counts.
    #[default]
    Contiguous,
    /// An entry counts only once its successor has been seen, so the
    /// frontier trails the contiguous head by one.
    SuccessorConfirmed,
}

/// Processed sequences waiting for the gaps below them to close.
#[derive(Debug)]
pub struct CheckpointQueue {
    mode: ContiguityMode,
    pending: BTreeMap<u64, StreamPosition>,
    next_expected: u64,
    /// Consumed but not yet confirmed by a successor.
    unconfirmed: Option<(u64, StreamPosition)>,
    frontier: Option<(u64, StreamPosition)>,
}

impl CheckpointQueue {
    pub fn new(mode: ContiguityMode) -> Self {
        Self::starting_at(1, mode)
    }

    /// A queue whose first expected sequence is `first`.
    pub fn starting_at(first: u64, mode: ContiguityMode) -> Self {
        Self {
            mode,
            pending: BTreeMap::new(),
            next_expected: first,
            unconfirmed: None,
            frontier: None,
        }
    }

    pub fn mode(&self) -> ContiguityMode {
        self.mode
    }

    /// Record a processed sequence. Sequences already behind the frontier
    /// are ignored.
    pub fn processed(&mut self, sequence: u64, position: StreamPosition) {
        if sequence < self.next_expected {
            return;
        }
        self.pending.insert(sequence, position);
    }

    /// Consume the contiguous run at the head of the queue and return the
    /// frontier afterwards.
    pub fn advance(&mut self) -> Option<(u64, StreamPosition)> {
        while let Some(position) = self.pending.remove(&self.next_expected) {
            let entry = (self.next_expected, position);
            self.next_expected += 1;
            match self.mode {
                ContiguityMode::Contiguous => self.frontier = Some(entry),
                ContiguityMode::SuccessorConfirmed => {
                    if let Some(previous) = self.unconfirmed.replace(entry) {
                        self.frontier = Some(previous);
                    }
                }
            }
        }
        self.frontier
    }

    pub fn frontier(&self) -> Option<(u64, StreamPosition)> {
        self.frontier
    }

    pub fn frontier_sequence(&self) -> u64 {
        self.frontier.map_or(0, |(seq, _)| seq)
    }

    /// Entries stuck behind a gap.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(queue: &mut CheckpointQueue, sequences: &[u64]) {
        for &seq in sequences {
            queue.processed(seq, StreamPosition::Event(seq as i64));
        }
    }

    #[test]
    fn test_successor_confirmed_stops_before_gap() {
        let mut queue = CheckpointQueue::starting_at(10, ContiguityMode::SuccessorConfirmed);
        feed(&mut queue, &[10, 11, 12, 14]);

        let frontier = queue.advance();
        assert_eq!(frontier, Some((11, StreamPosition::Event(11))));
        assert_eq!(queue.pending_count(), 1);

        // 13 confirms 12, and 14 confirms 13
        feed(&mut queue, &[13]);
        assert_eq!(queue.advance().map(|(s, _)| s), Some(13));
    }

    #[test]
    fn test_contiguous_counts_whole_run() {
        let mut queue = CheckpointQueue::starting_at(10, ContiguityMode::Contiguous);
        feed(&mut queue, &[10, 11, 12, 14]);
        assert_eq!(queue.advance().map(|(s, _)| s), Some(12));
    }

    #[test]
    fn test_gap_blocks() {
        let mut queue = CheckpointQueue::new(ContiguityMode::Contiguous);
        feed(&mut queue, &[2, 3, 4]);
        assert_eq!(queue.advance(), None);

        feed(&mut queue, &[1]);
        assert_eq!(queue.advance().map(|(s, _)| s), Some(4));
    }

    #[test]
    fn test_stale_entries_ignored() {
        let mut queue = CheckpointQueue::new(ContiguityMode::Contiguous);
        feed(&mut queue, &[1, 2]);
        queue.advance();
        feed(&mut queue, &[1]);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.frontier_sequence(), 2);
    }
}
