//! Delivery-ordering buffer merging read, live and retry messages.
//!
//! Every new message gets a dense subscription sequence when it enters
//! delivery order. Checkpoints are computed over those sequences, so the
//! assignment order has to match the order messages become deliverable:
//!
//! * read messages on arrival (reads are position ordered),
//! * live messages on arrival once the buffer is live,
//! * held live messages at the moment the buffer switches to live.

use crate::outstanding::OutstandingMessage;
use crate::types::StreamPosition;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Queue {
    Retry { sequence: u64 },
    Read,
    Live,
}

/// Identifies one buffered entry between [`StreamBuffer::scan`] and
/// [`StreamBuffer::mark_sent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferTicket {
    queue: Queue,
    slot: u64,
}

/// What happened to a live message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiveOutcome {
    /// Queued for delivery.
    Queued,
    /// Held until history reading catches up.
    Held,
    /// Already seen through a read.
    Duplicate,
    /// The live queue overflowed; unsent live messages were dropped and
    /// the buffer went back to reading history.
    Overflowed,
}

pub struct StreamBuffer {
    retry: BTreeMap<(u64, u64), OutstandingMessage>,
    read: VecDeque<(u64, OutstandingMessage)>,
    live: VecDeque<(u64, OutstandingMessage)>,
    live_buffer_size: usize,
    history_buffer_size: usize,
    is_live: bool,
    /// Positions strictly below this have been given a sequence.
    assigned_below: Option<StreamPosition>,
    /// Highest position the held ring dropped before reads reached it.
    evicted_through: Option<StreamPosition>,
    next_sequence: u64,
    next_slot: u64,
}

impl StreamBuffer {
    pub fn new(live_buffer_size: usize, history_buffer_size: usize) -> Self {
        Self {
            retry: BTreeMap::new(),
            read: VecDeque::new(),
            live: VecDeque::new(),
            live_buffer_size: live_buffer_size.max(1),
            history_buffer_size,
            is_live: false,
            assigned_below: None,
            evicted_through: None,
            next_sequence: 1,
            next_slot: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    /// Exclusive bound of positions already taken into delivery order.
    pub fn resume_position(&self) -> Option<StreamPosition> {
        self.assigned_below
    }

    /// Sequence the next new message will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn retry_count(&self) -> usize {
        self.retry.len()
    }

    pub fn read_count(&self) -> usize {
        self.read.len()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Messages ready for delivery (held live messages excluded).
    pub fn deliverable_count(&self) -> usize {
        self.retry.len() + self.read.len() + if self.is_live { self.live.len() } else { 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.retry.is_empty() && self.read.is_empty() && self.live.is_empty()
    }

    /// Whether another page of `batch` history messages fits.
    pub fn can_accept_read(&self, batch: usize) -> bool {
        self.read.len() + batch <= self.history_buffer_size
    }

    /// Queue a historical message. Returns false for duplicates.
    pub fn add_read_message(&mut self, mut message: OutstandingMessage) -> bool {
        if self.already_assigned(message.position) {
            return false;
        }
        self.assign(&mut message);
        let slot = self.take_slot();
        self.read.push_back((slot, message));
        self.try_catch_up();
        true
    }

    pub fn add_live_message(&mut self, mut message: OutstandingMessage) -> LiveOutcome {
        if self.already_assigned(message.position) {
            return LiveOutcome::Duplicate;
        }

        if !self.is_live {
            if self.live.len() >= self.live_buffer_size {
                if let Some((_, evicted)) = self.live.pop_front() {
                    self.evicted_through = self.evicted_through.max(Some(evicted.position));
                }
            }
            let slot = self.take_slot();
            self.live.push_back((slot, message));
            self.try_catch_up();
            return if self.is_live {
                LiveOutcome::Queued
            } else {
                LiveOutcome::Held
            };
        }

        if self.live.len() >= self.live_buffer_size {
            self.fall_back_to_pull(message.position);
            return LiveOutcome::Overflowed;
        }

        self.assign(&mut message);
        let slot = self.take_slot();
        self.live.push_back((slot, message));
        LiveOutcome::Queued
    }

    /// Queue a message for redelivery ahead of read and live messages.
    pub fn add_retry_message(&mut self, message: OutstandingMessage) {
        let slot = self.take_slot();
        self.retry.insert((message.sequence, slot), message);
    }

    /// History reading reached the end of the source. Returns false, and
    /// stays off live, while held live messages were dropped above the
    /// last read position; reads have to continue from
    /// [`resume_position`](Self::resume_position) until they cover them.
    pub fn move_to_live(&mut self) -> bool {
        if self.is_live {
            return true;
        }
        if let Some(evicted) = self.evicted_through {
            if !self.already_assigned(evicted) {
                debug!(
                    evicted = ?evicted,
                    resume = ?self.assigned_below,
                    "held live messages were dropped, reading on"
                );
                return false;
            }
        }
        self.is_live = true;
        self.evicted_through = None;

        let held = std::mem::take(&mut self.live);
        let mut dropped = 0;
        for (slot, mut message) in held {
            if self.already_assigned(message.position) {
                dropped += 1;
                continue;
            }
            self.assign(&mut message);
            self.live.push_back((slot, message));
        }
        debug!(
            kept = self.live.len(),
            dropped, "stream buffer switched to live"
        );
        true
    }

    /// Tickets of every deliverable entry in delivery order: retries by
    /// sequence, then read and live merged by position.
    pub fn scan(&self) -> Vec<BufferTicket> {
        let mut tickets = Vec::with_capacity(self.deliverable_count());
        tickets.extend(self.retry.keys().map(|&(sequence, slot)| BufferTicket {
            queue: Queue::Retry { sequence },
            slot,
        }));

        let live_len = if self.is_live { self.live.len() } else { 0 };
        let mut read = self.read.iter().peekable();
        let mut live = self.live.iter().take(live_len).peekable();

        loop {
            let take_read = match (read.peek(), live.peek()) {
                (Some((_, r)), Some((_, l))) => r.position <= l.position,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let (queue, entry) = if take_read {
                (Queue::Read, read.next())
            } else {
                (Queue::Live, live.next())
            };
            if let Some((slot, _)) = entry {
                tickets.push(BufferTicket { queue, slot: *slot });
            }
        }
        tickets
    }

    pub fn get(&self, ticket: BufferTicket) -> Option<&OutstandingMessage> {
        match ticket.queue {
            Queue::Retry { sequence } => self.retry.get(&(sequence, ticket.slot)),
            Queue::Read => Self::find_slot(&self.read, ticket.slot).map(|i| &self.read[i].1),
            Queue::Live => Self::find_slot(&self.live, ticket.slot).map(|i| &self.live[i].1),
        }
    }

    /// Remove a delivered entry.
    pub fn mark_sent(&mut self, ticket: BufferTicket) -> Option<OutstandingMessage> {
        match ticket.queue {
            Queue::Retry { sequence } => self.retry.remove(&(sequence, ticket.slot)),
            Queue::Read => Self::remove_slot(&mut self.read, ticket.slot),
            Queue::Live => Self::remove_slot(&mut self.live, ticket.slot),
        }
    }

    /// Every buffered message, for teardown.
    pub fn drain(&mut self) -> Vec<OutstandingMessage> {
        let mut all: Vec<_> = std::mem::take(&mut self.retry).into_values().collect();
        all.extend(self.read.drain(..).map(|(_, m)| m));
        all.extend(self.live.drain(..).map(|(_, m)| m));
        all
    }

    /// Slots only grow within a queue, so each queue stays sorted by slot.
    fn find_slot(queue: &VecDeque<(u64, OutstandingMessage)>, slot: u64) -> Option<usize> {
        queue.binary_search_by_key(&slot, |(s, _)| *s).ok()
    }

    fn remove_slot(queue: &mut VecDeque<(u64, OutstandingMessage)>, slot: u64) -> Option<OutstandingMessage> {
        if queue.front().map(|(s, _)| *s) == Some(slot) {
            return queue.pop_front().map(|(_, m)| m);
        }
        let index = Self::find_slot(queue, slot)?;
        queue.remove(index).map(|(_, m)| m)
    }

    fn already_assigned(&self, position: StreamPosition) -> bool {
        self.assigned_below.map_or(false, |bound| position < bound)
    }

    fn assign(&mut self, message: &mut OutstandingMessage) {
        message.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.assigned_below = Some(message.position.next());
    }

    fn take_slot(&mut self) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    /// Held live messages join delivery once reads have covered the head
    /// of the held queue.
    fn try_catch_up(&mut self) {
        if self.is_live {
            return;
        }
        let caught_up = match (self.live.front(), self.assigned_below) {
            (Some((_, head)), Some(bound)) => head.position < bound,
            _ => false,
        };
        if caught_up {
            self.move_to_live();
        }
    }

    fn fall_back_to_pull(&mut self, incoming: StreamPosition) {
        let dropped = std::mem::take(&mut self.live);
        let (sequence, position) = dropped
            .front()
            .map_or((self.next_sequence, incoming), |(_, m)| (m.sequence, m.position));
        self.next_sequence = sequence;
        self.assigned_below = Some(position);
        self.is_live = false;
        debug!(
            dropped = dropped.len(),
            resume = ?self.assigned_below,
            "live buffer overflowed, falling back to reads"
        );
    }
}
