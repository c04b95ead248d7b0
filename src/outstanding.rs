//! Messages handed to clients and not yet acknowledged.

use crate::types::{EventId, SharedEvent, StreamPosition};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A buffered or in-flight message.
#[derive(Clone, Debug)]
pub struct OutstandingMessage {
    pub event: SharedEvent,
    pub retry_count: u32,
    /// Subscription-local delivery sequence, dense from 1. Replayed
    /// parked messages carry 0 and never count toward checkpoints.
    pub sequence: u64,
    /// Position of the event in the subscribed source.
    pub position: StreamPosition,
    pub replayed: bool,
}

impl OutstandingMessage {
    pub fn new(event: SharedEvent, position: StreamPosition) -> Self {
        Self {
            event,
            retry_count: 0,
            sequence: 0,
            position,
            replayed: false,
        }
    }

    /// A message re-introduced from the parked stream.
    pub fn replayed(event: SharedEvent, position: StreamPosition) -> Self {
        Self {
            replayed: true,
            ..Self::new(event, position)
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event.original_event_id()
    }

    /// Same message with its retry counter bumped.
    pub fn next_retry(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}

/// Result of [`OutstandingMessageCache::start_message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMessageResult {
    Started,
    SkippedDuplicate,
}

const NO_SEQUENCE: u64 = u64::MAX;

/// Counters mirrored from the cache for readers on other threads.
#[derive(Debug)]
pub struct CacheGauge {
    count: AtomicU64,
    lowest: AtomicU64,
}

impl CacheGauge {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            lowest: AtomicU64::new(NO_SEQUENCE),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn lowest_sequence(&self) -> Option<u64> {
        match self.lowest.load(Ordering::Acquire) {
            NO_SEQUENCE => None,
            n => Some(n),
        }
    }
}

struct Entry {
    message: OutstandingMessage,
    deadline: Instant,
}

/// Index of in-flight messages by event id, deadline and sequence.
///
/// Starting an id that is already outstanding is a no-op, so at most one
/// copy of an event is ever in flight.
pub struct OutstandingMessageCache {
    by_id: HashMap<EventId, Entry>,
    by_deadline: BTreeSet<(Instant, EventId)>,
    by_sequence: BTreeSet<(u64, EventId)>,
    gauge: Arc<CacheGauge>,
}

impl OutstandingMessageCache {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_deadline: BTreeSet::new(),
            by_sequence: BTreeSet::new(),
            gauge: Arc::new(CacheGauge::new()),
        }
    }

    /// Shared counters, safe to read while the owner mutates the cache.
    pub fn gauge(&self) -> Arc<CacheGauge> {
        Arc::clone(&self.gauge)
    }

    pub fn start_message(&mut self, message: OutstandingMessage, deadline: Instant) -> StartMessageResult {
        let id = message.event_id();
        if self.by_id.contains_key(&id) {
            return StartMessageResult::SkippedDuplicate;
        }

        self.by_deadline.insert((deadline, id));
        if !message.replayed {
            self.by_sequence.insert((message.sequence, id));
        }
        self.by_id.insert(id, Entry { message, deadline });
        self.publish();
        StartMessageResult::Started
    }

    pub fn remove(&mut self, id: EventId) -> Option<OutstandingMessage> {
        let entry = self.by_id.remove(&id)?;
        self.by_deadline.remove(&(entry.deadline, id));
        if !entry.message.replayed {
            self.by_sequence.remove(&(entry.message.sequence, id));
        }
        self.publish();
        Some(entry.message)
    }

    pub fn get(&self, id: EventId) -> Option<&OutstandingMessage> {
        self.by_id.get(&id).map(|e| &e.message)
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Lowest sequence among outstanding messages, `None` when there are none.
    pub fn lowest_sequence(&self) -> Option<u64> {
        self.by_sequence.iter().next().map(|(seq, _)| *seq)
    }

    /// Messages whose deadline is strictly before `now`, earliest first.
    pub fn messages_expiring_before(&self, now: Instant) -> Vec<OutstandingMessage> {
        self.by_deadline
            .iter()
            .take_while(|(deadline, _)| *deadline < now)
            .filter_map(|(_, id)| self.by_id.get(id).map(|e| e.message.clone()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Drop every entry, returning them.
    pub fn drain(&mut self) -> Vec<OutstandingMessage> {
        self.by_deadline.clear();
        self.by_sequence.clear();
        let drained = self.by_id.drain().map(|(_, e)| e.message).collect();
        self.publish();
        drained
    }

    fn publish(&self) {
        self.gauge.count.store(self.by_id.len() as u64, Ordering::Release);
        self.gauge
            .lowest
            .store(self.lowest_sequence().unwrap_or(NO_SEQUENCE), Ordering::Release);
    }
}

impl Default for OutstandingMessageCache {
    fn default() -> Self {
        Self::new()
    }
}
