//! Event log collaborator.
//!
//! The subscription engine never owns storage. Everything it persists
//! (checkpoints, parked messages, configuration) and everything it reads
//! goes through the [`EventLog`] trait. [`InMemoryLog`] is a complete
//! in-process implementation used by the service and the tests.

mod memory;

pub use memory::InMemoryLog;

use crate::error::StorageError;
use crate::types::{EventFilter, EventId, EventRecord, EventSource, LogPosition, ResolvedEvent, StreamPosition};

/// Result type for event log operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Optimistic concurrency check for appends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedVersion {
    Any,
    NoStream,
    Exact(i64),
}

/// Input for appending an event (before number/position assigned).
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            data: data.into(),
            metadata: Vec::new(),
        }
    }

    /// Create an event input with JSON data.
    pub fn json(
        event_type: impl Into<String>,
        data: &impl serde::Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, serde_json::to_vec(data)?))
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.event_id = id;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// A page of events read forward.
#[derive(Clone, Debug)]
pub struct ReadSlice {
    pub events: Vec<ResolvedEvent>,
    /// Where the next page starts.
    pub next: StreamPosition,
    pub is_end_of_stream: bool,
}

/// A page of events read backward (newest first).
#[derive(Clone, Debug)]
pub struct BackwardSlice {
    pub events: Vec<EventRecord>,
    /// Event number to continue from, or `-1` when the start was reached.
    pub next_event_number: i64,
    pub is_end_of_stream: bool,
}

/// Append-only log with per-stream reads.
pub trait EventLog: Send + Sync {
    /// Append events to a stream, returning the stored records.
    fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> StorageResult<Vec<EventRecord>>;

    /// Read a stream forward from `from` (inclusive).
    fn read_stream_forward(
        &self,
        stream: &str,
        from: i64,
        max_count: usize,
        resolve_links: bool,
    ) -> StorageResult<ReadSlice>;

    /// Read a stream backward from `from` (inclusive), or from its end when `None`.
    fn read_stream_backward(
        &self,
        stream: &str,
        from: Option<i64>,
        max_count: usize,
    ) -> StorageResult<BackwardSlice>;

    /// Read the whole log forward from `from` (inclusive), skipping system streams.
    fn read_all_forward(
        &self,
        from: LogPosition,
        max_count: usize,
        filter: Option<&EventFilter>,
        resolve_links: bool,
    ) -> StorageResult<ReadSlice>;

    /// Event numbers below this value are hidden from reads.
    fn truncate_before(&self, stream: &str) -> StorageResult<Option<i64>>;

    fn set_truncate_before(&self, stream: &str, event_number: i64) -> StorageResult<()>;

    /// Delete a stream. Soft deletes allow the stream to be written again.
    fn delete_stream(&self, stream: &str, hard: bool) -> StorageResult<()>;

    /// Number of the last event in the stream, `None` when it has none.
    fn last_event_number(&self, stream: &str) -> StorageResult<Option<i64>>;

    /// Read the page of a subscription source starting at `from`.
    fn read_source(
        &self,
        source: &EventSource,
        from: StreamPosition,
        max_count: usize,
        resolve_links: bool,
    ) -> StorageResult<ReadSlice> {
        match (source, from) {
            (EventSource::Stream(stream), StreamPosition::Event(n)) => {
                match self.read_stream_forward(stream, n, max_count, resolve_links) {
                    Err(StorageError::NoStream(_)) => Ok(ReadSlice {
                        events: Vec::new(),
                        next: from,
                        is_end_of_stream: true,
                    }),
                    other => other,
                }
            }
            (EventSource::All { filter }, StreamPosition::Log(p)) => {
                self.read_all_forward(p, max_count, filter.as_ref(), resolve_links)
            }
            (EventSource::Stream(stream), StreamPosition::Log(_)) => Err(StorageError::Unavailable(
                format!("log position used for stream {}", stream),
            )),
            (EventSource::All { .. }, StreamPosition::Event(_)) => Err(StorageError::Unavailable(
                "event number used for $all".to_string(),
            )),
        }
    }

    /// Resolve a link record to its target, `None` when the target is gone.
    fn resolve_link(&self, link: &EventRecord) -> StorageResult<Option<EventRecord>> {
        let Some((number, stream)) = link.link_target() else {
            return Ok(None);
        };
        match self.read_stream_forward(stream, number, 1, false) {
            Ok(slice) => Ok(slice
                .events
                .into_iter()
                .next()
                .map(|e| e.event)
                .filter(|e| e.event_number == number)),
            Err(StorageError::NoStream(_)) | Err(StorageError::StreamDeleted(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
