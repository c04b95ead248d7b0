//! Core types shared by every subscription component.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Event type used for link events (`"{number}@{stream}"` payloads).
pub const LINK_EVENT_TYPE: &str = "$>";

/// Globally unique identifier of an event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        EventId(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one subscribe call of a client.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a client connection (one connection may hold many subscriptions).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Position of a record in the whole log.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct LogPosition {
    pub commit: i64,
    pub prepare: i64,
}

impl LogPosition {
    pub const START: LogPosition = LogPosition {
        commit: 0,
        prepare: 0,
    };

    pub fn new(commit: i64, prepare: i64) -> Self {
        Self { commit, prepare }
    }
}

impl fmt::Debug for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C:{}/P:{}", self.commit, self.prepare)
    }
}

/// Position within the source a subscription reads from.
///
/// Single-stream subscriptions use event numbers; whole-log subscriptions use
/// commit/prepare pairs. A subscription only ever compares positions of the
/// same kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPosition {
    Event(i64),
    Log(LogPosition),
}

impl StreamPosition {
    /// The position immediately after this one.
    pub fn next(self) -> Self {
        match self {
            StreamPosition::Event(n) => StreamPosition::Event(n + 1),
            StreamPosition::Log(p) => StreamPosition::Log(LogPosition::new(p.commit, p.prepare + 1)),
        }
    }

    pub fn event_number(self) -> Option<i64> {
        match self {
            StreamPosition::Event(n) => Some(n),
            StreamPosition::Log(_) => None,
        }
    }
}

impl PartialOrd for StreamPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (StreamPosition::Event(a), StreamPosition::Event(b)) => a.cmp(b),
            (StreamPosition::Log(a), StreamPosition::Log(b)) => a.cmp(b),
            (StreamPosition::Event(_), StreamPosition::Log(_)) => Ordering::Less,
            (StreamPosition::Log(_), StreamPosition::Event(_)) => Ordering::Greater,
        }
    }
}

impl fmt::Debug for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamPosition::Event(n) => write!(f, "#{}", n),
            StreamPosition::Log(p) => write!(f, "{:?}", p),
        }
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamPosition::Event(n) => write!(f, "{}", n),
            StreamPosition::Log(p) => write!(f, "{}/{}", p.commit, p.prepare),
        }
    }
}

/// A single event as stored in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub stream_id: String,
    pub event_number: i64,
    pub event_id: EventId,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
    pub position: LogPosition,
    pub timestamp: Timestamp,
}

impl EventRecord {
    /// Create a record with a fresh id and empty metadata.
    pub fn new(
        stream_id: impl Into<String>,
        event_number: i64,
        event_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            event_number,
            event_id: EventId::new(),
            event_type: event_type.into(),
            data: data.into(),
            metadata: Vec::new(),
            position: LogPosition::new(event_number, event_number),
            timestamp: Timestamp::now(),
        }
    }

    /// Create a link record pointing at `target`.
    pub fn link_to(stream_id: impl Into<String>, event_number: i64, target: &EventRecord) -> Self {
        Self::new(
            stream_id,
            event_number,
            LINK_EVENT_TYPE,
            format!("{}@{}", target.event_number, target.stream_id),
        )
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.event_id = id;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn with_position(mut self, position: LogPosition) -> Self {
        self.position = position;
        self
    }

    pub fn is_link(&self) -> bool {
        self.event_type == LINK_EVENT_TYPE
    }

    /// Parse `"{number}@{stream}"` link data.
    pub fn link_target(&self) -> Option<(i64, &str)> {
        if !self.is_link() {
            return None;
        }
        let text = std::str::from_utf8(&self.data).ok()?;
        let (number, stream) = text.split_once('@')?;
        Some((number.trim().parse().ok()?, stream))
    }
}

/// An event, possibly reached through a link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEvent {
    /// The resolved (target) event. For unresolved links this is the link itself.
    pub event: EventRecord,
    /// The link record when the event was reached through one.
    pub link: Option<EventRecord>,
}

impl ResolvedEvent {
    pub fn from_event(event: EventRecord) -> Self {
        Self { event, link: None }
    }

    pub fn from_link(link: EventRecord, event: EventRecord) -> Self {
        Self {
            event,
            link: Some(link),
        }
    }

    /// The record that lives in the subscribed source.
    pub fn original_event(&self) -> &EventRecord {
        self.link.as_ref().unwrap_or(&self.event)
    }

    pub fn original_event_id(&self) -> EventId {
        self.original_event().event_id
    }

    pub fn original_stream_id(&self) -> &str {
        &self.original_event().stream_id
    }

    pub fn original_event_number(&self) -> i64 {
        self.original_event().event_number
    }

    /// Position of the record in the subscribed source.
    pub fn position_in(&self, source: &EventSource) -> StreamPosition {
        match source {
            EventSource::Stream(_) => StreamPosition::Event(self.original_event_number()),
            EventSource::All { .. } => StreamPosition::Log(self.original_event().position),
        }
    }
}

/// Shared handle to an event, cheap to clone across buffer, cache and clients.
pub type SharedEvent = Arc<ResolvedEvent>;

/// Filter for whole-log subscriptions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFilter {
    /// Accepted stream id prefixes (empty = any stream).
    pub stream_prefixes: Vec<String>,
    /// Accepted event type prefixes (empty = any type).
    pub event_type_prefixes: Vec<String>,
}

impl EventFilter {
    pub fn stream_prefix(prefix: impl Into<String>) -> Self {
        Self {
            stream_prefixes: vec![prefix.into()],
            ..Default::default()
        }
    }

    pub fn event_type_prefix(prefix: impl Into<String>) -> Self {
        Self {
            event_type_prefixes: vec![prefix.into()],
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &EventRecord) -> bool {
        let stream_ok = self.stream_prefixes.is_empty()
            || self
                .stream_prefixes
                .iter()
                .any(|p| event.stream_id.starts_with(p.as_str()));
        let type_ok = self.event_type_prefixes.is_empty()
            || self
                .event_type_prefixes
                .iter()
                .any(|p| event.event_type.starts_with(p.as_str()));
        stream_ok && type_ok
    }
}

/// The source a subscription consumes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// A single stream.
    Stream(String),
    /// The whole log, optionally filtered.
    All { filter: Option<EventFilter> },
}

/// Name used for the whole-log source in subscription ids.
pub const ALL_STREAM: &str = "$all";

impl EventSource {
    pub fn stream(name: impl Into<String>) -> Self {
        EventSource::Stream(name.into())
    }

    pub fn all() -> Self {
        EventSource::All { filter: None }
    }

    pub fn name(&self) -> &str {
        match self {
            EventSource::Stream(s) => s,
            EventSource::All { .. } => ALL_STREAM,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, EventSource::All { .. })
    }

    /// Whether a live event from the log belongs to this source.
    pub fn accepts(&self, event: &EventRecord) -> bool {
        match self {
            EventSource::Stream(s) => event.stream_id == *s,
            EventSource::All { filter } => {
                !event.stream_id.starts_with('$')
                    && filter.as_ref().map_or(true, |f| f.matches(event))
            }
        }
    }

    /// Position before the first event of this source.
    pub fn start_position(&self) -> StreamPosition {
        match self {
            EventSource::Stream(_) => StreamPosition::Event(0),
            EventSource::All { .. } => StreamPosition::Log(LogPosition::START),
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Build the subscription id for a source/group pair.
pub fn subscription_id(source: &EventSource, group: &str) -> String {
    format!("{}::{}", source.name(), group)
}
