//! In-process event log.

use super::{BackwardSlice, EventLog, ExpectedVersion, NewEvent, ReadSlice, StorageResult};
use crate::error::StorageError;
use crate::types::{EventFilter, EventRecord, LogPosition, ResolvedEvent, StreamPosition, Timestamp};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
struct StreamData {
    /// Event number == index.
    events: Vec<EventRecord>,
    truncate_before: Option<i64>,
    soft_deleted: bool,
    tombstoned: bool,
}

impl StreamData {
    fn first_visible(&self) -> i64 {
        self.truncate_before.unwrap_or(0).max(0)
    }

    fn last_number(&self) -> Option<i64> {
        let last = self.events.len() as i64 - 1;
        (last >= self.first_visible()).then_some(last)
    }
}

/// Event log held entirely in memory.
///
/// Supports link resolution, truncation, soft/hard deletes, a live feed of
/// appended events and injected transient failures for testing retry paths.
pub struct InMemoryLog {
    streams: RwLock<HashMap<String, StreamData>>,
    /// Every appended record in log order.
    all: RwLock<Vec<EventRecord>>,
    next_position: AtomicI64,
    watchers: Mutex<Vec<Sender<EventRecord>>>,
    injected: Mutex<VecDeque<StorageError>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            all: RwLock::new(Vec::new()),
            next_position: AtomicI64::new(0),
            watchers: Mutex::new(Vec::new()),
            injected: Mutex::new(VecDeque::new()),
        }
    }

    /// Receive every event appended from now on.
    pub fn subscribe(&self) -> Receiver<EventRecord> {
        let (tx, rx) = unbounded();
        self.watchers.lock().push(tx);
        rx
    }

    /// Make the next `count` operations fail with `error`.
    pub fn inject_failures(&self, error: StorageError, count: usize) {
        let mut injected = self.injected.lock();
        for _ in 0..count {
            injected.push_back(error.clone());
        }
    }

    /// Number of injected failures not yet consumed.
    pub fn pending_failures(&self) -> usize {
        self.injected.lock().len()
    }

    /// Visible events of a stream, oldest first (test helper).
    pub fn stream_events(&self, stream: &str) -> Vec<EventRecord> {
        let streams = self.streams.read();
        match streams.get(stream) {
            Some(data) if !data.tombstoned => {
                let first = data.first_visible() as usize;
                data.events.iter().skip(first).cloned().collect()
            }
            _ => Vec::new(),
        }
    }

    fn check_fault(&self) -> StorageResult<()> {
        match self.injected.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn resolve(streams: &HashMap<String, StreamData>, record: &EventRecord, resolve_links: bool) -> ResolvedEvent {
        if !resolve_links {
            return ResolvedEvent::from_event(record.clone());
        }
        let target = record.link_target().and_then(|(number, stream)| {
            let data = streams.get(stream)?;
            if data.tombstoned || number < data.first_visible() {
                return None;
            }
            data.events.get(usize::try_from(number).ok()?).cloned()
        });
        match target {
            Some(event) => ResolvedEvent::from_link(record.clone(), event),
            None => ResolvedEvent::from_event(record.clone()),
        }
    }

    fn visible<'a>(streams: &'a HashMap<String, StreamData>, stream: &str) -> StorageResult<&'a StreamData> {
        match streams.get(stream) {
            None => Err(StorageError::NoStream(stream.to_string())),
            Some(data) if data.tombstoned => Err(StorageError::StreamDeleted(stream.to_string())),
            Some(data) if data.soft_deleted => Err(StorageError::NoStream(stream.to_string())),
            Some(data) => Ok(data),
        }
    }

    fn notify(&self, records: &[EventRecord]) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|tx| records.iter().all(|r| tx.send(r.clone()).is_ok()));
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog for InMemoryLog {
    fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> StorageResult<Vec<EventRecord>> {
        self.check_fault()?;

        let appended = {
            let mut streams = self.streams.write();
            let mut all = self.all.write();
            let data = streams.entry(stream.to_string()).or_default();

            if data.tombstoned {
                return Err(StorageError::StreamDeleted(stream.to_string()));
            }

            let current = if data.soft_deleted { None } else { data.last_number() };
            let ok = match expected {
                ExpectedVersion::Any => true,
                ExpectedVersion::NoStream => current.is_none(),
                ExpectedVersion::Exact(v) => current == Some(v),
            };
            if !ok {
                return Err(StorageError::WrongExpectedVersion {
                    stream: stream.to_string(),
                    expected: match expected {
                        ExpectedVersion::Exact(v) => v,
                        _ => -1,
                    },
                    actual: current.unwrap_or(-1),
                });
            }
            data.soft_deleted = false;

            let mut appended = Vec::with_capacity(events.len());
            for input in events {
                let pos = self.next_position.fetch_add(1, Ordering::SeqCst);
                let record = EventRecord {
                    stream_id: stream.to_string(),
                    event_number: data.events.len() as i64,
                    event_id: input.event_id,
                    event_type: input.event_type,
                    data: input.data,
                    metadata: input.metadata,
                    position: LogPosition::new(pos, pos),
                    timestamp: Timestamp::now(),
                };
                data.events.push(record.clone());
                all.push(record.clone());
                appended.push(record);
            }
            appended
        };

        self.notify(&appended);
        Ok(appended)
    }

    fn read_stream_forward(
        &self,
        stream: &str,
        from: i64,
        max_count: usize,
        resolve_links: bool,
    ) -> StorageResult<ReadSlice> {
        self.check_fault()?;

        let streams = self.streams.read();
        let data = Self::visible(&streams, stream)?;
        let start = from.max(data.first_visible()).max(0) as usize;
        let events: Vec<ResolvedEvent> = data
            .events
            .iter()
            .skip(start)
            .take(max_count)
            .map(|r| Self::resolve(&streams, r, resolve_links))
            .collect();
        let next = start as i64 + events.len() as i64;

        Ok(ReadSlice {
            events,
            next: StreamPosition::Event(next),
            is_end_of_stream: next >= data.events.len() as i64,
        })
    }

    fn read_stream_backward(
        &self,
        stream: &str,
        from: Option<i64>,
        max_count: usize,
    ) -> StorageResult<BackwardSlice> {
        self.check_fault()?;

        let streams = self.streams.read();
        let data = Self::visible(&streams, stream)?;
        let first = data.first_visible();
        let last = data.events.len() as i64 - 1;
        let start = from.map_or(last, |f| f.min(last));

        let mut events = Vec::new();
        let mut number = start;
        while number >= first && events.len() < max_count {
            events.push(data.events[number as usize].clone());
            number -= 1;
        }

        let is_end_of_stream = number < first;
        Ok(BackwardSlice {
            events,
            next_event_number: if is_end_of_stream { -1 } else { number },
            is_end_of_stream,
        })
    }

    fn read_all_forward(
        &self,
        from: LogPosition,
        max_count: usize,
        filter: Option<&EventFilter>,
        resolve_links: bool,
    ) -> StorageResult<ReadSlice> {
        self.check_fault()?;

        let streams = self.streams.read();
        let all = self.all.read();
        let start = all.partition_point(|r| r.position < from);

        let mut events = Vec::new();
        let mut next = from;
        let mut scanned = start;
        for record in all.iter().skip(start) {
            if events.len() >= max_count {
                break;
            }
            scanned += 1;
            next = LogPosition::new(record.position.commit, record.position.prepare + 1);

            if record.stream_id.starts_with('$') {
                continue;
            }
            let live = streams.get(&record.stream_id).map_or(false, |d| {
                !d.tombstoned && !d.soft_deleted && record.event_number >= d.first_visible()
            });
            if !live || !filter.map_or(true, |f| f.matches(record)) {
                continue;
            }
            events.push(Self::resolve(&streams, record, resolve_links));
        }

        Ok(ReadSlice {
            events,
            next: StreamPosition::Log(next),
            is_end_of_stream: scanned >= all.len(),
        })
    }

    fn truncate_before(&self, stream: &str) -> StorageResult<Option<i64>> {
        self.check_fault()?;

        let streams = self.streams.read();
        match streams.get(stream) {
            Some(data) if data.tombstoned => Err(StorageError::StreamDeleted(stream.to_string())),
            Some(data) => Ok(data.truncate_before),
            None => Ok(None),
        }
    }

    fn set_truncate_before(&self, stream: &str, event_number: i64) -> StorageResult<()> {
        self.check_fault()?;

        let mut streams = self.streams.write();
        let data = streams.entry(stream.to_string()).or_default();
        if data.tombstoned {
            return Err(StorageError::StreamDeleted(stream.to_string()));
        }
        data.truncate_before = Some(event_number);
        Ok(())
    }

    fn delete_stream(&self, stream: &str, hard: bool) -> StorageResult<()> {
        self.check_fault()?;

        let mut streams = self.streams.write();
        let data = match streams.get_mut(stream) {
            Some(data) if !data.tombstoned => data,
            Some(_) => return Err(StorageError::StreamDeleted(stream.to_string())),
            None => return Err(StorageError::NoStream(stream.to_string())),
        };
        if hard {
            data.tombstoned = true;
        } else {
            data.soft_deleted = true;
            data.truncate_before = Some(data.events.len() as i64);
        }
        Ok(())
    }

    fn last_event_number(&self, stream: &str) -> StorageResult<Option<i64>> {
        self.check_fault()?;

        let streams = self.streams.read();
        match Self::visible(&streams, stream) {
            Ok(data) => Ok(data.last_number()),
            Err(StorageError::NoStream(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
