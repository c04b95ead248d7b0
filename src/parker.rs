//! Dead-letter storage for messages that could not be processed.
//!
//! Parked messages are link events in `$persistentsubscription-{id}-parked`.
//! The stream's truncate-before value is the replay cursor: everything
//! below it has been handed back to the subscription and no longer counts
//! as parked.

use crate::error::{Result, StorageError};
use crate::storage::{EventLog, ExpectedVersion, NewEvent};
use crate::types::{EventRecord, ResolvedEvent, Timestamp, LINK_EVENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Page size used when walking the parked stream.
const READ_PAGE: usize = 100;

/// Name of the parked-message stream of a subscription.
pub fn parked_stream(subscription_id: &str) -> String {
    format!("$persistentsubscription-{}-parked", subscription_id)
}

/// Metadata stored with every parked link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParkedMetadata {
    /// Microseconds since Unix epoch.
    pub added: i64,
    pub reason: String,
}

/// Parked messages not yet replayed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedStats {
    pub count: u64,
    /// When the oldest counted message was parked.
    pub oldest: Option<Timestamp>,
    /// Number of the newest parked link.
    pub last_event_number: Option<i64>,
}

/// A parked message read back for replay.
#[derive(Clone, Debug)]
pub struct ParkedMessage {
    /// Number of the link in the parked stream.
    pub parked_number: i64,
    /// The original message, `None` when its event no longer exists.
    pub event: Option<ResolvedEvent>,
}

/// Parked messages read for replay and where the cursor moves to.
#[derive(Clone, Debug, Default)]
pub struct ParkedBatch {
    pub messages: Vec<ParkedMessage>,
    /// Cursor value once these messages are reprocessed.
    pub next_cursor: i64,
}

#[derive(Clone)]
pub struct MessageParker {
    log: Arc<dyn EventLog>,
    stream: String,
}

impl MessageParker {
    pub fn new(log: Arc<dyn EventLog>, subscription_id: &str) -> Self {
        Self {
            log,
            stream: parked_stream(subscription_id),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Append a link to the original event of `event`.
    pub fn park_message(&self, event: &ResolvedEvent, reason: &str) -> Result<i64> {
        let original = event.original_event();
        let metadata = ParkedMetadata {
            added: Timestamp::now().0,
            reason: reason.to_string(),
        };
        let link = NewEvent::new(
            LINK_EVENT_TYPE,
            format!("{}@{}", original.event_number, original.stream_id),
        )
        .with_metadata(serde_json::to_vec(&metadata)?);

        let written = self.log.append(&self.stream, ExpectedVersion::Any, vec![link])?;
        let number = written.first().map_or(-1, |r| r.event_number);
        debug!(stream = %self.stream, event = %original.event_id, reason, "parked message");
        Ok(number)
    }

    /// Current replay cursor (first parked number not yet replayed).
    pub fn replay_cursor(&self) -> Result<i64> {
        match self.log.truncate_before(&self.stream) {
            Ok(cursor) => Ok(cursor.unwrap_or(0)),
            Err(StorageError::StreamDeleted(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Count parked messages above the replay cursor by reading backward
    /// from the end. Missing or deleted streams count as empty.
    pub fn load_stats(&self) -> Result<ParkedStats> {
        let cursor = self.replay_cursor()?;
        let mut stats = ParkedStats::default();
        let mut from = None;

        loop {
            let slice = match self.log.read_stream_backward(&self.stream, from, READ_PAGE) {
                Ok(slice) => slice,
                Err(StorageError::NoStream(_)) | Err(StorageError::StreamDeleted(_)) => {
                    return Ok(ParkedStats::default())
                }
                Err(e) => return Err(e.into()),
            };

            for record in slice.events.iter().filter(|r| r.event_number >= cursor) {
                stats.count += 1;
                stats.last_event_number = stats.last_event_number.max(Some(record.event_number));
                stats.oldest = Some(parked_at(record));
            }

            let below_cursor = slice.events.last().map_or(true, |r| r.event_number <= cursor);
            if slice.is_end_of_stream || below_cursor {
                break;
            }
            from = Some(slice.next_event_number);
        }
        Ok(stats)
    }

    /// Read parked messages from the cursor up to `stop_at` (exclusive,
    /// parked-stream numbering), resolving each back to its original event.
    pub fn read_parked(&self, stop_at: Option<i64>) -> Result<ParkedBatch> {
        let cursor = self.replay_cursor()?;
        let mut batch = ParkedBatch {
            messages: Vec::new(),
            next_cursor: cursor,
        };
        let mut from = cursor;

        loop {
            let slice = match self.log.read_stream_forward(&self.stream, from, READ_PAGE, false) {
                Ok(slice) => slice,
                Err(StorageError::NoStream(_)) | Err(StorageError::StreamDeleted(_)) => return Ok(batch),
                Err(e) => return Err(e.into()),
            };

            for resolved in &slice.events {
                let link = &resolved.event;
                if stop_at.map_or(false, |stop| link.event_number >= stop) {
                    return Ok(batch);
                }
                batch.messages.push(ParkedMessage {
                    parked_number: link.event_number,
                    event: self.resolve_original(link)?,
                });
                batch.next_cursor = link.event_number + 1;
            }

            if slice.is_end_of_stream || slice.events.is_empty() {
                return Ok(batch);
            }
            from = batch.next_cursor;
        }
    }

    /// Advance the replay cursor to `sequence`. Never moves it backward.
    pub fn mark_parked_messages_reprocessed(&self, sequence: i64) -> Result<()> {
        let current = self.replay_cursor()?;
        if sequence <= current {
            return Ok(());
        }
        self.log.set_truncate_before(&self.stream, sequence)?;
        info!(stream = %self.stream, cursor = sequence, "parked messages marked reprocessed");
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        match self.log.delete_stream(&self.stream, false) {
            Ok(()) | Err(StorageError::NoStream(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Parked link -> original record, following one more link when the
    /// original itself was a link.
    fn resolve_original(&self, link: &EventRecord) -> Result<Option<ResolvedEvent>> {
        let Some(original) = self.log.resolve_link(link)? else {
            return Ok(None);
        };
        if !original.is_link() {
            return Ok(Some(ResolvedEvent::from_event(original)));
        }
        Ok(Some(match self.log.resolve_link(&original)? {
            Some(target) => ResolvedEvent::from_link(original, target),
            None => ResolvedEvent::from_event(original),
        }))
    }
}

fn parked_at(record: &EventRecord) -> Timestamp {
    serde_json::from_slice::<ParkedMetadata>(&record.metadata)
        .map(|m| Timestamp(m.added))
        .unwrap_or(record.timestamp)
}
