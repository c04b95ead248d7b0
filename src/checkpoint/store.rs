//! Checkpoint persistence in a per-subscription stream.

use crate::error::{Result, StorageError, SubscriptionError};
use crate::storage::{EventLog, ExpectedVersion, NewEvent};
use crate::types::StreamPosition;
use std::sync::Arc;
use tracing::debug;

/// Event type of checkpoint records.
pub const CHECKPOINT_EVENT_TYPE: &str = "$SubscriptionCheckpoint";

/// Name of the checkpoint stream of a subscription.
pub fn checkpoint_stream(subscription_id: &str) -> String {
    format!("$persistentsubscription-{}-checkpoint", subscription_id)
}

/// Reads and writes the checkpoint of one subscription.
#[derive(Clone)]
pub struct CheckpointStore {
    log: Arc<dyn EventLog>,
    stream: String,
}

impl CheckpointStore {
    pub fn new(log: Arc<dyn EventLog>, subscription_id: &str) -> Self {
        Self {
            log,
            stream: checkpoint_stream(subscription_id),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// The last written checkpoint. Missing or deleted streams yield
    /// `None`; unreadable data is [`SubscriptionError::BadConfigData`].
    pub fn load(&self) -> Result<Option<StreamPosition>> {
        let slice = match self.log.read_stream_backward(&self.stream, None, 1) {
            Ok(slice) => slice,
            Err(StorageError::NoStream(_)) | Err(StorageError::StreamDeleted(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(record) = slice.events.into_iter().next() else {
            return Ok(None);
        };

        let position = serde_json::from_slice::<StreamPosition>(&record.data).map_err(|e| {
            SubscriptionError::BadConfigData {
                stream: self.stream.clone(),
                reason: e.to_string(),
            }
        })?;
        debug!(stream = %self.stream, checkpoint = %position, "loaded checkpoint");
        Ok(Some(position))
    }

    pub fn write(&self, position: StreamPosition) -> Result<()> {
        let event = NewEvent::json(CHECKPOINT_EVENT_TYPE, &position)?;
        self.log.append(&self.stream, ExpectedVersion::Any, vec![event])?;
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        match self.log.delete_stream(&self.stream, false) {
            Ok(()) | Err(StorageError::NoStream(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
