//! Subscription settings and their persisted form.

use crate::checkpoint::ContiguityMode;
use crate::error::{Result, StorageError, SubscriptionError};
use crate::storage::{EventLog, ExpectedVersion, NewEvent};
use crate::strategy::ConsumerStrategyKind;
use crate::types::{subscription_id, EventSource, StreamPosition, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Stream holding every subscription definition.
pub const CONFIG_STREAM: &str = "$persistentSubscriptionConfig";

/// Event type of config records.
pub const CONFIG_EVENT_TYPE: &str = "$PersistentConfig";

/// Version written into persisted config.
pub const CONFIG_VERSION: &str = "2";

/// Where a subscription without a checkpoint starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    /// The first event of the source.
    Beginning,
    /// Only events appended after the subscription starts.
    #[default]
    Current,
    /// A specific position (inclusive).
    Position(StreamPosition),
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Tunables of one subscription group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    /// Deliver link targets instead of links.
    pub resolve_link_tos: bool,

    pub start_from: StartFrom,

    /// Track per-client ack latency.
    pub extra_statistics: bool,

    /// How long a client has to acknowledge a message.
    /// Default: 30s
    #[serde(with = "duration_ms")]
    pub message_timeout: Duration,

    /// Deliveries after the first before a message is parked.
    /// Default: 10
    pub max_retry_count: u32,

    /// Live messages held while catching up or while clients are busy.
    /// Default: 500
    pub live_buffer_size: usize,

    /// Events per historical read.
    /// Default: 20
    pub read_batch_size: usize,

    /// Historical messages buffered ahead of delivery.
    /// Default: 500
    pub history_buffer_size: usize,

    /// Minimum time between time-based checkpoint writes.
    /// Default: 2s
    #[serde(with = "duration_ms")]
    pub checkpoint_after: Duration,

    /// Processed messages needed before a tick writes a checkpoint.
    /// Default: 10
    pub min_checkpoint_count: u64,

    /// Processed messages that force a checkpoint write.
    /// Default: 1000
    pub max_checkpoint_count: u64,

    /// Maximum connected clients, 0 for unlimited.
    pub max_subscriber_count: usize,

    pub consumer_strategy: ConsumerStrategyKind,

    pub checkpoint_mode: ContiguityMode,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            start_from: StartFrom::Current,
            extra_statistics: false,
            message_timeout: Duration::from_secs(30),
            max_retry_count: 10,
            live_buffer_size: 500,
            read_batch_size: 20,
            history_buffer_size: 500,
            checkpoint_after: Duration::from_secs(2),
            min_checkpoint_count: 10,
            max_checkpoint_count: 1000,
            max_subscriber_count: 0,
            consumer_strategy: ConsumerStrategyKind::RoundRobin,
            checkpoint_mode: ContiguityMode::Contiguous,
        }
    }
}

impl SubscriptionSettings {
    pub fn resolve_link_tos(mut self, resolve: bool) -> Self {
        self.resolve_link_tos = resolve;
        self
    }

    pub fn start_from(mut self, start: StartFrom) -> Self {
        self.start_from = start;
        self
    }

    pub fn start_from_beginning(self) -> Self {
        self.start_from(StartFrom::Beginning)
    }

    pub fn start_from_current(self) -> Self {
        self.start_from(StartFrom::Current)
    }

    pub fn extra_statistics(mut self, enabled: bool) -> Self {
        self.extra_statistics = enabled;
        self
    }

    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn live_buffer_size(mut self, size: usize) -> Self {
        self.live_buffer_size = size;
        self
    }

    pub fn read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size;
        self
    }

    pub fn history_buffer_size(mut self, size: usize) -> Self {
        self.history_buffer_size = size;
        self
    }

    pub fn checkpoint_after(mut self, after: Duration) -> Self {
        self.checkpoint_after = after;
        self
    }

    pub fn checkpoint_counts(mut self, min: u64, max: u64) -> Self {
        self.min_checkpoint_count = min;
        self.max_checkpoint_count = max;
        self
    }

    pub fn max_subscriber_count(mut self, count: usize) -> Self {
        self.max_subscriber_count = count;
        self
    }

    pub fn consumer_strategy(mut self, strategy: ConsumerStrategyKind) -> Self {
        self.consumer_strategy = strategy;
        self
    }

    pub fn checkpoint_mode(mut self, mode: ContiguityMode) -> Self {
        self.checkpoint_mode = mode;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SubscriptionError::InvalidSettings(msg));

        if self.read_batch_size == 0 {
            return invalid("read batch size must be positive".into());
        }
        if self.read_batch_size >= self.history_buffer_size {
            return invalid(format!(
                "read batch size {} must be less than history buffer size {}",
                self.read_batch_size, self.history_buffer_size
            ));
        }
        if self.live_buffer_size == 0 {
            return invalid("live buffer size must be positive".into());
        }
        if self.max_checkpoint_count == 0 {
            return invalid("max checkpoint count must be positive".into());
        }
        if self.min_checkpoint_count > self.max_checkpoint_count {
            return invalid(format!(
                "min checkpoint count {} exceeds max checkpoint count {}",
                self.min_checkpoint_count, self.max_checkpoint_count
            ));
        }
        if self.message_timeout.is_zero() {
            return invalid("message timeout must be positive".into());
        }
        Ok(())
    }
}

/// Identity and settings of one subscription.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub source: EventSource,
    pub group: String,
    pub settings: SubscriptionSettings,
}

impl SubscriptionParams {
    pub fn new(source: EventSource, group: impl Into<String>, settings: SubscriptionSettings) -> Self {
        Self {
            source,
            group: group.into(),
            settings,
        }
    }

    pub fn id(&self) -> String {
        subscription_id(&self.source, &self.group)
    }

    pub fn validate(&self) -> Result<()> {
        if let EventSource::Stream(stream) = &self.source {
            if stream.is_empty() {
                return Err(SubscriptionError::InvalidSettings("stream id is empty".into()));
            }
        }
        if self.group.is_empty() {
            return Err(SubscriptionError::InvalidSettings("group name is empty".into()));
        }
        if let StartFrom::Position(position) = self.settings.start_from {
            let matches = match (&self.source, position) {
                (EventSource::Stream(_), StreamPosition::Event(n)) => n >= 0,
                (EventSource::All { .. }, StreamPosition::Log(_)) => true,
                _ => false,
            };
            if !matches {
                return Err(SubscriptionError::InvalidSettings(format!(
                    "start position {:?} is not valid for {}",
                    position, self.source
                )));
            }
        }
        self.settings.validate()
    }
}

/// Persisted set of subscription definitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub version: String,
    pub updated: Timestamp,
    pub updated_by: String,
    pub entries: Vec<SubscriptionEntry>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            updated: Timestamp::now(),
            updated_by: String::new(),
            entries: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    pub params: SubscriptionParams,
    pub created_by: String,
}

impl SubscriptionConfig {
    pub fn find(&self, source: &EventSource, group: &str) -> Option<&SubscriptionEntry> {
        self.entries
            .iter()
            .find(|e| e.params.source == *source && e.params.group == group)
    }

    /// Insert or replace an entry.
    pub fn upsert(&mut self, entry: SubscriptionEntry) {
        self.entries
            .retain(|e| !(e.params.source == entry.params.source && e.params.group == entry.params.group));
        self.entries.push(entry);
    }

    pub fn remove(&mut self, source: &EventSource, group: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.params.source == *source && e.params.group == group));
        self.entries.len() != before
    }
}

/// Reads and writes [`SubscriptionConfig`] in [`CONFIG_STREAM`].
#[derive(Clone)]
pub struct ConfigStore {
    log: Arc<dyn EventLog>,
}

impl ConfigStore {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    /// The latest config. `Ok(None)` when nothing was ever written,
    /// [`SubscriptionError::BadConfigData`] when it cannot be parsed.
    pub fn load(&self) -> Result<Option<SubscriptionConfig>> {
        let slice = match self.log.read_stream_backward(CONFIG_STREAM, None, 1) {
            Ok(slice) => slice,
            Err(StorageError::NoStream(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(record) = slice.events.into_iter().next() else {
            return Ok(None);
        };

        let config = serde_json::from_slice::<SubscriptionConfig>(&record.data).map_err(|e| {
            SubscriptionError::BadConfigData {
                stream: CONFIG_STREAM.to_string(),
                reason: e.to_string(),
            }
        })?;
        debug!(entries = config.entries.len(), "loaded subscription config");
        Ok(Some(config))
    }

    pub fn save(&self, config: &SubscriptionConfig) -> Result<()> {
        let event = NewEvent::json(CONFIG_EVENT_TYPE, config)?;
        self.log.append(CONFIG_STREAM, ExpectedVersion::Any, vec![event])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryLog;
    use crate::types::LogPosition;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SubscriptionSettings::default().validate().is_ok());
    }

    #[test]
    fn test_batch_must_be_below_history() {
        let settings = SubscriptionSettings::default()
            .read_batch_size(50)
            .history_buffer_size(50);
        assert!(matches!(
            settings.validate(),
            Err(SubscriptionError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_empty_identifiers_rejected() {
        let empty_stream = SubscriptionParams::new(EventSource::stream(""), "g", Default::default());
        assert!(empty_stream.validate().is_err());

        let empty_group = SubscriptionParams::new(EventSource::stream("s"), "", Default::default());
        assert!(empty_group.validate().is_err());
    }

    #[test]
    fn test_start_position_must_match_source() {
        let log_start = StartFrom::Position(StreamPosition::Log(LogPosition::new(1, 1)));
        let params = SubscriptionParams::new(
            EventSource::stream("s"),
            "g",
            SubscriptionSettings::default().start_from(log_start),
        );
        assert!(params.validate().is_err());

        let params = SubscriptionParams::new(
            EventSource::all(),
            "g",
            SubscriptionSettings::default().start_from(log_start),
        );
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_settings_json_uses_millis() {
        let settings = SubscriptionSettings::default().message_timeout(Duration::from_millis(1500));
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(value["message_timeout"], 1500);

        let parsed: SubscriptionSettings = serde_json::from_str(r#"{"max_retry_count":3}"#).unwrap();
        assert_eq!(parsed.max_retry_count, 3);
        assert_eq!(parsed.checkpoint_after, Duration::from_secs(2));
    }

    #[test]
    fn test_config_store() {
        let log = Arc::new(InMemoryLog::new());
        let store = ConfigStore::new(log.clone());
        assert!(store.load().unwrap().is_none());

        let mut config = SubscriptionConfig::default();
        config.upsert(SubscriptionEntry {
            params: SubscriptionParams::new(EventSource::stream("s"), "g", Default::default()),
            created_by: "admin".into(),
        });
        store.save(&config).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.find(&EventSource::stream("s"), "g").is_some());
    }

    #[test]
    fn test_corrupt_config() {
        let log = Arc::new(InMemoryLog::new());
        log.append(
            CONFIG_STREAM,
            ExpectedVersion::Any,
            vec![NewEvent::new(CONFIG_EVENT_TYPE, b"{\"version\":".to_vec())],
        )
        .unwrap();
        assert!(matches!(
            ConfigStore::new(log).load(),
            Err(SubscriptionError::BadConfigData { .. })
        ));
    }
}
