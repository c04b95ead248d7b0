//! # Persistent Subscriptions
//!
//! Competing-consumer subscriptions over an append-only event log.
//!
//! Many clients share one logical subscription (a source stream or the
//! whole log, plus a group name). Events are delivered at least once, each
//! message is acknowledged individually, and unacknowledged messages are
//! retried on timeout or NAK until they are parked in a dead-letter stream.
//! Progress is checkpointed durably so a restarted subscription resumes
//! where its clients left off.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: one state machine per (source, group), run on its own thread
//! - **Consumer strategies**: round robin, dispatch-to-single and pinned assignment
//! - **Checkpoints**: gap-free acknowledgement prefixes, written by count or time
//! - **Parking**: dead-lettered messages with a monotonic replay cursor
//!
//! ## Example
//!
//! ```ignore
//! use persistent_subscriptions::*;
//!
//! let log = Arc::new(InMemoryLog::new());
//! let service = Arc::new(PersistentSubscriptionService::new(log.clone()));
//! service.start()?;
//! pump_live_events(service.clone(), log.subscribe());
//! let _ticker = Ticker::start(service.clone(), DEFAULT_TICK_INTERVAL);
//!
//! let settings = SubscriptionSettings::default().start_from_beginning();
//! service.create(SubscriptionParams::new(EventSource::stream("orders"), "billing", settings), "admin")?;
//!
//! let (registration, handle) = ClientRegistration::channel(10);
//! service.connect(&EventSource::stream("orders"), "billing", registration)?;
//! while let Ok(SubscriberMessage::EventAppeared { event, .. }) = handle.recv() {
//!     service.ack(&EventSource::stream("orders"), "billing", handle.correlation_id, vec![event.original_event_id()])?;
//! }
//! ```

pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod outstanding;
pub mod parker;
pub mod service;
pub mod stats;
pub mod storage;
pub mod strategy;
pub mod subscription;
pub mod types;

// Re-exports
pub use buffer::{BufferTicket, LiveOutcome, StreamBuffer};
pub use checkpoint::{
    checkpoint_stream, CheckpointPolicy, CheckpointQueue, CheckpointStore, ContiguityMode, CHECKPOINT_EVENT_TYPE,
};
pub use config::{
    ConfigStore, StartFrom, SubscriptionConfig, SubscriptionEntry, SubscriptionParams, SubscriptionSettings,
    CONFIG_EVENT_TYPE, CONFIG_STREAM,
};
pub use error::{Result, StorageError, SubscriptionError};
pub use outstanding::{CacheGauge, OutstandingMessage, OutstandingMessageCache, StartMessageResult};
pub use parker::{parked_stream, MessageParker, ParkedBatch, ParkedMessage, ParkedMetadata, ParkedStats};
pub use service::{pump_live_events, PersistentSubscriptionService, Ticker, DEFAULT_TICK_INTERVAL};
pub use stats::{LatencyMeasurements, RequestStatistics};
pub use storage::{BackwardSlice, EventLog, ExpectedVersion, InMemoryLog, NewEvent, ReadSlice, StorageResult};
pub use strategy::{
    Assignment, ConsumerStrategy, ConsumerStrategyKind, ConsumerStrategyRegistry, DispatchToSingleStrategy,
    KeyHasher, PinKey, PinnedStrategy, RoundRobinStrategy,
};
pub use subscription::{
    ClientKey, ClientRegistration, DropReason, IoCompletion, IoExecutor, IoRequest, NakAction,
    PersistentSubscription, RetryPolicy, SubscriberHandle, SubscriberMessage, SubscriptionInfo,
    SubscriptionPhase, SubscriptionWorker,
};
pub use types::*;
