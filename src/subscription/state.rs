//! The per-subscription state machine.
//!
//! A [`PersistentSubscription`] is owned by exactly one thread. It never
//! performs storage I/O itself: reads, checkpoint writes and parking are
//! queued as [`IoRequest`]s (see [`PersistentSubscription::take_io_requests`])
//! and their results come back through [`PersistentSubscription::apply`].

use super::client::{ClientInfo, ClientKey, ClientSet};
use super::io::{IoCompletion, IoRequest};
use super::message::{ClientRegistration, DropReason, SubscriberMessage};
use crate::buffer::{LiveOutcome, StreamBuffer};
use crate::checkpoint::CheckpointPolicy;
use crate::config::{StartFrom, SubscriptionParams, SubscriptionSettings};
use crate::error::{Result, SubscriptionError};
use crate::outstanding::{CacheGauge, OutstandingMessage, OutstandingMessageCache, StartMessageResult};
use crate::parker::{ParkedBatch, ParkedStats};
use crate::storage::ReadSlice;
use crate::strategy::{Assignment, ConsumerStrategy, ConsumerStrategyRegistry};
use crate::types::{ConnectionId, CorrelationId, EventId, EventSource, ResolvedEvent, StreamPosition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Park reason used when retries run out.
pub const MAX_RETRY_REASON: &str = "Max retry count reached";

/// What a client wants done with messages it could not process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NakAction {
    Unknown,
    /// Move to the parked stream.
    Park,
    /// Redeliver.
    Retry,
    /// Treat as processed without delivering again.
    Skip,
    /// Redeliver elsewhere and drop the client.
    Stop,
}

/// Lifecycle phase as reported to diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPhase {
    /// Waiting for the checkpoint.
    Idle,
    /// Caught up; new events are dispatched as they arrive.
    Push,
    /// Paging history or holding a backlog.
    Pull,
    /// Deleted or shut down.
    Stopped,
}

/// Diagnostic snapshot of a subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub source: String,
    pub group: String,
    pub phase: SubscriptionPhase,
    pub connections: Vec<ClientInfo>,
    pub outstanding_count: usize,
    pub retry_buffer_count: usize,
    pub read_buffer_count: usize,
    pub live_buffer_count: usize,
    pub total_items: u64,
    pub last_checkpoint: Option<StreamPosition>,
    pub last_known_position: Option<StreamPosition>,
    pub parked: ParkedStats,
    pub load_error: Option<String>,
    pub settings: SubscriptionSettings,
}

pub struct PersistentSubscription {
    id: String,
    params: SubscriptionParams,
    strategy: Box<dyn ConsumerStrategy>,
    clients: ClientSet,
    outstanding: OutstandingMessageCache,
    buffer: StreamBuffer,
    checkpoint: CheckpointPolicy,
    requests: Vec<IoRequest>,

    loaded: bool,
    load_in_flight: bool,
    /// Durable state is corrupt; loading is not retried.
    load_blocked: bool,
    load_error: Option<String>,
    stopped: bool,

    next_read: Option<StreamPosition>,
    read_in_flight: bool,
    checkpoint_in_flight: bool,
    last_checkpoint: Option<StreamPosition>,
    last_known_position: Option<StreamPosition>,

    parks_in_flight: usize,
    failed_parks: Vec<(OutstandingMessage, String)>,
    replay_in_flight: bool,
    parked: ParkedStats,
    total_items: u64,
}

impl PersistentSubscription {
    /// Build a subscription using the strategy named in its settings.
    pub fn new(params: SubscriptionParams, registry: &ConsumerStrategyRegistry) -> Result<Self> {
        params.validate()?;
        let strategy = registry.create(&params.settings.consumer_strategy)?;
        Ok(Self::with_strategy(params, strategy))
    }

    /// Build a subscription with an explicit strategy. The checkpoint and
    /// parked statistics loads are queued immediately.
    pub fn with_strategy(params: SubscriptionParams, strategy: Box<dyn ConsumerStrategy>) -> Self {
        let settings = &params.settings;
        let mut subscription = Self {
            id: params.id(),
            strategy,
            clients: ClientSet::new(settings.extra_statistics),
            outstanding: OutstandingMessageCache::new(),
            buffer: StreamBuffer::new(settings.live_buffer_size, settings.history_buffer_size),
            checkpoint: new_policy(settings, None),
            requests: Vec::new(),
            loaded: false,
            load_in_flight: false,
            load_blocked: false,
            load_error: None,
            stopped: false,
            next_read: None,
            read_in_flight: false,
            checkpoint_in_flight: false,
            last_checkpoint: None,
            last_known_position: None,
            parks_in_flight: 0,
            failed_parks: Vec::new(),
            replay_in_flight: false,
            parked: ParkedStats::default(),
            total_items: 0,
            params,
        };
        subscription.request_load();
        subscription.requests.push(IoRequest::LoadParkedStats);
        subscription
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &SubscriptionParams {
        &self.params
    }

    pub fn source(&self) -> &EventSource {
        &self.params.source
    }

    pub fn settings(&self) -> &SubscriptionSettings {
        &self.params.settings
    }

    pub fn phase(&self) -> SubscriptionPhase {
        if self.stopped {
            SubscriptionPhase::Stopped
        } else if !self.loaded {
            SubscriptionPhase::Idle
        } else if self.buffer.is_live() && self.buffer.is_empty() {
            SubscriptionPhase::Push
        } else {
            SubscriptionPhase::Pull
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.count()
    }

    /// Counters readable from other threads.
    pub fn outstanding_gauge(&self) -> Arc<CacheGauge> {
        self.outstanding.gauge()
    }

    pub fn last_checkpoint(&self) -> Option<StreamPosition> {
        self.last_checkpoint
    }

    pub fn parked_stats(&self) -> ParkedStats {
        self.parked
    }

    /// Storage work queued since the last call.
    pub fn take_io_requests(&mut self) -> Vec<IoRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Feed back the result of an earlier request.
    pub fn apply(&mut self, completion: IoCompletion) {
        match completion {
            IoCompletion::CheckpointLoaded(result) => self.on_checkpoint_loaded(result),
            IoCompletion::ReadCompleted { from, result } => self.handle_read_completed(from, result),
            IoCompletion::CheckpointWritten { position, result } => {
                self.on_checkpoint_written(position, result)
            }
            IoCompletion::MessageParked {
                message,
                reason,
                result,
            } => self.on_message_parked(message, reason, result),
            IoCompletion::ParkedStatsLoaded(result) => self.on_parked_stats_loaded(result),
            IoCompletion::ParkedMessagesRead(result) => self.on_parked_messages_read(result),
            IoCompletion::ParkedReprocessed(result) => self.on_parked_reprocessed(result),
            IoCompletion::Deleted(result) => {
                if let Err(e) = result {
                    warn!(subscription = %self.id, error = %e, "failed to delete subscription state");
                }
            }
        }
    }

    // ---- loading and reading ----

    fn request_load(&mut self) {
        self.load_in_flight = true;
        self.requests.push(IoRequest::LoadCheckpoint);
    }

    pub fn on_checkpoint_loaded(&mut self, result: Result<Option<StreamPosition>>) {
        if self.stopped || self.loaded {
            return;
        }
        self.load_in_flight = false;

        let checkpoint = match result {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                error!(subscription = %self.id, error = %e, "failed to load checkpoint");
                self.load_blocked = matches!(e, SubscriptionError::BadConfigData { .. });
                self.load_error = Some(e.to_string());
                return;
            }
        };

        self.loaded = true;
        self.load_error = None;
        self.last_checkpoint = checkpoint;
        self.checkpoint = new_policy(&self.params.settings, checkpoint);

        match checkpoint {
            Some(position) => self.next_read = Some(position.next()),
            None => match self.params.settings.start_from {
                StartFrom::Current => {
                    self.buffer.move_to_live();
                }
                StartFrom::Beginning => self.next_read = Some(self.params.source.start_position()),
                StartFrom::Position(position) => self.next_read = Some(position),
            },
        }
        info!(
            subscription = %self.id,
            checkpoint = ?checkpoint,
            start = ?self.next_read,
            "subscription loaded"
        );

        self.issue_read_if_needed();
        self.try_push_buffered();
    }

    fn issue_read_if_needed(&mut self) {
        if !self.loaded || self.stopped || self.read_in_flight || self.buffer.is_live() {
            return;
        }
        let batch = self.params.settings.read_batch_size;
        if !self.buffer.can_accept_read(batch) {
            return;
        }
        let Some(from) = self.next_read.or_else(|| self.buffer.resume_position()) else {
            return;
        };
        self.read_in_flight = true;
        self.requests.push(IoRequest::ReadEvents { from, count: batch });
    }

    pub fn handle_read_completed(&mut self, from: StreamPosition, result: Result<ReadSlice>) {
        if self.stopped || !self.loaded || !self.read_in_flight {
            return;
        }
        self.read_in_flight = false;

        let slice = match result {
            Ok(slice) => slice,
            Err(e) => {
                warn!(subscription = %self.id, from = %from, error = %e, "read failed, retrying on tick");
                return;
            }
        };

        let empty = slice.events.is_empty();
        let mut added = 0usize;
        for event in slice.events {
            let position = event.position_in(&self.params.source);
            self.observe(position);
            if self
                .buffer
                .add_read_message(OutstandingMessage::new(Arc::new(event), position))
            {
                added += 1;
            }
        }
        self.next_read = Some(slice.next);
        debug!(subscription = %self.id, from = %from, added, end = slice.is_end_of_stream, "read completed");

        if slice.is_end_of_stream && !self.buffer.move_to_live() {
            // held live messages were dropped past what reads have reached
            self.next_read = self.buffer.resume_position().or(self.next_read);
            if empty {
                warn!(subscription = %self.id, from = %from, "dropped live messages not readable yet");
                self.try_push_buffered();
                return;
            }
        }
        self.try_push_buffered();
        self.issue_read_if_needed();
    }

    /// A new event was written to the log.
    pub fn notify_live_event(&mut self, event: ResolvedEvent) {
        if !self.loaded || self.stopped || !self.params.source.accepts(event.original_event()) {
            return;
        }
        let position = event.position_in(&self.params.source);
        self.observe(position);

        match self
            .buffer
            .add_live_message(OutstandingMessage::new(Arc::new(event), position))
        {
            LiveOutcome::Overflowed => {
                self.next_read = self.buffer.resume_position();
                warn!(subscription = %self.id, resume = ?self.next_read, "live buffer overflowed");
            }
            LiveOutcome::Duplicate | LiveOutcome::Held | LiveOutcome::Queued => {}
        }
        self.try_push_buffered();
        self.issue_read_if_needed();
    }

    fn observe(&mut self, position: StreamPosition) {
        self.last_known_position = self.last_known_position.max(Some(position));
    }

    // ---- delivery ----

    /// Hand buffered messages to clients until the buffer or capacity runs out.
    pub fn try_push_buffered(&mut self) {
        if self.stopped || self.clients.is_empty() {
            return;
        }
        let now = Instant::now();

        for ticket in self.buffer.scan() {
            let Some(message) = self.buffer.get(ticket) else {
                continue;
            };
            if self.outstanding.contains(message.event_id()) {
                self.buffer.mark_sent(ticket);
                continue;
            }
            match self.strategy.assign(message, &self.clients) {
                Assignment::NoMoreCapacity => break,
                Assignment::Skipped => continue,
                Assignment::Assigned(key) => {
                    if let Some(message) = self.buffer.mark_sent(ticket) {
                        self.deliver(key, message, now);
                    }
                }
            }
        }
    }

    fn deliver(&mut self, key: ClientKey, message: OutstandingMessage, now: Instant) {
        let deadline = now + self.params.settings.message_timeout;
        if self.outstanding.start_message(message.clone(), deadline) == StartMessageResult::SkippedDuplicate {
            return;
        }
        let Some(client) = self.clients.get_mut(key) else {
            self.outstanding.remove(message.event_id());
            self.buffer.add_retry_message(message);
            return;
        };

        client.track(message.clone(), now);
        self.total_items += 1;
        if !client.deliver(&message) {
            // stays outstanding; the clock retries it
            warn!(
                subscription = %self.id,
                client = ?key,
                event = %message.event_id(),
                "failed to deliver message"
            );
        }
    }

    // ---- acknowledgements ----

    pub fn acknowledge_messages_processed(&mut self, correlation_id: CorrelationId, ids: &[EventId]) {
        if self.stopped {
            return;
        }
        let now = Instant::now();
        for &id in ids {
            let Some(message) = self.take_outstanding(id, Some(correlation_id), true, now) else {
                debug!(subscription = %self.id, event = %id, "ack for unknown message ignored");
                continue;
            };
            self.mark_processed(&message);
        }
        self.try_checkpoint_on_ack(now);
        self.try_push_buffered();
        self.issue_read_if_needed();
    }

    pub fn not_acknowledge_messages_processed(
        &mut self,
        correlation_id: CorrelationId,
        ids: &[EventId],
        action: NakAction,
        reason: &str,
    ) {
        if self.stopped {
            return;
        }
        let now = Instant::now();
        for &id in ids {
            let Some(message) = self.take_outstanding(id, Some(correlation_id), false, now) else {
                continue;
            };
            debug!(subscription = %self.id, event = %id, ?action, reason, "message nak'd");
            match action {
                NakAction::Park => self.park(message, reason),
                NakAction::Skip => self.mark_processed(&message),
                NakAction::Retry | NakAction::Unknown | NakAction::Stop => self.retry_message(message),
            }
        }

        if action == NakAction::Stop {
            self.remove_client_by_correlation_id(correlation_id, true);
        }
        self.try_checkpoint_on_ack(now);
        self.try_push_buffered();
        self.issue_read_if_needed();
    }

    /// Remove a message from the cache and from the client holding it.
    fn take_outstanding(
        &mut self,
        id: EventId,
        correlation_id: Option<CorrelationId>,
        completed: bool,
        now: Instant,
    ) -> Option<OutstandingMessage> {
        let message = self.outstanding.remove(id)?;
        let holder = correlation_id
            .and_then(|c| self.clients.key_for_correlation(c))
            .filter(|k| self.clients.get(*k).map_or(false, |c| c.holds(id)))
            .or_else(|| self.clients.holder_of(id));
        if let Some(client) = holder.and_then(|k| self.clients.get_mut(k)) {
            if completed {
                client.complete(id, now);
            } else {
                client.release(id);
            }
        }
        Some(message)
    }

    fn mark_processed(&mut self, message: &OutstandingMessage) {
        if !message.replayed {
            self.checkpoint.message_processed(message.sequence, message.position);
        }
    }

    /// Queue a message for another delivery, or park it once its retries
    /// are used up.
    fn retry_message(&mut self, message: OutstandingMessage) {
        if message.retry_count >= self.params.settings.max_retry_count {
            self.park(message, MAX_RETRY_REASON);
        } else {
            self.buffer.add_retry_message(message.next_retry());
        }
    }

    fn park(&mut self, message: OutstandingMessage, reason: &str) {
        self.parks_in_flight += 1;
        self.requests.push(IoRequest::ParkMessage {
            message,
            reason: reason.to_string(),
        });
    }

    pub fn on_message_parked(&mut self, message: OutstandingMessage, reason: String, result: Result<()>) {
        if self.stopped {
            return;
        }
        self.parks_in_flight = self.parks_in_flight.saturating_sub(1);
        match result {
            Ok(()) => {
                info!(subscription = %self.id, event = %message.event_id(), reason, "message parked");
                self.parked.count += 1;
                self.mark_processed(&message);
                self.try_checkpoint_on_ack(Instant::now());
            }
            Err(e) => {
                error!(subscription = %self.id, event = %message.event_id(), error = %e, "failed to park message");
                self.failed_parks.push((message, reason));
            }
        }
    }

    // ---- clock ----

    /// Periodic work: expire messages, retry failed I/O and write
    /// time-based checkpoints.
    pub fn notify_clock_tick(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        if !self.loaded {
            if !self.load_in_flight && !self.load_blocked {
                self.request_load();
            }
            return;
        }

        for expired in self.outstanding.messages_expiring_before(now) {
            let id = expired.event_id();
            if let Some(message) = self.take_outstanding(id, None, false, now) {
                debug!(subscription = %self.id, event = %id, retry = message.retry_count, "message timed out");
                self.retry_message(message);
            }
        }

        for (message, reason) in std::mem::take(&mut self.failed_parks) {
            self.park(message, &reason);
        }

        let due = self.checkpoint.due_on_tick(now, self.outstanding.lowest_sequence());
        self.write_checkpoint(due, now);

        self.try_push_buffered();
        self.issue_read_if_needed();
    }

    // ---- checkpoints ----

    fn try_checkpoint_on_ack(&mut self, now: Instant) {
        let due = self.checkpoint.due_on_ack(self.outstanding.lowest_sequence());
        self.write_checkpoint(due, now);
    }

    fn write_checkpoint(&mut self, due: Option<(u64, StreamPosition)>, now: Instant) {
        if self.checkpoint_in_flight {
            return;
        }
        let Some((sequence, position)) = due else {
            return;
        };
        self.checkpoint.write_started(sequence, position, now);
        self.checkpoint_in_flight = true;
        self.requests.push(IoRequest::WriteCheckpoint { position });
    }

    pub fn on_checkpoint_written(&mut self, position: StreamPosition, result: Result<()>) {
        if self.stopped {
            return;
        }
        self.checkpoint_in_flight = false;
        self.checkpoint.write_completed(result.is_ok());
        match result {
            Ok(()) => {
                debug!(subscription = %self.id, checkpoint = %position, "checkpoint written");
                self.last_checkpoint = self.last_checkpoint.max(Some(position));
            }
            Err(e) => {
                error!(
                    subscription = %self.id,
                    checkpoint = %position,
                    error = %e,
                    "failed to write checkpoint, retrying when due"
                );
            }
        }
    }

    // ---- clients ----

    pub fn add_client(&mut self, registration: ClientRegistration) -> Result<ClientKey> {
        if self.stopped {
            let _ = registration.sender.send(SubscriberMessage::Dropped {
                reason: DropReason::PersistentSubscriptionDeleted,
            });
            return Err(SubscriptionError::Deleted(self.id.clone()));
        }
        let max = self.params.settings.max_subscriber_count;
        if max > 0 && self.clients.len() >= max {
            let _ = registration.sender.send(SubscriberMessage::Dropped {
                reason: DropReason::SubscriberMaxCountReached,
            });
            return Err(SubscriptionError::MaxSubscribersReached(self.id.clone()));
        }

        let correlation_id = registration.correlation_id;
        let key = self.clients.add(registration);
        self.strategy.client_added(key, &self.clients);
        info!(
            subscription = %self.id,
            client = ?key,
            correlation = %correlation_id,
            clients = self.clients.len(),
            "client added"
        );
        self.try_push_buffered();
        self.issue_read_if_needed();
        Ok(key)
    }

    /// Returns false when no client has this correlation id.
    pub fn remove_client_by_correlation_id(&mut self, correlation_id: CorrelationId, send_drop: bool) -> bool {
        let Some(key) = self.clients.key_for_correlation(correlation_id) else {
            return false;
        };
        self.remove_client(key, send_drop.then_some(DropReason::Unsubscribed));
        true
    }

    /// Remove every client of a closed connection. Returns how many were removed.
    pub fn remove_client_by_connection_id(&mut self, connection_id: ConnectionId) -> usize {
        let keys = self.clients.keys_for_connection(connection_id);
        for &key in &keys {
            self.remove_client(key, None);
        }
        keys.len()
    }

    fn remove_client(&mut self, key: ClientKey, reason: Option<DropReason>) {
        let Some(mut client) = self.clients.remove(key) else {
            return;
        };
        self.strategy.client_removed(key, &self.clients);
        if let Some(reason) = reason {
            client.send_dropped(reason);
        }

        let in_flight = client.drain_in_flight();
        info!(
            subscription = %self.id,
            client = ?key,
            redelivering = in_flight.len(),
            "client removed"
        );
        for message in in_flight {
            if self.outstanding.remove(message.event_id()).is_some() {
                self.retry_message(message);
            }
        }
        self.try_push_buffered();
        self.issue_read_if_needed();
    }

    // ---- parked messages ----

    /// Start replaying parked messages below `stop_at` (all when `None`).
    /// Returns false while an earlier replay is still running.
    pub fn retry_parked_messages(&mut self, stop_at: Option<i64>) -> bool {
        if self.stopped || self.replay_in_flight {
            return false;
        }
        self.replay_in_flight = true;
        self.requests.push(IoRequest::ReadParked { stop_at });
        true
    }

    pub fn on_parked_messages_read(&mut self, result: Result<ParkedBatch>) {
        if self.stopped {
            return;
        }
        let batch = match result {
            Ok(batch) => batch,
            Err(e) => {
                error!(subscription = %self.id, error = %e, "failed to read parked messages");
                self.replay_in_flight = false;
                return;
            }
        };

        let mut replayed = 0usize;
        for parked in batch.messages {
            let Some(event) = parked.event else {
                debug!(subscription = %self.id, parked = parked.parked_number, "parked event no longer exists");
                continue;
            };
            let position = event.position_in(&self.params.source);
            self.buffer
                .add_retry_message(OutstandingMessage::replayed(Arc::new(event), position));
            replayed += 1;
        }
        info!(subscription = %self.id, replayed, cursor = batch.next_cursor, "replaying parked messages");

        self.requests.push(IoRequest::MarkParkedReprocessed {
            sequence: batch.next_cursor,
        });
        self.try_push_buffered();
    }

    pub fn on_parked_reprocessed(&mut self, result: Result<()>) {
        if self.stopped {
            return;
        }
        self.replay_in_flight = false;
        if let Err(e) = result {
            error!(subscription = %self.id, error = %e, "failed to mark parked messages reprocessed");
        }
        self.requests.push(IoRequest::LoadParkedStats);
    }

    pub fn on_parked_stats_loaded(&mut self, result: Result<ParkedStats>) {
        if self.stopped {
            return;
        }
        match result {
            Ok(stats) => self.parked = stats,
            Err(e) => warn!(subscription = %self.id, error = %e, "failed to load parked message stats"),
        }
    }

    // ---- teardown ----

    /// Drop every client and queue deletion of the checkpoint and parked
    /// streams. Later completions are ignored.
    pub fn delete(&mut self) {
        if self.stopped {
            return;
        }
        self.stop(DropReason::PersistentSubscriptionDeleted);
        self.requests.push(IoRequest::DeleteCheckpoint);
        self.requests.push(IoRequest::DeleteParked);
        info!(subscription = %self.id, "subscription deleted");
    }

    /// Drop every client, keeping durable state.
    pub fn shutdown(&mut self, reason: DropReason) {
        if self.stopped {
            return;
        }
        self.stop(reason);
        info!(subscription = %self.id, "subscription stopped");
    }

    fn stop(&mut self, reason: DropReason) {
        self.stopped = true;
        for client in self.clients.drain() {
            client.send_dropped(reason.clone());
        }
        self.outstanding.drain();
        self.buffer.drain();
        self.failed_parks.clear();
        self.requests.clear();
    }

    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            source: self.params.source.name().to_string(),
            group: self.params.group.clone(),
            phase: self.phase(),
            connections: self.clients.iter().map(|c| c.info()).collect(),
            outstanding_count: self.outstanding.count(),
            retry_buffer_count: self.buffer.retry_count(),
            read_buffer_count: self.buffer.read_count(),
            live_buffer_count: self.buffer.live_count(),
            total_items: self.total_items,
            last_checkpoint: self.last_checkpoint,
            last_known_position: self.last_known_position,
            parked: self.parked,
            load_error: self.load_error.clone(),
            settings: self.params.settings.clone(),
        }
    }
}

fn new_policy(settings: &SubscriptionSettings, loaded: Option<StreamPosition>) -> CheckpointPolicy {
    CheckpointPolicy::new(
        settings.min_checkpoint_count,
        settings.max_checkpoint_count,
        settings.checkpoint_after,
        settings.checkpoint_mode,
        Instant::now(),
    )
    .with_loaded(loaded)
}
