//! Registry of running subscriptions and the client/admin entry points.

use crate::config::{ConfigStore, SubscriptionConfig, SubscriptionEntry, SubscriptionParams};
use crate::error::{Result, SubscriptionError};
use crate::storage::EventLog;
use crate::strategy::ConsumerStrategyRegistry;
use crate::subscription::{
    ClientKey, ClientRegistration, DropReason, IoExecutor, NakAction, PersistentSubscription, RetryPolicy,
    SubscriberMessage, SubscriptionInfo, SubscriptionWorker,
};
use crate::types::{
    subscription_id, ConnectionId, CorrelationId, EventId, EventRecord, EventSource, ResolvedEvent, Timestamp,
};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often [`Ticker`] drives timeouts and time-based checkpoints.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Owns every subscription of one event log.
pub struct PersistentSubscriptionService {
    log: Arc<dyn EventLog>,
    registry: ConsumerStrategyRegistry,
    config_store: ConfigStore,
    config: Mutex<SubscriptionConfig>,
    subscriptions: RwLock<HashMap<String, SubscriptionWorker>>,
    retry: RetryPolicy,
}

impl PersistentSubscriptionService {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self::with_registry(log, ConsumerStrategyRegistry::new())
    }

    pub fn with_registry(log: Arc<dyn EventLog>, registry: ConsumerStrategyRegistry) -> Self {
        Self {
            config_store: ConfigStore::new(log.clone()),
            log,
            registry,
            config: Mutex::new(SubscriptionConfig::default()),
            subscriptions: RwLock::new(HashMap::new()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Load persisted definitions and start their subscriptions. Returns
    /// how many were started.
    pub fn start(&self) -> Result<usize> {
        let loaded = self.config_store.load()?.unwrap_or_default();
        let mut started = 0;
        {
            let mut subscriptions = self.subscriptions.write();
            for entry in &loaded.entries {
                let id = entry.params.id();
                if subscriptions.contains_key(&id) {
                    continue;
                }
                match self.spawn(entry.params.clone()) {
                    Ok(worker) => {
                        subscriptions.insert(id, worker);
                        started += 1;
                    }
                    Err(e) => error!(subscription = %id, error = %e, "failed to start subscription"),
                }
            }
        }
        *self.config.lock() = loaded;
        info!(started, "persistent subscriptions started");
        Ok(started)
    }

    pub fn create(&self, params: SubscriptionParams, created_by: &str) -> Result<()> {
        params.validate()?;
        let id = params.id();
        let mut config = self.config.lock();
        {
            let mut subscriptions = self.subscriptions.write();
            if subscriptions.contains_key(&id) {
                return Err(SubscriptionError::AlreadyExists(id));
            }
            let worker = self.spawn(params.clone())?;
            subscriptions.insert(id.clone(), worker);
        }

        config.upsert(SubscriptionEntry {
            params,
            created_by: created_by.to_string(),
        });
        self.persist(&mut config, created_by)?;
        info!(subscription = %id, "subscription created");
        Ok(())
    }

    /// Replace the settings of an existing subscription. Connected
    /// clients are dropped and have to reconnect.
    pub fn update(&self, params: SubscriptionParams, updated_by: &str) -> Result<()> {
        params.validate()?;
        if !self.registry.contains(&params.settings.consumer_strategy) {
            return Err(SubscriptionError::UnknownConsumerStrategy(
                params.settings.consumer_strategy.name().to_string(),
            ));
        }
        let id = params.id();
        let mut config = self.config.lock();

        let old = self
            .subscriptions
            .write()
            .remove(&id)
            .ok_or_else(|| SubscriptionError::NotFound(id.clone()))?;
        let created_by = config
            .find(&params.source, &params.group)
            .map(|e| e.created_by.clone())
            .unwrap_or_else(|| updated_by.to_string());
        old.shutdown(DropReason::SubscriptionUpdated);

        let worker = self.spawn(params.clone())?;
        self.subscriptions.write().insert(id.clone(), worker);
        config.upsert(SubscriptionEntry { params, created_by });
        self.persist(&mut config, updated_by)?;
        info!(subscription = %id, "subscription updated");
        Ok(())
    }

    /// Stop a subscription and remove its checkpoint and parked messages.
    pub fn delete(&self, source: &EventSource, group: &str, deleted_by: &str) -> Result<()> {
        let id = subscription_id(source, group);
        let mut config = self.config.lock();
        let worker = self
            .subscriptions
            .write()
            .remove(&id)
            .ok_or_else(|| SubscriptionError::NotFound(id.clone()))?;
        worker.delete();

        config.remove(source, group);
        self.persist(&mut config, deleted_by)?;
        info!(subscription = %id, "subscription deleted");
        Ok(())
    }

    /// Attach a client. Unknown subscriptions and full groups answer the
    /// client with a drop notification as well as an error.
    pub fn connect(&self, source: &EventSource, group: &str, registration: ClientRegistration) -> Result<ClientKey> {
        let id = subscription_id(source, group);
        let subscriptions = self.subscriptions.read();
        let Some(worker) = subscriptions.get(&id) else {
            let _ = registration.sender.send(SubscriberMessage::Dropped {
                reason: DropReason::NotFound,
            });
            return Err(SubscriptionError::NotFound(id));
        };
        worker.add_client(registration)
    }

    pub fn unsubscribe(&self, source: &EventSource, group: &str, correlation_id: CorrelationId) -> Result<()> {
        self.with_worker(source, group, |w| w.remove_client(correlation_id, true))
    }

    /// A client connection went away; remove its clients everywhere.
    pub fn connection_closed(&self, connection_id: ConnectionId) {
        for worker in self.subscriptions.read().values() {
            if let Err(e) = worker.connection_closed(connection_id) {
                warn!(subscription = %worker.id(), error = %e, "failed to remove connection");
            }
        }
    }

    pub fn ack(&self, source: &EventSource, group: &str, correlation_id: CorrelationId, ids: Vec<EventId>) -> Result<()> {
        self.with_worker(source, group, |w| w.ack(correlation_id, ids))
    }

    pub fn nak(
        &self,
        source: &EventSource,
        group: &str,
        correlation_id: CorrelationId,
        ids: Vec<EventId>,
        action: NakAction,
        reason: &str,
    ) -> Result<()> {
        self.with_worker(source, group, |w| w.nak(correlation_id, ids, action, reason))
    }

    /// Replay parked messages below `stop_at` (all when `None`).
    pub fn replay_parked(&self, source: &EventSource, group: &str, stop_at: Option<i64>) -> Result<bool> {
        self.with_worker(source, group, |w| w.replay_parked(stop_at))
    }

    /// Route an appended event to every subscription whose source contains it.
    pub fn event_appeared(&self, record: &EventRecord) {
        let subscriptions = self.subscriptions.read();
        let mut resolved: Option<ResolvedEvent> = None;

        for worker in subscriptions.values() {
            let params = worker.params();
            if !params.source.accepts(record) {
                continue;
            }
            let event = if params.settings.resolve_link_tos && record.is_link() {
                resolved
                    .get_or_insert_with(|| self.resolve(record))
                    .clone()
            } else {
                ResolvedEvent::from_event(record.clone())
            };
            if let Err(e) = worker.live_event(event) {
                warn!(subscription = %worker.id(), error = %e, "failed to route live event");
            }
        }
    }

    pub fn tick(&self, now: Instant) {
        for worker in self.subscriptions.read().values() {
            let _ = worker.tick(now);
        }
    }

    pub fn info(&self, source: &EventSource, group: &str) -> Result<SubscriptionInfo> {
        self.with_worker(source, group, |w| w.info())
    }

    pub fn list(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<_> = self
            .subscriptions
            .read()
            .values()
            .filter_map(|w| w.info().ok())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn contains(&self, source: &EventSource, group: &str) -> bool {
        self.subscriptions.read().contains_key(&subscription_id(source, group))
    }

    /// Stop every subscription, keeping durable state.
    pub fn shutdown(&self) {
        let workers: Vec<_> = self.subscriptions.write().drain().map(|(_, w)| w).collect();
        let count = workers.len();
        for worker in workers {
            worker.shutdown(DropReason::Shutdown);
        }
        info!(count, "persistent subscriptions stopped");
    }

    fn spawn(&self, params: SubscriptionParams) -> Result<SubscriptionWorker> {
        let id = params.id();
        let executor = IoExecutor::new(
            self.log.clone(),
            &id,
            params.source.clone(),
            params.settings.resolve_link_tos,
        );
        let subscription = PersistentSubscription::new(params, &self.registry)?;
        SubscriptionWorker::spawn(subscription, executor, self.retry)
    }

    fn with_worker<T>(
        &self,
        source: &EventSource,
        group: &str,
        f: impl FnOnce(&SubscriptionWorker) -> Result<T>,
    ) -> Result<T> {
        let id = subscription_id(source, group);
        let subscriptions = self.subscriptions.read();
        let worker = subscriptions
            .get(&id)
            .ok_or(SubscriptionError::NotFound(id))?;
        f(worker)
    }

    fn resolve(&self, record: &EventRecord) -> ResolvedEvent {
        match self.log.resolve_link(record) {
            Ok(Some(target)) => ResolvedEvent::from_link(record.clone(), target),
            Ok(None) => ResolvedEvent::from_event(record.clone()),
            Err(e) => {
                debug!(stream = %record.stream_id, error = %e, "could not resolve live link");
                ResolvedEvent::from_event(record.clone())
            }
        }
    }

    fn persist(&self, config: &mut SubscriptionConfig, by: &str) -> Result<()> {
        config.updated = Timestamp::now();
        config.updated_by = by.to_string();
        self.config_store.save(config)
    }
}

/// Feed events from `feed` into `service` until the feed closes.
pub fn pump_live_events(service: Arc<PersistentSubscriptionService>, feed: Receiver<EventRecord>) -> JoinHandle<()> {
    thread::spawn(move || {
        for record in feed.iter() {
            service.event_appeared(&record);
        }
        debug!("live event feed closed");
    })
}

/// Background thread calling [`PersistentSubscriptionService::tick`].
pub struct Ticker {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start(service: Arc<PersistentSubscriptionService>, interval: Duration) -> Self {
        let (stop, stopped) = bounded::<()>(0);
        let ticks = tick(interval);
        let thread = thread::spawn(move || loop {
            select! {
                recv(ticks) -> now => match now {
                    Ok(now) => service.tick(now),
                    Err(_) => break,
                },
                recv(stopped) -> _ => break,
            }
        });
        Self {
            stop: Some(stop),
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
