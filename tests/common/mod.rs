//! Drives a subscription synchronously against an in-memory log.

#![allow(dead_code)]

use persistent_subscriptions::{
    ClientRegistration, EventLog, EventSource, ExpectedVersion, InMemoryLog, IoExecutor, NewEvent,
    PersistentSubscription, ResolvedEvent, SubscriberHandle, SubscriberMessage, SubscriptionParams,
    SubscriptionSettings,
};
use persistent_subscriptions::{ConsumerStrategyRegistry, EventId, EventRecord, StreamPosition};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Harness {
    pub log: Arc<InMemoryLog>,
    pub executor: IoExecutor,
    pub subscription: PersistentSubscription,
}

impl Harness {
    pub fn new(log: Arc<InMemoryLog>, source: EventSource, settings: SubscriptionSettings) -> Self {
        let params = SubscriptionParams::new(source, "workers", settings);
        let executor = IoExecutor::new(
            log.clone(),
            &params.id(),
            params.source.clone(),
            params.settings.resolve_link_tos,
        );
        let subscription = PersistentSubscription::new(params, &ConsumerStrategyRegistry::new()).unwrap();
        let mut harness = Self {
            log,
            executor,
            subscription,
        };
        harness.pump();
        harness
    }

    pub fn on_stream(log: Arc<InMemoryLog>, settings: SubscriptionSettings) -> Self {
        Self::new(log, EventSource::stream("orders"), settings)
    }

    /// Run queued storage requests until none are left.
    pub fn pump(&mut self) {
        loop {
            let requests = self.subscription.take_io_requests();
            if requests.is_empty() {
                return;
            }
            for request in requests {
                let completion = self.executor.execute(request);
                self.subscription.apply(completion);
            }
        }
    }

    pub fn connect(&mut self, max_in_flight: usize) -> SubscriberHandle {
        let (registration, handle) = ClientRegistration::channel(max_in_flight);
        self.subscription.add_client(registration).unwrap();
        self.pump();
        handle
    }

    /// Append to the log and hand the records to the subscription as live events.
    pub fn append_live(&mut self, stream: &str, count: usize) -> Vec<EventRecord> {
        let records = append(&self.log, stream, count);
        for record in &records {
            self.subscription
                .notify_live_event(ResolvedEvent::from_event(record.clone()));
        }
        self.pump();
        records
    }

    pub fn ack(&mut self, handle: &SubscriberHandle, ids: &[EventId]) {
        self.subscription
            .acknowledge_messages_processed(handle.correlation_id, ids);
        self.pump();
    }

    pub fn tick_after(&mut self, elapsed: Duration) {
        self.subscription.notify_clock_tick(Instant::now() + elapsed);
        self.pump();
    }

    pub fn checkpoint_events(&self) -> Vec<StreamPosition> {
        self.log
            .stream_events(&format!("$persistentsubscription-{}-checkpoint", self.subscription.id()))
            .iter()
            .map(|r| serde_json::from_slice(&r.data).unwrap())
            .collect()
    }

    pub fn parked_events(&self) -> Vec<EventRecord> {
        self.log
            .stream_events(&format!("$persistentsubscription-{}-parked", self.subscription.id()))
    }
}

pub fn append(log: &InMemoryLog, stream: &str, count: usize) -> Vec<EventRecord> {
    let events = (0..count)
        .map(|i| NewEvent::new("OrderPlaced", format!("{{\"n\":{}}}", i)))
        .collect();
    log.append(stream, ExpectedVersion::Any, events).unwrap()
}

/// Delivered events as (stream, number, retry count), draining the handle.
pub fn received(handle: &SubscriberHandle) -> Vec<(String, i64, u32)> {
    handle
        .drain()
        .into_iter()
        .filter_map(|m| match m {
            SubscriberMessage::EventAppeared { event, retry_count } => Some((
                event.original_stream_id().to_string(),
                event.original_event_number(),
                retry_count,
            )),
            SubscriberMessage::Dropped { .. } => None,
        })
        .collect()
}

/// Event ids delivered to `handle`, draining it.
pub fn received_ids(handle: &SubscriberHandle) -> Vec<EventId> {
    handle
        .drain()
        .into_iter()
        .filter_map(|m| match m {
            SubscriberMessage::EventAppeared { event, .. } => Some(event.original_event_id()),
            SubscriberMessage::Dropped { .. } => None,
        })
        .collect()
}

pub fn numbers(delivered: &[(String, i64, u32)]) -> Vec<i64> {
    delivered.iter().map(|(_, n, _)| *n).collect()
}

pub fn beginning() -> SubscriptionSettings {
    SubscriptionSettings::default().start_from_beginning()
}
