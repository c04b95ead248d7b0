//! One thread per subscription.
//!
//! Every operation on a subscription is a [`SubscriptionCommand`] sent to
//! its worker, which owns the [`PersistentSubscription`] exclusively and
//! applies commands one at a time. Storage requests go to an [`IoWorker`]
//! whose completions come back through the same channel.

use super::client::ClientKey;
use super::io::{IoCompletion, IoExecutor, IoWorker, RetryPolicy};
use super::message::{ClientRegistration, DropReason};
use super::state::{NakAction, PersistentSubscription, SubscriptionInfo};
use crate::config::SubscriptionParams;
use crate::error::{Result, SubscriptionError};
use crate::outstanding::CacheGauge;
use crate::types::{ConnectionId, CorrelationId, EventId, ResolvedEvent};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Messages processed by a subscription worker.
#[derive(Debug)]
pub enum SubscriptionCommand {
    LiveEvent(ResolvedEvent),
    AddClient {
        registration: ClientRegistration,
        reply: Sender<Result<ClientKey>>,
    },
    RemoveClient {
        correlation_id: CorrelationId,
        send_drop: bool,
    },
    ConnectionClosed(ConnectionId),
    Ack {
        correlation_id: CorrelationId,
        ids: Vec<EventId>,
    },
    Nak {
        correlation_id: CorrelationId,
        ids: Vec<EventId>,
        action: NakAction,
        reason: String,
    },
    Tick(Instant),
    ReplayParked {
        stop_at: Option<i64>,
        reply: Sender<bool>,
    },
    GetInfo(Sender<SubscriptionInfo>),
    Io(IoCompletion),
    Delete,
    Shutdown(DropReason),
}

/// Handle to a running subscription.
pub struct SubscriptionWorker {
    id: String,
    params: SubscriptionParams,
    sender: Sender<SubscriptionCommand>,
    gauge: Arc<CacheGauge>,
    thread: Option<JoinHandle<()>>,
}

impl SubscriptionWorker {
    pub fn spawn(subscription: PersistentSubscription, executor: IoExecutor, retry: RetryPolicy) -> Result<Self> {
        let id = subscription.id().to_string();
        let params = subscription.params().clone();
        let gauge = subscription.outstanding_gauge();
        let (sender, receiver) = unbounded();

        let completions = sender.clone();
        let io = IoWorker::spawn(executor, retry, move |completion| {
            completions.send(SubscriptionCommand::Io(completion)).is_ok()
        });

        let thread = thread::Builder::new()
            .name(format!("subscription-{}", id))
            .spawn(move || run(subscription, io, receiver))
            .map_err(|e| SubscriptionError::WorkerStopped(format!("{}: {}", id, e)))?;

        debug!(subscription = %id, "subscription worker started");
        Ok(Self {
            id,
            params,
            sender,
            gauge,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &SubscriptionParams {
        &self.params
    }

    /// Outstanding-message counters, readable without a round trip.
    pub fn gauge(&self) -> &CacheGauge {
        &self.gauge
    }

    pub fn send(&self, command: SubscriptionCommand) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| SubscriptionError::WorkerStopped(self.id.clone()))
    }

    pub fn live_event(&self, event: ResolvedEvent) -> Result<()> {
        self.send(SubscriptionCommand::LiveEvent(event))
    }

    pub fn add_client(&self, registration: ClientRegistration) -> Result<ClientKey> {
        let (reply, response) = bounded(1);
        self.send(SubscriptionCommand::AddClient { registration, reply })?;
        self.wait(response)?
    }

    pub fn remove_client(&self, correlation_id: CorrelationId, send_drop: bool) -> Result<()> {
        self.send(SubscriptionCommand::RemoveClient {
            correlation_id,
            send_drop,
        })
    }

    pub fn connection_closed(&self, connection_id: ConnectionId) -> Result<()> {
        self.send(SubscriptionCommand::ConnectionClosed(connection_id))
    }

    pub fn ack(&self, correlation_id: CorrelationId, ids: Vec<EventId>) -> Result<()> {
        self.send(SubscriptionCommand::Ack { correlation_id, ids })
    }

    pub fn nak(
        &self,
        correlation_id: CorrelationId,
        ids: Vec<EventId>,
        action: NakAction,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.send(SubscriptionCommand::Nak {
            correlation_id,
            ids,
            action,
            reason: reason.into(),
        })
    }

    pub fn tick(&self, now: Instant) -> Result<()> {
        self.send(SubscriptionCommand::Tick(now))
    }

    /// Returns false when a replay is already running.
    pub fn replay_parked(&self, stop_at: Option<i64>) -> Result<bool> {
        let (reply, response) = bounded(1);
        self.send(SubscriptionCommand::ReplayParked { stop_at, reply })?;
        self.wait(response)
    }

    pub fn info(&self) -> Result<SubscriptionInfo> {
        let (reply, response) = bounded(1);
        self.send(SubscriptionCommand::GetInfo(reply))?;
        self.wait(response)
    }

    /// Delete durable state and stop.
    pub fn delete(mut self) {
        let _ = self.sender.send(SubscriptionCommand::Delete);
        self.join();
    }

    /// Stop, dropping clients with `reason`.
    pub fn shutdown(mut self, reason: DropReason) {
        let _ = self.sender.send(SubscriptionCommand::Shutdown(reason));
        self.join();
    }

    fn wait<T>(&self, response: Receiver<T>) -> Result<T> {
        response
            .recv()
            .map_err(|_| SubscriptionError::WorkerStopped(self.id.clone()))
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(subscription = %self.id, "subscription worker panicked");
            }
        }
    }
}

impl Drop for SubscriptionWorker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.sender.send(SubscriptionCommand::Shutdown(DropReason::Shutdown));
            self.join();
        }
    }
}

fn run(mut subscription: PersistentSubscription, mut io: IoWorker, receiver: Receiver<SubscriptionCommand>) {
    let submit = |subscription: &mut PersistentSubscription, io: &IoWorker| {
        for request in subscription.take_io_requests() {
            if !io.submit(request) {
                warn!(subscription = %subscription.id(), "io worker unavailable");
            }
        }
    };
    submit(&mut subscription, &io);

    while let Ok(command) = receiver.recv() {
        let stop = matches!(command, SubscriptionCommand::Delete | SubscriptionCommand::Shutdown(_));
        match command {
            SubscriptionCommand::LiveEvent(event) => subscription.notify_live_event(event),
            SubscriptionCommand::AddClient { registration, reply } => {
                let _ = reply.send(subscription.add_client(registration));
            }
            SubscriptionCommand::RemoveClient {
                correlation_id,
                send_drop,
            } => {
                subscription.remove_client_by_correlation_id(correlation_id, send_drop);
            }
            SubscriptionCommand::ConnectionClosed(connection_id) => {
                subscription.remove_client_by_connection_id(connection_id);
            }
            SubscriptionCommand::Ack { correlation_id, ids } => {
                subscription.acknowledge_messages_processed(correlation_id, &ids)
            }
            SubscriptionCommand::Nak {
                correlation_id,
                ids,
                action,
                reason,
            } => subscription.not_acknowledge_messages_processed(correlation_id, &ids, action, &reason),
            SubscriptionCommand::Tick(now) => subscription.notify_clock_tick(now),
            SubscriptionCommand::ReplayParked { stop_at, reply } => {
                let _ = reply.send(subscription.retry_parked_messages(stop_at));
            }
            SubscriptionCommand::GetInfo(reply) => {
                let _ = reply.send(subscription.info());
            }
            SubscriptionCommand::Io(completion) => subscription.apply(completion),
            SubscriptionCommand::Delete => subscription.delete(),
            SubscriptionCommand::Shutdown(reason) => subscription.shutdown(reason),
        }
        submit(&mut subscription, &io);
        if stop {
            break;
        }
    }

    // let queued deletes finish
    io.stop();
    info!(subscription = %subscription.id(), "subscription worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriptionSettings;
    use crate::storage::{EventLog, ExpectedVersion, InMemoryLog, NewEvent};
    use crate::strategy::ConsumerStrategyRegistry;
    use crate::subscription::message::SubscriberMessage;
    use crate::subscription::state::SubscriptionPhase;
    use crate::types::EventSource;
    use std::time::Duration;

    fn spawn(log: Arc<InMemoryLog>, settings: SubscriptionSettings) -> SubscriptionWorker {
        let params = SubscriptionParams::new(EventSource::stream("orders"), "workers", settings);
        let executor = IoExecutor::new(log, &params.id(), params.source.clone(), false);
        let subscription = PersistentSubscription::new(params, &ConsumerStrategyRegistry::new()).unwrap();
        SubscriptionWorker::spawn(subscription, executor, RetryPolicy::default()).unwrap()
    }

    fn wait_for_phase(worker: &SubscriptionWorker, phase: SubscriptionPhase) {
        for _ in 0..500 {
            if worker.info().unwrap().phase == phase {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("subscription never reached {:?}", phase);
    }

    #[test]
    fn test_reads_history_and_delivers() {
        let log = Arc::new(InMemoryLog::new());
        let events = (0..3).map(|i| NewEvent::new("Placed", format!("{}", i))).collect();
        log.append("orders", ExpectedVersion::Any, events).unwrap();

        let worker = spawn(log, SubscriptionSettings::default().start_from_beginning());
        let (reg, handle) = ClientRegistration::channel(10);
        worker.add_client(reg).unwrap();

        let mut numbers = Vec::new();
        while numbers.len() < 3 {
            match handle.recv_timeout(Duration::from_secs(5)).unwrap() {
                SubscriberMessage::EventAppeared { event, .. } => numbers.push(event.original_event_number()),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(numbers, vec![0, 1, 2]);
        assert_eq!(worker.gauge().count(), 3);
    }

    #[test]
    fn test_delete_removes_state_and_stops() {
        let log = Arc::new(InMemoryLog::new());
        let worker = spawn(log.clone(), SubscriptionSettings::default());
        wait_for_phase(&worker, SubscriptionPhase::Push);

        let (reg, handle) = ClientRegistration::channel(1);
        worker.add_client(reg).unwrap();
        let sender = worker.sender.clone();
        worker.delete();

        assert!(matches!(
            handle.recv_timeout(Duration::from_secs(5)),
            Ok(SubscriberMessage::Dropped {
                reason: DropReason::PersistentSubscriptionDeleted
            })
        ));
        let (reply, response) = bounded(1);
        let _ = sender.send(SubscriptionCommand::GetInfo(reply));
        assert!(response.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_drop_shuts_down() {
        let log = Arc::new(InMemoryLog::new());
        let worker = spawn(log, SubscriptionSettings::default());
        let (reg, handle) = ClientRegistration::channel(1);
        worker.add_client(reg).unwrap();
        drop(worker);
        assert!(matches!(
            handle.recv_timeout(Duration::from_secs(5)),
            Ok(SubscriberMessage::Dropped {
                reason: DropReason::Shutdown
            })
        ));
    }
}
