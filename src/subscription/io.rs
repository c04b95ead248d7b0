//! Storage I/O on behalf of a subscription.
//!
//! The state machine never touches storage. It queues [`IoRequest`]s,
//! an [`IoExecutor`] runs them, and the resulting [`IoCompletion`]s are fed
//! back in. [`IoWorker`] does this on its own thread, retrying transient
//! failures with bounded backoff without blocking the subscription.

use crate::checkpoint::CheckpointStore;
use crate::error::{Result, SubscriptionError};
use crate::outstanding::OutstandingMessage;
use crate::parker::{MessageParker, ParkedBatch, ParkedStats};
use crate::storage::{EventLog, ReadSlice};
use crate::types::{EventSource, StreamPosition};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Storage work requested by a subscription.
#[derive(Clone, Debug)]
pub enum IoRequest {
    LoadCheckpoint,
    ReadEvents { from: StreamPosition, count: usize },
    WriteCheckpoint { position: StreamPosition },
    ParkMessage { message: OutstandingMessage, reason: String },
    LoadParkedStats,
    ReadParked { stop_at: Option<i64> },
    MarkParkedReprocessed { sequence: i64 },
    DeleteCheckpoint,
    DeleteParked,
}

impl IoRequest {
    fn kind(&self) -> &'static str {
        match self {
            IoRequest::LoadCheckpoint => "load_checkpoint",
            IoRequest::ReadEvents { .. } => "read_events",
            IoRequest::WriteCheckpoint { .. } => "write_checkpoint",
            IoRequest::ParkMessage { .. } => "park_message",
            IoRequest::LoadParkedStats => "load_parked_stats",
            IoRequest::ReadParked { .. } => "read_parked",
            IoRequest::MarkParkedReprocessed { .. } => "mark_parked_reprocessed",
            IoRequest::DeleteCheckpoint => "delete_checkpoint",
            IoRequest::DeleteParked => "delete_parked",
        }
    }
}

/// Result of an [`IoRequest`].
#[derive(Debug)]
pub enum IoCompletion {
    CheckpointLoaded(Result<Option<StreamPosition>>),
    ReadCompleted {
        from: StreamPosition,
        result: Result<ReadSlice>,
    },
    CheckpointWritten {
        position: StreamPosition,
        result: Result<()>,
    },
    MessageParked {
        message: OutstandingMessage,
        reason: String,
        result: Result<()>,
    },
    ParkedStatsLoaded(Result<ParkedStats>),
    ParkedMessagesRead(Result<ParkedBatch>),
    ParkedReprocessed(Result<()>),
    Deleted(Result<()>),
}

impl IoCompletion {
    fn error(&self) -> Option<&SubscriptionError> {
        match self {
            IoCompletion::CheckpointLoaded(r) => r.as_ref().err(),
            IoCompletion::ReadCompleted { result, .. } => result.as_ref().err(),
            IoCompletion::CheckpointWritten { result, .. } => result.as_ref().err(),
            IoCompletion::MessageParked { result, .. } => result.as_ref().err(),
            IoCompletion::ParkedStatsLoaded(r) => r.as_ref().err(),
            IoCompletion::ParkedMessagesRead(r) => r.as_ref().err(),
            IoCompletion::ParkedReprocessed(r) => r.as_ref().err(),
            IoCompletion::Deleted(r) => r.as_ref().err(),
        }
    }

    /// Whether the request failed in a way worth retrying.
    pub fn is_transient_failure(&self) -> bool {
        matches!(self.error(), Some(SubscriptionError::Storage(e)) if e.is_transient())
    }
}

/// Runs requests for one subscription against the event log.
#[derive(Clone)]
pub struct IoExecutor {
    log: Arc<dyn EventLog>,
    source: EventSource,
    resolve_links: bool,
    checkpoints: CheckpointStore,
    parker: MessageParker,
}

impl IoExecutor {
    pub fn new(log: Arc<dyn EventLog>, subscription_id: &str, source: EventSource, resolve_links: bool) -> Self {
        Self {
            checkpoints: CheckpointStore::new(log.clone(), subscription_id),
            parker: MessageParker::new(log.clone(), subscription_id),
            log,
            source,
            resolve_links,
        }
    }

    pub fn parker(&self) -> &MessageParker {
        &self.parker
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Run one attempt of a request.
    pub fn execute(&self, request: IoRequest) -> IoCompletion {
        match request {
            IoRequest::LoadCheckpoint => IoCompletion::CheckpointLoaded(self.checkpoints.load()),
            IoRequest::ReadEvents { from, count } => IoCompletion::ReadCompleted {
                from,
                result: self
                    .log
                    .read_source(&self.source, from, count, self.resolve_links)
                    .map_err(Into::into),
            },
            IoRequest::WriteCheckpoint { position } => IoCompletion::CheckpointWritten {
                position,
                result: self.checkpoints.write(position),
            },
            IoRequest::ParkMessage { message, reason } => {
                let result = self.parker.park_message(&message.event, &reason).map(|_| ());
                IoCompletion::MessageParked {
                    message,
                    reason,
                    result,
                }
            }
            IoRequest::LoadParkedStats => IoCompletion::ParkedStatsLoaded(self.parker.load_stats()),
            IoRequest::ReadParked { stop_at } => {
                IoCompletion::ParkedMessagesRead(self.parker.read_parked(stop_at))
            }
            IoRequest::MarkParkedReprocessed { sequence } => {
                IoCompletion::ParkedReprocessed(self.parker.mark_parked_messages_reprocessed(sequence))
            }
            IoRequest::DeleteCheckpoint => IoCompletion::Deleted(self.checkpoints.delete()),
            IoRequest::DeleteParked => IoCompletion::Deleted(self.parker.delete()),
        }
    }
}

/// Bounded exponential backoff for transient failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based retry count), or `None`
    /// once attempts are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

struct Job {
    request: IoRequest,
    attempt: u32,
}

/// Background thread executing requests for one subscription.
pub struct IoWorker {
    sender: Option<Sender<IoRequest>>,
    thread: Option<JoinHandle<()>>,
}

impl IoWorker {
    /// Start the worker. Completions go to `complete`; when it returns
    /// false the owner is gone and later completions are discarded.
    pub fn spawn<F>(executor: IoExecutor, retry: RetryPolicy, complete: F) -> Self
    where
        F: Fn(IoCompletion) -> bool + Send + 'static,
    {
        let (sender, receiver) = unbounded();
        let thread = thread::Builder::new()
            .name("subscription-io".to_string())
            .spawn(move || run(executor, retry, receiver, complete))
            .ok();
        if thread.is_none() {
            warn!("failed to spawn subscription io thread");
        }
        Self {
            sender: Some(sender),
            thread,
        }
    }

    pub fn submit(&self, request: IoRequest) -> bool {
        self.sender.as_ref().map_or(false, |s| s.send(request).is_ok())
    }

    /// Finish queued work (including pending retries) and stop.
    pub fn stop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<F>(executor: IoExecutor, retry: RetryPolicy, receiver: Receiver<IoRequest>, complete: F)
where
    F: Fn(IoCompletion) -> bool,
{
    let mut delayed: BTreeMap<(Instant, u64), Job> = BTreeMap::new();
    let mut next_id = 0u64;
    let mut open = true;

    while open || !delayed.is_empty() {
        let job = match delayed.first_key_value().map(|(k, _)| *k) {
            Some((due, id)) if due <= Instant::now() => delayed.remove(&(due, id)),
            Some((due, _)) if open => {
                match receiver.recv_timeout(due.saturating_duration_since(Instant::now())) {
                    Ok(request) => Some(Job { request, attempt: 0 }),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => {
                        open = false;
                        None
                    }
                }
            }
            Some((due, _)) => {
                thread::sleep(due.saturating_duration_since(Instant::now()));
                None
            }
            None => match receiver.recv() {
                Ok(request) => Some(Job { request, attempt: 0 }),
                Err(_) => {
                    open = false;
                    None
                }
            },
        };
        let Some(job) = job else { continue };

        let kind = job.request.kind();
        let completion = executor.execute(job.request.clone());
        if completion.is_transient_failure() {
            if let Some(delay) = retry.delay(job.attempt + 1) {
                debug!(request = kind, attempt = job.attempt + 1, ?delay, "retrying transient io failure");
                next_id += 1;
                delayed.insert(
                    (Instant::now() + delay, next_id),
                    Job {
                        request: job.request,
                        attempt: job.attempt + 1,
                    },
                );
                continue;
            }
            warn!(request = kind, attempts = job.attempt + 1, "giving up on io request");
        }

        if !complete(completion) {
            debug!(request = kind, "subscription gone, discarding io completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::InMemoryLog;

    #[test]
    fn test_retry_delays() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(25),
        };
        assert_eq!(policy.delay(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.delay(2), Some(Duration::from_millis(20)));
        assert_eq!(policy.delay(3), Some(Duration::from_millis(25)));
        assert_eq!(policy.delay(4), None);
    }

    #[test]
    fn test_worker_retries_transient_failures() {
        let log = Arc::new(InMemoryLog::new());
        log.inject_failures(StorageError::Timeout("slow".into()), 2);
        let executor = IoExecutor::new(log.clone(), "s::g", EventSource::stream("s"), false);
        let (tx, rx) = unbounded();
        let retry = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };

        let mut worker = IoWorker::spawn(executor, retry, move |c| tx.send(c).is_ok());
        assert!(worker.submit(IoRequest::LoadCheckpoint));

        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(completion, IoCompletion::CheckpointLoaded(Ok(None))));
        assert_eq!(log.pending_failures(), 0);
        worker.stop();
    }

    #[test]
    fn test_worker_gives_up() {
        let log = Arc::new(InMemoryLog::new());
        log.inject_failures(StorageError::Unavailable("down".into()), 10);
        let executor = IoExecutor::new(log, "s::g", EventSource::stream("s"), false);
        let (tx, rx) = unbounded();
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };

        let worker = IoWorker::spawn(executor, retry, move |c| tx.send(c).is_ok());
        worker.submit(IoRequest::LoadParkedStats);
        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(completion.is_transient_failure());
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let log = Arc::new(InMemoryLog::new());
        let executor = IoExecutor::new(log.clone(), "s::g", EventSource::stream("s"), false);
        log.append(
            executor.checkpoints().stream(),
            crate::storage::ExpectedVersion::Any,
            vec![crate::storage::NewEvent::new("$SubscriptionCheckpoint", "garbage")],
        )
        .unwrap();
        let completion = executor.execute(IoRequest::LoadCheckpoint);
        assert!(!completion.is_transient_failure());
        assert!(matches!(
            completion,
            IoCompletion::CheckpointLoaded(Err(SubscriptionError::BadConfigData { .. }))
        ));
    }
}
