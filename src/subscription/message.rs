//! Messages delivered to subscribed clients.

use crate::types::{ConnectionId, CorrelationId, SharedEvent};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a client receives on its reply channel.
#[derive(Clone, Debug)]
pub enum SubscriberMessage {
    /// An event to process. `retry_count` is 0 on first delivery.
    EventAppeared { event: SharedEvent, retry_count: u32 },
    /// The client was removed from the subscription.
    Dropped { reason: DropReason },
}

/// Why a client was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The client unsubscribed or asked to stop.
    Unsubscribed,
    /// The subscription does not exist.
    NotFound,
    /// The group already has its maximum number of clients.
    SubscriberMaxCountReached,
    /// The subscription was deleted.
    PersistentSubscriptionDeleted,
    /// The subscription was updated and restarted.
    SubscriptionUpdated,
    /// The owning service shut down.
    Shutdown,
    /// The client's connection closed.
    ConnectionClosed,
}

/// Client end of a subscription.
pub struct SubscriberHandle {
    pub correlation_id: CorrelationId,
    pub connection_id: ConnectionId,
    /// Channel to receive messages.
    pub receiver: Receiver<SubscriberMessage>,
}

impl SubscriberHandle {
    /// Receive the next message (blocking).
    pub fn recv(&self) -> Result<SubscriberMessage, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> Result<SubscriberMessage, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<SubscriberMessage, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Every message currently queued.
    pub fn drain(&self) -> Vec<SubscriberMessage> {
        self.receiver.try_iter().collect()
    }
}

/// Everything needed to attach a client to a subscription.
#[derive(Clone, Debug)]
pub struct ClientRegistration {
    pub correlation_id: CorrelationId,
    pub connection_id: ConnectionId,
    pub connection_name: String,
    pub sender: Sender<SubscriberMessage>,
    pub max_in_flight: usize,
    pub username: String,
    pub origin: String,
}

impl ClientRegistration {
    /// A registration with fresh ids and its receiving handle.
    pub fn channel(max_in_flight: usize) -> (Self, SubscriberHandle) {
        Self::channel_on(ConnectionId::new(), max_in_flight)
    }

    /// A registration on an existing connection.
    pub fn channel_on(connection_id: ConnectionId, max_in_flight: usize) -> (Self, SubscriberHandle) {
        let (sender, receiver) = unbounded();
        let registration = Self {
            correlation_id: CorrelationId::new(),
            connection_id,
            connection_name: String::new(),
            sender,
            max_in_flight,
            username: String::new(),
            origin: String::new(),
        };
        let handle = SubscriberHandle {
            correlation_id: registration.correlation_id,
            connection_id: registration.connection_id,
            receiver,
        };
        (registration, handle)
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub fn with_user(mut self, username: impl Into<String>, origin: impl Into<String>) -> Self {
        self.username = username.into();
        self.origin = origin.into();
        self
    }
}
