//! Connected clients of a subscription and their in-flight messages.

use super::message::{ClientRegistration, DropReason, SubscriberMessage};
use crate::outstanding::OutstandingMessage;
use crate::stats::{LatencyMeasurements, RequestStatistics};
use crate::types::{ConnectionId, CorrelationId, EventId};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Subscription-local client identifier. Keys grow in join order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(pub u64);

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Client({})", self.0)
    }
}

/// Diagnostic snapshot of one client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub correlation_id: CorrelationId,
    pub connection_name: String,
    pub username: String,
    pub origin: String,
    pub max_in_flight: usize,
    pub in_flight: usize,
    pub available_slots: usize,
    pub total_items: u64,
    pub latency: Option<LatencyMeasurements>,
}

pub struct Client {
    key: ClientKey,
    correlation_id: CorrelationId,
    connection_id: ConnectionId,
    connection_name: String,
    username: String,
    origin: String,
    max_in_flight: usize,
    sender: Sender<SubscriberMessage>,
    in_flight: HashMap<EventId, OutstandingMessage>,
    total_items: u64,
    stats: Option<RequestStatistics>,
}

impl Client {
    fn new(key: ClientKey, registration: ClientRegistration, extra_statistics: bool) -> Self {
        Self {
            key,
            correlation_id: registration.correlation_id,
            connection_id: registration.connection_id,
            connection_name: registration.connection_name,
            username: registration.username,
            origin: registration.origin,
            max_in_flight: registration.max_in_flight,
            sender: registration.sender,
            in_flight: HashMap::new(),
            total_items: 0,
            stats: extra_statistics.then(RequestStatistics::default),
        }
    }

    pub fn key(&self) -> ClientKey {
        self.key
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn free_slots(&self) -> usize {
        self.max_in_flight.saturating_sub(self.in_flight.len())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn holds(&self, id: EventId) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Record a message as in flight on this client.
    pub(crate) fn track(&mut self, message: OutstandingMessage, now: Instant) {
        let id = message.event_id();
        if let Some(stats) = self.stats.as_mut() {
            stats.start_operation(id, now);
        }
        self.total_items += 1;
        self.in_flight.insert(id, message);
    }

    /// Write a tracked message to the client channel. Returns false when
    /// the receiving side is gone.
    pub(crate) fn deliver(&self, message: &OutstandingMessage) -> bool {
        self.sender
            .send(SubscriberMessage::EventAppeared {
                event: message.event.clone(),
                retry_count: message.retry_count,
            })
            .is_ok()
    }

    /// Remove an acknowledged message.
    pub(crate) fn complete(&mut self, id: EventId, now: Instant) -> Option<OutstandingMessage> {
        let message = self.in_flight.remove(&id)?;
        if let Some(stats) = self.stats.as_mut() {
            stats.end_operation(id, now);
        }
        Some(message)
    }

    /// Remove a message that will not be acknowledged by this client.
    pub(crate) fn release(&mut self, id: EventId) -> Option<OutstandingMessage> {
        let message = self.in_flight.remove(&id)?;
        if let Some(stats) = self.stats.as_mut() {
            stats.cancel_operation(id);
        }
        Some(message)
    }

    /// Every in-flight message, lowest sequence first.
    pub(crate) fn drain_in_flight(&mut self) -> Vec<OutstandingMessage> {
        let mut messages: Vec<_> = self.in_flight.drain().map(|(_, m)| m).collect();
        messages.sort_by_key(|m| m.sequence);
        messages
    }

    /// Best effort drop notification.
    pub(crate) fn send_dropped(&self, reason: DropReason) {
        let _ = self.sender.send(SubscriberMessage::Dropped { reason });
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            correlation_id: self.correlation_id,
            connection_name: self.connection_name.clone(),
            username: self.username.clone(),
            origin: self.origin.clone(),
            max_in_flight: self.max_in_flight,
            in_flight: self.in_flight.len(),
            available_slots: self.free_slots(),
            total_items: self.total_items,
            latency: self.stats.as_ref().map(RequestStatistics::measurements),
        }
    }
}

/// Clients in join order.
pub struct ClientSet {
    clients: Vec<Client>,
    next_key: u64,
    extra_statistics: bool,
}

impl ClientSet {
    pub fn new(extra_statistics: bool) -> Self {
        Self {
            clients: Vec::new(),
            next_key: 1,
            extra_statistics,
        }
    }

    pub fn add(&mut self, registration: ClientRegistration) -> ClientKey {
        let key = ClientKey(self.next_key);
        self.next_key += 1;
        self.clients.push(Client::new(key, registration, self.extra_statistics));
        key
    }

    pub fn remove(&mut self, key: ClientKey) -> Option<Client> {
        let index = self.clients.iter().position(|c| c.key == key)?;
        Some(self.clients.remove(index))
    }

    pub fn key_for_correlation(&self, id: CorrelationId) -> Option<ClientKey> {
        self.clients.iter().find(|c| c.correlation_id == id).map(|c| c.key)
    }

    pub fn keys_for_connection(&self, id: ConnectionId) -> Vec<ClientKey> {
        self.clients
            .iter()
            .filter(|c| c.connection_id == id)
            .map(|c| c.key)
            .collect()
    }

    /// The client currently holding `id` in flight.
    pub fn holder_of(&self, id: EventId) -> Option<ClientKey> {
        self.clients.iter().find(|c| c.holds(id)).map(|c| c.key)
    }

    pub fn get(&self, key: ClientKey) -> Option<&Client> {
        self.clients.iter().find(|c| c.key == key)
    }

    pub fn get_mut(&mut self, key: ClientKey) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter()
    }

    /// Position of a client in join order.
    pub fn index_of(&self, key: ClientKey) -> Option<usize> {
        self.clients.iter().position(|c| c.key == key)
    }

    pub fn at(&self, index: usize) -> Option<&Client> {
        self.clients.get(index)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Sum of free slots across all clients.
    pub fn available_capacity(&self) -> usize {
        self.clients.iter().map(Client::free_slots).sum()
    }

    pub fn drain(&mut self) -> Vec<Client> {
        std::mem::take(&mut self.clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventRecord, ResolvedEvent, StreamPosition};
    use std::sync::Arc;

    fn message(n: i64) -> OutstandingMessage {
        let event = ResolvedEvent::from_event(EventRecord::new("s", n, "t", Vec::new()));
        OutstandingMessage::new(Arc::new(event), StreamPosition::Event(n))
    }

    #[test]
    fn test_capacity_tracking() {
        let mut set = ClientSet::new(true);
        let (reg, handle) = ClientRegistration::channel(2);
        let key = set.add(reg);
        assert_eq!(set.available_capacity(), 2);

        let m = message(0);
        let client = set.get_mut(key).unwrap();
        client.track(m.clone(), Instant::now());
        assert!(client.deliver(&m));
        assert_eq!(set.available_capacity(), 1);
        assert_eq!(set.holder_of(m.event_id()), Some(key));
        assert_eq!(handle.drain().len(), 1);

        let client = set.get_mut(key).unwrap();
        assert!(client.complete(m.event_id(), Instant::now()).is_some());
        assert_eq!(client.info().latency.unwrap().count, 1);
        assert_eq!(set.available_capacity(), 2);
    }

    #[test]
    fn test_deliver_to_closed_channel() {
        let mut set = ClientSet::new(false);
        let (reg, handle) = ClientRegistration::channel(1);
        let key = set.add(reg);
        drop(handle);
        assert!(!set.get(key).unwrap().deliver(&message(0)));
    }

    #[test]
    fn test_lookup_by_connection() {
        let mut set = ClientSet::new(false);
        let (a, _ha) = ClientRegistration::channel(1);
        let connection = a.connection_id;
        let (b, _hb) = ClientRegistration::channel_on(connection, 1);
        let (c, _hc) = ClientRegistration::channel(1);
        let ka = set.add(a);
        let kb = set.add(b);
        set.add(c);

        assert_eq!(set.keys_for_connection(connection), vec![ka, kb]);
        assert!(ka < kb);
    }

    #[test]
    fn test_drain_in_flight_sorted() {
        let mut set = ClientSet::new(false);
        let (reg, _h) = ClientRegistration::channel(5);
        let key = set.add(reg);
        let client = set.get_mut(key).unwrap();
        for (n, seq) in [(0, 3u64), (1, 1), (2, 2)] {
            let mut m = message(n);
            m.sequence = seq;
            client.track(m, Instant::now());
        }
        let drained: Vec<u64> = client.drain_in_flight().iter().map(|m| m.sequence).collect();
        assert_eq!(drained, vec![1, 2, 3]);
    }
}
