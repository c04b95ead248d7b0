//! Sticky assignment of messages to clients by key.

use super::{Assignment, ConsumerStrategy};
use crate::outstanding::OutstandingMessage;
use crate::subscription::client::{ClientKey, ClientSet};
use crate::types::ResolvedEvent;
use std::collections::HashMap;
use std::sync::Arc;

/// Number of hash buckets keys are spread over.
pub const PIN_BUCKETS: usize = 1024;

/// Metadata property read by correlation pinning unless configured otherwise.
pub const DEFAULT_CORRELATION_PROPERTY: &str = "$correlationId";

pub trait KeyHasher: Send + Sync {
    fn hash(&self, key: &[u8]) -> u32;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32KeyHasher;

impl KeyHasher for Crc32KeyHasher {
    fn hash(&self, key: &[u8]) -> u32 {
        crc32fast::hash(key)
    }
}

/// Where the pin key comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PinKey {
    /// The stream the event lives in.
    StreamId,
    /// A string property of the event's JSON metadata, falling back to the
    /// stream id when it is absent or unusable.
    Correlation { property: String },
}

impl PinKey {
    pub fn extract(&self, event: &ResolvedEvent) -> String {
        match self {
            PinKey::StreamId => stream_key(event).to_string(),
            PinKey::Correlation { property } => {
                correlation_key(event, property).unwrap_or_else(|| stream_key(event).to_string())
            }
        }
    }
}

/// Stream of the resolved event; unresolved links name their target in
/// their data.
fn stream_key(event: &ResolvedEvent) -> &str {
    if event.link.is_none() {
        if let Some((_, stream)) = event.event.link_target() {
            return stream;
        }
    }
    &event.event.stream_id
}

fn correlation_key(event: &ResolvedEvent, property: &str) -> Option<String> {
    if event.event.metadata.is_empty() {
        return None;
    }
    let metadata: serde_json::Value = serde_json::from_slice(&event.event.metadata).ok()?;
    let value = metadata.as_object()?.get(property)?.as_str()?;
    (!value.is_empty()).then(|| value.to_string())
}

/// Routes every key to one client while the set of clients stays the same.
///
/// Keys hash into [`PIN_BUCKETS`] buckets. A bucket without an owner goes
/// to the client owning the fewest buckets (earliest joined on ties), so new
/// keys rotate across clients. A joining client makes over-loaded clients
/// release buckets, so a key can move away from a client that is still
/// connected when another client joins. A leaving client releases all of
/// its buckets.
pub struct PinnedStrategy {
    key: PinKey,
    hasher: Arc<dyn KeyHasher>,
    buckets: Vec<Option<ClientKey>>,
    owned: HashMap<ClientKey, usize>,
}

impl PinnedStrategy {
    pub fn new(key: PinKey, hasher: Arc<dyn KeyHasher>) -> Self {
        Self {
            key,
            hasher,
            buckets: vec![None; PIN_BUCKETS],
            owned: HashMap::new(),
        }
    }

    pub fn by_stream() -> Self {
        Self::new(PinKey::StreamId, Arc::new(Crc32KeyHasher))
    }

    pub fn by_correlation(property: impl Into<String>) -> Self {
        Self::new(
            PinKey::Correlation {
                property: property.into(),
            },
            Arc::new(Crc32KeyHasher),
        )
    }

    /// Buckets currently owned by `client`.
    pub fn owned_buckets(&self, client: ClientKey) -> usize {
        self.owned.get(&client).copied().unwrap_or(0)
    }

    fn least_loaded(&self, clients: &ClientSet) -> Option<ClientKey> {
        clients
            .iter()
            .min_by_key(|c| self.owned_buckets(c.key()))
            .map(|c| c.key())
    }

    fn release_bucket(&mut self, bucket: usize) {
        if let Some(owner) = self.buckets[bucket].take() {
            if let Some(count) = self.owned.get_mut(&owner) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

impl ConsumerStrategy for PinnedStrategy {
    fn name(&self) -> &str {
        match self.key {
            PinKey::StreamId => "Pinned",
            PinKey::Correlation { .. } => "PinnedByCorrelation",
        }
    }

    fn client_added(&mut self, client: ClientKey, clients: &ClientSet) {
        self.owned.insert(client, 0);

        let total: usize = self.owned.values().sum();
        let target = total / clients.len().max(1);
        for bucket in (0..PIN_BUCKETS).rev() {
            let Some(owner) = self.buckets[bucket] else {
                continue;
            };
            if self.owned_buckets(owner) > target {
                self.release_bucket(bucket);
            }
        }
    }

    fn client_removed(&mut self, client: ClientKey, _clients: &ClientSet) {
        for bucket in 0..PIN_BUCKETS {
            if self.buckets[bucket] == Some(client) {
                self.buckets[bucket] = None;
            }
        }
        self.owned.remove(&client);
    }

    fn assign(&mut self, message: &OutstandingMessage, clients: &ClientSet) -> Assignment {
        if clients.available_capacity() == 0 {
            return Assignment::NoMoreCapacity;
        }

        let key = self.key.extract(&message.event);
        let bucket = self.hasher.hash(key.as_bytes()) as usize % PIN_BUCKETS;

        let owner = match self.buckets[bucket].filter(|k| clients.get(*k).is_some()) {
            Some(owner) => owner,
            None => {
                self.release_bucket(bucket);
                let Some(owner) = self.least_loaded(clients) else {
                    return Assignment::NoMoreCapacity;
                };
                self.buckets[bucket] = Some(owner);
                *self.owned.entry(owner).or_insert(0) += 1;
                owner
            }
        };

        match clients.get(owner) {
            Some(client) if client.free_slots() > 0 => Assignment::Assigned(owner),
            _ => Assignment::Skipped,
        }
    }
}
