//! Consumer strategies decide which client gets each buffered message.
//!
//! A subscription owns one boxed [`ConsumerStrategy`], created from a
//! [`ConsumerStrategyKind`] through the [`ConsumerStrategyRegistry`].

mod dispatch_to_single;
mod pinned;
mod registry;
mod round_robin;

pub use dispatch_to_single::DispatchToSingleStrategy;
pub use pinned::{Crc32KeyHasher, KeyHasher, PinKey, PinnedStrategy, DEFAULT_CORRELATION_PROPERTY, PIN_BUCKETS};
pub use registry::{ConsumerStrategyKind, ConsumerStrategyRegistry, StrategyFactory};
pub use round_robin::RoundRobinStrategy;

use crate::outstanding::OutstandingMessage;
use crate::subscription::client::{ClientKey, ClientSet};

/// Outcome of assigning one buffered message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assignment {
    /// Deliver to this client.
    Assigned(ClientKey),
    /// This message has to wait, later messages may still be assigned.
    Skipped,
    /// No client can take anything right now.
    NoMoreCapacity,
}

pub trait ConsumerStrategy: Send {
    fn name(&self) -> &str;

    /// Called after the client joined `clients`.
    fn client_added(&mut self, client: ClientKey, clients: &ClientSet);

    /// Called after the client left `clients`.
    fn client_removed(&mut self, client: ClientKey, clients: &ClientSet);

    fn assign(&mut self, message: &OutstandingMessage, clients: &ClientSet) -> Assignment;
}

/// First client with free slots at or after `start` in join order, wrapping.
pub(crate) fn next_with_capacity(clients: &ClientSet, start: usize) -> Option<ClientKey> {
    let len = clients.len();
    (0..len)
        .filter_map(|i| clients.at((start + i) % len))
        .find(|c| c.free_slots() > 0)
        .map(|c| c.key())
}

/// Index of the first client that joined after `key` (0 when none did).
pub(crate) fn index_after(clients: &ClientSet, key: Option<ClientKey>) -> usize {
    key.and_then(|last| clients.iter().position(|c| c.key() > last))
        .unwrap_or(0)
}
