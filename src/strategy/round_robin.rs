use super::{index_after, next_with_capacity, Assignment, ConsumerStrategy};
use crate::outstanding::OutstandingMessage;
use crate::subscription::client::{ClientKey, ClientSet};

/// Rotates through clients with free slots, independent of content.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    last: Option<ClientKey>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsumerStrategy for RoundRobinStrategy {
    fn name(&self) -> &str {
        "RoundRobin"
    }

    fn client_added(&mut self, _client: ClientKey, _clients: &ClientSet) {}

    // The rotation point survives removal: index_after works on departed keys.
    fn client_removed(&mut self, _client: ClientKey, _clients: &ClientSet) {}

    fn assign(&mut self, _message: &OutstandingMessage, clients: &ClientSet) -> Assignment {
        match next_with_capacity(clients, index_after(clients, self.last)) {
            Some(key) => {
                self.last = Some(key);
                Assignment::Assigned(key)
            }
            None => Assignment::NoMoreCapacity,
        }
    }
}
