use super::{index_after, next_with_capacity, Assignment, ConsumerStrategy};
use crate::outstanding::OutstandingMessage;
use crate::subscription::client::{ClientKey, ClientSet};

/// Keeps sending to one client until it is full, then moves on to the
/// next client with free slots and stays there.
#[derive(Debug, Default)]
pub struct DispatchToSingleStrategy {
    current: Option<ClientKey>,
}

impl DispatchToSingleStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsumerStrategy for DispatchToSingleStrategy {
    fn name(&self) -> &str {
        "DispatchToSingle"
    }

    fn client_added(&mut self, client: ClientKey, _clients: &ClientSet) {
        if self.current.is_none() {
            self.current = Some(client);
        }
    }

    fn client_removed(&mut self, client: ClientKey, clients: &ClientSet) {
        if self.current == Some(client) {
            self.current = clients.at(index_after(clients, Some(client))).map(|c| c.key());
        }
    }

    fn assign(&mut self, _message: &OutstandingMessage, clients: &ClientSet) -> Assignment {
        if let Some(client) = self.current.and_then(|key| clients.get(key)) {
            if client.free_slots() > 0 {
                return Assignment::Assigned(client.key());
            }
        }

        let start = index_after(clients, self.current);
        match next_with_capacity(clients, start) {
            Some(key) => {
                self.current = Some(key);
                Assignment::Assigned(key)
            }
            None => Assignment::NoMoreCapacity,
        }
    }
}
