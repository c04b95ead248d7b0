//! Persistent subscription state machine, its clients and its worker.

mod actor;
pub(crate) mod client;
mod io;
pub(crate) mod message;
mod state;

pub use actor::{SubscriptionCommand, SubscriptionWorker};
pub use client::{Client, ClientInfo, ClientKey, ClientSet};
pub use io::{IoCompletion, IoExecutor, IoRequest, IoWorker, RetryPolicy};
pub use message::{ClientRegistration, DropReason, SubscriberHandle, SubscriberMessage};
pub use state::{NakAction, PersistentSubscription, SubscriptionInfo, SubscriptionPhase, MAX_RETRY_REASON};
