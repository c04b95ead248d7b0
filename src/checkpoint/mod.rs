//! Checkpoint computation and persistence.
//!
//! Acknowledged sequences feed a [`CheckpointQueue`] that only advances
//! over a gap-free prefix. [`CheckpointPolicy`] decides when that prefix is
//! worth writing and [`CheckpointStore`] writes it.

mod policy;
mod queue;
mod store;

pub use policy::CheckpointPolicy;
pub use queue::{CheckpointQueue, ContiguityMode};
pub use store::{checkpoint_stream, CheckpointStore, CHECKPOINT_EVENT_TYPE};
