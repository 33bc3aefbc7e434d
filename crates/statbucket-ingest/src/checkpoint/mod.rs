//! Resumable progress tracking
//!
//! Every (dataset, source unit) pair moves through
//! `pending → fetching → extracting → diffing → persisting → done`.
//! `failed` is reachable from any non-terminal state and `halted` only from
//! `diffing`. Runs over one dataset are serialized by a [`LeaseManager`].

pub mod lease;
pub mod store;
pub mod types;

pub use lease::{LeaseGuard, LeaseManager};
pub use store::CheckpointStore;
pub use types::{Checkpoint, CheckpointStatus, Phase};
