//! Persistent background-sync retry queue.

mod backoff;
mod queue;
mod task;

pub use backoff::Backoff;
pub use queue::{DrainOutcome, DrainReport, EntitySync, SyncQueue};
pub use task::{SyncRegistration, SyncTask, TaskStatus};
