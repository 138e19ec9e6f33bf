//! Durable per-(item, step) execution records.
//!
//! The checkpoint store is the resume and caching authority of a run: a step
//! with a `completed` checkpoint is never executed again for the same item
//! unless the caller forces it.
//!
//! Storage is abstracted behind [`CheckpointTable`]; [`InMemoryCheckpointTable`]
//! is provided for tests and single-process deployments.

mod record;
mod store;
mod table;

pub use record::{CheckpointMeta, CheckpointRecord, CheckpointStatus, CompletionStatus};
pub use store::CheckpointStore;
pub use table::{CheckpointTable, InMemoryCheckpointTable};
