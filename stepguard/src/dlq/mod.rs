//! Dead letter queue for items that exhausted their retries.
//!
//! At most one `pending` entry exists per item: a repeat failure while the
//! entry is pending bumps its `failure_count` in place. Resolving an entry
//! (retry, skip, manual fix) is terminal; if a retried item fails again it
//! gets a fresh entry.

mod item;
mod queue;
mod table;

pub use item::{
    DeadLetterFilter, DeadLetterItem, DeadLetterStats, FailureReasonCount, LastError, NewDeadLetter,
    Resolution,
};
pub use queue::{DeadLetterQueue, REASON_PREFIX_LEN, TOP_REASONS};
pub use table::{DeadLetterTable, InMemoryDeadLetterTable};
