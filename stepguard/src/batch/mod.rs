//! Batch execution.
//!
//! [`BatchRunner`] runs a step list over many items with bounded
//! concurrency. Items whose required steps fail are routed to the dead
//! letter queue together with their checkpoints, and can later be retried
//! from scratch or resumed from the last completed step.

mod report;
mod runner;

pub use report::{BatchItem, BatchReport, ItemOutcome, ItemReport};
pub use runner::{BatchRunner, RetryMode};
