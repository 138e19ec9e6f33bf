//! Testing utilities for step pipelines.
//!
//! This module provides:
//! - Mock steps with scripted outcomes and call counters
//! - Assertions for step results and checkpoints
//! - A fixture wiring an executor, stores and an event collector together

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_checkpoint_status, assert_step_completed, assert_step_failed, assert_step_skipped};
pub use fixtures::TestFixture;
pub use mocks::{CountingStep, RecordedCall, RecordingStep, ScriptedStep, SlowStep};
