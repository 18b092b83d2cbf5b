//! Testing utilities for mlpipeline graphs.
//!
//! This module provides:
//! - Mock stages with shared call counters
//! - Assertions for stage outputs and run records

mod assertions;
mod mocks;

pub use assertions::{
    assert_output_failed, assert_output_succeeded, assert_output_value, assert_run_status,
    assert_stage_state,
};
pub use mocks::{CountingStage, FailingStage, FlakyStage, ProducerStage, SlowStage};
