//! Run-scoped data.
//!
//! - [`RunContext`]: the write-once store of parameters and stage outputs
//! - [`StageContext`]: the read-only view a stage receives per invocation

mod run_context;
mod stage_context;

pub use run_context::RunContext;
pub use stage_context::StageContext;
