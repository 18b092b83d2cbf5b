//! Core domain model types for mlpipeline.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Run and stage lifecycle states
//! - Stage output type with factory methods
//! - Typed key contracts

mod contract;
mod output;
mod status;

pub use contract::{Contract, ValueType};
pub use output::{OutputStatus, StageOutput};
pub use status::{RunStatus, StageKind, StageState};
