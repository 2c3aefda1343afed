//! Batching engine.
//!
//! This module contains:
//! - BatchManager for orchestrating the iteration loop
//! - Collaborator traits (intake, responses, stop signals, stats)
//! - The opaque compute-step contract

pub mod compute;
pub mod hooks;
pub mod manager;

pub use compute::{BatchEntry, BeamOutput, ComputeBatch, ComputeStep, StepOutput};
pub use hooks::{
    IterationStats, NewRequest, RequestIntake, Response, ResponseSink, StatsSink, StopSignalSource,
};
pub use manager::{BatchManager, IterationSummary};
