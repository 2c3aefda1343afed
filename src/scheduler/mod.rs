//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - FIFO admission under the configured policy
//! - Per-iteration growth of in-flight requests
//! - Pausing requests under memory pressure

pub mod batch;

pub use batch::{ScheduleOutputs, Scheduler};
