//! inflight: an in-flight (continuous) batching manager for autoregressive
//! transformer inference.
//!
//! This crate implements the scheduling and memory-management core of an
//! inference server:
//! - A paged KV cache: fixed-size blocks with reference-counted,
//!   copy-on-write sharing across beam-search hypotheses
//! - Iteration-level scheduling: admission, growth, and pausing of requests
//!   under the MaxUtilization or GuaranteedNoEvict policy
//! - A batch-manager loop driving intake, the external compute step,
//!   response delivery, and cooperative cancellation
//!
//! The numerical kernels themselves are out of scope: the compute step is
//! an injected trait with a fixed contract.

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::{BatchManagerConfig, SchedulerPolicy};
pub use core::block_pool::BlockPool;
pub use core::cache_manager::{CacheManager, CopyBlockOp};
pub use core::request::{FinishReason, GenerationParams, Request, RequestId, RequestPhase};
pub use engine::{
    BatchManager, BeamOutput, ComputeBatch, ComputeStep, IterationSummary, NewRequest,
    RequestIntake, Response, ResponseSink, StatsSink, StepOutput, StopSignalSource,
};
pub use error::{Error, Result};
pub use scheduler::{ScheduleOutputs, Scheduler};
