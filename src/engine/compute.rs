//! The opaque compute step.
//!
//! Attention and matmul kernels are modeled as a single atomic external
//! operation: the manager hands over the active batch's tokens, block
//! tables, and pending cache copies; the step returns one next token per
//! beam per request. The manager treats the call as synchronous and does
//! not mutate cache or scheduler state while it runs.

use crate::core::cache_manager::CopyBlockOp;
use crate::core::request::{RequestId, RequestPhase};
use crate::error::Result;

/// One request's slice of the active batch.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    /// The request being processed.
    pub request_id: RequestId,
    /// Context or Generation.
    pub phase: RequestPhase,
    /// Tokens to process this iteration, per beam. In the context phase the
    /// full prefix sits on beam 0 and the other beams are empty; in
    /// generation each beam carries its last generated token.
    pub beam_tokens: Vec<Vec<u32>>,
    /// Physical block IDs per beam, in logical order.
    pub block_tables: Vec<Vec<usize>>,
    /// Global cache slot per token of `beam_tokens`, per beam.
    pub slot_mappings: Vec<Vec<usize>>,
}

/// The active batch for one iteration.
#[derive(Debug, Clone, Default)]
pub struct ComputeBatch {
    /// Iteration counter, for tracing.
    pub iteration: u64,
    /// Block copies from beam divergence. Must be applied to device memory
    /// before the attention pass reads the cache.
    pub copy_ops: Vec<CopyBlockOp>,
    /// Per-request entries, context phase first.
    pub entries: Vec<BatchEntry>,
}

/// Next-token output for one beam.
#[derive(Debug, Clone, Copy)]
pub struct BeamOutput {
    /// Beam whose hypothesis this beam continues (beam-search resampling).
    /// Always 0 after a context step; the identity for greedy decoding.
    pub source_beam: usize,
    /// The sampled token.
    pub token_id: u32,
}

/// Output of the compute step for one request.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// The request this output belongs to.
    pub request_id: RequestId,
    /// One entry per beam, up to the request's beam width.
    pub beams: Vec<BeamOutput>,
}

/// The external compute step (device kernels behind a fixed contract).
pub trait ComputeStep {
    /// Execute one iteration over the active batch.
    ///
    /// # Errors
    ///
    /// A device error here is fatal for every request in the batch; the
    /// manager reports it per request and keeps the loop alive.
    fn execute(&mut self, batch: &ComputeBatch) -> Result<Vec<StepOutput>>;
}
