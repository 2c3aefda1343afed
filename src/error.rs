//! Error types for inflight.

use thiserror::Error;

/// Result type alias for inflight operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for inflight.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    ///
    /// Recoverable under `MaxUtilization` (the scheduler pauses the request);
    /// an internal-consistency violation under `GuaranteedNoEvict`, where
    /// admission already reserved worst-case capacity.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// An intake entry reused the ID of a currently active request.
    #[error("request {0} is already active")]
    DuplicateRequestId(u64),

    /// Request not found in the batch manager.
    #[error("request {0} not found")]
    RequestNotFound(u64),

    /// Invalid request state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Logical block index past the end of a block table.
    #[error("logical block {logical_idx} out of bounds ({num_blocks} blocks)")]
    BlockIndexOutOfBounds {
        logical_idx: usize,
        num_blocks: usize,
    },

    /// Beam index past the declared beam width.
    #[error("beam {beam} out of bounds for request {request_id} ({beam_width} beams)")]
    BeamIndexOutOfBounds {
        request_id: u64,
        beam: usize,
        beam_width: usize,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The external compute step failed (device error).
    ///
    /// Fatal for every request in the active batch of that iteration.
    #[error("compute step failed: {0}")]
    ComputeStep(String),

    /// Internal consistency violation (accounting bug).
    #[error("internal error: {0}")]
    Internal(String),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
