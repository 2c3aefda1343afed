//! Collaborator interfaces consumed by the batch manager.
//!
//! The original callback contracts become injected trait objects: intake,
//! response delivery, stop-signal polling, and the optional stats sink. All
//! hooks are invoked synchronously from the iteration loop and must not
//! block indefinitely - a slow hook stalls the entire batch.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;

use crate::core::request::{GenerationParams, RequestId};

/// A new request pulled from the intake.
#[derive(Debug, Clone)]
pub struct NewRequest {
    /// Client-assigned unique request ID.
    pub request_id: RequestId,
    /// Prompt token IDs.
    pub prompt_token_ids: Vec<u32>,
    /// Generation parameters.
    pub params: GenerationParams,
}

/// Source of new requests, polled once per iteration.
///
/// `max_requests` is the admission capacity left this iteration; `None`
/// means unbounded. Entries whose ID matches a currently active request
/// are rejected by the manager, not re-admitted.
pub trait RequestIntake {
    /// Fetch up to `max_requests` new requests.
    fn fetch(&mut self, max_requests: Option<usize>) -> Vec<NewRequest>;
}

/// A queue can serve as an intake directly (tests, demo driver).
impl RequestIntake for VecDeque<NewRequest> {
    fn fetch(&mut self, max_requests: Option<usize>) -> Vec<NewRequest> {
        let n = max_requests.unwrap_or(self.len()).min(self.len());
        self.drain(..n).collect()
    }
}

/// Output delivered to the client for one request.
///
/// At most one response per request per iteration; exactly one response
/// with `is_final == true` over the request's lifetime. Token lists are
/// cumulative. A non-empty error forces `is_final`.
#[derive(Debug, Clone)]
pub struct Response {
    /// The request this response belongs to.
    pub request_id: RequestId,
    /// Generated tokens so far, one list per beam. Empty for cancelled
    /// requests and error responses.
    pub beam_outputs: Vec<Vec<u32>>,
    /// No further responses will follow.
    pub is_final: bool,
    /// Error message; `Some` implies `is_final`.
    pub error: Option<String>,
}

/// Destination for responses, called from the iteration loop.
pub trait ResponseSink {
    /// Deliver one response to the client.
    fn deliver(&mut self, response: Response);
}

/// Collect responses into a vector (tests, demo driver).
impl ResponseSink for Vec<Response> {
    fn deliver(&mut self, response: Response) {
        self.push(response);
    }
}

/// Source of cancellation signals, polled once per iteration.
///
/// IDs that are unknown or already terminal are ignored (idempotent
/// cancellation).
pub trait StopSignalSource {
    /// Current set of request IDs to cancel.
    fn poll(&mut self) -> HashSet<RequestId>;
}

/// A set drains itself on poll (tests, demo driver).
impl StopSignalSource for HashSet<RequestId> {
    fn poll(&mut self) -> HashSet<RequestId> {
        std::mem::take(self)
    }
}

/// Per-iteration statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct IterationStats {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Iteration counter.
    pub iteration: u64,
    /// Requests currently tracked (queued, executing, or paused).
    pub active_requests: usize,
}

/// Optional sink for serialized iteration stats.
///
/// Invoked once per iteration, only when at least one request is active.
pub trait StatsSink {
    /// Record one JSON-serialized [`IterationStats`] snapshot.
    fn record(&mut self, snapshot: &str);
}

impl StatsSink for Vec<String> {
    fn record(&mut self, snapshot: &str) {
        self.push(snapshot.to_string());
    }
}
