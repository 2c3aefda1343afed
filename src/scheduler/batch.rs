//! Per-iteration request scheduling.
//!
//! Each iteration the scheduler decides, against the cache manager's
//! feasibility queries, which queued requests to admit and which executing
//! requests must be paused:
//!
//! 1. **Admission** - queued requests are admitted in FIFO arrival order
//!    while the batch-size bound holds and `can_allocate` says yes. The
//!    queue is head-of-line blocking: an infeasible head is never skipped,
//!    so no request is starved by later arrivals.
//! 2. **Growth / pause** - every executing request gets cache capacity for
//!    the tokens it will process this iteration (full context in the
//!    context phase, one token per beam in generation). An `OutOfBlocks`
//!    during growth pauses the request under `MaxUtilization` (blocks
//!    freed, re-queued at the *front* to bound its added latency) and is an
//!    internal-consistency failure under `GuaranteedNoEvict`, where
//!    admission already reserved worst-case capacity.
//!
//! Interruption and completion are handled by the batch manager after the
//! compute step; the scheduler only tracks membership of the pending queue
//! and the active batch.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, error, warn};

use crate::config::SchedulerPolicy;
use crate::core::cache_manager::{CacheManager, CopyBlockOp};
use crate::core::request::{Request, RequestId, RequestPhase};
use crate::error::Error;

/// Output of a scheduling step, consumed by the batch manager.
#[derive(Debug, Default)]
pub struct ScheduleOutputs {
    /// Requests processing their prompt (or recomputed prefix) this
    /// iteration.
    pub context_requests: Vec<RequestId>,
    /// Requests decoding one token per beam this iteration.
    pub generation_requests: Vec<RequestId>,
    /// Requests admitted from the pending queue this iteration (subset of
    /// `context_requests`).
    pub admitted: Vec<RequestId>,
    /// Requests paused this iteration (MaxUtilization only).
    pub paused: Vec<RequestId>,
    /// Requests that hit an unrecoverable scheduling error, with the error.
    pub failed: Vec<(RequestId, Error)>,
    /// Device-side block copies from beam divergence, to be forwarded to
    /// the compute step.
    pub copy_ops: Vec<CopyBlockOp>,
}

impl ScheduleOutputs {
    /// Check if there is anything to compute this iteration.
    pub fn is_empty(&self) -> bool {
        self.context_requests.is_empty() && self.generation_requests.is_empty()
    }

    /// Number of requests in the active batch this iteration.
    pub fn num_scheduled(&self) -> usize {
        self.context_requests.len() + self.generation_requests.len()
    }

    /// All scheduled request IDs, context phase first.
    pub fn scheduled_ids(&self) -> Vec<RequestId> {
        let mut ids = self.context_requests.clone();
        ids.extend(&self.generation_requests);
        ids
    }
}

/// Continuous batching scheduler.
///
/// Owns only queue membership and the policy; requests live in the batch
/// manager's map and the pool lives in the cache manager, both passed in
/// per call.
#[derive(Debug)]
pub struct Scheduler {
    /// Scheduling policy, immutable after construction.
    policy: SchedulerPolicy,
    /// Maximum number of concurrently executing requests.
    max_num_requests: usize,
    /// Queued request IDs in FIFO order. Paused requests re-enter at the
    /// front.
    pending: VecDeque<RequestId>,
    /// Executing request IDs in admission order.
    active: Vec<RequestId>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(policy: SchedulerPolicy, max_num_requests: usize) -> Self {
        Self {
            policy,
            max_num_requests,
            pending: VecDeque::new(),
            active: Vec::new(),
        }
    }

    /// Get the scheduling policy.
    pub fn policy(&self) -> SchedulerPolicy {
        self.policy
    }

    /// Queue a new request for admission.
    pub fn enqueue(&mut self, request_id: RequestId) {
        self.pending.push_back(request_id);
    }

    /// Remove a request from the pending queue and the active batch
    /// (completion, cancellation, or failure teardown).
    pub fn remove(&mut self, request_id: RequestId) {
        self.pending.retain(|&id| id != request_id);
        self.active.retain(|&id| id != request_id);
    }

    /// Number of requests waiting for admission.
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of requests in the active batch.
    pub fn num_active(&self) -> usize {
        self.active.len()
    }

    /// Executing request IDs in admission order.
    pub fn active_ids(&self) -> &[RequestId] {
        &self.active
    }

    /// Check if any request is pending or executing.
    pub fn has_work(&self) -> bool {
        !self.pending.is_empty() || !self.active.is_empty()
    }

    /// Remaining admission capacity for this iteration's intake pull.
    pub fn intake_capacity(&self) -> usize {
        self.max_num_requests
            .saturating_sub(self.active.len() + self.pending.len())
    }

    /// Run one scheduling step: admission, then growth/pause.
    ///
    /// Mutates request phases and cache state; the caller owns both maps
    /// and applies the returned outputs to the compute step.
    pub fn schedule(
        &mut self,
        requests: &mut HashMap<RequestId, Request>,
        cache: &mut CacheManager,
    ) -> ScheduleOutputs {
        let mut outputs = ScheduleOutputs::default();

        self.admit(requests, cache, &mut outputs);
        self.grow(requests, cache, &mut outputs);

        outputs
    }

    /// Admission: FIFO, bounded by the batch size, feasibility-gated.
    fn admit(
        &mut self,
        requests: &mut HashMap<RequestId, Request>,
        cache: &mut CacheManager,
        outputs: &mut ScheduleOutputs,
    ) {
        // Blocks promised to requests admitted earlier in this same
        // iteration, whose growth has not been committed yet. Only needed
        // under MaxUtilization; the reservation ledger covers
        // GuaranteedNoEvict as soon as add_request runs.
        let mut pending_blocks = 0usize;

        while self.active.len() < self.max_num_requests {
            let Some(&request_id) = self.pending.front() else {
                break;
            };

            // Drop stale IDs (cancelled while queued).
            let Some(request) = requests.get_mut(&request_id) else {
                self.pending.pop_front();
                continue;
            };

            let feasible = match self.policy {
                SchedulerPolicy::GuaranteedNoEvict => cache.can_allocate(request, self.policy),
                SchedulerPolicy::MaxUtilization => cache.can_allocate_with_margin(
                    request,
                    pending_blocks,
                ),
            };
            if !feasible {
                // Head-of-line blocking: the client waits, nobody jumps the
                // queue.
                break;
            }
            if self.policy == SchedulerPolicy::MaxUtilization {
                pending_blocks += cache.next_step_blocks(request);
            }

            self.pending.pop_front();
            if let Err(e) = cache.add_request_with_policy(request, self.policy) {
                outputs.failed.push((request_id, e));
                continue;
            }
            if let Err(e) = request.set_context() {
                cache.free(request_id);
                outputs.failed.push((request_id, e));
                continue;
            }

            debug!(
                request_id,
                context_len = request.context_len(),
                "admitted request"
            );
            self.active.push(request_id);
            outputs.admitted.push(request_id);
        }
    }

    /// Growth: allocate capacity for the tokens processed this iteration.
    fn grow(
        &mut self,
        requests: &mut HashMap<RequestId, Request>,
        cache: &mut CacheManager,
        outputs: &mut ScheduleOutputs,
    ) {
        let active: Vec<RequestId> = self.active.clone();

        for request_id in active {
            let Some(request) = requests.get_mut(&request_id) else {
                self.active.retain(|&id| id != request_id);
                continue;
            };

            let growth = match request.phase() {
                RequestPhase::Context => {
                    if request.output_len() == 0 {
                        // Fresh prompt: processed on beam 0; beams fork at
                        // the first generation step.
                        let need = request.context_len() - cache.beam_len(request_id, 0);
                        cache.grow_beam(request_id, 0, need)
                    } else {
                        // Resume after a pause: every beam recomputes its own
                        // prefix, which has already diverged past the prompt.
                        let mut copies = Vec::new();
                        let mut result = Ok(());
                        for beam in 0..request.beam_width() {
                            let need =
                                request.context_len() - cache.beam_len(request_id, beam);
                            match cache.grow_beam(request_id, beam, need) {
                                Ok(ops) => copies.extend(ops),
                                Err(e) => {
                                    result = Err(e);
                                    break;
                                }
                            }
                        }
                        result.map(|()| copies)
                    }
                }
                RequestPhase::Generation => {
                    let mut copies = Vec::new();
                    let mut result = Ok(());
                    for beam in 0..request.beam_width() {
                        match cache.grow_beam(request_id, beam, 1) {
                            Ok(ops) => copies.extend(ops),
                            Err(e) => {
                                result = Err(e);
                                break;
                            }
                        }
                    }
                    result.map(|()| copies)
                }
                _ => continue,
            };

            match growth {
                Ok(copies) => {
                    outputs.copy_ops.extend(copies);
                    match request.phase() {
                        RequestPhase::Context => outputs.context_requests.push(request_id),
                        RequestPhase::Generation => outputs.generation_requests.push(request_id),
                        _ => {}
                    }
                }
                Err(Error::OutOfBlocks) => match self.policy {
                    SchedulerPolicy::MaxUtilization => {
                        self.pause(request_id, request, cache);
                        outputs.paused.push(request_id);
                    }
                    SchedulerPolicy::GuaranteedNoEvict => {
                        // Admission reserved worst-case capacity; running out
                        // here is an accounting bug.
                        error!(request_id, "out of blocks under GuaranteedNoEvict");
                        self.active.retain(|&id| id != request_id);
                        cache.free(request_id);
                        outputs.failed.push((
                            request_id,
                            Error::Internal(format!(
                                "block pool exhausted for request {request_id} despite \
                                 worst-case reservation"
                            )),
                        ));
                    }
                },
                Err(e) => {
                    self.active.retain(|&id| id != request_id);
                    cache.free(request_id);
                    outputs.failed.push((request_id, e));
                }
            }
        }
    }

    /// Pause an executing request: free its blocks and re-queue it at the
    /// front so it is retried before any later arrival.
    fn pause(&mut self, request_id: RequestId, request: &mut Request, cache: &mut CacheManager) {
        warn!(
            request_id,
            generated = request.output_len(),
            "pausing request under memory pressure"
        );
        // Transition first; an executing request always accepts Paused.
        let _ = request.set_paused();
        cache.free(request_id);
        self.active.retain(|&id| id != request_id);
        self.pending.push_front(request_id);
    }
}
