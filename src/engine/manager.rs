//! Batch manager: the iteration loop orchestrator.
//!
//! Drives one iteration at a time: pull new requests from the intake, run
//! the scheduler against the cache manager, execute the external compute
//! step for the active batch, commit token and cache updates, emit
//! responses, then process stop signals. A single worker runs each
//! iteration to completion before the next starts; every structure here is
//! single-writer.
//!
//! In multi-rank deployments each rank runs an independent instance of this
//! loop; it is the caller's responsibility that all ranks observe an
//! identical intake and stop-signal stream each iteration.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::config::BatchManagerConfig;
use crate::core::cache_manager::CacheManager;
use crate::core::request::{FinishReason, Request, RequestId, RequestPhase};
use crate::engine::compute::{BatchEntry, ComputeBatch, ComputeStep, StepOutput};
use crate::engine::hooks::{
    IterationStats, NewRequest, RequestIntake, Response, ResponseSink, StatsSink, StopSignalSource,
};
use crate::error::{Error, Result};
use crate::scheduler::{ScheduleOutputs, Scheduler};

/// What one iteration did, for drivers and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterationSummary {
    /// Iteration counter before this step.
    pub iteration: u64,
    /// Requests in the active batch this iteration.
    pub num_scheduled: usize,
    /// Requests admitted from the queue.
    pub num_admitted: usize,
    /// Requests paused under memory pressure.
    pub num_paused: usize,
    /// Requests that completed.
    pub num_completed: usize,
    /// Requests cancelled via stop signal.
    pub num_cancelled: usize,
}

/// Orchestrates scheduler, cache manager, and the external compute step.
///
/// Owns every [`Request`] for its lifetime; the scheduler and cache manager
/// refer to requests by ID only. The block pool lives inside the cache
/// manager and is passed by reference, never ambient global state.
pub struct BatchManager {
    config: BatchManagerConfig,
    scheduler: Scheduler,
    cache: CacheManager,
    requests: HashMap<RequestId, Request>,
    intake: Box<dyn RequestIntake>,
    responses: Box<dyn ResponseSink>,
    stop_signals: Box<dyn StopSignalSource>,
    stats: Option<Box<dyn StatsSink>>,
    compute: Box<dyn ComputeStep>,
    iteration: u64,
}

impl BatchManager {
    /// Create a new batch manager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration.
    pub fn new(
        config: BatchManagerConfig,
        intake: Box<dyn RequestIntake>,
        responses: Box<dyn ResponseSink>,
        stop_signals: Box<dyn StopSignalSource>,
        compute: Box<dyn ComputeStep>,
    ) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::new(config.policy, config.max_num_requests);
        let cache = CacheManager::new(config.num_blocks, config.block_size)?;
        info!(
            policy = config.policy.as_str(),
            num_blocks = config.num_blocks,
            block_size = config.block_size,
            "batch manager ready"
        );
        Ok(Self {
            config,
            scheduler,
            cache,
            requests: HashMap::new(),
            intake,
            responses,
            stop_signals,
            stats: None,
            compute,
            iteration: 0,
        })
    }

    /// Attach an optional stats sink.
    pub fn with_stats_sink(mut self, sink: Box<dyn StatsSink>) -> Self {
        self.stats = Some(sink);
        self
    }

    /// Check if any request is queued, executing, or paused.
    pub fn has_work(&self) -> bool {
        !self.requests.is_empty()
    }

    /// Number of requests currently tracked.
    pub fn num_active_requests(&self) -> usize {
        self.requests.len()
    }

    /// The iteration counter.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Cache manager access for diagnostics and tests.
    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Run one iteration of the batching loop.
    ///
    /// # Errors
    ///
    /// Only infrastructure errors (stats serialization) surface here;
    /// per-request failures are reported through the response sink and
    /// leave the loop intact.
    pub fn step(&mut self) -> Result<IterationSummary> {
        let mut summary = IterationSummary {
            iteration: self.iteration,
            ..IterationSummary::default()
        };

        self.pull_intake();

        let outputs = self.scheduler.schedule(&mut self.requests, &mut self.cache);
        summary.num_scheduled = outputs.num_scheduled();
        summary.num_admitted = outputs.admitted.len();
        summary.num_paused = outputs.paused.len();

        for (request_id, err) in &outputs.failed {
            let message = err.to_string();
            self.fail_request(*request_id, &message);
        }

        if !outputs.is_empty() {
            let batch = self.build_batch(&outputs);
            match self.compute.execute(&batch) {
                Ok(step_outputs) => self.apply_step_outputs(&outputs, step_outputs),
                Err(e) => {
                    // Fatal for every request in this iteration's batch; the
                    // loop itself survives.
                    error!(error = %e, "compute step failed");
                    let msg = e.to_string();
                    for request_id in outputs.scheduled_ids() {
                        self.fail_request(request_id, &msg);
                    }
                }
            }
        }

        self.finish_and_respond(&outputs, &mut summary);
        self.process_stop_signals(&mut summary);
        self.report_stats()?;

        self.iteration += 1;
        Ok(summary)
    }

    /// Run iterations until no request can make further progress.
    ///
    /// Requests that stay queued because the pool can never admit them do
    /// not keep the loop spinning: after two consecutive idle iterations
    /// the drain returns with those requests still queued, per the
    /// no-intrinsic-timeout contract.
    ///
    /// # Errors
    ///
    /// Propagates infrastructure errors from [`step`](Self::step).
    pub fn drain(&mut self) -> Result<()> {
        let mut idle_iterations = 0usize;
        loop {
            // Step before checking: queued intake only becomes visible work
            // once an iteration has pulled it.
            let summary = self.step()?;
            if !self.has_work() {
                return Ok(());
            }
            if summary.num_scheduled == 0 && summary.num_cancelled == 0 {
                idle_iterations += 1;
                if idle_iterations >= 2 {
                    warn!(
                        remaining = self.requests.len(),
                        "drain stalled; remaining requests stay queued/paused"
                    );
                    return Ok(());
                }
            } else {
                idle_iterations = 0;
            }
        }
    }

    // ========== Iteration phases ==========

    /// Pull new requests, rejecting duplicates and invalid parameters.
    fn pull_intake(&mut self) {
        let capacity = self.scheduler.intake_capacity();
        if capacity == 0 {
            return;
        }

        for new_request in self.intake.fetch(Some(capacity)) {
            let request_id = new_request.request_id;
            if let Err(e) = self.validate_intake(&new_request) {
                warn!(request_id, error = %e, "rejecting intake entry");
                self.responses.deliver(Response {
                    request_id,
                    beam_outputs: Vec::new(),
                    is_final: true,
                    error: Some(e.to_string()),
                });
                continue;
            }

            let request = Request::new(request_id, new_request.prompt_token_ids, new_request.params);
            debug!(
                request_id,
                prompt_len = request.prompt_len(),
                beam_width = request.beam_width(),
                "queued request"
            );
            self.requests.insert(request_id, request);
            self.scheduler.enqueue(request_id);
        }
    }

    fn validate_intake(&self, new_request: &NewRequest) -> Result<()> {
        if self.requests.contains_key(&new_request.request_id) {
            return Err(Error::DuplicateRequestId(new_request.request_id));
        }
        if new_request.prompt_token_ids.is_empty() {
            return Err(Error::Config("empty prompt".to_string()));
        }
        if new_request.params.beam_width > self.config.max_beam_width {
            return Err(Error::Config(format!(
                "beam width {} exceeds maximum {}",
                new_request.params.beam_width, self.config.max_beam_width
            )));
        }
        Ok(())
    }

    /// Assemble the compute batch for the scheduled requests.
    fn build_batch(&self, outputs: &ScheduleOutputs) -> ComputeBatch {
        let mut batch = ComputeBatch {
            iteration: self.iteration,
            copy_ops: outputs.copy_ops.clone(),
            entries: Vec::with_capacity(outputs.num_scheduled()),
        };

        for &request_id in &outputs.context_requests {
            if let Some(entry) = self.build_context_entry(request_id) {
                batch.entries.push(entry);
            }
        }
        for &request_id in &outputs.generation_requests {
            if let Some(entry) = self.build_generation_entry(request_id) {
                batch.entries.push(entry);
            }
        }

        batch
    }

    fn build_context_entry(&self, request_id: RequestId) -> Option<BatchEntry> {
        let request = self.requests.get(&request_id)?;
        let beam_width = request.beam_width();
        let fresh = request.output_len() == 0;

        let mut beam_tokens = Vec::with_capacity(beam_width);
        let mut block_tables = Vec::with_capacity(beam_width);
        let mut slot_mappings = Vec::with_capacity(beam_width);

        for beam in 0..beam_width {
            // A fresh admission processes the prompt on beam 0 only; a
            // resumed request recomputes every beam's divergent prefix.
            let tokens = if fresh && beam > 0 {
                Vec::new()
            } else {
                request.beam_token_ids(beam).ok()?
            };
            let table = self.cache.block_table(request_id, beam).ok()?;
            let len = self.cache.beam_len(request_id, beam);
            beam_tokens.push(tokens);
            block_tables.push(table.get_physical_block_ids().to_vec());
            slot_mappings.push(table.get_slot_mapping(len));
        }

        Some(BatchEntry {
            request_id,
            phase: RequestPhase::Context,
            beam_tokens,
            block_tables,
            slot_mappings,
        })
    }

    fn build_generation_entry(&self, request_id: RequestId) -> Option<BatchEntry> {
        let request = self.requests.get(&request_id)?;
        let beam_width = request.beam_width();

        let mut beam_tokens = Vec::with_capacity(beam_width);
        let mut block_tables = Vec::with_capacity(beam_width);
        let mut slot_mappings = Vec::with_capacity(beam_width);

        for beam in 0..beam_width {
            let last_token = request.beam_output(beam).ok()?.last().copied()?;
            let table = self.cache.block_table(request_id, beam).ok()?;
            let len = self.cache.beam_len(request_id, beam);
            beam_tokens.push(vec![last_token]);
            block_tables.push(table.get_physical_block_ids().to_vec());
            // Only the newest slot is written this iteration.
            slot_mappings.push(table.get_slot_mapping(len).split_off(len.saturating_sub(1)));
        }

        Some(BatchEntry {
            request_id,
            phase: RequestPhase::Generation,
            beam_tokens,
            block_tables,
            slot_mappings,
        })
    }

    /// Commit compute outputs: phase transitions, beam resampling, tokens.
    fn apply_step_outputs(&mut self, outputs: &ScheduleOutputs, step_outputs: Vec<StepOutput>) {
        let mut by_id: HashMap<RequestId, StepOutput> = step_outputs
            .into_iter()
            .map(|o| (o.request_id, o))
            .collect();

        for &request_id in &outputs.context_requests {
            match by_id.remove(&request_id) {
                Some(output) => self.apply_context_output(request_id, output),
                None => self.fail_request(request_id, "compute step returned no output"),
            }
        }
        for &request_id in &outputs.generation_requests {
            match by_id.remove(&request_id) {
                Some(output) => self.apply_generation_output(request_id, output),
                None => self.fail_request(request_id, "compute step returned no output"),
            }
        }

        for request_id in by_id.into_keys() {
            warn!(request_id, "dropping compute output for unscheduled request");
        }
    }

    fn apply_context_output(&mut self, request_id: RequestId, output: StepOutput) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        let beam_width = request.beam_width();
        if output.beams.len() != beam_width {
            self.fail_request(request_id, "compute step returned wrong beam count");
            return;
        }
        if request.set_generation().is_err() {
            self.fail_request(request_id, "request left context phase unexpectedly");
            return;
        }

        // Beams fork from beam 0 after a fresh context pass; a resumed
        // request already holds one cache state per beam.
        if beam_width > 1 && request.output_len() == 0 {
            let sources = vec![0usize; beam_width];
            if let Err(e) = self.cache.resample_beams(request_id, &sources) {
                self.fail_request(request_id, &e.to_string());
                return;
            }
        }

        self.append_beam_tokens(request_id, &output);
        self.check_completion(request_id);
    }

    fn apply_generation_output(&mut self, request_id: RequestId, output: StepOutput) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        let beam_width = request.beam_width();
        if output.beams.len() != beam_width {
            self.fail_request(request_id, "compute step returned wrong beam count");
            return;
        }

        let sources: Vec<usize> = output.beams.iter().map(|b| b.source_beam).collect();
        let identity = sources.iter().enumerate().all(|(i, &s)| s == i);
        if !identity {
            let resampled = self
                .cache
                .resample_beams(request_id, &sources)
                .and_then(|()| {
                    self.requests
                        .get_mut(&request_id)
                        .ok_or(Error::RequestNotFound(request_id))?
                        .resample_beams(&sources)
                });
            if let Err(e) = resampled {
                self.fail_request(request_id, &e.to_string());
                return;
            }
        }

        self.append_beam_tokens(request_id, &output);
        self.check_completion(request_id);
    }

    fn append_beam_tokens(&mut self, request_id: RequestId, output: &StepOutput) {
        if let Some(request) = self.requests.get_mut(&request_id) {
            for (beam, beam_output) in output.beams.iter().enumerate() {
                let _ = request.append_beam_token(beam, beam_output.token_id);
            }
        }
    }

    /// Completion check: stop token on any beam, or output budget spent.
    fn check_completion(&mut self, request_id: RequestId) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        let stopped = (0..request.beam_width()).any(|beam| {
            request
                .beam_output(beam)
                .ok()
                .and_then(|tokens| tokens.last())
                .is_some_and(|&t| request.is_stop_token(t))
        });

        let reason = if stopped {
            Some(FinishReason::StopToken)
        } else if request.reached_max_tokens() {
            Some(FinishReason::MaxTokens)
        } else {
            None
        };

        if let Some(reason) = reason {
            let _ = request.set_completed(reason);
        }
    }

    /// Emit responses for this iteration and tear down finished requests.
    ///
    /// Blocks are freed only after the final response is handed off.
    fn finish_and_respond(&mut self, outputs: &ScheduleOutputs, summary: &mut IterationSummary) {
        for request_id in outputs.scheduled_ids() {
            let Some(request) = self.requests.get(&request_id) else {
                continue;
            };

            if request.phase() == RequestPhase::Completed {
                debug!(
                    request_id,
                    output_len = request.output_len(),
                    reason = ?request.finish_reason(),
                    "request completed"
                );
                self.responses.deliver(Response {
                    request_id,
                    beam_outputs: request.beam_outputs().to_vec(),
                    is_final: true,
                    error: None,
                });
                self.cache.free(request_id);
                self.scheduler.remove(request_id);
                self.requests.remove(&request_id);
                summary.num_completed += 1;
            } else if request.params().streaming && request.output_len() > 0 {
                self.responses.deliver(Response {
                    request_id,
                    beam_outputs: request.beam_outputs().to_vec(),
                    is_final: false,
                    error: None,
                });
            }
        }
    }

    /// Cancel requests named by the stop-signal source.
    ///
    /// Unknown or already-terminal IDs are ignored; cancellation is
    /// cooperative and takes effect at this iteration boundary.
    fn process_stop_signals(&mut self, summary: &mut IterationSummary) {
        for request_id in self.stop_signals.poll() {
            let Some(request) = self.requests.get_mut(&request_id) else {
                continue;
            };
            if request.set_cancelled().is_err() {
                continue;
            }
            info!(request_id, "cancelled via stop signal");
            self.responses.deliver(Response {
                request_id,
                beam_outputs: Vec::new(),
                is_final: true,
                error: None,
            });
            self.cache.free(request_id);
            self.scheduler.remove(request_id);
            self.requests.remove(&request_id);
            summary.num_cancelled += 1;
        }
    }

    /// Tear down a request with a final error response.
    fn fail_request(&mut self, request_id: RequestId, message: &str) {
        warn!(request_id, message, "request failed");
        self.responses.deliver(Response {
            request_id,
            beam_outputs: Vec::new(),
            is_final: true,
            error: Some(message.to_string()),
        });
        self.cache.free(request_id);
        self.scheduler.remove(request_id);
        self.requests.remove(&request_id);
    }

    fn report_stats(&mut self) -> Result<()> {
        let Some(sink) = self.stats.as_mut() else {
            return Ok(());
        };
        if self.requests.is_empty() {
            return Ok(());
        }
        let stats = IterationStats {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_millis() as u64),
            iteration: self.iteration,
            active_requests: self.requests.len(),
        };
        sink.record(&serde_json::to_string(&stats)?);
        Ok(())
    }
}
