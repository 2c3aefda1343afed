//! End-to-end tests for the batch manager loop, driven by scripted compute
//! steps.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use inflight::{
    BatchManager, BatchManagerConfig, BeamOutput, ComputeBatch, ComputeStep, Error,
    GenerationParams, NewRequest, RequestId, RequestPhase, Response, ResponseSink, Result,
    SchedulerPolicy, StatsSink, StepOutput, StopSignalSource,
};

// ========== Harness ==========

#[derive(Clone, Default)]
struct SharedResponses(Rc<RefCell<Vec<Response>>>);

impl SharedResponses {
    fn all(&self) -> Vec<Response> {
        self.0.borrow().clone()
    }

    fn finals(&self) -> Vec<Response> {
        self.0.borrow().iter().filter(|r| r.is_final).cloned().collect()
    }
}

impl ResponseSink for SharedResponses {
    fn deliver(&mut self, response: Response) {
        self.0.borrow_mut().push(response);
    }
}

#[derive(Clone, Default)]
struct SharedStops(Rc<RefCell<HashSet<RequestId>>>);

impl SharedStops {
    fn signal(&self, request_id: RequestId) {
        self.0.borrow_mut().insert(request_id);
    }
}

impl StopSignalSource for SharedStops {
    fn poll(&mut self) -> HashSet<RequestId> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

#[derive(Clone, Default)]
struct SharedStats(Rc<RefCell<Vec<String>>>);

impl StatsSink for SharedStats {
    fn record(&mut self, snapshot: &str) {
        self.0.borrow_mut().push(snapshot.to_string());
    }
}

/// Emits one fixed token per beam every iteration, greedy sources.
struct FixedToken(u32);

impl ComputeStep for FixedToken {
    fn execute(&mut self, batch: &ComputeBatch) -> Result<Vec<StepOutput>> {
        Ok(batch
            .entries
            .iter()
            .map(|entry| StepOutput {
                request_id: entry.request_id,
                beams: (0..entry.beam_tokens.len())
                    .map(|beam| BeamOutput {
                        source_beam: if entry.phase == RequestPhase::Context { 0 } else { beam },
                        token_id: self.0,
                    })
                    .collect(),
            })
            .collect())
    }
}

/// Emits `token` for the first `steps` outputs of each request, then `stop`.
struct StopAfter {
    token: u32,
    stop: u32,
    steps: usize,
    seen: HashMap<RequestId, usize>,
}

impl StopAfter {
    fn new(token: u32, stop: u32, steps: usize) -> Self {
        Self {
            token,
            stop,
            steps,
            seen: HashMap::new(),
        }
    }
}

impl ComputeStep for StopAfter {
    fn execute(&mut self, batch: &ComputeBatch) -> Result<Vec<StepOutput>> {
        Ok(batch
            .entries
            .iter()
            .map(|entry| {
                let count = self.seen.entry(entry.request_id).or_insert(0);
                *count += 1;
                let token_id = if *count > self.steps { self.stop } else { self.token };
                StepOutput {
                    request_id: entry.request_id,
                    beams: (0..entry.beam_tokens.len())
                        .map(|beam| BeamOutput {
                            source_beam: if entry.phase == RequestPhase::Context {
                                0
                            } else {
                                beam
                            },
                            token_id,
                        })
                        .collect(),
                }
            })
            .collect())
    }
}

struct FailingStep;

impl ComputeStep for FailingStep {
    fn execute(&mut self, _batch: &ComputeBatch) -> Result<Vec<StepOutput>> {
        Err(Error::ComputeStep("device lost".to_string()))
    }
}

fn config(policy: SchedulerPolicy, num_blocks: usize, block_size: usize) -> BatchManagerConfig {
    BatchManagerConfig {
        max_num_requests: 8,
        max_beam_width: 4,
        block_size,
        num_blocks,
        policy,
    }
}

fn new_request(request_id: RequestId, prompt_len: usize, max_new: usize) -> NewRequest {
    NewRequest {
        request_id,
        prompt_token_ids: (1..=prompt_len as u32).collect(),
        params: GenerationParams {
            max_new_tokens: max_new,
            beam_width: 1,
            streaming: false,
            stop_tokens: vec![0],
        },
    }
}

fn build(
    config: BatchManagerConfig,
    intake: Vec<NewRequest>,
    compute: Box<dyn ComputeStep>,
) -> (BatchManager, SharedResponses, SharedStops) {
    let responses = SharedResponses::default();
    let stops = SharedStops::default();
    let manager = BatchManager::new(
        config,
        Box::new(intake.into_iter().collect::<VecDeque<_>>()),
        Box::new(responses.clone()),
        Box::new(stops.clone()),
        compute,
    )
    .unwrap();
    (manager, responses, stops)
}

// ========== Tests ==========

#[test]
fn test_single_request_runs_to_max_tokens() {
    let (mut manager, responses, _stops) = build(
        config(SchedulerPolicy::GuaranteedNoEvict, 16, 4),
        vec![new_request(1, 3, 3)],
        Box::new(FixedToken(7)),
    );

    manager.drain().unwrap();

    let finals = responses.finals();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].request_id, 1);
    assert_eq!(finals[0].beam_outputs, vec![vec![7, 7, 7]]);
    assert!(finals[0].error.is_none());

    assert_eq!(manager.num_active_requests(), 0);
    assert_eq!(manager.cache().num_free_blocks(), 16);
    assert!(manager.cache().accounting_is_consistent());
}

#[test]
fn test_stop_token_finishes_request_early() {
    let (mut manager, responses, _stops) = build(
        config(SchedulerPolicy::GuaranteedNoEvict, 32, 4),
        vec![new_request(1, 3, 10)],
        Box::new(StopAfter::new(7, 0, 2)),
    );

    manager.drain().unwrap();

    let finals = responses.finals();
    assert_eq!(finals.len(), 1);
    // Two ordinary tokens, then the stop token is emitted and kept.
    assert_eq!(finals[0].beam_outputs, vec![vec![7, 7, 0]]);
    assert_eq!(manager.cache().num_free_blocks(), 32);
}

#[test]
fn test_streaming_emits_cumulative_partials() {
    let mut request = new_request(1, 2, 3);
    request.params.streaming = true;

    let (mut manager, responses, _stops) = build(
        config(SchedulerPolicy::GuaranteedNoEvict, 16, 4),
        vec![request],
        Box::new(FixedToken(7)),
    );

    manager.drain().unwrap();

    let all = responses.all();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].beam_outputs, vec![vec![7]]);
    assert!(!all[0].is_final);
    assert_eq!(all[1].beam_outputs, vec![vec![7, 7]]);
    assert!(!all[1].is_final);
    assert_eq!(all[2].beam_outputs, vec![vec![7, 7, 7]]);
    assert!(all[2].is_final);
}

#[test]
fn test_cancel_mid_generation_frees_blocks_and_responds_once() {
    let (mut manager, responses, stops) = build(
        config(SchedulerPolicy::GuaranteedNoEvict, 16, 2),
        vec![new_request(1, 4, 8)],
        Box::new(FixedToken(7)),
    );

    // Context pass plus one generation step; three blocks in use.
    manager.step().unwrap();
    manager.step().unwrap();
    assert_eq!(manager.cache().num_blocks_held(1), 3);

    stops.signal(1);
    let summary = manager.step().unwrap();
    assert_eq!(summary.num_cancelled, 1);

    // Exactly one final response, empty output, no error.
    let all = responses.all();
    assert_eq!(all.len(), 1);
    assert!(all[0].is_final);
    assert!(all[0].beam_outputs.is_empty());
    assert!(all[0].error.is_none());

    assert_eq!(manager.num_active_requests(), 0);
    assert_eq!(manager.cache().num_free_blocks(), 16);
    assert!(manager.cache().accounting_is_consistent());

    // Cancelling again is a no-op.
    stops.signal(1);
    manager.step().unwrap();
    assert_eq!(responses.all().len(), 1);
}

#[test]
fn test_cancel_unknown_id_is_ignored() {
    let (mut manager, responses, stops) = build(
        config(SchedulerPolicy::GuaranteedNoEvict, 16, 4),
        vec![new_request(1, 2, 2)],
        Box::new(FixedToken(7)),
    );

    stops.signal(99);
    manager.step().unwrap();
    assert_eq!(manager.num_active_requests(), 1);
    assert!(responses.all().iter().all(|r| r.request_id != 99));
}

#[test]
fn test_duplicate_request_id_rejected() {
    let (mut manager, responses, _stops) = build(
        config(SchedulerPolicy::GuaranteedNoEvict, 16, 4),
        vec![new_request(1, 3, 2), new_request(1, 5, 2)],
        Box::new(FixedToken(7)),
    );

    manager.drain().unwrap();

    let all = responses.all();
    assert_eq!(all.len(), 2);
    // The duplicate is rejected up front with an error response.
    assert!(all[0].error.is_some());
    assert!(all[0].is_final);
    // The original request is unaffected and completes.
    assert!(all[1].error.is_none());
    assert_eq!(all[1].beam_outputs, vec![vec![7, 7]]);
}

#[test]
fn test_invalid_intake_rejected() {
    let mut empty_prompt = new_request(1, 0, 2);
    empty_prompt.prompt_token_ids.clear();
    let mut too_wide = new_request(2, 3, 2);
    too_wide.params.beam_width = 5; // max is 4

    let (mut manager, responses, _stops) = build(
        config(SchedulerPolicy::GuaranteedNoEvict, 16, 4),
        vec![empty_prompt, too_wide],
        Box::new(FixedToken(7)),
    );

    manager.drain().unwrap();

    let all = responses.all();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|r| r.is_final && r.error.is_some()));
    assert_eq!(manager.num_active_requests(), 0);
}

#[test]
fn test_oversized_request_never_admitted_under_guaranteed() {
    // Pool of 4 blocks, 2 tokens each; declared maximum length 10 needs 5.
    let (mut manager, responses, _stops) = build(
        config(SchedulerPolicy::GuaranteedNoEvict, 4, 2),
        vec![new_request(1, 2, 8)],
        Box::new(FixedToken(7)),
    );

    // Drain returns instead of spinning; the request stays queued.
    manager.drain().unwrap();
    assert!(responses.all().is_empty());
    assert_eq!(manager.num_active_requests(), 1);
    assert_eq!(manager.cache().num_free_blocks(), 4);
}

#[test]
fn test_oversized_request_pauses_under_max_utilization() {
    // Same request under MaxUtilization makes partial progress, pauses when
    // the pool runs dry, and drain still terminates.
    let (mut manager, responses, _stops) = build(
        config(SchedulerPolicy::MaxUtilization, 4, 2),
        vec![new_request(1, 2, 8)],
        Box::new(FixedToken(7)),
    );

    manager.drain().unwrap();

    // No final response: the request cannot finish in this pool.
    assert!(responses.finals().is_empty());
    assert_eq!(manager.num_active_requests(), 1);
    // Whatever it held was returned when it was paused.
    assert_eq!(manager.cache().num_free_blocks(), 4);
    assert!(manager.cache().accounting_is_consistent());
}

#[test]
fn test_beam_search_forks_and_completes() {
    let mut request = new_request(1, 3, 4);
    request.params.beam_width = 2;

    let (mut manager, responses, _stops) = build(
        config(SchedulerPolicy::GuaranteedNoEvict, 32, 4),
        vec![request],
        Box::new(FixedToken(7)),
    );

    loop {
        manager.step().unwrap();
        assert!(manager.cache().accounting_is_consistent());
        if !manager.has_work() {
            break;
        }
    }

    let finals = responses.finals();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].beam_outputs.len(), 2);
    for beam in &finals[0].beam_outputs {
        assert_eq!(beam, &vec![7, 7, 7, 7]);
    }
    assert_eq!(manager.cache().num_free_blocks(), 32);
}

#[test]
fn test_beam_resampling_rewrites_histories() {
    /// Context: beams fork from 0 with distinct tokens. First generation
    /// step: both beams continue beam 1's hypothesis.
    struct Scripted {
        calls: usize,
    }

    impl ComputeStep for Scripted {
        fn execute(&mut self, batch: &ComputeBatch) -> Result<Vec<StepOutput>> {
            self.calls += 1;
            let beams = if self.calls == 1 {
                vec![
                    BeamOutput { source_beam: 0, token_id: 10 },
                    BeamOutput { source_beam: 0, token_id: 20 },
                ]
            } else {
                vec![
                    BeamOutput { source_beam: 1, token_id: 30 },
                    BeamOutput { source_beam: 1, token_id: 40 },
                ]
            };
            Ok(vec![StepOutput {
                request_id: batch.entries[0].request_id,
                beams,
            }])
        }
    }

    let mut request = new_request(1, 3, 2);
    request.params.beam_width = 2;

    let (mut manager, responses, _stops) = build(
        config(SchedulerPolicy::GuaranteedNoEvict, 32, 4),
        vec![request],
        Box::new(Scripted { calls: 0 }),
    );

    manager.drain().unwrap();

    let finals = responses.finals();
    assert_eq!(finals.len(), 1);
    // Beam 0's first token (10) was discarded by the resampling step; both
    // beams share beam 1's history before diverging on the new token.
    assert_eq!(finals[0].beam_outputs, vec![vec![20, 30], vec![20, 40]]);
    assert_eq!(manager.cache().num_free_blocks(), 32);
    assert!(manager.cache().accounting_is_consistent());
}

#[test]
fn test_compute_failure_fails_batch_but_loop_survives() {
    let (mut manager, responses, _stops) = build(
        config(SchedulerPolicy::GuaranteedNoEvict, 16, 4),
        vec![new_request(1, 3, 4)],
        Box::new(FailingStep),
    );

    // The iteration itself succeeds; the failure lands on the request.
    manager.step().unwrap();

    let finals = responses.finals();
    assert_eq!(finals.len(), 1);
    assert!(finals[0].error.as_deref().unwrap().contains("device lost"));
    assert!(finals[0].beam_outputs.is_empty());

    assert_eq!(manager.num_active_requests(), 0);
    assert_eq!(manager.cache().num_free_blocks(), 16);
}

#[test]
fn test_many_requests_drain_cleanly() {
    let intake: Vec<NewRequest> = (1..=6).map(|id| new_request(id, 3, 4)).collect();
    let (mut manager, responses, _stops) = build(
        config(SchedulerPolicy::GuaranteedNoEvict, 32, 4),
        intake,
        Box::new(FixedToken(7)),
    );

    loop {
        manager.step().unwrap();
        assert!(manager.cache().accounting_is_consistent());
        if !manager.has_work() {
            break;
        }
    }

    let finals = responses.finals();
    assert_eq!(finals.len(), 6);
    for response in &finals {
        assert!(response.error.is_none());
        assert_eq!(response.beam_outputs, vec![vec![7, 7, 7, 7]]);
    }
    assert_eq!(manager.cache().num_free_blocks(), 32);
}

#[test]
fn test_stats_sink_records_json_snapshots() {
    let stats = SharedStats::default();
    let responses = SharedResponses::default();
    let stops = SharedStops::default();
    let intake: VecDeque<NewRequest> = vec![new_request(1, 3, 3)].into_iter().collect();

    let mut manager = BatchManager::new(
        config(SchedulerPolicy::GuaranteedNoEvict, 16, 4),
        Box::new(intake),
        Box::new(responses),
        Box::new(stops),
        Box::new(FixedToken(7)),
    )
    .unwrap()
    .with_stats_sink(Box::new(stats.clone()));

    manager.drain().unwrap();

    let snapshots = stats.0.borrow();
    assert!(!snapshots.is_empty());
    for snapshot in snapshots.iter() {
        let value: serde_json::Value = serde_json::from_str(snapshot).unwrap();
        assert!(value.get("iteration").is_some());
        assert!(value.get("active_requests").is_some());
    }
}
