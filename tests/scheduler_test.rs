//! Integration tests for the scheduling policies, driving the scheduler and
//! cache manager over multiple iterations the way the batch manager does.

use std::collections::HashMap;

use inflight::core::cache_manager::CacheManager;
use inflight::core::request::{GenerationParams, Request, RequestId, RequestPhase};
use inflight::{Scheduler, SchedulerPolicy};

fn request(id: RequestId, prompt_len: usize, max_new: usize) -> Request {
    Request::new(
        id,
        (0..prompt_len as u32).collect(),
        GenerationParams {
            max_new_tokens: max_new,
            beam_width: 1,
            streaming: false,
            stop_tokens: Vec::new(),
        },
    )
}

/// Mimic the manager's post-compute bookkeeping: context requests move to
/// generation, every scheduled request appends one token per beam.
fn apply_iteration(
    requests: &mut HashMap<RequestId, Request>,
    context: &[RequestId],
    generation: &[RequestId],
) {
    for &id in context {
        let req = requests.get_mut(&id).unwrap();
        req.set_generation().unwrap();
        for beam in 0..req.beam_width() {
            req.append_beam_token(beam, 1).unwrap();
        }
    }
    for &id in generation {
        let req = requests.get_mut(&id).unwrap();
        for beam in 0..req.beam_width() {
            req.append_beam_token(beam, 1).unwrap();
        }
    }
}

#[test]
fn test_guaranteed_no_evict_never_pauses() {
    // Pool of 12 blocks, 2 tokens each. Two requests with worst case
    // ceil((2 + 6) / 2) = 4 blocks apiece fit together with room to spare.
    let mut sched = Scheduler::new(SchedulerPolicy::GuaranteedNoEvict, 8);
    let mut cache = CacheManager::new(12, 2).unwrap();
    let mut requests = HashMap::new();

    for id in [1, 2] {
        requests.insert(id, request(id, 2, 6));
        sched.enqueue(id);
    }

    for _ in 0..6 {
        let outputs = sched.schedule(&mut requests, &mut cache);
        assert!(outputs.paused.is_empty());
        assert!(outputs.failed.is_empty());
        apply_iteration(&mut requests, &outputs.context_requests, &outputs.generation_requests);
        assert!(cache.accounting_is_consistent());
    }

    // Both ran to their full budget without interruption.
    for id in [1, 2] {
        assert_eq!(requests[&id].output_len(), 6);
        assert_eq!(requests[&id].pause_count(), 0);
    }
}

#[test]
fn test_oversized_request_per_policy() {
    // Pool of 4 blocks, 2 tokens each; declared maximum length 10 needs 5.
    let mut requests = HashMap::new();
    requests.insert(1, request(1, 2, 8));

    // GuaranteedNoEvict refuses at admission and the request stays queued.
    let mut sched = Scheduler::new(SchedulerPolicy::GuaranteedNoEvict, 8);
    let mut cache = CacheManager::new(4, 2).unwrap();
    sched.enqueue(1);
    let outputs = sched.schedule(&mut requests, &mut cache);
    assert!(outputs.admitted.is_empty());
    assert_eq!(requests[&1].phase(), RequestPhase::Queued);

    // MaxUtilization admits the same request and makes partial progress
    // before pausing it.
    let mut requests = HashMap::new();
    requests.insert(1, request(1, 2, 8));
    let mut sched = Scheduler::new(SchedulerPolicy::MaxUtilization, 8);
    let mut cache = CacheManager::new(4, 2).unwrap();
    sched.enqueue(1);

    let mut paused = false;
    for _ in 0..12 {
        let outputs = sched.schedule(&mut requests, &mut cache);
        if outputs.paused.contains(&1) {
            paused = true;
            break;
        }
        apply_iteration(&mut requests, &outputs.context_requests, &outputs.generation_requests);
    }

    assert!(paused);
    assert!(requests[&1].output_len() > 0);
    assert_eq!(requests[&1].phase(), RequestPhase::Paused);
    assert_eq!(cache.num_free_blocks(), 4);
}

#[test]
fn test_fifo_completion_order() {
    // Pool admits one request at a time; B must wait for A to finish.
    let mut sched = Scheduler::new(SchedulerPolicy::GuaranteedNoEvict, 8);
    let mut cache = CacheManager::new(8, 2).unwrap();
    let mut requests = HashMap::new();

    // Worst case 5 blocks each; 10 > 8 so they cannot overlap.
    for id in [1, 2] {
        requests.insert(id, request(id, 2, 8));
        sched.enqueue(id);
    }

    let outputs = sched.schedule(&mut requests, &mut cache);
    assert_eq!(outputs.admitted, vec![1]);
    apply_iteration(&mut requests, &outputs.context_requests, &outputs.generation_requests);

    // Drive A to completion; B stays queued the whole time.
    while requests[&1].output_len() < 8 {
        let outputs = sched.schedule(&mut requests, &mut cache);
        assert_eq!(outputs.generation_requests, vec![1]);
        assert!(outputs.admitted.is_empty());
        apply_iteration(&mut requests, &outputs.context_requests, &outputs.generation_requests);
    }

    // A finishes, its state is torn down, and only then is B admitted.
    cache.free(1);
    sched.remove(1);
    requests.remove(&1);

    let outputs = sched.schedule(&mut requests, &mut cache);
    assert_eq!(outputs.admitted, vec![2]);
}

#[test]
fn test_resume_recomputes_full_prefix() {
    let mut sched = Scheduler::new(SchedulerPolicy::MaxUtilization, 8);
    let mut cache = CacheManager::new(4, 2).unwrap();
    let mut requests = HashMap::new();

    requests.insert(1, request(1, 2, 8));
    sched.enqueue(1);

    // Run until the pool forces a pause.
    loop {
        let outputs = sched.schedule(&mut requests, &mut cache);
        if outputs.paused.contains(&1) {
            break;
        }
        apply_iteration(&mut requests, &outputs.context_requests, &outputs.generation_requests);
    }
    let generated_before_pause = requests[&1].output_len();
    assert!(generated_before_pause > 0);
    assert_eq!(cache.num_free_blocks(), 4);

    // The resumed context pass covers prompt plus everything generated so
    // far; no output is lost across the pause.
    let outputs = sched.schedule(&mut requests, &mut cache);
    assert_eq!(outputs.admitted, vec![1]);
    assert_eq!(outputs.context_requests, vec![1]);
    assert_eq!(requests[&1].output_len(), generated_before_pause);
    assert_eq!(cache.beam_len(1, 0), 2 + generated_before_pause);
    assert_eq!(requests[&1].pause_count(), 1);
}

#[test]
fn test_batch_size_bound_respected() {
    let mut sched = Scheduler::new(SchedulerPolicy::GuaranteedNoEvict, 2);
    let mut cache = CacheManager::new(64, 2).unwrap();
    let mut requests = HashMap::new();

    for id in 1..=4u64 {
        requests.insert(id, request(id, 2, 2));
        sched.enqueue(id);
    }

    let outputs = sched.schedule(&mut requests, &mut cache);
    assert_eq!(outputs.admitted, vec![1, 2]);
    assert_eq!(sched.num_active(), 2);
    assert_eq!(sched.num_pending(), 2);
    assert_eq!(sched.intake_capacity(), 0);
}

#[test]
fn test_failed_request_is_torn_down() {
    // An active request whose cache state disappeared mid-flight is failed
    // and removed from the batch instead of wedging the loop.
    let mut sched = Scheduler::new(SchedulerPolicy::GuaranteedNoEvict, 8);
    let mut cache = CacheManager::new(8, 2).unwrap();
    let mut requests = HashMap::new();

    requests.insert(1, request(1, 2, 2));
    sched.enqueue(1);
    let outputs = sched.schedule(&mut requests, &mut cache);
    assert_eq!(outputs.admitted, vec![1]);

    // Simulate an external teardown that left the scheduler stale.
    cache.free(1);
    apply_iteration(&mut requests, &outputs.context_requests, &[]);

    let outputs = sched.schedule(&mut requests, &mut cache);
    assert_eq!(outputs.failed.len(), 1);
    assert_eq!(outputs.failed[0].0, 1);
    assert_eq!(sched.num_active(), 0);
}
