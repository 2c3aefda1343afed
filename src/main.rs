//! Demo driver: runs the batching loop end-to-end against a mock compute
//! step, so the scheduler and cache manager can be observed without a GPU.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use inflight::{
    BatchManager, BatchManagerConfig, BeamOutput, ComputeBatch, ComputeStep, GenerationParams,
    NewRequest, RequestPhase, Response, ResponseSink, Result, SchedulerPolicy, StatsSink,
    StepOutput,
};

#[derive(Parser, Debug)]
#[command(name = "inflight")]
#[command(about = "In-flight batching manager demo")]
struct Args {
    /// Number of synthetic requests to enqueue
    #[arg(short, long, default_value = "16")]
    num_requests: usize,

    /// Prompt length per request (tokens)
    #[arg(long, default_value = "32")]
    prompt_len: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "64")]
    max_new_tokens: usize,

    /// Beam width per request
    #[arg(long, default_value = "1")]
    beam_width: usize,

    /// Total KV cache blocks
    #[arg(long, default_value = "256")]
    num_blocks: usize,

    /// Tokens per block (power of two)
    #[arg(long, default_value = "16")]
    block_size: usize,

    /// Scheduling policy: max-utilization or guaranteed-no-evict
    #[arg(long, default_value = "guaranteed-no-evict")]
    policy: String,

    /// RNG seed for the mock decoder
    #[arg(long, default_value = "42")]
    seed: u64,
}

/// Mock decoder: samples random tokens, occasionally the stop token.
struct MockDecoder {
    rng: StdRng,
    stop_token: u32,
    stop_probability: f64,
}

impl ComputeStep for MockDecoder {
    fn execute(&mut self, batch: &ComputeBatch) -> Result<Vec<StepOutput>> {
        let mut outputs = Vec::with_capacity(batch.entries.len());
        for entry in &batch.entries {
            let beams = (0..entry.beam_tokens.len())
                .map(|beam| BeamOutput {
                    source_beam: if entry.phase == RequestPhase::Context {
                        0
                    } else {
                        beam
                    },
                    token_id: if self.rng.gen_bool(self.stop_probability) {
                        self.stop_token
                    } else {
                        self.rng.gen_range(1..32_000)
                    },
                })
                .collect();
            outputs.push(StepOutput {
                request_id: entry.request_id,
                beams,
            });
        }
        Ok(outputs)
    }
}

/// Response sink shared between the manager and the driver.
struct SharedSink(Rc<RefCell<Vec<Response>>>);

impl ResponseSink for SharedSink {
    fn deliver(&mut self, response: Response) {
        self.0.borrow_mut().push(response);
    }
}

/// Stats sink that forwards snapshots to the log.
struct LogStats;

impl StatsSink for LogStats {
    fn record(&mut self, snapshot: &str) {
        debug!(target: "inflight::stats", "{snapshot}");
    }
}

fn run(args: &Args) -> Result<()> {
    let policy = match args.policy.as_str() {
        "max-utilization" => SchedulerPolicy::MaxUtilization,
        "guaranteed-no-evict" => SchedulerPolicy::GuaranteedNoEvict,
        other => {
            return Err(inflight::Error::Config(format!(
                "unknown policy: {other}"
            )))
        }
    };

    let config = BatchManagerConfig {
        max_num_requests: 64,
        max_beam_width: args.beam_width.max(1),
        block_size: args.block_size,
        num_blocks: args.num_blocks,
        policy,
    };

    let stop_token = 0u32;
    let intake: VecDeque<NewRequest> = (0..args.num_requests as u64)
        .map(|request_id| NewRequest {
            request_id: request_id + 1,
            prompt_token_ids: vec![1; args.prompt_len.max(1)],
            params: GenerationParams {
                max_new_tokens: args.max_new_tokens,
                beam_width: args.beam_width.max(1),
                streaming: false,
                stop_tokens: vec![stop_token],
            },
        })
        .collect();

    let responses = Rc::new(RefCell::new(Vec::new()));
    let decoder = MockDecoder {
        rng: StdRng::seed_from_u64(args.seed),
        stop_token,
        stop_probability: 0.02,
    };

    let mut manager = BatchManager::new(
        config,
        Box::new(intake),
        Box::new(SharedSink(Rc::clone(&responses))),
        Box::new(HashSet::new()),
        Box::new(decoder),
    )?
    .with_stats_sink(Box::new(LogStats));

    manager.drain()?;

    let responses = responses.borrow();
    let completed = responses.iter().filter(|r| r.is_final && r.error.is_none()).count();
    let failed = responses.iter().filter(|r| r.error.is_some()).count();
    let total_tokens: usize = responses
        .iter()
        .filter(|r| r.is_final)
        .map(|r| r.beam_outputs.iter().map(Vec::len).sum::<usize>())
        .sum();

    println!("inflight v{}", env!("CARGO_PKG_VERSION"));
    println!("policy: {}", policy.as_str());
    println!("iterations: {}", manager.iteration());
    println!("completed: {completed} / {}", args.num_requests);
    println!("failed: {failed}");
    println!("generated tokens: {total_tokens}");
    println!("free blocks: {} / {}", manager.cache().num_free_blocks(), args.num_blocks);

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
