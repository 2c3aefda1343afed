//! Cache manager: per-request, per-beam block accounting.
//!
//! Translates token-length growth into block allocations against the
//! [`BlockPool`], answers admission-feasibility queries for the scheduler,
//! and implements copy-on-write block sharing for beam search: branching a
//! beam only bumps reference counts, and divergence is detected at the first
//! append into a shared, partially filled block.
//!
//! The manager does not touch cache payloads. When divergence forces a
//! block copy, it emits a [`CopyBlockOp`] that the compute step must mirror
//! in device memory before the next attention pass.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::config::SchedulerPolicy;
use crate::core::block::{blocks_for_tokens, BlockTable};
use crate::core::block_pool::BlockPool;
use crate::core::request::{Request, RequestId};
use crate::error::{Error, Result};

/// A pending device-side block copy caused by beam divergence.
///
/// The first `num_tokens` slots of `src_block` must be copied into
/// `dst_block` before the next compute step reads the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyBlockOp {
    /// Block holding the shared prefix.
    pub src_block: usize,
    /// Freshly allocated private block.
    pub dst_block: usize,
    /// Number of token slots to copy.
    pub num_tokens: usize,
}

/// Cache state of a single beam: its block table and committed length.
///
/// Invariant: `table.num_blocks() == ceil(len / block_size)`, no gaps.
#[derive(Debug, Clone)]
struct BeamCacheState {
    table: BlockTable,
    len: usize,
}

impl BeamCacheState {
    fn new(block_size: usize) -> Self {
        Self {
            table: BlockTable::new(block_size),
            len: 0,
        }
    }
}

/// Allocates and frees KV cache blocks on behalf of requests.
///
/// # Example
///
/// ```
/// use inflight::core::cache_manager::CacheManager;
/// use inflight::core::request::{GenerationParams, Request};
///
/// let mut cache = CacheManager::new(64, 16).unwrap();
/// let req = Request::new(1, vec![1, 2, 3], GenerationParams::default());
///
/// cache.add_request(&req).unwrap();
/// cache.grow_beam(1, 0, 3).unwrap();
/// assert_eq!(cache.num_blocks_held(1), 1);
///
/// cache.free(1);
/// assert_eq!(cache.num_blocks_held(1), 0);
/// ```
#[derive(Debug)]
pub struct CacheManager {
    /// The block pool, owned here and mutated only by the iteration loop.
    pool: BlockPool,
    /// Per-request, per-beam cache state.
    states: HashMap<RequestId, Vec<BeamCacheState>>,
    /// Worst-case block reservations for requests admitted under
    /// GuaranteedNoEvict.
    reservations: HashMap<RequestId, usize>,
    /// Sum of all outstanding reservations.
    reserved_total: usize,
}

impl CacheManager {
    /// Create a cache manager over a fresh pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `block_size` is not a power of two.
    pub fn new(num_blocks: usize, block_size: usize) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "block_size must be a power of two, got {block_size}"
            )));
        }
        Ok(Self {
            pool: BlockPool::new(num_blocks, block_size),
            states: HashMap::new(),
            reservations: HashMap::new(),
            reserved_total: 0,
        })
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    /// Get the number of free blocks in the pool.
    pub fn num_free_blocks(&self) -> usize {
        self.pool.num_free_blocks()
    }

    /// Get the total number of blocks in the pool.
    pub fn num_total_blocks(&self) -> usize {
        self.pool.num_blocks()
    }

    /// Worst-case block need of a request: declared maximum length at the
    /// declared beam width, with no sharing assumed.
    pub fn worst_case_blocks(&self, request: &Request) -> usize {
        let max_len = request.prompt_len() + request.params().max_new_tokens;
        request.beam_width() * blocks_for_tokens(max_len, self.block_size())
    }

    /// Blocks the request's immediate next step needs: its full current
    /// context (prompt plus any output generated before a pause).
    pub fn next_step_blocks(&self, request: &Request) -> usize {
        blocks_for_tokens(request.context_len(), self.block_size())
    }

    /// Admission feasibility query.
    ///
    /// Under `GuaranteedNoEvict`, true only if the request's worst-case
    /// block need fits alongside every outstanding reservation, so that an
    /// admitted request can always run to its declared maximum without
    /// evicting anyone. Under `MaxUtilization`, true if the immediate next
    /// step (the full current context) fits in the free list; later growth
    /// may still fail and trigger a pause.
    pub fn can_allocate(&self, request: &Request, policy: SchedulerPolicy) -> bool {
        match policy {
            SchedulerPolicy::GuaranteedNoEvict => {
                self.reserved_total + self.worst_case_blocks(request) <= self.pool.num_blocks()
            }
            SchedulerPolicy::MaxUtilization => self.can_allocate_with_margin(request, 0),
        }
    }

    /// MaxUtilization feasibility with `pending_blocks` already promised to
    /// other requests this iteration but not yet committed.
    pub fn can_allocate_with_margin(&self, request: &Request, pending_blocks: usize) -> bool {
        self.pool
            .can_allocate(pending_blocks + self.next_step_blocks(request))
    }

    /// Register cache state for a newly admitted request.
    ///
    /// Every beam starts empty; the context phase grows beam 0 and beams
    /// fork from it at the first generation step. Under `GuaranteedNoEvict`
    /// the request's worst-case need is reserved here and held until
    /// [`free`](Self::free).
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRequestId`] if the request already holds
    /// cache state.
    pub fn add_request(&mut self, request: &Request) -> Result<()> {
        self.add_request_with_policy(request, SchedulerPolicy::MaxUtilization)
    }

    /// [`add_request`](Self::add_request) with an explicit policy.
    pub fn add_request_with_policy(
        &mut self,
        request: &Request,
        policy: SchedulerPolicy,
    ) -> Result<()> {
        let request_id = request.request_id();
        if self.states.contains_key(&request_id) {
            return Err(Error::DuplicateRequestId(request_id));
        }

        let block_size = self.block_size();
        self.states.insert(
            request_id,
            (0..request.beam_width())
                .map(|_| BeamCacheState::new(block_size))
                .collect(),
        );

        if policy == SchedulerPolicy::GuaranteedNoEvict {
            let worst_case = self.worst_case_blocks(request);
            self.reservations.insert(request_id, worst_case);
            self.reserved_total += worst_case;
            debug!(request_id, worst_case, "reserved worst-case blocks");
        }

        Ok(())
    }

    /// Allocate capacity for `new_tokens` additional positions on one beam.
    ///
    /// Rounds up to block boundaries and performs copy-on-divergence when
    /// the beam's tail block is shared with another beam.
    ///
    /// # Returns
    ///
    /// The device-side copy operations the caller must forward to the
    /// compute step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if the pool cannot satisfy the growth;
    /// the scheduler must then pause the request (MaxUtilization) or treat
    /// it as an accounting bug (GuaranteedNoEvict). Returns
    /// [`Error::RequestNotFound`] / [`Error::BeamIndexOutOfBounds`] for
    /// unknown targets.
    pub fn grow_beam(
        &mut self,
        request_id: RequestId,
        beam: usize,
        new_tokens: usize,
    ) -> Result<Vec<CopyBlockOp>> {
        let block_size = self.pool.block_size();
        let beams = self
            .states
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        let beam_width = beams.len();
        let state = beams.get_mut(beam).ok_or(Error::BeamIndexOutOfBounds {
            request_id,
            beam,
            beam_width,
        })?;

        let mut copies = Vec::new();

        for _ in 0..new_tokens {
            let slot = state.len % block_size;

            if slot == 0 {
                // Block boundary: always a fresh private block.
                let block_id = self.pool.allocate()?;
                state.table.append_block(block_id);
                if let Some(block) = self.pool.get_block_mut(block_id) {
                    block.fill(1);
                }
            } else {
                let last = state.table.get_block_id(state.table.num_blocks() - 1)?;
                let shared = self.pool.get_block(last).is_some_and(|b| b.is_shared());

                if shared {
                    // Copy-on-divergence: never append into a shared block.
                    let dst = self.pool.allocate()?;
                    if let Some(block) = self.pool.get_block_mut(dst) {
                        block.set_occupancy(slot);
                        block.fill(1);
                    }
                    state.table.replace_last_block(dst);
                    self.pool.release(last);
                    copies.push(CopyBlockOp {
                        src_block: last,
                        dst_block: dst,
                        num_tokens: slot,
                    });
                    trace!(request_id, beam, src = last, dst, "beam diverged, copying block");
                } else if let Some(block) = self.pool.get_block_mut(last) {
                    block.fill(1);
                }
            }

            state.len += 1;
        }

        Ok(copies)
    }

    /// Share `source_beam`'s cache state into `dest_beam`.
    ///
    /// Increments the reference count on every block of the source beam; no
    /// payload is copied. Any blocks previously held by the destination
    /// beam are released first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] / [`Error::BeamIndexOutOfBounds`]
    /// for unknown targets.
    pub fn branch_beam(
        &mut self,
        request_id: RequestId,
        source_beam: usize,
        dest_beam: usize,
    ) -> Result<()> {
        if source_beam == dest_beam {
            return Ok(());
        }
        self.reassign_beams_internal(request_id, |beam, beams| {
            if beam == dest_beam {
                source_beam
            } else {
                let _ = beams;
                beam
            }
        })
    }

    /// Reassign every beam's cache state according to a resampling decision.
    ///
    /// `sources[i]` names the beam whose cache state beam `i` continues
    /// from. Snapshot semantics: all source states are captured before any
    /// destination is released, so permutations (including swaps) are safe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] for an unknown request or
    /// [`Error::BeamIndexOutOfBounds`] if `sources` has the wrong length or
    /// names an invalid beam.
    pub fn resample_beams(&mut self, request_id: RequestId, sources: &[usize]) -> Result<()> {
        let beam_width = self
            .states
            .get(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?
            .len();
        if sources.len() != beam_width || sources.iter().any(|&s| s >= beam_width) {
            let bad = sources.iter().copied().find(|&s| s >= beam_width);
            return Err(Error::BeamIndexOutOfBounds {
                request_id,
                beam: bad.unwrap_or(sources.len()),
                beam_width,
            });
        }
        self.reassign_beams_internal(request_id, |beam, _| sources[beam])
    }

    fn reassign_beams_internal<F>(&mut self, request_id: RequestId, source_of: F) -> Result<()>
    where
        F: Fn(usize, &[BeamCacheState]) -> usize,
    {
        let beams = self
            .states
            .get(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        let beam_width = beams.len();

        // Snapshot the new states first, bumping refcounts on every block
        // they reference, then release the old states.
        let mut new_beams = Vec::with_capacity(beam_width);
        for beam in 0..beam_width {
            let src = source_of(beam, beams);
            if src >= beam_width {
                return Err(Error::BeamIndexOutOfBounds {
                    request_id,
                    beam: src,
                    beam_width,
                });
            }
            new_beams.push(beams[src].clone());
        }

        let old_block_ids: Vec<usize> = beams
            .iter()
            .flat_map(|b| b.table.get_physical_block_ids().iter().copied())
            .collect();

        for state in &new_beams {
            for &block_id in state.table.get_physical_block_ids() {
                self.pool.retain(block_id);
            }
        }
        self.pool.release_many(&old_block_ids);

        if let Some(beams) = self.states.get_mut(&request_id) {
            *beams = new_beams;
        }
        Ok(())
    }

    /// Release all blocks held by all beams of a request, and drop its
    /// reservation. Idempotent: freeing an unknown request is a no-op.
    pub fn free(&mut self, request_id: RequestId) {
        if let Some(beams) = self.states.remove(&request_id) {
            for state in beams {
                for &block_id in state.table.get_physical_block_ids() {
                    self.pool.release(block_id);
                }
            }
            debug!(request_id, free = self.pool.num_free_blocks(), "released cache state");
        }
        if let Some(reserved) = self.reservations.remove(&request_id) {
            self.reserved_total -= reserved;
        }
    }

    /// Get one beam's block table, for building the compute batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] / [`Error::BeamIndexOutOfBounds`]
    /// for unknown targets.
    pub fn block_table(&self, request_id: RequestId, beam: usize) -> Result<&BlockTable> {
        let beams = self
            .states
            .get(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        let beam_width = beams.len();
        beams
            .get(beam)
            .map(|s| &s.table)
            .ok_or(Error::BeamIndexOutOfBounds {
                request_id,
                beam,
                beam_width,
            })
    }

    /// Committed cache length of one beam (positions written).
    pub fn beam_len(&self, request_id: RequestId, beam: usize) -> usize {
        self.states
            .get(&request_id)
            .and_then(|beams| beams.get(beam))
            .map_or(0, |s| s.len)
    }

    /// Number of unique blocks held by a request across all beams
    /// (shared blocks counted once).
    pub fn num_blocks_held(&self, request_id: RequestId) -> usize {
        self.states.get(&request_id).map_or(0, |beams| {
            beams
                .iter()
                .flat_map(|b| b.table.get_physical_block_ids().iter().copied())
                .collect::<HashSet<usize>>()
                .len()
        })
    }

    /// Reference count of a block, for tests and diagnostics.
    pub fn block_ref_count(&self, block_id: usize) -> Option<usize> {
        self.pool.get_block(block_id).map(|b| b.ref_count())
    }

    /// Check the pool accounting invariant:
    /// unique used blocks + free blocks == total blocks.
    pub fn accounting_is_consistent(&self) -> bool {
        self.pool.accounting_is_consistent()
    }
}
