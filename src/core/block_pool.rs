//! Fixed-size block pool for the paged KV cache.
//!
//! The pool owns every cache block in the process and hands out reference
//! counted indices. All other components hold block IDs, never blocks, so
//! ownership stays acyclic: the pool is the sole owner, everything else is a
//! counted borrow.
//!
//! All calls must be serialized with the iteration loop (single-writer
//! discipline); the pool itself performs no locking.
//!
//! ## Example
//!
//! ```
//! use inflight::core::block_pool::BlockPool;
//!
//! let mut pool = BlockPool::new(1024, 16);
//!
//! let block_id = pool.allocate().unwrap();
//! assert_eq!(pool.num_free_blocks(), 1023);
//!
//! pool.release(block_id);
//! assert_eq!(pool.num_free_blocks(), 1024);
//! ```

use std::collections::{HashMap, VecDeque};

use crate::core::block::{Block, DEFAULT_BLOCK_SIZE};
use crate::error::{Error, Result};

/// Process-wide pool of KV cache blocks.
///
/// Maintains a free list for O(1) allocation/release and reference counts
/// for blocks shared between beams.
#[derive(Debug)]
pub struct BlockPool {
    /// Live (allocated) blocks indexed by block_id.
    blocks: HashMap<usize, Block>,
    /// Free block IDs (LIFO for cache locality).
    free_list: VecDeque<usize>,
    /// Number of tokens per block.
    block_size: usize,
    /// Total number of blocks, fixed at startup.
    num_blocks: usize,
}

impl BlockPool {
    /// Create a new pool with the specified capacity.
    ///
    /// # Arguments
    ///
    /// * `num_blocks` - Total number of blocks to manage
    /// * `block_size` - Number of tokens per block
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        let free_list: VecDeque<usize> = (0..num_blocks).collect();

        Self {
            blocks: HashMap::with_capacity(num_blocks),
            free_list,
            block_size,
            num_blocks,
        }
    }

    /// Create a new pool with the default block size.
    pub fn with_default_block_size(num_blocks: usize) -> Self {
        Self::new(num_blocks, DEFAULT_BLOCK_SIZE)
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Get the number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Get the number of used blocks (unique, shared blocks counted once).
    pub fn num_used_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Check if a specific number of blocks can be allocated.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    /// Allocate a single block.
    ///
    /// The new block starts with a reference count of 1 and zero occupancy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if no free blocks are available.
    pub fn allocate(&mut self) -> Result<usize> {
        let block_id = self.free_list.pop_front().ok_or(Error::OutOfBlocks)?;

        self.blocks.insert(block_id, Block::new(block_id, self.block_size));

        Ok(block_id)
    }

    /// Increment the reference count of a block (sharing with another beam).
    ///
    /// # Returns
    ///
    /// The new reference count, or `None` if the block is not allocated.
    pub fn retain(&mut self, block_id: usize) -> Option<usize> {
        self.blocks.get_mut(&block_id).map(|block| {
            block.increment_ref();
            block.ref_count()
        })
    }

    /// Release one reference to a block.
    ///
    /// The block returns to the free list when its reference count reaches
    /// zero. Releasing an unknown block ID is a no-op.
    ///
    /// # Returns
    ///
    /// `true` if the block was returned to the free list.
    pub fn release(&mut self, block_id: usize) -> bool {
        if let Some(block) = self.blocks.get_mut(&block_id) {
            if block.decrement_ref() == 0 {
                self.blocks.remove(&block_id);
                self.free_list.push_back(block_id);
                return true;
            }
        }
        false
    }

    /// Release one reference to each of the given blocks.
    ///
    /// # Returns
    ///
    /// Number of blocks actually freed (those whose ref count reached zero).
    pub fn release_many(&mut self, block_ids: &[usize]) -> usize {
        block_ids.iter().filter(|&&id| self.release(id)).count()
    }

    /// Get a reference to an allocated block.
    pub fn get_block(&self, block_id: usize) -> Option<&Block> {
        self.blocks.get(&block_id)
    }

    /// Get a mutable reference to an allocated block.
    pub fn get_block_mut(&mut self, block_id: usize) -> Option<&mut Block> {
        self.blocks.get_mut(&block_id)
    }

    /// Check the pool accounting invariant:
    /// used blocks (unique) + free blocks == total blocks.
    pub fn accounting_is_consistent(&self) -> bool {
        self.blocks.len() + self.free_list.len() == self.num_blocks
    }

    /// Reset the pool to its initial state.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.free_list.clear();
        self.free_list.extend(0..self.num_blocks);
    }
}
