//! Block abstractions for the paged KV cache.
//!
//! The KV cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. Blocks are the unit of
//! allocation in the [`BlockPool`](super::block_pool::BlockPool), and a
//! [`BlockTable`] maps a sequence's logical token positions onto them.

use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// A fixed-size chunk of KV cache memory.
///
/// Each block stores KV states for up to `block_size` tokens of one
/// sequence-beam (logically one block set per attention layer; the layer
/// dimension is the compute step's concern).
///
/// A block with `ref_count > 1` is logically shared between beams. Shared
/// blocks are never mutated in place: a beam that needs to append past the
/// shared portion allocates a fresh block and copies forward
/// (copy-on-divergence).
#[derive(Debug, Clone)]
pub struct Block {
    /// Index of this block in the pool.
    block_id: usize,
    /// Number of tokens this block can hold.
    block_size: usize,
    /// Number of beams/sequences currently referencing this block.
    ref_count: usize,
    /// Tokens written so far (<= block_size).
    occupancy: usize,
}

impl Block {
    /// Create a new block with the given ID.
    pub fn new(block_id: usize, block_size: usize) -> Self {
        Self {
            block_id,
            block_size,
            ref_count: 1,
            occupancy: 0,
        }
    }

    /// Get the block ID.
    pub fn block_id(&self) -> usize {
        self.block_id
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Get the number of tokens written so far.
    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    /// Check if the block is completely filled.
    pub fn is_full(&self) -> bool {
        self.occupancy >= self.block_size
    }

    /// Check if the block is shared between beams.
    pub fn is_shared(&self) -> bool {
        self.ref_count > 1
    }

    /// Record `num_tokens` additional tokens written to this block.
    ///
    /// Occupancy saturates at the block capacity.
    pub fn fill(&mut self, num_tokens: usize) {
        self.occupancy = (self.occupancy + num_tokens).min(self.block_size);
    }

    /// Set the occupancy directly (used when copying a shared prefix forward).
    pub fn set_occupancy(&mut self, occupancy: usize) {
        self.occupancy = occupancy.min(self.block_size);
    }

    /// Increment reference count (when sharing with another beam).
    pub fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Decrement reference count.
    ///
    /// # Returns
    ///
    /// The new reference count after decrementing.
    pub fn decrement_ref(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}

/// Maps a beam's logical positions to physical block IDs.
///
/// Think of this like a page table in virtual memory:
/// - Logical block index: position in the sequence (0, 1, 2, ...)
/// - Physical block ID: actual block in the pool
///
/// Token at position `p` is stored in:
/// - Logical block: `p / block_size`
/// - Slot within block: `p % block_size`
/// - Physical block: `block_ids[p / block_size]`
///
/// # Example
///
/// ```
/// use inflight::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
///
/// // Token 20 -> logical block 1 -> physical block 12
/// assert_eq!(table.get_block_id(1).unwrap(), 12);
/// ```
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<usize>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockIndexOutOfBounds`] if the logical block index
    /// is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<usize> {
        self.block_ids
            .get(logical_block_idx)
            .copied()
            .ok_or_else(|| Error::BlockIndexOutOfBounds {
                logical_idx: logical_block_idx,
                num_blocks: self.block_ids.len(),
            })
    }

    /// Add a new physical block to the table.
    ///
    /// Called when the beam grows and needs more capacity.
    pub fn append_block(&mut self, block_id: usize) {
        self.block_ids.push(block_id);
    }

    /// Replace the last physical block (copy-on-divergence).
    ///
    /// # Returns
    ///
    /// The replaced block ID, or `None` if the table is empty.
    pub fn replace_last_block(&mut self, block_id: usize) -> Option<usize> {
        let last = self.block_ids.last_mut()?;
        Some(std::mem::replace(last, block_id))
    }

    /// Number of blocks allocated to this beam.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Get all physical block IDs for this beam.
    pub fn get_physical_block_ids(&self) -> &[usize] {
        &self.block_ids
    }

    /// Get physical slot indices for all tokens in the sequence.
    ///
    /// Returns a list where `slot_mapping[i]` is the global slot index for
    /// token `i`, computed as `block_id * block_size + slot_within_block`.
    /// Used by the compute step to address KV writes.
    pub fn get_slot_mapping(&self, seq_len: usize) -> Vec<usize> {
        let mut slots = Vec::with_capacity(seq_len);

        for pos in 0..seq_len {
            let logical_block = pos / self.block_size;
            let slot_in_block = pos % self.block_size;

            if let Some(&physical_block) = self.block_ids.get(logical_block) {
                slots.push(physical_block * self.block_size + slot_in_block);
            }
        }

        slots
    }

    /// Clear all blocks from the table.
    pub fn clear(&mut self) {
        self.block_ids.clear();
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// Growth always rounds up to block boundaries; a sequence of length 0
/// holds zero blocks.
///
/// # Example
///
/// ```
/// use inflight::core::block::blocks_for_tokens;
///
/// assert_eq!(blocks_for_tokens(35, 16), 3);
/// assert_eq!(blocks_for_tokens(32, 16), 2);
/// assert_eq!(blocks_for_tokens(0, 16), 0);
/// ```
pub fn blocks_for_tokens(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
