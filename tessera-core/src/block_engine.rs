use indexmap::IndexMap;

use crate::error::{Error, Result};

pub type BlockId = u32;
pub type SeqId = usize;

/// Free-list allocator over the fixed physical block pool.
///
/// Blocks are exclusively owned: a block id is either on the free list or in
/// exactly one sequence's table. That exclusivity is what makes per-step slot
/// sets disjoint without any locking.
struct BlockAllocator {
    free_blocks: Vec<BlockId>,
}

impl BlockAllocator {
    fn new(num_blocks: usize) -> Self {
        // Popped from the back, so allocation proceeds from block 0 upward.
        let free_blocks = (0..num_blocks as BlockId).rev().collect();
        Self { free_blocks }
    }

    fn num_free(&self) -> usize {
        self.free_blocks.len()
    }

    fn allocate(&mut self) -> Option<BlockId> {
        self.free_blocks.pop()
    }

    fn free(&mut self, block: BlockId) {
        self.free_blocks.push(block);
    }
}

/// Per-sequence mapping from logical token position to physical storage.
///
/// Owns no memory, only block ids into the shared pool. Append-only while the
/// sequence lives; the whole table is released on sequence destruction.
#[derive(Debug, Clone)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
    block_size: usize,
}

impl BlockTable {
    fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            block_size,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Token positions this table can address.
    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.block_size
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Map a logical position to its physical (block id, in-block offset).
    pub fn physical_slot(&self, logical_position: usize) -> Result<(BlockId, usize)> {
        if logical_position >= self.capacity() {
            return Err(Error::OutOfRange {
                position: logical_position,
                capacity: self.capacity(),
            });
        }
        let block_id = self.blocks[logical_position / self.block_size];
        Ok((block_id, logical_position % self.block_size))
    }

    /// Flat slot index `block_id * block_size + offset` for a position.
    pub fn slot(&self, logical_position: usize) -> Result<usize> {
        let (block_id, offset) = self.physical_slot(logical_position)?;
        Ok(block_id as usize * self.block_size + offset)
    }
}

/// Maps each in-flight sequence to its physical block table and owns the
/// free-list of unassigned blocks. Table growth happens here, before slot
/// indexing — never during it.
pub struct BlockEngine {
    block_size: usize,
    allocator: BlockAllocator,
    block_tables: IndexMap<SeqId, BlockTable>,
}

impl BlockEngine {
    pub fn new(block_size: usize, num_blocks: usize) -> Self {
        Self {
            block_size,
            allocator: BlockAllocator::new(num_blocks),
            block_tables: IndexMap::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_blocks(&self) -> usize {
        self.allocator.num_free()
    }

    pub fn can_allocate(&self, num_tokens: usize) -> bool {
        num_tokens.div_ceil(self.block_size) <= self.allocator.num_free()
    }

    pub fn block_table(&self, seq_id: SeqId) -> Option<&BlockTable> {
        self.block_tables.get(&seq_id)
    }

    /// Admit a sequence with capacity for `num_tokens` positions.
    pub fn allocate(&mut self, seq_id: SeqId, num_tokens: usize) -> Result<()> {
        assert!(
            !self.block_tables.contains_key(&seq_id),
            "sequence {seq_id} already has a block table"
        );
        let mut table = BlockTable::new(self.block_size);
        self.grow_table(&mut table, num_tokens)?;
        self.block_tables.insert(seq_id, table);
        Ok(())
    }

    /// Grow a sequence's table to cover `num_tokens` positions. The operation
    /// either fully succeeds or leaves the table unchanged; a short pool
    /// surfaces as `AllocationExhausted` for the scheduler to act on.
    pub fn grow_to(&mut self, seq_id: SeqId, num_tokens: usize) -> Result<()> {
        let Some(mut table) = self.block_tables.shift_remove(&seq_id) else {
            return Err(Error::OutOfRange {
                position: num_tokens,
                capacity: 0,
            });
        };
        let res = self.grow_table(&mut table, num_tokens);
        self.block_tables.insert(seq_id, table);
        res
    }

    fn grow_table(&mut self, table: &mut BlockTable, num_tokens: usize) -> Result<()> {
        let needed = num_tokens
            .div_ceil(self.block_size)
            .saturating_sub(table.num_blocks());
        if needed > self.allocator.num_free() {
            return Err(Error::AllocationExhausted {
                requested: needed,
                available: self.allocator.num_free(),
            });
        }
        for _ in 0..needed {
            // Checked above; the free list cannot run dry mid-loop.
            let block = self.allocator.allocate().unwrap();
            table.blocks.push(block);
        }
        Ok(())
    }

    /// Release a finished or evicted sequence's blocks back to the pool.
    pub fn free_sequence(&mut self, seq_id: SeqId) {
        if let Some(table) = self.block_tables.shift_remove(&seq_id) {
            for block in table.blocks {
                self.allocator.free(block);
            }
        }
    }
}
