use candle_core::{DType, Device, Tensor};

use crate::block_engine::{BlockEngine, BlockId};
use crate::error::{Error, Result};
use crate::rotary::RotaryCoordinateCache;
use crate::sequence::ScheduledSequence;
use crate::slot_indexer::{cumulative_seqlens, slot_mapping};
use tessera_paged_attn::cos_sin_for_positions;

/// Everything the attention layers need for one forward step, derived once
/// when the batch is scheduled and immutable from then on.
///
/// Built through [`StepContextBuilder`], which validates the batch and
/// precomputes the slot mapping, cumulative lengths, and position ids. The
/// per-step rotary cache is the only interior-mutable part; it is scoped to
/// this context and cannot survive it.
#[derive(Debug)]
pub struct StepContext {
    sequences: Vec<ScheduledSequence>,
    block_tables: Vec<Vec<BlockId>>,
    block_size: usize,
    slot_mapping: Vec<usize>,
    cu_seqlens: Vec<u32>,
    position_ids: Vec<usize>,
    max_q_len: usize,
    max_kv_len: usize,
    is_decoding: bool,
    rotary: RotaryCoordinateCache,
}

impl StepContext {
    pub fn sequences(&self) -> &[ScheduledSequence] {
        &self.sequences
    }

    pub fn block_tables(&self) -> &[Vec<BlockId>] {
        &self.block_tables
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Physical destination slot for each new token, in batch order.
    pub fn slot_mapping(&self) -> &[usize] {
        &self.slot_mapping
    }

    /// `batch + 1` prefix sums delimiting each sequence's rows.
    pub fn cu_seqlens(&self) -> &[u32] {
        &self.cu_seqlens
    }

    /// Absolute position of each new token, in batch order.
    pub fn position_ids(&self) -> &[usize] {
        &self.position_ids
    }

    pub fn max_q_len(&self) -> usize {
        self.max_q_len
    }

    pub fn max_kv_len(&self) -> usize {
        self.max_kv_len
    }

    /// True when every sequence contributes exactly one token on top of
    /// existing history, i.e. the whole batch takes the decode path.
    pub fn is_decoding(&self) -> bool {
        self.is_decoding
    }

    pub fn total_new_tokens(&self) -> usize {
        *self.cu_seqlens.last().unwrap_or(&0) as usize
    }

    /// Rotary (cos, sin) for this step's positions, computed by the first
    /// layer that asks and reused by every later one.
    pub fn rotary_coordinates(
        &self,
        rotary_dim: usize,
        base: f32,
        dtype: DType,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        self.rotary.get_or_compute(&self.position_ids, |ids| {
            cos_sin_for_positions(ids, rotary_dim, base, dtype, device)
        })
    }

    /// Consume the context at the step boundary, dropping the rotary entry
    /// with it. Callers that let the context fall out of scope get the same
    /// effect; this exists to make the boundary explicit in host loops.
    pub fn end_step(self) {}
}

/// Accumulates sequences for a step and turns them into a validated
/// [`StepContext`].
#[derive(Debug)]
pub struct StepContextBuilder {
    block_size: usize,
    sequences: Vec<ScheduledSequence>,
    block_tables: Vec<Vec<BlockId>>,
}

impl StepContextBuilder {
    pub fn begin_step(block_size: usize) -> Self {
        Self {
            block_size,
            sequences: Vec::new(),
            block_tables: Vec::new(),
        }
    }

    pub fn add_sequence(mut self, seq: ScheduledSequence, block_table: Vec<BlockId>) -> Self {
        self.sequences.push(seq);
        self.block_tables.push(block_table);
        self
    }

    /// Add a sequence using the table the engine holds for it. The engine
    /// must already have grown the table to cover `seq.kv_len`.
    pub fn add_from_engine(self, engine: &BlockEngine, seq: ScheduledSequence) -> Result<Self> {
        let Some(table) = engine.block_table(seq.id) else {
            return Err(Error::OutOfRange {
                position: seq.kv_len,
                capacity: 0,
            });
        };
        Ok(self.add_sequence(seq, table.blocks().to_vec()))
    }

    pub fn build(self) -> Result<StepContext> {
        if self.sequences.is_empty() {
            return Err(Error::ShapeMismatch {
                what: "step batch",
                expected: 1,
                got: 0,
            });
        }
        for (seq, table) in self.sequences.iter().zip(&self.block_tables) {
            if seq.q_len == 0 || seq.q_len > seq.kv_len {
                return Err(Error::ShapeMismatch {
                    what: "sequence lengths",
                    expected: seq.kv_len,
                    got: seq.q_len,
                });
            }
            let capacity = table.len() * self.block_size;
            if seq.kv_len > capacity {
                return Err(Error::OutOfRange {
                    position: seq.kv_len - 1,
                    capacity,
                });
            }
        }

        let slot_mapping = slot_mapping(&self.sequences, &self.block_tables, self.block_size)?;
        let cu_seqlens = cumulative_seqlens(&self.sequences);
        let position_ids = self
            .sequences
            .iter()
            .flat_map(|s| s.history_len()..s.kv_len)
            .collect();
        let max_q_len = self.sequences.iter().map(|s| s.q_len).max().unwrap_or(0);
        let max_kv_len = self.sequences.iter().map(|s| s.kv_len).max().unwrap_or(0);
        let is_decoding = self.sequences.iter().all(|s| s.is_decode());

        Ok(StepContext {
            sequences: self.sequences,
            block_tables: self.block_tables,
            block_size: self.block_size,
            slot_mapping,
            cu_seqlens,
            position_ids,
            max_q_len,
            max_kv_len,
            is_decoding,
            rotary: RotaryCoordinateCache::new(),
        })
    }
}
