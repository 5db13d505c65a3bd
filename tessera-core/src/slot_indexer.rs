use crate::error::{Error, Result};
use crate::sequence::ScheduledSequence;

/// Flat physical slot for every new token in the batch, in batch order.
///
/// Each sequence starts at its history length mapped through its block table
/// and advances one slot per token, rolling to the next block id already in
/// the table when the offset wraps. Prefill (many tokens) and decode (one
/// token) go through the same loop, so writers and readers share one
/// addressing convention.
///
/// Tables must have been grown to cover `kv_len` before indexing; a missing
/// block means the scheduler under-allocated, which is fatal here.
pub fn slot_mapping(
    sequences: &[ScheduledSequence],
    block_tables: &[Vec<u32>],
    block_size: usize,
) -> Result<Vec<usize>> {
    let total: usize = sequences.iter().map(|s| s.q_len).sum();
    let mut slots = Vec::with_capacity(total);
    for (seq, table) in sequences.iter().zip(block_tables) {
        let history = seq.history_len();
        let mut block_idx = history / block_size;
        let mut token_loc = history % block_size;
        for j in 0..seq.q_len {
            let Some(&block_id) = table.get(block_idx) else {
                return Err(Error::OutOfRange {
                    position: history + j,
                    capacity: table.len() * block_size,
                });
            };
            slots.push(block_id as usize * block_size + token_loc);
            token_loc = (token_loc + 1) % block_size;
            if token_loc == 0 {
                block_idx += 1;
            }
        }
    }
    Ok(slots)
}

/// Prefix sums of per-sequence new-token counts: length `batch + 1`, starting
/// at 0, ending at the batch's total new-token count. Prefill kernels use it
/// to delimit each sequence's range in the flattened token buffer.
pub fn cumulative_seqlens(sequences: &[ScheduledSequence]) -> Vec<u32> {
    let mut cu = Vec::with_capacity(sequences.len() + 1);
    let mut acc = 0u32;
    cu.push(0);
    for seq in sequences {
        acc += seq.q_len as u32;
        cu.push(acc);
    }
    cu
}
