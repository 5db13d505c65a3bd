use candle_core::{DType, Result, Tensor};

use crate::cache::{gather_kv, slots_for_prefix};
use crate::layout::CacheLayout;

/// CPU reference for context (prefill) attention over a paged cache.
///
/// Unfused and intentionally slow — this is the correctness reference the
/// dispatcher falls back to when no fused backend is wired in. It gathers
/// cached history K/V through each sequence's block table, concatenates with
/// the new K/V rows, and runs standard masked attention.
///
/// # Arguments
///
/// * `query` - `[total_new_tokens, num_heads, head_dim]`
/// * `key` - `[total_new_tokens, num_kv_heads, head_dim]`
/// * `value` - `[total_new_tokens, num_kv_heads, head_dim]`
/// * `key_cache` / `value_cache` - cache planes under `layout`
/// * `block_tables` - per-sequence physical block ids
/// * `history_lens` - cached tokens per sequence (0 for unpaged prefill)
/// * `query_lens` - new tokens per sequence; rows are laid out in batch order
/// * `scale` - QK scaling factor
#[allow(clippy::too_many_arguments)]
pub fn context_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    layout: CacheLayout,
    block_tables: &[Vec<u32>],
    history_lens: &[usize],
    query_lens: &[usize],
    scale: f32,
) -> Result<Tensor> {
    let device = query.device();
    let dtype = query.dtype();
    let (total_q, num_heads, head_dim) = query.dims3()?;
    let (_, num_kv_heads, _) = key.dims3()?;
    let n_groups = num_heads / num_kv_heads;
    let num_seqs = query_lens.len();
    if history_lens.len() != num_seqs || block_tables.len() != num_seqs {
        candle_core::bail!(
            "batch size disagreement: {} query_lens, {} history_lens, {} block tables",
            num_seqs,
            history_lens.len(),
            block_tables.len()
        );
    }
    if query_lens.iter().sum::<usize>() != total_q {
        candle_core::bail!(
            "query has {total_q} rows but query_lens sum to {}",
            query_lens.iter().sum::<usize>()
        );
    }
    let dims = layout.dims(key_cache)?;
    if head_dim != dims.head_dim {
        candle_core::bail!(
            "query head_dim {head_dim} does not match cache head_dim {}",
            dims.head_dim
        );
    }
    let block_size = dims.block_size;

    let mut outputs = Vec::with_capacity(num_seqs);
    let mut q_offset = 0usize;
    for seq_idx in 0..num_seqs {
        let ctx_len = history_lens[seq_idx];
        let q_len = query_lens[seq_idx];
        let total_kv = ctx_len + q_len;

        let q_i = query.narrow(0, q_offset, q_len)?;
        let new_k = key.narrow(0, q_offset, q_len)?;
        let new_v = value.narrow(0, q_offset, q_len)?;

        let (full_k, full_v) = if ctx_len > 0 {
            let slots = slots_for_prefix(&block_tables[seq_idx], ctx_len, block_size)?;
            let (cached_k, cached_v) = gather_kv(key_cache, value_cache, &slots, layout)?;
            (
                Tensor::cat(&[&cached_k, &new_k.contiguous()?], 0)?,
                Tensor::cat(&[&cached_v, &new_v.contiguous()?], 0)?,
            )
        } else {
            (new_k.contiguous()?, new_v.contiguous()?)
        };

        let full_k = expand_kv_heads(&full_k, n_groups)?;
        let full_v = expand_kv_heads(&full_v, n_groups)?;

        // [num_heads, q_len, total_kv], accumulated in f32
        let q_t = q_i.transpose(0, 1)?.to_dtype(DType::F32)?.contiguous()?;
        let k_t = full_k.transpose(0, 1)?.to_dtype(DType::F32)?.contiguous()?;
        let v_t = full_v.transpose(0, 1)?.to_dtype(DType::F32)?.contiguous()?;
        let scores = (q_t.matmul(&k_t.transpose(1, 2)?)? * scale as f64)?;

        // Diagonal shift: query at local position q sits at global position
        // ctx_len + q and attends to kv positions 0..=ctx_len + q.
        let mask = build_causal_mask(q_len, total_kv, ctx_len, device)?;
        let scores = scores.broadcast_add(&mask)?;
        let attn = candle_nn::ops::softmax_last_dim(&scores)?;

        let out_i = attn.matmul(&v_t)?.transpose(0, 1)?.to_dtype(dtype)?;
        outputs.push(out_i);
        q_offset += q_len;
    }

    Tensor::cat(&outputs, 0)
}

/// CPU reference for decode attention: one new query token per sequence
/// against its cache span.
///
/// `context_lens[i]` is the sequence's total current length, including the
/// token written this step; the gather is bounded by it, so padding slots in
/// partially filled blocks never reach the softmax.
///
/// * `query` - `[num_seqs, num_heads, head_dim]`
///
/// Returns `[num_seqs, num_heads, head_dim]`.
pub fn paged_decode_attention(
    query: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    layout: CacheLayout,
    block_tables: &[Vec<u32>],
    context_lens: &[usize],
    scale: f32,
) -> Result<Tensor> {
    let dtype = query.dtype();
    let (num_seqs, num_heads, _head_dim) = query.dims3()?;
    if context_lens.len() != num_seqs || block_tables.len() != num_seqs {
        candle_core::bail!(
            "batch size disagreement: {num_seqs} queries, {} context_lens, {} block tables",
            context_lens.len(),
            block_tables.len()
        );
    }
    let dims = layout.dims(key_cache)?;
    let n_groups = num_heads / dims.num_kv_heads;

    let mut outputs = Vec::with_capacity(num_seqs);
    for seq_idx in 0..num_seqs {
        let kv_len = context_lens[seq_idx];
        let slots = slots_for_prefix(&block_tables[seq_idx], kv_len, dims.block_size)?;
        let (k, v) = gather_kv(key_cache, value_cache, &slots, layout)?;
        let k = expand_kv_heads(&k, n_groups)?;
        let v = expand_kv_heads(&v, n_groups)?;

        // [num_heads, 1, kv_len]; no mask needed, every cached position is
        // at or before the query's own.
        let q_t = query
            .narrow(0, seq_idx, 1)?
            .transpose(0, 1)?
            .to_dtype(DType::F32)?
            .contiguous()?;
        let k_t = k.transpose(0, 1)?.to_dtype(DType::F32)?.contiguous()?;
        let v_t = v.transpose(0, 1)?.to_dtype(DType::F32)?.contiguous()?;
        let scores = (q_t.matmul(&k_t.transpose(1, 2)?)? * scale as f64)?;
        let attn = candle_nn::ops::softmax_last_dim(&scores)?;
        let out_i = attn.matmul(&v_t)?.transpose(0, 1)?.to_dtype(dtype)?;
        outputs.push(out_i);
    }

    Tensor::cat(&outputs, 0)
}

/// Expand grouped KV heads to the full query head count.
fn expand_kv_heads(x: &Tensor, n_groups: usize) -> Result<Tensor> {
    if n_groups == 1 {
        return Ok(x.clone());
    }
    let (tkv, num_kv_heads, head_dim) = x.dims3()?;
    x.unsqueeze(2)?
        .expand((tkv, num_kv_heads, n_groups, head_dim))?
        .reshape((tkv, num_kv_heads * n_groups, head_dim))
}

/// `[q_len, total_kv]` additive mask: 0.0 where attendable, -inf beyond the
/// causal limit `ctx_len + q`.
fn build_causal_mask(
    q_len: usize,
    total_kv: usize,
    ctx_len: usize,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let mut mask = vec![0.0f32; q_len * total_kv];
    for q in 0..q_len {
        let causal_limit = ctx_len + q + 1;
        for kv in causal_limit..total_kv {
            mask[q * total_kv + kv] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(mask, (q_len, total_kv), device)
}
