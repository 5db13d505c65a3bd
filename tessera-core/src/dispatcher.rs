use candle_core::Tensor;
use tessera_paged_attn::{context_attention, paged_decode_attention, CacheLayout};

use crate::cache_engine::CacheWriter;
use crate::error::{Error, Result};
use crate::step::StepContext;

/// Which kernel family a step's batch runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Prefill,
    Decode,
}

/// The two kernel entry points a device backend must provide.
///
/// Both receive the cache planes and per-sequence addressing; the dispatcher
/// has already written this step's K/V rows when either is called.
pub trait AttentionBackend {
    #[allow(clippy::too_many_arguments)]
    fn prefill(
        &self,
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
    ) -> candle_core::Result<Tensor>;

    #[allow(clippy::too_many_arguments)]
    fn decode(
        &self,
        query: &Tensor,
        key_cache: &Tensor,
        value_cache: &Tensor,
        layout: CacheLayout,
        block_tables: &[Vec<u32>],
        context_lens: &[usize],
        scale: f32,
    ) -> candle_core::Result<Tensor>;
}

/// Unfused reference backend; correct on any device candle supports.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl AttentionBackend for CpuBackend {
    fn prefill(
        &self,
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
    ) -> candle_core::Result<Tensor> {
        context_attention(
            query,
            key,
            value,
            key_cache,
            value_cache,
            layout,
            block_tables,
            history_lens,
            query_lens,
            scale,
        )
    }

    fn decode(
        &self,
        query: &Tensor,
        key_cache: &Tensor,
        value_cache: &Tensor,
        layout: CacheLayout,
        block_tables: &[Vec<u32>],
        context_lens: &[usize],
        scale: f32,
    ) -> candle_core::Result<Tensor> {
        paged_decode_attention(
            query,
            key_cache,
            value_cache,
            layout,
            block_tables,
            context_lens,
            scale,
        )
    }
}

/// Routes a step's batch to the prefill or decode kernel, writing new K/V
/// rows into the cache first so every query sees its own token.
///
/// Uniform batches go to their kernel whole. A mixed batch is split by
/// sequence, each part runs its own kernel, and the outputs are stitched back
/// together in the original batch order, so callers never observe the split.
pub struct AttentionDispatcher<B = CpuBackend> {
    backend: B,
    layout: CacheLayout,
    scale: f32,
    writer: CacheWriter,
}

impl AttentionDispatcher<CpuBackend> {
    pub fn new(layout: CacheLayout, head_dim: usize) -> Self {
        Self::with_backend(CpuBackend, layout, head_dim)
    }
}

impl<B: AttentionBackend> AttentionDispatcher<B> {
    pub fn with_backend(backend: B, layout: CacheLayout, head_dim: usize) -> Self {
        Self {
            backend,
            layout,
            scale: 1.0 / (head_dim as f32).sqrt(),
            writer: CacheWriter::new(layout),
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Classify the step's batch. `Decode` only when every sequence is a
    /// single-token continuation; a mixed batch dispatches as `Prefill` with
    /// the decode rows split out internally.
    pub fn step_kind(&self, ctx: &StepContext) -> StepKind {
        if ctx.is_decoding() {
            StepKind::Decode
        } else {
            StepKind::Prefill
        }
    }

    /// One attention layer's forward pass over the step batch.
    ///
    /// `query` is `[total_new_tokens, num_heads, head_dim]`; `key`/`value`
    /// are `[total_new_tokens, num_kv_heads, head_dim]`, already position
    /// embedded. Returns `[total_new_tokens, num_heads, head_dim]`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_cache: &Tensor,
        value_cache: &Tensor,
        ctx: &StepContext,
    ) -> Result<Tensor> {
        let rows = query.dim(0)?;
        if rows != ctx.total_new_tokens() {
            return Err(Error::ShapeMismatch {
                what: "query rows vs scheduled tokens",
                expected: ctx.total_new_tokens(),
                got: rows,
            });
        }

        // Fill before attending: decode queries must find the token written
        // this step in the cache.
        self.writer
            .write(key, value, key_cache, value_cache, ctx.slot_mapping())?;

        // Single-token sequences run the decode kernel regardless of history:
        // the fill above already placed their token, so a one-token prompt
        // decodes against its own cache span of length one.
        let decode_idx: Vec<usize> = (0..ctx.sequences().len())
            .filter(|&i| ctx.sequences()[i].q_len == 1)
            .collect();
        tracing::debug!(
            batch = ctx.sequences().len(),
            decode = decode_idx.len(),
            kind = ?self.step_kind(ctx),
            "dispatching attention step"
        );

        if decode_idx.len() == ctx.sequences().len() {
            let context_lens: Vec<usize> = ctx.sequences().iter().map(|s| s.kv_len).collect();
            let out = self.backend.decode(
                query,
                key_cache,
                value_cache,
                self.layout,
                ctx.block_tables(),
                &context_lens,
                self.scale,
            )?;
            return Ok(out);
        }
        if decode_idx.is_empty() {
            let history_lens: Vec<usize> =
                ctx.sequences().iter().map(|s| s.history_len()).collect();
            let query_lens: Vec<usize> = ctx.sequences().iter().map(|s| s.q_len).collect();
            let out = self.backend.prefill(
                query,
                key,
                value,
                key_cache,
                value_cache,
                self.layout,
                ctx.block_tables(),
                &history_lens,
                &query_lens,
                self.scale,
            )?;
            return Ok(out);
        }

        self.forward_mixed(query, key, value, key_cache, value_cache, ctx, &decode_idx)
    }

    /// Split a mixed batch, run each part on its kernel, and reassemble the
    /// outputs in the original batch order.
    #[allow(clippy::too_many_arguments)]
    fn forward_mixed(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_cache: &Tensor,
        value_cache: &Tensor,
        ctx: &StepContext,
        decode_idx: &[usize],
    ) -> Result<Tensor> {
        let cu = ctx.cu_seqlens();
        let seq_rows = |i: usize| -> Result<(Tensor, Tensor, Tensor)> {
            let start = cu[i] as usize;
            let len = ctx.sequences()[i].q_len;
            Ok((
                query.narrow(0, start, len)?,
                key.narrow(0, start, len)?,
                value.narrow(0, start, len)?,
            ))
        };

        let mut decode_q = Vec::new();
        let mut decode_tables = Vec::new();
        let mut decode_lens = Vec::new();
        let mut prefill_q = Vec::new();
        let mut prefill_k = Vec::new();
        let mut prefill_v = Vec::new();
        let mut prefill_tables = Vec::new();
        let mut prefill_history = Vec::new();
        let mut prefill_q_lens = Vec::new();
        for (i, seq) in ctx.sequences().iter().enumerate() {
            let (q, k, v) = seq_rows(i)?;
            if seq.q_len == 1 {
                decode_q.push(q);
                decode_tables.push(ctx.block_tables()[i].clone());
                decode_lens.push(seq.kv_len);
            } else {
                prefill_q.push(q);
                prefill_k.push(k);
                prefill_v.push(v);
                prefill_tables.push(ctx.block_tables()[i].clone());
                prefill_history.push(seq.history_len());
                prefill_q_lens.push(seq.q_len);
            }
        }

        let decode_out = self.backend.decode(
            &Tensor::cat(&decode_q, 0)?,
            key_cache,
            value_cache,
            self.layout,
            &decode_tables,
            &decode_lens,
            self.scale,
        )?;
        let prefill_out = self.backend.prefill(
            &Tensor::cat(&prefill_q, 0)?,
            &Tensor::cat(&prefill_k, 0)?,
            &Tensor::cat(&prefill_v, 0)?,
            key_cache,
            value_cache,
            self.layout,
            &prefill_tables,
            &prefill_history,
            &prefill_q_lens,
            self.scale,
        )?;

        // Reassemble: walk the batch in order, pulling each sequence's rows
        // from whichever sub-batch it went to.
        let mut chunks = Vec::with_capacity(ctx.sequences().len());
        let mut next_decode = 0usize;
        let mut prefill_row = 0usize;
        for (i, seq) in ctx.sequences().iter().enumerate() {
            if decode_idx.get(next_decode) == Some(&i) {
                chunks.push(decode_out.narrow(0, next_decode, 1)?);
                next_decode += 1;
            } else {
                chunks.push(prefill_out.narrow(0, prefill_row, seq.q_len)?);
                prefill_row += seq.q_len;
            }
        }
        Ok(Tensor::cat(&chunks, 0)?)
    }
}
