use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

/// Physical arrangement of one cache plane.
///
/// The layout is always passed explicitly alongside the cache handle. Nothing
/// in this crate infers it from tensor shapes: a `[b, 16, 16, d]` plane is
/// ambiguous, and viewing it under the wrong convention aliases slots
/// silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheLayout {
    /// `[num_blocks, block_size, num_kv_heads, head_dim]`
    TokenMajor,
    /// `[num_blocks, num_kv_heads, block_size, head_dim]`
    HeadMajor,
}

/// Dimensions of a cache plane, decoded under an explicit layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheDims {
    pub num_blocks: usize,
    pub block_size: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl CacheDims {
    pub fn num_slots(&self) -> usize {
        self.num_blocks * self.block_size
    }

    pub fn elem_count(&self) -> usize {
        self.num_slots() * self.num_kv_heads * self.head_dim
    }
}

impl CacheLayout {
    /// Shape of a cache plane with the given dimensions under this layout.
    pub fn shape(&self, dims: &CacheDims) -> (usize, usize, usize, usize) {
        match self {
            CacheLayout::TokenMajor => (
                dims.num_blocks,
                dims.block_size,
                dims.num_kv_heads,
                dims.head_dim,
            ),
            CacheLayout::HeadMajor => (
                dims.num_blocks,
                dims.num_kv_heads,
                dims.block_size,
                dims.head_dim,
            ),
        }
    }

    /// Decode a cache plane's dimensions under this layout.
    pub fn dims(&self, cache: &Tensor) -> Result<CacheDims> {
        let (d0, d1, d2, d3) = cache.dims4()?;
        Ok(match self {
            CacheLayout::TokenMajor => CacheDims {
                num_blocks: d0,
                block_size: d1,
                num_kv_heads: d2,
                head_dim: d3,
            },
            CacheLayout::HeadMajor => CacheDims {
                num_blocks: d0,
                block_size: d2,
                num_kv_heads: d1,
                head_dim: d3,
            },
        })
    }

    /// A `[num_slots, num_kv_heads, head_dim]` copy of the plane, slot-indexed
    /// by `block_id * block_size + offset`. Read path only: for `HeadMajor`
    /// the permute forces a copy, so writes never go through this view.
    pub fn flat_slot_view(&self, cache: &Tensor) -> Result<Tensor> {
        let dims = self.dims(cache)?;
        match self {
            CacheLayout::TokenMajor => {
                cache.reshape((dims.num_slots(), dims.num_kv_heads, dims.head_dim))
            }
            CacheLayout::HeadMajor => cache
                .permute((0, 2, 1, 3))?
                .contiguous()?
                .reshape((dims.num_slots(), dims.num_kv_heads, dims.head_dim)),
        }
    }
}
