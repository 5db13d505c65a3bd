use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{DType, Device, Tensor};
use tessera_paged_attn::{write_kv, CacheDims, CacheLayout};

use crate::config::{CacheConfig, ModelConfigLike};
use crate::error::{Error, Result};

pub type KVCache = (Tensor, Tensor);

/// Owns the physical cache planes, one (key, value) pair per layer.
///
/// Planes are allocated once at startup under the configured layout and never
/// resized; capacity is managed purely through block accounting in
/// `BlockEngine`. Shared behind `Arc` so every layer's attention holds the
/// same storage.
pub struct CacheEngine {
    kv_caches: Arc<Mutex<Vec<KVCache>>>,
    layout: CacheLayout,
    dims: CacheDims,
}

impl CacheEngine {
    pub fn new(
        config: &CacheConfig,
        model: &dyn ModelConfigLike,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let dims = CacheDims {
            num_blocks: config.num_blocks,
            block_size: config.block_size,
            num_kv_heads: model.num_kv_heads(),
            head_dim: model.head_dim(),
        };
        let shape = config.layout.shape(&dims);
        let mut kv_caches = Vec::with_capacity(model.num_layers());
        for _ in 0..model.num_layers() {
            let key = Tensor::zeros(shape, dtype, device)?;
            let value = Tensor::zeros(shape, dtype, device)?;
            kv_caches.push((key, value));
        }
        tracing::info!(
            num_layers = model.num_layers(),
            num_blocks = dims.num_blocks,
            block_size = dims.block_size,
            slots = dims.num_slots(),
            ?dtype,
            "allocated kv cache planes"
        );
        Ok(Self {
            kv_caches: Arc::new(Mutex::new(kv_caches)),
            layout: config.layout,
            dims,
        })
    }

    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    pub fn dims(&self) -> &CacheDims {
        &self.dims
    }

    pub fn get_kv_cache(&self) -> MutexGuard<'_, Vec<KVCache>> {
        loop {
            if let Ok(v) = self.kv_caches.try_lock() {
                return v;
            }
        }
    }
}

/// Writes new K/V rows into their mapped physical slots.
///
/// Runs before attention in every forward pass, so a decode query always
/// finds its own token in the cache.
#[derive(Clone, Copy, Debug)]
pub struct CacheWriter {
    layout: CacheLayout,
}

impl CacheWriter {
    pub fn new(layout: CacheLayout) -> Self {
        Self { layout }
    }

    /// Scatter `keys`/`values` rows (`[num_tokens, num_kv_heads, head_dim]`)
    /// into the layer's cache planes at `slot_mapping`.
    pub fn write(
        &self,
        keys: &Tensor,
        values: &Tensor,
        key_cache: &Tensor,
        value_cache: &Tensor,
        slot_mapping: &[usize],
    ) -> Result<()> {
        let rows = keys.dim(0)?;
        if rows != slot_mapping.len() {
            return Err(Error::ShapeMismatch {
                what: "kv rows vs slot mapping",
                expected: slot_mapping.len(),
                got: rows,
            });
        }
        write_kv(keys, values, key_cache, value_cache, slot_mapping, self.layout)?;
        Ok(())
    }
}
