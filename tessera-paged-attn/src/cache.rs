use candle_core::{IndexOp, Result, Tensor};

use crate::layout::CacheLayout;

/// Write new K/V rows into the physical cache planes, in place.
///
/// Row `i` of `key`/`value` (`[num_tokens, num_kv_heads, head_dim]`) lands in
/// flat slot `slot_mapping[i]` of both planes. The same path serves prefill
/// (many rows) and decode (one row). The caller guarantees the slots are
/// pairwise distinct within a step, which is what makes the in-place mutation
/// safe while other sequences read the cache.
pub fn write_kv(
    key: &Tensor,
    value: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    slot_mapping: &[usize],
    layout: CacheLayout,
) -> Result<()> {
    let key = key.contiguous()?;
    let value = value.contiguous()?;
    let (num_tokens, num_kv_heads, head_dim) = key.dims3()?;
    // The in-place writes below go through reshape aliases, which only share
    // storage with a contiguous plane; a strided plane would take the writes
    // into a copy and drop them silently.
    if !key_cache.is_contiguous() || !value_cache.is_contiguous() {
        candle_core::bail!("cache planes must be contiguous for in-place writes");
    }
    let dims = layout.dims(key_cache)?;
    if layout.dims(value_cache)? != dims {
        candle_core::bail!(
            "key and value cache planes disagree: {:?} vs {:?}",
            key_cache.shape(),
            value_cache.shape()
        );
    }
    if num_kv_heads != dims.num_kv_heads || head_dim != dims.head_dim {
        candle_core::bail!(
            "new K/V rows ({num_kv_heads} heads, dim {head_dim}) do not fit cache planes ({} heads, dim {})",
            dims.num_kv_heads,
            dims.head_dim
        );
    }
    if num_tokens != slot_mapping.len() {
        candle_core::bail!(
            "{} K/V rows but {} slots",
            num_tokens,
            slot_mapping.len()
        );
    }
    if let Some(&slot) = slot_mapping.iter().find(|&&s| s >= dims.num_slots()) {
        candle_core::bail!("slot {slot} out of range for {} slots", dims.num_slots());
    }

    match layout {
        CacheLayout::TokenMajor => {
            // The reshape of a contiguous plane aliases its storage, so the
            // slice_set mutates the cache itself.
            let flat_k = key_cache.reshape((dims.num_slots(), num_kv_heads, head_dim))?;
            let flat_v = value_cache.reshape((dims.num_slots(), num_kv_heads, head_dim))?;
            for (i, &slot) in slot_mapping.iter().enumerate() {
                flat_k.slice_set(&key.narrow(0, i, 1)?, 0, slot)?;
                flat_v.slice_set(&value.narrow(0, i, 1)?, 0, slot)?;
            }
        }
        CacheLayout::HeadMajor => {
            // Head rows are not adjacent per slot here; write each head's
            // head_dim run through a 1-D alias of the plane.
            let flat_k = key_cache.reshape(dims.elem_count())?;
            let flat_v = value_cache.reshape(dims.elem_count())?;
            for (i, &slot) in slot_mapping.iter().enumerate() {
                let block = slot / dims.block_size;
                let offset = slot % dims.block_size;
                for h in 0..num_kv_heads {
                    let base =
                        ((block * num_kv_heads + h) * dims.block_size + offset) * head_dim;
                    flat_k.slice_set(&key.i((i, h))?, 0, base)?;
                    flat_v.slice_set(&value.i((i, h))?, 0, base)?;
                }
            }
        }
    }
    Ok(())
}

/// Gather K/V rows back out of the cache planes at the given flat slots.
///
/// Returns `([n, num_kv_heads, head_dim], [n, num_kv_heads, head_dim])`.
pub fn gather_kv(
    key_cache: &Tensor,
    value_cache: &Tensor,
    slots: &[u32],
    layout: CacheLayout,
) -> Result<(Tensor, Tensor)> {
    let device = key_cache.device();
    let slot_tensor = Tensor::new(slots, device)?;
    let flat_k = layout.flat_slot_view(key_cache)?;
    let flat_v = layout.flat_slot_view(value_cache)?;
    let k = flat_k.index_select(&slot_tensor, 0)?;
    let v = flat_v.index_select(&slot_tensor, 0)?;
    Ok((k, v))
}

/// Flat slots covering positions `0..len` of a sequence's block table.
pub fn slots_for_prefix(block_table: &[u32], len: usize, block_size: usize) -> Result<Vec<u32>> {
    let mut slots = Vec::with_capacity(len);
    for pos in 0..len {
        let block_idx = pos / block_size;
        let Some(&block_id) = block_table.get(block_idx) else {
            candle_core::bail!(
                "position {pos} needs block {block_idx} but the table has {} blocks",
                block_table.len()
            );
        };
        slots.push(block_id * block_size as u32 + (pos % block_size) as u32);
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use half::f16;

    fn kv_rows(n: usize, heads: usize, head_dim: usize, seed: f32) -> Tensor {
        let data: Vec<f32> = (0..n * heads * head_dim)
            .map(|i| seed + i as f32)
            .collect();
        Tensor::from_vec(data, (n, heads, head_dim), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_write_then_gather_roundtrip_token_major() {
        let layout = CacheLayout::TokenMajor;
        let cache_shape = (4, 4, 2, 8); // 16 slots
        let key_cache = Tensor::zeros(cache_shape, DType::F32, &Device::Cpu).unwrap();
        let value_cache = Tensor::zeros(cache_shape, DType::F32, &Device::Cpu).unwrap();

        let key = kv_rows(3, 2, 8, 100.0);
        let value = kv_rows(3, 2, 8, 500.0);
        let slots = [5usize, 6, 12];
        write_kv(&key, &value, &key_cache, &value_cache, &slots, layout).unwrap();

        let slots_u32: Vec<u32> = slots.iter().map(|&s| s as u32).collect();
        let (k, v) = gather_kv(&key_cache, &value_cache, &slots_u32, layout).unwrap();
        let want_k: Vec<f32> = key.flatten_all().unwrap().to_vec1().unwrap();
        let got_k: Vec<f32> = k.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(want_k, got_k);
        let want_v: Vec<f32> = value.flatten_all().unwrap().to_vec1().unwrap();
        let got_v: Vec<f32> = v.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(want_v, got_v);
    }

    #[test]
    fn test_write_then_gather_roundtrip_head_major() {
        let layout = CacheLayout::HeadMajor;
        let cache_shape = (4, 2, 4, 8); // 16 slots, heads before block_size
        let key_cache = Tensor::zeros(cache_shape, DType::F32, &Device::Cpu).unwrap();
        let value_cache = Tensor::zeros(cache_shape, DType::F32, &Device::Cpu).unwrap();

        let key = kv_rows(3, 2, 8, 100.0);
        let value = kv_rows(3, 2, 8, 500.0);
        let slots = [0usize, 3, 15];
        write_kv(&key, &value, &key_cache, &value_cache, &slots, layout).unwrap();

        let slots_u32: Vec<u32> = slots.iter().map(|&s| s as u32).collect();
        let (k, v) = gather_kv(&key_cache, &value_cache, &slots_u32, layout).unwrap();
        let want_k: Vec<f32> = key.flatten_all().unwrap().to_vec1().unwrap();
        let got_k: Vec<f32> = k.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(want_k, got_k);
        let want_v: Vec<f32> = value.flatten_all().unwrap().to_vec1().unwrap();
        let got_v: Vec<f32> = v.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(want_v, got_v);
    }

    #[test]
    fn test_write_roundtrip_f16() {
        let layout = CacheLayout::TokenMajor;
        let key_cache = Tensor::zeros((2, 4, 1, 4), DType::F16, &Device::Cpu).unwrap();
        let value_cache = Tensor::zeros((2, 4, 1, 4), DType::F16, &Device::Cpu).unwrap();
        let key = kv_rows(1, 1, 4, 1.0).to_dtype(DType::F16).unwrap();
        let value = kv_rows(1, 1, 4, 9.0).to_dtype(DType::F16).unwrap();
        write_kv(&key, &value, &key_cache, &value_cache, &[7], layout).unwrap();
        let (k, _) = gather_kv(&key_cache, &value_cache, &[7], layout).unwrap();
        let got: Vec<f16> = k.flatten_all().unwrap().to_vec1().unwrap();
        let want: Vec<f16> = key.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn test_write_rejects_row_slot_disagreement() {
        let layout = CacheLayout::TokenMajor;
        let key_cache = Tensor::zeros((2, 4, 2, 8), DType::F32, &Device::Cpu).unwrap();
        let value_cache = Tensor::zeros((2, 4, 2, 8), DType::F32, &Device::Cpu).unwrap();
        let key = kv_rows(3, 2, 8, 0.0);
        let value = kv_rows(3, 2, 8, 0.0);
        assert!(write_kv(&key, &value, &key_cache, &value_cache, &[0, 1], layout).is_err());
    }

    #[test]
    fn test_write_rejects_out_of_range_slot() {
        let layout = CacheLayout::TokenMajor;
        let key_cache = Tensor::zeros((2, 4, 2, 8), DType::F32, &Device::Cpu).unwrap();
        let value_cache = Tensor::zeros((2, 4, 2, 8), DType::F32, &Device::Cpu).unwrap();
        let key = kv_rows(1, 2, 8, 0.0);
        let value = kv_rows(1, 2, 8, 0.0);
        assert!(write_kv(&key, &value, &key_cache, &value_cache, &[8], layout).is_err());
    }

    #[test]
    fn test_write_rejects_non_contiguous_plane() {
        // A transposed plane has a valid TokenMajor shape but strided
        // storage; writing through it would mutate a copy, not the cache.
        let layout = CacheLayout::TokenMajor;
        let key_cache = Tensor::zeros((4, 2, 4, 8), DType::F32, &Device::Cpu)
            .unwrap()
            .transpose(1, 2)
            .unwrap();
        let value_cache = Tensor::zeros((4, 4, 2, 8), DType::F32, &Device::Cpu).unwrap();
        let key = kv_rows(1, 2, 8, 0.0);
        let value = kv_rows(1, 2, 8, 0.0);
        assert!(write_kv(&key, &value, &key_cache, &value_cache, &[0], layout).is_err());
    }

    #[test]
    fn test_slots_for_prefix_rolls_blocks() {
        // block_size 4, table maps logical blocks 0,1 to physical 2,0
        let slots = slots_for_prefix(&[2, 0], 6, 4).unwrap();
        assert_eq!(slots, vec![8, 9, 10, 11, 0, 1]);
        assert!(slots_for_prefix(&[2], 6, 4).is_err());
    }
}
