use std::sync::{Mutex, MutexGuard};

use candle_core::Tensor;

use crate::error::Result;

/// The (cos, sin) pair computed for the current step's positions.
#[derive(Debug, Clone)]
pub struct RotaryEntry {
    pub cos: Tensor,
    pub sin: Tensor,
}

/// Per-step memoization of rotary coordinates.
///
/// All attention layers within one step share the same token positions, so
/// the first layer computes the tables and every later layer reuses them —
/// the `position_ids` argument of a hit is deliberately ignored. The cache
/// lives inside `StepContext` and dies with it, so an entry can never leak
/// into the next step.
#[derive(Debug, Default)]
pub struct RotaryCoordinateCache {
    entry: Mutex<Option<RotaryEntry>>,
}

impl RotaryCoordinateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_guard(&self) -> MutexGuard<'_, Option<RotaryEntry>> {
        loop {
            if let Ok(v) = self.entry.try_lock() {
                return v;
            }
        }
    }

    /// Return the step's (cos, sin), computing them on the first call.
    pub fn get_or_compute<F>(&self, position_ids: &[usize], compute: F) -> Result<(Tensor, Tensor)>
    where
        F: FnOnce(&[usize]) -> candle_core::Result<(Tensor, Tensor)>,
    {
        let mut guard = self.entry_guard();
        if let Some(entry) = guard.as_ref() {
            return Ok((entry.cos.clone(), entry.sin.clone()));
        }
        let (cos, sin) = compute(position_ids)?;
        *guard = Some(RotaryEntry {
            cos: cos.clone(),
            sin: sin.clone(),
        });
        Ok((cos, sin))
    }

    pub fn is_populated(&self) -> bool {
        self.entry_guard().is_some()
    }

    /// Drop the entry. `StepContext` does this implicitly by dying at the
    /// step boundary; this is for hosts that recycle contexts.
    pub fn clear(&self) {
        *self.entry_guard() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tables(seed: f32, n: usize) -> candle_core::Result<(Tensor, Tensor)> {
        let cos = Tensor::full(seed, (n, 4), &Device::Cpu)?;
        let sin = Tensor::full(-seed, (n, 4), &Device::Cpu)?;
        Ok((cos, sin))
    }

    #[test]
    fn test_second_call_ignores_position_ids() {
        let cache = RotaryCoordinateCache::new();
        let mut calls = 0;
        let (cos_a, _) = cache
            .get_or_compute(&[0, 1, 2], |ids| {
                calls += 1;
                tables(1.0, ids.len())
            })
            .unwrap();
        // Different positions, different compute_fn output — still a hit.
        let (cos_b, _) = cache
            .get_or_compute(&[9, 10], |ids| {
                calls += 1;
                tables(2.0, ids.len())
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(cos_a.dims(), cos_b.dims());
        let a: Vec<f32> = cos_a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = cos_b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_clear_forces_fresh_compute() {
        let cache = RotaryCoordinateCache::new();
        let (cos_a, _) = cache
            .get_or_compute(&[0, 1], |ids| tables(1.0, ids.len()))
            .unwrap();
        cache.clear();
        assert!(!cache.is_populated());
        // Same positions, new step: content must come from the new compute.
        let (cos_b, _) = cache
            .get_or_compute(&[0, 1], |ids| tables(5.0, ids.len()))
            .unwrap();
        let a: Vec<f32> = cos_a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = cos_b.flatten_all().unwrap().to_vec1().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_compute_error_leaves_cache_empty() {
        let cache = RotaryCoordinateCache::new();
        let res = cache.get_or_compute(&[0], |_| candle_core::bail!("boom"));
        assert!(res.is_err());
        assert!(!cache.is_populated());
    }
}
