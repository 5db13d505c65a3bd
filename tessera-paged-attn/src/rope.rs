use candle_core::{DType, Device, Result, Tensor};

/// Rotary coordinate tables for a step's token positions.
///
/// Frequencies are accumulated in f32 regardless of the target dtype; bf16
/// loses precision on long contexts. Each returned table is
/// `[num_tokens, rotary_dim]` with the half-table laid out twice, matching
/// the rotate-half application below.
pub fn cos_sin_for_positions(
    position_ids: &[usize],
    rotary_dim: usize,
    base: f32,
    dtype: DType,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    if rotary_dim % 2 != 0 {
        candle_core::bail!("rotary_dim must be even, got {rotary_dim}");
    }
    let half = rotary_dim / 2;
    let inv_freq: Vec<f32> = (0..half)
        .map(|i| 1f32 / base.powf(2.0 * i as f32 / rotary_dim as f32))
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
    let positions: Vec<f32> = position_ids.iter().map(|&p| p as f32).collect();
    let n = positions.len();
    let positions = Tensor::from_vec(positions, (n, 1), device)?;
    let freqs = positions.matmul(&inv_freq)?;
    let emb = Tensor::cat(&[&freqs, &freqs], 1)?;
    Ok((emb.cos()?.to_dtype(dtype)?, emb.sin()?.to_dtype(dtype)?))
}

/// Apply rotary position embedding to query and key, NeoX style.
///
/// `query`/`key` are `[num_tokens, heads, head_dim]`; `cos`/`sin` are
/// `[num_tokens, head_dim]` tables from [`cos_sin_for_positions`]. Returns the
/// embedded pair.
pub fn apply_rotary_pos_emb(
    query: &Tensor,
    key: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let (_n, _heads, head_dim) = query.dims3()?;
    let (_, rotary_dim) = cos.dims2()?;
    if rotary_dim != head_dim {
        candle_core::bail!("rotary_dim {rotary_dim} != head_dim {head_dim}");
    }
    let cos = cos.unsqueeze(1)?; // [n, 1, head_dim]
    let sin = sin.unsqueeze(1)?;
    let q = rotate(query, &cos, &sin)?;
    let k = rotate(key, &cos, &sin)?;
    Ok((q, k))
}

fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let head_dim = x.dim(2)?;
    let half = head_dim / 2;
    let x1 = x.narrow(2, 0, half)?;
    let x2 = x.narrow(2, half, half)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], 2)?;
    x.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_zero_is_identity() {
        let (cos, sin) =
            cos_sin_for_positions(&[0], 8, 10000.0, DType::F32, &Device::Cpu).unwrap();
        let cos: Vec<f32> = cos.flatten_all().unwrap().to_vec1().unwrap();
        let sin: Vec<f32> = sin.flatten_all().unwrap().to_vec1().unwrap();
        assert!(cos.iter().all(|&c| (c - 1.0).abs() < 1e-6));
        assert!(sin.iter().all(|&s| s.abs() < 1e-6));

        // Rotating with identity tables leaves q/k untouched.
        let q = Tensor::randn(0f32, 1.0, (1, 2, 8), &Device::Cpu).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 2, 8), &Device::Cpu).unwrap();
        let (cos, sin) =
            cos_sin_for_positions(&[0], 8, 10000.0, DType::F32, &Device::Cpu).unwrap();
        let (q_emb, _) = apply_rotary_pos_emb(&q, &k, &cos, &sin).unwrap();
        let want: Vec<f32> = q.flatten_all().unwrap().to_vec1().unwrap();
        let got: Vec<f32> = q_emb.flatten_all().unwrap().to_vec1().unwrap();
        for (w, g) in want.iter().zip(&got) {
            assert!((w - g).abs() < 1e-6);
        }
    }

    #[test]
    fn test_table_shapes_and_first_frequency() {
        let (cos, sin) =
            cos_sin_for_positions(&[3, 7], 8, 10000.0, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(cos.dims(), &[2, 8]);
        assert_eq!(sin.dims(), &[2, 8]);
        // First frequency is 1.0, so column 0 is cos(position) itself, and
        // the half-table repeats at column 4.
        let row: Vec<f32> = cos.get(0).unwrap().to_vec1().unwrap();
        assert!((row[0] - 3f32.cos()).abs() < 1e-5);
        assert!((row[0] - row[4]).abs() < 1e-6);
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let q = Tensor::randn(0f32, 1.0, (4, 2, 8), &Device::Cpu).unwrap();
        let k = Tensor::randn(0f32, 1.0, (4, 2, 8), &Device::Cpu).unwrap();
        let (cos, sin) =
            cos_sin_for_positions(&[0, 1, 5, 9], 8, 10000.0, DType::F32, &Device::Cpu).unwrap();
        let (q_emb, k_emb) = apply_rotary_pos_emb(&q, &k, &cos, &sin).unwrap();
        for (orig, emb) in [(&q, &q_emb), (&k, &k_emb)] {
            let a = orig.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
            let b = emb.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
            assert!((a - b).abs() / a < 1e-4);
        }
    }

    #[test]
    fn test_odd_rotary_dim_rejected() {
        assert!(cos_sin_for_positions(&[0], 7, 10000.0, DType::F32, &Device::Cpu).is_err());
    }
}
