//! Attention mask utilities
//!
//! Masks are built per forward pass. Audits run two short prompts, so
//! there is nothing worth keeping around between calls.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Create a causal mask for the given sequence length
///
/// # Returns
///
/// A tensor of shape `[1, 1, seq_len, seq_len]` where:
/// - `0.0` for positions that can attend (j <= i)
/// - `-inf` for positions that cannot attend (j > i)
///
/// For seq_len=3:
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_shape() {
        let mask = create_causal_mask(4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 4, 4]);
    }

    #[test]
    fn test_causal_mask_values() {
        let mask = create_causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        // Row 0: [0, -inf, -inf]
        assert_eq!(data[0], 0.0);
        assert!(data[1].is_infinite() && data[1] < 0.0);
        assert!(data[2].is_infinite() && data[2] < 0.0);

        // Row 1: [0, 0, -inf]
        assert_eq!(data[3], 0.0);
        assert_eq!(data[4], 0.0);
        assert!(data[5].is_infinite() && data[5] < 0.0);

        // Row 2: [0, 0, 0]
        assert!(data[6..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_single_token_mask_is_open() {
        let mask = create_causal_mask(1, &Device::Cpu, DType::F32).unwrap();
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(data, vec![0.0]);
    }
}
