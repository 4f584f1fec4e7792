//! Utility functions and helpers
//!
//! Tensor helpers shared by the generator, the discriminators and the
//! training step.

/// Tensor utilities
pub mod tensor_utils {
    use anyhow::Result;
    use candle_core::{DType, Device, Tensor, D};
    use rand::Rng;

    use crate::error::VcError;

    /// Padding that keeps the length of a stride-1 convolution unchanged
    pub fn get_padding(kernel_size: usize, dilation: usize) -> usize {
        (kernel_size * dilation - dilation) / 2
    }

    /// Leaky ReLU activation
    pub fn leaky_relu(x: &Tensor, negative_slope: f64) -> Result<Tensor> {
        let zeros = x.zeros_like()?;
        let positive = x.maximum(&zeros)?;
        let negative = (x.minimum(&zeros)? * negative_slope)?;
        (positive + negative).map_err(Into::into)
    }

    /// Mean squared error over every element
    pub fn mse(a: &Tensor, b: &Tensor) -> Result<Tensor> {
        (a - b)?.sqr()?.mean_all().map_err(Into::into)
    }

    /// Lengths covering the whole time axis for every batch element
    pub fn full_lengths(batch: usize, time: usize) -> Vec<usize> {
        vec![time; batch]
    }

    /// Create a float mask (batch, max_len) with 1.0 on valid positions
    pub fn sequence_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
        let mut mask = vec![0f32; lengths.len() * max_len];
        for (b, &len) in lengths.iter().enumerate() {
            for t in 0..len.min(max_len) {
                mask[b * max_len + t] = 1.0;
            }
        }
        Tensor::from_vec(mask, (lengths.len(), max_len), device).map_err(Into::into)
    }

    /// Cut `segment_size` frames starting at `ids[b]` from every batch element
    ///
    /// Input: (batch, channels, time). Output: (batch, channels, segment_size).
    pub fn slice_segments(x: &Tensor, ids: &[usize], segment_size: usize) -> Result<Tensor> {
        let (batch, _channels, time) = x.dims3()?;
        if ids.len() != batch {
            return Err(VcError::InvalidInput(format!(
                "{} slice offsets for a batch of {}",
                ids.len(),
                batch
            ))
            .into());
        }

        let mut segments = Vec::with_capacity(batch);
        for (b, &start) in ids.iter().enumerate() {
            if start + segment_size > time {
                return Err(VcError::InvalidInput(format!(
                    "segment [{}, {}) exceeds time axis of length {}",
                    start,
                    start + segment_size,
                    time
                ))
                .into());
            }
            segments.push(x.narrow(0, b, 1)?.narrow(2, start, segment_size)?);
        }
        Tensor::cat(&segments, 0).map_err(Into::into)
    }

    /// Draw one segment start per sequence
    ///
    /// Offsets are uniform in `[0, len - segment_size]` so the segment stays
    /// inside the valid (unpadded) part of each sequence.
    pub fn rand_segment_ids<R: Rng>(
        lengths: &[usize],
        segment_size: usize,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        lengths
            .iter()
            .map(|&len| {
                if len < segment_size {
                    return Err(VcError::InvalidInput(format!(
                        "sequence of {} frames is shorter than segment size {}",
                        len, segment_size
                    ))
                    .into());
                }
                Ok(rng.gen_range(0..=len - segment_size))
            })
            .collect()
    }

    /// Pad the last axis on the right with reflected samples
    ///
    /// Mirrors around the final sample without repeating it, so `pad` must
    /// be smaller than the axis length.
    pub fn reflect_pad_right(x: &Tensor, pad: usize) -> Result<Tensor> {
        if pad == 0 {
            return Ok(x.clone());
        }
        let len = x.dim(D::Minus1)?;
        if pad >= len {
            return Err(VcError::InvalidInput(format!(
                "reflect padding of {} needs more than {} samples",
                pad, len
            ))
            .into());
        }

        let last = x.rank() - 1;
        let mut pieces = Vec::with_capacity(pad + 1);
        pieces.push(x.clone());
        for i in 1..=pad {
            pieces.push(x.narrow(last, len - 1 - i, 1)?);
        }
        Tensor::cat(&pieces, last).map_err(Into::into)
    }

    /// Scale `x` to unit L2 norm over all elements
    pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
        let norm = (x.sqr()?.sum_all()?.sqrt()? + 1e-12)?;
        x.broadcast_div(&norm).map_err(Into::into)
    }

    /// Host copy of a tensor as f32 values, whatever its dtype
    pub fn to_vec_f32(x: &Tensor) -> Result<Vec<f32>> {
        x.to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::tensor_utils::*;
    use candle_core::{Device, Tensor};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_get_padding() {
        assert_eq!(get_padding(3, 1), 1);
        assert_eq!(get_padding(5, 1), 2);
        assert_eq!(get_padding(3, 5), 5);
        assert_eq!(get_padding(11, 3), 15);
    }

    #[test]
    fn test_leaky_relu() {
        let device = Device::Cpu;
        let x = Tensor::new(&[-2.0f32, 0.0, 3.0], &device).unwrap();
        let y: Vec<f32> = leaky_relu(&x, 0.1).unwrap().to_vec1().unwrap();
        assert!((y[0] + 0.2).abs() < 1e-6);
        assert_eq!(y[1], 0.0);
        assert_eq!(y[2], 3.0);
    }

    #[test]
    fn test_sequence_mask() {
        let device = Device::Cpu;
        let mask = sequence_mask(&[2, 4], 4, &device).unwrap();
        let values: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        assert_eq!(values[0], vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(values[1], vec![1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_slice_segments() {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 20.0, &device)
            .unwrap()
            .reshape((2, 1, 10))
            .unwrap();
        let y = slice_segments(&x, &[1, 5], 3).unwrap();
        let values: Vec<Vec<Vec<f32>>> = y.to_vec3().unwrap();
        assert_eq!(values[0][0], vec![1.0, 2.0, 3.0]);
        assert_eq!(values[1][0], vec![15.0, 16.0, 17.0]);
    }

    #[test]
    fn test_rand_segment_ids_respect_lengths() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let ids = rand_segment_ids(&[40, 12, 10], 10, &mut rng).unwrap();
            assert!(ids[0] <= 30);
            assert!(ids[1] <= 2);
            assert_eq!(ids[2], 0);
        }
    }

    #[test]
    fn test_rand_segment_ids_too_short() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(rand_segment_ids(&[8], 9, &mut rng).is_err());
    }

    #[test]
    fn test_reflect_pad_right() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[[1.0f32, 2.0, 3.0, 4.0]]], &device).unwrap();
        let y = reflect_pad_right(&x, 2).unwrap();
        let values: Vec<Vec<Vec<f32>>> = y.to_vec3().unwrap();
        assert_eq!(values[0][0], vec![1.0, 2.0, 3.0, 4.0, 3.0, 2.0]);
    }
}
