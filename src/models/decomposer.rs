//! Content/speaker decomposition
//!
//! The quantized embedding `Q` carries the content; what quantization
//! removed, `S = C - Q`, carries the speaker. `S` is further split into its
//! utterance average (the global speaker identity) and the per-frame
//! residual around that average.

use anyhow::Result;
use candle_core::{Tensor, D};

use crate::error::VcError;
use crate::models::quantizer::AxisOrder;
use crate::utils::tensor_utils::slice_segments;

/// Bring the channels-last quantizer output into the layout of `reference`
///
/// `order` is the layout the quantizer detected on its input, so the
/// transpose is decided by that and never by comparing shapes. The result
/// must then match `reference` exactly; anything else is a fatal shape
/// mismatch.
pub fn align_to_input(quantized: &Tensor, reference: &Tensor, order: AxisOrder) -> Result<Tensor> {
    let aligned = match order {
        AxisOrder::ChannelsFirst if quantized.rank() == 3 => quantized.transpose(1, 2)?.contiguous()?,
        _ => quantized.clone(),
    };
    if aligned.dims() != reference.dims() {
        return Err(VcError::shape_mismatch(reference.dims(), quantized.dims()).into());
    }
    Ok(aligned)
}

/// `C` split into content and speaker parts, all channels-first (B, D, T)
#[derive(Debug, Clone)]
pub struct Decomposition {
    /// Quantized content code `Q`
    pub content: Tensor,
    /// `S = C - Q`
    pub speaker: Tensor,
    /// Mean of `S` over time, (B, D, 1)
    pub speaker_avg: Tensor,
    /// `S - speaker_avg`
    pub residual: Tensor,
}

impl Decomposition {
    /// Decompose `c` given the quantizer's channels-last output
    ///
    /// `order` is the layout of `c` as reported by the quantizer. A
    /// channels-last `c` is moved to channels-first after the subtraction.
    pub fn new(c: &Tensor, quantized: &Tensor, order: AxisOrder) -> Result<Self> {
        let content = align_to_input(quantized, c, order)?;
        let speaker = (c - &content)?;
        match order {
            AxisOrder::ChannelsFirst => Self::from_parts(content, speaker),
            AxisOrder::ChannelsLast => Self::from_parts(
                content.transpose(1, 2)?.contiguous()?,
                speaker.transpose(1, 2)?.contiguous()?,
            ),
        }
    }

    fn from_parts(content: Tensor, speaker: Tensor) -> Result<Self> {
        let speaker_avg = speaker.mean_keepdim(D::Minus1)?;
        let residual = speaker.broadcast_sub(&speaker_avg)?;
        Ok(Self {
            content,
            speaker,
            speaker_avg,
            residual,
        })
    }

    /// Cut the same `segment_size` frames from content and speaker
    ///
    /// The average and residual are recomputed over the slice.
    pub fn slice(&self, ids: &[usize], segment_size: usize) -> Result<Self> {
        let content = slice_segments(&self.content, ids, segment_size)?;
        let speaker = slice_segments(&self.speaker, ids, segment_size)?;
        Self::from_parts(content, speaker)
    }

    /// Source content and residual under the target's global speaker
    pub fn with_speaker_of(&self, target: &Decomposition) -> Result<Self> {
        let (batch, dim, _) = self.content.dims3()?;
        let (t_batch, t_dim, _) = target.speaker_avg.dims3()?;
        if t_dim != dim || (t_batch != batch && t_batch != 1) {
            return Err(VcError::shape_mismatch(&[batch, dim, 1], target.speaker_avg.dims()).into());
        }
        let speaker_avg = target.speaker_avg.broadcast_as((batch, dim, 1))?.contiguous()?;
        Ok(Self {
            content: self.content.clone(),
            speaker: self.residual.broadcast_add(&speaker_avg)?,
            speaker_avg,
            residual: self.residual.clone(),
        })
    }

    /// Number of frames
    pub fn frames(&self) -> Result<usize> {
        self.content.dim(D::Minus1).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn max_abs(t: &Tensor) -> f32 {
        t.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_decomposition_is_lossless() {
        let device = Device::Cpu;
        let c = Tensor::randn(0f32, 1.0, (2, 6, 9), &device).unwrap();
        // quantized arrives channels-last
        let q = Tensor::randn(0f32, 1.0, (2, 9, 6), &device).unwrap();
        let dec = Decomposition::new(&c, &q, AxisOrder::ChannelsFirst).unwrap();

        assert_eq!(dec.content.dims3().unwrap(), (2, 6, 9));
        let recombined = (&dec.content + &dec.speaker).unwrap();
        assert!(max_abs(&(recombined - &c).unwrap()) < 1e-6);

        let rebuilt = dec.residual.broadcast_add(&dec.speaker_avg).unwrap();
        assert!(max_abs(&(rebuilt - &dec.speaker).unwrap()) < 1e-5);
        assert_eq!(dec.speaker_avg.dims3().unwrap(), (2, 6, 1));
    }

    #[test]
    fn test_residual_has_zero_mean() {
        let device = Device::Cpu;
        let c = Tensor::randn(0f32, 1.0, (1, 4, 20), &device).unwrap();
        let q = Tensor::zeros((1, 20, 4), candle_core::DType::F32, &device).unwrap();
        let dec = Decomposition::new(&c, &q, AxisOrder::ChannelsFirst).unwrap();
        let mean = dec.residual.mean_keepdim(2).unwrap();
        assert!(max_abs(&mean) < 1e-5);
    }

    #[test]
    fn test_unalignable_shapes_fail() {
        let device = Device::Cpu;
        let c = Tensor::zeros((2, 6, 9), candle_core::DType::F32, &device).unwrap();
        let q = Tensor::zeros((2, 6, 8), candle_core::DType::F32, &device).unwrap();
        let err = Decomposition::new(&c, &q, AxisOrder::ChannelsFirst).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VcError>(),
            Some(VcError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_slice_keeps_alignment() {
        let device = Device::Cpu;
        let c = Tensor::arange(0f32, 40.0, &device)
            .unwrap()
            .reshape((2, 2, 10))
            .unwrap();
        let q = (&c * 0.5).unwrap().transpose(1, 2).unwrap();
        let dec = Decomposition::new(&c, &q, AxisOrder::ChannelsFirst).unwrap();
        let seg = dec.slice(&[3, 6], 4).unwrap();

        let content: Vec<Vec<Vec<f32>>> = seg.content.to_vec3().unwrap();
        let speaker: Vec<Vec<Vec<f32>>> = seg.speaker.to_vec3().unwrap();
        assert_eq!(content[0][0], vec![1.5, 2.0, 2.5, 3.0]);
        assert_eq!(speaker[0][0], vec![1.5, 2.0, 2.5, 3.0]);
        assert_eq!(content[1][1], vec![18.0, 18.5, 19.0, 19.5]);
    }

    #[test]
    fn test_with_speaker_of_transplants_average() {
        let device = Device::Cpu;
        let src_c = Tensor::randn(0f32, 1.0, (1, 3, 12), &device).unwrap();
        let tgt_c = (Tensor::randn(0f32, 1.0, (1, 3, 7), &device).unwrap() + 5.0).unwrap();
        let zeros_src = Tensor::zeros((1, 12, 3), candle_core::DType::F32, &device).unwrap();
        let zeros_tgt = Tensor::zeros((1, 7, 3), candle_core::DType::F32, &device).unwrap();

        let src = Decomposition::new(&src_c, &zeros_src, AxisOrder::ChannelsFirst).unwrap();
        let tgt = Decomposition::new(&tgt_c, &zeros_tgt, AxisOrder::ChannelsFirst).unwrap();
        let mixed = src.with_speaker_of(&tgt).unwrap();

        assert!(max_abs(&(&mixed.speaker_avg - &tgt.speaker_avg).unwrap()) < 1e-6);
        assert!(max_abs(&(&mixed.residual - &src.residual).unwrap()) < 1e-6);
        assert!(max_abs(&(&mixed.content - &src.content).unwrap()) < 1e-6);
        assert_eq!(mixed.frames().unwrap(), 12);
    }

    #[test]
    fn test_square_input_follows_quantizer_layout() {
        // frames == embedding width, so shapes alone cannot tell the layout apart
        let device = Device::Cpu;
        let codebook = Tensor::cat(
            &[
                Tensor::zeros((1, 4), candle_core::DType::F32, &device).unwrap(),
                Tensor::full(10f32, (1, 4), &device).unwrap(),
            ],
            0,
        )
        .unwrap();
        let config = crate::config::QuantizerConfig {
            update: crate::config::CodebookUpdate::Frozen,
            ..Default::default()
        };
        let vq = crate::models::VectorQuantizer::from_embedding(codebook, &config).unwrap();

        // (1, D=4, T=4): frames 0-1 near the 10s row, frames 2-3 near the zero row
        let c = Tensor::new(
            &[[
                [9.5f32, 9.5, 0.5, 0.5],
                [9.5, 9.5, 0.5, 0.5],
                [9.5, 9.5, 0.5, 0.5],
                [9.5, 9.5, 0.5, 0.5],
            ]],
            &device,
        )
        .unwrap();
        let out = vq.forward(&c, None).unwrap();
        assert_eq!(out.indices, vec![1, 1, 0, 0]);
        assert_eq!(out.input_order, AxisOrder::ChannelsFirst);

        let dec = Decomposition::new(&c, &out.quantized, out.input_order).unwrap();
        let content = dec.content.to_vec3::<f32>().unwrap();
        for row in &content[0] {
            assert_eq!(row, &vec![10.0, 10.0, 0.0, 0.0]);
        }
        let rebuilt = (&dec.content + &dec.speaker).unwrap();
        assert!(max_abs(&(rebuilt - &c).unwrap()) < 1e-6);
    }

    #[test]
    fn test_channels_last_input_is_returned_channels_first() {
        let device = Device::Cpu;
        let c = Tensor::randn(0f32, 1.0, (2, 9, 6), &device).unwrap();
        let q = Tensor::randn(0f32, 1.0, (2, 9, 6), &device).unwrap();
        let dec = Decomposition::new(&c, &q, AxisOrder::ChannelsLast).unwrap();
        assert_eq!(dec.content.dims3().unwrap(), (2, 6, 9));
        assert_eq!(dec.speaker_avg.dims3().unwrap(), (2, 6, 1));
        let recombined = (&dec.content + &dec.speaker).unwrap();
        let c_first = c.transpose(1, 2).unwrap();
        assert!(max_abs(&(recombined - &c_first).unwrap()) < 1e-6);
    }
}
