//! Audio output

use anyhow::{bail, Context, Result};
use candle_core::Tensor;
use std::path::Path;

use crate::utils::tensor_utils::to_vec_f32;

/// WAV writer for generated audio
pub struct AudioOutput;

impl AudioOutput {
    /// Save samples in [-1, 1] as a 16-bit mono WAV file
    pub fn save<P: AsRef<Path>>(samples: &[f32], sample_rate: u32, path: P) -> Result<()> {
        let path = path.as_ref();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(path, spec)
            .with_context(|| format!("Failed to create WAV file {:?}", path))?;
        for &sample in samples {
            let scaled = (sample * 32767.0).clamp(-32767.0, 32767.0) as i16;
            writer.write_sample(scaled)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Save a single waveform tensor of shape (1, 1, samples) or (samples,)
    pub fn save_tensor<P: AsRef<Path>>(waveform: &Tensor, sample_rate: u32, path: P) -> Result<()> {
        if waveform.dims().iter().filter(|&&d| d != 1).count() > 1 {
            bail!("expected a single waveform, got shape {:?}", waveform.dims());
        }
        Self::save(&to_vec_f32(waveform)?, sample_rate, path)
    }
}
