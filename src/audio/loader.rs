//! Audio file loading

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use std::path::Path;

/// WAV loader for training targets
pub struct AudioLoader;

impl AudioLoader {
    /// Load a WAV file as mono samples in [-1, 1]
    ///
    /// The file must already be at `expected_sr`; resampling belongs to the
    /// data preparation step.
    pub fn load<P: AsRef<Path>>(path: P, expected_sr: u32) -> Result<Vec<f32>> {
        let path = path.as_ref();
        if !path.extension().is_some_and(|e| e == "wav") {
            bail!("Unsupported audio format: {:?}", path);
        }

        let reader = hound::WavReader::open(path)
            .with_context(|| format!("Failed to open WAV file {:?}", path))?;
        let spec = reader.spec();
        if spec.sample_rate != expected_sr {
            bail!(
                "{:?} is sampled at {} Hz, expected {} Hz",
                path,
                spec.sample_rate,
                expected_sr
            );
        }

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .with_context(|| format!("Failed to decode {:?}", path))?,
            hound::SampleFormat::Int => {
                let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / max_value))
                    .collect::<Result<_, _>>()
                    .with_context(|| format!("Failed to decode {:?}", path))?
            }
        };

        // Convert to mono if stereo
        let mono = if spec.channels > 1 {
            samples
                .chunks(spec.channels as usize)
                .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
                .collect()
        } else {
            samples
        };

        Ok(normalize_peak(mono))
    }

    /// Load a WAV file as a (1, 1, samples) tensor
    pub fn load_tensor<P: AsRef<Path>>(path: P, expected_sr: u32, device: &Device) -> Result<Tensor> {
        let samples = Self::load(path, expected_sr)?;
        let len = samples.len();
        Tensor::from_vec(samples, (1, 1, len), device).map_err(Into::into)
    }
}

/// Scale down float audio that exceeds [-1, 1]
fn normalize_peak(mut samples: Vec<f32>) -> Vec<f32> {
    let peak = samples.iter().fold(0f32, |m, s| m.max(s.abs()));
    if peak > 1.0 {
        for s in samples.iter_mut() {
            *s /= peak;
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_load_int16_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 16000, 2, &[16384, 0, -16384, -16384]);

        let samples = AudioLoader::load(&path, 16000).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.25).abs() < 1e-4);
        assert!((samples[1] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_sample_rate_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("low.wav");
        write_wav(&path, 8000, 1, &[0, 1, 2]);
        assert!(AudioLoader::load(&path, 16000).is_err());
    }

    #[test]
    fn test_normalize_peak() {
        assert_eq!(normalize_peak(vec![0.5, -0.25]), vec![0.5, -0.25]);
        assert_eq!(normalize_peak(vec![2.0, -1.0]), vec![1.0, -0.5]);
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(AudioLoader::load("clip.mp3", 16000).is_err());
    }
}
