//! Conversion pipeline
//!
//! Loads a trained checkpoint directory and turns content embeddings into
//! waveforms:
//! 1. Read the embedding file(s) and bring them to (1, ssl_dim, frames)
//! 2. Quantize and split into content and speaker parts
//! 3. Optionally take the global speaker of a target utterance
//! 4. Run the generator and return the samples

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use std::path::Path;
use tracing::info;

use crate::audio::AudioOutput;
use crate::checkpoint::{load_tensor, CONFIG_FILE};
use crate::config::ModelConfig;
use crate::models::Synthesizer;
use crate::training::data::normalize_embedding;
use crate::utils::tensor_utils::to_vec_f32;

/// Runtime options for the converter
#[derive(Debug, Clone, Default)]
pub struct InferenceConfig {
    /// Whether to use GPU
    pub use_gpu: bool,
    /// Codebook file overriding the checkpoint's codebook
    pub codebook: Option<std::path::PathBuf>,
}

/// Result of a conversion
pub struct InferenceResult {
    /// Generated audio samples
    pub audio: Vec<f32>,
    /// Sample rate
    pub sample_rate: u32,
    /// Content frames that produced the audio
    pub frames: usize,
}

impl InferenceResult {
    /// Save audio to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        AudioOutput::save(&self.audio, self.sample_rate, path)
    }

    /// Get duration in seconds
    pub fn duration(&self) -> f32 {
        self.audio.len() as f32 / self.sample_rate as f32
    }
}

/// Inference-only wrapper around a trained synthesizer
pub struct VoiceConverter {
    device: Device,
    synth: Synthesizer,
}

impl VoiceConverter {
    /// Load `config.yaml` and the weights from a checkpoint directory
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P) -> Result<Self> {
        Self::with_config(checkpoint_dir, InferenceConfig::default())
    }

    /// Create with custom inference config
    pub fn with_config<P: AsRef<Path>>(
        checkpoint_dir: P,
        inference_config: InferenceConfig,
    ) -> Result<Self> {
        let dir = checkpoint_dir.as_ref();
        let config = ModelConfig::load(dir.join(CONFIG_FILE))
            .with_context(|| format!("No usable {} in {:?}", CONFIG_FILE, dir))?;

        let device = if inference_config.use_gpu {
            Device::cuda_if_available(0)?
        } else {
            Device::Cpu
        };

        let mut synth = Synthesizer::load(&config, dir, &device)?;
        if let Some(codebook) = &inference_config.codebook {
            synth.replace_codebook(codebook)?;
        }
        Self::from_synthesizer(synth)
    }

    /// Wrap an in-memory synthesizer, folding its weight normalization
    pub fn from_synthesizer(mut synth: Synthesizer) -> Result<Self> {
        synth.remove_weight_norm()?;
        info!(
            "Voice converter ready: {} Hz, hop {}, codebook {}",
            synth.config().data.sampling_rate,
            synth.hop_length(),
            synth.quantizer().num_embeddings()
        );
        Ok(Self {
            device: synth.device().clone(),
            synth,
        })
    }

    /// Read an embedding file as a (1, ssl_dim, frames) tensor
    pub fn load_embedding<P: AsRef<Path>>(&self, path: P) -> Result<Tensor> {
        let path = path.as_ref();
        let raw = load_tensor(path, None, &self.device)?;
        let embedding = normalize_embedding(raw, self.synth.config().model.ssl_dim)
            .with_context(|| format!("Bad embedding {:?}", path))?;
        if embedding.dim(1)? == 0 {
            bail!("{:?} has no frames", path);
        }
        embedding.unsqueeze(0).map_err(Into::into)
    }

    /// Resynthesize an utterance with its own speaker
    pub fn reconstruct<P: AsRef<Path>>(&self, source: P) -> Result<InferenceResult> {
        let c = self.load_embedding(source)?;
        let waveform = self.synth.infer(&c)?;
        self.finish(&c, &waveform)
    }

    /// Speak `source`'s content with `target`'s global speaker
    pub fn convert<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        source: P,
        target: Q,
    ) -> Result<InferenceResult> {
        let src = self.load_embedding(source)?;
        let tgt = self.load_embedding(target)?;
        self.convert_tensors(&src, &tgt)
    }

    /// Conversion on in-memory (1, ssl_dim, frames) embeddings
    pub fn convert_tensors(&self, source: &Tensor, target: &Tensor) -> Result<InferenceResult> {
        let waveform = self.synth.convert(source, target)?;
        self.finish(source, &waveform)
    }

    fn finish(&self, content: &Tensor, waveform: &Tensor) -> Result<InferenceResult> {
        let audio = to_vec_f32(waveform)?;
        let result = InferenceResult {
            audio,
            sample_rate: self.sample_rate(),
            frames: content.dim(2)?,
        };
        info!(
            "Generated {:.2}s of audio from {} frames",
            result.duration(),
            result.frames
        );
        Ok(result)
    }

    /// Device the model runs on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Output sample rate
    pub fn sample_rate(&self) -> u32 {
        self.synth.config().data.sampling_rate
    }

    /// Underlying synthesizer
    pub fn synthesizer(&self) -> &Synthesizer {
        &self.synth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;

    fn tiny_config() -> ModelConfig {
        let mut config = ModelConfig::default();
        config.data.hop_length = 16;
        config.model = NetConfig {
            ssl_dim: 12,
            inter_channels: 12,
            gin_channels: 12,
            codebook_size: 6,
            upsample_rates: vec![4, 4],
            upsample_kernel_sizes: vec![8, 8],
            upsample_initial_channel: 32,
            resblock_kernel_sizes: vec![3],
            resblock_dilation_sizes: vec![vec![1, 3]],
            ..NetConfig::default()
        };
        config
    }

    #[test]
    fn test_inference_result_duration() {
        let result = InferenceResult {
            audio: vec![0.0; 8000],
            sample_rate: 16000,
            frames: 25,
        };
        assert!((result.duration() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_convert_from_checkpoint_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config();
        let synth = Synthesizer::new(&config, &Device::Cpu).unwrap();
        synth.save(dir.path()).unwrap();
        config.save(dir.path().join(CONFIG_FILE)).unwrap();

        // (frames, ssl_dim) layout as written by common feature extractors
        Tensor::randn(0f32, 1.0, (9, 12), &Device::Cpu)
            .unwrap()
            .write_npy(dir.path().join("src.npy"))
            .unwrap();
        Tensor::randn(0f32, 1.0, (1, 12, 5), &Device::Cpu)
            .unwrap()
            .write_npy(dir.path().join("tgt.npy"))
            .unwrap();

        let converter = VoiceConverter::new(dir.path()).unwrap();
        assert!(!converter.synthesizer().generator().is_weight_normalized());

        let converted = converter
            .convert(dir.path().join("src.npy"), dir.path().join("tgt.npy"))
            .unwrap();
        assert_eq!(converted.audio.len(), 9 * 16);
        assert_eq!(converted.frames, 9);
        assert!(converted.audio.iter().all(|s| s.is_finite()));

        let recon = converter.reconstruct(dir.path().join("tgt.npy")).unwrap();
        assert_eq!(recon.audio.len(), 5 * 16);

        let out = dir.path().join("out.wav");
        converted.save(&out).unwrap();
        assert!(out.exists());
    }

    #[test]
    fn test_wrong_embedding_width_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Synthesizer::new(&tiny_config(), &Device::Cpu).unwrap();
        let converter = VoiceConverter::from_synthesizer(synth).unwrap();
        Tensor::zeros((7, 5), candle_core::DType::F32, &Device::Cpu)
            .unwrap()
            .write_npy(dir.path().join("bad.npy"))
            .unwrap();
        assert!(converter.load_embedding(dir.path().join("bad.npy")).is_err());
    }
}
