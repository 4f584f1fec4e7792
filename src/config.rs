//! Model and training configuration
//!
//! Loaded from a YAML file with `ModelConfig::load`. Every field has a
//! default so a partial file (or none at all) yields a usable setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::VcError;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelConfig {
    /// Audio and filelist settings
    #[serde(default)]
    pub data: DataConfig,
    /// Network sizes
    #[serde(default)]
    pub model: NetConfig,
    /// Codebook loss weights and update rule
    #[serde(default)]
    pub quantizer: QuantizerConfig,
    /// Optimizer and schedule
    #[serde(default)]
    pub train: TrainConfig,
}

/// Audio and filelist settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Waveform sampling rate in Hz
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,
    /// Waveform samples per content-embedding frame
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
    /// Training filelist: one `wav_path|embedding_path` pair per line
    #[serde(default)]
    pub training_files: Option<PathBuf>,
    /// Validation filelist, same format
    #[serde(default)]
    pub validation_files: Option<PathBuf>,
}

/// Residual block flavour used after every upsampling stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ResBlockKind {
    /// Dilated + undilated convolution pairs
    #[default]
    #[serde(rename = "1")]
    One,
    /// Single dilated convolutions
    #[serde(rename = "2")]
    Two,
}

/// Network architecture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Channels of the external content embedding (e.g. WavLM: 1024)
    #[serde(default = "default_ssl_dim")]
    pub ssl_dim: usize,
    /// Channels of the generator input (the quantized content code)
    #[serde(default = "default_ssl_dim")]
    pub inter_channels: usize,
    /// Channels of the speaker conditioning; 0 disables conditioning
    #[serde(default = "default_ssl_dim")]
    pub gin_channels: usize,
    /// Number of codebook entries
    #[serde(default = "default_codebook_size")]
    pub codebook_size: usize,
    /// Precomputed codebook (`.npy` centroids or `.safetensors`)
    #[serde(default)]
    pub codebook_path: Option<PathBuf>,
    /// Residual block variant
    #[serde(default)]
    pub resblock: ResBlockKind,
    /// Kernel size of each parallel residual block
    #[serde(default = "default_resblock_kernel_sizes")]
    pub resblock_kernel_sizes: Vec<usize>,
    /// Dilations per residual block
    #[serde(default = "default_resblock_dilation_sizes")]
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    /// Product must equal `data.hop_length`
    #[serde(default = "default_upsample_rates")]
    pub upsample_rates: Vec<usize>,
    /// Channels entering the first upsampling layer
    #[serde(default = "default_upsample_initial_channel")]
    pub upsample_initial_channel: usize,
    /// Kernel size per upsampling layer
    #[serde(default = "default_upsample_kernel_sizes")]
    pub upsample_kernel_sizes: Vec<usize>,
    /// Spectral instead of weight normalization in the discriminators
    #[serde(default)]
    pub use_spectral_norm: bool,
    /// Periods of the period discriminators
    #[serde(default = "default_periods")]
    pub periods: Vec<usize>,
}

/// Codebook update rule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CodebookUpdate {
    /// Exponential moving average of the assigned inputs
    Ema {
        #[serde(default = "default_ema_decay")]
        decay: f64,
        #[serde(default = "default_ema_epsilon")]
        epsilon: f64,
    },
    /// Codebook rows are trained by the codebook loss gradient
    Gradient,
    /// Assignment only; the codebook never changes
    Frozen,
}

impl Default for CodebookUpdate {
    fn default() -> Self {
        CodebookUpdate::Ema {
            decay: default_ema_decay(),
            epsilon: default_ema_epsilon(),
        }
    }
}

/// Vector-quantization loss weights and update rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizerConfig {
    /// Weight of the commitment term
    #[serde(default = "default_commitment_lambda")]
    pub commitment_lambda: f64,
    /// 0 disables the codebook loss term entirely
    #[serde(default = "default_codebook_lambda")]
    pub codebook_lambda: f64,
    /// How codebook rows change during training
    #[serde(default)]
    pub update: CodebookUpdate,
}

/// Optimizer and schedule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Initial learning rate of both optimizers
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// AdamW betas
    #[serde(default = "default_betas")]
    pub betas: [f64; 2],
    /// AdamW epsilon
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// AdamW weight decay
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Per-epoch multiplicative learning-rate decay
    #[serde(default = "default_lr_decay")]
    pub lr_decay: f64,
    /// Seed for segment sampling and batch order
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Utterances per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Training segment length in content frames
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,
    /// Feature-matching loss weight
    #[serde(default = "default_loss_weight")]
    pub c_fm: f64,
    /// Weight of the VQ terms in the generator loss
    #[serde(default = "default_loss_weight")]
    pub c_commit: f64,
    /// Steps between progress logs
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
}

fn default_sampling_rate() -> u32 {
    16000
}
fn default_hop_length() -> usize {
    320
}
fn default_ssl_dim() -> usize {
    1024
}
fn default_codebook_size() -> usize {
    128
}
fn default_resblock_kernel_sizes() -> Vec<usize> {
    vec![3, 7, 11]
}
fn default_resblock_dilation_sizes() -> Vec<Vec<usize>> {
    vec![vec![1, 3, 5], vec![1, 3, 5], vec![1, 3, 5]]
}
fn default_upsample_rates() -> Vec<usize> {
    vec![10, 8, 2, 2]
}
fn default_upsample_initial_channel() -> usize {
    512
}
fn default_upsample_kernel_sizes() -> Vec<usize> {
    vec![16, 16, 4, 4]
}
fn default_periods() -> Vec<usize> {
    vec![2, 3, 5, 7, 11]
}
fn default_ema_decay() -> f64 {
    0.999
}
fn default_ema_epsilon() -> f64 {
    1e-5
}
fn default_commitment_lambda() -> f64 {
    0.25
}
fn default_codebook_lambda() -> f64 {
    1.0
}
fn default_learning_rate() -> f64 {
    2e-4
}
fn default_betas() -> [f64; 2] {
    [0.8, 0.99]
}
fn default_eps() -> f64 {
    1e-9
}
fn default_weight_decay() -> f64 {
    0.01
}
fn default_lr_decay() -> f64 {
    0.999875
}
fn default_seed() -> u64 {
    1234
}
fn default_batch_size() -> usize {
    16
}
fn default_segment_size() -> usize {
    28
}
fn default_loss_weight() -> f64 {
    1.0
}
fn default_log_interval() -> usize {
    200
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            hop_length: default_hop_length(),
            training_files: None,
            validation_files: None,
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            ssl_dim: default_ssl_dim(),
            inter_channels: default_ssl_dim(),
            gin_channels: default_ssl_dim(),
            codebook_size: default_codebook_size(),
            codebook_path: None,
            resblock: ResBlockKind::One,
            resblock_kernel_sizes: default_resblock_kernel_sizes(),
            resblock_dilation_sizes: default_resblock_dilation_sizes(),
            upsample_rates: default_upsample_rates(),
            upsample_initial_channel: default_upsample_initial_channel(),
            upsample_kernel_sizes: default_upsample_kernel_sizes(),
            use_spectral_norm: false,
            periods: default_periods(),
        }
    }
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        Self {
            commitment_lambda: default_commitment_lambda(),
            codebook_lambda: default_codebook_lambda(),
            update: CodebookUpdate::default(),
        }
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            betas: default_betas(),
            eps: default_eps(),
            weight_decay: default_weight_decay(),
            lr_decay: default_lr_decay(),
            seed: default_seed(),
            batch_size: default_batch_size(),
            segment_size: default_segment_size(),
            c_fm: default_loss_weight(),
            c_commit: default_loss_weight(),
            log_interval: default_log_interval(),
        }
    }
}

impl NetConfig {
    /// Total upsampling factor of the generator
    pub fn upsample_factor(&self) -> usize {
        self.upsample_rates.iter().product()
    }

    /// Channel width before the first and after every upsampling stage
    pub fn channel_sizes(&self) -> Vec<usize> {
        let mut channels = vec![self.upsample_initial_channel];
        let mut ch = self.upsample_initial_channel;
        for _ in 0..self.upsample_rates.len() {
            ch /= 2;
            channels.push(ch);
        }
        channels
    }

    /// Whether the generator receives speaker conditioning
    pub fn is_conditioned(&self) -> bool {
        self.gin_channels != 0
    }
}

impl ModelConfig {
    /// Load and validate a YAML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: ModelConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as YAML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Check the cross-field invariants the model relies on
    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        let invalid = |msg: String| -> anyhow::Error { VcError::InvalidConfig(msg).into() };

        if m.inter_channels != m.ssl_dim {
            return Err(invalid(format!(
                "inter_channels ({}) must equal ssl_dim ({}): the generator consumes the quantized content",
                m.inter_channels, m.ssl_dim
            )));
        }
        if m.is_conditioned() && m.gin_channels != m.ssl_dim {
            return Err(invalid(format!(
                "gin_channels ({}) must equal ssl_dim ({}): the speaker embedding is C - Q",
                m.gin_channels, m.ssl_dim
            )));
        }
        if m.codebook_size == 0 {
            return Err(invalid("codebook_size must be positive".to_string()));
        }
        if m.upsample_rates.is_empty() || m.upsample_rates.len() != m.upsample_kernel_sizes.len() {
            return Err(invalid(format!(
                "{} upsample rates but {} upsample kernel sizes",
                m.upsample_rates.len(),
                m.upsample_kernel_sizes.len()
            )));
        }
        for (rate, kernel) in m.upsample_rates.iter().zip(m.upsample_kernel_sizes.iter()) {
            if *rate == 0 || kernel < rate {
                return Err(invalid(format!(
                    "upsample kernel {} must be at least its rate {}",
                    kernel, rate
                )));
            }
        }
        if m.resblock_kernel_sizes.is_empty()
            || m.resblock_kernel_sizes.len() != m.resblock_dilation_sizes.len()
        {
            return Err(invalid(format!(
                "{} resblock kernel sizes but {} dilation lists",
                m.resblock_kernel_sizes.len(),
                m.resblock_dilation_sizes.len()
            )));
        }
        let stages = m.upsample_rates.len() as u32;
        if m.upsample_initial_channel % 2usize.pow(stages) != 0 {
            return Err(invalid(format!(
                "upsample_initial_channel {} cannot be halved {} times",
                m.upsample_initial_channel, stages
            )));
        }
        if m.is_conditioned() && m.upsample_initial_channel <= crate::models::RES_CHANNELS {
            return Err(invalid(format!(
                "upsample_initial_channel {} leaves no room for the residual path",
                m.upsample_initial_channel
            )));
        }
        if m.upsample_factor() != self.data.hop_length {
            return Err(invalid(format!(
                "product of upsample rates ({}) must equal hop_length ({})",
                m.upsample_factor(),
                self.data.hop_length
            )));
        }
        if m.periods.iter().any(|&p| p == 0) {
            return Err(invalid("discriminator periods must be positive".to_string()));
        }
        if self.train.segment_size == 0 || self.train.batch_size == 0 {
            return Err(invalid("segment_size and batch_size must be positive".to_string()));
        }
        if let CodebookUpdate::Ema { decay, .. } = self.quantizer.update {
            if !(0.0..1.0).contains(&decay) {
                return Err(invalid(format!("EMA decay {} outside [0, 1)", decay)));
            }
        }
        Ok(())
    }

    /// Segment length in waveform samples
    pub fn segment_samples(&self) -> usize {
        self.train.segment_size * self.data.hop_length
    }
}
