//! # vqvc
//!
//! Voice conversion over precomputed self-supervised content embeddings,
//! implemented with Candle.
//!
//! ## Features
//!
//! - Vector-quantized content bottleneck with EMA codebook updates
//! - Speaker information recovered from the quantization residual
//! - HiFi-GAN style generator with weight normalization
//! - Scale and period discriminators with least-squares GAN losses
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vqvc::VoiceConverter;
//!
//! let vc = VoiceConverter::new("checkpoints/run1")?;
//! let audio = vc.convert("source.npy", "target.npy")?;
//! audio.save("converted.wav")?;
//! ```

// Require docs for public items, but not struct fields (too verbose)
#![warn(missing_docs)]
#![allow(rustdoc::missing_crate_level_docs)]

pub mod audio;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod inference;
pub mod losses;
pub mod models;
pub mod nn;
pub mod training;
pub mod utils;

// Re-exports for convenience
pub use checkpoint::{CheckpointDiagnostics, ComponentReport};
pub use config::ModelConfig;
pub use error::VcError;
pub use inference::VoiceConverter;
pub use models::{Synthesizer, VectorQuantizer};
pub use training::GanTrainer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sample rate for input and output audio (16000 Hz)
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;
