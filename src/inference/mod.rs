//! Inference entry point
//!
//! - VoiceConverter: checkpoint loading and embedding-to-waveform conversion
//! - InferenceConfig: runtime options

mod pipeline;

pub use pipeline::{InferenceConfig, InferenceResult, VoiceConverter};
