//! Neural network models for voice conversion
//!
//! This module contains all the model components:
//! - Vector-quantization codebook
//! - Content/speaker decomposition
//! - HiFi-GAN style generator
//! - Scale and period discriminators
//! - Synthesizer tying codebook and generator together

pub mod decomposer;
pub mod discriminator;
pub mod generator;
pub mod quantizer;
pub mod synthesizer;

// Re-exports
pub use decomposer::{align_to_input, Decomposition};
pub use discriminator::{
    Discriminator, DiscriminatorOutput, EnsembleOutput, MultiPeriodDiscriminator,
    PeriodDiscriminator, ScaleDiscriminator,
};
pub use generator::{Generator, LRELU_SLOPE, RES_CHANNELS};
pub use quantizer::{AxisOrder, VectorQuantizer, VqOutput};
pub use synthesizer::{Synthesizer, TrainOutput};
