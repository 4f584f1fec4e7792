//! Audio I/O
//!
//! - WAV loading (mono downmix, sample-rate check, clip-safe scaling)
//! - WAV writing of generated waveforms

mod loader;
mod output;

pub use loader::AudioLoader;
pub use output::AudioOutput;
