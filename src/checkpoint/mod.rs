//! Checkpoint and tensor file I/O
//!
//! - Single tensors from `.npy` or `.safetensors` files (content embeddings,
//!   codebook centroids)
//! - Key diagnostics for `VarMap` checkpoints, so a renamed or missing
//!   tensor is reported by name before loading fails

mod diagnostics;
mod tensor_file;

pub use diagnostics::{CheckpointDiagnostics, ComponentReport};
pub use tensor_file::{load_tensor, load_tensor_map, save_tensor_map, TensorFormat};

/// Generator weights inside a checkpoint directory
pub const GENERATOR_FILE: &str = "generator.safetensors";
/// Discriminator weights inside a checkpoint directory
pub const DISCRIMINATOR_FILE: &str = "discriminator.safetensors";
/// Standalone codebook inside a checkpoint directory
pub const CODEBOOK_FILE: &str = "codebook.safetensors";
/// Optimizer step, epoch and learning rate
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
/// Copy of the model configuration
pub const CONFIG_FILE: &str = "config.yaml";
