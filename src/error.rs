//! Domain error types
//!
//! Most of the crate returns `anyhow::Result`. The variants here mark the
//! failures callers may want to tell apart with `downcast_ref`.

use thiserror::Error;

/// Errors raised by the voice-conversion core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VcError {
    /// Tensor axes that cannot be reconciled by a single transpose.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Configuration that violates a cross-field invariant.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input tensors the core cannot process (too short, empty mask, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl VcError {
    /// Build a shape mismatch from two dimension slices.
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        VcError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
