//! Neural network layers shared by the generator and the discriminators
//!
//! - Weight-normalized / spectral-normalized convolutions
//! - Differentiable transposed convolution for upsampling

mod conv;

pub use conv::{
    zero_scalar, ConvSpec, Kernel, KernelInit, NormConv1d, NormConvTranspose1d, Reparam,
};
