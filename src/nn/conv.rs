//! Normalized convolution layers
//!
//! The generator uses weight normalization for its upsampling and residual
//! convolutions; the discriminators use either weight normalization or
//! spectral normalization. Kernels follow the PyTorch layouts so that
//! checkpoints keep the familiar `weight_g` / `weight_v` / `weight_orig` names:
//!
//! - Conv1d: (out_channels, in_channels / groups, kernel_size)
//! - ConvTranspose1d: (in_channels, out_channels, kernel_size)

use anyhow::{ensure, Result};
use candle_core::{DType, Tensor, Var};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::utils::tensor_utils::l2_normalize;

/// Weight reparameterization applied to a convolution kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reparam {
    /// Raw kernel.
    None,
    /// W = g * (v / ||v||), norm taken per output slice (dim 0).
    #[default]
    WeightNorm,
    /// W = W_orig / sigma(W_orig), sigma estimated by power iteration.
    SpectralNorm,
}

/// Initial distribution for a freshly created kernel.
#[derive(Debug, Clone, Copy)]
pub enum KernelInit {
    /// N(0, std)
    Normal(f64),
    /// U(-b, b) with b = 1 / sqrt(fan_in)
    FanIn,
}

impl KernelInit {
    fn init(&self, fan_in: usize) -> Init {
        match *self {
            KernelInit::Normal(stdev) => Init::Randn { mean: 0.0, stdev },
            KernelInit::FanIn => {
                let bound = 1.0 / (fan_in as f64).sqrt();
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
        }
    }

    /// Expected L2 norm of one kernel slice with `fan` elements.
    fn expected_norm(&self, fan: usize) -> f64 {
        match *self {
            KernelInit::Normal(stdev) => stdev * (fan as f64).sqrt(),
            KernelInit::FanIn => (1.0f64 / 3.0).sqrt(),
        }
    }
}

/// Convolution hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSpec {
    /// Zero padding on both sides
    pub padding: usize,
    /// Stride
    pub stride: usize,
    /// Dilation
    pub dilation: usize,
    /// Channel groups
    pub groups: usize,
}

impl Default for ConvSpec {
    fn default() -> Self {
        Self {
            padding: 0,
            stride: 1,
            dilation: 1,
            groups: 1,
        }
    }
}

impl ConvSpec {
    /// Spec from padding, stride, dilation and groups
    pub fn new(padding: usize, stride: usize, dilation: usize, groups: usize) -> Self {
        Self {
            padding,
            stride,
            dilation,
            groups,
        }
    }

    /// Stride-1 convolution with explicit padding and dilation
    pub fn dilated(padding: usize, dilation: usize) -> Self {
        Self {
            padding,
            dilation,
            ..Self::default()
        }
    }
}

enum KernelParam {
    Plain(Tensor),
    WeightNorm { weight_g: Tensor, weight_v: Tensor },
    SpectralNorm { weight_orig: Tensor, u: Var },
}

/// A 3-D convolution kernel together with its reparameterization.
pub struct Kernel {
    param: KernelParam,
}

impl Kernel {
    /// Fetch (or create) the kernel variables under `vb`.
    pub fn new(
        shape: (usize, usize, usize),
        reparam: Reparam,
        init: KernelInit,
        fan_in: usize,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let (d0, d1, d2) = shape;
        let param = match reparam {
            Reparam::None => KernelParam::Plain(vb.get_with_hints(shape, "weight", init.init(fan_in))?),
            Reparam::WeightNorm => {
                let weight_v = vb.get_with_hints(shape, "weight_v", init.init(fan_in))?;
                let weight_g = vb.get_with_hints(
                    (d0, 1, 1),
                    "weight_g",
                    Init::Const(init.expected_norm(d1 * d2)),
                )?;
                KernelParam::WeightNorm { weight_g, weight_v }
            }
            Reparam::SpectralNorm => {
                let weight_orig = vb.get_with_hints(shape, "weight_orig", init.init(fan_in))?;
                let u0 = Tensor::randn(0f32, 1.0, (d0, 1), vb.device())?.to_dtype(vb.dtype())?;
                let u = Var::from_tensor(&l2_normalize(&u0)?)?;
                KernelParam::SpectralNorm { weight_orig, u }
            }
        };
        Ok(Self { param })
    }

    /// Effective kernel used by the convolution.
    pub fn weight(&self) -> Result<Tensor> {
        match &self.param {
            KernelParam::Plain(w) => Ok(w.clone()),
            KernelParam::WeightNorm { weight_g, weight_v } => {
                let norm = norm_except_dim0(weight_v)?;
                weight_v
                    .broadcast_div(&norm)?
                    .broadcast_mul(weight_g)
                    .map_err(Into::into)
            }
            KernelParam::SpectralNorm { weight_orig, u } => spectral_normalize(weight_orig, u),
        }
    }

    /// Whether the kernel is still in the weight-normalized parameterization
    pub fn is_weight_normalized(&self) -> bool {
        matches!(self.param, KernelParam::WeightNorm { .. })
    }

    /// Fold g * v / ||v|| into a raw kernel. Returns false if nothing changed.
    pub fn remove_weight_norm(&mut self) -> Result<bool> {
        if !self.is_weight_normalized() {
            return Ok(false);
        }
        let folded = self.weight()?.detach();
        self.param = KernelParam::Plain(folded);
        Ok(true)
    }
}

/// ||v|| over every axis except the first, shaped (d0, 1, 1).
fn norm_except_dim0(v: &Tensor) -> Result<Tensor> {
    v.sqr()?
        .sum_keepdim(2)?
        .sum_keepdim(1)?
        .sqrt()
        .map_err(Into::into)
}

/// One power iteration, then divide the kernel by its spectral norm.
fn spectral_normalize(weight: &Tensor, u: &Var) -> Result<Tensor> {
    let d0 = weight.dim(0)?;
    let rest = weight.elem_count() / d0;

    let w_mat = weight.reshape((d0, rest))?;
    let w_frozen = w_mat.detach();
    let v = l2_normalize(&w_frozen.t()?.matmul(u.as_tensor())?)?;
    let u_next = l2_normalize(&w_frozen.matmul(&v)?)?;
    u.set(&u_next)?;

    let sigma = u_next.t()?.matmul(&w_mat.matmul(&v)?)?;
    weight
        .broadcast_div(&sigma.reshape((1, 1, 1))?)
        .map_err(Into::into)
}

fn add_channel_bias(x: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    match bias {
        Some(bias) => {
            let bias = bias.unsqueeze(0)?.unsqueeze(2)?;
            x.broadcast_add(&bias).map_err(Into::into)
        }
        None => Ok(x.clone()),
    }
}

/// 1D convolution with a reparameterized kernel
pub struct NormConv1d {
    kernel: Kernel,
    bias: Option<Tensor>,
    spec: ConvSpec,
    in_channels: usize,
}

impl NormConv1d {
    /// Create a Conv1d whose variables live under `vb`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        spec: ConvSpec,
        bias: bool,
        reparam: Reparam,
        init: KernelInit,
        vb: VarBuilder,
    ) -> Result<Self> {
        ensure!(
            in_channels % spec.groups == 0 && out_channels % spec.groups == 0,
            "channels {}->{} not divisible by {} groups",
            in_channels,
            out_channels,
            spec.groups
        );
        let fan_in = in_channels / spec.groups * kernel_size;
        let kernel = Kernel::new(
            (out_channels, in_channels / spec.groups, kernel_size),
            reparam,
            init,
            fan_in,
            &vb,
        )?;
        let bias = if bias {
            Some(vb.get_with_hints(out_channels, "bias", KernelInit::FanIn.init(fan_in))?)
        } else {
            None
        };

        Ok(Self {
            kernel,
            bias,
            spec,
            in_channels,
        })
    }

    /// Forward pass: (batch, in_channels, length) -> (batch, out_channels, length')
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let channels = x.dim(1)?;
        ensure!(
            channels == self.in_channels,
            "conv expects {} input channels, got {}",
            self.in_channels,
            channels
        );
        let weight = self.kernel.weight()?;
        let y = x.conv1d(
            &weight,
            self.spec.padding,
            self.spec.stride,
            self.spec.dilation,
            self.spec.groups,
        )?;
        add_channel_bias(&y, self.bias.as_ref())
    }

    /// Fold the weight norm into a plain kernel; true if anything changed
    pub fn remove_weight_norm(&mut self) -> Result<bool> {
        self.kernel.remove_weight_norm()
    }

    /// Whether the kernel is still weight-normalized
    pub fn is_weight_normalized(&self) -> bool {
        self.kernel.is_weight_normalized()
    }
}

/// Transposed 1D convolution for upsampling.
///
/// Candle has no backward pass for `conv_transpose1d`, so the layer is
/// computed as zero insertion followed by a stride-1 convolution with the
/// flipped kernel, which keeps the whole path differentiable.
pub struct NormConvTranspose1d {
    kernel: Kernel,
    bias: Option<Tensor>,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    in_channels: usize,
    out_channels: usize,
}

impl NormConvTranspose1d {
    /// Transposed convolution with the given reparameterization
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        reparam: Reparam,
        init: KernelInit,
        vb: VarBuilder,
    ) -> Result<Self> {
        ensure!(
            padding <= kernel_size - 1,
            "padding {} too large for kernel {}",
            padding,
            kernel_size
        );
        let fan_in = out_channels * kernel_size;
        let kernel = Kernel::new(
            (in_channels, out_channels, kernel_size),
            reparam,
            init,
            fan_in,
            &vb,
        )?;
        let bias = Some(vb.get_with_hints(out_channels, "bias", KernelInit::FanIn.init(fan_in))?);

        Ok(Self {
            kernel,
            bias,
            kernel_size,
            stride,
            padding,
            in_channels,
            out_channels,
        })
    }

    /// Output length for an input of `length` frames.
    pub fn output_len(&self, length: usize) -> usize {
        (length - 1) * self.stride + self.kernel_size - 2 * self.padding
    }

    /// Forward pass: (batch, in_channels, length) -> (batch, out_channels, output_len)
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, channels, length) = x.dims3()?;

        // (in, out, k) -> (out, in, k), reversed along k
        let weight = self.kernel.weight()?.transpose(0, 1)?.contiguous()?;
        let reversed: Vec<u32> = (0..self.kernel_size as u32).rev().collect();
        let reversed = Tensor::from_vec(reversed, self.kernel_size, x.device())?;
        let weight = weight.index_select(&reversed, 2)?;

        let x = if self.stride > 1 {
            let zeros = Tensor::zeros(
                (batch, channels, length, self.stride - 1),
                x.dtype(),
                x.device(),
            )?;
            Tensor::cat(&[&x.unsqueeze(3)?, &zeros], 3)?
                .reshape((batch, channels, length * self.stride))?
                .narrow(2, 0, (length - 1) * self.stride + 1)?
        } else {
            x.clone()
        };

        let y = x.conv1d(&weight, self.kernel_size - 1 - self.padding, 1, 1, 1)?;
        add_channel_bias(&y, self.bias.as_ref())
    }

    /// Fold the weight norm into a plain kernel; true if anything changed
    pub fn remove_weight_norm(&mut self) -> Result<bool> {
        let changed = self.kernel.remove_weight_norm()?;
        if changed {
            debug!(
                "folded weight norm of ConvTranspose1d {}->{}",
                self.in_channels, self.out_channels
            );
        }
        Ok(changed)
    }

    /// Whether the kernel is still weight-normalized
    pub fn is_weight_normalized(&self) -> bool {
        self.kernel.is_weight_normalized()
    }

    /// Upsampling factor
    pub fn stride(&self) -> usize {
        self.stride
    }
}

/// Zero-initialized scalar in the dtype of `like`
pub fn zero_scalar(like: &Tensor) -> Result<Tensor> {
    Tensor::zeros((), DType::F32, like.device())?
        .to_dtype(like.dtype())
        .map_err(Into::into)
}
