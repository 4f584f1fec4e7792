//! Discriminator ensemble
//!
//! One scale discriminator working on the raw waveform plus one period
//! discriminator per configured period. Every discriminator returns a
//! flattened score map and the activations of each layer, which feed the
//! feature-matching loss.

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::models::generator::LRELU_SLOPE;
use crate::nn::{ConvSpec, KernelInit, NormConv1d, Reparam};
use crate::utils::tensor_utils::{get_padding, leaky_relu, reflect_pad_right};

/// Output of a single discriminator
#[derive(Debug, Clone)]
pub struct DiscriminatorOutput {
    /// Score map flattened to (batch, n)
    pub score: Tensor,
    /// Activation after every layer, including the final score map
    pub feature_maps: Vec<Tensor>,
}

/// Shared "score + feature maps" capability of the ensemble members
pub trait Discriminator {
    fn forward(&self, y: &Tensor) -> Result<DiscriminatorOutput>;

    /// Short label used in logs
    fn name(&self) -> String;
}

/// Right-pad the last axis until its length is a multiple of `period`
///
/// Uses reflected samples. Inputs too short to reflect the whole pad in one
/// go are reflected repeatedly; a single sample is repeated.
pub fn pad_to_period(x: &Tensor, period: usize) -> Result<Tensor> {
    let mut x = x.clone();
    let mut len = x.dim(candle_core::D::Minus1)?;
    let mut remaining = (period - len % period) % period;
    while remaining > 0 {
        if len == 1 {
            let last = x.rank() - 1;
            let copies = vec![x.clone(); remaining + 1];
            x = Tensor::cat(&copies, last)?;
            break;
        }
        let step = remaining.min(len - 1);
        x = reflect_pad_right(&x, step)?;
        len += step;
        remaining -= step;
    }
    Ok(x)
}

/// Period discriminator
///
/// Folds the waveform into a (frames, period) grid and convolves along the
/// frame axis only. With (k, 1) kernels every column is independent, so the
/// columns are moved into the batch axis and processed by 1-D convolutions.
pub struct PeriodDiscriminator {
    period: usize,
    convs: Vec<NormConv1d>,
    conv_post: NormConv1d,
}

impl PeriodDiscriminator {
    const CHANNELS: [usize; 6] = [1, 32, 128, 512, 1024, 1024];
    const KERNEL_SIZE: usize = 5;
    const STRIDE: usize = 3;

    /// Period discriminator folding the waveform with period `period`
    pub fn new(period: usize, reparam: Reparam, vb: VarBuilder) -> Result<Self> {
        let padding = get_padding(Self::KERNEL_SIZE, 1);
        let layers = Self::CHANNELS.len() - 1;
        let convs = (0..layers)
            .map(|i| {
                let stride = if i + 1 < layers { Self::STRIDE } else { 1 };
                NormConv1d::new(
                    Self::CHANNELS[i],
                    Self::CHANNELS[i + 1],
                    Self::KERNEL_SIZE,
                    ConvSpec::new(padding, stride, 1, 1),
                    true,
                    reparam,
                    KernelInit::FanIn,
                    vb.pp(format!("convs.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let conv_post = NormConv1d::new(
            Self::CHANNELS[layers],
            1,
            3,
            ConvSpec::dilated(1, 1),
            true,
            reparam,
            KernelInit::FanIn,
            vb.pp("conv_post"),
        )?;
        Ok(Self {
            period,
            convs,
            conv_post,
        })
    }

    /// Fold period
    pub fn period(&self) -> usize {
        self.period
    }

    /// (batch * period, c, h) -> (batch, c, h, period)
    fn unfold(&self, x: &Tensor, batch: usize) -> Result<Tensor> {
        let (_, c, h) = x.dims3()?;
        x.reshape((batch, self.period, c, h))?
            .permute((0, 2, 3, 1))?
            .contiguous()
            .map_err(Into::into)
    }
}

impl Discriminator for PeriodDiscriminator {
    fn forward(&self, y: &Tensor) -> Result<DiscriminatorOutput> {
        let (batch, channels, _) = y.dims3()?;
        let y = pad_to_period(y, self.period)?;
        let frames = y.dim(2)? / self.period;

        // (b, c, t) -> (b, c, t/p, p) -> (b * p, c, t/p)
        let mut x = y
            .reshape((batch, channels, frames, self.period))?
            .permute((0, 3, 1, 2))?
            .reshape((batch * self.period, channels, frames))?;

        let mut feature_maps = Vec::with_capacity(self.convs.len() + 1);
        for conv in &self.convs {
            x = leaky_relu(&conv.forward(&x)?, LRELU_SLOPE)?;
            feature_maps.push(self.unfold(&x, batch)?);
        }
        let x = self.unfold(&self.conv_post.forward(&x)?, batch)?;
        let score = x.flatten_from(1)?;
        feature_maps.push(x);

        Ok(DiscriminatorOutput {
            score,
            feature_maps,
        })
    }

    fn name(&self) -> String {
        format!("period_{}", self.period)
    }
}

/// Scale discriminator: grouped 1-D convolutions on the raw waveform
pub struct ScaleDiscriminator {
    convs: Vec<NormConv1d>,
    conv_post: NormConv1d,
}

impl ScaleDiscriminator {
    /// (in, out, kernel, stride, groups, padding)
    const LAYERS: [(usize, usize, usize, usize, usize, usize); 6] = [
        (1, 16, 15, 1, 1, 7),
        (16, 64, 41, 4, 4, 20),
        (64, 256, 41, 4, 16, 20),
        (256, 1024, 41, 4, 64, 20),
        (1024, 1024, 41, 4, 256, 20),
        (1024, 1024, 5, 1, 1, 2),
    ];

    /// Scale discriminator over the raw waveform
    pub fn new(reparam: Reparam, vb: VarBuilder) -> Result<Self> {
        let convs = Self::LAYERS
            .iter()
            .enumerate()
            .map(|(i, &(cin, cout, k, stride, groups, padding))| {
                NormConv1d::new(
                    cin,
                    cout,
                    k,
                    ConvSpec::new(padding, stride, 1, groups),
                    true,
                    reparam,
                    KernelInit::FanIn,
                    vb.pp(format!("convs.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let conv_post = NormConv1d::new(
            1024,
            1,
            3,
            ConvSpec::dilated(1, 1),
            true,
            reparam,
            KernelInit::FanIn,
            vb.pp("conv_post"),
        )?;
        Ok(Self { convs, conv_post })
    }
}

impl Discriminator for ScaleDiscriminator {
    fn forward(&self, y: &Tensor) -> Result<DiscriminatorOutput> {
        let mut x = y.clone();
        let mut feature_maps = Vec::with_capacity(self.convs.len() + 1);
        for conv in &self.convs {
            x = leaky_relu(&conv.forward(&x)?, LRELU_SLOPE)?;
            feature_maps.push(x.clone());
        }
        let x = self.conv_post.forward(&x)?;
        let score = x.flatten_from(1)?;
        feature_maps.push(x);
        Ok(DiscriminatorOutput {
            score,
            feature_maps,
        })
    }

    fn name(&self) -> String {
        "scale".to_string()
    }
}

/// Scores and feature maps of the ensemble on a real/generated pair
#[derive(Debug, Clone)]
pub struct EnsembleOutput {
    /// Scores on real audio, one per discriminator
    pub real_scores: Vec<Tensor>,
    /// Scores on generated audio
    pub fake_scores: Vec<Tensor>,
    /// Feature maps on real audio
    pub real_fmaps: Vec<Vec<Tensor>>,
    /// Feature maps on generated audio
    pub fake_fmaps: Vec<Vec<Tensor>>,
}

/// The scale discriminator followed by one period discriminator per period
pub struct MultiPeriodDiscriminator {
    discriminators: Vec<Box<dyn Discriminator>>,
}

impl MultiPeriodDiscriminator {
    /// Ensemble with one period discriminator per entry of `periods`
    pub fn new(periods: &[usize], reparam: Reparam, vb: VarBuilder) -> Result<Self> {
        let mut discriminators: Vec<Box<dyn Discriminator>> = Vec::with_capacity(periods.len() + 1);
        discriminators.push(Box::new(ScaleDiscriminator::new(
            reparam,
            vb.pp("discriminators.0"),
        )?));
        for (i, &period) in periods.iter().enumerate() {
            discriminators.push(Box::new(PeriodDiscriminator::new(
                period,
                reparam,
                vb.pp(format!("discriminators.{}", i + 1)),
            )?));
        }
        Ok(Self { discriminators })
    }

    /// Score the real waveform `y` and the generated waveform `y_hat`
    pub fn forward(&self, y: &Tensor, y_hat: &Tensor) -> Result<EnsembleOutput> {
        let n = self.discriminators.len();
        let mut out = EnsembleOutput {
            real_scores: Vec::with_capacity(n),
            fake_scores: Vec::with_capacity(n),
            real_fmaps: Vec::with_capacity(n),
            fake_fmaps: Vec::with_capacity(n),
        };
        for d in &self.discriminators {
            let real = d.forward(y)?;
            let fake = d.forward(y_hat)?;
            out.real_scores.push(real.score);
            out.fake_scores.push(fake.score);
            out.real_fmaps.push(real.feature_maps);
            out.fake_fmaps.push(fake.feature_maps);
        }
        Ok(out)
    }

    /// Names in evaluation order
    pub fn names(&self) -> Vec<String> {
        self.discriminators.iter().map(|d| d.name()).collect()
    }

    /// Number of discriminators, scale included
    pub fn len(&self) -> usize {
        self.discriminators.len()
    }

    /// Always false; the scale discriminator is always present
    pub fn is_empty(&self) -> bool {
        self.discriminators.is_empty()
    }
}
