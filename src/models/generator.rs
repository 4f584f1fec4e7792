//! HiFi-GAN style waveform generator
//!
//! Architecture:
//! - Input content code: (batch, ssl_dim, frames)
//! - `conv_pre` projection, speaker conditioning (global bias + residual path)
//! - Transposed-convolution upsampling, each stage followed by a bank of
//!   residual blocks whose outputs are averaged
//! - Output waveform: (batch, 1, frames * prod(upsample_rates)) in [-1, 1]

use anyhow::{ensure, Result};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::info;

use crate::config::{NetConfig, ResBlockKind};
use crate::nn::{ConvSpec, KernelInit, NormConv1d, NormConvTranspose1d, Reparam};
use crate::utils::tensor_utils::{get_padding, leaky_relu};

/// Negative slope of the leaky ReLU inside the network
pub const LRELU_SLOPE: f64 = 0.1;
/// Negative slope of the leaky ReLU before `conv_post`
const POST_LRELU_SLOPE: f64 = 0.01;
/// Channels of the residual speaker path concatenated after `conv_pre`
pub const RES_CHANNELS: usize = 8;
/// Standard deviation of the upsampling and residual kernels at init
const INIT_STD: f64 = 0.01;

/// Residual block with two convolutions per dilation
struct ResBlock1 {
    convs1: Vec<NormConv1d>,
    convs2: Vec<NormConv1d>,
}

impl ResBlock1 {
    fn new(channels: usize, kernel_size: usize, dilations: &[usize], vb: VarBuilder) -> Result<Self> {
        let mut convs1 = Vec::with_capacity(dilations.len());
        let mut convs2 = Vec::with_capacity(dilations.len());
        for (i, &dilation) in dilations.iter().enumerate() {
            convs1.push(NormConv1d::new(
                channels,
                channels,
                kernel_size,
                ConvSpec::dilated(get_padding(kernel_size, dilation), dilation),
                true,
                Reparam::WeightNorm,
                KernelInit::Normal(INIT_STD),
                vb.pp(format!("convs1.{}", i)),
            )?);
            convs2.push(NormConv1d::new(
                channels,
                channels,
                kernel_size,
                ConvSpec::dilated(get_padding(kernel_size, 1), 1),
                true,
                Reparam::WeightNorm,
                KernelInit::Normal(INIT_STD),
                vb.pp(format!("convs2.{}", i)),
            )?);
        }
        Ok(Self { convs1, convs2 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for (c1, c2) in self.convs1.iter().zip(self.convs2.iter()) {
            let xt = c1.forward(&leaky_relu(&x, LRELU_SLOPE)?)?;
            let xt = c2.forward(&leaky_relu(&xt, LRELU_SLOPE)?)?;
            x = (xt + x)?;
        }
        Ok(x)
    }

    fn convs_mut(&mut self) -> impl Iterator<Item = &mut NormConv1d> {
        self.convs1.iter_mut().chain(self.convs2.iter_mut())
    }
}

/// Residual block with one dilated convolution per dilation
struct ResBlock2 {
    convs: Vec<NormConv1d>,
}

impl ResBlock2 {
    fn new(channels: usize, kernel_size: usize, dilations: &[usize], vb: VarBuilder) -> Result<Self> {
        let convs = dilations
            .iter()
            .enumerate()
            .map(|(i, &dilation)| {
                NormConv1d::new(
                    channels,
                    channels,
                    kernel_size,
                    ConvSpec::dilated(get_padding(kernel_size, dilation), dilation),
                    true,
                    Reparam::WeightNorm,
                    KernelInit::Normal(INIT_STD),
                    vb.pp(format!("convs.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { convs })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for conv in &self.convs {
            let xt = conv.forward(&leaky_relu(&x, LRELU_SLOPE)?)?;
            x = (xt + x)?;
        }
        Ok(x)
    }
}

enum ResBlock {
    One(ResBlock1),
    Two(ResBlock2),
}

impl ResBlock {
    fn new(
        kind: ResBlockKind,
        channels: usize,
        kernel_size: usize,
        dilations: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(match kind {
            ResBlockKind::One => ResBlock::One(ResBlock1::new(channels, kernel_size, dilations, vb)?),
            ResBlockKind::Two => ResBlock::Two(ResBlock2::new(channels, kernel_size, dilations, vb)?),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            ResBlock::One(block) => block.forward(x),
            ResBlock::Two(block) => block.forward(x),
        }
    }

    fn remove_weight_norm(&mut self) -> Result<usize> {
        let convs: Vec<&mut NormConv1d> = match self {
            ResBlock::One(block) => block.convs_mut().collect(),
            ResBlock::Two(block) => block.convs.iter_mut().collect(),
        };
        let mut folded = 0;
        for conv in convs {
            if conv.remove_weight_norm()? {
                folded += 1;
            }
        }
        Ok(folded)
    }

    fn is_weight_normalized(&self) -> bool {
        match self {
            ResBlock::One(block) => block
                .convs1
                .iter()
                .chain(block.convs2.iter())
                .any(|c| c.is_weight_normalized()),
            ResBlock::Two(block) => block.convs.iter().any(|c| c.is_weight_normalized()),
        }
    }
}

/// Speaker conditioning, fixed at construction
enum Conditioning {
    /// `gin_channels == 0`: content only
    None,
    /// Global embedding as a channel bias, residual embedding as extra channels
    Speaker { cond: NormConv1d, cond_res: NormConv1d },
}

/// Waveform generator
pub struct Generator {
    conv_pre: NormConv1d,
    conditioning: Conditioning,
    ups: Vec<NormConvTranspose1d>,
    resblocks: Vec<ResBlock>,
    conv_post: NormConv1d,
    num_kernels: usize,
    upsample_rates: Vec<usize>,
}

impl Generator {
    /// Build the generator; variables are created under `vb`
    pub fn new(config: &NetConfig, vb: VarBuilder) -> Result<Self> {
        let stages = config.upsample_rates.len();
        ensure!(
            stages > 0 && stages == config.upsample_kernel_sizes.len(),
            "{} upsample rates but {} upsample kernels",
            stages,
            config.upsample_kernel_sizes.len()
        );
        ensure!(
            !config.resblock_kernel_sizes.is_empty()
                && config.resblock_kernel_sizes.len() == config.resblock_dilation_sizes.len(),
            "{} resblock kernels but {} dilation lists",
            config.resblock_kernel_sizes.len(),
            config.resblock_dilation_sizes.len()
        );
        ensure!(
            config.upsample_initial_channel % (1 << stages) == 0,
            "upsample_initial_channel {} cannot be halved {} times",
            config.upsample_initial_channel,
            stages
        );

        let hidden = config.upsample_initial_channel;
        let conditioned = config.is_conditioned();
        let pre_channels = if conditioned {
            ensure!(
                hidden > RES_CHANNELS,
                "upsample_initial_channel {} leaves no room for the residual path",
                hidden
            );
            hidden - RES_CHANNELS
        } else {
            hidden
        };

        let conv_pre = NormConv1d::new(
            config.inter_channels,
            pre_channels,
            3,
            ConvSpec::dilated(1, 1),
            true,
            Reparam::None,
            KernelInit::FanIn,
            vb.pp("conv_pre"),
        )?;

        let conditioning = if conditioned {
            Conditioning::Speaker {
                cond: NormConv1d::new(
                    config.gin_channels,
                    hidden,
                    1,
                    ConvSpec::default(),
                    true,
                    Reparam::None,
                    KernelInit::FanIn,
                    vb.pp("cond"),
                )?,
                cond_res: NormConv1d::new(
                    config.gin_channels,
                    RES_CHANNELS,
                    1,
                    ConvSpec::default(),
                    true,
                    Reparam::None,
                    KernelInit::FanIn,
                    vb.pp("cond_res"),
                )?,
            }
        } else {
            Conditioning::None
        };

        let mut ups = Vec::with_capacity(stages);
        let mut resblocks = Vec::new();
        let mut ch = hidden;
        for (i, (&u, &k)) in config
            .upsample_rates
            .iter()
            .zip(config.upsample_kernel_sizes.iter())
            .enumerate()
        {
            ensure!(u > 0 && k >= u, "upsample kernel {} smaller than rate {}", k, u);
            ups.push(NormConvTranspose1d::new(
                ch,
                ch / 2,
                k,
                u,
                (k - u) / 2,
                Reparam::WeightNorm,
                KernelInit::Normal(INIT_STD),
                vb.pp(format!("ups.{}", i)),
            )?);
            ch /= 2;

            for (j, (&rk, dilations)) in config
                .resblock_kernel_sizes
                .iter()
                .zip(config.resblock_dilation_sizes.iter())
                .enumerate()
            {
                let index = i * config.resblock_kernel_sizes.len() + j;
                resblocks.push(ResBlock::new(
                    config.resblock,
                    ch,
                    rk,
                    dilations,
                    vb.pp(format!("resblocks.{}", index)),
                )?);
            }
        }

        let conv_post = NormConv1d::new(
            ch,
            1,
            7,
            ConvSpec::dilated(3, 1),
            false,
            Reparam::None,
            KernelInit::FanIn,
            vb.pp("conv_post"),
        )?;

        Ok(Self {
            conv_pre,
            conditioning,
            ups,
            resblocks,
            conv_post,
            num_kernels: config.resblock_kernel_sizes.len(),
            upsample_rates: config.upsample_rates.clone(),
        })
    }

    /// Synthesize a waveform
    ///
    /// # Arguments
    /// * `x` - Content code (batch, inter_channels, frames)
    /// * `g` - Global speaker embedding (batch, gin_channels, 1)
    /// * `res` - Residual speaker embedding (batch, gin_channels, frames)
    ///
    /// # Returns
    /// * Waveform (batch, 1, frames * upsample_factor)
    ///
    /// Without speaker conditioning `g` and `res` are ignored. With it, a
    /// missing `g` skips the bias and a missing `res` feeds zeros.
    pub fn forward(&self, x: &Tensor, g: Option<&Tensor>, res: Option<&Tensor>) -> Result<Tensor> {
        let (batch, _, frames) = x.dims3()?;
        let mut x = self.conv_pre.forward(x)?;

        if let Conditioning::Speaker { cond, cond_res } = &self.conditioning {
            let res = match res {
                Some(res) => cond_res.forward(res)?,
                None => Tensor::zeros((batch, RES_CHANNELS, frames), x.dtype(), x.device())?,
            };
            x = Tensor::cat(&[&x, &res], 1)?;
            if let Some(g) = g {
                x = x.broadcast_add(&cond.forward(g)?)?;
            }
        }

        let mut length = frames;
        for (i, up) in self.ups.iter().enumerate() {
            x = leaky_relu(&x, LRELU_SLOPE)?;
            x = up.forward(&x)?;
            // odd (kernel - rate) leaves one extra sample; keep exactly length * rate
            length *= up.stride();
            if x.dim(2)? != length {
                x = x.narrow(2, 0, length)?;
            }

            let blocks = &self.resblocks[i * self.num_kernels..(i + 1) * self.num_kernels];
            let mut xs = blocks[0].forward(&x)?;
            for block in &blocks[1..] {
                xs = (xs + block.forward(&x)?)?;
            }
            x = (xs / self.num_kernels as f64)?;
        }

        let x = leaky_relu(&x, POST_LRELU_SLOPE)?;
        let x = self.conv_post.forward(&x)?;
        x.tanh().map_err(Into::into)
    }

    /// Fold weight normalization into plain kernels for inference
    ///
    /// One-way: after the first call the generator holds raw kernels and
    /// later calls change nothing. Outputs are unchanged up to rounding.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        let mut folded = 0;
        for up in self.ups.iter_mut() {
            if up.remove_weight_norm()? {
                folded += 1;
            }
        }
        for block in self.resblocks.iter_mut() {
            folded += block.remove_weight_norm()?;
        }
        if folded > 0 {
            info!("Removed weight norm from {} generator layers", folded);
        }
        Ok(())
    }

    /// Whether any layer still uses the weight-normalized parameterization
    pub fn is_weight_normalized(&self) -> bool {
        self.ups.iter().any(|u| u.is_weight_normalized())
            || self.resblocks.iter().any(|b| b.is_weight_normalized())
    }

    /// Whether a speaker conditioning path is present
    pub fn is_conditioned(&self) -> bool {
        matches!(self.conditioning, Conditioning::Speaker { .. })
    }

    /// Total upsampling factor
    pub fn upsample_factor(&self) -> usize {
        self.upsample_rates.iter().product()
    }

    /// Output sample count for `frames` input frames
    pub fn output_len(&self, frames: usize) -> usize {
        frames * self.upsample_factor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> NetConfig {
        NetConfig {
            ssl_dim: 16,
            inter_channels: 16,
            gin_channels: 16,
            codebook_size: 8,
            upsample_rates: vec![5, 4, 2, 2, 2],
            upsample_kernel_sizes: vec![10, 8, 4, 4, 4],
            upsample_initial_channel: 64,
            resblock_kernel_sizes: vec![3, 5],
            resblock_dilation_sizes: vec![vec![1, 3], vec![1, 3]],
            ..NetConfig::default()
        }
    }

    fn build(config: &NetConfig) -> (VarMap, Generator) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let generator = Generator::new(config, vb).unwrap();
        (varmap, generator)
    }

    #[test]
    fn test_output_length_is_frames_times_factor() {
        let config = small_config();
        let (_varmap, generator) = build(&config);
        assert_eq!(generator.upsample_factor(), 160);

        let x = Tensor::randn(0f32, 1.0, (2, 16, 50), &Device::Cpu).unwrap();
        let g = Tensor::randn(0f32, 1.0, (2, 16, 1), &Device::Cpu).unwrap();
        let res = Tensor::randn(0f32, 1.0, (2, 16, 50), &Device::Cpu).unwrap();
        let y = generator.forward(&x, Some(&g), Some(&res)).unwrap();
        assert_eq!(y.dims3().unwrap(), (2, 1, 8000));

        let bound = y.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(bound <= 1.0);
    }

    #[test]
    fn test_odd_kernel_margin_is_trimmed() {
        let mut config = small_config();
        config.upsample_kernel_sizes = vec![11, 9, 5, 5, 5];
        let (_varmap, generator) = build(&config);
        for frames in [1, 7, 13] {
            let x = Tensor::randn(0f32, 1.0, (1, 16, frames), &Device::Cpu).unwrap();
            let y = generator.forward(&x, None, None).unwrap();
            assert_eq!(y.dim(2).unwrap(), generator.output_len(frames));
        }
    }

    #[test]
    fn test_missing_conditioning_is_a_noop_path() {
        let config = small_config();
        let (_varmap, generator) = build(&config);
        assert!(generator.is_conditioned());
        let x = Tensor::randn(0f32, 1.0, (1, 16, 4), &Device::Cpu).unwrap();
        let y = generator.forward(&x, None, None).unwrap();
        assert_eq!(y.dims3().unwrap(), (1, 1, 640));

        let mut unconditioned = small_config();
        unconditioned.gin_channels = 0;
        let (varmap, generator) = build(&unconditioned);
        assert!(!generator.is_conditioned());
        let y = generator.forward(&x, None, None).unwrap();
        assert_eq!(y.dims3().unwrap(), (1, 1, 640));
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().all(|n| !n.starts_with("cond")));
    }

    #[test]
    fn test_resblock2_variant() {
        let mut config = small_config();
        config.resblock = ResBlockKind::Two;
        let (_varmap, generator) = build(&config);
        let x = Tensor::randn(0f32, 1.0, (1, 16, 3), &Device::Cpu).unwrap();
        let y = generator.forward(&x, None, None).unwrap();
        assert_eq!(y.dim(2).unwrap(), 480);
    }

    #[test]
    fn test_remove_weight_norm_preserves_output() {
        let config = small_config();
        let (_varmap, mut generator) = build(&config);
        let x = Tensor::randn(0f32, 1.0, (1, 16, 6), &Device::Cpu).unwrap();
        let g = Tensor::randn(0f32, 1.0, (1, 16, 1), &Device::Cpu).unwrap();
        let before = generator.forward(&x, Some(&g), None).unwrap();

        assert!(generator.is_weight_normalized());
        generator.remove_weight_norm().unwrap();
        assert!(!generator.is_weight_normalized());
        generator.remove_weight_norm().unwrap();

        let after = generator.forward(&x, Some(&g), None).unwrap();
        let diff = (before - after)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_parameter_names() {
        let config = small_config();
        let (varmap, _generator) = build(&config);
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("conv_pre.weight"));
        assert!(data.contains_key("ups.0.weight_g"));
        assert!(data.contains_key("ups.4.weight_v"));
        assert!(data.contains_key("resblocks.9.convs2.1.weight_v"));
        assert!(data.contains_key("conv_post.weight"));
        assert!(!data.contains_key("conv_post.bias"));
    }
}
