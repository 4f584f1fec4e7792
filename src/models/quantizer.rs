//! Vector-quantization codebook
//!
//! Maps every frame of a content embedding to its nearest codebook row
//! (squared Euclidean distance, lowest index on ties). The quantized output
//! uses the straight-through estimator so gradients reach the encoder path
//! as if quantization were the identity.
//!
//! The codebook is updated by one of three rules (`CodebookUpdate`):
//! an exponential moving average of the assigned inputs (applied by the
//! training loop after each optimizer step), its own loss gradient, or not
//! at all.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::checkpoint::{load_tensor_map, save_tensor_map, TensorFormat};
use crate::config::{CodebookUpdate, NetConfig, QuantizerConfig};
use crate::error::VcError;
use crate::losses::vq_loss;
use crate::utils::tensor_utils::to_vec_f32;

const EMBEDDING_KEY: &str = "embedding";
const EMA_COUNT_KEY: &str = "ema_count";
const EMA_WEIGHT_KEY: &str = "ema_weight";

/// Axis order of a quantizer input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisOrder {
    /// (batch, dim, time)
    ChannelsFirst,
    /// (batch, time, dim)
    ChannelsLast,
}

/// Result of one quantizer pass
pub struct VqOutput {
    /// Straight-through quantized input, channels-last (batch, time, dim)
    pub quantized: Tensor,
    /// commitment_lambda * mse(x, sg(q))
    pub commitment_loss: Tensor,
    /// codebook_lambda * mse(sg(target), q), or a zero scalar
    pub codebook_loss: Tensor,
    /// exp(entropy) of the batch assignment distribution, in (0, K]
    pub perplexity: f32,
    /// Assigned codebook row for every (batch, time) position, row-major
    pub indices: Vec<u32>,
    /// Detached channels-last input flattened to (batch * time, dim)
    pub flat_input: Tensor,
    /// Axis order the input arrived in
    pub input_order: AxisOrder,
}

impl VqOutput {
    /// Sum of the commitment and codebook terms
    pub fn loss(&self) -> Result<Tensor> {
        (&self.commitment_loss + &self.codebook_loss).map_err(Into::into)
    }
}

struct EmaState {
    count: Var,
    weight: Var,
    decay: f64,
    epsilon: f64,
}

/// Learned codebook of `num_embeddings` vectors of size `embedding_dim`
pub struct VectorQuantizer {
    embedding: Var,
    ema: Option<EmaState>,
    update: CodebookUpdate,
    commitment_lambda: f64,
    codebook_lambda: f64,
    num_embeddings: usize,
    embedding_dim: usize,
}

impl VectorQuantizer {
    /// Randomly initialised codebook, rows drawn from U(-1/K, 1/K)
    pub fn new(
        num_embeddings: usize,
        embedding_dim: usize,
        config: &QuantizerConfig,
        device: &Device,
    ) -> Result<Self> {
        let bound = 1.0 / num_embeddings as f64;
        let embedding = Tensor::rand(-bound, bound, (num_embeddings, embedding_dim), device)?
            .to_dtype(DType::F32)?;
        Self::from_embedding(embedding, config)
    }

    /// Wrap an existing (K, D) codebook
    pub fn from_embedding(embedding: Tensor, config: &QuantizerConfig) -> Result<Self> {
        let (num_embeddings, embedding_dim) = embedding
            .dims2()
            .context("codebook must be a (num_embeddings, embedding_dim) matrix")?;
        if num_embeddings == 0 || embedding_dim == 0 {
            bail!(VcError::InvalidInput(format!(
                "empty codebook of shape ({}, {})",
                num_embeddings, embedding_dim
            )));
        }
        let embedding = embedding.to_dtype(DType::F32)?.contiguous()?;

        let ema = match config.update {
            CodebookUpdate::Ema { decay, epsilon } => Some(EmaState {
                count: Var::ones(num_embeddings, DType::F32, embedding.device())?,
                weight: Var::from_tensor(&embedding.copy()?)?,
                decay,
                epsilon,
            }),
            CodebookUpdate::Gradient | CodebookUpdate::Frozen => None,
        };

        Ok(Self {
            embedding: Var::from_tensor(&embedding)?,
            ema,
            update: config.update,
            commitment_lambda: config.commitment_lambda,
            codebook_lambda: config.codebook_lambda,
            num_embeddings,
            embedding_dim,
        })
    }

    /// Codebook for a model: imported from `codebook_path` when set, random otherwise
    pub fn from_config(net: &NetConfig, config: &QuantizerConfig, device: &Device) -> Result<Self> {
        let vq = match &net.codebook_path {
            Some(path) => Self::load_file(path, config, device)?,
            None => Self::new(net.codebook_size, net.ssl_dim, config, device)?,
        };
        if vq.num_embeddings != net.codebook_size || vq.embedding_dim != net.ssl_dim {
            bail!(VcError::shape_mismatch(
                &[net.codebook_size, net.ssl_dim],
                &[vq.num_embeddings, vq.embedding_dim]
            ));
        }
        Ok(vq)
    }

    /// Load a codebook file
    ///
    /// Accepts a safetensors file written by [`VectorQuantizer::save`] or a
    /// `(K, D)` `.npy` centroid matrix (e.g. k-means cluster centres).
    pub fn load_file<P: AsRef<Path>>(path: P, config: &QuantizerConfig, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let mut tensors = load_tensor_map(path, device)?;
        let ema_count = tensors.remove(EMA_COUNT_KEY);
        let ema_weight = tensors.remove(EMA_WEIGHT_KEY);

        let embedding = match TensorFormat::from_path(path)? {
            TensorFormat::Safetensors => tensors
                .remove(EMBEDDING_KEY)
                .with_context(|| format!("{:?} has no {:?} tensor", path, EMBEDDING_KEY))?,
            TensorFormat::Npy => tensors
                .into_values()
                .next()
                .with_context(|| format!("{:?} is empty", path))?,
        };

        let vq = Self::from_embedding(embedding, config)?;
        if let Some(ema) = &vq.ema {
            if let (Some(count), Some(weight)) = (&ema_count, &ema_weight) {
                ema.count.set(count)?;
                ema.weight.set(weight)?;
                debug!("restored EMA statistics from {:?}", path);
            }
        }

        info!(
            "Loaded codebook {}x{} from {:?}",
            vq.num_embeddings, vq.embedding_dim, path
        );
        Ok(vq)
    }

    /// Write the codebook (and EMA statistics) as a standalone safetensors file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors = HashMap::new();
        tensors.insert(EMBEDDING_KEY.to_string(), self.embedding.as_tensor().clone());
        if let Some(ema) = &self.ema {
            tensors.insert(EMA_COUNT_KEY.to_string(), ema.count.as_tensor().clone());
            tensors.insert(EMA_WEIGHT_KEY.to_string(), ema.weight.as_tensor().clone());
        }
        save_tensor_map(&tensors, path)
    }

    /// Replace the codebook rows, keeping the shape
    pub fn set_embedding(&self, embedding: &Tensor) -> Result<()> {
        let dims = embedding.dims();
        if dims != [self.num_embeddings, self.embedding_dim] {
            bail!(VcError::shape_mismatch(
                &[self.num_embeddings, self.embedding_dim],
                dims
            ));
        }
        let embedding = embedding.to_dtype(DType::F32)?;
        self.embedding.set(&embedding)?;
        if let Some(ema) = &self.ema {
            ema.weight.set(&embedding.broadcast_mul(&ema.count.unsqueeze(1)?)?)?;
        }
        Ok(())
    }

    /// Take over the rows and EMA statistics of another codebook of the same shape
    ///
    /// The variables keep their identity, so an optimizer that already
    /// tracks the codebook keeps training it.
    pub fn copy_state_from(&self, other: &VectorQuantizer) -> Result<()> {
        self.set_embedding(other.embedding())?;
        if let (Some(ema), Some(theirs)) = (&self.ema, &other.ema) {
            ema.count.set(theirs.count.as_tensor())?;
            ema.weight.set(theirs.weight.as_tensor())?;
        }
        Ok(())
    }

    /// The (K, D) codebook
    pub fn embedding(&self) -> &Tensor {
        self.embedding.as_tensor()
    }

    /// Number of codebook rows
    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    /// Size of each codebook row
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Configured codebook update rule
    pub fn update_rule(&self) -> CodebookUpdate {
        self.update
    }

    /// Variables the optimizer should train (only under `CodebookUpdate::Gradient`)
    pub fn trainable_vars(&self) -> Vec<Var> {
        match self.update {
            CodebookUpdate::Gradient => vec![self.embedding.clone()],
            _ => Vec::new(),
        }
    }

    /// Detect the axis order of `x` from the position of the embedding axis
    pub fn axis_order(&self, x: &Tensor) -> Result<AxisOrder> {
        let (_, d1, d2) = x.dims3()?;
        if d1 == self.embedding_dim {
            Ok(AxisOrder::ChannelsFirst)
        } else if d2 == self.embedding_dim {
            Ok(AxisOrder::ChannelsLast)
        } else {
            Err(VcError::shape_mismatch(&[x.dim(0)?, self.embedding_dim, d2], x.dims()).into())
        }
    }

    /// Nearest codebook row for every row of `flat` (N, D)
    ///
    /// Distances are `|x|^2 - 2 x.e + |e|^2`; the argmin runs on the host
    /// so that ties resolve to the lowest index on every device.
    pub fn assign(&self, flat: &Tensor) -> Result<Vec<u32>> {
        let codebook = self.embedding.as_tensor().detach();
        let x_sq = flat.sqr()?.sum_keepdim(1)?;
        let e_sq = codebook.sqr()?.sum(1)?.unsqueeze(0)?;
        let cross = flat.matmul(&codebook.t()?)?;
        let distances = x_sq
            .broadcast_add(&e_sq)?
            .broadcast_sub(&(cross * 2.0)?)?;

        let values = to_vec_f32(&distances)?;
        Ok(values
            .chunks(self.num_embeddings)
            .map(|row| {
                let mut best = 0usize;
                for (k, &d) in row.iter().enumerate().skip(1) {
                    if d < row[best] {
                        best = k;
                    }
                }
                best as u32
            })
            .collect())
    }

    /// Look up codebook rows by index: (N,) -> (N, D)
    pub fn lookup(&self, indices: &[u32]) -> Result<Tensor> {
        let device = self.embedding.device();
        let ids = Tensor::from_vec(indices.to_vec(), indices.len(), device)?;
        self.codebook_for_lookup()
            .index_select(&ids, 0)
            .map_err(Into::into)
    }

    fn codebook_for_lookup(&self) -> Tensor {
        match self.update {
            CodebookUpdate::Gradient => self.embedding.as_tensor().clone(),
            CodebookUpdate::Ema { .. } | CodebookUpdate::Frozen => self.embedding.as_tensor().detach(),
        }
    }

    /// Quantize `x` of shape (B, D, T) or (B, T, D)
    ///
    /// `posterior`, when given, replaces `x` as the target of the codebook
    /// loss. It must have the same shape as `x`.
    pub fn forward(&self, x: &Tensor, posterior: Option<&Tensor>) -> Result<VqOutput> {
        let order = self.axis_order(x)?;
        let to_channels_last = |t: &Tensor| -> Result<Tensor> {
            match order {
                AxisOrder::ChannelsFirst => Ok(t.transpose(1, 2)?.contiguous()?),
                AxisOrder::ChannelsLast => Ok(t.contiguous()?),
            }
        };
        let input_dims = x.dims().to_vec();
        let x = to_channels_last(&x.to_dtype(DType::F32)?)?;
        let (batch, time, dim) = x.dims3()?;

        let flat_input = x.reshape((batch * time, dim))?.detach();
        let indices = self.assign(&flat_input)?;
        let q = self.lookup(&indices)?.reshape((batch, time, dim))?;

        let posterior = match posterior {
            Some(p) => {
                if p.dims() != input_dims.as_slice() {
                    bail!(VcError::shape_mismatch(&input_dims, p.dims()));
                }
                Some(to_channels_last(&p.to_dtype(DType::F32)?)?)
            }
            None => None,
        };
        let codebook_lambda = match self.update {
            CodebookUpdate::Frozen => 0.0,
            _ => self.codebook_lambda,
        };
        let (commitment_loss, codebook_loss) = vq_loss(
            &x,
            &q,
            self.commitment_lambda,
            codebook_lambda,
            posterior.as_ref(),
        )?;

        let quantized = (&x + (&q - &x)?.detach())?;
        let perplexity = perplexity(&indices, self.num_embeddings);

        Ok(VqOutput {
            quantized,
            commitment_loss,
            codebook_loss,
            perplexity,
            indices,
            flat_input,
            input_order: order,
        })
    }

    /// Exponential-moving-average codebook update from one forward pass
    ///
    /// A no-op unless the update rule is `CodebookUpdate::Ema`.
    pub fn apply_ema(&self, out: &VqOutput) -> Result<()> {
        let Some(ema) = &self.ema else {
            return Ok(());
        };
        let k = self.num_embeddings;
        let n_rows = out.indices.len();
        let device = self.embedding.device();

        let mut onehot = vec![0f32; n_rows * k];
        let mut counts = vec![0f32; k];
        for (row, &idx) in out.indices.iter().enumerate() {
            onehot[row * k + idx as usize] = 1.0;
            counts[idx as usize] += 1.0;
        }
        let onehot = Tensor::from_vec(onehot, (n_rows, k), device)?;
        let counts = Tensor::from_vec(counts, k, device)?;

        let count = ((ema.count.as_tensor() * ema.decay)? + (counts * (1.0 - ema.decay))?)?;
        // Laplace smoothing keeps unused rows from dividing by zero
        let total = count.sum_all()?.to_scalar::<f32>()? as f64;
        let count = ((count + ema.epsilon)? * (total / (total + k as f64 * ema.epsilon)))?;

        let dw = onehot.t()?.matmul(&out.flat_input.detach())?;
        let weight = ((ema.weight.as_tensor() * ema.decay)? + (dw * (1.0 - ema.decay))?)?;
        let embedding = weight.broadcast_div(&count.unsqueeze(1)?)?;

        ema.count.set(&count)?;
        ema.weight.set(&weight)?;
        self.embedding.set(&embedding)?;
        Ok(())
    }
}

/// exp(-sum p log p) of the empirical assignment distribution
pub fn perplexity(indices: &[u32], num_embeddings: usize) -> f32 {
    if indices.is_empty() {
        return 0.0;
    }
    let mut counts = vec![0usize; num_embeddings];
    for &idx in indices {
        counts[idx as usize] += 1;
    }
    let n = indices.len() as f64;
    let entropy: f64 = counts
        .iter()
        .map(|&c| {
            let p = c as f64 / n;
            -p * (p + 1e-10).ln()
        })
        .sum();
    entropy.exp() as f32
}
