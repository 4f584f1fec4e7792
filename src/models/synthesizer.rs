//! Synthesizer: codebook + generator
//!
//! Composes the quantizer, the content/speaker decomposition and the
//! generator into the three ways the model is driven:
//! - `forward_train`: random aligned segments, for the GAN step
//! - `infer`: the whole sequence, reconstructing the input speaker
//! - `convert`: source content and residual under the target's speaker

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::Rng;
use std::path::Path;
use tracing::{debug, info};

use crate::checkpoint::{CheckpointDiagnostics, CODEBOOK_FILE, GENERATOR_FILE};
use crate::config::ModelConfig;
use crate::error::VcError;
use crate::models::decomposer::Decomposition;
use crate::models::generator::Generator;
use crate::models::quantizer::{VectorQuantizer, VqOutput};
use crate::utils::tensor_utils::{full_lengths, rand_segment_ids};

/// Output of a training forward pass
pub struct TrainOutput {
    /// Generated waveform segment (batch, 1, segment_size * hop)
    pub y_hat: Tensor,
    /// Start frame of the segment for every batch element
    pub ids: Vec<usize>,
    /// Quantizer pass over the full sequences
    pub vq: VqOutput,
}

/// Voice-conversion synthesizer
pub struct Synthesizer {
    config: ModelConfig,
    device: Device,
    varmap: VarMap,
    quantizer: VectorQuantizer,
    generator: Generator,
}

impl Synthesizer {
    /// Build a fresh model; the codebook is imported when `codebook_path` is set
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let generator = Generator::new(&config.model, vb)?;
        let quantizer = VectorQuantizer::from_config(&config.model, &config.quantizer, device)?;

        debug!(
            "Synthesizer: {} generator tensors, codebook {}x{}",
            varmap.all_vars().len(),
            quantizer.num_embeddings(),
            quantizer.embedding_dim()
        );

        Ok(Self {
            config: config.clone(),
            device: device.clone(),
            varmap,
            quantizer,
            generator,
        })
    }

    /// Build the model and load generator weights and codebook from a checkpoint directory
    pub fn load<P: AsRef<Path>>(config: &ModelConfig, dir: P, device: &Device) -> Result<Self> {
        let mut synth = Self::new(config, device)?;
        synth.load_weights(dir)?;
        Ok(synth)
    }

    /// Load `generator.safetensors` and `codebook.safetensors` from `dir`
    pub fn load_weights<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let generator_path = dir.join(GENERATOR_FILE);

        let mut diagnostics = CheckpointDiagnostics::new(false);
        let report = diagnostics.inspect(&generator_path, "generator", &self.varmap)?;
        if !report.is_complete() {
            bail!(
                "{:?} does not match the generator: {} missing, {} mis-shaped tensors",
                generator_path,
                report.missing_keys.len(),
                report.shape_mismatches.len()
            );
        }
        self.varmap
            .load(&generator_path)
            .with_context(|| format!("Failed to load generator from {:?}", generator_path))?;

        self.replace_codebook(dir.join(CODEBOOK_FILE))?;
        info!("Loaded synthesizer from {:?}", dir);
        Ok(())
    }

    /// Swap in a codebook file without touching the generator
    ///
    /// Rows are copied into the existing codebook variables.
    pub fn replace_codebook<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let quantizer = VectorQuantizer::load_file(path, &self.config.quantizer, &self.device)?;
        if quantizer.num_embeddings() != self.quantizer.num_embeddings()
            || quantizer.embedding_dim() != self.quantizer.embedding_dim()
        {
            bail!(VcError::shape_mismatch(
                &[self.quantizer.num_embeddings(), self.quantizer.embedding_dim()],
                &[quantizer.num_embeddings(), quantizer.embedding_dim()]
            ));
        }
        self.quantizer.copy_state_from(&quantizer)
    }

    /// Save generator weights and the standalone codebook into `dir`
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        self.varmap
            .save(dir.join(GENERATOR_FILE))
            .with_context(|| format!("Failed to save generator into {:?}", dir))?;
        self.quantizer.save(dir.join(CODEBOOK_FILE))
    }

    /// Quantize, slice aligned random segments and synthesize them
    ///
    /// `c` is (batch, ssl_dim, frames); `lengths` are valid frame counts and
    /// default to the full time axis.
    pub fn forward_train<R: Rng>(
        &self,
        c: &Tensor,
        lengths: Option<&[usize]>,
        rng: &mut R,
    ) -> Result<TrainOutput> {
        let (batch, _, frames) = c.dims3()?;
        let lengths = match lengths {
            Some(lengths) => lengths.to_vec(),
            None => full_lengths(batch, frames),
        };

        let vq = self.quantizer.forward(c, None)?;
        let dec = Decomposition::new(c, &vq.quantized, vq.input_order)?;

        let segment_size = self.config.train.segment_size;
        let ids = rand_segment_ids(&lengths, segment_size, rng)?;
        let seg = dec.slice(&ids, segment_size)?;

        let y_hat = self.generate(&seg)?;
        Ok(TrainOutput { y_hat, ids, vq })
    }

    /// Synthesize the full sequence, keeping the input speaker
    pub fn infer(&self, c: &Tensor) -> Result<Tensor> {
        let dec = self.decompose(c)?;
        self.generate(&dec)
    }

    /// Content and residual of `source` spoken with the global speaker of `target`
    pub fn convert(&self, source: &Tensor, target: &Tensor) -> Result<Tensor> {
        let src = self.decompose(source)?;
        let tgt = self.decompose(target)?;
        self.generate(&src.with_speaker_of(&tgt)?)
    }

    /// Quantize `c` and split it into content and speaker parts
    pub fn decompose(&self, c: &Tensor) -> Result<Decomposition> {
        let (_, _, frames) = c.dims3()?;
        if frames == 0 {
            bail!(VcError::InvalidInput("content embedding has no frames".into()));
        }
        let vq = self.quantizer.forward(c, None)?;
        Decomposition::new(c, &vq.quantized, vq.input_order)
    }

    fn generate(&self, dec: &Decomposition) -> Result<Tensor> {
        if self.generator.is_conditioned() {
            self.generator
                .forward(&dec.content, Some(&dec.speaker_avg), Some(&dec.residual))
        } else {
            self.generator.forward(&dec.content, None, None)
        }
    }

    /// Fold weight normalization for inference-only use
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        self.generator.remove_weight_norm()
    }

    /// Generator variables plus the codebook when it is gradient-trained
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.varmap.all_vars();
        vars.extend(self.quantizer.trainable_vars());
        vars
    }

    /// Codebook used for content decomposition
    pub fn quantizer(&self) -> &VectorQuantizer {
        &self.quantizer
    }

    /// Waveform generator
    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Generator and codebook variables
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Configuration the model was built from
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Device holding the weights
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Samples per content frame
    pub fn hop_length(&self) -> usize {
        self.generator.upsample_factor()
    }
}
