//! Adversarial training loop
//!
//! One step updates the discriminator ensemble on a detached generator
//! output, then the synthesizer on the adversarial, feature-matching and
//! quantization losses, then applies the codebook's EMA update.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use crate::checkpoint::{CheckpointDiagnostics, CONFIG_FILE, DISCRIMINATOR_FILE, TRAINER_STATE_FILE};
use crate::config::{ModelConfig, TrainConfig};
use crate::losses::{discriminator_loss, feature_loss, generator_loss};
use crate::models::{MultiPeriodDiscriminator, Synthesizer};
use crate::nn::Reparam;
use crate::training::data::{Batch, FilelistDataset};
use crate::utils::tensor_utils::slice_segments;

/// Decay of the running generator loss
const RUNNING_LOSS_MOMENTUM: f64 = 0.98;

/// Resumable trainer state, stored as JSON next to the weights
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainerState {
    /// Optimizer steps taken
    pub step: usize,
    /// Completed epochs
    pub epoch: usize,
    /// Current learning rate of both optimizers
    pub learning_rate: f64,
    /// Seed of the step RNG
    pub seed: u64,
    /// Exponential average of the total generator loss
    pub running_loss: Option<f64>,
}

/// Losses and statistics of one training step
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Step index of this update, counted from zero
    pub step: usize,
    /// Discriminator loss
    pub loss_disc: f32,
    /// Adversarial generator loss
    pub loss_gen: f32,
    /// Feature-matching loss
    pub loss_fm: f32,
    /// Commitment plus codebook loss, before `c_commit` weighting
    pub loss_vq: f32,
    /// Total generator objective
    pub loss_total: f32,
    /// Real terms of the discriminator loss, per discriminator
    pub disc_real: Vec<f32>,
    /// Fake terms of the discriminator loss, per discriminator
    pub disc_fake: Vec<f32>,
    /// Codebook perplexity of the batch
    pub perplexity: f32,
    /// Learning rate used for the step
    pub learning_rate: f64,
    /// Wall-clock time of the step
    pub step_time_ms: u64,
}

/// Averages over an epoch
#[derive(Debug, Clone, Default)]
pub struct EpochSummary {
    /// Epoch index
    pub epoch: usize,
    /// Batches trained
    pub steps: usize,
    /// Batches with no utterance long enough for a segment
    pub skipped_batches: usize,
    /// Mean discriminator loss
    pub mean_loss_disc: f32,
    /// Mean generator loss
    pub mean_loss_total: f32,
    /// Mean codebook perplexity
    pub mean_perplexity: f32,
}

fn optimizer_params(train: &TrainConfig, lr: f64) -> ParamsAdamW {
    ParamsAdamW {
        lr,
        beta1: train.betas[0],
        beta2: train.betas[1],
        eps: train.eps,
        weight_decay: train.weight_decay,
    }
}

fn scalar(t: &Tensor) -> Result<f32> {
    t.to_dtype(DType::F32)?.to_scalar::<f32>().map_err(Into::into)
}

/// GAN trainer over a synthesizer and a discriminator ensemble
pub struct GanTrainer {
    config: ModelConfig,
    synth: Synthesizer,
    disc_varmap: VarMap,
    discriminator: MultiPeriodDiscriminator,
    optim_g: AdamW,
    optim_d: AdamW,
    rng: StdRng,
    state: TrainerState,
}

impl GanTrainer {
    /// Fresh models and optimizers from `config`
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let synth = Synthesizer::new(config, device)?;

        let disc_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&disc_varmap, DType::F32, device);
        let reparam = if config.model.use_spectral_norm {
            Reparam::SpectralNorm
        } else {
            Reparam::WeightNorm
        };
        let discriminator = MultiPeriodDiscriminator::new(&config.model.periods, reparam, vb)?;

        let lr = config.train.learning_rate;
        let optim_g = AdamW::new(synth.trainable_vars(), optimizer_params(&config.train, lr))?;
        let optim_d = AdamW::new(disc_varmap.all_vars(), optimizer_params(&config.train, lr))?;

        info!(
            "Trainer: {} generator tensors, {} discriminators ({:?})",
            synth.trainable_vars().len(),
            discriminator.len(),
            discriminator.names()
        );

        Ok(Self {
            config: config.clone(),
            synth,
            disc_varmap,
            discriminator,
            optim_g,
            optim_d,
            rng: StdRng::seed_from_u64(config.train.seed),
            state: TrainerState {
                step: 0,
                epoch: 0,
                learning_rate: lr,
                seed: config.train.seed,
                running_loss: None,
            },
        })
    }

    /// One discriminator update followed by one generator update
    pub fn step(&mut self, batch: &Batch) -> Result<StepReport> {
        let start = Instant::now();
        let train = &self.config.train;
        let hop = self.synth.hop_length();

        let out = self
            .synth
            .forward_train(&batch.content, Some(batch.lengths.as_slice()), &mut self.rng)?;
        let sample_ids: Vec<usize> = out.ids.iter().map(|&id| id * hop).collect();
        let y = slice_segments(&batch.audio, &sample_ids, self.config.segment_samples())?;

        // Discriminator
        let ens = self.discriminator.forward(&y, &out.y_hat.detach())?;
        let (loss_disc, disc_real, disc_fake) =
            discriminator_loss(&ens.real_scores, &ens.fake_scores)?;
        self.optim_d.backward_step(&loss_disc)?;

        // Generator
        let ens = self.discriminator.forward(&y, &out.y_hat)?;
        let (loss_gen, _) = generator_loss(&ens.fake_scores)?;
        let loss_fm = feature_loss(&ens.real_fmaps, &ens.fake_fmaps)?;
        let loss_vq = out.vq.loss()?;
        let loss_total = ((&loss_gen + (&loss_fm * train.c_fm)?)? + (&loss_vq * train.c_commit)?)?;
        self.optim_g.backward_step(&loss_total)?;

        self.synth.quantizer().apply_ema(&out.vq)?;

        let report = StepReport {
            step: self.state.step,
            loss_disc: scalar(&loss_disc)?,
            loss_gen: scalar(&loss_gen)?,
            loss_fm: scalar(&loss_fm)?,
            loss_vq: scalar(&loss_vq)?,
            loss_total: scalar(&loss_total)?,
            disc_real,
            disc_fake,
            perplexity: out.vq.perplexity,
            learning_rate: self.optim_g.learning_rate(),
            step_time_ms: start.elapsed().as_millis() as u64,
        };
        if !report.loss_total.is_finite() || !report.loss_disc.is_finite() {
            bail!(
                "Non-finite loss at step {}: disc {}, gen {}",
                report.step,
                report.loss_disc,
                report.loss_total
            );
        }

        let total = report.loss_total as f64;
        self.state.running_loss = Some(match self.state.running_loss {
            Some(avg) => RUNNING_LOSS_MOMENTUM * avg + (1.0 - RUNNING_LOSS_MOMENTUM) * total,
            None => total,
        });
        self.state.step += 1;

        if train.log_interval > 0 && report.step % train.log_interval == 0 {
            info!(
                "step {} | d {:.4} | g {:.4} fm {:.4} vq {:.4} | ppl {:.1} | lr {:.2e} | {} ms",
                report.step,
                report.loss_disc,
                report.loss_gen,
                report.loss_fm,
                report.loss_vq,
                report.perplexity,
                report.learning_rate,
                report.step_time_ms
            );
        } else {
            debug!("step {} | total {:.4}", report.step, report.loss_total);
        }
        Ok(report)
    }

    /// Run every batch of `dataset` once, then decay the learning rate
    pub fn train_epoch<F>(&mut self, dataset: &FilelistDataset, mut on_step: F) -> Result<EpochSummary>
    where
        F: FnMut(&StepReport),
    {
        let batches = dataset.batches(self.config.train.batch_size, &mut self.rng);
        let mut summary = EpochSummary {
            epoch: self.state.epoch,
            ..EpochSummary::default()
        };

        for indices in batches {
            let Some(batch) = dataset.load_batch(&indices)? else {
                summary.skipped_batches += 1;
                continue;
            };
            let report = self.step(&batch)?;
            summary.steps += 1;
            summary.mean_loss_disc += report.loss_disc;
            summary.mean_loss_total += report.loss_total;
            summary.mean_perplexity += report.perplexity;
            on_step(&report);
        }

        if summary.steps > 0 {
            let n = summary.steps as f32;
            summary.mean_loss_disc /= n;
            summary.mean_loss_total /= n;
            summary.mean_perplexity /= n;
        }
        info!(
            "epoch {} done: {} steps, d {:.4}, total {:.4}, ppl {:.1}",
            summary.epoch,
            summary.steps,
            summary.mean_loss_disc,
            summary.mean_loss_total,
            summary.mean_perplexity
        );
        self.end_epoch();
        Ok(summary)
    }

    /// Mean absolute waveform error of full-length reconstructions
    pub fn evaluate(&self, dataset: &FilelistDataset) -> Result<f32> {
        let mut total = 0.0f32;
        for index in 0..dataset.len() {
            let sample = dataset.load(index)?;
            let c = sample.content.unsqueeze(0)?;
            let y_hat = self.synth.infer(&c)?;
            let len = sample.audio.len();
            let y = Tensor::from_vec(sample.audio, (1, 1, len), y_hat.device())?;
            total += scalar(&(y_hat - y)?.abs()?.mean_all()?)?;
        }
        if dataset.is_empty() {
            bail!("Validation set is empty");
        }
        let error = total / dataset.len() as f32;
        info!("validation at step {}: L1 {:.5}", self.state.step, error);
        Ok(error)
    }

    /// Advance the epoch counter and apply the exponential learning-rate decay
    pub fn end_epoch(&mut self) {
        self.state.epoch += 1;
        self.state.learning_rate *= self.config.train.lr_decay;
        self.optim_g.set_learning_rate(self.state.learning_rate);
        self.optim_d.set_learning_rate(self.state.learning_rate);
    }

    /// Write weights, codebook, trainer state and config into `dir`
    pub fn save_checkpoint<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        self.synth.save(dir)?;
        self.disc_varmap
            .save(dir.join(DISCRIMINATOR_FILE))
            .with_context(|| format!("Failed to save discriminator into {:?}", dir))?;

        let state = serde_json::to_string_pretty(&self.state)?;
        std::fs::write(dir.join(TRAINER_STATE_FILE), state)
            .with_context(|| format!("Failed to write trainer state into {:?}", dir))?;
        self.config.save(dir.join(CONFIG_FILE))?;

        info!("Saved checkpoint at step {} to {:?}", self.state.step, dir);
        Ok(())
    }

    /// Restore weights and counters written by `save_checkpoint`
    ///
    /// Optimizer moments are not stored and restart from zero.
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        self.synth.load_weights(dir)?;

        let disc_path = dir.join(DISCRIMINATOR_FILE);
        let mut diagnostics = CheckpointDiagnostics::new(false);
        let report = diagnostics.inspect(&disc_path, "discriminator", &self.disc_varmap)?;
        if !report.is_complete() {
            bail!(
                "{:?} does not match the discriminators: {} missing, {} mis-shaped tensors",
                disc_path,
                report.missing_keys.len(),
                report.shape_mismatches.len()
            );
        }
        self.disc_varmap
            .load(&disc_path)
            .with_context(|| format!("Failed to load discriminator from {:?}", disc_path))?;

        let state_path = dir.join(TRAINER_STATE_FILE);
        let text = std::fs::read_to_string(&state_path)
            .with_context(|| format!("Failed to read {:?}", state_path))?;
        self.state = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {:?}", state_path))?;

        self.optim_g.set_learning_rate(self.state.learning_rate);
        self.optim_d.set_learning_rate(self.state.learning_rate);
        self.rng = StdRng::seed_from_u64(self.state.seed.wrapping_add(self.state.step as u64));

        info!(
            "Resumed from {:?}: epoch {}, step {}, lr {:.3e}",
            dir, self.state.epoch, self.state.step, self.state.learning_rate
        );
        Ok(())
    }

    /// Step, epoch and schedule state
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Generator side being trained
    pub fn synthesizer(&self) -> &Synthesizer {
        &self.synth
    }

    /// Discriminator ensemble being trained
    pub fn discriminator(&self) -> &MultiPeriodDiscriminator {
        &self.discriminator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CodebookUpdate, NetConfig};
    use crate::training::data::{collate, Sample};

    fn tiny_config() -> ModelConfig {
        let mut config = ModelConfig::default();
        config.data.hop_length = 16;
        config.model = NetConfig {
            ssl_dim: 12,
            inter_channels: 12,
            gin_channels: 12,
            codebook_size: 6,
            upsample_rates: vec![4, 4],
            upsample_kernel_sizes: vec![8, 8],
            upsample_initial_channel: 32,
            resblock_kernel_sizes: vec![3],
            resblock_dilation_sizes: vec![vec![1, 3]],
            periods: vec![2, 3],
            ..NetConfig::default()
        };
        config.train.segment_size = 8;
        config.train.batch_size = 2;
        config.train.log_interval = 1;
        config
    }

    fn tiny_batch(frames: &[usize]) -> Batch {
        let dev = Device::Cpu;
        let samples: Vec<Sample> = frames
            .iter()
            .map(|&f| Sample {
                content: Tensor::randn(0f32, 1.0, (12, f), &dev).unwrap(),
                audio: (0..f * 16).map(|i| (i as f32 * 0.05).sin() * 0.5).collect(),
            })
            .collect();
        collate(&samples, 16).unwrap()
    }

    #[test]
    fn test_step_reports_finite_losses() {
        let config = tiny_config();
        let mut trainer = GanTrainer::new(&config, &Device::Cpu).unwrap();
        let batch = tiny_batch(&[12, 9]);

        let report = trainer.step(&batch).unwrap();
        assert_eq!(report.step, 0);
        assert_eq!(report.disc_real.len(), 3);
        assert_eq!(report.disc_fake.len(), 3);
        assert!(report.loss_disc.is_finite() && report.loss_disc >= 0.0);
        assert!(report.loss_fm >= 0.0);
        assert!(report.loss_total.is_finite());
        assert_eq!(trainer.state().step, 1);
        assert!(trainer.state().running_loss.is_some());
    }

    #[test]
    fn test_step_updates_both_sides() {
        let config = tiny_config();
        let mut trainer = GanTrainer::new(&config, &Device::Cpu).unwrap();
        let batch = tiny_batch(&[10, 10]);

        let snapshot = |vars: Vec<candle_core::Var>| -> Vec<Vec<f32>> {
            vars.iter()
                .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
                .collect()
        };
        let g_before = snapshot(trainer.synth.varmap().all_vars());
        let d_before = snapshot(trainer.disc_varmap.all_vars());
        let codebook_before = trainer.synth.quantizer().embedding().to_vec2::<f32>().unwrap();

        trainer.step(&batch).unwrap();

        assert_ne!(g_before, snapshot(trainer.synth.varmap().all_vars()));
        assert_ne!(d_before, snapshot(trainer.disc_varmap.all_vars()));
        assert_ne!(
            codebook_before,
            trainer.synth.quantizer().embedding().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_end_epoch_decays_learning_rate() {
        let mut config = tiny_config();
        config.train.lr_decay = 0.5;
        let mut trainer = GanTrainer::new(&config, &Device::Cpu).unwrap();
        trainer.end_epoch();
        trainer.end_epoch();
        assert_eq!(trainer.state().epoch, 2);
        assert!((trainer.state().learning_rate - config.train.learning_rate * 0.25).abs() < 1e-12);
        assert!((trainer.optim_d.learning_rate() - trainer.state().learning_rate).abs() < 1e-12);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config();
        config.quantizer.update = CodebookUpdate::Gradient;
        let mut trainer = GanTrainer::new(&config, &Device::Cpu).unwrap();
        trainer.step(&tiny_batch(&[10, 8])).unwrap();
        trainer.end_epoch();
        trainer.save_checkpoint(dir.path()).unwrap();

        for file in [
            crate::checkpoint::GENERATOR_FILE,
            crate::checkpoint::CODEBOOK_FILE,
            DISCRIMINATOR_FILE,
            TRAINER_STATE_FILE,
            CONFIG_FILE,
        ] {
            assert!(dir.path().join(file).exists(), "{} missing", file);
        }

        let mut resumed = GanTrainer::new(&config, &Device::Cpu).unwrap();
        resumed.load_checkpoint(dir.path()).unwrap();
        assert_eq!(resumed.state(), trainer.state());
        assert_eq!(
            resumed.synth.quantizer().embedding().to_vec2::<f32>().unwrap(),
            trainer.synth.quantizer().embedding().to_vec2::<f32>().unwrap()
        );

        let c = Tensor::randn(0f32, 1.0, (1, 12, 6), &Device::Cpu).unwrap();
        let a = trainer.synth.infer(&c).unwrap();
        let b = resumed.synth.infer(&c).unwrap();
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_train_epoch_and_evaluate_on_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config();
        let dev = Device::Cpu;

        let mut lines = String::new();
        for (i, frames) in [10usize, 9, 4].iter().enumerate() {
            let wav = dir.path().join(format!("{}.wav", i));
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: config.data.sampling_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut writer = hound::WavWriter::create(&wav, spec).unwrap();
            for n in 0..frames * 16 {
                writer.write_sample(((n as f32 * 0.1).sin() * 8000.0) as i16).unwrap();
            }
            writer.finalize().unwrap();
            Tensor::randn(0f32, 1.0, (12, *frames), &dev)
                .unwrap()
                .write_npy(dir.path().join(format!("{}.npy", i)))
                .unwrap();
            lines.push_str(&format!("{}.wav|{}.npy\n", i, i));
        }
        let list = dir.path().join("train.txt");
        std::fs::write(&list, lines).unwrap();

        let dataset = FilelistDataset::open(&list, &config, &dev).unwrap();
        let mut trainer = GanTrainer::new(&config, &dev).unwrap();
        let mut seen = 0;
        let summary = trainer.train_epoch(&dataset, |_| seen += 1).unwrap();

        assert_eq!(summary.epoch, 0);
        assert_eq!(summary.steps, seen);
        assert!(summary.steps >= 1);
        assert!(summary.mean_loss_total.is_finite());
        assert_eq!(trainer.state().epoch, 1);

        let error = trainer.evaluate(&dataset).unwrap();
        assert!(error.is_finite() && error >= 0.0);
    }

    #[test]
    fn test_load_checkpoint_rejects_other_discriminators() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config();
        GanTrainer::new(&config, &Device::Cpu)
            .unwrap()
            .save_checkpoint(dir.path())
            .unwrap();

        let mut other = tiny_config();
        other.model.periods = vec![2, 3, 5];
        let mut trainer = GanTrainer::new(&other, &Device::Cpu).unwrap();
        assert!(trainer.load_checkpoint(dir.path()).is_err());
    }
}
