//! Training data: filelists, sample loading and batch collation
//!
//! A filelist has one `wav_path|embedding_path` pair per line. The
//! embedding is a precomputed content representation (`.npy` or
//! `.safetensors`) with one frame per `hop_length` waveform samples.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::audio::AudioLoader;
use crate::checkpoint::load_tensor;
use crate::config::ModelConfig;
use crate::error::VcError;
use crate::utils::tensor_utils::sequence_mask;

/// One filelist entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Waveform path
    pub wav: PathBuf,
    /// Content embedding path
    pub embedding: PathBuf,
}

/// Parse a filelist; relative paths resolve against the filelist's directory
pub fn parse_filelist<P: AsRef<Path>>(path: P) -> Result<Vec<FileEntry>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read filelist {:?}", path))?;
    let base = path.parent().unwrap_or(Path::new("."));

    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split('|');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(wav), Some(embedding), None) if !wav.is_empty() && !embedding.is_empty() => {
                entries.push(FileEntry {
                    wav: base.join(wav.trim()),
                    embedding: base.join(embedding.trim()),
                });
            }
            _ => bail!(
                "{:?} line {}: expected `wav_path|embedding_path`, got {:?}",
                path,
                lineno + 1,
                line
            ),
        }
    }
    Ok(entries)
}

/// A loaded utterance with frame-aligned audio
#[derive(Debug, Clone)]
pub struct Sample {
    /// Content embedding (ssl_dim, frames)
    pub content: Tensor,
    /// Waveform, exactly `frames * hop_length` samples
    pub audio: Vec<f32>,
}

impl Sample {
    /// Number of content frames
    pub fn frames(&self) -> Result<usize> {
        Ok(self.content.dim(1)?)
    }
}

/// Bring an embedding into (ssl_dim, frames) layout
///
/// Accepts (ssl_dim, T), (T, ssl_dim) and a leading batch axis of one.
pub fn normalize_embedding(embedding: Tensor, ssl_dim: usize) -> Result<Tensor> {
    let embedding = match embedding.rank() {
        3 if embedding.dim(0)? == 1 => embedding.squeeze(0)?,
        2 => embedding,
        _ => bail!(VcError::shape_mismatch(&[ssl_dim, 0], embedding.dims())),
    };
    let (a, b) = embedding.dims2()?;
    if a == ssl_dim {
        Ok(embedding)
    } else if b == ssl_dim {
        Ok(embedding.t()?.contiguous()?)
    } else {
        bail!(VcError::shape_mismatch(&[ssl_dim, b], &[a, b]))
    }
}

/// Filelist-backed dataset
pub struct FilelistDataset {
    entries: Vec<FileEntry>,
    ssl_dim: usize,
    hop_length: usize,
    sampling_rate: u32,
    min_frames: usize,
    device: Device,
}

impl FilelistDataset {
    /// Open the filelist at `path` with the data settings of `config`
    pub fn open<P: AsRef<Path>>(path: P, config: &ModelConfig, device: &Device) -> Result<Self> {
        let entries = parse_filelist(path.as_ref())?;
        if entries.is_empty() {
            bail!("Filelist {:?} has no entries", path.as_ref());
        }
        debug!("{} utterances in {:?}", entries.len(), path.as_ref());
        Ok(Self::from_entries(entries, config, device))
    }

    /// Dataset over already parsed entries
    pub fn from_entries(entries: Vec<FileEntry>, config: &ModelConfig, device: &Device) -> Self {
        Self {
            entries,
            ssl_dim: config.model.ssl_dim,
            hop_length: config.data.hop_length,
            sampling_rate: config.data.sampling_rate,
            min_frames: config.train.segment_size,
            device: device.clone(),
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parsed filelist entries
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Load entry `index`, cropping embedding and audio to a common length
    pub fn load(&self, index: usize) -> Result<Sample> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| VcError::InvalidInput(format!("no filelist entry {}", index)))?;

        let content = load_tensor(&entry.embedding, None, &self.device)?;
        let content = normalize_embedding(content, self.ssl_dim)
            .with_context(|| format!("Bad embedding {:?}", entry.embedding))?;
        let mut audio = AudioLoader::load(&entry.wav, self.sampling_rate)?;

        let embedded_frames = content.dim(1)?;
        let audio_frames = audio.len() / self.hop_length;
        let frames = embedded_frames.min(audio_frames);
        if frames == 0 {
            bail!(VcError::InvalidInput(format!(
                "{:?}: no complete frame ({} embedding frames, {} samples)",
                entry.wav,
                embedded_frames,
                audio.len()
            )));
        }
        if embedded_frames.abs_diff(audio_frames) > 1 {
            warn!(
                "{:?}: {} embedding frames for {} audio frames",
                entry.wav, embedded_frames, audio_frames
            );
        }

        audio.truncate(frames * self.hop_length);
        let content = content.narrow(1, 0, frames)?;
        Ok(Sample { content, audio })
    }

    /// Shuffled index batches for one epoch
    ///
    /// Entries too short for a training segment are skipped at load time
    /// by `load_batch`, not here.
    pub fn batches<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.shuffle(rng);
        order
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Load and collate the given entries, dropping those shorter than a segment
    pub fn load_batch(&self, indices: &[usize]) -> Result<Option<Batch>> {
        let mut samples = Vec::with_capacity(indices.len());
        for &index in indices {
            let sample = self.load(index)?;
            if sample.frames()? < self.min_frames {
                debug!(
                    "Skipping {:?}: {} frames",
                    self.entries[index].wav,
                    sample.frames()?
                );
                continue;
            }
            samples.push(sample);
        }
        if samples.is_empty() {
            return Ok(None);
        }
        collate(&samples, self.hop_length).map(Some)
    }
}

/// Zero-padded batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// (batch, ssl_dim, max_frames)
    pub content: Tensor,
    /// Valid frames per element
    pub lengths: Vec<usize>,
    /// (batch, 1, max_frames * hop_length)
    pub audio: Tensor,
}

impl Batch {
    /// Number of utterances in the batch
    pub fn size(&self) -> usize {
        self.lengths.len()
    }

    /// (batch, 1, max_frames) mask of valid frames
    pub fn frame_mask(&self) -> Result<Tensor> {
        let max_frames = self.content.dim(2)?;
        sequence_mask(&self.lengths, max_frames, self.content.device())?
            .unsqueeze(1)
            .map_err(Into::into)
    }
}

/// Pad samples to the longest one and stack them
pub fn collate(samples: &[Sample], hop_length: usize) -> Result<Batch> {
    if samples.is_empty() {
        bail!(VcError::InvalidInput("cannot collate an empty batch".into()));
    }
    let device = samples[0].content.device().clone();
    let lengths = samples
        .iter()
        .map(Sample::frames)
        .collect::<Result<Vec<_>>>()?;
    let max_frames = lengths.iter().copied().max().unwrap_or(0);
    let max_samples = max_frames * hop_length;

    let mut contents = Vec::with_capacity(samples.len());
    let mut audio = vec![0f32; samples.len() * max_samples];
    for (b, sample) in samples.iter().enumerate() {
        let frames = lengths[b];
        let content = if frames < max_frames {
            sample.content.pad_with_zeros(1, 0, max_frames - frames)?
        } else {
            sample.content.clone()
        };
        contents.push(content);

        let row = &mut audio[b * max_samples..(b + 1) * max_samples];
        let n = sample.audio.len().min(max_samples);
        row[..n].copy_from_slice(&sample.audio[..n]);
    }

    let content = Tensor::stack(&contents, 0)?;
    let audio = Tensor::from_vec(audio, (samples.len(), 1, max_samples), &device)?;
    Ok(Batch {
        content,
        lengths,
        audio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn write_wav(path: &Path, samples: &[f32], sr: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: sr,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn small_config() -> ModelConfig {
        let mut config = ModelConfig::default();
        config.data.hop_length = 4;
        config.data.sampling_rate = 8000;
        config.model.ssl_dim = 3;
        config.train.segment_size = 2;
        config
    }

    #[test]
    fn test_parse_filelist() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("train.txt");
        let mut f = std::fs::File::create(&list).unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f, "a.wav|a.npy").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "/abs/b.wav | b.safetensors").unwrap();
        drop(f);

        let entries = parse_filelist(&list).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].wav, dir.path().join("a.wav"));
        assert_eq!(entries[1].wav, PathBuf::from("/abs/b.wav"));
        assert_eq!(entries[1].embedding, dir.path().join("b.safetensors"));
    }

    #[test]
    fn test_parse_filelist_rejects_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("bad.txt");
        std::fs::write(&list, "only_one_field.wav\n").unwrap();
        assert!(parse_filelist(&list).is_err());
        std::fs::write(&list, "a|b|c\n").unwrap();
        assert!(parse_filelist(&list).is_err());
    }

    #[test]
    fn test_normalize_embedding_layouts() {
        let dev = Device::Cpu;
        let dt = Tensor::zeros((3, 7), candle_core::DType::F32, &dev).unwrap();
        let td = Tensor::zeros((7, 3), candle_core::DType::F32, &dev).unwrap();
        let bdt = Tensor::zeros((1, 3, 7), candle_core::DType::F32, &dev).unwrap();
        for t in [dt, td, bdt] {
            assert_eq!(normalize_embedding(t, 3).unwrap().dims(), &[3, 7]);
        }
        let wrong = Tensor::zeros((5, 7), candle_core::DType::F32, &dev).unwrap();
        assert!(normalize_embedding(wrong, 3).is_err());
    }

    #[test]
    fn test_load_crops_to_common_length() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config();
        let dev = Device::Cpu;

        // 5 embedding frames, audio for 4.5 frames
        write_wav(&dir.path().join("a.wav"), &vec![0.1f32; 18], 8000);
        let emb = Tensor::ones((5, 3), candle_core::DType::F32, &dev).unwrap();
        emb.write_npy(dir.path().join("a.npy")).unwrap();

        let dataset = FilelistDataset::from_entries(
            vec![FileEntry {
                wav: dir.path().join("a.wav"),
                embedding: dir.path().join("a.npy"),
            }],
            &config,
            &dev,
        );
        let sample = dataset.load(0).unwrap();
        assert_eq!(sample.content.dims(), &[3, 4]);
        assert_eq!(sample.audio.len(), 16);
        assert!(dataset.load(1).is_err());
    }

    #[test]
    fn test_load_rejects_audio_shorter_than_a_hop() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config();
        let dev = Device::Cpu;

        write_wav(&dir.path().join("tiny.wav"), &[0.1f32; 3], 8000);
        Tensor::ones((3, 2), candle_core::DType::F32, &dev)
            .unwrap()
            .write_npy(dir.path().join("tiny.npy"))
            .unwrap();

        let dataset = FilelistDataset::from_entries(
            vec![FileEntry {
                wav: dir.path().join("tiny.wav"),
                embedding: dir.path().join("tiny.npy"),
            }],
            &config,
            &dev,
        );
        let err = dataset.load(0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VcError>(),
            Some(VcError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_collate_pads_and_masks() {
        let dev = Device::Cpu;
        let a = Sample {
            content: Tensor::ones((3, 4), candle_core::DType::F32, &dev).unwrap(),
            audio: vec![0.5; 16],
        };
        let b = Sample {
            content: Tensor::ones((3, 2), candle_core::DType::F32, &dev).unwrap(),
            audio: vec![0.5; 8],
        };
        let batch = collate(&[a, b], 4).unwrap();
        assert_eq!(batch.content.dims(), &[2, 3, 4]);
        assert_eq!(batch.audio.dims(), &[2, 1, 16]);
        assert_eq!(batch.lengths, vec![4, 2]);

        let audio = batch.audio.to_vec3::<f32>().unwrap();
        assert_eq!(audio[1][0][7], 0.5);
        assert_eq!(audio[1][0][8], 0.0);
        let content = batch.content.to_vec3::<f32>().unwrap();
        assert_eq!(content[1][0], vec![1.0, 1.0, 0.0, 0.0]);

        let mask = batch.frame_mask().unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(mask[1][0], vec![1.0, 1.0, 0.0, 0.0]);
        assert!(collate(&[], 4).is_err());
    }

    #[test]
    fn test_batches_cover_every_entry_once() {
        let config = small_config();
        let entries = (0..7)
            .map(|i| FileEntry {
                wav: PathBuf::from(format!("{}.wav", i)),
                embedding: PathBuf::from(format!("{}.npy", i)),
            })
            .collect();
        let dataset = FilelistDataset::from_entries(entries, &config, &Device::Cpu);
        let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(5);
        let batches = dataset.batches(3, &mut rng);
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 1]);

        let mut seen: HashMap<usize, usize> = HashMap::new();
        for idx in batches.into_iter().flatten() {
            *seen.entry(idx).or_default() += 1;
        }
        assert_eq!(seen.len(), 7);
        assert!(seen.values().all(|&n| n == 1));
    }

    #[test]
    fn test_load_batch_skips_short_utterances() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config();
        config.train.segment_size = 3;
        let dev = Device::Cpu;

        write_wav(&dir.path().join("long.wav"), &vec![0.1f32; 16], 8000);
        write_wav(&dir.path().join("short.wav"), &vec![0.1f32; 8], 8000);
        Tensor::ones((3, 4), candle_core::DType::F32, &dev)
            .unwrap()
            .write_npy(dir.path().join("long.npy"))
            .unwrap();
        Tensor::ones((3, 2), candle_core::DType::F32, &dev)
            .unwrap()
            .write_npy(dir.path().join("short.npy"))
            .unwrap();

        let entry = |name: &str| FileEntry {
            wav: dir.path().join(format!("{}.wav", name)),
            embedding: dir.path().join(format!("{}.npy", name)),
        };
        let dataset =
            FilelistDataset::from_entries(vec![entry("long"), entry("short")], &config, &dev);

        let batch = dataset.load_batch(&[0, 1]).unwrap().unwrap();
        assert_eq!(batch.size(), 1);
        assert!(dataset.load_batch(&[1]).unwrap().is_none());
    }
}
