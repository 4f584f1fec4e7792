//! Loading and saving tensors by file extension

use anyhow::{bail, Context, Result};
use candle_core::{safetensors, DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

/// On-disk tensor container, chosen from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorFormat {
    Npy,
    Safetensors,
}

impl TensorFormat {
    /// Format from the file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("npy") => Ok(TensorFormat::Npy),
            Some("safetensors") => Ok(TensorFormat::Safetensors),
            other => bail!(
                "Unsupported tensor file extension {:?} for {:?} (expected .npy or .safetensors)",
                other,
                path
            ),
        }
    }
}

/// Load every tensor of a file as f32 on `device`
///
/// A `.npy` file yields a single entry named after the file stem.
pub fn load_tensor_map<P: AsRef<Path>>(path: P, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    let raw = match TensorFormat::from_path(path)? {
        TensorFormat::Safetensors => safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("Failed to read safetensors file {:?}", path))?,
        TensorFormat::Npy => {
            let tensor = Tensor::read_npy(path)
                .with_context(|| format!("Failed to read npy file {:?}", path))?;
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("tensor")
                .to_string();
            HashMap::from([(name, tensor)])
        }
    };

    raw.into_iter()
        .map(|(name, t)| Ok((name, t.to_dtype(DType::F32)?.to_device(device)?)))
        .collect()
}

/// Load one tensor from a file
///
/// `key` selects a tensor inside a safetensors file; without it the file
/// must hold exactly one tensor. `key` is ignored for `.npy` files.
pub fn load_tensor<P: AsRef<Path>>(path: P, key: Option<&str>, device: &Device) -> Result<Tensor> {
    let path = path.as_ref();
    let format = TensorFormat::from_path(path)?;
    let mut tensors = load_tensor_map(path, device)?;

    if format == TensorFormat::Safetensors {
        if let Some(key) = key {
            return tensors
                .remove(key)
                .with_context(|| format!("Tensor {:?} not found in {:?}", key, path));
        }
    }

    if tensors.len() != 1 {
        let mut names: Vec<_> = tensors.keys().cloned().collect();
        names.sort();
        bail!(
            "{:?} holds {} tensors ({:?}); name the one to load",
            path,
            tensors.len(),
            names
        );
    }
    tensors
        .into_values()
        .next()
        .with_context(|| format!("No tensor in {:?}", path))
}

/// Save named tensors as a safetensors file
pub fn save_tensor_map<P: AsRef<Path>>(tensors: &HashMap<String, Tensor>, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }
    safetensors::save(tensors, path).with_context(|| format!("Failed to write {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            TensorFormat::from_path(Path::new("a/b.npy")).unwrap(),
            TensorFormat::Npy
        );
        assert_eq!(
            TensorFormat::from_path(Path::new("codebook.safetensors")).unwrap(),
            TensorFormat::Safetensors
        );
        assert!(TensorFormat::from_path(Path::new("codebook.pt")).is_err());
    }

    #[test]
    fn test_npy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("centroids.npy");
        let t = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((3, 4))
            .unwrap();
        t.write_npy(&path).unwrap();

        let loaded = load_tensor(&path, None, &Device::Cpu).unwrap();
        assert_eq!(loaded.dims(), &[3, 4]);
        let values: Vec<Vec<f32>> = loaded.to_vec2().unwrap();
        assert_eq!(values[2][3], 11.0);
    }

    #[test]
    fn test_safetensors_needs_key_when_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/pair.safetensors");
        let tensors = HashMap::from([
            ("a".to_string(), Tensor::ones(2, DType::F32, &Device::Cpu).unwrap()),
            ("b".to_string(), Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap()),
        ]);
        save_tensor_map(&tensors, &path).unwrap();

        assert!(load_tensor(&path, None, &Device::Cpu).is_err());
        let b = load_tensor(&path, Some("b"), &Device::Cpu).unwrap();
        assert_eq!(b.dims(), &[3]);
        assert!(load_tensor(&path, Some("c"), &Device::Cpu).is_err());
    }
}
