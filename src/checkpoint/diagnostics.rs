//! Checkpoint key diagnostics
//!
//! `VarMap::load` stops at the first missing tensor. Inspecting the file
//! first gives a full report of missing, extra and mis-shaped tensors for
//! each model component.

use anyhow::{anyhow, Result};
use candle_core::{safetensors, Device};
use candle_nn::VarMap;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

/// Key report for one checkpoint file
#[derive(Debug, Clone)]
pub struct ComponentReport {
    /// Name of the component (e.g. "generator", "discriminator")
    pub component_name: String,
    /// File the report was built from
    pub file_path: String,
    /// Keys the model expects
    pub expected_keys: BTreeSet<String>,
    /// Expected keys present in the file with the right shape
    pub found_keys: BTreeSet<String>,
    /// Expected keys absent from the file
    pub missing_keys: BTreeSet<String>,
    /// Keys in the file the model does not use
    pub extra_keys: BTreeSet<String>,
    /// Keys present with a different shape: (key, expected, found)
    pub shape_mismatches: Vec<(String, Vec<usize>, Vec<usize>)>,
}

impl ComponentReport {
    /// Ratio of usable keys to expected keys
    pub fn success_rate(&self) -> f32 {
        if self.expected_keys.is_empty() {
            return 1.0;
        }
        self.found_keys.len() as f32 / self.expected_keys.len() as f32
    }

    /// Whether `VarMap::load` would succeed on this file
    pub fn is_complete(&self) -> bool {
        self.missing_keys.is_empty() && self.shape_mismatches.is_empty()
    }

    /// Log a summary, listing at most ten offending keys
    pub fn log_summary(&self) {
        info!(
            "{}: {} expected, {} found, {} missing, {} extra ({})",
            self.component_name,
            self.expected_keys.len(),
            self.found_keys.len(),
            self.missing_keys.len(),
            self.extra_keys.len(),
            self.file_path
        );
        for key in self.missing_keys.iter().take(10) {
            warn!("  missing: {}", key);
        }
        if self.missing_keys.len() > 10 {
            warn!("  ... and {} more", self.missing_keys.len() - 10);
        }
        for (key, expected, found) in self.shape_mismatches.iter().take(10) {
            warn!("  shape mismatch: {} expected {:?}, found {:?}", key, expected, found);
        }
        for key in self.extra_keys.iter().take(10) {
            debug!("  unused: {}", key);
        }
    }
}

/// Collects reports for every component of a checkpoint
pub struct CheckpointDiagnostics {
    verbose: bool,
    reports: Vec<ComponentReport>,
}

impl CheckpointDiagnostics {
    /// Collector for reports; `verbose` also logs every matched key
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            reports: Vec::new(),
        }
    }

    /// Compare the tensors of a safetensors file with the variables of `varmap`
    pub fn inspect<P: AsRef<Path>>(
        &mut self,
        path: P,
        component_name: &str,
        varmap: &VarMap,
    ) -> Result<&ComponentReport> {
        let path = path.as_ref();
        let tensors = safetensors::load(path, &Device::Cpu)?;
        let available: HashMap<String, Vec<usize>> = tensors
            .iter()
            .map(|(k, t)| (k.clone(), t.dims().to_vec()))
            .collect();

        let expected: HashMap<String, Vec<usize>> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| anyhow!("VarMap lock poisoned"))?;
            data.iter()
                .map(|(k, v)| (k.clone(), v.dims().to_vec()))
                .collect()
        };

        let report = build_report(component_name, &path.display().to_string(), &expected, &available);
        if self.verbose || !report.is_complete() {
            report.log_summary();
        }
        self.reports.push(report);
        self.reports
            .last()
            .ok_or_else(|| anyhow!("report for {} was not recorded", component_name))
    }

    /// Reports collected so far
    pub fn reports(&self) -> &[ComponentReport] {
        &self.reports
    }

    /// True when no report has missing or mismatched keys
    pub fn all_loaded(&self) -> bool {
        self.reports.iter().all(|r| r.is_complete())
    }

    /// Missing keys summed over all reports
    pub fn total_missing(&self) -> usize {
        self.reports.iter().map(|r| r.missing_keys.len()).sum()
    }
}

fn build_report(
    component_name: &str,
    file_path: &str,
    expected: &HashMap<String, Vec<usize>>,
    available: &HashMap<String, Vec<usize>>,
) -> ComponentReport {
    let mut found_keys = BTreeSet::new();
    let mut missing_keys = BTreeSet::new();
    let mut shape_mismatches = Vec::new();

    for (key, shape) in expected {
        match available.get(key) {
            Some(found) if found == shape => {
                found_keys.insert(key.clone());
            }
            Some(found) => shape_mismatches.push((key.clone(), shape.clone(), found.clone())),
            None => {
                missing_keys.insert(key.clone());
            }
        }
    }
    shape_mismatches.sort();

    let extra_keys = available
        .keys()
        .filter(|k| !expected.contains_key(*k))
        .cloned()
        .collect();

    ComponentReport {
        component_name: component_name.to_string(),
        file_path: file_path.to_string(),
        expected_keys: expected.keys().cloned().collect(),
        found_keys,
        missing_keys,
        extra_keys,
        shape_mismatches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    fn shapes(entries: &[(&str, &[usize])]) -> HashMap<String, Vec<usize>> {
        entries
            .iter()
            .map(|(k, s)| (k.to_string(), s.to_vec()))
            .collect()
    }

    #[test]
    fn test_report_classifies_keys() {
        let expected = shapes(&[("a", &[2, 3]), ("b", &[4]), ("c", &[1])]);
        let available = shapes(&[("a", &[2, 3]), ("b", &[5]), ("d", &[1])]);
        let report = build_report("test", "test.safetensors", &expected, &available);

        assert_eq!(report.found_keys.len(), 1);
        assert!(report.missing_keys.contains("c"));
        assert!(report.extra_keys.contains("d"));
        assert_eq!(report.shape_mismatches, vec![("b".to_string(), vec![4], vec![5])]);
        assert!(!report.is_complete());
        assert!((report.success_rate() - 0.333).abs() < 0.01);
    }

    #[test]
    fn test_empty_report_is_complete() {
        let report = build_report("empty", "x", &HashMap::new(), &HashMap::new());
        assert!((report.success_rate() - 1.0).abs() < 1e-6);
        assert!(report.is_complete());
    }

    #[test]
    fn test_inspect_saved_varmap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((2, 2), "conv.weight", Init::Const(1.0)).unwrap();
        varmap.save(&path).unwrap();

        let mut diag = CheckpointDiagnostics::new(false);
        let report = diag.inspect(&path, "toy", &varmap).unwrap();
        assert!(report.is_complete());
        assert!(diag.all_loaded());
        assert_eq!(diag.total_missing(), 0);
    }
}
