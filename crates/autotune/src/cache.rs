//! Persistent tuning results keyed by op name and signature.

use anyhow::{Context, Result};
use gemmtune_device::DeviceInfo;
use gemmtune_verifier::Verdict;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const VALIDATOR_DEVICE: &str = "device";
pub const VALIDATOR_BACKEND: &str = "backend";
pub const VALIDATOR_VERSION: &str = "gemmtune_version";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Tolerance {
    pub fn from_verdict(verdict: &Verdict) -> Option<Self> {
        verdict
            .tolerance()
            .map(|(atol, rtol)| Tolerance { atol, rtol })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub candidate: String,
    pub time_ms: f64,
    /// Tightest tolerance at which the winner matched the default, when
    /// numerical checking was on.
    #[serde(default)]
    pub tolerance: Option<Tolerance>,
}

/// `op_name -> signature -> winner`, tagged with the environment that
/// produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsCache {
    #[serde(default)]
    validators: BTreeMap<String, String>,
    #[serde(default)]
    results: BTreeMap<String, BTreeMap<String, ResultEntry>>,
}

impl ResultsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_device(info: &DeviceInfo) -> Self {
        Self {
            validators: expected_validators(info),
            results: BTreeMap::new(),
        }
    }

    pub fn validators(&self) -> &BTreeMap<String, String> {
        &self.validators
    }

    pub fn lookup(&self, op_name: &str, signature: &str) -> Option<&ResultEntry> {
        self.results.get(op_name)?.get(signature)
    }

    pub fn insert(&mut self, op_name: &str, signature: &str, entry: ResultEntry) {
        self.results
            .entry(op_name.to_string())
            .or_default()
            .insert(signature.to_string(), entry);
    }

    pub fn remove(&mut self, op_name: &str, signature: &str) -> Option<ResultEntry> {
        let per_op = self.results.get_mut(op_name)?;
        let removed = per_op.remove(signature);
        if per_op.is_empty() {
            self.results.remove(op_name);
        }
        removed
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &ResultEntry)> {
        self.results.iter().flat_map(|(op, per_op)| {
            per_op
                .iter()
                .map(move |(signature, entry)| (op.as_str(), signature.as_str(), entry))
        })
    }

    pub fn len(&self) -> usize {
        self.results.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mismatches(&self, info: &DeviceInfo) -> Vec<String> {
        expected_validators(info)
            .into_iter()
            .filter_map(|(key, expected)| match self.validators.get(&key) {
                Some(found) if *found == expected => None,
                Some(found) => Some(format!("{key}: expected `{expected}`, found `{found}`")),
                None => Some(format!("{key}: missing")),
            })
            .collect()
    }

    /// Read a results file. A missing file yields an empty cache.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = fs::read(path)
            .with_context(|| format!("failed to read tuning results {}", path.display()))?;
        let cache = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse tuning results {}", path.display()))?;
        Ok(cache)
    }

    /// Read a results file for `info`. Entries recorded on a different
    /// device, backend or version are discarded.
    pub fn load_for_device(path: &Path, info: &DeviceInfo) -> Result<Self> {
        let cache = Self::load_from_file(path)?;
        if cache.is_empty() && cache.validators.is_empty() {
            return Ok(Self::for_device(info));
        }

        let mismatches = cache.mismatches(info);
        if !mismatches.is_empty() {
            warn!(
                path = %path.display(),
                discarded = cache.len(),
                mismatches = %mismatches.join("; "),
                "tuning results recorded in another environment, discarding"
            );
            return Ok(Self::for_device(info));
        }
        debug!(path = %path.display(), entries = cache.len(), "loaded tuning results");
        Ok(cache)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob)
            .with_context(|| format!("failed to write tuning results {}", path.display()))?;
        Ok(())
    }
}

fn expected_validators(info: &DeviceInfo) -> BTreeMap<String, String> {
    BTreeMap::from([
        (VALIDATOR_DEVICE.to_string(), info.name.clone()),
        (VALIDATOR_BACKEND.to_string(), info.backend.clone()),
        (
            VALIDATOR_VERSION.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn host() -> DeviceInfo {
        DeviceInfo {
            name: "host".to_string(),
            backend: "host".to_string(),
        }
    }

    fn entry(candidate: &str, time_ms: f64) -> ResultEntry {
        ResultEntry {
            candidate: candidate.to_string(),
            time_ms,
            tolerance: Some(Tolerance {
                atol: 1e-5,
                rtol: 1e-5,
            }),
        }
    }

    #[test]
    fn entries_are_keyed_by_op_and_signature() {
        let mut cache = ResultsCache::for_device(&host());
        cache.insert("GemmTunableOp_float_NN", "NN_4_4_4_ld_4_4_4", entry("parallel", 0.5));
        cache.insert("GemmTunableOp_float_NN", "NN_8_8_8_ld_8_8_8", entry("ndarray", 0.7));
        cache.insert("GemmTunableOp_Half_NN", "NN_4_4_4_ld_4_4_4", entry("reference", 0.9));

        assert_eq!(cache.len(), 3);
        assert_eq!(
            cache
                .lookup("GemmTunableOp_float_NN", "NN_4_4_4_ld_4_4_4")
                .unwrap()
                .candidate,
            "parallel"
        );
        assert!(cache.lookup("GemmTunableOp_float_TN", "NN_4_4_4_ld_4_4_4").is_none());
        assert!(cache.remove("GemmTunableOp_Half_NN", "NN_4_4_4_ld_4_4_4").is_some());
        assert_eq!(cache.entries().count(), 2);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("results.json");
        let mut cache = ResultsCache::for_device(&host());
        cache.insert("GemmTunableOp_float_NT", "NT_128_256_64_ld_128_64_128", entry("ndarray", 1.25));
        cache.save_to_file(&path).unwrap();

        let loaded = ResultsCache::load_for_device(&path, &host()).unwrap();
        assert_eq!(loaded, cache);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let loaded = ResultsCache::load_for_device(&dir.path().join("absent.json"), &host()).unwrap();
        assert!(loaded.is_empty());
        assert!(loaded.mismatches(&host()).is_empty());
    }

    #[test]
    fn results_from_another_device_are_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        let other = DeviceInfo {
            name: "Some Adapter".to_string(),
            backend: "vulkan".to_string(),
        };
        let mut cache = ResultsCache::for_device(&other);
        cache.insert("GemmTunableOp_float_NN", "NN_4_4_4_ld_4_4_4", entry("wgsl-tiled", 0.1));
        cache.save_to_file(&path).unwrap();

        assert_eq!(cache.mismatches(&host()).len(), 2);
        let loaded = ResultsCache::load_for_device(&path, &host()).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.validators()[VALIDATOR_DEVICE], "host");
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        fs::write(&path, b"{ not json").unwrap();
        let err = ResultsCache::load_from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse"));
    }
}
