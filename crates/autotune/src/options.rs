//! Tuning configuration.

use anyhow::{Context, Result};
use gemmtune_verifier::ToleranceLadder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

pub const ENV_PREFIX: &str = "GEMMTUNE_";

/// Knobs of the tuning driver. Limits of `0` mean "no limit from this
/// source"; iteration counts are derived from whichever limits are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningOptions {
    /// Master switch. When off every invocation runs the default candidate.
    pub enabled: bool,
    /// Benchmark on cache misses. When off, misses run the default candidate.
    pub tuning: bool,
    /// Reject candidates whose output disagrees with the default.
    pub numerical_check: bool,
    pub max_tuning_iterations: usize,
    pub max_tuning_duration_ms: u64,
    pub max_warmup_iterations: usize,
    pub max_warmup_duration_ms: u64,
    /// Bytes of isolated operand copies cycled through while timing, to keep
    /// caches cold. `0` times against a single copy.
    pub rotating_buffer_bytes: usize,
    pub results_file: Option<PathBuf>,
    pub tolerance_ladder: ToleranceLadder,
    pub allow_tf32: bool,
}

impl Default for TuningOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            tuning: true,
            numerical_check: true,
            max_tuning_iterations: 100,
            max_tuning_duration_ms: 30,
            max_warmup_iterations: 1,
            max_warmup_duration_ms: 0,
            rotating_buffer_bytes: 0,
            results_file: None,
            tolerance_ladder: ToleranceLadder::default(),
            allow_tf32: false,
        }
    }
}

impl TuningOptions {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `GEMMTUNE_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = var("ENABLED") {
            options.enabled = parse_flag("ENABLED", &value)?;
        }
        if let Some(value) = var("TUNING") {
            options.tuning = parse_flag("TUNING", &value)?;
        }
        if let Some(value) = var("NUMERICAL_CHECK") {
            options.numerical_check = parse_flag("NUMERICAL_CHECK", &value)?;
        }
        if let Some(value) = var("ALLOW_TF32") {
            options.allow_tf32 = parse_flag("ALLOW_TF32", &value)?;
        }
        if let Some(value) = var("MAX_TUNING_ITERATIONS") {
            options.max_tuning_iterations = parse_value("MAX_TUNING_ITERATIONS", &value)?;
        }
        if let Some(value) = var("MAX_TUNING_DURATION_MS") {
            options.max_tuning_duration_ms = parse_value("MAX_TUNING_DURATION_MS", &value)?;
        }
        if let Some(value) = var("MAX_WARMUP_ITERATIONS") {
            options.max_warmup_iterations = parse_value("MAX_WARMUP_ITERATIONS", &value)?;
        }
        if let Some(value) = var("MAX_WARMUP_DURATION_MS") {
            options.max_warmup_duration_ms = parse_value("MAX_WARMUP_DURATION_MS", &value)?;
        }
        if let Some(value) = var("ROTATING_BUFFER_BYTES") {
            options.rotating_buffer_bytes = parse_value("ROTATING_BUFFER_BYTES", &value)?;
        }
        if let Some(value) = var("RESULTS_FILE") {
            options.results_file = (!value.is_empty()).then(|| PathBuf::from(value));
        }

        let atols = var("ATOLS").map(|v| parse_list("ATOLS", &v)).transpose()?;
        let rtols = var("RTOLS").map(|v| parse_list("RTOLS", &v)).transpose()?;
        if atols.is_some() || rtols.is_some() {
            let current = &options.tolerance_ladder;
            let atols = atols.unwrap_or_else(|| current.atols().to_vec());
            let rtols = rtols.unwrap_or_else(|| current.rtols().to_vec());
            options.tolerance_ladder =
                ToleranceLadder::new(atols, rtols).context("invalid tolerance ladder override")?;
        }
        Ok(options)
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => anyhow::bail!("{ENV_PREFIX}{name}: expected a boolean, got `{other}`"),
    }
}

fn parse_value<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{ENV_PREFIX}{name}: cannot parse `{value}`"))
}

fn parse_list(name: &str, value: &str) -> Result<Vec<f64>> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| parse_value(name, part))
        .collect()
}
