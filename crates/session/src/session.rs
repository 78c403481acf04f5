//! Tuning session orchestration.

use crate::case::{CaseBuffers, TuneCase, Variant};
use crate::report::{CaseReport, TuningReport};
use anyhow::Result;
use gemmtune_autotune::{ResultsCache, TuningOptions, TuningOutcome};
use gemmtune_backend_cpu::{HostExecutor, HostExecutorOptions};
use gemmtune_device::Device;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub tuning: TuningOptions,
    pub clear_cache: bool,
}

impl SessionOptions {
    /// Options from `GEMMTUNE_*` variables, with the results file overridden
    /// when `results_file` is given.
    pub fn from_env(results_file: Option<PathBuf>, clear_cache: bool) -> Result<Self> {
        let mut tuning = TuningOptions::from_env()?;
        if results_file.is_some() {
            tuning.results_file = results_file;
        }
        Ok(Self { tuning, clear_cache })
    }

    pub fn to_host_options(&self) -> HostExecutorOptions {
        HostExecutorOptions {
            tuning: self.tuning.clone(),
            clear_cache: self.clear_cache,
        }
    }
}

/// Tunes cases on the host device and records the decisions.
pub struct TuningSession {
    executor: HostExecutor,
}

impl TuningSession {
    pub fn new(options: SessionOptions) -> Result<Self> {
        let executor = HostExecutor::with_options(options.to_host_options())?;
        Ok(Self { executor })
    }

    /// Benchmark every candidate for `case` on freshly uploaded operands and
    /// record the winner in the results cache.
    pub fn tune(&mut self, case: &TuneCase) -> Result<TuningOutcome> {
        let buffers = CaseBuffers::upload(&self.executor, case)?;
        let outcome = self.tune_uploaded(case, &buffers);
        let freed = buffers.free(&self.executor);
        let outcome = outcome?;
        freed?;

        self.executor
            .planner_mut()
            .driver_mut()
            .cache_mut()
            .insert(&outcome.op_name, &outcome.signature, outcome.entry());
        Ok(outcome)
    }

    fn tune_uploaded(&self, case: &TuneCase, buffers: &CaseBuffers) -> Result<TuningOutcome> {
        let planner = self.executor.planner();
        let device = self.executor.device();
        match case.variant {
            Variant::Gemm => planner.tune_gemm(&case.gemm(buffers), device),
            Variant::Bias => planner.tune_gemm_and_bias(&case.bias(buffers), device),
            Variant::Batched => planner.tune_gemm_strided_batched(&case.batched(buffers), device),
            Variant::Scaled => planner.tune_scaled_gemm(&case.scaled(buffers), device),
        }
    }

    /// Tune every case. A failing case is logged and left out of the report.
    pub fn run_suite(&mut self, cases: &[TuneCase]) -> Result<TuningReport> {
        let mut results = Vec::with_capacity(cases.len());
        for case in cases {
            match self.tune(case) {
                Ok(outcome) => {
                    info!(
                        case = %case.name,
                        winner = %outcome.winner,
                        time_ms = outcome.time_ms,
                        gflops = outcome.gflops,
                        "case tuned"
                    );
                    results.push(CaseReport::new(case, outcome));
                }
                Err(err) => {
                    warn!(case = %case.name, error = %format!("{err:#}"), "case failed");
                }
            }
        }

        let generated_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_millis();

        Ok(TuningReport {
            device: self.executor.device().info(),
            generated_at_unix_ms,
            cases: results,
        })
    }

    pub fn cache(&self) -> &ResultsCache {
        self.executor.planner().driver().cache()
    }

    pub fn executor(&self) -> &HostExecutor {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut HostExecutor {
        &mut self.executor
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.executor.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::smoke_cases;
    use tempfile::tempdir;

    fn quick(results_file: Option<PathBuf>) -> SessionOptions {
        SessionOptions {
            tuning: TuningOptions {
                max_tuning_iterations: 2,
                max_tuning_duration_ms: 0,
                results_file,
                ..TuningOptions::default()
            },
            clear_cache: false,
        }
    }

    #[test]
    fn suite_tunes_every_variant_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        let mut session = TuningSession::new(quick(Some(path.clone()))).unwrap();

        let cases = smoke_cases();
        let report = session.run_suite(&cases).unwrap();
        assert_eq!(report.cases.len(), cases.len());
        assert_eq!(session.cache().len(), cases.len());
        assert_eq!(session.executor().device().stats().live_bytes, 0);
        for case in &report.cases {
            assert!(case.candidates.iter().any(|c| c.candidate == case.winner));
        }

        session.shutdown().unwrap();
        let reloaded = TuningSession::new(quick(Some(path))).unwrap();
        assert_eq!(reloaded.cache().len(), cases.len());
    }

    #[test]
    fn options_from_env_keep_an_explicit_results_file() {
        let options = SessionOptions::from_env(Some(PathBuf::from("tuning.json")), true).unwrap();
        assert_eq!(options.tuning.results_file, Some(PathBuf::from("tuning.json")));
        assert!(options.to_host_options().clear_cache);
    }
}
