//! Candidate benchmarking and selection.

use crate::cache::{ResultEntry, ResultsCache, Tolerance};
use crate::candidate::{CandidateRegistry, DynCandidate};
use crate::options::TuningOptions;
use anyhow::{anyhow, ensure, Context, Result};
use gemmtune_device::Device;
use gemmtune_params::OpParams;
use gemmtune_verifier::{NumericalVerifier, Verdict};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How [`TuningDriver::execute`] picked the candidate it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    /// Tuning disabled, or a cache miss with benchmarking turned off.
    Default,
    Cached,
    Tuned,
    /// The selected candidate failed and the default ran instead.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub candidate: String,
    pub selection: Selection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateReport {
    pub candidate: String,
    pub time_ms: Option<f64>,
    pub verdict: Option<Verdict>,
    pub rejection: Option<String>,
}

impl CandidateReport {
    fn rejected(candidate: &str, verdict: Option<Verdict>, reason: impl Into<String>) -> Self {
        Self {
            candidate: candidate.to_string(),
            time_ms: None,
            verdict,
            rejection: Some(reason.into()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.rejection.is_none() && self.time_ms.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningOutcome {
    pub op_name: String,
    pub signature: String,
    pub winner: String,
    pub time_ms: f64,
    pub tolerance: Option<Tolerance>,
    pub gflops: f64,
    pub reports: Vec<CandidateReport>,
}

impl TuningOutcome {
    pub fn entry(&self) -> ResultEntry {
        ResultEntry {
            candidate: self.winner.clone(),
            time_ms: self.time_ms,
            tolerance: self.tolerance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationPlan {
    pub warmup: usize,
    pub timed: usize,
}

impl IterationPlan {
    pub fn from_probe(probe_ms: f64, options: &TuningOptions) -> Self {
        let warmup = budget(
            probe_ms,
            options.max_warmup_duration_ms,
            options.max_warmup_iterations,
        )
        .unwrap_or(0);
        let timed = budget(
            probe_ms,
            options.max_tuning_duration_ms,
            options.max_tuning_iterations,
        )
        .unwrap_or(1)
        .max(1);
        Self { warmup, timed }
    }
}

/// Floor for one measured run, so a duration limit always yields a finite
/// iteration count.
const MIN_RUN_MS: f64 = 1e-3;

fn budget(probe_ms: f64, max_duration_ms: u64, max_iterations: usize) -> Option<usize> {
    let run_ms = if probe_ms.is_finite() { probe_ms.max(MIN_RUN_MS) } else { MIN_RUN_MS };
    let by_duration =
        (max_duration_ms > 0).then(|| (max_duration_ms as f64 / run_ms).floor() as usize);
    let by_count = (max_iterations > 0).then_some(max_iterations);
    match (by_duration, by_count) {
        (Some(d), Some(c)) => Some(d.min(c)),
        (Some(d), None) => Some(d),
        (None, Some(c)) => Some(c),
        (None, None) => None,
    }
}

/// Selects, caches and runs the fastest numerically sound candidate for each
/// invocation. `&mut self` serializes tuning, so a signature is benchmarked
/// at most once at a time.
pub struct TuningDriver {
    options: TuningOptions,
    verifier: NumericalVerifier,
    cache: ResultsCache,
}

impl TuningDriver {
    pub fn new(options: TuningOptions, cache: ResultsCache) -> Self {
        let verifier = NumericalVerifier::new(options.tolerance_ladder.clone());
        Self {
            options,
            verifier,
            cache,
        }
    }

    /// Driver whose cache is loaded from `options.results_file`, keeping only
    /// results recorded on `device`.
    pub fn for_device<D: Device + ?Sized>(options: TuningOptions, device: &D) -> Result<Self> {
        let info = device.info();
        let cache = match &options.results_file {
            Some(path) => ResultsCache::load_for_device(path, &info)?,
            None => ResultsCache::for_device(&info),
        };
        Ok(Self::new(options, cache))
    }

    pub fn options(&self) -> &TuningOptions {
        &self.options
    }

    pub fn verifier(&self) -> &NumericalVerifier {
        &self.verifier
    }

    pub fn cache(&self) -> &ResultsCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ResultsCache {
        &mut self.cache
    }

    pub fn persist(&self) -> Result<()> {
        if let Some(path) = &self.options.results_file {
            self.cache.save_to_file(path)?;
            debug!(path = %path.display(), entries = self.cache.len(), "persisted tuning results");
        }
        Ok(())
    }

    /// Run `params` with the best known candidate, tuning on a cache miss.
    /// A failing selection falls back to the default candidate; only a
    /// failure of the default itself is returned.
    pub fn execute<P, D>(
        &mut self,
        registry: &CandidateRegistry<P, D>,
        params: &P,
        device: &D,
    ) -> Result<Execution>
    where
        P: OpParams,
        D: Device + ?Sized,
    {
        let default = Arc::clone(
            registry
                .default_candidate()
                .ok_or_else(|| anyhow!("no candidates registered"))?,
        );

        let (candidate, selection) = self.select(registry, &default, params, device);
        if Arc::ptr_eq(&candidate, &default) {
            default.run(params, device).with_context(|| {
                format!("default candidate {} failed on {}", default.name(), params.signature())
            })?;
            return Ok(Execution {
                candidate: default.name().to_string(),
                selection,
            });
        }

        match candidate.run(params, device) {
            Ok(()) => Ok(Execution {
                candidate: candidate.name().to_string(),
                selection,
            }),
            Err(err) => {
                warn!(
                    candidate = candidate.name(),
                    signature = %params.signature(),
                    error = %format!("{err:#}"),
                    "selected candidate failed, running default"
                );
                default.run(params, device).with_context(|| {
                    format!("default candidate {} failed on {}", default.name(), params.signature())
                })?;
                Ok(Execution {
                    candidate: default.name().to_string(),
                    selection: Selection::Fallback,
                })
            }
        }
    }

    fn select<P, D>(
        &mut self,
        registry: &CandidateRegistry<P, D>,
        default: &DynCandidate<P, D>,
        params: &P,
        device: &D,
    ) -> (DynCandidate<P, D>, Selection)
    where
        P: OpParams,
        D: Device + ?Sized,
    {
        if !self.options.enabled {
            return (Arc::clone(default), Selection::Default);
        }

        let op_name = params.op_name();
        let signature = params.signature();
        if let Some(entry) = self.cache.lookup(&op_name, &signature) {
            match registry.find(&entry.candidate) {
                Some(candidate) if candidate.supports(params) => {
                    debug!(op = %op_name, signature = %signature, candidate = candidate.name(), "tuning cache hit");
                    return (Arc::clone(candidate), Selection::Cached);
                }
                _ => {
                    warn!(
                        op = %op_name,
                        signature = %signature,
                        candidate = %entry.candidate,
                        "cached candidate is not available, ignoring entry"
                    );
                }
            }
        }

        if !self.options.tuning {
            return (Arc::clone(default), Selection::Default);
        }

        match self.tune(registry, params, device) {
            Ok(outcome) => {
                self.cache.insert(&op_name, &signature, outcome.entry());
                match registry.find(&outcome.winner) {
                    Some(winner) => (Arc::clone(winner), Selection::Tuned),
                    None => (Arc::clone(default), Selection::Default),
                }
            }
            Err(err) => {
                warn!(
                    op = %op_name,
                    signature = %signature,
                    error = %format!("{err:#}"),
                    "tuning failed, using default candidate"
                );
                (Arc::clone(default), Selection::Default)
            }
        }
    }

    /// Benchmark every supported candidate against isolated copies of
    /// `params` and return the fastest one that agrees with the default.
    /// The caller's buffers are never written.
    pub fn tune<P, D>(
        &self,
        registry: &CandidateRegistry<P, D>,
        params: &P,
        device: &D,
    ) -> Result<TuningOutcome>
    where
        P: OpParams,
        D: Device + ?Sized,
    {
        params.validate()?;
        let default = registry
            .default_candidate()
            .ok_or_else(|| anyhow!("no candidates registered"))?;
        ensure!(
            default.supports(params),
            "default candidate {} does not support {}",
            default.name(),
            params.signature()
        );

        let op_name = params.op_name();
        let signature = params.signature();
        info!(op = %op_name, signature = %signature, candidates = registry.len(), "tuning");

        let mut reference = params.isolate(device, false)?;
        let reference_run = default
            .run(&reference, device)
            .and_then(|()| Ok(device.synchronize(device.current_stream())?));
        if let Err(err) = reference_run {
            release_logged(&mut reference, device);
            return Err(err.context(format!("reference run of {} failed", default.name())));
        }

        let mut reports = Vec::with_capacity(registry.len());
        for (index, candidate) in registry.candidates().iter().enumerate() {
            let report = if !candidate.supports(params) {
                CandidateReport::rejected(candidate.name(), None, "unsupported")
            } else {
                self.evaluate(candidate, index == 0, params, &reference, device)
            };
            match &report.rejection {
                Some(reason) if index > 0 => {
                    warn!(candidate = candidate.name(), signature = %signature, reason = %reason, "candidate rejected");
                }
                _ => {
                    debug!(candidate = candidate.name(), time_ms = ?report.time_ms, verdict = ?report.verdict, "candidate measured");
                }
            }
            reports.push(report);
        }
        reference.release(device)?;

        let default_report = &reports[0];
        if let Some(reason) = &default_report.rejection {
            return Err(anyhow!("default candidate {} failed: {reason}", default.name()));
        }

        let winner = reports
            .iter()
            .filter(|report| report.is_accepted())
            .fold(None::<&CandidateReport>, |best, report| match best {
                Some(best) if best.time_ms <= report.time_ms => Some(best),
                _ => Some(report),
            })
            .ok_or_else(|| anyhow!("no candidate survived tuning"))?;

        let time_ms = winner.time_ms.unwrap_or_default();
        let gflops = if time_ms > 0.0 {
            params.flops() as f64 / (time_ms * 1e6)
        } else {
            0.0
        };
        let outcome = TuningOutcome {
            op_name,
            signature,
            winner: winner.candidate.clone(),
            time_ms,
            tolerance: winner.verdict.as_ref().and_then(Tolerance::from_verdict),
            gflops,
            reports: reports.clone(),
        };
        info!(
            op = %outcome.op_name,
            signature = %outcome.signature,
            winner = %outcome.winner,
            time_ms = outcome.time_ms,
            gflops = outcome.gflops,
            tolerance = ?outcome.tolerance,
            "tuning decision"
        );
        Ok(outcome)
    }

    fn evaluate<P, D>(
        &self,
        candidate: &DynCandidate<P, D>,
        is_default: bool,
        params: &P,
        reference: &P,
        device: &D,
    ) -> CandidateReport
    where
        P: OpParams,
        D: Device + ?Sized,
    {
        let name = candidate.name();
        let verdict = if self.options.numerical_check && !is_default {
            let checked = with_isolated(params, device, false, |trial| {
                candidate.run(trial, device)?;
                Ok(reference.verify_against(trial, device, &self.verifier)?)
            });
            match checked {
                Ok(verdict) if verdict.is_agreement() => Some(verdict),
                Ok(verdict) => {
                    return CandidateReport::rejected(name, Some(verdict), "numerical mismatch")
                }
                Err(err) => return CandidateReport::rejected(name, None, format!("{err:#}")),
            }
        } else {
            None
        };

        match self.time(candidate, params, device) {
            Ok(time_ms) => CandidateReport {
                candidate: name.to_string(),
                time_ms: Some(time_ms),
                verdict,
                rejection: None,
            },
            Err(err) => CandidateReport::rejected(name, verdict, format!("{err:#}")),
        }
    }

    fn time<P, D>(&self, candidate: &DynCandidate<P, D>, params: &P, device: &D) -> Result<f64>
    where
        P: OpParams,
        D: Device + ?Sized,
    {
        let stream = device.current_stream();
        let probe_ms = with_isolated(params, device, false, |trial| {
            device.synchronize(stream)?;
            let start = Instant::now();
            candidate.run(trial, device)?;
            device.synchronize(stream)?;
            Ok(millis(start.elapsed()))
        })?;
        let plan = IterationPlan::from_probe(probe_ms, &self.options);

        let rotate = self.options.rotating_buffer_bytes > 0;
        let copy_bytes = params.total_size(rotate).max(1);
        let count = if rotate {
            self.options.rotating_buffer_bytes / copy_bytes + 1
        } else {
            1
        };

        let mut copies = Vec::with_capacity(count);
        for _ in 0..count {
            match params.isolate(device, rotate) {
                Ok(copy) => copies.push(copy),
                Err(err) => {
                    release_all(&mut copies, device);
                    return Err(err.into());
                }
            }
        }

        let timed = (|| -> Result<f64> {
            for i in 0..plan.warmup {
                candidate.run(&copies[i % count], device)?;
            }
            device.synchronize(stream)?;
            let start = Instant::now();
            for i in 0..plan.timed {
                candidate.run(&copies[i % count], device)?;
            }
            device.synchronize(stream)?;
            Ok(millis(start.elapsed()) / plan.timed as f64)
        })();
        release_all(&mut copies, device);

        let time_ms = timed?;
        debug!(
            candidate = candidate.name(),
            probe_ms,
            warmup = plan.warmup,
            iterations = plan.timed,
            copies = count,
            time_ms,
            "timed candidate"
        );
        Ok(time_ms)
    }
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

/// Run `f` on an isolated copy of `params`, releasing the copy afterwards on
/// every path.
fn with_isolated<P, D, T, F>(params: &P, device: &D, duplicate_inputs: bool, f: F) -> Result<T>
where
    P: OpParams,
    D: Device + ?Sized,
    F: FnOnce(&P) -> Result<T>,
{
    let mut trial = params.isolate(device, duplicate_inputs)?;
    let result = f(&trial);
    match result {
        Ok(value) => {
            trial.release(device)?;
            Ok(value)
        }
        Err(err) => {
            release_logged(&mut trial, device);
            Err(err)
        }
    }
}

fn release_logged<P, D>(params: &mut P, device: &D)
where
    P: OpParams,
    D: Device + ?Sized,
{
    if let Err(err) = params.release(device) {
        warn!(error = %err, "failed to release isolated operands");
    }
}

fn release_all<P, D>(copies: &mut Vec<P>, device: &D)
where
    P: OpParams,
    D: Device + ?Sized,
{
    for mut copy in copies.drain(..) {
        release_logged(&mut copy, device);
    }
}
