//! Reproducible JSON reports of tuning runs.

use crate::case::{TuneCase, Variant};
use gemmtune_autotune::{CandidateReport, Tolerance, TuningOutcome};
use gemmtune_device::DeviceInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseReport {
    pub case: String,
    pub variant: Variant,
    pub op_name: String,
    pub signature: String,
    pub winner: String,
    pub time_ms: f64,
    pub gflops: f64,
    pub tolerance: Option<Tolerance>,
    pub candidates: Vec<CandidateReport>,
}

impl CaseReport {
    pub fn new(case: &TuneCase, outcome: TuningOutcome) -> Self {
        Self {
            case: case.name.clone(),
            variant: case.variant,
            op_name: outcome.op_name,
            signature: outcome.signature,
            winner: outcome.winner,
            time_ms: outcome.time_ms,
            gflops: outcome.gflops,
            tolerance: outcome.tolerance,
            candidates: outcome.reports,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningReport {
    pub device: DeviceInfo,
    pub generated_at_unix_ms: u128,
    pub cases: Vec<CaseReport>,
}

#[derive(Debug)]
pub struct CaseDelta<'a> {
    pub current: &'a CaseReport,
    pub baseline: &'a CaseReport,
    pub time_ms_delta: f64,
    pub gflops_delta: f64,
    pub winner_changed: bool,
}

impl TuningReport {
    pub fn as_map(&self) -> BTreeMap<&str, &CaseReport> {
        self.cases
            .iter()
            .map(|case| (case.case.as_str(), case))
            .collect()
    }

    /// Per-case changes against `baseline`, for cases present in both.
    pub fn diff<'a>(&'a self, baseline: &'a TuningReport) -> BTreeMap<&'a str, CaseDelta<'a>> {
        let previous = baseline.as_map();
        self.as_map()
            .into_iter()
            .filter_map(|(name, current)| {
                let baseline = *previous.get(name)?;
                Some((
                    name,
                    CaseDelta {
                        current,
                        baseline,
                        time_ms_delta: current.time_ms - baseline.time_ms,
                        gflops_delta: current.gflops - baseline.gflops,
                        winner_changed: current.winner != baseline.winner,
                    },
                ))
            })
            .collect()
    }
}
