//! Descending tolerance ladders.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_TOLERANCES: [f64; 5] = [1e-1, 1e-2, 1e-3, 1e-4, 1e-5];

/// Absolute and relative tolerances, each sorted from most permissive to
/// tightest. Every `(atol, rtol)` pair of the cross product is tried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLadder", into = "RawLadder")]
pub struct ToleranceLadder {
    atols: Vec<f64>,
    rtols: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct RawLadder {
    atols: Vec<f64>,
    rtols: Vec<f64>,
}

impl ToleranceLadder {
    /// Build a ladder from arbitrary tolerances. Values are sorted in
    /// descending order and deduplicated.
    pub fn new(atols: impl Into<Vec<f64>>, rtols: impl Into<Vec<f64>>) -> Result<Self> {
        let atols = normalize(atols.into(), "atol")?;
        let rtols = normalize(rtols.into(), "rtol")?;
        Ok(Self { atols, rtols })
    }

    pub fn atols(&self) -> &[f64] {
        &self.atols
    }

    pub fn rtols(&self) -> &[f64] {
        &self.rtols
    }

    /// Pairs in sweep order: outer loop over `atol`, inner over `rtol`.
    pub fn pairs(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.atols
            .iter()
            .flat_map(move |&atol| self.rtols.iter().map(move |&rtol| (atol, rtol)))
    }

    pub fn tightest(&self) -> (f64, f64) {
        (
            self.atols[self.atols.len() - 1],
            self.rtols[self.rtols.len() - 1],
        )
    }

    pub fn loosest(&self) -> (f64, f64) {
        (self.atols[0], self.rtols[0])
    }
}

impl Default for ToleranceLadder {
    fn default() -> Self {
        Self {
            atols: DEFAULT_TOLERANCES.to_vec(),
            rtols: DEFAULT_TOLERANCES.to_vec(),
        }
    }
}

impl TryFrom<RawLadder> for ToleranceLadder {
    type Error = anyhow::Error;

    fn try_from(raw: RawLadder) -> Result<Self> {
        Self::new(raw.atols, raw.rtols)
    }
}

impl From<ToleranceLadder> for RawLadder {
    fn from(ladder: ToleranceLadder) -> Self {
        RawLadder {
            atols: ladder.atols,
            rtols: ladder.rtols,
        }
    }
}

fn normalize(mut values: Vec<f64>, label: &str) -> Result<Vec<f64>> {
    ensure!(!values.is_empty(), "{label} ladder must not be empty");
    ensure!(
        values.iter().all(|v| v.is_finite() && *v >= 0.0),
        "{label} ladder values must be finite and non-negative: {values:?}"
    );
    values.sort_by(|a, b| b.total_cmp(a));
    values.dedup();
    Ok(values)
}
