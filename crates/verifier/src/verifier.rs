//! Graded comparison of two output buffers.

use crate::ladder::ToleranceLadder;
use gemmtune_device::ScalarType;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TuningStatus {
    Ok,
    Fail,
}

/// Result of comparing a candidate output against a reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Verdict {
    /// The outputs agree; carries the tightest pair that still held.
    Agree { atol: f64, rtol: f64 },
    /// No pair of the ladder held.
    Disagree,
}

impl Verdict {
    pub fn status(&self) -> TuningStatus {
        match self {
            Verdict::Agree { .. } => TuningStatus::Ok,
            Verdict::Disagree => TuningStatus::Fail,
        }
    }

    pub fn is_agreement(&self) -> bool {
        matches!(self, Verdict::Agree { .. })
    }

    pub fn tolerance(&self) -> Option<(f64, f64)> {
        match *self {
            Verdict::Agree { atol, rtol } => Some((atol, rtol)),
            Verdict::Disagree => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub max_abs_error: f64,
    pub max_rel_error: f64,
}

#[derive(Debug, Clone, Default)]
pub struct NumericalVerifier {
    ladder: ToleranceLadder,
}

impl NumericalVerifier {
    pub fn new(ladder: ToleranceLadder) -> Self {
        Self { ladder }
    }

    pub fn ladder(&self) -> &ToleranceLadder {
        &self.ladder
    }

    pub fn compare_bytes(
        &self,
        dtype: ScalarType,
        reference: &[u8],
        candidate: &[u8],
        count: usize,
    ) -> Verdict {
        let bytes = count * dtype.element_size();
        if reference.len() < bytes || candidate.len() < bytes {
            debug!(
                expected = bytes,
                reference = reference.len(),
                candidate = candidate.len(),
                "verify numerics: short buffer"
            );
            return Verdict::Disagree;
        }
        let reference = dtype.decode(&reference[..bytes]);
        let candidate = dtype.decode(&candidate[..bytes]);
        self.compare(&reference, &candidate)
    }

    /// Sweep the whole ladder and keep the last pair that held. With
    /// descending ladders that is the tightest `atol`, and for it the
    /// tightest `rtol`.
    pub fn compare(&self, reference: &[f64], candidate: &[f64]) -> Verdict {
        if reference.len() != candidate.len() {
            return Verdict::Disagree;
        }

        let mut verdict = Verdict::Disagree;
        for (atol, rtol) in self.ladder.pairs() {
            if all_close(reference, candidate, atol, rtol) {
                verdict = Verdict::Agree { atol, rtol };
            }
        }

        match verdict {
            Verdict::Agree { atol, rtol } => {
                debug!(atol, rtol, "verify numerics");
            }
            Verdict::Disagree => {
                let summary = summarize(reference, candidate);
                debug!(
                    max_abs_error = summary.max_abs_error,
                    max_rel_error = summary.max_rel_error,
                    "verify numerics: no tolerance pair held"
                );
            }
        }
        verdict
    }
}

/// Element-wise `|reference - candidate| <= atol + rtol * |candidate|`.
/// NaNs never compare close; infinities only match themselves.
pub fn all_close(reference: &[f64], candidate: &[f64], atol: f64, rtol: f64) -> bool {
    reference.len() == candidate.len()
        && reference
            .iter()
            .zip(candidate)
            .all(|(&r, &c)| is_close(r, c, atol, rtol))
}

fn is_close(reference: f64, candidate: f64, atol: f64, rtol: f64) -> bool {
    if reference == candidate {
        return true;
    }
    if !reference.is_finite() || !candidate.is_finite() {
        return false;
    }
    (reference - candidate).abs() <= atol + rtol * candidate.abs()
}

pub fn summarize(reference: &[f64], candidate: &[f64]) -> ErrorSummary {
    let mut summary = ErrorSummary::default();
    for (r, c) in reference.iter().zip(candidate) {
        let abs_err = (r - c).abs();
        summary.max_abs_error = summary.max_abs_error.max(abs_err);
        if r.abs() > 1e-6 {
            summary.max_rel_error = summary.max_rel_error.max(abs_err / r.abs());
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn identical_buffers_agree_at_tightest_pair() {
        let verifier = NumericalVerifier::default();
        let data: Vec<f64> = (0..64).map(|i| i as f64 * 0.37 - 5.0).collect();
        assert_eq!(
            verifier.compare(&data, &data),
            Verdict::Agree {
                atol: 1e-5,
                rtol: 1e-5
            }
        );
    }

    #[test]
    fn order_of_magnitude_error_disagrees() {
        let verifier = NumericalVerifier::default();
        let reference: Vec<f64> = (1..=32).map(|i| i as f64).collect();
        let candidate: Vec<f64> = reference.iter().map(|v| v * 10.0).collect();
        let verdict = verifier.compare(&reference, &candidate);
        assert_eq!(verdict, Verdict::Disagree);
        assert_eq!(verdict.status(), TuningStatus::Fail);
    }

    #[test]
    fn small_drift_is_graded() {
        let verifier = NumericalVerifier::default();
        let reference = vec![1.0, 2.0, 3.0];
        let candidate = vec![1.0005, 2.0, 3.0];
        // 5e-4 off: the tightest atol only holds once rtol reaches 1e-3.
        let verdict = verifier.compare(&reference, &candidate);
        assert_eq!(
            verdict,
            Verdict::Agree {
                atol: 1e-5,
                rtol: 1e-3
            }
        );
        assert!(verdict.is_agreement());
    }

    #[test]
    fn nan_never_agrees() {
        let verifier = NumericalVerifier::default();
        let verdict = verifier.compare(&[f64::NAN, 1.0], &[f64::NAN, 1.0]);
        assert_eq!(verdict, Verdict::Disagree);
    }

    #[test]
    fn matching_infinities_agree() {
        assert!(all_close(&[f64::INFINITY], &[f64::INFINITY], 0.0, 0.0));
        assert!(!all_close(&[f64::INFINITY], &[1e300], 1.0, 1.0));
    }

    #[test]
    fn compare_bytes_decodes_storage_type() {
        let verifier = NumericalVerifier::default();
        let dtype = ScalarType::Half;
        let a = dtype.encode(&[1.0, 2.0, 3.0, 4.0]);
        let b = dtype.encode(&[1.0, 2.0, 3.0, 40.0]);
        assert!(verifier.compare_bytes(dtype, &a, &a, 4).is_agreement());
        assert!(!verifier.compare_bytes(dtype, &a, &b, 4).is_agreement());
        // Only the requested prefix is compared.
        assert!(verifier.compare_bytes(dtype, &a, &b, 3).is_agreement());
        assert_eq!(verifier.compare_bytes(dtype, &a, &b[..4], 4), Verdict::Disagree);
    }

    #[test]
    fn custom_ladder_changes_the_outcome() {
        let loose = NumericalVerifier::new(ToleranceLadder::new(vec![1.0], vec![1.0]).unwrap());
        assert!(loose.compare(&[1.0], &[1.9]).is_agreement());
        assert!(!NumericalVerifier::default().compare(&[1.0], &[1.9]).is_agreement());
    }

    proptest! {
        #[test]
        fn bit_identical_buffers_always_agree(data in prop::collection::vec(-1e6f64..1e6, 0..128)) {
            let verifier = NumericalVerifier::default();
            prop_assert!(verifier.compare(&data, &data).is_agreement());
        }
    }
}
