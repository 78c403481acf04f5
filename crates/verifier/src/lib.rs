//! Numerical verification of candidate kernel outputs.
//!
//! Different BLAS kernels accumulate in different orders, so two correct
//! implementations rarely agree bit for bit. Instead of a binary equality
//! test the [`NumericalVerifier`] sweeps a [`ToleranceLadder`] and reports
//! the tightest tolerance pair at which two outputs still agree.

pub mod ladder;
pub mod verifier;

pub use ladder::*;
pub use verifier::*;
