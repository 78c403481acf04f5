//! Empirical selection of GEMM candidates.
//!
//! [`TuningDriver`] benchmarks every registered [`Candidate`] on isolated
//! copies of an invocation, rejects candidates whose output disagrees with
//! the default implementation, and remembers the fastest survivor per
//! signature in a persistent [`ResultsCache`].

pub mod cache;
pub mod candidate;
pub mod options;
pub mod tuner;

pub use cache::*;
pub use candidate::*;
pub use options::*;
pub use tuner::*;
