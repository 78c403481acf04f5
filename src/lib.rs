//! Runtime GEMM kernel auto-tuning.
//!
//! Re-exports the workspace crates under one roof: device memory and element
//! types, numerical verification, operation parameters, the tuning driver
//! with its results cache, the host backend and tuning sessions.

pub use gemmtune_autotune as autotune;
pub use gemmtune_backend_cpu as backend_cpu;
pub use gemmtune_device as device;
pub use gemmtune_params as params;
pub use gemmtune_session as session;
pub use gemmtune_verifier as verifier;

pub use gemmtune_autotune::{
    Candidate, CandidateRegistry, Execution, ResultsCache, Selection, TuningDriver, TuningOptions,
    TuningOutcome,
};
pub use gemmtune_backend_cpu::{HostExecutor, HostExecutorOptions, HostPlanner};
pub use gemmtune_params::{
    GemmAndBiasParams, GemmParams, GemmShape, GemmStridedBatchedParams, OpParams, ScaledGemmParams,
};
