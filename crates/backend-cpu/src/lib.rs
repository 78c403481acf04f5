//! Host backend for gemmtune: reference, ndarray and rayon GEMM candidates
//! running on [`gemmtune_device::HostDevice`], plus the planner and executor
//! that drive them through the tuner.

pub mod candidates;
pub mod kernels;
pub mod planner;
pub mod runtime;

pub use candidates::*;
pub use kernels::*;
pub use planner::*;
pub use runtime::*;
