//! wgpu backend for gemmtune: a [`WgpuDevice`] implementing the device
//! contract on top of wgpu buffers, and WGSL GEMM candidates tuned through
//! the shared driver.

pub mod kernels;
pub mod planner;
pub mod runtime;

pub use kernels::*;
pub use planner::*;
pub use runtime::*;
