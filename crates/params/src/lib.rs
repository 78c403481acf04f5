//! Operation parameters for the GEMM family.
//!
//! One value describes one concrete invocation: shape, leading dimensions,
//! scalars and the device buffers it reads and writes. The four variants
//! share the [`OpParams`] contract used by the tuning driver:
//!
//! - sizing of every operand buffer, never smaller than the dense layout;
//! - isolation into privately owned copies for repeated benchmarking, and the
//!   matching release;
//! - the cache key ([`OpParams::signature`]) and the richer benchmark-tool
//!   invocation ([`OpParams::blas_signature`]);
//! - numerical comparison of two output buffers.

pub mod batched;
pub mod bias;
pub mod blas;
pub mod error;
pub mod gemm;
pub mod isolation;
pub mod op;
pub mod scaled;
pub mod shape;
pub mod signature;

pub use batched::*;
pub use bias::*;
pub use blas::*;
pub use error::*;
pub use gemm::*;
pub use isolation::*;
pub use op::*;
pub use scaled::*;
pub use shape::*;
pub use signature::*;
