//! Device abstractions for gemmtune.
//!
//! The tuning core only talks to accelerator memory through the traits in
//! [`memory`]: an allocator with stream-ordered asynchronous copies and a
//! readback interface used for verification. [`host::HostDevice`] is an
//! in-process implementation with the same asynchronous semantics.

pub mod dtype;
pub mod host;
pub mod memory;

pub use dtype::*;
pub use host::*;
pub use memory::*;
