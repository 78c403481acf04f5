//! Device pointers, streams and the allocator contract.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque address of device-resident memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const fn new(address: u64) -> Self {
        Self(address)
    }

    pub const fn address(self) -> u64 {
        self.0
    }

    /// Pointer `bytes` past this one, e.g. the start of a later batch.
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    pub const DEFAULT: StreamId = StreamId(0);
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// Identity of the hardware/software environment a tuning decision was made on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub backend: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("out of device memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("pointer {0} does not refer to a live allocation")]
    InvalidPointer(DevicePtr),

    #[error("access of {len} bytes at {ptr} overruns an allocation of {size} bytes")]
    OutOfBounds {
        ptr: DevicePtr,
        len: usize,
        size: usize,
    },

    #[error("{0} is not known to this device")]
    UnknownStream(StreamId),

    #[error("device backend error: {0}")]
    Backend(String),
}

/// The four operations the tuning core needs to manage device memory.
pub trait DeviceAllocator {
    fn allocate(&self, bytes: usize) -> Result<DevicePtr, DeviceError>;

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;

    /// Enqueue a device-to-device copy on `stream`. Returns once the copy is
    /// queued; it is complete only after the stream is synchronized.
    fn enqueue_copy(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: StreamId,
    ) -> Result<(), DeviceError>;

    fn current_stream(&self) -> StreamId;
}

pub trait DeviceMemory {
    /// Block until all work queued on `stream` has completed.
    fn synchronize(&self, stream: StreamId) -> Result<(), DeviceError>;

    fn read(&self, ptr: DevicePtr, bytes: usize) -> Result<Vec<u8>, DeviceError>;

    /// Blocking upload. Outstanding work on every stream completes first.
    fn write(&self, ptr: DevicePtr, data: &[u8]) -> Result<(), DeviceError>;
}

pub trait Device: DeviceAllocator + DeviceMemory {
    fn info(&self) -> DeviceInfo;
}
