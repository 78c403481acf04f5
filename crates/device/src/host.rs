//! In-process device with stream-ordered asynchronous semantics.
//!
//! Memory lives in host vectors at synthetic addresses. Work enqueued on a
//! stream (copies, kernel launches) is held in a FIFO and only takes effect
//! when that stream is synchronized, so code that forgets to order its reads
//! after outstanding device work behaves incorrectly here just as it would on
//! real hardware.

use crate::memory::{
    Device, DeviceAllocator, DeviceError, DeviceInfo, DeviceMemory, DevicePtr, StreamId,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::trace;

const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const ALIGNMENT: u64 = 256;

/// Work item executed when its stream is synchronized.
pub type HostOp = Box<dyn FnOnce(&mut HostMemory) -> Result<(), DeviceError> + Send>;

/// The allocations of a [`HostDevice`], as seen by queued work.
#[derive(Default)]
pub struct HostMemory {
    allocations: BTreeMap<u64, Vec<u8>>,
}

impl HostMemory {
    fn locate(&self, ptr: DevicePtr, len: usize) -> Result<(u64, usize), DeviceError> {
        let (&base, data) = self
            .allocations
            .range(..=ptr.address())
            .next_back()
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        let offset = (ptr.address() - base) as usize;
        if offset > data.len() {
            return Err(DeviceError::InvalidPointer(ptr));
        }
        if offset + len > data.len() {
            return Err(DeviceError::OutOfBounds {
                ptr,
                len,
                size: data.len(),
            });
        }
        Ok((base, offset))
    }

    pub fn bytes(&self, ptr: DevicePtr, len: usize) -> Result<&[u8], DeviceError> {
        let (base, offset) = self.locate(ptr, len)?;
        Ok(&self.allocations[&base][offset..offset + len])
    }

    pub fn bytes_mut(&mut self, ptr: DevicePtr, len: usize) -> Result<&mut [u8], DeviceError> {
        let (base, offset) = self.locate(ptr, len)?;
        let data = self
            .allocations
            .get_mut(&base)
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        Ok(&mut data[offset..offset + len])
    }

    pub fn copy(&mut self, dst: DevicePtr, src: DevicePtr, len: usize) -> Result<(), DeviceError> {
        let staged = self.bytes(src, len)?.to_vec();
        self.bytes_mut(dst, len)?.copy_from_slice(&staged);
        Ok(())
    }
}

/// Counters kept by [`HostDevice`] for every allocation and free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub allocations: usize,
    pub frees: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
}

struct HostState {
    memory: HostMemory,
    streams: HashMap<StreamId, VecDeque<HostOp>>,
    current: StreamId,
    next_stream: u32,
    next_address: u64,
    stats: AllocationStats,
}

impl HostState {
    fn drain(&mut self, stream: StreamId) -> Result<(), DeviceError> {
        let pending = self
            .streams
            .get_mut(&stream)
            .ok_or(DeviceError::UnknownStream(stream))?;
        let ops: Vec<HostOp> = pending.drain(..).collect();
        let mut first_error = None;
        for op in ops {
            if let Err(err) = op(&mut self.memory) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn drain_all(&mut self) -> Result<(), DeviceError> {
        let streams: Vec<StreamId> = self.streams.keys().copied().collect();
        let mut first_error = None;
        for stream in streams {
            if let Err(err) = self.drain(stream) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

pub struct HostDevice {
    name: String,
    capacity: Option<usize>,
    state: Mutex<HostState>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A device whose allocations fail once `capacity` bytes are live.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(Some(capacity))
    }

    fn build(capacity: Option<usize>) -> Self {
        let mut streams = HashMap::new();
        streams.insert(StreamId::DEFAULT, VecDeque::new());
        Self {
            name: "host".to_string(),
            capacity,
            state: Mutex::new(HostState {
                memory: HostMemory::default(),
                streams,
                current: StreamId::DEFAULT,
                next_stream: 1,
                next_address: BASE_ADDRESS,
                stats: AllocationStats::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_stream(&self) -> StreamId {
        let mut state = self.state();
        let stream = StreamId(state.next_stream);
        state.next_stream += 1;
        state.streams.insert(stream, VecDeque::new());
        stream
    }

    pub fn set_current_stream(&self, stream: StreamId) -> Result<(), DeviceError> {
        let mut state = self.state();
        if !state.streams.contains_key(&stream) {
            return Err(DeviceError::UnknownStream(stream));
        }
        state.current = stream;
        Ok(())
    }

    /// Queue arbitrary work behind everything already on `stream`.
    pub fn launch(&self, stream: StreamId, op: HostOp) -> Result<(), DeviceError> {
        let mut state = self.state();
        state
            .streams
            .get_mut(&stream)
            .ok_or(DeviceError::UnknownStream(stream))?
            .push_back(op);
        Ok(())
    }

    pub fn pending_ops(&self, stream: StreamId) -> usize {
        self.state().streams.get(&stream).map_or(0, VecDeque::len)
    }

    pub fn stats(&self) -> AllocationStats {
        self.state().stats
    }

    pub fn is_live(&self, ptr: DevicePtr) -> bool {
        self.state().memory.allocations.contains_key(&ptr.address())
    }

    pub fn synchronize_all(&self) -> Result<(), DeviceError> {
        self.state().drain_all()
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAllocator for HostDevice {
    fn allocate(&self, bytes: usize) -> Result<DevicePtr, DeviceError> {
        let mut state = self.state();
        if let Some(capacity) = self.capacity {
            let available = capacity.saturating_sub(state.stats.live_bytes);
            if bytes > available {
                return Err(DeviceError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
        }

        let address = state.next_address;
        let span = (bytes.max(1) as u64).div_ceil(ALIGNMENT) * ALIGNMENT;
        state.next_address += span;
        state.memory.allocations.insert(address, vec![0u8; bytes]);
        let stats = &mut state.stats;
        stats.allocations += 1;
        stats.live_bytes += bytes;
        stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);
        trace!(ptr = %DevicePtr::new(address), bytes, "host allocate");
        Ok(DevicePtr::new(address))
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let mut state = self.state();
        if !state.memory.allocations.contains_key(&ptr.address()) {
            return Err(DeviceError::InvalidPointer(ptr));
        }
        // Queued work may still reference the allocation.
        state.drain_all()?;
        let data = state
            .memory
            .allocations
            .remove(&ptr.address())
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        state.stats.frees += 1;
        state.stats.live_bytes -= data.len();
        trace!(ptr = %ptr, bytes = data.len(), "host free");
        Ok(())
    }

    fn enqueue_copy(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: StreamId,
    ) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.memory.locate(src, bytes)?;
        state.memory.locate(dst, bytes)?;
        state
            .streams
            .get_mut(&stream)
            .ok_or(DeviceError::UnknownStream(stream))?
            .push_back(Box::new(move |memory: &mut HostMemory| {
                memory.copy(dst, src, bytes)
            }));
        Ok(())
    }

    fn current_stream(&self) -> StreamId {
        self.state().current
    }
}

impl DeviceMemory for HostDevice {
    fn synchronize(&self, stream: StreamId) -> Result<(), DeviceError> {
        self.state().drain(stream)
    }

    fn read(&self, ptr: DevicePtr, bytes: usize) -> Result<Vec<u8>, DeviceError> {
        Ok(self.state().memory.bytes(ptr, bytes)?.to_vec())
    }

    fn write(&self, ptr: DevicePtr, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.drain_all()?;
        state.memory.bytes_mut(ptr, data.len())?.copy_from_slice(data);
        Ok(())
    }
}

impl Device for HostDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            backend: "host".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_are_invisible_until_synchronized() {
        let device = HostDevice::new();
        let src = device.allocate(8).unwrap();
        let dst = device.allocate(8).unwrap();
        device.write(src, &[7u8; 8]).unwrap();

        let stream = device.current_stream();
        device.enqueue_copy(dst, src, 8, stream).unwrap();
        assert_eq!(device.pending_ops(stream), 1);
        assert_eq!(device.read(dst, 8).unwrap(), vec![0u8; 8]);

        device.synchronize(stream).unwrap();
        assert_eq!(device.read(dst, 8).unwrap(), vec![7u8; 8]);
    }

    #[test]
    fn capacity_limits_live_bytes() {
        let device = HostDevice::with_capacity(100);
        let first = device.allocate(60).unwrap();
        let err = device.allocate(60).unwrap_err();
        assert_eq!(
            err,
            DeviceError::OutOfMemory {
                requested: 60,
                available: 40
            }
        );
        device.free(first).unwrap();
        assert!(device.allocate(60).is_ok());
    }

    #[test]
    fn interior_pointers_resolve_within_bounds() {
        let device = HostDevice::new();
        let base = device.allocate(16).unwrap();
        device.write(base.offset(8), &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.read(base, 16).unwrap()[8..12], [1, 2, 3, 4]);
        assert!(matches!(
            device.read(base.offset(12), 8),
            Err(DeviceError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn enqueue_rejects_unknown_pointers() {
        let device = HostDevice::new();
        let dst = device.allocate(4).unwrap();
        let bogus = DevicePtr::new(0x10);
        let err = device
            .enqueue_copy(dst, bogus, 4, StreamId::DEFAULT)
            .unwrap_err();
        assert_eq!(err, DeviceError::InvalidPointer(bogus));
        assert_eq!(device.pending_ops(StreamId::DEFAULT), 0);
    }

    #[test]
    fn free_drains_pending_work_and_updates_ledger() {
        let device = HostDevice::new();
        let a = device.allocate(32).unwrap();
        let b = device.allocate(32).unwrap();
        device.enqueue_copy(b, a, 32, StreamId::DEFAULT).unwrap();
        device.free(a).unwrap();
        assert_eq!(device.pending_ops(StreamId::DEFAULT), 0);
        assert!(!device.is_live(a));
        assert!(device.is_live(b));

        let stats = device.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.live_bytes, 32);
        assert!(matches!(device.free(a), Err(DeviceError::InvalidPointer(_))));
    }

    #[test]
    fn streams_are_independent() {
        let device = HostDevice::new();
        let side = device.create_stream();
        let src = device.allocate(4).unwrap();
        let dst = device.allocate(4).unwrap();
        device.write(src, &[9; 4]).unwrap();
        device.enqueue_copy(dst, src, 4, side).unwrap();

        device.synchronize(StreamId::DEFAULT).unwrap();
        assert_eq!(device.read(dst, 4).unwrap(), vec![0; 4]);
        device.synchronize(side).unwrap();
        assert_eq!(device.read(dst, 4).unwrap(), vec![9; 4]);

        assert!(device.set_current_stream(StreamId(42)).is_err());
        device.set_current_stream(side).unwrap();
        assert_eq!(device.current_stream(), side);
    }
}
