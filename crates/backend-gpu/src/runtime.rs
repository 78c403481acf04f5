//! wgpu-backed device memory.
//!
//! wgpu hands out buffer objects rather than addresses, so [`WgpuDevice`]
//! keeps a private address space mapping [`DevicePtr`] values to buffers.
//! All work goes to the single wgpu queue, exposed as
//! [`StreamId::DEFAULT`]; submissions execute in order and complete once
//! the device is polled to idle.

use anyhow::{anyhow, Result};
use gemmtune_device::{
    Device, DeviceAllocator, DeviceError, DeviceInfo, DeviceMemory, DevicePtr, StreamId,
};
use pollster::block_on;
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// wgpu requires copy sizes and offsets in multiples of four bytes.
const COPY_ALIGNMENT: u64 = wgpu::COPY_BUFFER_ALIGNMENT;
/// Unused gap between allocations so stray offsets never alias.
const ADDRESS_GAP: u64 = 256;
const ADDRESS_BASE: u64 = 0x1_0000;

pub(crate) fn align_up(bytes: u64) -> u64 {
    bytes.div_ceil(COPY_ALIGNMENT).max(1) * COPY_ALIGNMENT
}

/// Fake addresses for opaque buffer handles.
#[derive(Debug)]
pub(crate) struct AddressSpace<B> {
    next: u64,
    entries: BTreeMap<u64, (B, usize)>,
}

impl<B> AddressSpace<B> {
    pub(crate) fn new() -> Self {
        Self {
            next: ADDRESS_BASE,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, buffer: B, size: usize) -> DevicePtr {
        let base = self.next;
        self.next += align_up(size as u64) + ADDRESS_GAP;
        self.entries.insert(base, (buffer, size));
        DevicePtr::new(base)
    }

    pub(crate) fn remove(&mut self, ptr: DevicePtr) -> Option<B> {
        self.entries.remove(&ptr.address()).map(|(buffer, _)| buffer)
    }

    /// Allocation containing `[ptr, ptr + len)` with the offset into it.
    pub(crate) fn resolve(&self, ptr: DevicePtr, len: usize) -> Result<Resolved<'_, B>, DeviceError> {
        let (&base, (buffer, size)) = self
            .entries
            .range(..=ptr.address())
            .next_back()
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        let offset = ptr.address() - base;
        if offset >= align_up(*size as u64) {
            return Err(DeviceError::InvalidPointer(ptr));
        }
        if offset + len as u64 > *size as u64 {
            return Err(DeviceError::OutOfBounds {
                ptr,
                len,
                size: *size,
            });
        }
        Ok(Resolved {
            buffer,
            offset,
            size: *size,
        })
    }

    pub(crate) fn live_bytes(&self) -> usize {
        self.entries.values().map(|(_, size)| size).sum()
    }
}

#[derive(Debug)]
pub(crate) struct Resolved<'a, B> {
    pub buffer: &'a B,
    pub offset: u64,
    pub size: usize,
}

impl<B> Resolved<'_, B> {
    fn check_aligned(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        if self.offset % COPY_ALIGNMENT != 0 {
            return Err(DeviceError::Backend(format!(
                "{ptr} is not {COPY_ALIGNMENT}-byte aligned within its buffer"
            )));
        }
        Ok(())
    }
}

pub struct CachedPipeline {
    pub pipeline: wgpu::ComputePipeline,
    pub layout: wgpu::BindGroupLayout,
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: DeviceInfo,
    buffers: Mutex<AddressSpace<Arc<wgpu::Buffer>>>,
    pipelines: Mutex<HashMap<String, Arc<CachedPipeline>>>,
}

impl WgpuDevice {
    /// Open the default high-performance adapter.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| anyhow!("no suitable GPU adapter found"))?;
        let adapter_info = adapter.get_info();

        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("gemmtune device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
            },
            None,
        ))?;

        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            backend: format!("{:?}", adapter_info.backend).to_lowercase(),
        };
        debug!(name = %info.name, backend = %info.backend, "opened wgpu device");
        Ok(Self {
            device,
            queue,
            info,
            buffers: Mutex::new(AddressSpace::new()),
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    fn buffers(&self) -> MutexGuard<'_, AddressSpace<Arc<wgpu::Buffer>>> {
        self.buffers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn wgpu_device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn live_bytes(&self) -> usize {
        self.buffers().live_bytes()
    }

    pub fn buffer_at(
        &self,
        ptr: DevicePtr,
        len: usize,
    ) -> Result<(Arc<wgpu::Buffer>, u64), DeviceError> {
        let buffers = self.buffers();
        let resolved = buffers.resolve(ptr, len)?;
        Ok((Arc::clone(resolved.buffer), resolved.offset))
    }

    /// Compile `source` once per `key` and reuse the pipeline afterwards.
    pub fn pipeline<F>(&self, key: &str, source: F) -> Arc<CachedPipeline>
    where
        F: FnOnce() -> String,
    {
        let mut pipelines = self
            .pipelines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cached) = pipelines.get(key) {
            return Arc::clone(cached);
        }

        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(key),
            source: wgpu::ShaderSource::Wgsl(source().into()),
        });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(key),
                layout: None,
                module: &module,
                entry_point: "main",
            });
        let layout = pipeline.get_bind_group_layout(0);
        let cached = Arc::new(CachedPipeline { pipeline, layout });
        pipelines.insert(key.to_string(), Arc::clone(&cached));
        debug!(pipeline = key, "compiled compute pipeline");
        cached
    }

    fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }

    fn map_read(&self, staging: &wgpu::Buffer) -> Result<Vec<u8>, DeviceError> {
        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        self.wait_idle();
        receiver
            .recv()
            .map_err(|_| DeviceError::Backend("failed to receive GPU map signal".to_string()))?
            .map_err(|err| DeviceError::Backend(format!("buffer map failed: {err}")))?;
        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }
}

impl DeviceAllocator for WgpuDevice {
    fn allocate(&self, bytes: usize) -> Result<DevicePtr, DeviceError> {
        let size = align_up(bytes as u64);
        let limit = self.device.limits().max_buffer_size;
        if size > limit {
            return Err(DeviceError::OutOfMemory {
                requested: bytes,
                available: limit as usize,
            });
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gemmtune allocation"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let ptr = self.buffers().insert(Arc::new(buffer), bytes);
        trace!(ptr = %ptr, bytes, "wgpu allocate");
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let buffer = self
            .buffers()
            .remove(ptr)
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        // queued work may still read the buffer
        self.wait_idle();
        buffer.destroy();
        trace!(ptr = %ptr, "wgpu free");
        Ok(())
    }

    fn enqueue_copy(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: StreamId,
    ) -> Result<(), DeviceError> {
        if stream != StreamId::DEFAULT {
            return Err(DeviceError::UnknownStream(stream));
        }
        if bytes == 0 {
            return Ok(());
        }
        let buffers = self.buffers();
        let from = buffers.resolve(src, bytes)?;
        let to = buffers.resolve(dst, bytes)?;
        from.check_aligned(src)?;
        to.check_aligned(dst)?;
        let len = align_up(bytes as u64);
        // the rounded tail may only spill into allocation padding
        if bytes as u64 % COPY_ALIGNMENT != 0 && to.offset + bytes as u64 != to.size as u64 {
            return Err(DeviceError::Backend(format!(
                "copy of {bytes} bytes to {dst} is not a multiple of {COPY_ALIGNMENT}"
            )));
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gemmtune copy"),
            });
        encoder.copy_buffer_to_buffer(from.buffer, from.offset, to.buffer, to.offset, len);
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn current_stream(&self) -> StreamId {
        StreamId::DEFAULT
    }
}

impl DeviceMemory for WgpuDevice {
    fn synchronize(&self, stream: StreamId) -> Result<(), DeviceError> {
        if stream != StreamId::DEFAULT {
            return Err(DeviceError::UnknownStream(stream));
        }
        self.wait_idle();
        Ok(())
    }

    fn read(&self, ptr: DevicePtr, bytes: usize) -> Result<Vec<u8>, DeviceError> {
        if bytes == 0 {
            return Ok(Vec::new());
        }
        let (buffer, offset) = {
            let buffers = self.buffers();
            let resolved = buffers.resolve(ptr, bytes)?;
            resolved.check_aligned(ptr)?;
            (Arc::clone(resolved.buffer), resolved.offset)
        };
        let len = align_up(bytes as u64);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gemmtune readback"),
            size: len,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gemmtune readback"),
            });
        encoder.copy_buffer_to_buffer(&buffer, offset, &staging, 0, len);
        self.queue.submit(Some(encoder.finish()));

        let mut data = self.map_read(&staging)?;
        data.truncate(bytes);
        Ok(data)
    }

    fn write(&self, ptr: DevicePtr, data: &[u8]) -> Result<(), DeviceError> {
        if data.is_empty() {
            return Ok(());
        }
        let (buffer, offset) = {
            let buffers = self.buffers();
            let resolved = buffers.resolve(ptr, data.len())?;
            resolved.check_aligned(ptr)?;
            (Arc::clone(resolved.buffer), resolved.offset)
        };
        self.wait_idle();

        let mut padded = data.to_vec();
        let tail = data.len() as u64 % COPY_ALIGNMENT;
        if tail != 0 {
            // preserve the bytes sharing the last word
            let word_start = data.len() as u64 - tail;
            let existing = self.read_raw(&buffer, offset + word_start)?;
            padded.extend_from_slice(&existing[tail as usize..]);
        }
        self.queue.write_buffer(&buffer, offset, &padded);
        self.queue.submit(None);
        self.wait_idle();
        Ok(())
    }
}

impl WgpuDevice {
    fn read_raw(&self, buffer: &wgpu::Buffer, offset: u64) -> Result<Vec<u8>, DeviceError> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gemmtune word"),
            size: COPY_ALIGNMENT,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gemmtune word"),
            });
        encoder.copy_buffer_to_buffer(buffer, offset, &staging, 0, COPY_ALIGNMENT);
        self.queue.submit(Some(encoder.finish()));
        self.map_read(&staging)
    }
}

impl Device for WgpuDevice {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_resolve_to_the_owning_allocation() {
        let mut space = AddressSpace::new();
        let first = space.insert("first", 10);
        let second = space.insert("second", 64);
        assert!(second.address() >= first.address() + 12 + ADDRESS_GAP);

        let resolved = space.resolve(second.offset(16), 48).unwrap();
        assert_eq!(*resolved.buffer, "second");
        assert_eq!(resolved.offset, 16);
        assert!(matches!(
            space.resolve(first.offset(8), 4),
            Err(DeviceError::OutOfBounds { size: 10, .. })
        ));
        // inside the gap after the first allocation
        assert!(matches!(
            space.resolve(first.offset(40), 1),
            Err(DeviceError::InvalidPointer(_))
        ));
        assert_eq!(space.live_bytes(), 74);
        assert_eq!(space.remove(first), Some("first"));
        assert!(space.resolve(first, 1).is_err());
    }

    #[test]
    fn alignment_rounds_up_to_whole_words() {
        assert_eq!(align_up(0), 4);
        assert_eq!(align_up(5), 8);
        assert_eq!(align_up(16), 16);
    }

    #[test]
    fn unaligned_interior_pointers_are_rejected() {
        let mut space = AddressSpace::new();
        let ptr = space.insert((), 32);
        let resolved = space.resolve(ptr.offset(2), 4).unwrap();
        assert!(resolved.check_aligned(ptr.offset(2)).is_err());
    }

    #[test]
    fn round_trip_through_an_adapter_when_available() {
        let Ok(device) = WgpuDevice::new() else {
            return;
        };
        let src = device.allocate(7).unwrap();
        let dst = device.allocate(7).unwrap();
        device.write(src, &[1, 2, 3, 4, 5, 6, 7]).unwrap();
        device.enqueue_copy(dst, src, 7, StreamId::DEFAULT).unwrap();
        device.synchronize(StreamId::DEFAULT).unwrap();
        assert_eq!(device.read(dst, 7).unwrap(), vec![1, 2, 3, 4, 5, 6, 7]);
        device.free(src).unwrap();
        device.free(dst).unwrap();
        assert_eq!(device.live_bytes(), 0);
    }
}
