//! Ownership-tagged operand buffers and the isolate/release protocol.

use crate::blas::Operand;
use crate::error::ParamsError;
use gemmtune_device::{DeviceAllocator, DevicePtr};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ownership {
    Borrowed,
    Owned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBuffer {
    ptr: DevicePtr,
    ownership: Ownership,
}

impl DeviceBuffer {
    pub fn borrowed(ptr: DevicePtr) -> Self {
        Self {
            ptr,
            ownership: Ownership::Borrowed,
        }
    }

    fn owned(ptr: DevicePtr) -> Self {
        Self {
            ptr,
            ownership: Ownership::Owned,
        }
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_owned(&self) -> bool {
        self.ownership == Ownership::Owned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandSizes {
    pub a: usize,
    pub b: usize,
    pub c: usize,
}

impl OperandSizes {
    pub fn get(&self, operand: Operand) -> usize {
        match operand {
            Operand::A => self.a,
            Operand::B => self.b,
            Operand::C => self.c,
        }
    }
}

/// The `a`, `b` and `c` buffers of an invocation.
///
/// A value built by the caller borrows all three. [`GemmOperands::isolate`]
/// returns a value owning a fresh `c` (and fresh `a`/`b` when inputs are
/// duplicated); only such a value may be released.
#[derive(Debug, PartialEq, Eq)]
pub struct GemmOperands {
    a: DeviceBuffer,
    b: DeviceBuffer,
    c: DeviceBuffer,
    duplicated_inputs: bool,
}

impl GemmOperands {
    pub fn borrowed(a: DevicePtr, b: DevicePtr, c: DevicePtr) -> Self {
        Self {
            a: DeviceBuffer::borrowed(a),
            b: DeviceBuffer::borrowed(b),
            c: DeviceBuffer::borrowed(c),
            duplicated_inputs: false,
        }
    }

    pub fn a(&self) -> DevicePtr {
        self.a.ptr
    }

    pub fn b(&self) -> DevicePtr {
        self.b.ptr
    }

    pub fn c(&self) -> DevicePtr {
        self.c.ptr
    }

    pub fn buffer(&self, operand: Operand) -> DeviceBuffer {
        match operand {
            Operand::A => self.a,
            Operand::B => self.b,
            Operand::C => self.c,
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.c.is_owned()
    }

    pub fn duplicates_inputs(&self) -> bool {
        self.duplicated_inputs
    }

    /// Allocate a private output buffer and enqueue a copy of the current
    /// output into it on the device's current stream. With
    /// `duplicate_inputs`, fresh (uninitialized) input buffers are allocated
    /// as well. On failure everything allocated so far is freed again.
    pub fn isolate<D>(
        &self,
        device: &D,
        sizes: OperandSizes,
        duplicate_inputs: bool,
    ) -> Result<GemmOperands, ParamsError>
    where
        D: DeviceAllocator + ?Sized,
    {
        let mut allocated = Vec::with_capacity(3);
        match self.isolate_into(device, sizes, duplicate_inputs, &mut allocated) {
            Ok(operands) => Ok(operands),
            Err(err) => {
                for ptr in allocated {
                    if let Err(free_err) = device.free(ptr) {
                        warn!(ptr = %ptr, error = %free_err, "isolate: failed to free partial copy");
                    }
                }
                Err(err)
            }
        }
    }

    fn isolate_into<D>(
        &self,
        device: &D,
        sizes: OperandSizes,
        duplicate_inputs: bool,
        allocated: &mut Vec<DevicePtr>,
    ) -> Result<GemmOperands, ParamsError>
    where
        D: DeviceAllocator + ?Sized,
    {
        let alloc = |operand: Operand, allocated: &mut Vec<DevicePtr>| {
            let bytes = sizes.get(operand);
            let ptr = device
                .allocate(bytes)
                .map_err(|source| ParamsError::Allocation {
                    operand,
                    bytes,
                    source,
                })?;
            allocated.push(ptr);
            Ok::<_, ParamsError>(ptr)
        };

        let c = alloc(Operand::C, allocated)?;
        let stream = device.current_stream();
        device
            .enqueue_copy(c, self.c.ptr, sizes.c, stream)
            .map_err(|source| ParamsError::Copy {
                operand: Operand::C,
                bytes: sizes.c,
                source,
            })?;

        let (a, b) = if duplicate_inputs {
            let a = alloc(Operand::A, allocated)?;
            let b = alloc(Operand::B, allocated)?;
            (DeviceBuffer::owned(a), DeviceBuffer::owned(b))
        } else {
            (
                DeviceBuffer::borrowed(self.a.ptr),
                DeviceBuffer::borrowed(self.b.ptr),
            )
        };

        trace!(
            c = %c,
            bytes = sizes.c,
            stream = %stream,
            duplicate_inputs,
            "isolated operands"
        );
        Ok(GemmOperands {
            a,
            b,
            c: DeviceBuffer::owned(c),
            duplicated_inputs: duplicate_inputs,
        })
    }

    /// Free every owned buffer. Releasing a value that owns nothing is a
    /// contract violation and frees nothing.
    pub fn release<D>(&mut self, device: &D) -> Result<(), ParamsError>
    where
        D: DeviceAllocator + ?Sized,
    {
        if !self.is_isolated() {
            return Err(ParamsError::ContractViolation(format!(
                "release of operands not produced by isolate (c = {})",
                self.c.ptr
            )));
        }

        let mut first_error = None;
        for buffer in [&mut self.c, &mut self.a, &mut self.b] {
            if buffer.is_owned() {
                if let Err(err) = device.free(buffer.ptr) {
                    first_error.get_or_insert(err);
                }
                buffer.ownership = Ownership::Borrowed;
            }
        }
        self.duplicated_inputs = false;
        match first_error {
            Some(err) => Err(ParamsError::Device(err)),
            None => Ok(()),
        }
    }
}

impl Drop for GemmOperands {
    fn drop(&mut self) {
        if self.is_isolated() {
            warn!(c = %self.c.ptr, "isolated operands dropped without release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemmtune_device::{DeviceError, DeviceMemory, HostDevice};

    fn sizes(bytes: usize) -> OperandSizes {
        OperandSizes {
            a: bytes,
            b: bytes,
            c: bytes,
        }
    }

    fn caller_buffers(device: &HostDevice, bytes: usize) -> GemmOperands {
        let a = device.allocate(bytes).unwrap();
        let b = device.allocate(bytes).unwrap();
        let c = device.allocate(bytes).unwrap();
        GemmOperands::borrowed(a, b, c)
    }

    #[test]
    fn release_of_borrowed_operands_is_rejected() {
        let device = HostDevice::new();
        let mut operands = caller_buffers(&device, 16);
        let err = operands.release(&device).unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(device.stats().frees, 0);
    }

    #[test]
    fn failed_input_allocation_frees_output_copy() {
        let device = HostDevice::with_capacity(64 * 3 + 64 * 2 + 32);
        let operands = caller_buffers(&device, 64);
        let err = operands.isolate(&device, sizes(64), true).unwrap_err();
        assert!(matches!(
            err,
            ParamsError::Allocation {
                operand: Operand::B,
                ..
            }
        ));
        assert_eq!(device.stats().live_bytes, 64 * 3);
    }

    #[test]
    fn failed_copy_is_reported_and_cleaned_up() {
        let device = HostDevice::new();
        let a = device.allocate(8).unwrap();
        let operands = GemmOperands::borrowed(a, a, DevicePtr::new(0x40));
        let err = operands.isolate(&device, sizes(8), false).unwrap_err();
        match err {
            ParamsError::Copy { operand, source, .. } => {
                assert_eq!(operand, Operand::C);
                assert_eq!(source, DeviceError::InvalidPointer(DevicePtr::new(0x40)));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(device.stats().live_bytes, 8);
    }

    #[test]
    fn released_operands_cannot_be_released_twice() {
        let device = HostDevice::new();
        let operands = caller_buffers(&device, 16);
        let mut copy = operands.isolate(&device, sizes(16), true).unwrap();
        copy.release(&device).unwrap();
        assert!(!copy.is_isolated());
        assert!(!copy.duplicates_inputs());
        assert!(copy.release(&device).unwrap_err().is_contract_violation());
        assert_eq!(device.stats().frees, 3);
        device.synchronize_all().unwrap();
    }
}
