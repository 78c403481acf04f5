//! The contract shared by every GEMM-family parameter type.

use crate::blas::Operand;
use crate::error::ParamsError;
use crate::isolation::{GemmOperands, OperandSizes};
use gemmtune_device::{DeviceAllocator, DeviceMemory, ScalarType};
use gemmtune_verifier::{NumericalVerifier, TuningStatus, Verdict};
use tracing::debug;

pub trait OpParams: Sized {
    /// Family name used as the first-level cache key, e.g.
    /// `GemmTunableOp_float_NT`.
    fn op_name(&self) -> String;

    /// Canonical cache key. Depends only on shape-affecting fields.
    fn signature(&self) -> String;

    fn blas_signature(&self) -> String;

    fn output_dtype(&self) -> ScalarType;

    /// Bytes required for `operand`, never below the dense layout.
    fn buffer_size(&self, operand: Operand) -> usize;

    fn operands(&self) -> &GemmOperands;

    fn operands_mut(&mut self) -> &mut GemmOperands;

    fn with_operands(&self, operands: GemmOperands) -> Self;

    fn validate(&self) -> Result<(), ParamsError>;

    fn flops(&self) -> u64;

    fn min_bytes_moved(&self) -> u64;

    fn sizes(&self) -> OperandSizes {
        OperandSizes {
            a: self.buffer_size(Operand::A),
            b: self.buffer_size(Operand::B),
            c: self.buffer_size(Operand::C),
        }
    }

    fn total_size(&self, include_inputs: bool) -> usize {
        let sizes = self.sizes();
        if include_inputs {
            sizes.a.saturating_add(sizes.b).saturating_add(sizes.c)
        } else {
            sizes.c
        }
    }

    /// Copy of these parameters owning a private output buffer (and input
    /// buffers with `duplicate_inputs`). The output copy is enqueued on the
    /// device's current stream and is complete only once that stream is
    /// synchronized.
    fn isolate<D>(&self, device: &D, duplicate_inputs: bool) -> Result<Self, ParamsError>
    where
        D: DeviceAllocator + ?Sized,
    {
        self.validate()?;
        let operands = self
            .operands()
            .isolate(device, self.sizes(), duplicate_inputs)?;
        Ok(self.with_operands(operands))
    }

    /// Free the buffers allocated by [`OpParams::isolate`].
    fn release<D>(&mut self, device: &D) -> Result<(), ParamsError>
    where
        D: DeviceAllocator + ?Sized,
    {
        self.operands_mut().release(device)
    }

    fn is_isolated(&self) -> bool {
        self.operands().is_isolated()
    }

    fn duplicates_inputs(&self) -> bool {
        self.operands().duplicates_inputs()
    }

    /// Compare the output buffers of `self` (the reference) and `other`.
    /// Synchronizes the current stream first. A mismatch is a
    /// [`Verdict::Disagree`], not an error.
    fn verify_against<D>(
        &self,
        other: &Self,
        device: &D,
        verifier: &NumericalVerifier,
    ) -> Result<Verdict, ParamsError>
    where
        D: DeviceAllocator + DeviceMemory + ?Sized,
    {
        let bytes = self.buffer_size(Operand::C);
        device.synchronize(device.current_stream())?;
        let reference = device.read(self.operands().c(), bytes)?;
        let candidate = device.read(other.operands().c(), bytes)?;

        let dtype = self.output_dtype();
        let count = bytes / dtype.element_size();
        let verdict = verifier.compare_bytes(dtype, &reference, &candidate, count);
        debug!(
            op = %self.op_name(),
            signature = %self.signature(),
            ?verdict,
            "numerical check"
        );
        Ok(verdict)
    }

    fn numerical_check<D>(
        &self,
        other: &Self,
        device: &D,
        verifier: &NumericalVerifier,
    ) -> Result<TuningStatus, ParamsError>
    where
        D: DeviceAllocator + DeviceMemory + ?Sized,
    {
        Ok(self.verify_against(other, device, verifier)?.status())
    }
}

pub(crate) fn checked_bytes(elements: Option<usize>, dtype: ScalarType) -> Option<usize> {
    elements?.checked_mul(dtype.element_size())
}

pub(crate) fn product_flops(m: usize, n: usize, k: usize) -> u64 {
    2u64.saturating_mul(m as u64)
        .saturating_mul(n as u64)
        .saturating_mul(k as u64)
}

pub(crate) fn overflow(operand: Operand, signature: &str) -> ParamsError {
    ParamsError::ContractViolation(format!(
        "size of operand {operand} overflows for shape {signature}"
    ))
}
