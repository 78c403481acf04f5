//! Scaled low-precision GEMM:
//! `C = (scale_a * op(A)) * (scale_b * op(B)) + bias`, with an optional
//! output scale and absolute-maximum reduction.
//!
//! Each operand carries its own element type. Scales are per-tensor (one
//! value) or, in row-wise mode, one value per row of `op(A)` and per column
//! of `op(B)`.

use crate::blas::Operand;
use crate::error::ParamsError;
use crate::isolation::GemmOperands;
use crate::op::{checked_bytes, overflow, product_flops, OpParams};
use crate::shape::GemmShape;
use crate::signature::layout_args;
use gemmtune_device::{DeviceAllocator, DevicePtr, ScalarType};
use tracing::warn;

const AMAX_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleTensor {
    pub ptr: DevicePtr,
    pub dtype: ScalarType,
}

impl ScaleTensor {
    pub fn float(ptr: DevicePtr) -> Self {
        Self {
            ptr,
            dtype: ScalarType::Float,
        }
    }
}

#[derive(Debug)]
pub struct ScaledGemmParams {
    pub shape: GemmShape,
    pub a_dtype: ScalarType,
    pub b_dtype: ScalarType,
    pub c_dtype: ScalarType,
    pub bias_dtype: ScalarType,
    pub a_scale: Option<ScaleTensor>,
    pub b_scale: Option<ScaleTensor>,
    /// Single float multiplying the output before it is stored.
    pub c_scale: Option<DevicePtr>,
    pub bias: Option<DevicePtr>,
    /// Single float receiving `max |C|` before output scaling.
    pub amax: Option<DevicePtr>,
    pub use_fast_accum: bool,
    pub use_rowwise: bool,
    operands: GemmOperands,
    /// Private amax target of an isolated copy.
    scratch_amax: Option<DevicePtr>,
}

impl ScaledGemmParams {
    pub fn new(
        shape: GemmShape,
        a_dtype: ScalarType,
        b_dtype: ScalarType,
        c_dtype: ScalarType,
        a: DevicePtr,
        b: DevicePtr,
        c: DevicePtr,
    ) -> Self {
        Self {
            shape,
            a_dtype,
            b_dtype,
            c_dtype,
            bias_dtype: c_dtype,
            a_scale: None,
            b_scale: None,
            c_scale: None,
            bias: None,
            amax: None,
            use_fast_accum: false,
            use_rowwise: false,
            operands: GemmOperands::borrowed(a, b, c),
            scratch_amax: None,
        }
    }

    pub fn with_scales(mut self, a_scale: ScaleTensor, b_scale: ScaleTensor) -> Self {
        self.a_scale = Some(a_scale);
        self.b_scale = Some(b_scale);
        self
    }

    pub fn with_rowwise(mut self, use_rowwise: bool) -> Self {
        self.use_rowwise = use_rowwise;
        self
    }

    pub fn with_bias(mut self, bias: DevicePtr, dtype: ScalarType) -> Self {
        self.bias = Some(bias);
        self.bias_dtype = dtype;
        self
    }

    pub fn with_output_scale(mut self, c_scale: DevicePtr) -> Self {
        self.c_scale = Some(c_scale);
        self
    }

    pub fn with_amax(mut self, amax: DevicePtr) -> Self {
        self.amax = Some(amax);
        self
    }

    pub fn with_fast_accum(mut self, use_fast_accum: bool) -> Self {
        self.use_fast_accum = use_fast_accum;
        self
    }

    pub fn dtype_of(&self, operand: Operand) -> ScalarType {
        match operand {
            Operand::A => self.a_dtype,
            Operand::B => self.b_dtype,
            Operand::C => self.c_dtype,
        }
    }

    pub fn scale_len(&self, operand: Operand) -> usize {
        match (self.use_rowwise, operand) {
            (false, _) => 1,
            (true, Operand::A) => self.shape.m,
            (true, Operand::B) => self.shape.n,
            (true, Operand::C) => 1,
        }
    }
}

impl OpParams for ScaledGemmParams {
    fn op_name(&self) -> String {
        format!(
            "ScaledGemmTunableOp_{}_{}_{}_{}",
            self.a_dtype,
            self.b_dtype,
            self.c_dtype,
            self.shape.transposes()
        )
    }

    fn signature(&self) -> String {
        self.shape.signature()
    }

    fn blas_signature(&self) -> String {
        // fast-accumulation and row-wise flags have no benchmark-tool equivalent
        layout_args(&self.shape, None)
            .arg("--transA", self.shape.transa)
            .arg("--transB", self.shape.transb)
            .arg("--batch_count", 1)
            .arg("--scaleA", "s")
            .arg("--scaleB", "s")
            .arg("--a_type", self.a_dtype)
            .arg("--b_type", self.b_dtype)
            .arg("--c_type", self.c_dtype)
            .arg("--d_type", self.c_dtype)
            .arg("--bias_type", self.bias_dtype)
            .arg("--compute_type", self.c_dtype.compute_type(false))
            .finish()
    }

    fn output_dtype(&self) -> ScalarType {
        self.c_dtype
    }

    fn buffer_size(&self, operand: Operand) -> usize {
        self.shape
            .elements(operand)
            .saturating_mul(self.dtype_of(operand).element_size())
    }

    fn operands(&self) -> &GemmOperands {
        &self.operands
    }

    fn operands_mut(&mut self) -> &mut GemmOperands {
        &mut self.operands
    }

    fn with_operands(&self, operands: GemmOperands) -> Self {
        Self {
            shape: self.shape,
            a_dtype: self.a_dtype,
            b_dtype: self.b_dtype,
            c_dtype: self.c_dtype,
            bias_dtype: self.bias_dtype,
            a_scale: self.a_scale,
            b_scale: self.b_scale,
            c_scale: self.c_scale,
            bias: self.bias,
            amax: self.amax,
            use_fast_accum: self.use_fast_accum,
            use_rowwise: self.use_rowwise,
            operands,
            scratch_amax: None,
        }
    }

    /// Isolated copies also redirect `amax` to a scratch float so trials
    /// never write the caller's reduction target. Scales and bias stay
    /// borrowed.
    fn isolate<D>(&self, device: &D, duplicate_inputs: bool) -> Result<Self, ParamsError>
    where
        D: DeviceAllocator + ?Sized,
    {
        self.validate()?;
        let operands = self
            .operands
            .isolate(device, self.sizes(), duplicate_inputs)?;
        let mut copy = self.with_operands(operands);
        if self.amax.is_some() {
            match device.allocate(AMAX_BYTES) {
                Ok(scratch) => {
                    copy.amax = Some(scratch);
                    copy.scratch_amax = Some(scratch);
                }
                Err(source) => {
                    if let Err(err) = copy.operands.release(device) {
                        warn!(error = %err, "isolate: failed to free partial copy");
                    }
                    return Err(ParamsError::Allocation {
                        operand: Operand::C,
                        bytes: AMAX_BYTES,
                        source,
                    });
                }
            }
        }
        Ok(copy)
    }

    fn release<D>(&mut self, device: &D) -> Result<(), ParamsError>
    where
        D: DeviceAllocator + ?Sized,
    {
        if !self.operands.is_isolated() {
            return self.operands.release(device);
        }
        let scratch = self.scratch_amax.take().map(|ptr| device.free(ptr));
        self.amax = None;
        self.operands.release(device)?;
        match scratch {
            Some(Err(err)) => Err(ParamsError::Device(err)),
            _ => Ok(()),
        }
    }

    fn validate(&self) -> Result<(), ParamsError> {
        for operand in [Operand::A, Operand::B, Operand::C] {
            checked_bytes(self.shape.checked_elements(operand), self.dtype_of(operand))
                .ok_or_else(|| overflow(operand, &self.signature()))?;
        }
        if self.use_rowwise && (self.a_scale.is_none() || self.b_scale.is_none()) {
            return Err(ParamsError::ContractViolation(format!(
                "row-wise scaling requested without scale tensors for shape {}",
                self.signature()
            )));
        }
        Ok(())
    }

    fn flops(&self) -> u64 {
        let GemmShape { m, n, k, .. } = self.shape;
        let epilogue = if self.bias.is_some() {
            (m as u64).saturating_mul(n as u64)
        } else {
            0
        };
        product_flops(m, n, k).saturating_add(epilogue)
    }

    fn min_bytes_moved(&self) -> u64 {
        let operands = [Operand::A, Operand::B, Operand::C]
            .iter()
            .map(|&operand| {
                self.shape.dense_elements(operand) as u64
                    * self.dtype_of(operand).element_size() as u64
            })
            .sum::<u64>();
        let bias = if self.bias.is_some() {
            self.shape.m as u64 * self.bias_dtype.element_size() as u64
        } else {
            0
        };
        operands + bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blas::BlasOp;
    use gemmtune_device::{DeviceAllocator, HostDevice};

    fn ptr(address: u64) -> DevicePtr {
        DevicePtr::new(address)
    }

    fn fp8_params() -> ScaledGemmParams {
        let shape = GemmShape::new(BlasOp::N, BlasOp::T, 32, 16, 64);
        ScaledGemmParams::new(
            shape,
            ScalarType::Float8E4M3Fn,
            ScalarType::Float8E4M3Fn,
            ScalarType::BFloat16,
            ptr(1),
            ptr(2),
            ptr(3),
        )
        .with_scales(ScaleTensor::float(ptr(4)), ScaleTensor::float(ptr(5)))
    }

    #[test]
    fn operands_are_sized_by_their_own_types() {
        let params = fp8_params();
        assert_eq!(params.buffer_size(Operand::A), 32 * 64);
        assert_eq!(params.buffer_size(Operand::B), 64 * 16);
        assert_eq!(params.buffer_size(Operand::C), 32 * 16 * 2);
        assert_eq!(params.output_dtype(), ScalarType::BFloat16);
    }

    #[test]
    fn names_and_benchmark_string() {
        let params = fp8_params().with_bias(ptr(6), ScalarType::Half);
        assert_eq!(
            params.op_name(),
            "ScaledGemmTunableOp_Float8_e4m3fn_Float8_e4m3fn_BFloat16_NT"
        );
        assert_eq!(params.signature(), "NT_32_16_64_ld_32_16_32");
        assert_eq!(
            params.blas_signature(),
            "-m 32 -n 16 -k 64 --lda 32 --ldb 16 --ldc 32 --ldd 32 \
             --stride_a 0 --stride_b 0 --stride_c 0 --stride_d 0 \
             --transA N --transB T --batch_count 1 --scaleA s --scaleB s \
             --a_type Float8_e4m3fn --b_type Float8_e4m3fn --c_type BFloat16 --d_type BFloat16 \
             --bias_type Half --compute_type float"
        );
    }

    #[test]
    fn rowwise_without_scales_is_a_contract_violation() {
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 4, 4, 4);
        let params = ScaledGemmParams::new(
            shape,
            ScalarType::Float8E5M2,
            ScalarType::Float8E4M3Fn,
            ScalarType::Float,
            ptr(1),
            ptr(2),
            ptr(3),
        )
        .with_rowwise(true);
        assert!(params.validate().unwrap_err().is_contract_violation());
        assert_eq!(params.scale_len(Operand::A), 4);
        assert!(fp8_params().with_rowwise(true).validate().is_ok());
    }

    #[test]
    fn isolation_redirects_amax_to_scratch() {
        let device = HostDevice::new();
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 4, 4, 4);
        let a = device.allocate(16).unwrap();
        let b = device.allocate(16).unwrap();
        let c = device.allocate(64).unwrap();
        let scale = device.allocate(4).unwrap();
        let amax = device.allocate(4).unwrap();
        let params = ScaledGemmParams::new(
            shape,
            ScalarType::Float8E4M3Fn,
            ScalarType::Float8E4M3Fn,
            ScalarType::Float,
            a,
            b,
            c,
        )
        .with_scales(ScaleTensor::float(scale), ScaleTensor::float(scale))
        .with_amax(amax);

        let mut copy = params.isolate(&device, true).unwrap();
        let scratch = copy.amax.unwrap();
        assert_ne!(scratch, amax);
        assert!(device.is_live(scratch));
        assert_eq!(copy.a_scale, Some(ScaleTensor::float(scale)));
        copy.release(&device).unwrap();
        assert!(device.is_live(scale) && device.is_live(amax));
        assert!(!device.is_live(scratch));
        assert_eq!(device.stats().frees, 4);
        assert!(copy.release(&device).unwrap_err().is_contract_violation());
    }

    #[test]
    fn failed_scratch_allocation_frees_the_output_copy() {
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 4, 4, 4);
        // room for the caller buffers and the output copy, not the scratch
        let device = HostDevice::with_capacity(16 + 16 + 64 + 4 + 64);
        let a = device.allocate(16).unwrap();
        let b = device.allocate(16).unwrap();
        let c = device.allocate(64).unwrap();
        let amax = device.allocate(4).unwrap();
        let live = device.stats().live_bytes;
        let params = ScaledGemmParams::new(
            shape,
            ScalarType::Float8E4M3Fn,
            ScalarType::Float8E4M3Fn,
            ScalarType::Float,
            a,
            b,
            c,
        )
        .with_amax(amax);

        let err = params.isolate(&device, false).unwrap_err();
        assert!(matches!(err, ParamsError::Allocation { bytes: 4, .. }));
        assert_eq!(device.stats().live_bytes, live);
    }
}
