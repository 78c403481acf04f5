//! Plain GEMM: `C = alpha * op(A) * op(B) + beta * C`.

use crate::blas::{Operand, Scalar};
use crate::error::ParamsError;
use crate::isolation::GemmOperands;
use crate::op::{checked_bytes, overflow, product_flops, OpParams};
use crate::shape::GemmShape;
use crate::signature::layout_args;
use gemmtune_device::{DevicePtr, ScalarType};

#[derive(Debug)]
pub struct GemmParams {
    pub dtype: ScalarType,
    pub shape: GemmShape,
    pub alpha: Scalar,
    pub beta: Scalar,
    /// Float inputs may accumulate in TF32.
    pub allow_tf32: bool,
    operands: GemmOperands,
}

impl GemmParams {
    /// `alpha = 1`, `beta = 0` over caller-owned buffers.
    pub fn new(dtype: ScalarType, shape: GemmShape, a: DevicePtr, b: DevicePtr, c: DevicePtr) -> Self {
        Self {
            dtype,
            shape,
            alpha: Scalar::ONE,
            beta: Scalar::ZERO,
            allow_tf32: false,
            operands: GemmOperands::borrowed(a, b, c),
        }
    }

    pub fn with_scalars(mut self, alpha: impl Into<Scalar>, beta: impl Into<Scalar>) -> Self {
        self.alpha = alpha.into();
        self.beta = beta.into();
        self
    }

    pub fn with_tf32(mut self, allow_tf32: bool) -> Self {
        self.allow_tf32 = allow_tf32;
        self
    }
}

impl OpParams for GemmParams {
    fn op_name(&self) -> String {
        format!("GemmTunableOp_{}_{}", self.dtype, self.shape.transposes())
    }

    fn signature(&self) -> String {
        self.shape.signature()
    }

    fn blas_signature(&self) -> String {
        let ty = self.dtype.name();
        layout_args(&self.shape, None)
            .arg("--alpha", self.alpha)
            .arg("--beta", self.beta)
            .arg("--transA", self.shape.transa)
            .arg("--transB", self.shape.transb)
            .arg("--batch_count", 1)
            .arg("--a_type", ty)
            .arg("--b_type", ty)
            .arg("--c_type", ty)
            .arg("--d_type", ty)
            .arg("--compute_type", self.dtype.compute_type(self.allow_tf32))
            .finish()
    }

    fn output_dtype(&self) -> ScalarType {
        self.dtype
    }

    fn buffer_size(&self, operand: Operand) -> usize {
        self.shape
            .elements(operand)
            .saturating_mul(self.dtype.element_size())
    }

    fn operands(&self) -> &GemmOperands {
        &self.operands
    }

    fn operands_mut(&mut self) -> &mut GemmOperands {
        &mut self.operands
    }

    fn with_operands(&self, operands: GemmOperands) -> Self {
        Self {
            dtype: self.dtype,
            shape: self.shape,
            alpha: self.alpha,
            beta: self.beta,
            allow_tf32: self.allow_tf32,
            operands,
        }
    }

    fn validate(&self) -> Result<(), ParamsError> {
        for operand in [Operand::A, Operand::B, Operand::C] {
            checked_bytes(self.shape.checked_elements(operand), self.dtype)
                .ok_or_else(|| overflow(operand, &self.signature()))?;
        }
        Ok(())
    }

    fn flops(&self) -> u64 {
        product_flops(self.shape.m, self.shape.n, self.shape.k)
    }

    fn min_bytes_moved(&self) -> u64 {
        let elements = [Operand::A, Operand::B, Operand::C]
            .iter()
            .map(|&operand| self.shape.dense_elements(operand) as u64)
            .sum::<u64>();
        elements * self.dtype.element_size() as u64
    }
}
