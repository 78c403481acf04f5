//! GEMM with a fused bias and activation epilogue:
//! `C = act(alpha * op(A) * op(B) + bias)`, bias broadcast along each row.

use crate::blas::{Activation, Operand, Scalar};
use crate::error::ParamsError;
use crate::isolation::GemmOperands;
use crate::op::{checked_bytes, overflow, product_flops, OpParams};
use crate::shape::GemmShape;
use crate::signature::layout_args;
use gemmtune_device::{DevicePtr, ScalarType};

#[derive(Debug)]
pub struct GemmAndBiasParams {
    pub dtype: ScalarType,
    pub shape: GemmShape,
    pub alpha: Scalar,
    /// `m` values of `dtype`. Always borrowed.
    pub bias: DevicePtr,
    pub activation: Activation,
    pub allow_tf32: bool,
    operands: GemmOperands,
}

impl GemmAndBiasParams {
    pub fn new(
        dtype: ScalarType,
        shape: GemmShape,
        a: DevicePtr,
        b: DevicePtr,
        c: DevicePtr,
        bias: DevicePtr,
    ) -> Self {
        Self {
            dtype,
            shape,
            alpha: Scalar::ONE,
            bias,
            activation: Activation::None,
            allow_tf32: false,
            operands: GemmOperands::borrowed(a, b, c),
        }
    }

    pub fn with_alpha(mut self, alpha: impl Into<Scalar>) -> Self {
        self.alpha = alpha.into();
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_tf32(mut self, allow_tf32: bool) -> Self {
        self.allow_tf32 = allow_tf32;
        self
    }

    pub fn bias_size(&self) -> usize {
        self.shape.m.saturating_mul(self.dtype.element_size())
    }
}

impl OpParams for GemmAndBiasParams {
    fn op_name(&self) -> String {
        format!("GemmAndBiasTunableOp_{}_{}", self.dtype, self.shape.transposes())
    }

    fn signature(&self) -> String {
        self.shape.signature()
    }

    fn blas_signature(&self) -> String {
        let ty = self.dtype.name();
        layout_args(&self.shape, None)
            .arg("--alpha", self.alpha)
            .arg("--transA", self.shape.transa)
            .arg("--transB", self.shape.transb)
            .arg("--batch_count", 1)
            .arg("--a_type", ty)
            .arg("--b_type", ty)
            .arg("--c_type", ty)
            .arg("--d_type", ty)
            .arg("--activation", self.activation)
            .arg("--bias_type", ty)
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
            bias: self.bias,
            activation: self.activation,
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
        let GemmShape { m, n, k, .. } = self.shape;
        product_flops(m, n, k).saturating_add((m as u64).saturating_mul(n as u64))
    }

    fn min_bytes_moved(&self) -> u64 {
        let elements = [Operand::A, Operand::B, Operand::C]
            .iter()
            .map(|&operand| self.shape.dense_elements(operand) as u64)
            .sum::<u64>()
            + self.shape.m as u64;
        elements * self.dtype.element_size() as u64
    }
}
