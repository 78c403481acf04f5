//! Strided-batched GEMM: `batch` independent GEMMs whose operands sit at a
//! fixed element stride from each other.

use crate::blas::{Operand, Scalar};
use crate::error::ParamsError;
use crate::isolation::GemmOperands;
use crate::op::{checked_bytes, overflow, product_flops, OpParams};
use crate::shape::{GemmShape, StridedBatch};
use crate::signature::layout_args;
use gemmtune_device::{DevicePtr, ScalarType};

#[derive(Debug)]
pub struct GemmStridedBatchedParams {
    pub dtype: ScalarType,
    pub shape: GemmShape,
    pub batch: StridedBatch,
    pub alpha: Scalar,
    pub beta: Scalar,
    pub allow_tf32: bool,
    operands: GemmOperands,
}

impl GemmStridedBatchedParams {
    pub fn new(
        dtype: ScalarType,
        shape: GemmShape,
        batch: StridedBatch,
        a: DevicePtr,
        b: DevicePtr,
        c: DevicePtr,
    ) -> Self {
        Self {
            dtype,
            shape,
            batch,
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

impl OpParams for GemmStridedBatchedParams {
    fn op_name(&self) -> String {
        format!(
            "GemmStridedBatchedTunableOp_{}_{}",
            self.dtype,
            self.shape.transposes()
        )
    }

    fn signature(&self) -> String {
        self.batch.signature(&self.shape)
    }

    fn blas_signature(&self) -> String {
        let ty = self.dtype.name();
        layout_args(&self.shape, Some(&self.batch))
            .arg("--alpha", self.alpha)
            .arg("--beta", self.beta)
            .arg("--transA", self.shape.transa)
            .arg("--transB", self.shape.transb)
            .arg("--batch_count", self.batch.batch)
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
        self.batch
            .elements(&self.shape, operand)
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
            batch: self.batch,
            alpha: self.alpha,
            beta: self.beta,
            allow_tf32: self.allow_tf32,
            operands,
        }
    }

    fn validate(&self) -> Result<(), ParamsError> {
        for operand in [Operand::A, Operand::B, Operand::C] {
            checked_bytes(self.batch.checked_elements(&self.shape, operand), self.dtype)
                .ok_or_else(|| overflow(operand, &self.signature()))?;
        }
        Ok(())
    }

    fn flops(&self) -> u64 {
        product_flops(self.shape.m, self.shape.n, self.shape.k).saturating_mul(self.batch.batch as u64)
    }

    fn min_bytes_moved(&self) -> u64 {
        let per_batch = [Operand::A, Operand::B, Operand::C]
            .iter()
            .map(|&operand| self.shape.dense_elements(operand) as u64)
            .sum::<u64>();
        per_batch * self.batch.batch as u64 * self.dtype.element_size() as u64
    }
}
