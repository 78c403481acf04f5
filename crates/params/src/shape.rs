//! Shapes, leading dimensions and buffer footprints.
//!
//! Matrices are column-major. Operand A is `m x k` after `transa` is applied,
//! B is `k x n` after `transb`, C is `m x n`. A leading dimension is the
//! distance in elements between two consecutive stored columns.

use crate::blas::{BlasOp, Operand};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmShape {
    pub transa: BlasOp,
    pub transb: BlasOp,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
}

impl GemmShape {
    /// Shape with dense leading dimensions for the given transposes.
    pub fn new(transa: BlasOp, transb: BlasOp, m: usize, n: usize, k: usize) -> Self {
        let lda = if transa.is_transposed() { k } else { m };
        let ldb = if transb.is_transposed() { n } else { k };
        Self {
            transa,
            transb,
            m,
            n,
            k,
            lda: lda.max(1),
            ldb: ldb.max(1),
            ldc: m.max(1),
        }
    }

    pub fn with_leading_dims(mut self, lda: usize, ldb: usize, ldc: usize) -> Self {
        self.lda = lda;
        self.ldb = ldb;
        self.ldc = ldc;
        self
    }

    pub fn leading_dim(&self, operand: Operand) -> usize {
        match operand {
            Operand::A => self.lda,
            Operand::B => self.ldb,
            Operand::C => self.ldc,
        }
    }

    pub fn stored_cols(&self, operand: Operand) -> usize {
        match operand {
            Operand::A => {
                if self.transa.is_transposed() {
                    self.m
                } else {
                    self.k
                }
            }
            Operand::B => {
                if self.transb.is_transposed() {
                    self.k
                } else {
                    self.n
                }
            }
            Operand::C => self.n,
        }
    }

    pub fn stored_rows(&self, operand: Operand) -> usize {
        match operand {
            Operand::A => {
                if self.transa.is_transposed() {
                    self.k
                } else {
                    self.m
                }
            }
            Operand::B => {
                if self.transb.is_transposed() {
                    self.n
                } else {
                    self.k
                }
            }
            Operand::C => self.m,
        }
    }

    pub fn dense_elements(&self, operand: Operand) -> usize {
        self.stored_rows(operand)
            .saturating_mul(self.stored_cols(operand))
    }

    pub fn strided_elements(&self, operand: Operand) -> usize {
        self.leading_dim(operand)
            .saturating_mul(self.stored_cols(operand))
    }

    /// Element footprint of one matrix: the larger of the strided and the
    /// dense requirement.
    pub fn elements(&self, operand: Operand) -> usize {
        self.strided_elements(operand)
            .max(self.dense_elements(operand))
    }

    pub fn checked_elements(&self, operand: Operand) -> Option<usize> {
        let strided = self
            .leading_dim(operand)
            .checked_mul(self.stored_cols(operand))?;
        let dense = self
            .stored_rows(operand)
            .checked_mul(self.stored_cols(operand))?;
        Some(strided.max(dense))
    }

    pub fn transposes(&self) -> String {
        format!("{}{}", self.transa, self.transb)
    }

    pub fn signature(&self) -> String {
        format!(
            "{}{}_{}_{}_{}_ld_{}_{}_{}",
            self.transa, self.transb, self.m, self.n, self.k, self.lda, self.ldb, self.ldc
        )
    }
}

/// Inter-batch strides (in elements) and batch count of a strided-batched GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StridedBatch {
    pub stride_a: usize,
    pub stride_b: usize,
    pub stride_c: usize,
    pub batch: usize,
}

impl StridedBatch {
    /// Packed batches: every stride equals the dense per-batch footprint.
    pub fn dense(shape: &GemmShape, batch: usize) -> Self {
        Self {
            stride_a: shape.elements(Operand::A),
            stride_b: shape.elements(Operand::B),
            stride_c: shape.elements(Operand::C),
            batch,
        }
    }

    pub fn stride(&self, operand: Operand) -> usize {
        match operand {
            Operand::A => self.stride_a,
            Operand::B => self.stride_b,
            Operand::C => self.stride_c,
        }
    }

    /// Element footprint of all batches of one operand.
    pub fn elements(&self, shape: &GemmShape, operand: Operand) -> usize {
        self.checked_elements(shape, operand).unwrap_or(usize::MAX)
    }

    /// The footprint covers `stride * batch`, the dense batched size, and the
    /// last batch's own strided extent, whichever is largest.
    pub fn checked_elements(&self, shape: &GemmShape, operand: Operand) -> Option<usize> {
        if self.batch == 0 {
            return Some(0);
        }
        let stride = self.stride(operand);
        let strided = stride.checked_mul(self.batch)?;
        let dense = shape.dense_elements(operand).checked_mul(self.batch)?;
        let last = stride
            .checked_mul(self.batch - 1)?
            .checked_add(shape.checked_elements(operand)?)?;
        Some(strided.max(dense).max(last))
    }

    pub fn signature(&self, shape: &GemmShape) -> String {
        format!(
            "{}{}_{}_{}_{}_B_{}_ld_{}_{}_{}",
            shape.transa,
            shape.transb,
            shape.m,
            shape.n,
            shape.k,
            self.batch,
            shape.lda,
            shape.ldb,
            shape.ldc
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn dense_leading_dims_follow_transposes() {
        let nn = GemmShape::new(BlasOp::N, BlasOp::N, 3, 5, 7);
        assert_eq!((nn.lda, nn.ldb, nn.ldc), (3, 7, 3));
        let tt = GemmShape::new(BlasOp::T, BlasOp::T, 3, 5, 7);
        assert_eq!((tt.lda, tt.ldb, tt.ldc), (7, 5, 3));
        assert_eq!(tt.stored_cols(Operand::A), 3);
        assert_eq!(tt.stored_cols(Operand::B), 7);
    }

    #[test]
    fn signature_matches_documented_example() {
        let shape = GemmShape::new(BlasOp::N, BlasOp::T, 128, 256, 64).with_leading_dims(128, 64, 128);
        assert_eq!(shape.signature(), "NT_128_256_64_ld_128_64_128");
    }

    #[test]
    fn small_leading_dimension_falls_back_to_dense() {
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 16, 16, 16).with_leading_dims(1, 1, 1);
        assert_eq!(shape.elements(Operand::A), 256);
        assert_eq!(shape.elements(Operand::C), 256);
    }

    #[test]
    fn padded_leading_dimension_wins() {
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 4, 4, 4).with_leading_dims(4, 4, 10);
        assert_eq!(shape.elements(Operand::C), 40);
    }

    #[test]
    fn batched_dense_stride_matches_dense_size() {
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 8, 6, 4);
        let batch = StridedBatch::dense(&shape, 8);
        assert_eq!(batch.stride_a, 32);
        assert_eq!(batch.elements(&shape, Operand::A), 8 * 32);
        assert_eq!(batch.elements(&shape, Operand::B), 8 * 24);
    }

    #[test]
    fn overlapping_stride_covers_last_batch() {
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 4, 4, 4);
        let batch = StridedBatch {
            stride_a: 0,
            stride_b: 2,
            stride_c: 16,
            batch: 3,
        };
        // Broadcast A still needs one whole matrix per batch in the dense bound.
        assert_eq!(batch.elements(&shape, Operand::A), 48);
        assert_eq!(batch.elements(&shape, Operand::B), 48);
        assert_eq!(batch.elements(&shape, Operand::C), 48);
    }

    #[test]
    fn batched_signature_includes_count() {
        let shape = GemmShape::new(BlasOp::T, BlasOp::N, 2, 3, 4);
        let batch = StridedBatch::dense(&shape, 5);
        assert_eq!(batch.signature(&shape), "TN_2_3_4_B_5_ld_4_4_2");
    }

    #[test]
    fn overflow_is_detected() {
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, usize::MAX, 2, 2);
        assert_eq!(shape.checked_elements(Operand::C), None);
        assert_eq!(shape.elements(Operand::C), usize::MAX);
    }

    fn shapes() -> impl Strategy<Value = GemmShape> {
        (
            prop::bool::ANY,
            prop::bool::ANY,
            0usize..64,
            0usize..64,
            0usize..64,
            0usize..96,
            0usize..96,
            0usize..96,
        )
            .prop_map(|(ta, tb, m, n, k, lda, ldb, ldc)| {
                let op = |t: bool| if t { BlasOp::T } else { BlasOp::N };
                GemmShape::new(op(ta), op(tb), m, n, k).with_leading_dims(lda, ldb, ldc)
            })
    }

    proptest! {
        #[test]
        fn footprint_never_below_dense(shape in shapes(), batch in 0usize..9, stride in 0usize..512) {
            for operand in [Operand::A, Operand::B, Operand::C] {
                prop_assert!(shape.elements(operand) >= shape.dense_elements(operand));
                let strided = StridedBatch { stride_a: stride, stride_b: stride, stride_c: stride, batch };
                prop_assert!(strided.elements(&shape, operand) >= shape.dense_elements(operand) * batch);
                prop_assert!(strided.elements(&shape, operand) >= stride * batch);
            }
        }
    }
}
