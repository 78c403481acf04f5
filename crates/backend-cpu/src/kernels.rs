//! Column-major GEMM kernels over host slices.

use anyhow::{ensure, Result};
use gemmtune_params::{Activation, BlasOp, GemmShape, Operand};
use ndarray::{ArrayView2, ArrayViewMut2, ShapeBuilder, Zip};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy)]
pub struct GemmProblem {
    pub shape: GemmShape,
    pub alpha: f64,
    pub beta: f64,
}

impl GemmProblem {
    pub fn new(shape: GemmShape, alpha: f64, beta: f64) -> Self {
        Self { shape, alpha, beta }
    }

    /// Elements spanned by one stored matrix, from its first to its last
    /// element.
    pub fn span(&self, operand: Operand) -> usize {
        let rows = self.shape.stored_rows(operand);
        let cols = self.shape.stored_cols(operand);
        if rows == 0 || cols == 0 {
            0
        } else {
            self.shape.leading_dim(operand) * (cols - 1) + rows
        }
    }

    #[inline]
    fn a_at(&self, a: &[f64], i: usize, p: usize) -> f64 {
        match self.shape.transa {
            BlasOp::N => a[i + p * self.shape.lda],
            BlasOp::T => a[p + i * self.shape.lda],
        }
    }

    #[inline]
    fn b_at(&self, b: &[f64], p: usize, j: usize) -> f64 {
        match self.shape.transb {
            BlasOp::N => b[p + j * self.shape.ldb],
            BlasOp::T => b[j + p * self.shape.ldb],
        }
    }

    #[inline]
    fn blend(&self, product: f64, previous: f64) -> f64 {
        // beta == 0 must not propagate NaNs from uninitialized output
        if self.beta == 0.0 {
            self.alpha * product
        } else {
            self.alpha * product + self.beta * previous
        }
    }
}

/// Leading dimensions cover at least the stored rows of every operand.
pub fn layout_is_valid(shape: &GemmShape) -> bool {
    [Operand::A, Operand::B, Operand::C]
        .iter()
        .all(|&operand| shape.leading_dim(operand) >= shape.stored_rows(operand).max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKernel {
    /// Triple loop accumulating in f64.
    Reference,
    /// Strided ndarray views multiplied with `dot`.
    Ndarray,
    /// Output columns in parallel with rayon, accumulating in f32.
    Parallel,
}

impl HostKernel {
    pub const ALL: [HostKernel; 3] = [HostKernel::Reference, HostKernel::Ndarray, HostKernel::Parallel];

    pub fn name(self) -> &'static str {
        match self {
            HostKernel::Reference => "reference",
            HostKernel::Ndarray => "ndarray",
            HostKernel::Parallel => "parallel",
        }
    }

    pub fn gemm(self, problem: &GemmProblem, a: &[f64], b: &[f64], c: &mut [f64]) -> Result<()> {
        let spans = [Operand::A, Operand::B, Operand::C].map(|operand| problem.span(operand));
        ensure!(
            a.len() >= spans[0] && b.len() >= spans[1] && c.len() >= spans[2],
            "operand buffers too small for {}: have {}/{}/{} elements, need {}/{}/{}",
            problem.shape.signature(),
            a.len(),
            b.len(),
            c.len(),
            spans[0],
            spans[1],
            spans[2]
        );
        ensure!(
            layout_is_valid(&problem.shape),
            "leading dimensions of {} are smaller than the stored rows",
            problem.shape.signature()
        );
        match self {
            HostKernel::Reference => reference_gemm(problem, a, b, c),
            HostKernel::Ndarray => ndarray_gemm(problem, &a[..spans[0]], &b[..spans[1]], &mut c[..spans[2]])?,
            HostKernel::Parallel => parallel_gemm(problem, a, b, c),
        }
        Ok(())
    }
}

fn reference_gemm(problem: &GemmProblem, a: &[f64], b: &[f64], c: &mut [f64]) {
    let GemmShape { m, n, k, ldc, .. } = problem.shape;
    for j in 0..n {
        for i in 0..m {
            let mut acc = 0.0f64;
            for p in 0..k {
                acc += problem.a_at(a, i, p) * problem.b_at(b, p, j);
            }
            let out = &mut c[i + j * ldc];
            *out = problem.blend(acc, *out);
        }
    }
}

fn stored_view<'a>(
    problem: &GemmProblem,
    operand: Operand,
    data: &'a [f64],
) -> Result<ArrayView2<'a, f64>> {
    let shape = &problem.shape;
    let rows = shape.stored_rows(operand);
    let cols = shape.stored_cols(operand);
    let view = ArrayView2::from_shape((rows, cols).strides((1, shape.leading_dim(operand))), data)?;
    Ok(view)
}

fn ndarray_gemm(problem: &GemmProblem, a: &[f64], b: &[f64], c: &mut [f64]) -> Result<()> {
    let shape = problem.shape;
    let a = stored_view(problem, Operand::A, a)?;
    let b = stored_view(problem, Operand::B, b)?;
    let a = if shape.transa.is_transposed() { a.reversed_axes() } else { a };
    let b = if shape.transb.is_transposed() { b.reversed_axes() } else { b };

    let product = a.dot(&b);
    let mut out = ArrayViewMut2::from_shape((shape.m, shape.n).strides((1, shape.ldc)), c)?;
    Zip::from(&mut out)
        .and(&product)
        .for_each(|out, &value| *out = problem.blend(value, *out));
    Ok(())
}

fn parallel_gemm(problem: &GemmProblem, a: &[f64], b: &[f64], c: &mut [f64]) {
    let GemmShape { m, n, k, ldc, .. } = problem.shape;
    if m == 0 || n == 0 {
        return;
    }
    c.par_chunks_mut(ldc)
        .take(n)
        .enumerate()
        .for_each(|(j, column)| {
            for (i, out) in column.iter_mut().take(m).enumerate() {
                let mut acc = 0.0f32;
                for p in 0..k {
                    acc += problem.a_at(a, i, p) as f32 * problem.b_at(b, p, j) as f32;
                }
                *out = problem.blend(acc as f64, *out);
            }
        });
}

/// `c[i, j] = act(c[i, j] + bias[i])` over an `m x n` column-major matrix.
pub fn apply_bias_activation(
    c: &mut [f64],
    ldc: usize,
    m: usize,
    n: usize,
    bias: Option<&[f64]>,
    activation: Activation,
) -> Result<()> {
    if let Some(bias) = bias {
        ensure!(
            bias.len() >= m,
            "bias has {} elements, output has {m} rows",
            bias.len()
        );
    }
    for j in 0..n {
        let column = &mut c[j * ldc..j * ldc + m];
        for (i, value) in column.iter_mut().enumerate() {
            let biased = *value + bias.map_or(0.0, |bias| bias[i]);
            *value = activation.apply(biased);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn filled(len: usize, seed: u64) -> Vec<f64> {
        let mut rng = fastrand::Rng::with_seed(seed);
        (0..len).map(|_| rng.f64() * 2.0 - 1.0).collect()
    }

    #[test]
    fn two_by_two_by_hand() {
        // A = [1 3; 2 4], B = [5 7; 6 8] in column-major order
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 2, 2, 2);
        let problem = GemmProblem::new(shape, 1.0, 0.0);
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        for kernel in HostKernel::ALL {
            let mut c = [f64::NAN; 4];
            kernel.gemm(&problem, &a, &b, &mut c).unwrap();
            assert_eq!(c, [23.0, 34.0, 31.0, 46.0], "{}", kernel.name());
        }
    }

    #[test]
    fn kernels_agree_on_transposed_padded_layouts() {
        for (transa, transb) in [(BlasOp::N, BlasOp::N), (BlasOp::T, BlasOp::N), (BlasOp::N, BlasOp::T), (BlasOp::T, BlasOp::T)] {
            let base = GemmShape::new(transa, transb, 7, 5, 9);
            let shape = base.with_leading_dims(base.lda + 3, base.ldb + 1, base.ldc + 2);
            let problem = GemmProblem::new(shape, 0.5, -2.0);
            let a = filled(shape.elements(Operand::A), 1);
            let b = filled(shape.elements(Operand::B), 2);
            let c0 = filled(shape.elements(Operand::C), 3);

            let mut expected = c0.clone();
            HostKernel::Reference.gemm(&problem, &a, &b, &mut expected).unwrap();
            for kernel in [HostKernel::Ndarray, HostKernel::Parallel] {
                let mut c = c0.clone();
                kernel.gemm(&problem, &a, &b, &mut c).unwrap();
                for (got, want) in c.iter().zip(&expected) {
                    assert_relative_eq!(*got, *want, epsilon = 1e-5, max_relative = 1e-5);
                }
            }
            // padding rows of C are left alone
            assert_eq!(expected[7], c0[7]);
        }
    }

    #[test]
    fn short_buffers_are_rejected() {
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 4, 4, 4);
        let problem = GemmProblem::new(shape, 1.0, 0.0);
        let mut c = vec![0.0; 16];
        assert!(HostKernel::Reference
            .gemm(&problem, &[0.0; 15], &[0.0; 16], &mut c)
            .is_err());
    }

    #[test]
    fn invalid_leading_dimension_is_rejected() {
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 4, 4, 4).with_leading_dims(2, 4, 4);
        assert!(!layout_is_valid(&shape));
        let problem = GemmProblem::new(shape, 1.0, 0.0);
        let mut c = vec![0.0; 16];
        assert!(HostKernel::Ndarray
            .gemm(&problem, &[0.0; 16], &[0.0; 16], &mut c)
            .is_err());
    }

    #[test]
    fn bias_and_activation_epilogue() {
        let mut c = vec![-1.0, 2.0, 0.0, -3.0, 1.0, 0.0];
        apply_bias_activation(&mut c, 3, 2, 2, Some(&[0.5, -0.5]), Activation::Relu).unwrap();
        assert_eq!(c, vec![0.0, 1.5, 0.0, 0.0, 0.5, 0.0]);
        assert!(apply_bias_activation(&mut c, 3, 2, 2, Some(&[1.0]), Activation::None).is_err());
    }
}
