//! Benchmark-tool invocation strings.
//!
//! Field order and flag names are consumed by an external benchmarking
//! executable and must stay stable.

use crate::shape::{GemmShape, StridedBatch};
use std::fmt::Display;

/// Space-separated `flag value` pairs.
#[derive(Debug, Clone, Default)]
pub struct BenchArgs {
    parts: Vec<String>,
}

impl BenchArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, flag: &str, value: impl Display) -> Self {
        self.parts.push(format!("{flag} {value}"));
        self
    }

    pub fn finish(self) -> String {
        self.parts.join(" ")
    }
}

/// Dimensions, leading dimensions and strides. D aliases C, so its leading
/// dimension and stride repeat C's. Non-batched invocations report zero
/// strides.
pub fn layout_args(shape: &GemmShape, batch: Option<&StridedBatch>) -> BenchArgs {
    let (stride_a, stride_b, stride_c) =
        batch.map_or((0, 0, 0), |b| (b.stride_a, b.stride_b, b.stride_c));
    BenchArgs::new()
        .arg("-m", shape.m)
        .arg("-n", shape.n)
        .arg("-k", shape.k)
        .arg("--lda", shape.lda)
        .arg("--ldb", shape.ldb)
        .arg("--ldc", shape.ldc)
        .arg("--ldd", shape.ldc)
        .arg("--stride_a", stride_a)
        .arg("--stride_b", stride_b)
        .arg("--stride_c", stride_c)
        .arg("--stride_d", stride_c)
}
