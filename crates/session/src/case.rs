//! Tuning cases: a shape and variant plus deterministic operands.

use anyhow::Result;
use gemmtune_backend_cpu::HostExecutor;
use gemmtune_device::{DeviceAllocator, DevicePtr, ScalarType};
use gemmtune_params::{
    Activation, BlasOp, GemmAndBiasParams, GemmParams, GemmShape, GemmStridedBatchedParams,
    OpParams, Operand, ScaleTensor, ScaledGemmParams, StridedBatch,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    Gemm,
    Bias,
    Batched,
    Scaled,
}

/// Input element type of scaled cases; the case dtype is the output type.
pub const SCALED_INPUT_DTYPE: ScalarType = ScalarType::Float8E4M3Fn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneCase {
    pub name: String,
    pub variant: Variant,
    pub dtype: ScalarType,
    pub shape: GemmShape,
    pub batch: usize,
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSignature {
    pub op_name: String,
    pub signature: String,
    pub blas_signature: String,
}

impl TuneCase {
    pub fn new(
        name: impl Into<String>,
        variant: Variant,
        dtype: ScalarType,
        shape: GemmShape,
    ) -> Self {
        Self {
            name: name.into(),
            variant,
            dtype,
            shape,
            batch: 1,
            activation: Activation::None,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Describe the case without touching any device.
    pub fn describe(&self) -> CaseSignature {
        let placeholder = CaseBuffers::placeholder();
        match self.variant {
            Variant::Gemm => describe(&self.gemm(&placeholder)),
            Variant::Bias => describe(&self.bias(&placeholder)),
            Variant::Batched => describe(&self.batched(&placeholder)),
            Variant::Scaled => describe(&self.scaled(&placeholder)),
        }
    }

    pub fn gemm(&self, buffers: &CaseBuffers) -> GemmParams {
        GemmParams::new(self.dtype, self.shape, buffers.a, buffers.b, buffers.c)
    }

    pub fn bias(&self, buffers: &CaseBuffers) -> GemmAndBiasParams {
        let bias = buffers.bias.unwrap_or(DevicePtr::new(0));
        GemmAndBiasParams::new(self.dtype, self.shape, buffers.a, buffers.b, buffers.c, bias)
            .with_activation(self.activation)
    }

    pub fn batched(&self, buffers: &CaseBuffers) -> GemmStridedBatchedParams {
        GemmStridedBatchedParams::new(
            self.dtype,
            self.shape,
            StridedBatch::dense(&self.shape, self.batch),
            buffers.a,
            buffers.b,
            buffers.c,
        )
    }

    pub fn scaled(&self, buffers: &CaseBuffers) -> ScaledGemmParams {
        let params = ScaledGemmParams::new(
            self.shape,
            SCALED_INPUT_DTYPE,
            SCALED_INPUT_DTYPE,
            self.dtype,
            buffers.a,
            buffers.b,
            buffers.c,
        );
        match buffers.scales {
            Some([a_scale, b_scale]) => {
                params.with_scales(ScaleTensor::float(a_scale), ScaleTensor::float(b_scale))
            }
            None => params,
        }
    }

    fn operand_bytes(&self, operand: Operand) -> usize {
        match self.variant {
            Variant::Batched => self.batched(&CaseBuffers::placeholder()).buffer_size(operand),
            Variant::Scaled => self.scaled(&CaseBuffers::placeholder()).buffer_size(operand),
            Variant::Gemm | Variant::Bias => self.gemm(&CaseBuffers::placeholder()).buffer_size(operand),
        }
    }

    fn operand_dtype(&self, operand: Operand) -> ScalarType {
        match (self.variant, operand) {
            (Variant::Scaled, Operand::A | Operand::B) => SCALED_INPUT_DTYPE,
            _ => self.dtype,
        }
    }
}

fn describe<P: OpParams>(params: &P) -> CaseSignature {
    CaseSignature {
        op_name: params.op_name(),
        signature: params.signature(),
        blas_signature: params.blas_signature(),
    }
}

#[derive(Debug)]
pub struct CaseBuffers {
    pub a: DevicePtr,
    pub b: DevicePtr,
    pub c: DevicePtr,
    pub bias: Option<DevicePtr>,
    pub scales: Option<[DevicePtr; 2]>,
    owned: Vec<DevicePtr>,
}

impl CaseBuffers {
    fn placeholder() -> Self {
        Self {
            a: DevicePtr::new(0),
            b: DevicePtr::new(0),
            c: DevicePtr::new(0),
            bias: None,
            scales: None,
            owned: Vec::new(),
        }
    }

    /// Allocate and fill every buffer `case` reads or writes.
    pub fn upload(executor: &HostExecutor, case: &TuneCase) -> Result<Self> {
        let mut uploaded = Vec::new();
        let result = Self::upload_into(executor, case, &mut uploaded);
        if result.is_err() {
            for ptr in uploaded {
                if let Err(err) = executor.device().free(ptr) {
                    warn!(ptr = %ptr, error = %err, "failed to free case buffer");
                }
            }
        }
        result
    }

    fn upload_into(
        executor: &HostExecutor,
        case: &TuneCase,
        uploaded: &mut Vec<DevicePtr>,
    ) -> Result<Self> {
        let mut put = |dtype: ScalarType, values: Vec<f64>| -> Result<DevicePtr> {
            let ptr = executor.upload(dtype, &values)?;
            uploaded.push(ptr);
            Ok(ptr)
        };

        let mut operands = [DevicePtr::new(0); 3];
        for (slot, operand) in [Operand::A, Operand::B, Operand::C].into_iter().enumerate() {
            let dtype = case.operand_dtype(operand);
            let count = case.operand_bytes(operand) / dtype.element_size();
            let values = if operand == Operand::C {
                vec![0.0; count]
            } else {
                deterministic_values(count, slot)
            };
            operands[slot] = put(dtype, values)?;
        }
        let bias = match case.variant {
            Variant::Bias => Some(put(case.dtype, deterministic_values(case.shape.m, 3))?),
            _ => None,
        };
        let scales = match case.variant {
            Variant::Scaled => Some([
                put(ScalarType::Float, vec![0.5])?,
                put(ScalarType::Float, vec![2.0])?,
            ]),
            _ => None,
        };

        let [a, b, c] = operands;
        Ok(Self {
            a,
            b,
            c,
            bias,
            scales,
            owned: uploaded.clone(),
        })
    }

    /// Free every buffer; the first failure is returned after all frees ran.
    pub fn free(self, executor: &HostExecutor) -> Result<()> {
        let mut first = None;
        for ptr in self.owned {
            if let Err(err) = executor.device().free(ptr) {
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

/// Small positive values with a fixed pattern, exactly representable in
/// every supported real type.
pub fn deterministic_values(count: usize, seed: usize) -> Vec<f64> {
    (0..count)
        .map(|index| {
            let mixed = (index * 1313) ^ (seed * 7331);
            1.0 + (mixed % 9) as f64 / 8.0
        })
        .collect()
}

pub fn smoke_cases() -> Vec<TuneCase> {
    vec![
        TuneCase::new(
            "gemm_nn_square",
            Variant::Gemm,
            ScalarType::Float,
            GemmShape::new(BlasOp::N, BlasOp::N, 64, 64, 64),
        ),
        TuneCase::new(
            "gemm_nt_half",
            Variant::Gemm,
            ScalarType::Half,
            GemmShape::new(BlasOp::N, BlasOp::T, 48, 32, 64),
        ),
        TuneCase::new(
            "bias_gelu",
            Variant::Bias,
            ScalarType::Float,
            GemmShape::new(BlasOp::T, BlasOp::N, 32, 48, 16),
        )
        .with_activation(Activation::Gelu),
        TuneCase::new(
            "batched_tn",
            Variant::Batched,
            ScalarType::Float,
            GemmShape::new(BlasOp::T, BlasOp::N, 16, 16, 32),
        )
        .with_batch(4),
        TuneCase::new(
            "scaled_fp8",
            Variant::Scaled,
            ScalarType::BFloat16,
            GemmShape::new(BlasOp::N, BlasOp::T, 32, 16, 64),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemmtune_backend_cpu::HostExecutorOptions;

    #[test]
    fn describe_matches_the_params() {
        let case = TuneCase::new(
            "nt",
            Variant::Gemm,
            ScalarType::Float,
            GemmShape::new(BlasOp::N, BlasOp::T, 128, 256, 64),
        );
        let described = case.describe();
        assert_eq!(described.op_name, "GemmTunableOp_float_NT");
        assert_eq!(described.signature, "NT_128_256_64_ld_128_256_128");
        assert!(described.blas_signature.starts_with("-m 128 -n 256 -k 64"));

        let batched = TuneCase::new(
            "b",
            Variant::Batched,
            ScalarType::Half,
            GemmShape::new(BlasOp::N, BlasOp::N, 8, 8, 8),
        )
        .with_batch(3);
        assert_eq!(batched.describe().signature, "NN_8_8_8_B_3_ld_8_8_8");
    }

    #[test]
    fn values_are_exact_in_low_precision() {
        for value in deterministic_values(64, 2) {
            for dtype in [ScalarType::Half, ScalarType::BFloat16, SCALED_INPUT_DTYPE] {
                assert_eq!(dtype.decode(&dtype.encode(&[value])), vec![value]);
            }
        }
    }

    #[test]
    fn buffers_cover_every_operand_and_free_cleanly() {
        let executor = HostExecutor::with_options(HostExecutorOptions::default()).unwrap();
        for case in smoke_cases() {
            let buffers = CaseBuffers::upload(&executor, &case).unwrap();
            assert_eq!(buffers.bias.is_some(), case.variant == Variant::Bias);
            assert_eq!(buffers.scales.is_some(), case.variant == Variant::Scaled);
            buffers.free(&executor).unwrap();
        }
        assert_eq!(executor.device().stats().live_bytes, 0);
    }
}
