//! Host candidates for every GEMM variant.
//!
//! Each run decodes the operands from the device buffers, computes in `f64`
//! (or `f32` for the parallel kernel), and encodes the result back into C.
//! All of it happens inside an operation queued on the device's current
//! stream, so it is ordered after the isolation copy and completes on
//! synchronize.

use crate::kernels::{apply_bias_activation, layout_is_valid, GemmProblem, HostKernel};
use anyhow::{ensure, Result};
use gemmtune_autotune::{Candidate, CandidateRegistry};
use gemmtune_device::{
    DeviceAllocator, DeviceError, DevicePtr, HostDevice, HostMemory, ScalarType,
};
use gemmtune_params::{
    Activation, GemmAndBiasParams, GemmParams, GemmShape, GemmStridedBatchedParams, OpParams,
    Operand, Scalar, ScaledGemmParams, StridedBatch,
};

fn backend_error(err: anyhow::Error) -> DeviceError {
    DeviceError::Backend(format!("{err:#}"))
}

fn real_scalar(value: Scalar) -> Result<f64> {
    ensure!(value.im() == 0.0, "complex scalar {value} on a real kernel");
    Ok(value.re())
}

/// Everything a queued GEMM needs once the stream reaches it.
struct GemmJob {
    kernel: HostKernel,
    dtype: ScalarType,
    problem: GemmProblem,
    a: DevicePtr,
    b: DevicePtr,
    c: DevicePtr,
    sizes: [usize; 3],
    batch: Option<StridedBatch>,
    bias: Option<(DevicePtr, Activation)>,
}

impl GemmJob {
    fn execute(&self, memory: &mut HostMemory) -> Result<(), DeviceError> {
        let a = self.dtype.decode(memory.bytes(self.a, self.sizes[0])?);
        let b = self.dtype.decode(memory.bytes(self.b, self.sizes[1])?);
        let mut c = self.dtype.decode(memory.bytes(self.c, self.sizes[2])?);
        let bias = match self.bias {
            Some((ptr, _)) => {
                let bytes = self.problem.shape.m * self.dtype.element_size();
                Some(self.dtype.decode(memory.bytes(ptr, bytes)?))
            }
            None => None,
        };

        self.compute(&a, &b, &mut c, bias.as_deref())
            .map_err(backend_error)?;

        let encoded = self.dtype.encode(&c);
        memory
            .bytes_mut(self.c, encoded.len())?
            .copy_from_slice(&encoded);
        Ok(())
    }

    fn compute(&self, a: &[f64], b: &[f64], c: &mut [f64], bias: Option<&[f64]>) -> Result<()> {
        let shape = self.problem.shape;
        match self.batch {
            None => self.kernel.gemm(&self.problem, a, b, c)?,
            Some(batch) => {
                for index in 0..batch.batch {
                    let a = &a[(index * batch.stride_a).min(a.len())..];
                    let b = &b[(index * batch.stride_b).min(b.len())..];
                    let start = (index * batch.stride_c).min(c.len());
                    self.kernel.gemm(&self.problem, a, b, &mut c[start..])?;
                }
            }
        }
        if let Some((_, activation)) = self.bias {
            apply_bias_activation(c, shape.ldc, shape.m, shape.n, bias, activation)?;
        }
        Ok(())
    }
}

/// One [`HostKernel`] exposed as a candidate for GEMM, bias GEMM and
/// strided-batched GEMM.
#[derive(Debug, Clone, Copy)]
pub struct HostGemm {
    kernel: HostKernel,
}

impl HostGemm {
    pub fn new(kernel: HostKernel) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> HostKernel {
        self.kernel
    }

    fn supports_layout(dtype: ScalarType, shape: &GemmShape) -> bool {
        !dtype.is_complex() && layout_is_valid(shape)
    }

    fn launch(&self, device: &HostDevice, job: GemmJob) -> Result<()> {
        let stream = device.current_stream();
        device.launch(stream, Box::new(move |memory: &mut HostMemory| job.execute(memory)))?;
        Ok(())
    }
}

impl Candidate<GemmParams, HostDevice> for HostGemm {
    fn name(&self) -> &str {
        self.kernel.name()
    }

    fn supports(&self, params: &GemmParams) -> bool {
        Self::supports_layout(params.dtype, &params.shape)
    }

    fn run(&self, params: &GemmParams, device: &HostDevice) -> Result<()> {
        ensure!(
            Self::supports_layout(params.dtype, &params.shape),
            "{} does not support {}",
            self.kernel.name(),
            params.op_name()
        );
        let operands = params.operands();
        self.launch(
            device,
            GemmJob {
                kernel: self.kernel,
                dtype: params.dtype,
                problem: GemmProblem::new(
                    params.shape,
                    real_scalar(params.alpha)?,
                    real_scalar(params.beta)?,
                ),
                a: operands.a(),
                b: operands.b(),
                c: operands.c(),
                sizes: [Operand::A, Operand::B, Operand::C].map(|o| params.buffer_size(o)),
                batch: None,
                bias: None,
            },
        )
    }
}

impl Candidate<GemmAndBiasParams, HostDevice> for HostGemm {
    fn name(&self) -> &str {
        self.kernel.name()
    }

    fn supports(&self, params: &GemmAndBiasParams) -> bool {
        Self::supports_layout(params.dtype, &params.shape)
    }

    fn run(&self, params: &GemmAndBiasParams, device: &HostDevice) -> Result<()> {
        ensure!(
            Self::supports_layout(params.dtype, &params.shape),
            "{} does not support {}",
            self.kernel.name(),
            params.op_name()
        );
        let operands = params.operands();
        self.launch(
            device,
            GemmJob {
                kernel: self.kernel,
                dtype: params.dtype,
                problem: GemmProblem::new(params.shape, real_scalar(params.alpha)?, 0.0),
                a: operands.a(),
                b: operands.b(),
                c: operands.c(),
                sizes: [Operand::A, Operand::B, Operand::C].map(|o| params.buffer_size(o)),
                batch: None,
                bias: Some((params.bias, params.activation)),
            },
        )
    }
}

impl Candidate<GemmStridedBatchedParams, HostDevice> for HostGemm {
    fn name(&self) -> &str {
        self.kernel.name()
    }

    fn supports(&self, params: &GemmStridedBatchedParams) -> bool {
        Self::supports_layout(params.dtype, &params.shape)
    }

    fn run(&self, params: &GemmStridedBatchedParams, device: &HostDevice) -> Result<()> {
        ensure!(
            Self::supports_layout(params.dtype, &params.shape),
            "{} does not support {}",
            self.kernel.name(),
            params.op_name()
        );
        let operands = params.operands();
        self.launch(
            device,
            GemmJob {
                kernel: self.kernel,
                dtype: params.dtype,
                problem: GemmProblem::new(
                    params.shape,
                    real_scalar(params.alpha)?,
                    real_scalar(params.beta)?,
                ),
                a: operands.a(),
                b: operands.b(),
                c: operands.c(),
                sizes: [Operand::A, Operand::B, Operand::C].map(|o| params.buffer_size(o)),
                batch: Some(params.batch),
                bias: None,
            },
        )
    }
}

/// Scaled low-precision GEMM computed in f64.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostScaledGemm;

struct ScaledJob {
    shape: GemmShape,
    dtypes: [ScalarType; 3],
    operands: [DevicePtr; 3],
    sizes: [usize; 3],
    scales: Option<[(DevicePtr, ScalarType, usize); 2]>,
    c_scale: Option<DevicePtr>,
    bias: Option<(DevicePtr, ScalarType)>,
    amax: Option<DevicePtr>,
}

impl ScaledJob {
    fn execute(&self, memory: &mut HostMemory) -> Result<(), DeviceError> {
        let [a_dtype, b_dtype, c_dtype] = self.dtypes;
        let a = a_dtype.decode(memory.bytes(self.operands[0], self.sizes[0])?);
        let b = b_dtype.decode(memory.bytes(self.operands[1], self.sizes[1])?);
        let (a_scale, b_scale) = match self.scales {
            Some([(a_ptr, a_ty, a_len), (b_ptr, b_ty, b_len)]) => (
                a_ty.decode(memory.bytes(a_ptr, a_len * a_ty.element_size())?),
                b_ty.decode(memory.bytes(b_ptr, b_len * b_ty.element_size())?),
            ),
            None => (vec![1.0], vec![1.0]),
        };
        let bias = match self.bias {
            Some((ptr, dtype)) => Some(dtype.decode(memory.bytes(ptr, self.shape.m * dtype.element_size())?)),
            None => None,
        };
        let c_scale = match self.c_scale {
            Some(ptr) => ScalarType::Float.decode(memory.bytes(ptr, 4)?)[0],
            None => 1.0,
        };

        let mut c = c_dtype.decode(memory.bytes(self.operands[2], self.sizes[2])?);
        let problem = GemmProblem::new(self.shape, 1.0, 0.0);
        let scaled_a = scale_rows(&problem, Operand::A, &a, &a_scale);
        let scaled_b = scale_rows(&problem, Operand::B, &b, &b_scale);
        HostKernel::Reference
            .gemm(&problem, &scaled_a, &scaled_b, &mut c)
            .map_err(backend_error)?;
        apply_bias_activation(
            &mut c,
            self.shape.ldc,
            self.shape.m,
            self.shape.n,
            bias.as_deref(),
            Activation::None,
        )
        .map_err(backend_error)?;

        let mut amax = 0.0f64;
        for j in 0..self.shape.n {
            for value in &mut c[j * self.shape.ldc..j * self.shape.ldc + self.shape.m] {
                amax = amax.max(value.abs());
                *value *= c_scale;
            }
        }

        let encoded = c_dtype.encode(&c);
        memory
            .bytes_mut(self.operands[2], encoded.len())?
            .copy_from_slice(&encoded);
        if let Some(ptr) = self.amax {
            memory
                .bytes_mut(ptr, 4)?
                .copy_from_slice(&ScalarType::Float.encode(&[amax]));
        }
        Ok(())
    }
}

/// Multiply `op(A)` row `i` by `scale[i]` (or `op(B)` column `j` by
/// `scale[j]`); a single scale applies to the whole operand.
fn scale_rows(problem: &GemmProblem, operand: Operand, data: &[f64], scale: &[f64]) -> Vec<f64> {
    let shape = problem.shape;
    let ld = shape.leading_dim(operand);
    let transposed = match operand {
        Operand::A => shape.transa.is_transposed(),
        _ => shape.transb.is_transposed(),
    };
    let mut scaled = data.to_vec();
    for col in 0..shape.stored_cols(operand) {
        for row in 0..shape.stored_rows(operand) {
            // index into op(X): A keeps rows (m), B keeps columns (n)
            let logical = match (operand, transposed) {
                (Operand::A, false) | (Operand::B, true) => row,
                _ => col,
            };
            let factor = if scale.len() == 1 { scale[0] } else { scale[logical] };
            scaled[row + col * ld] *= factor;
        }
    }
    scaled
}

impl Candidate<ScaledGemmParams, HostDevice> for HostScaledGemm {
    fn name(&self) -> &str {
        "reference"
    }

    fn supports(&self, params: &ScaledGemmParams) -> bool {
        let real = [params.a_dtype, params.b_dtype, params.c_dtype, params.bias_dtype]
            .iter()
            .all(|dtype| !dtype.is_complex());
        real && layout_is_valid(&params.shape)
    }

    fn run(&self, params: &ScaledGemmParams, device: &HostDevice) -> Result<()> {
        ensure!(
            self.supports(params),
            "scaled reference does not support {}",
            params.op_name()
        );
        params.validate()?;
        let operands = params.operands();
        let scales = match (params.a_scale, params.b_scale) {
            (Some(a), Some(b)) => Some([
                (a.ptr, a.dtype, params.scale_len(Operand::A)),
                (b.ptr, b.dtype, params.scale_len(Operand::B)),
            ]),
            (None, None) => None,
            _ => anyhow::bail!("scaled GEMM needs both or neither input scale"),
        };
        let job = ScaledJob {
            shape: params.shape,
            dtypes: [params.a_dtype, params.b_dtype, params.c_dtype],
            operands: [operands.a(), operands.b(), operands.c()],
            sizes: [Operand::A, Operand::B, Operand::C].map(|o| params.buffer_size(o)),
            scales,
            c_scale: params.c_scale,
            bias: params.bias.map(|ptr| (ptr, params.bias_dtype)),
            amax: params.amax,
        };
        device.launch(device.current_stream(), Box::new(move |memory: &mut HostMemory| job.execute(memory)))?;
        Ok(())
    }
}

/// Reference first, so it serves as default and numerical baseline.
pub fn gemm_candidates() -> CandidateRegistry<GemmParams, HostDevice> {
    let mut registry = CandidateRegistry::new();
    for kernel in HostKernel::ALL {
        registry.register(HostGemm::new(kernel));
    }
    registry
}

pub fn bias_candidates() -> CandidateRegistry<GemmAndBiasParams, HostDevice> {
    let mut registry = CandidateRegistry::new();
    for kernel in HostKernel::ALL {
        registry.register(HostGemm::new(kernel));
    }
    registry
}

pub fn batched_candidates() -> CandidateRegistry<GemmStridedBatchedParams, HostDevice> {
    let mut registry = CandidateRegistry::new();
    for kernel in HostKernel::ALL {
        registry.register(HostGemm::new(kernel));
    }
    registry
}

pub fn scaled_candidates() -> CandidateRegistry<ScaledGemmParams, HostDevice> {
    let mut registry = CandidateRegistry::new();
    registry.register(HostScaledGemm);
    registry
}
