//! Host runtime entrypoints.

use crate::planner::HostPlanner;
use anyhow::{ensure, Result};
use gemmtune_autotune::{Execution, TuningOptions};
use gemmtune_device::{DeviceAllocator, DeviceMemory, DevicePtr, HostDevice, ScalarType};
use gemmtune_params::{GemmParams, GemmShape, Operand, Scalar};
use std::fs;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct HostExecutorOptions {
    pub tuning: TuningOptions,
    /// Delete `tuning.results_file` before loading it.
    pub clear_cache: bool,
}

/// Output of a GEMM run on host slices.
#[derive(Debug, Clone)]
pub struct GemmRun {
    pub output: Vec<f64>,
    pub execution: Execution,
}

/// A [`HostDevice`] with a tuning planner in front of it.
pub struct HostExecutor {
    device: HostDevice,
    planner: HostPlanner,
}

impl HostExecutor {
    pub fn new(device: HostDevice, planner: HostPlanner) -> Self {
        Self { device, planner }
    }

    pub fn with_options(options: HostExecutorOptions) -> Result<Self> {
        if let Some(path) = &options.tuning.results_file {
            if options.clear_cache && path.exists() {
                fs::remove_file(path)?;
            }
        }
        let device = HostDevice::new();
        let planner = HostPlanner::for_device(options.tuning, &device)?;
        Ok(Self::new(device, planner))
    }

    pub fn device(&self) -> &HostDevice {
        &self.device
    }

    pub fn planner(&self) -> &HostPlanner {
        &self.planner
    }

    pub fn planner_mut(&mut self) -> &mut HostPlanner {
        &mut self.planner
    }

    /// Copy `values` into a new device buffer of `dtype` elements.
    pub fn upload(&self, dtype: ScalarType, values: &[f64]) -> Result<DevicePtr> {
        let bytes = dtype.encode(values);
        let ptr = self.device.allocate(bytes.len())?;
        self.device.write(ptr, &bytes)?;
        Ok(ptr)
    }

    /// Wait for outstanding work and read `count` elements back.
    pub fn download(&self, dtype: ScalarType, ptr: DevicePtr, count: usize) -> Result<Vec<f64>> {
        self.device.synchronize_all()?;
        let bytes = self.device.read(ptr, count * dtype.element_size())?;
        Ok(dtype.decode(&bytes))
    }

    /// `C = alpha * op(A) * op(B) + beta * C` on column-major host slices,
    /// through the tuned candidate for this shape.
    pub fn run_gemm(
        &mut self,
        dtype: ScalarType,
        shape: GemmShape,
        alpha: f64,
        beta: f64,
        inputs: (&[f64], &[f64], &[f64]),
    ) -> Result<GemmRun> {
        let (a, b, c) = inputs;
        for (operand, data) in [(Operand::A, a), (Operand::B, b), (Operand::C, c)] {
            ensure!(
                data.len() >= shape.elements(operand),
                "operand {operand} has {} elements, {} needs {}",
                data.len(),
                shape.signature(),
                shape.elements(operand)
            );
        }

        let ptrs = [self.upload(dtype, a)?, self.upload(dtype, b)?, self.upload(dtype, c)?];
        let result = self.run_uploaded(dtype, shape, alpha, beta, ptrs, c.len());
        for ptr in ptrs {
            self.device.free(ptr)?;
        }
        result
    }

    fn run_uploaded(
        &mut self,
        dtype: ScalarType,
        shape: GemmShape,
        alpha: f64,
        beta: f64,
        [a, b, c]: [DevicePtr; 3],
        c_len: usize,
    ) -> Result<GemmRun> {
        let params = GemmParams::new(dtype, shape, a, b, c)
            .with_scalars(Scalar::from(alpha), Scalar::from(beta));
        let execution = self.planner.gemm(&params, &self.device)?;
        info!(
            candidate = %execution.candidate,
            selection = ?execution.selection,
            m = shape.m,
            n = shape.n,
            k = shape.k,
            "executed gemm"
        );
        let output = self.download(dtype, c, c_len)?;
        Ok(GemmRun { output, execution })
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.planner.persist_cache()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use gemmtune_autotune::Selection;
    use gemmtune_params::BlasOp;
    use tempfile::tempdir;

    fn quick() -> TuningOptions {
        TuningOptions {
            max_tuning_iterations: 2,
            max_tuning_duration_ms: 0,
            ..TuningOptions::default()
        }
    }

    #[test]
    fn run_gemm_matches_hand_computed_product() {
        let mut executor = HostExecutor::with_options(HostExecutorOptions {
            tuning: quick(),
            clear_cache: false,
        })
        .unwrap();
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 2, 2, 2);
        let run = executor
            .run_gemm(
                ScalarType::Double,
                shape,
                2.0,
                1.0,
                (&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0], &[1.0; 4]),
            )
            .unwrap();
        for (got, want) in run.output.iter().zip([47.0, 69.0, 63.0, 93.0]) {
            assert_relative_eq!(*got, want, epsilon = 1e-5);
        }
        assert_eq!(run.execution.selection, Selection::Tuned);
        assert_eq!(executor.device().stats().live_bytes, 0);
    }

    #[test]
    fn shutdown_persists_and_reload_hits_the_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        let options = || HostExecutorOptions {
            tuning: TuningOptions {
                results_file: Some(path.clone()),
                ..quick()
            },
            clear_cache: false,
        };
        let shape = GemmShape::new(BlasOp::T, BlasOp::N, 3, 3, 3);
        let inputs = ([1.0; 9], [1.0; 9], [0.0; 9]);

        let mut first = HostExecutor::with_options(options()).unwrap();
        first
            .run_gemm(ScalarType::Float, shape, 1.0, 0.0, (&inputs.0, &inputs.1, &inputs.2))
            .unwrap();
        first.shutdown().unwrap();
        assert!(path.exists());

        let mut second = HostExecutor::with_options(options()).unwrap();
        let run = second
            .run_gemm(ScalarType::Float, shape, 1.0, 0.0, (&inputs.0, &inputs.1, &inputs.2))
            .unwrap();
        assert_eq!(run.execution.selection, Selection::Cached);
        assert_eq!(run.output, vec![3.0; 9]);

        let cleared = HostExecutor::with_options(HostExecutorOptions {
            clear_cache: true,
            ..options()
        })
        .unwrap();
        assert!(cleared.planner().driver().cache().is_empty());
    }

    #[test]
    fn short_inputs_are_rejected_before_upload() {
        let mut executor = HostExecutor::with_options(HostExecutorOptions::default()).unwrap();
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 4, 4, 4);
        let err = executor
            .run_gemm(ScalarType::Float, shape, 1.0, 0.0, (&[0.0; 15], &[0.0; 16], &[0.0; 16]))
            .unwrap_err();
        assert!(err.to_string().contains("operand a"));
        assert_eq!(executor.device().stats().allocations, 0);
    }
}
