//! GPU candidate selection.

use crate::kernels::wgsl_gemm_candidates;
use crate::runtime::WgpuDevice;
use anyhow::Result;
use gemmtune_autotune::{CandidateRegistry, Execution, TuningDriver, TuningOptions, TuningOutcome};
use gemmtune_params::GemmParams;

/// Single-precision GEMM tuning over the WGSL candidates.
pub struct GpuPlanner {
    registry: CandidateRegistry<GemmParams, WgpuDevice>,
    driver: TuningDriver,
}

impl GpuPlanner {
    pub fn new(driver: TuningDriver) -> Self {
        Self {
            registry: wgsl_gemm_candidates(),
            driver,
        }
    }

    pub fn for_device(options: TuningOptions, device: &WgpuDevice) -> Result<Self> {
        Ok(Self::new(TuningDriver::for_device(options, device)?))
    }

    pub fn gemm(&mut self, params: &GemmParams, device: &WgpuDevice) -> Result<Execution> {
        self.driver.execute(&self.registry, params, device)
    }

    pub fn tune_gemm(&self, params: &GemmParams, device: &WgpuDevice) -> Result<TuningOutcome> {
        self.driver.tune(&self.registry, params, device)
    }

    pub fn persist_cache(&self) -> Result<()> {
        self.driver.persist()
    }

    pub fn registry(&self) -> &CandidateRegistry<GemmParams, WgpuDevice> {
        &self.registry
    }

    pub fn driver(&self) -> &TuningDriver {
        &self.driver
    }
}
