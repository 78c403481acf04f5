//! Candidate selection for host execution.

use crate::candidates::{batched_candidates, bias_candidates, gemm_candidates, scaled_candidates};
use anyhow::Result;
use gemmtune_autotune::{
    CandidateRegistry, Execution, ResultsCache, TuningDriver, TuningOptions, TuningOutcome,
};
use gemmtune_device::HostDevice;
use gemmtune_params::{GemmAndBiasParams, GemmParams, GemmStridedBatchedParams, ScaledGemmParams};

/// Candidate registries for every GEMM variant sharing one tuning driver
/// and results cache.
pub struct HostPlanner {
    gemm: CandidateRegistry<GemmParams, HostDevice>,
    bias: CandidateRegistry<GemmAndBiasParams, HostDevice>,
    batched: CandidateRegistry<GemmStridedBatchedParams, HostDevice>,
    scaled: CandidateRegistry<ScaledGemmParams, HostDevice>,
    driver: TuningDriver,
}

impl HostPlanner {
    pub fn new(driver: TuningDriver) -> Self {
        Self {
            gemm: gemm_candidates(),
            bias: bias_candidates(),
            batched: batched_candidates(),
            scaled: scaled_candidates(),
            driver,
        }
    }

    /// Planner whose cache is loaded from `options.results_file`.
    pub fn for_device(options: TuningOptions, device: &HostDevice) -> Result<Self> {
        Ok(Self::new(TuningDriver::for_device(options, device)?))
    }

    pub fn with_cache(options: TuningOptions, cache: ResultsCache) -> Self {
        Self::new(TuningDriver::new(options, cache))
    }

    pub fn gemm(&mut self, params: &GemmParams, device: &HostDevice) -> Result<Execution> {
        self.driver.execute(&self.gemm, params, device)
    }

    pub fn gemm_and_bias(
        &mut self,
        params: &GemmAndBiasParams,
        device: &HostDevice,
    ) -> Result<Execution> {
        self.driver.execute(&self.bias, params, device)
    }

    pub fn gemm_strided_batched(
        &mut self,
        params: &GemmStridedBatchedParams,
        device: &HostDevice,
    ) -> Result<Execution> {
        self.driver.execute(&self.batched, params, device)
    }

    pub fn scaled_gemm(&mut self, params: &ScaledGemmParams, device: &HostDevice) -> Result<Execution> {
        self.driver.execute(&self.scaled, params, device)
    }

    /// Benchmark without touching the cache or running on caller buffers.
    pub fn tune_gemm(&self, params: &GemmParams, device: &HostDevice) -> Result<TuningOutcome> {
        self.driver.tune(&self.gemm, params, device)
    }

    pub fn tune_gemm_and_bias(
        &self,
        params: &GemmAndBiasParams,
        device: &HostDevice,
    ) -> Result<TuningOutcome> {
        self.driver.tune(&self.bias, params, device)
    }

    pub fn tune_gemm_strided_batched(
        &self,
        params: &GemmStridedBatchedParams,
        device: &HostDevice,
    ) -> Result<TuningOutcome> {
        self.driver.tune(&self.batched, params, device)
    }

    pub fn tune_scaled_gemm(
        &self,
        params: &ScaledGemmParams,
        device: &HostDevice,
    ) -> Result<TuningOutcome> {
        self.driver.tune(&self.scaled, params, device)
    }

    pub fn persist_cache(&self) -> Result<()> {
        self.driver.persist()
    }

    pub fn driver(&self) -> &TuningDriver {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut TuningDriver {
        &mut self.driver
    }

    pub fn gemm_registry_mut(&mut self) -> &mut CandidateRegistry<GemmParams, HostDevice> {
        &mut self.gemm
    }

    pub fn bias_registry_mut(&mut self) -> &mut CandidateRegistry<GemmAndBiasParams, HostDevice> {
        &mut self.bias
    }

    pub fn batched_registry_mut(
        &mut self,
    ) -> &mut CandidateRegistry<GemmStridedBatchedParams, HostDevice> {
        &mut self.batched
    }

    pub fn scaled_registry_mut(&mut self) -> &mut CandidateRegistry<ScaledGemmParams, HostDevice> {
        &mut self.scaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemmtune_autotune::Selection;
    use gemmtune_device::{DeviceAllocator, DeviceMemory, ScalarType};
    use gemmtune_params::{BlasOp, GemmShape, OpParams};

    fn options() -> TuningOptions {
        TuningOptions {
            max_tuning_iterations: 2,
            max_tuning_duration_ms: 0,
            ..TuningOptions::default()
        }
    }

    fn upload(device: &HostDevice, values: &[f64]) -> gemmtune_device::DevicePtr {
        let bytes = ScalarType::Float.encode(values);
        let ptr = device.allocate(bytes.len()).unwrap();
        device.write(ptr, &bytes).unwrap();
        ptr
    }

    #[test]
    fn first_call_tunes_and_second_hits_the_cache() {
        let device = HostDevice::new();
        let shape = GemmShape::new(BlasOp::N, BlasOp::T, 6, 5, 4);
        let a = upload(&device, &[0.25; 24]);
        let b = upload(&device, &[2.0; 20]);
        let c = upload(&device, &[0.0; 30]);
        let params = GemmParams::new(ScalarType::Float, shape, a, b, c);

        let mut planner = HostPlanner::with_cache(options(), ResultsCache::new());
        let first = planner.gemm(&params, &device).unwrap();
        assert_eq!(first.selection, Selection::Tuned);
        let second = planner.gemm(&params, &device).unwrap();
        assert_eq!(second.selection, Selection::Cached);
        assert_eq!(second.candidate, first.candidate);
        assert_eq!(planner.driver().cache().len(), 1);

        device.synchronize_all().unwrap();
        let out = ScalarType::Float.decode(&device.read(c, 30 * 4).unwrap());
        assert!(out.iter().all(|&value| value == 2.0));
    }

    #[test]
    fn tuning_reports_every_host_kernel() {
        let device = HostDevice::new();
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 8, 8, 8);
        let a = upload(&device, &[1.0; 64]);
        let b = upload(&device, &[1.0; 64]);
        let c = upload(&device, &[0.0; 64]);
        let params = GemmParams::new(ScalarType::Float, shape, a, b, c);
        let planner = HostPlanner::with_cache(options(), ResultsCache::new());

        let outcome = planner.tune_gemm(&params, &device).unwrap();
        let names: Vec<_> = outcome.reports.iter().map(|r| r.candidate.as_str()).collect();
        assert_eq!(names, ["reference", "ndarray", "parallel"]);
        assert!(outcome.reports.iter().all(|r| r.is_accepted()));
        assert_eq!(outcome.op_name, params.op_name());
        // tuning alone never records a decision
        assert!(planner.driver().cache().is_empty());
    }

    #[test]
    fn scaled_tuning_leaves_the_callers_amax_alone() {
        let device = HostDevice::new();
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 2, 2, 2);
        let fp8 = ScalarType::Float8E4M3Fn;
        let upload_as = |dtype: ScalarType, values: &[f64]| {
            let bytes = dtype.encode(values);
            let ptr = device.allocate(bytes.len()).unwrap();
            device.write(ptr, &bytes).unwrap();
            ptr
        };
        let a = upload_as(fp8, &[1.0, 2.0, 3.0, 4.0]);
        let b = upload_as(fp8, &[1.0, 0.0, 0.0, 1.0]);
        let c = upload(&device, &[0.0; 4]);
        let amax = upload(&device, &[-123.0]);
        let params =
            ScaledGemmParams::new(shape, fp8, fp8, ScalarType::Float, a, b, c).with_amax(amax);
        let read = |ptr: gemmtune_device::DevicePtr, count: usize| {
            device.synchronize_all().unwrap();
            ScalarType::Float.decode(&device.read(ptr, count * 4).unwrap())
        };

        let mut planner = HostPlanner::with_cache(options(), ResultsCache::new());
        let live = device.stats().live_bytes;
        planner.tune_scaled_gemm(&params, &device).unwrap();
        assert_eq!(read(amax, 1), [-123.0]);
        assert_eq!(read(c, 4), [0.0; 4]);
        assert_eq!(device.stats().live_bytes, live);

        planner.scaled_gemm(&params, &device).unwrap();
        assert_eq!(read(c, 4), [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(read(amax, 1), [4.0]);
    }
}
