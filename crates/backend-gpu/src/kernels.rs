//! WGSL GEMM candidates over [`WgpuDevice`] buffers.

use crate::runtime::WgpuDevice;
use anyhow::{bail, ensure, Result};
use bytemuck::{cast_slice, Pod, Zeroable};
use gemmtune_autotune::{Candidate, CandidateRegistry};
use gemmtune_device::{DevicePtr, ScalarType};
use gemmtune_params::{GemmParams, OpParams, Operand};
use std::sync::Arc;
use tracing::trace;
use wgpu::util::DeviceExt;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ShaderParams {
    m: u32,
    n: u32,
    k: u32,
    lda: u32,
    ldb: u32,
    ldc: u32,
    trans_a: u32,
    trans_b: u32,
    offset_a: u32,
    offset_b: u32,
    offset_c: u32,
    _pad0: u32,
    alpha: f32,
    beta: f32,
    _pad1: [f32; 2],
}

/// Column-major f32 GEMM, one invocation per output element, with the
/// reduction walked in `tile_k` chunks.
#[derive(Debug, Clone)]
pub struct WgslGemm {
    name: String,
    workgroup_m: u32,
    workgroup_n: u32,
    tile_k: u32,
}

impl WgslGemm {
    pub fn new(workgroup_m: u32, workgroup_n: u32, tile_k: u32) -> Self {
        let workgroup_m = workgroup_m.clamp(1, 16);
        let workgroup_n = workgroup_n.clamp(1, 16);
        let tile_k = tile_k.max(1);
        Self {
            name: format!("wgsl_{workgroup_m}x{workgroup_n}_k{tile_k}"),
            workgroup_m,
            workgroup_n,
            tile_k,
        }
    }

    pub fn shader_source(&self) -> String {
        gemm_shader_source(self.workgroup_m, self.workgroup_n, self.tile_k)
    }

    fn operand(
        &self,
        device: &WgpuDevice,
        ptr: DevicePtr,
        bytes: usize,
    ) -> Result<(Arc<wgpu::Buffer>, u32)> {
        let (buffer, offset) = device.buffer_at(ptr, bytes)?;
        ensure!(offset % 4 == 0, "{ptr} is not element aligned");
        Ok((buffer, u32::try_from(offset / 4)?))
    }
}

fn as_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow::anyhow!("{what} = {value} exceeds the shader's index range"))
}

impl Candidate<GemmParams, WgpuDevice> for WgslGemm {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, params: &GemmParams) -> bool {
        params.dtype == ScalarType::Float
            && params.alpha.im() == 0.0
            && params.beta.im() == 0.0
            && [Operand::A, Operand::B, Operand::C]
                .iter()
                .all(|&operand| params.buffer_size(operand) / 4 <= u32::MAX as usize)
    }

    fn run(&self, params: &GemmParams, device: &WgpuDevice) -> Result<()> {
        if !self.supports(params) {
            bail!("{} does not support {}", self.name, params.op_name());
        }
        let shape = params.shape;
        let operands = params.operands();
        let (a, offset_a) = self.operand(device, operands.a(), params.buffer_size(Operand::A))?;
        let (b, offset_b) = self.operand(device, operands.b(), params.buffer_size(Operand::B))?;
        let (c, offset_c) = self.operand(device, operands.c(), params.buffer_size(Operand::C))?;
        // read-only and read-write bindings of one buffer conflict in a dispatch
        ensure!(
            !Arc::ptr_eq(&a, &c) && !Arc::ptr_eq(&b, &c),
            "output buffer aliases an input of {}",
            params.signature()
        );
        if shape.m == 0 || shape.n == 0 {
            return Ok(());
        }

        let uniforms = ShaderParams {
            m: as_u32(shape.m, "m")?,
            n: as_u32(shape.n, "n")?,
            k: as_u32(shape.k, "k")?,
            lda: as_u32(shape.lda, "lda")?,
            ldb: as_u32(shape.ldb, "ldb")?,
            ldc: as_u32(shape.ldc, "ldc")?,
            trans_a: shape.transa.is_transposed() as u32,
            trans_b: shape.transb.is_transposed() as u32,
            offset_a,
            offset_b,
            offset_c,
            _pad0: 0,
            alpha: params.alpha.re() as f32,
            beta: params.beta.re() as f32,
            _pad1: [0.0; 2],
        };

        let gpu = device.wgpu_device();
        let cached = device.pipeline(&self.name, || self.shader_source());
        let params_buffer = gpu.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("gemm params"),
            contents: cast_slice(&[uniforms]),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = gpu.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("gemm bind group"),
            layout: &cached.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: a.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: b.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: c.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let groups_x = uniforms.m.div_ceil(self.workgroup_m);
        let groups_y = uniforms.n.div_ceil(self.workgroup_n);
        let mut encoder = gpu.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("gemm encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("gemm pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&cached.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        device.queue().submit(Some(encoder.finish()));
        trace!(kernel = %self.name, groups_x, groups_y, "gemm dispatched");
        Ok(())
    }
}

fn gemm_shader_source(workgroup_m: u32, workgroup_n: u32, tile_k: u32) -> String {
    format!(
        r#"
struct Params {{
  size_m: u32,
  size_n: u32,
  size_k: u32,
  lda: u32,
  ldb: u32,
  ldc: u32,
  trans_a: u32,
  trans_b: u32,
  offset_a: u32,
  offset_b: u32,
  offset_c: u32,
  _pad0: u32,
  alpha: f32,
  beta: f32,
  _pad1: vec2<f32>,
}}

@group(0) @binding(0)
var<storage, read> lhs: array<f32>;

@group(0) @binding(1)
var<storage, read> rhs: array<f32>;

@group(0) @binding(2)
var<storage, read_write> output: array<f32>;

@group(0) @binding(3)
var<uniform> params: Params;

fn lhs_at(i: u32, p: u32) -> f32 {{
  if (params.trans_a == 0u) {{
    return lhs[params.offset_a + i + p * params.lda];
  }}
  return lhs[params.offset_a + p + i * params.lda];
}}

fn rhs_at(p: u32, j: u32) -> f32 {{
  if (params.trans_b == 0u) {{
    return rhs[params.offset_b + p + j * params.ldb];
  }}
  return rhs[params.offset_b + j + p * params.ldb];
}}

@compute @workgroup_size({wg_m}, {wg_n}, 1)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
  let i = gid.x;
  let j = gid.y;
  if (i >= params.size_m || j >= params.size_n) {{
    return;
  }}

  var acc: f32 = 0.0;
  var k_outer: u32 = 0u;
  loop {{
    if (k_outer >= params.size_k) {{
        break;
    }}
    let k_limit = min(params.size_k, k_outer + {tile_k}u);
    var p: u32 = k_outer;
    loop {{
        if (p >= k_limit) {{
            break;
        }}
        acc = acc + lhs_at(i, p) * rhs_at(p, j);
        p = p + 1u;
    }}
    k_outer = k_outer + {tile_k}u;
  }}

  let index = params.offset_c + i + j * params.ldc;
  var result = params.alpha * acc;
  if (params.beta != 0.0) {{
    result = result + params.beta * output[index];
  }}
  output[index] = result;
}}
"#,
        wg_m = workgroup_m,
        wg_n = workgroup_n,
        tile_k = tile_k
    )
}

/// The untiled 8x8 shader first, then larger tiles.
pub fn wgsl_gemm_candidates() -> CandidateRegistry<GemmParams, WgpuDevice> {
    let mut registry = CandidateRegistry::new();
    registry
        .register(WgslGemm::new(8, 8, 1))
        .register(WgslGemm::new(16, 16, 8))
        .register(WgslGemm::new(8, 8, 32));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemmtune_device::{DeviceAllocator, DeviceMemory};
    use gemmtune_params::{BlasOp, GemmShape, Scalar};

    #[test]
    fn uniform_block_is_sixteen_words() {
        assert_eq!(std::mem::size_of::<ShaderParams>(), 64);
    }

    #[test]
    fn names_encode_the_configuration() {
        assert_eq!(WgslGemm::new(16, 16, 8).name, "wgsl_16x16_k8");
        // clamped to the workgroup limits
        assert_eq!(WgslGemm::new(64, 0, 0).name, "wgsl_16x1_k1");
        let source = WgslGemm::new(16, 8, 4).shader_source();
        assert!(source.contains("@workgroup_size(16, 8, 1)"));
        assert!(source.contains("k_outer + 4u"));
    }

    #[test]
    fn only_real_single_precision_is_supported() {
        let shape = GemmShape::new(BlasOp::N, BlasOp::N, 4, 4, 4);
        let ptr = DevicePtr::new(0x1_0000);
        let candidate = WgslGemm::new(8, 8, 1);
        let float = GemmParams::new(ScalarType::Float, shape, ptr, ptr, ptr);
        assert!(candidate.supports(&float));
        let half = GemmParams::new(ScalarType::Half, shape, ptr, ptr, ptr);
        assert!(!candidate.supports(&half));
        let complex_alpha = GemmParams::new(ScalarType::Float, shape, ptr, ptr, ptr)
            .with_scalars(Scalar::Complex { re: 1.0, im: 0.5 }, 0.0);
        assert!(!candidate.supports(&complex_alpha));
    }

    #[test]
    fn transposed_gemm_on_an_adapter_when_available() {
        let Ok(device) = WgpuDevice::new() else {
            return;
        };
        let shape = GemmShape::new(BlasOp::T, BlasOp::N, 2, 2, 2);
        let upload = |values: &[f64]| {
            let bytes = ScalarType::Float.encode(values);
            let ptr = device.allocate(bytes.len()).unwrap();
            device.write(ptr, &bytes).unwrap();
            ptr
        };
        // A stored transposed: op(A) = [1 2; 3 4]
        let a = upload(&[1.0, 2.0, 3.0, 4.0]);
        let b = upload(&[5.0, 6.0, 7.0, 8.0]);
        let c = upload(&[1.0; 4]);
        let params = GemmParams::new(ScalarType::Float, shape, a, b, c).with_scalars(1.0, 1.0);

        for candidate in wgsl_gemm_candidates().candidates() {
            device.write(c, &ScalarType::Float.encode(&[1.0; 4])).unwrap();
            candidate.run(&params, &device).unwrap();
            device.synchronize(device.current_stream()).unwrap();
            let out = ScalarType::Float.decode(&device.read(c, 16).unwrap());
            assert_eq!(out, [18.0, 40.0, 24.0, 54.0], "{}", candidate.name());
        }
    }
}
