//! Metal backend implementation.

use std::ffi::c_void;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use fg_tensor::backend::{BackendError, ComputeBackend, Dispatch, Kernel, KernelId};
use log::{debug, trace};
use metal::{
    Buffer, CommandQueue, CompileOptions, ComputePipelineState, Device, Library,
    MTLCommandBufferStatus, MTLResourceOptions, MTLSize,
};

/// Metal compute shaders, one entry point per [`Kernel`].
///
/// Inputs occupy the first buffer slots, the output follows, and the `uint`
/// uniforms come last. Element-wise kernels guard on `params[0]`.
const SHADER_SOURCE: &str = r#"
#include <metal_stdlib>
using namespace metal;

#define UNARY(name, expr)                                              \
kernel void name(device const float* x [[buffer(0)]],                  \
                 device float* out [[buffer(1)]],                      \
                 constant uint* params [[buffer(2)]],                  \
                 uint id [[thread_position_in_grid]]) {                \
    if (id >= params[0]) return;                                       \
    float v = x[id];                                                   \
    out[id] = (expr);                                                  \
}

#define BINARY(name, expr)                                             \
kernel void name(device const float* a [[buffer(0)]],                  \
                 device const float* b [[buffer(1)]],                  \
                 device float* out [[buffer(2)]],                      \
                 constant uint* params [[buffer(3)]],                  \
                 uint id [[thread_position_in_grid]]) {                \
    if (id >= params[0]) return;                                       \
    float l = a[id];                                                   \
    float r = b[id];                                                   \
    out[id] = (expr);                                                  \
}

UNARY(neg_f, -v)
UNARY(exp_f, exp(v))
UNARY(exp2_f, exp2(v))
UNARY(ln_f, log(v))
UNARY(log2_f, log2(v))
UNARY(relu_f, max(0.0f, v))

BINARY(add_f, l + r)
BINARY(mul_f, l * r)
BINARY(div_f, l / r)
// a is the upstream gradient, b the forward input.
BINARY(relu_backward_f, r > 0.0f ? l : 0.0f)

// C[m, n] = A[m, k] @ B[k, n], params = (m, k, n)
kernel void matmul_f(device const float* A [[buffer(0)]],
                     device const float* B [[buffer(1)]],
                     device float* C [[buffer(2)]],
                     constant uint* params [[buffer(3)]],
                     uint2 gid [[thread_position_in_grid]]) {
    uint M = params[0];
    uint K = params[1];
    uint N = params[2];
    uint row = gid.y;
    uint col = gid.x;

    if (row >= M || col >= N) return;

    float sum = 0.0f;
    for (uint i = 0; i < K; i++) {
        sum += A[row * K + i] * B[i * N + col];
    }
    C[row * N + col] = sum;
}
"#;

/// Tuning knobs for [`MetalBackend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetalOptions {
    /// Threads per threadgroup for element-wise kernels.
    pub threadgroup_width: u64,
}

impl Default for MetalOptions {
    fn default() -> Self {
        MetalOptions {
            threadgroup_width: 256,
        }
    }
}

impl MetalOptions {
    pub fn with_threadgroup_width(mut self, width: u64) -> Self {
        self.threadgroup_width = width.max(1);
        self
    }
}

/// Metal device, queue and compiled shader library.
#[derive(Clone)]
pub struct MetalContext {
    device: Device,
    command_queue: CommandQueue,
    library: Library,
}

impl MetalContext {
    /// Open the system default device and compile the shader library.
    pub fn new() -> Result<Self, BackendError> {
        let device = Device::system_default()
            .ok_or_else(|| BackendError::Device("no Metal device available".into()))?;
        let command_queue = device.new_command_queue();

        let options = CompileOptions::new();
        let library = device
            .new_library_with_source(SHADER_SOURCE, &options)
            .map_err(|e| BackendError::Device(format!("failed to build shader library: {e}")))?;
        debug!("metal: compiled shader library on {}", device.name());

        Ok(MetalContext {
            device,
            command_queue,
            library,
        })
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    fn create_buffer(&self, len: usize) -> Buffer {
        let size_bytes = len * std::mem::size_of::<f32>();
        self.device
            .new_buffer(size_bytes as u64, MTLResourceOptions::StorageModeShared)
    }

    fn create_buffer_with_data(&self, data: &[f32]) -> Buffer {
        let size_bytes = std::mem::size_of_val(data);
        self.device.new_buffer_with_data(
            data.as_ptr() as *const c_void,
            size_bytes as u64,
            MTLResourceOptions::StorageModeShared,
        )
    }
}

/// [`ComputeBackend`] running kernels on the system Metal device.
pub struct MetalBackend {
    context: Arc<MetalContext>,
    options: MetalOptions,
    pipelines: Mutex<Vec<(Kernel, ComputePipelineState)>>,
}

impl MetalBackend {
    pub fn new() -> Result<Self, BackendError> {
        Self::with_options(MetalOptions::default())
    }

    pub fn with_options(options: MetalOptions) -> Result<Self, BackendError> {
        Ok(Self::with_context(Arc::new(MetalContext::new()?), options))
    }

    /// Share an existing context (and its compiled library).
    pub fn with_context(context: Arc<MetalContext>, options: MetalOptions) -> Self {
        MetalBackend {
            context,
            options,
            pipelines: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<MetalContext> {
        &self.context
    }

    pub fn options(&self) -> MetalOptions {
        self.options
    }

    fn pipeline(&self, id: KernelId) -> Result<(Kernel, ComputePipelineState), BackendError> {
        let pipelines = self
            .pipelines
            .lock()
            .map_err(|_| BackendError::Device("metal pipeline table poisoned".into()))?;
        pipelines
            .get(id.0 as usize)
            .cloned()
            .ok_or(BackendError::UnknownKernel(id))
    }
}

impl ComputeBackend for MetalBackend {
    fn name(&self) -> &str {
        "metal"
    }

    fn compile(&self, kernel: Kernel) -> Result<KernelId, BackendError> {
        let mut pipelines = self
            .pipelines
            .lock()
            .map_err(|_| BackendError::Device("metal pipeline table poisoned".into()))?;
        if let Some(pos) = pipelines.iter().position(|(k, _)| *k == kernel) {
            return Ok(KernelId(pos as u32));
        }

        let ctx = &self.context;
        let function = ctx
            .library
            .get_function(kernel.entry_point(), None)
            .map_err(|message| BackendError::Compile { kernel, message })?;
        let pipeline = ctx
            .device
            .new_compute_pipeline_state_with_function(&function)
            .map_err(|message| BackendError::Compile { kernel, message })?;

        pipelines.push((kernel, pipeline));
        let id = KernelId((pipelines.len() - 1) as u32);
        debug!("metal: built pipeline for {} as {}", kernel, id);
        Ok(id)
    }

    fn dispatch(
        &self,
        id: KernelId,
        uniforms: &[u32],
        inputs: &[&[f32]],
        output_len: usize,
    ) -> Result<Dispatch, BackendError> {
        let (kernel, pipeline) = self.pipeline(id)?;
        kernel.validate_launch(uniforms, inputs, output_len)?;
        if output_len == 0 {
            return Ok(Dispatch {
                output: Vec::new(),
                elapsed: Default::default(),
            });
        }

        let ctx = &self.context;
        let start = Instant::now();
        let input_buffers: Vec<Buffer> = inputs
            .iter()
            .map(|data| ctx.create_buffer_with_data(data))
            .collect();
        let output_buffer = ctx.create_buffer(output_len);

        let command_buffer = ctx.command_queue.new_command_buffer();
        let encoder = command_buffer.new_compute_command_encoder();
        encoder.set_compute_pipeline_state(&pipeline);
        for (slot, buffer) in input_buffers.iter().enumerate() {
            encoder.set_buffer(slot as u64, Some(buffer), 0);
        }
        encoder.set_buffer(inputs.len() as u64, Some(&output_buffer), 0);
        encoder.set_bytes(
            (inputs.len() + 1) as u64,
            std::mem::size_of_val(uniforms) as u64,
            uniforms.as_ptr() as *const c_void,
        );

        let max_threads = pipeline.max_total_threads_per_threadgroup();
        let (grid_size, thread_group_size) = match kernel {
            Kernel::MatMul => (
                MTLSize::new(uniforms[2] as u64, uniforms[0] as u64, 1),
                MTLSize::new(8, 8, 1),
            ),
            _ => {
                let width = self.options.threadgroup_width.min(max_threads).max(1);
                (
                    MTLSize::new(output_len as u64, 1, 1),
                    MTLSize::new(width, 1, 1),
                )
            }
        };
        encoder.dispatch_threads(grid_size, thread_group_size);
        encoder.end_encoding();

        command_buffer.commit();
        command_buffer.wait_until_completed();
        if command_buffer.status() == MTLCommandBufferStatus::Error {
            return Err(BackendError::Device(format!("{kernel} command buffer failed")));
        }

        let ptr = output_buffer.contents() as *const f32;
        // SAFETY: the buffer holds `output_len` floats in shared memory and the GPU has finished writing.
        let output = unsafe { std::slice::from_raw_parts(ptr, output_len) }.to_vec();
        let elapsed = start.elapsed();
        trace!("metal: {} over {} elements in {:?}", kernel, output_len, elapsed);
        Ok(Dispatch { output, elapsed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Option<MetalBackend> {
        match MetalBackend::new() {
            Ok(backend) => Some(backend),
            Err(err) => {
                eprintln!("skipping Metal test: {err}");
                None
            }
        }
    }

    fn run(backend: &MetalBackend, kernel: Kernel, uniforms: &[u32], inputs: &[&[f32]], len: usize) -> Vec<f32> {
        let id = backend.compile(kernel).unwrap();
        backend.dispatch(id, uniforms, inputs, len).unwrap().output
    }

    #[test]
    fn test_compile_is_idempotent() {
        let Some(backend) = backend() else { return };
        assert!(!backend.context().device_name().is_empty());
        let relu = backend.compile(Kernel::Relu).unwrap();
        assert_eq!(backend.compile(Kernel::Relu).unwrap(), relu);
        for kernel in Kernel::ALL {
            backend.compile(kernel).unwrap();
        }
    }

    #[test]
    fn test_metal_unary_ops() {
        let Some(backend) = backend() else { return };
        let x = [1.0f32, 2.0, -3.0];

        assert_eq!(run(&backend, Kernel::Neg, &[3], &[&x], 3), vec![-1.0, -2.0, 3.0]);
        assert_eq!(run(&backend, Kernel::Relu, &[3], &[&x], 3), vec![1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_metal_binary_ops() {
        let Some(backend) = backend() else { return };
        let a = [1.0f32, 2.0, 3.0];
        let b = [4.0f32, 5.0, 6.0];

        assert_eq!(run(&backend, Kernel::Add, &[3], &[&a, &b], 3), vec![5.0, 7.0, 9.0]);
        assert_eq!(run(&backend, Kernel::Mul, &[3], &[&a, &b], 3), vec![4.0, 10.0, 18.0]);
        assert_eq!(
            run(&backend, Kernel::ReluBackward, &[3], &[&b, &[-1.0, 0.0, 1.0]], 3),
            vec![0.0, 0.0, 6.0]
        );
    }

    #[test]
    fn test_metal_matmul() {
        let Some(backend) = backend() else { return };
        let a = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [0.1f32, 0.2, 0.3, 0.4];
        let out = run(&backend, Kernel::MatMul, &[3, 2, 2], &[&a, &b], 6);
        for (got, want) in out.iter().zip([0.7f32, 1.0, 1.5, 2.2, 2.3, 3.4]) {
            assert!((got - want).abs() < 1e-5, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_narrow_threadgroups() {
        let Some(shared) = backend() else { return };
        let options = MetalOptions::default().with_threadgroup_width(32);
        let backend = MetalBackend::with_context(Arc::clone(shared.context()), options);
        assert_eq!(backend.options().threadgroup_width, 32);

        let x: Vec<f32> = (0..100).map(|v| v as f32 - 50.0).collect();
        let want: Vec<f32> = x.iter().map(|v| v.max(0.0)).collect();
        assert_eq!(run(&backend, Kernel::Relu, &[100], &[x.as_slice()], 100), want);
    }

    #[test]
    fn test_unknown_kernel() {
        let Some(backend) = backend() else { return };
        assert_eq!(
            backend.dispatch(KernelId(99), &[1], &[&[1.0]], 1).unwrap_err(),
            BackendError::UnknownKernel(KernelId(99))
        );
    }
}
