//! CPU backend for fg_tensor with SIMD optimizations.
//!
//! Kernels run synchronously on the calling thread. "Compiling" a kernel
//! registers it in a per-backend table so ids behave like those of a device
//! backend.

use std::sync::Mutex;
use std::time::Instant;

use fg_tensor::backend::{BackendError, ComputeBackend, Dispatch, Kernel, KernelId};
use log::{debug, trace};

mod gradcheck;
mod simd;

pub use gradcheck::finite_diff_grad;

/// Tuning knobs for [`CpuBackend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuOptions {
    /// Use the vectorized add/mul/div paths.
    pub simd: bool,
}

impl Default for CpuOptions {
    fn default() -> Self {
        CpuOptions { simd: true }
    }
}

impl CpuOptions {
    pub fn with_simd(mut self, simd: bool) -> Self {
        self.simd = simd;
        self
    }
}

/// Host reference implementation of [`ComputeBackend`].
#[derive(Debug, Default)]
pub struct CpuBackend {
    options: CpuOptions,
    kernels: Mutex<Vec<Kernel>>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_options(CpuOptions::default())
    }

    pub fn with_options(options: CpuOptions) -> Self {
        CpuBackend {
            options,
            kernels: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> CpuOptions {
        self.options
    }

    fn lookup(&self, id: KernelId) -> Result<Kernel, BackendError> {
        let kernels = self
            .kernels
            .lock()
            .map_err(|_| BackendError::Device("cpu kernel table poisoned".into()))?;
        kernels
            .get(id.0 as usize)
            .copied()
            .ok_or(BackendError::UnknownKernel(id))
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn compile(&self, kernel: Kernel) -> Result<KernelId, BackendError> {
        let mut kernels = self
            .kernels
            .lock()
            .map_err(|_| BackendError::Device("cpu kernel table poisoned".into()))?;
        if let Some(pos) = kernels.iter().position(|&k| k == kernel) {
            return Ok(KernelId(pos as u32));
        }
        kernels.push(kernel);
        let id = KernelId((kernels.len() - 1) as u32);
        debug!("cpu: registered {} as {}", kernel, id);
        Ok(id)
    }

    fn dispatch(
        &self,
        id: KernelId,
        uniforms: &[u32],
        inputs: &[&[f32]],
        output_len: usize,
    ) -> Result<Dispatch, BackendError> {
        let kernel = self.lookup(id)?;
        kernel.validate_launch(uniforms, inputs, output_len)?;

        let start = Instant::now();
        let mut output = vec![0.0f32; output_len];
        execute(kernel, uniforms, inputs, &mut output, self.options.simd);
        let elapsed = start.elapsed();
        trace!("cpu: {} over {} elements in {:?}", kernel, output_len, elapsed);
        Ok(Dispatch { output, elapsed })
    }
}

/// Run a validated launch.
fn execute(kernel: Kernel, uniforms: &[u32], inputs: &[&[f32]], out: &mut [f32], use_simd: bool) {
    match kernel {
        Kernel::Add if use_simd => simd::add_f32(inputs[0], inputs[1], out),
        Kernel::Mul if use_simd => simd::mul_f32(inputs[0], inputs[1], out),
        Kernel::Div if use_simd => simd::div_f32(inputs[0], inputs[1], out),
        Kernel::Add => zip_map(inputs[0], inputs[1], out, |a, b| a + b),
        Kernel::Mul => zip_map(inputs[0], inputs[1], out, |a, b| a * b),
        Kernel::Div => zip_map(inputs[0], inputs[1], out, |a, b| a / b),
        Kernel::Neg => map(inputs[0], out, |x| -x),
        Kernel::Exp => map(inputs[0], out, f32::exp),
        Kernel::Exp2 => map(inputs[0], out, f32::exp2),
        Kernel::Ln => map(inputs[0], out, f32::ln),
        Kernel::Log2 => map(inputs[0], out, f32::log2),
        Kernel::Relu => map(inputs[0], out, |x| x.max(0.0)),
        Kernel::ReluBackward => zip_map(inputs[0], inputs[1], out, |g, x| if x > 0.0 { g } else { 0.0 }),
        Kernel::MatMul => matmul(
            inputs[0],
            inputs[1],
            out,
            uniforms[0] as usize,
            uniforms[1] as usize,
            uniforms[2] as usize,
        ),
    }
}

fn map(x: &[f32], out: &mut [f32], f: impl Fn(f32) -> f32) {
    for (o, &v) in out.iter_mut().zip(x) {
        *o = f(v);
    }
}

fn zip_map(a: &[f32], b: &[f32], out: &mut [f32], f: impl Fn(f32, f32) -> f32) {
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = f(x, y);
    }
}

/// Row-major `[m, k] @ [k, n]` in i-k-j order so the inner loop walks contiguous rows.
fn matmul(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    out.iter_mut().for_each(|v| *v = 0.0);
    for i in 0..m {
        let row = &mut out[i * n..(i + 1) * n];
        for l in 0..k {
            let scale = a[i * k + l];
            let b_row = &b[l * n..(l + 1) * n];
            for (o, &bv) in row.iter_mut().zip(b_row) {
                *o += scale * bv;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn run(backend: &CpuBackend, kernel: Kernel, uniforms: &[u32], inputs: &[&[f32]], len: usize) -> Vec<f32> {
        let id = backend.compile(kernel).unwrap();
        backend.dispatch(id, uniforms, inputs, len).unwrap().output
    }

    #[test]
    fn test_compile_is_idempotent() {
        let backend = CpuBackend::new();
        let add = backend.compile(Kernel::Add).unwrap();
        let mul = backend.compile(Kernel::Mul).unwrap();
        assert_ne!(add, mul);
        assert_eq!(backend.compile(Kernel::Add).unwrap(), add);
    }

    #[test]
    fn test_unknown_kernel() {
        let backend = CpuBackend::new();
        let err = backend.dispatch(KernelId(7), &[1], &[&[1.0]], 1).unwrap_err();
        assert_eq!(err, BackendError::UnknownKernel(KernelId(7)));
    }

    #[test]
    fn test_rejects_malformed_launch() {
        let backend = CpuBackend::new();
        let id = backend.compile(Kernel::Add).unwrap();
        let err = backend.dispatch(id, &[3], &[&[1.0, 2.0, 3.0], &[1.0]], 3).unwrap_err();
        assert!(matches!(err, BackendError::InputLength { index: 1, .. }));
    }

    #[test]
    fn test_unary_ops() {
        let backend = CpuBackend::new();
        let x = [-1.0f32, 0.0, 2.0];
        assert_eq!(run(&backend, Kernel::Neg, &[3], &[&x], 3), vec![1.0, -0.0, -2.0]);
        assert_eq!(run(&backend, Kernel::Relu, &[3], &[&x], 3), vec![0.0, 0.0, 2.0]);
        let exp2 = run(&backend, Kernel::Exp2, &[3], &[&x], 3);
        for (got, want) in exp2.iter().zip([0.5f32, 1.0, 4.0]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-6);
        }

        let exp = run(&backend, Kernel::Exp, &[3], &[&x], 3);
        for (got, want) in exp.iter().zip(x.iter().map(|v: &f32| v.exp())) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-6);
        }

        let y = [1.0, 8.0];
        let log2 = run(&backend, Kernel::Log2, &[2], &[&y], 2);
        assert_abs_diff_eq!(log2[0], 0.0f32, epsilon = 1e-6);
        assert_abs_diff_eq!(log2[1], 3.0f32, epsilon = 1e-6);
        assert_abs_diff_eq!(run(&backend, Kernel::Ln, &[2], &[&y], 2)[1], 8.0f32.ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_binary_ops() {
        for simd in [true, false] {
            let backend = CpuBackend::with_options(CpuOptions::default().with_simd(simd));
            let a: Vec<f32> = (1..=10).map(|v| v as f32).collect();
            let b = vec![2.0; 10];
            let add = run(&backend, Kernel::Add, &[10], &[&a, &b], 10);
            let mul = run(&backend, Kernel::Mul, &[10], &[&a, &b], 10);
            let div = run(&backend, Kernel::Div, &[10], &[&a, &b], 10);
            assert_eq!(add[9], 12.0, "simd={simd}");
            assert_eq!(mul[4], 10.0, "simd={simd}");
            assert_eq!(div[2], 1.5, "simd={simd}");
        }
    }

    #[test]
    fn test_relu_backward_masks_boundary() {
        let backend = CpuBackend::new();
        let g = [5.0, 5.0, 5.0];
        let x = [-1.0, 0.0, 1.0];
        assert_eq!(
            run(&backend, Kernel::ReluBackward, &[3], &[&g, &x], 3),
            vec![0.0, 0.0, 5.0]
        );
    }

    #[test]
    fn test_matmul() {
        let backend = CpuBackend::new();
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [0.1, 0.2, 0.3, 0.4];
        let out = run(&backend, Kernel::MatMul, &[3, 2, 2], &[&a, &b], 6);
        let expected = [0.7f32, 1.0, 1.5, 2.2, 2.3, 3.4];
        for (got, want) in out.iter().zip(expected) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_matmul_non_square() {
        let backend = CpuBackend::new();
        // [1, 3] @ [3, 2]
        let a = [1.0, 2.0, 3.0];
        let b = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        assert_eq!(run(&backend, Kernel::MatMul, &[1, 3, 2], &[&a, &b], 2), vec![4.0, 5.0]);
    }
}
