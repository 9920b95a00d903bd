//! Compute backend contract: compile named kernels, then dispatch them over flat buffers.
//!
//! Every kernel is element-wise over a single length uniform except
//! [`Kernel::MatMul`], which takes `[m, k, n]`. Backends receive already
//! broadcast operands of identical length; shape logic stays on the host.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A compute kernel a backend must be able to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    Add,
    Mul,
    Div,
    Neg,
    Exp,
    Exp2,
    Ln,
    Log2,
    Relu,
    /// `out[i] = x[i] > 0 ? g[i] : 0` with inputs `(g, x)`.
    ReluBackward,
    /// Row-major `[m, k] @ [k, n]` with uniforms `[m, k, n]`.
    MatMul,
}

impl Kernel {
    /// Every kernel, in a stable order.
    pub const ALL: [Kernel; 11] = [
        Kernel::Add,
        Kernel::Mul,
        Kernel::Div,
        Kernel::Neg,
        Kernel::Exp,
        Kernel::Exp2,
        Kernel::Ln,
        Kernel::Log2,
        Kernel::Relu,
        Kernel::ReluBackward,
        Kernel::MatMul,
    ];

    /// Shader/function name used by source-compiling backends.
    pub fn entry_point(self) -> &'static str {
        match self {
            Kernel::Add => "add_f",
            Kernel::Mul => "mul_f",
            Kernel::Div => "div_f",
            Kernel::Neg => "neg_f",
            Kernel::Exp => "exp_f",
            Kernel::Exp2 => "exp2_f",
            Kernel::Ln => "ln_f",
            Kernel::Log2 => "log2_f",
            Kernel::Relu => "relu_f",
            Kernel::ReluBackward => "relu_backward_f",
            Kernel::MatMul => "matmul_f",
        }
    }

    /// Number of input buffers.
    pub fn arity(self) -> usize {
        match self {
            Kernel::Neg | Kernel::Exp | Kernel::Exp2 | Kernel::Ln | Kernel::Log2 | Kernel::Relu => 1,
            Kernel::Add | Kernel::Mul | Kernel::Div | Kernel::ReluBackward | Kernel::MatMul => 2,
        }
    }

    /// Number of `u32` uniforms.
    pub fn uniform_count(self) -> usize {
        match self {
            Kernel::MatMul => 3,
            _ => 1,
        }
    }

    /// Check a launch against this kernel's signature.
    ///
    /// Backends call this before touching any buffer so that every backend
    /// rejects malformed launches the same way.
    pub fn validate_launch(
        self,
        uniforms: &[u32],
        inputs: &[&[f32]],
        output_len: usize,
    ) -> Result<(), BackendError> {
        if uniforms.len() != self.uniform_count() {
            return Err(BackendError::Uniforms {
                kernel: self,
                expected: self.uniform_count(),
                got: uniforms.len(),
            });
        }
        if inputs.len() != self.arity() {
            return Err(BackendError::Arity {
                kernel: self,
                expected: self.arity(),
                got: inputs.len(),
            });
        }
        let expected: [usize; 2] = match self {
            Kernel::MatMul => {
                let (m, k, n) = (uniforms[0] as usize, uniforms[1] as usize, uniforms[2] as usize);
                if output_len != m * n {
                    return Err(BackendError::OutputLength {
                        kernel: self,
                        expected: m * n,
                        got: output_len,
                    });
                }
                [m * k, k * n]
            }
            _ => {
                let len = uniforms[0] as usize;
                if output_len != len {
                    return Err(BackendError::OutputLength {
                        kernel: self,
                        expected: len,
                        got: output_len,
                    });
                }
                [len, len]
            }
        };
        for (index, input) in inputs.iter().enumerate() {
            if input.len() != expected[index] {
                return Err(BackendError::InputLength {
                    kernel: self,
                    index,
                    expected: expected[index],
                    got: input.len(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

/// Handle to a compiled kernel, scoped to the backend that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub u32);

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel#{}", self.0)
    }
}

/// Result of a completed dispatch.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub output: Vec<f32>,
    /// Time the backend spent executing the kernel.
    pub elapsed: Duration,
}

/// Backend failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("{0} was not compiled by this backend")]
    UnknownKernel(KernelId),

    #[error("{kernel} takes {expected} input buffers, got {got}")]
    Arity {
        kernel: Kernel,
        expected: usize,
        got: usize,
    },

    #[error("{kernel} input {index} has {got} elements, expected {expected}")]
    InputLength {
        kernel: Kernel,
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("{kernel} output needs {expected} elements, got {got}")]
    OutputLength {
        kernel: Kernel,
        expected: usize,
        got: usize,
    },

    #[error("{kernel} takes {expected} uniforms, got {got}")]
    Uniforms {
        kernel: Kernel,
        expected: usize,
        got: usize,
    },

    #[error("failed to compile {kernel}: {message}")]
    Compile { kernel: Kernel, message: String },

    #[error("device error: {0}")]
    Device(String),
}

/// A device that can compile and run the kernels in [`Kernel`].
///
/// `compile` may be called repeatedly for the same kernel; returning the
/// previously issued id is expected. `dispatch` blocks until the output is
/// readable on the host.
pub trait ComputeBackend: Send + Sync + 'static {
    /// Short human-readable name ("cpu", "metal").
    fn name(&self) -> &str;

    fn compile(&self, kernel: Kernel) -> Result<KernelId, BackendError>;

    /// Run a compiled kernel over `inputs`, producing `output_len` elements.
    fn dispatch(
        &self,
        kernel: KernelId,
        uniforms: &[u32],
        inputs: &[&[f32]],
        output_len: usize,
    ) -> Result<Dispatch, BackendError>;
}
