//! Operations: forward dispatch and closed-form backward rules.
//!
//! Each [`Operation`] is one invocation of an [`OpKind`]. Forward resolves
//! shapes, dispatches kernels and, when any input requires grad, arms a
//! single-use [`Saved`] record. Backward takes that record, dispatches the
//! gradient kernels and hands each gradient to [`Graph::set_grad`].

use std::f32::consts::LN_2;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::backend::{BackendError, ComputeBackend, Kernel, KernelId};
use crate::error::{Result, ShapeError, TensorError};
use crate::graph::{Graph, OpId, TensorId};
use crate::shape::{broadcast, matmul_dims, Broadcast, Shape};
use crate::tensor::Tensor;

/// The closed set of differentiable operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Mul,
    Div,
    MatMul,
    Exp,
    Exp2,
    Ln,
    Log2,
    Relu,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::MatMul => "matmul",
            OpKind::Exp => "exp",
            OpKind::Exp2 => "exp2",
            OpKind::Ln => "ln",
            OpKind::Log2 => "log2",
            OpKind::Relu => "relu",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            OpKind::Add | OpKind::Mul | OpKind::Div | OpKind::MatMul => 2,
            OpKind::Exp | OpKind::Exp2 | OpKind::Ln | OpKind::Log2 | OpKind::Relu => 1,
        }
    }

    /// Every kernel forward and backward dispatch. The first is the forward kernel.
    pub fn kernels(self) -> &'static [Kernel] {
        match self {
            OpKind::Add => &[Kernel::Add],
            OpKind::Mul => &[Kernel::Mul],
            OpKind::Div => &[Kernel::Div, Kernel::Mul, Kernel::Neg],
            OpKind::MatMul => &[Kernel::MatMul],
            OpKind::Exp => &[Kernel::Exp, Kernel::Mul],
            OpKind::Exp2 => &[Kernel::Exp2, Kernel::Mul],
            OpKind::Ln => &[Kernel::Ln, Kernel::Div],
            OpKind::Log2 => &[Kernel::Log2, Kernel::Mul, Kernel::Div],
            OpKind::Relu => &[Kernel::Relu, Kernel::ReluBackward],
        }
    }

    fn forward_kernel(self) -> Kernel {
        self.kernels()[0]
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What each variant keeps for its backward rule.
#[derive(Debug, Clone)]
pub(crate) enum SavedState {
    Add { plan: Broadcast },
    Mul { lhs: TensorId, rhs: TensorId, plan: Broadcast },
    Div { lhs: TensorId, rhs: TensorId, plan: Broadcast },
    MatMul { lhs: TensorId, rhs: TensorId },
    Exp { output: TensorId },
    Exp2 { output: TensorId },
    Ln { input: TensorId },
    Log2 { input: TensorId },
    Relu { input: TensorId },
}

/// Inputs and state captured by a forward call that needs a backward.
#[derive(Debug, Clone)]
pub(crate) struct Saved {
    inputs: Vec<TensorId>,
    requires_grad: Vec<bool>,
    output: TensorId,
    state: SavedState,
}

#[derive(Debug, Clone)]
pub(crate) enum SavedSlot {
    /// Nothing to differentiate: never run, or no input required grad.
    Empty,
    Armed(Saved),
    /// Taken by backward.
    Consumed,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct KernelTable(Vec<(Kernel, KernelId)>);

impl KernelTable {
    fn get(&self, kernel: Kernel) -> Option<KernelId> {
        self.0.iter().find(|(k, _)| *k == kernel).map(|&(_, id)| id)
    }
}

/// One invocation of an [`OpKind`] inside a graph.
#[derive(Debug, Clone)]
pub struct Operation {
    id: OpId,
    kind: OpKind,
    kernels: Option<KernelTable>,
    output: Option<TensorId>,
    slot: SavedSlot,
}

impl Operation {
    pub(crate) fn new(id: OpId, kind: OpKind) -> Self {
        Operation {
            id,
            kind,
            kernels: None,
            output: None,
            slot: SavedSlot::Empty,
        }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Output of the most recent forward call.
    pub fn output(&self) -> Option<TensorId> {
        self.output
    }

    /// Inputs still awaiting backward. Empty once backward consumed them.
    pub fn inputs(&self) -> &[TensorId] {
        match &self.slot {
            SavedSlot::Armed(saved) => &saved.inputs,
            SavedSlot::Empty | SavedSlot::Consumed => &[],
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.kernels.is_some()
    }

    /// True while a forward's saved state is waiting for backward.
    pub fn is_armed(&self) -> bool {
        matches!(self.slot, SavedSlot::Armed(_))
    }

    pub fn is_consumed(&self) -> bool {
        matches!(self.slot, SavedSlot::Consumed)
    }

    pub(crate) fn set_kernels(&mut self, kernels: Vec<(Kernel, KernelId)>) {
        self.kernels = Some(KernelTable(kernels));
    }

    pub(crate) fn clear_kernels(&mut self) {
        self.kernels = None;
    }

    fn kernel_table(&self) -> Result<KernelTable> {
        self.kernels
            .clone()
            .ok_or(TensorError::UninitializedOperation { op: self.kind })
    }
}

/// Dispatches an operation's kernels and sums their elapsed time.
struct Launcher<'a, B: ComputeBackend> {
    backend: &'a B,
    kernels: &'a KernelTable,
    op: OpKind,
    elapsed: Duration,
}

impl<'a, B: ComputeBackend> Launcher<'a, B> {
    fn new(backend: &'a B, kernels: &'a KernelTable, op: OpKind) -> Self {
        Launcher {
            backend,
            kernels,
            op,
            elapsed: Duration::ZERO,
        }
    }

    fn run(&mut self, kernel: Kernel, uniforms: &[u32], inputs: &[&[f32]], len: usize) -> Result<Vec<f32>> {
        let id = self
            .kernels
            .get(kernel)
            .ok_or(TensorError::UninitializedOperation { op: self.op })?;
        let dispatch = self.backend.dispatch(id, uniforms, inputs, len)?;
        if dispatch.output.len() != len {
            return Err(BackendError::OutputLength {
                kernel,
                expected: len,
                got: dispatch.output.len(),
            }
            .into());
        }
        trace!(
            "{}: {} over {} elements in {:?}",
            self.op,
            kernel,
            len,
            dispatch.elapsed
        );
        self.elapsed += dispatch.elapsed;
        Ok(dispatch.output)
    }

    fn unary(&mut self, kernel: Kernel, x: &[f32]) -> Result<Vec<f32>> {
        self.run(kernel, &[x.len() as u32], &[x], x.len())
    }

    /// Element-wise kernel over two buffers of equal length.
    fn binary(&mut self, kernel: Kernel, a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
        self.run(kernel, &[a.len() as u32], &[a, b], a.len())
    }

    /// `[m, k] @ [k, n]`.
    fn matmul(&mut self, a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>> {
        self.run(
            Kernel::MatMul,
            &[m as u32, k as u32, n as u32],
            &[a, b],
            m * n,
        )
    }
}

fn matrix_dims(shape: &Shape) -> Result<(usize, usize)> {
    shape.as_matrix().ok_or_else(|| {
        ShapeError::NotMatrix {
            op: "matmul",
            shape: shape.clone(),
        }
        .into()
    })
}

impl<B: ComputeBackend> Graph<B> {
    /// Run `op` over `inputs`, returning the output tensor and kernel time.
    pub fn forward(&mut self, op: OpId, inputs: &[TensorId]) -> Result<(TensorId, Duration)> {
        let operation = self.operation(op)?;
        let kind = operation.kind();
        let kernels = operation.kernel_table()?;
        let previous = operation.output();
        if inputs.len() != kind.arity() {
            return Err(TensorError::Arity {
                op: kind,
                expected: kind.arity(),
                got: inputs.len(),
            });
        }
        let mut requires_grad = Vec::with_capacity(inputs.len());
        for &input in inputs {
            requires_grad.push(self.get(input)?.requires_grad());
        }
        let any_grad = requires_grad.iter().any(|&r| r);

        let backend = Arc::clone(&self.backend);
        let mut launcher = Launcher::new(&*backend, &kernels, kind);
        // The output is inserted right after dispatch; nothing else touches the arena in between.
        let output = TensorId(self.tensors.len());

        let (data, shape, state) = match kind {
            OpKind::Add | OpKind::Mul | OpKind::Div => {
                let (lhs, rhs) = (self.get(inputs[0])?, self.get(inputs[1])?);
                let plan = broadcast(lhs.shape(), rhs.shape())?;
                let data = launcher.binary(
                    kind.forward_kernel(),
                    &plan.expand_lhs(lhs.data()),
                    &plan.expand_rhs(rhs.data()),
                )?;
                let shape = plan.out.clone();
                let state = match kind {
                    OpKind::Add => SavedState::Add { plan },
                    OpKind::Mul => SavedState::Mul {
                        lhs: inputs[0],
                        rhs: inputs[1],
                        plan,
                    },
                    _ => SavedState::Div {
                        lhs: inputs[0],
                        rhs: inputs[1],
                        plan,
                    },
                };
                (data, shape, state)
            }
            OpKind::MatMul => {
                let (lhs, rhs) = (self.get(inputs[0])?, self.get(inputs[1])?);
                let (m, k, n) = matmul_dims(lhs.shape(), rhs.shape())?;
                let data = launcher.matmul(lhs.data(), rhs.data(), m, k, n)?;
                let state = SavedState::MatMul {
                    lhs: inputs[0],
                    rhs: inputs[1],
                };
                (data, Shape::new(vec![m, n])?, state)
            }
            OpKind::Exp | OpKind::Exp2 | OpKind::Ln | OpKind::Log2 | OpKind::Relu => {
                let x = self.get(inputs[0])?;
                let data = launcher.unary(kind.forward_kernel(), x.data())?;
                let input = inputs[0];
                let state = match kind {
                    OpKind::Exp => SavedState::Exp { output },
                    OpKind::Exp2 => SavedState::Exp2 { output },
                    OpKind::Ln => SavedState::Ln { input },
                    OpKind::Log2 => SavedState::Log2 { input },
                    _ => SavedState::Relu { input },
                };
                (data, x.shape().clone(), state)
            }
        };
        let elapsed = launcher.elapsed;

        let id = self.insert(Tensor::unchecked(data, shape, any_grad));
        debug_assert_eq!(id, output);
        self.elapsed += elapsed;

        // The previous output loses its producer: its saved state is overwritten below.
        if let Some(previous) = previous {
            let tensor = self.get_mut(previous)?;
            if tensor.producer == Some(op) {
                tensor.producer = None;
            }
        }

        let slot = if any_grad {
            self.get_mut(output)?.producer = Some(op);
            SavedSlot::Armed(Saved {
                inputs: inputs.to_vec(),
                requires_grad,
                output,
                state,
            })
        } else {
            SavedSlot::Empty
        };
        let operation = self.operation_mut(op)?;
        operation.slot = slot;
        operation.output = Some(output);
        trace!("forward {} ({}) -> {} in {:?}", kind, op, output, elapsed);
        Ok((output, elapsed))
    }

    /// Backpropagate `grad` (shaped like the op's output) through `op`.
    ///
    /// Returns one entry per input: the gradient tensor handed to
    /// [`Graph::set_grad`], or `None` when that input does not require grad.
    /// The saved state is consumed only once every gradient has been handed
    /// over; a second call fails until `forward` runs again. If a dispatch
    /// fails, the inputs' gradients are left as they were and the op stays
    /// armed, so backward can be retried.
    pub fn backward_op(&mut self, op: OpId, grad: TensorId) -> Result<Vec<Option<TensorId>>> {
        let operation = self.operation(op)?;
        let kind = operation.kind();
        let kernels = operation.kernel_table()?;
        let saved = match &operation.slot {
            SavedSlot::Armed(saved) => saved.clone(),
            SavedSlot::Consumed => return Err(TensorError::DoubleBackward { op: kind, id: op }),
            SavedSlot::Empty => return Err(TensorError::NotRecorded { op: kind, id: op }),
        };
        let expected = self.get(saved.output)?.shape();
        let grad_shape = self.get(grad)?.shape();
        if grad_shape != expected {
            return Err(ShapeError::GradientMismatch {
                expected: expected.clone(),
                grad: grad_shape.clone(),
            }
            .into());
        }

        let backend = Arc::clone(&self.backend);
        let mut launcher = Launcher::new(&*backend, &kernels, kind);
        let grads = self.local_gradients(&mut launcher, &saved, grad)?;
        self.elapsed += launcher.elapsed;

        let previous = saved
            .inputs
            .iter()
            .map(|&input| Ok(self.get(input)?.grad))
            .collect::<Result<Vec<_>>>()?;
        let mut result = Vec::with_capacity(grads.len());
        for (&input, grad) in saved.inputs.iter().zip(grads) {
            let Some(tensor) = grad else {
                result.push(None);
                continue;
            };
            let id = self.insert(tensor);
            if let Err(err) = self.set_grad(input, id) {
                for (&input, &grad) in saved.inputs.iter().zip(&previous) {
                    self.get_mut(input)?.grad = grad;
                }
                return Err(err);
            }
            result.push(Some(id));
        }

        self.operation_mut(op)?.slot = SavedSlot::Consumed;
        trace!("backward {} ({}) in {:?}", kind, op, launcher.elapsed);
        Ok(result)
    }

    /// Gradient of each input, reduced to that input's own shape.
    fn local_gradients(
        &self,
        launcher: &mut Launcher<'_, B>,
        saved: &Saved,
        grad: TensorId,
    ) -> Result<Vec<Option<Tensor>>> {
        let g = self.get(grad)?;
        let wants = |i: usize| saved.requires_grad[i];

        let grads = match &saved.state {
            SavedState::Add { plan } => {
                let lhs = wants(0).then(|| plan.reduce_lhs(g.data()));
                let rhs = wants(1).then(|| plan.reduce_rhs(g.data()));
                vec![
                    lhs.map(|d| Tensor::unchecked(d, plan.lhs_shape.clone(), false)),
                    rhs.map(|d| Tensor::unchecked(d, plan.rhs_shape.clone(), false)),
                ]
            }
            SavedState::Mul { lhs, rhs, plan } => {
                let (a, b) = (self.get(*lhs)?, self.get(*rhs)?);
                let mut grads = vec![None, None];
                if wants(0) {
                    let full = launcher.binary(Kernel::Mul, g.data(), &plan.expand_rhs(b.data()))?;
                    grads[0] = Some(Tensor::unchecked(
                        plan.reduce_lhs(&full),
                        plan.lhs_shape.clone(),
                        false,
                    ));
                }
                if wants(1) {
                    let full = launcher.binary(Kernel::Mul, g.data(), &plan.expand_lhs(a.data()))?;
                    grads[1] = Some(Tensor::unchecked(
                        plan.reduce_rhs(&full),
                        plan.rhs_shape.clone(),
                        false,
                    ));
                }
                grads
            }
            SavedState::Div { lhs, rhs, plan } => {
                let (a, b) = (self.get(*lhs)?, self.get(*rhs)?);
                let b_full = plan.expand_rhs(b.data());
                let mut grads = vec![None, None];
                if wants(0) {
                    let full = launcher.binary(Kernel::Div, g.data(), &b_full)?;
                    grads[0] = Some(Tensor::unchecked(
                        plan.reduce_lhs(&full),
                        plan.lhs_shape.clone(),
                        false,
                    ));
                }
                if wants(1) {
                    // -(g * a) / b / b
                    let ga = launcher.binary(Kernel::Mul, g.data(), &plan.expand_lhs(a.data()))?;
                    let once = launcher.binary(Kernel::Div, &ga, &b_full)?;
                    let twice = launcher.binary(Kernel::Div, &once, &b_full)?;
                    let full = launcher.unary(Kernel::Neg, &twice)?;
                    grads[1] = Some(Tensor::unchecked(
                        plan.reduce_rhs(&full),
                        plan.rhs_shape.clone(),
                        false,
                    ));
                }
                grads
            }
            SavedState::MatMul { lhs, rhs } => {
                let (a, b) = (self.get(*lhs)?, self.get(*rhs)?);
                let (m, k) = matrix_dims(a.shape())?;
                let (_, n) = matrix_dims(b.shape())?;
                let mut grads = vec![None, None];
                if wants(0) {
                    // g[m, n] @ bT[n, k]
                    let b_t = b.transpose()?;
                    let data = launcher.matmul(g.data(), b_t.data(), m, n, k)?;
                    grads[0] = Some(Tensor::unchecked(data, a.shape().clone(), false));
                }
                if wants(1) {
                    // aT[k, m] @ g[m, n]
                    let a_t = a.transpose()?;
                    let data = launcher.matmul(a_t.data(), g.data(), k, m, n)?;
                    grads[1] = Some(Tensor::unchecked(data, b.shape().clone(), false));
                }
                grads
            }
            SavedState::Exp { output } => {
                let y = self.get(*output)?;
                let data = launcher.binary(Kernel::Mul, g.data(), y.data())?;
                vec![Some(Tensor::unchecked(data, y.shape().clone(), false))]
            }
            SavedState::Exp2 { output } => {
                let y = self.get(*output)?;
                let ln2 = vec![LN_2; y.numel()];
                let local = launcher.binary(Kernel::Mul, y.data(), &ln2)?;
                let data = launcher.binary(Kernel::Mul, g.data(), &local)?;
                vec![Some(Tensor::unchecked(data, y.shape().clone(), false))]
            }
            SavedState::Ln { input } => {
                let x = self.get(*input)?;
                let data = launcher.binary(Kernel::Div, g.data(), x.data())?;
                vec![Some(Tensor::unchecked(data, x.shape().clone(), false))]
            }
            SavedState::Log2 { input } => {
                let x = self.get(*input)?;
                let ln2 = vec![LN_2; x.numel()];
                let denom = launcher.binary(Kernel::Mul, x.data(), &ln2)?;
                let data = launcher.binary(Kernel::Div, g.data(), &denom)?;
                vec![Some(Tensor::unchecked(data, x.shape().clone(), false))]
            }
            SavedState::Relu { input } => {
                let x = self.get(*input)?;
                let data = launcher.binary(Kernel::ReluBackward, g.data(), x.data())?;
                vec![Some(Tensor::unchecked(data, x.shape().clone(), false))]
            }
        };
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_metadata() {
        assert_eq!(OpKind::MatMul.to_string(), "matmul");
        assert_eq!(OpKind::Relu.arity(), 1);
        assert_eq!(OpKind::Div.arity(), 2);
        for kind in [
            OpKind::Add,
            OpKind::Mul,
            OpKind::Div,
            OpKind::MatMul,
            OpKind::Exp,
            OpKind::Exp2,
            OpKind::Ln,
            OpKind::Log2,
            OpKind::Relu,
        ] {
            assert_eq!(kind.forward_kernel().arity(), kind.arity(), "{kind}");
        }
    }

    #[test]
    fn test_fresh_operation_has_no_edges() {
        let op = Operation::new(OpId(0), OpKind::Mul);
        assert!(!op.is_initialized());
        assert!(!op.is_armed());
        assert!(op.inputs().is_empty());
        assert_eq!(op.output(), None);
        assert!(matches!(
            op.kernel_table(),
            Err(TensorError::UninitializedOperation { op: OpKind::Mul })
        ));
    }
}
