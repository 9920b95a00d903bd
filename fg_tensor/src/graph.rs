//! The graph arena: tensors and operations addressed by index.
//!
//! Tensors point at their producer by [`OpId`] and operations point at their
//! inputs and output by [`TensorId`], so the bidirectional edges never form an
//! ownership cycle. Everything is owned by the [`Graph`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};

use crate::backend::{BackendError, ComputeBackend, Kernel, KernelId};
use crate::error::{Result, ShapeError, TensorError};
use crate::op::{OpKind, Operation};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Index of a tensor inside its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) usize);

impl TensorId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t#{}", self.0)
    }
}

/// Index of an operation inside its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) usize);

impl OpId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// A computation graph bound to one compute backend.
///
/// The backend is shared, not owned: several graphs may dispatch through the
/// same `Arc<B>`.
pub struct Graph<B: ComputeBackend> {
    pub(crate) backend: Arc<B>,
    pub(crate) tensors: Vec<Tensor>,
    pub(crate) ops: Vec<Operation>,
    accumulate: Option<KernelId>,
    pub(crate) elapsed: Duration,
}

impl<B: ComputeBackend> fmt::Debug for Graph<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("backend", &self.backend.name())
            .field("tensors", &self.tensors.len())
            .field("ops", &self.ops.len())
            .field("elapsed", &self.elapsed)
            .finish()
    }
}

impl<B: ComputeBackend> Graph<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Graph {
            backend,
            tensors: Vec::new(),
            ops: Vec::new(),
            accumulate: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Total time the backend spent on kernels dispatched by this graph.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    // === Tensors ===

    /// Add a tensor to the arena as a leaf.
    ///
    /// Any graph edges the tensor carried from another graph are dropped.
    pub fn insert(&mut self, mut tensor: Tensor) -> TensorId {
        tensor.grad = None;
        tensor.producer = None;
        let id = TensorId(self.tensors.len());
        self.tensors.push(tensor);
        id
    }

    /// Build and insert a leaf tensor.
    pub fn tensor(&mut self, data: Vec<f32>, dims: &[usize], requires_grad: bool) -> Result<TensorId> {
        let tensor = Tensor::new(data, dims, requires_grad)?;
        Ok(self.insert(tensor))
    }

    /// Insert a single-element constant.
    pub fn scalar(&mut self, value: f32) -> TensorId {
        self.insert(Tensor::scalar(value, false))
    }

    pub fn get(&self, id: TensorId) -> Result<&Tensor> {
        self.tensors.get(id.0).ok_or(TensorError::UnknownTensor(id))
    }

    pub(crate) fn get_mut(&mut self, id: TensorId) -> Result<&mut Tensor> {
        self.tensors.get_mut(id.0).ok_or(TensorError::UnknownTensor(id))
    }

    pub fn data(&self, id: TensorId) -> Result<&[f32]> {
        Ok(self.get(id)?.data())
    }

    pub fn shape(&self, id: TensorId) -> Result<&Shape> {
        Ok(self.get(id)?.shape())
    }

    /// The accumulated gradient of `id`, if backward reached it.
    pub fn grad(&self, id: TensorId) -> Result<Option<&Tensor>> {
        match self.get(id)?.grad {
            Some(grad) => self.get(grad).map(Some),
            None => Ok(None),
        }
    }

    /// The operation that produced `id`; `None` for leaves.
    pub fn producer(&self, id: TensorId) -> Result<Option<OpId>> {
        Ok(self.get(id)?.producer)
    }

    /// Contribute `grad` to the gradient of `target`.
    ///
    /// The first contribution is stored as is. Later ones are summed with the
    /// existing gradient on the backend and the sum replaces it.
    pub fn set_grad(&mut self, target: TensorId, grad: TensorId) -> Result<()> {
        let expected = self.get(target)?.shape().clone();
        let grad_shape = self.get(grad)?.shape();
        if *grad_shape != expected {
            return Err(ShapeError::GradientMismatch {
                expected,
                grad: grad_shape.clone(),
            }
            .into());
        }

        let Some(existing) = self.get(target)?.grad else {
            self.get_mut(target)?.grad = Some(grad);
            return Ok(());
        };

        let kernel = self.accumulate_kernel()?;
        let len = expected.numel();
        let dispatch = self.backend.dispatch(
            kernel,
            &[len as u32],
            &[self.data(grad)?, self.data(existing)?],
            len,
        )?;
        if dispatch.output.len() != len {
            return Err(BackendError::OutputLength {
                kernel: Kernel::Add,
                expected: len,
                got: dispatch.output.len(),
            }
            .into());
        }
        trace!("accumulated gradient of {} ({} elements)", target, len);
        self.elapsed += dispatch.elapsed;
        let sum = self.insert(Tensor::unchecked(dispatch.output, expected, false));
        self.get_mut(target)?.grad = Some(sum);
        Ok(())
    }

    /// Forget the accumulated gradient of `id`.
    ///
    /// The old gradient tensor stays in the arena; use [`Graph::retain`] to
    /// reclaim it between steps.
    pub fn zero_grad(&mut self, id: TensorId) -> Result<()> {
        self.get_mut(id)?.grad = None;
        Ok(())
    }

    /// Compact the arena down to the tensors in `keep`.
    ///
    /// Kept tensors become leaves again: their values and `requires_grad`
    /// survive, their gradients and producers do not. Every other tensor and
    /// every operation is dropped, so previously issued ids are invalid
    /// afterwards. Returns the new id of each kept tensor, in order; a tensor
    /// listed twice maps to the same new id.
    pub fn retain(&mut self, keep: &[TensorId]) -> Result<Vec<TensorId>> {
        for &id in keep {
            self.get(id)?;
        }
        let before = (self.tensors.len(), self.ops.len());
        let mut old: Vec<Option<Tensor>> = std::mem::take(&mut self.tensors)
            .into_iter()
            .map(Some)
            .collect();
        self.ops.clear();

        let mut remap: Vec<Option<TensorId>> = vec![None; old.len()];
        let mut ids = Vec::with_capacity(keep.len());
        for &id in keep {
            let new_id = match remap[id.0] {
                Some(new_id) => new_id,
                None => {
                    let tensor = old[id.0].take().ok_or(TensorError::UnknownTensor(id))?;
                    let new_id = self.insert(tensor);
                    remap[id.0] = Some(new_id);
                    new_id
                }
            };
            ids.push(new_id);
        }
        debug!(
            "retained {} of {} tensors, dropped {} operations",
            self.tensors.len(),
            before.0,
            before.1
        );
        Ok(ids)
    }

    fn accumulate_kernel(&mut self) -> Result<KernelId> {
        if let Some(kernel) = self.accumulate {
            return Ok(kernel);
        }
        let kernel = self.backend.compile(Kernel::Add)?;
        self.accumulate = Some(kernel);
        Ok(kernel)
    }

    // === Operations ===

    /// Create an operation without compiling its kernels.
    pub fn new_op(&mut self, kind: OpKind) -> OpId {
        let id = OpId(self.ops.len());
        self.ops.push(Operation::new(id, kind));
        id
    }

    /// Compile the kernels `op` needs. Does nothing if already initialized.
    pub fn initialize_op(&mut self, op: OpId) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let operation = self.operation_mut(op)?;
        if operation.is_initialized() {
            return Ok(());
        }
        let kind = operation.kind();
        let kernels = kind
            .kernels()
            .iter()
            .map(|&kernel| Ok((kernel, backend.compile(kernel)?)))
            .collect::<Result<Vec<_>>>()?;
        operation.set_kernels(kernels);
        debug!("initialized {} ({}) on {}", kind, op, backend.name());
        Ok(())
    }

    /// Create and initialize an operation.
    pub fn create_op(&mut self, kind: OpKind) -> Result<OpId> {
        let op = self.new_op(kind);
        self.initialize_op(op)?;
        Ok(op)
    }

    /// Drop the kernel handles of `op`. It must be initialized again before use.
    pub fn release_op(&mut self, op: OpId) -> Result<()> {
        self.operation_mut(op)?.clear_kernels();
        debug!("released {}", op);
        Ok(())
    }

    pub fn operation(&self, op: OpId) -> Result<&Operation> {
        self.ops.get(op.0).ok_or(TensorError::UnknownOperation(op))
    }

    pub(crate) fn operation_mut(&mut self, op: OpId) -> Result<&mut Operation> {
        self.ops.get_mut(op.0).ok_or(TensorError::UnknownOperation(op))
    }

    /// Run a fresh operation of `kind` over `inputs` and return its output.
    pub fn apply(&mut self, kind: OpKind, inputs: &[TensorId]) -> Result<TensorId> {
        let op = self.create_op(kind)?;
        let (output, _) = self.forward(op, inputs)?;
        Ok(output)
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Add, &[a, b])
    }

    pub fn mul(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Mul, &[a, b])
    }

    pub fn div(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Div, &[a, b])
    }

    pub fn matmul(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.apply(OpKind::MatMul, &[a, b])
    }

    pub fn exp(&mut self, x: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Exp, &[x])
    }

    pub fn exp2(&mut self, x: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Exp2, &[x])
    }

    pub fn ln(&mut self, x: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Ln, &[x])
    }

    pub fn log2(&mut self, x: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Log2, &[x])
    }

    pub fn relu(&mut self, x: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Relu, &[x])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(TensorId(4).to_string(), "t#4");
        assert_eq!(OpId(0).to_string(), "op#0");
        assert_eq!(TensorId(4).index(), 4);
        assert_eq!(OpId(7).index(), 7);
    }
}
