//! Reverse-mode traversal: order the graph, then fire each producer's backward once.

use std::collections::HashSet;

use log::debug;

use crate::backend::ComputeBackend;
use crate::error::{Result, ShapeError, TensorError};
use crate::graph::{Graph, TensorId};
use crate::tensor::Tensor;

impl<B: ComputeBackend> Graph<B> {
    /// Backpropagate from a single-element `root`.
    ///
    /// The root's gradient is seeded with ones unless a gradient is already
    /// attached. A root with more than one element and no gradient needs an
    /// explicit seed; use [`Graph::backward_with`].
    pub fn backward(&mut self, root: TensorId) -> Result<()> {
        let tensor = self.get(root)?;
        if !tensor.requires_grad() {
            return Err(TensorError::GradientRequired(root));
        }
        if tensor.grad.is_none() {
            if !tensor.shape().is_scalar() {
                return Err(ShapeError::NonScalarRoot(tensor.shape().clone()).into());
            }
            let seed = Tensor::ones_like(tensor);
            let seed = self.insert(seed);
            self.get_mut(root)?.grad = Some(seed);
        }
        self.propagate(root)
    }

    /// Backpropagate from `root` with upstream gradient `seed` (same shape as `root`).
    pub fn backward_with(&mut self, root: TensorId, seed: TensorId) -> Result<()> {
        if !self.get(root)?.requires_grad() {
            return Err(TensorError::GradientRequired(root));
        }
        self.set_grad(root, seed)?;
        self.propagate(root)
    }

    fn propagate(&mut self, root: TensorId) -> Result<()> {
        let order = self.topological_order(root)?;
        let mut fired = 0usize;
        for &id in &order {
            let tensor = self.get(id)?;
            let (Some(op), Some(grad)) = (tensor.producer, tensor.grad) else {
                continue;
            };
            self.backward_op(op, grad)?;
            fired += 1;
        }
        debug!(
            "backward from {}: {} tensors visited, {} operations fired",
            root,
            order.len(),
            fired
        );
        Ok(())
    }

    /// Tensors reachable from `root`, consumers before producers.
    ///
    /// Edges run from a tensor to the inputs its producer still holds, so the
    /// order stops at leaves and at operations whose backward already ran.
    pub fn topological_order(&self, root: TensorId) -> Result<Vec<TensorId>> {
        self.get(root)?;

        fn dfs<B: ComputeBackend>(
            graph: &Graph<B>,
            id: TensorId,
            visited: &mut HashSet<TensorId>,
            order: &mut Vec<TensorId>,
        ) {
            if !visited.insert(id) {
                return;
            }
            if let Some(op) = graph.tensors[id.0].producer {
                for &input in graph.ops[op.0].inputs() {
                    dfs(graph, input, visited, order);
                }
            }
            order.push(id);
        }

        let mut visited = HashSet::new();
        let mut order = Vec::new();
        dfs(self, root, &mut visited, &mut order);
        order.reverse();
        Ok(order)
    }
}
