//! Central finite-difference gradients for checking autodiff results.

use std::sync::Arc;

use fg_tensor::{Graph, Result, Tensor, TensorId};

use crate::CpuBackend;

/// Numerically differentiate the summed output of `f` with respect to every
/// element of every input.
///
/// `f` builds its expression in a fresh graph from the inserted `inputs` (in
/// order) and returns the output tensor. Each element is perturbed by `±eps`
/// and the gradient estimated as `(f(x + eps) - f(x - eps)) / 2eps`.
pub fn finite_diff_grad<F>(
    backend: Arc<CpuBackend>,
    f: F,
    inputs: &[Tensor],
    eps: f32,
) -> Result<Vec<Vec<f32>>>
where
    F: Fn(&mut Graph<CpuBackend>, &[TensorId]) -> Result<TensorId>,
{
    let eval = |perturb: Option<(usize, usize, f32)>| -> Result<f32> {
        let mut graph = Graph::new(Arc::clone(&backend));
        let mut ids = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let mut data = input.data().to_vec();
            if let Some((which, elem, delta)) = perturb {
                if which == i {
                    data[elem] += delta;
                }
            }
            let tensor = Tensor::from_parts(data, input.shape().clone(), false)?;
            ids.push(graph.insert(tensor));
        }
        let out = f(&mut graph, &ids)?;
        Ok(graph.data(out)?.iter().sum())
    };

    let mut grads = Vec::with_capacity(inputs.len());
    for (input_idx, input) in inputs.iter().enumerate() {
        let mut input_grads = Vec::with_capacity(input.numel());
        for elem_idx in 0..input.numel() {
            let plus = eval(Some((input_idx, elem_idx, eps)))?;
            let minus = eval(Some((input_idx, elem_idx, -eps)))?;
            input_grads.push((plus - minus) / (2.0 * eps));
        }
        grads.push(input_grads);
    }
    Ok(grads)
}
