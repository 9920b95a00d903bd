//! # fg_tensor - Tensor Autodiff over a Compute Backend
//!
//! This crate provides a reverse-mode automatic differentiation engine for
//! dense `f32` tensors. Forward values and gradients are computed by kernels
//! dispatched through a pluggable [`ComputeBackend`] (host CPU, Metal).
//!
//! ## Overview
//!
//! The core abstractions are:
//! - [`Shape`] and the broadcast resolver in [`shape`]
//! - [`Tensor`] - a dense host buffer with shape and gradient flag
//! - [`ComputeBackend`] - compile and dispatch the kernels in [`Kernel`]
//! - [`Graph`] - arena of tensors and [`Operation`]s, addressed by [`TensorId`] / [`OpId`]
//! - [`OpKind`] - the closed set of differentiable operations
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fg_tensor::prelude::*;
//! use fg_backend_cpu::CpuBackend;
//!
//! let mut g = Graph::new(Arc::new(CpuBackend::new()));
//! let x = g.tensor(vec![2.0], &[1], true)?;
//! let y = g.tensor(vec![3.0], &[1], true)?;
//!
//! // z = ln(x * y + 1)
//! let xy = g.mul(x, y)?;
//! let one = g.scalar(1.0);
//! let sum = g.add(xy, one)?;
//! let z = g.ln(sum)?;
//!
//! g.backward(z)?;
//! let dx = g.grad(x)?.unwrap();
//! ```

pub mod backend;
pub mod backward;
pub mod error;
pub mod graph;
pub mod op;
pub mod shape;
pub mod tensor;

pub use backend::{BackendError, ComputeBackend, Dispatch, Kernel, KernelId};
pub use error::{Result, ShapeError, TensorError};
pub use graph::{Graph, OpId, TensorId};
pub use op::{OpKind, Operation};
pub use shape::{Broadcast, Expansion, Shape};
pub use tensor::{SliceArg, Tensor};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::{ComputeBackend, Kernel};
    pub use crate::error::{Result, ShapeError, TensorError};
    pub use crate::graph::{Graph, OpId, TensorId};
    pub use crate::op::OpKind;
    pub use crate::shape::Shape;
    pub use crate::tensor::{SliceArg, Tensor};
}
