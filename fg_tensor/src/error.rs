//! Error types for graph construction, kernel dispatch and backpropagation.

use thiserror::Error;

use crate::backend::BackendError;
use crate::graph::{OpId, TensorId};
use crate::op::OpKind;
use crate::shape::Shape;

/// Result alias used throughout the crate.
pub type Result<T, E = TensorError> = std::result::Result<T, E>;

/// Top-level error for tensor and autograd operations.
#[derive(Debug, Error)]
pub enum TensorError {
    /// Invalid, mismatched or non-broadcastable shapes.
    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),

    /// An operation ran before its kernels were compiled (or after `release_op`).
    #[error("operation {op} used before its kernels were initialized")]
    UninitializedOperation { op: OpKind },

    /// `backward` ran twice on one operation without a new forward in between.
    #[error("{op} ({id}) was already backpropagated; run forward again first")]
    DoubleBackward { op: OpKind, id: OpId },

    /// `backward` ran on an operation whose forward recorded nothing to differentiate.
    #[error("{op} ({id}) has no recorded inputs to differentiate")]
    NotRecorded { op: OpKind, id: OpId },

    /// `Graph::backward` on a tensor that does not require gradients.
    #[error("backward() called on tensor {0}, which does not require grad")]
    GradientRequired(TensorId),

    /// Wrong number of inputs handed to an operation.
    #[error("{op} takes {expected} inputs, got {got}")]
    Arity {
        op: OpKind,
        expected: usize,
        got: usize,
    },

    #[error("tensor {0} does not belong to this graph")]
    UnknownTensor(TensorId),

    #[error("operation {0} does not belong to this graph")]
    UnknownOperation(OpId),

    /// Kernel compilation or dispatch failed inside the compute backend.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Shape validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("invalid shape {0:?}: expected one or more positive dimensions")]
    InvalidDims(Vec<usize>),

    #[error("data length {len} does not match shape {shape} ({numel} elements)")]
    DataLength {
        len: usize,
        shape: Shape,
        numel: usize,
    },

    #[error("incompatible shapes for broadcasting: {lhs} and {rhs}")]
    Incompatible { lhs: Shape, rhs: Shape },

    #[error("{op} expects a rank-2 tensor, got shape {shape}")]
    NotMatrix { op: &'static str, shape: Shape },

    #[error("matmul inner dimensions differ: {lhs} @ {rhs}")]
    MatMulInner { lhs: Shape, rhs: Shape },

    #[error("gradient of shape {grad} cannot attach to a tensor of shape {expected}")]
    GradientMismatch { expected: Shape, grad: Shape },

    #[error("backward() on output of shape {0} needs an explicit seed gradient")]
    NonScalarRoot(Shape),

    #[error("axis {axis} is out of range for shape {shape}")]
    Axis { axis: usize, shape: Shape },

    #[error("cannot concatenate {lhs} and {rhs} along axis {axis}")]
    Concat { lhs: Shape, rhs: Shape, axis: usize },

    #[error("too many indices for tensor of shape {shape}: got {got}")]
    TooManyIndices { shape: Shape, got: usize },

    #[error("index {index} is out of range for axis {axis} of shape {shape}")]
    Index { index: isize, axis: usize, shape: Shape },

    #[error("slice step cannot be zero")]
    ZeroStep,

    #[error("slice selects no elements along axis {axis} of shape {shape}")]
    EmptySlice { axis: usize, shape: Shape },
}
