//! Tensor shapes and the broadcast resolver shared by every binary operation.
//!
//! Broadcasting is deliberately narrow: one operand keeps its shape and the
//! other is expanded onto it in one of four ways (see [`Expansion`]). The same
//! [`Broadcast`] plan expands operands before a kernel runs and reduces the
//! full-shape gradient back onto each operand during backward.

use std::fmt;

use crate::error::ShapeError;

/// A tensor shape (dimensions). Always non-empty with positive dimensions.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a shape, rejecting empty dimension lists and zero-sized axes.
    pub fn new(dims: Vec<usize>) -> Result<Self, ShapeError> {
        if dims.is_empty() || dims.contains(&0) {
            return Err(ShapeError::InvalidDims(dims));
        }
        Ok(Shape(dims))
    }

    /// The single-element shape `[1]`.
    pub fn scalar() -> Self {
        Shape(vec![1])
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Dimension at `idx`, if it exists.
    pub fn dim(&self, idx: usize) -> Option<usize> {
        self.0.get(idx).copied()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// True when the shape holds exactly one element (`[1]`, `[1, 1]`, ...).
    pub fn is_scalar(&self) -> bool {
        self.numel() == 1
    }

    /// `(rows, cols)` for rank-2 shapes.
    pub fn as_matrix(&self) -> Option<(usize, usize)> {
        match self.0.as_slice() {
            &[rows, cols] => Some((rows, cols)),
            _ => None,
        }
    }

    /// Split around `axis` into `(outer, axis_len, inner)` element counts.
    pub(crate) fn split_at_axis(&self, axis: usize) -> Result<(usize, usize, usize), ShapeError> {
        let len = self.dim(axis).ok_or_else(|| ShapeError::Axis {
            axis,
            shape: self.clone(),
        })?;
        let outer = self.0[..axis].iter().product();
        let inner = self.0[axis + 1..].iter().product();
        Ok((outer, len, inner))
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl TryFrom<Vec<usize>> for Shape {
    type Error = ShapeError;

    fn try_from(dims: Vec<usize>) -> Result<Self, Self::Error> {
        Shape::new(dims)
    }
}

impl TryFrom<&[usize]> for Shape {
    type Error = ShapeError;

    fn try_from(dims: &[usize]) -> Result<Self, Self::Error> {
        Shape::new(dims.to_vec())
    }
}

/// How an operand's buffer is laid out over a larger target shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expansion {
    /// Shapes already match.
    Identity,
    /// A single element replicated to every position.
    Scalar,
    /// `[n]` or `[1, n]` repeated as every row of `[m, n]`.
    Rows,
    /// `[n, 1]` repeated across every column of `[n, m]`.
    Columns,
}

impl Expansion {
    /// How `from` expands onto `to`, or `None` if it cannot.
    pub fn between(from: &Shape, to: &Shape) -> Option<Self> {
        if from == to {
            return Some(Expansion::Identity);
        }
        if from.is_scalar() {
            return Some(Expansion::Scalar);
        }
        match (from.dims(), to.dims()) {
            (&[n], &[_, m]) if n == m => Some(Expansion::Rows),
            (&[1, n], &[_, m]) if n == m => Some(Expansion::Rows),
            (&[n, 1], &[rows, _]) if n == rows => Some(Expansion::Columns),
            _ => None,
        }
    }

    /// Materialize `data` (laid out per the source shape) at `to`'s size.
    pub fn expand(self, data: &[f32], to: &Shape) -> Vec<f32> {
        let numel = to.numel();
        match self {
            Expansion::Identity => data.to_vec(),
            Expansion::Scalar => vec![data[0]; numel],
            Expansion::Rows => data.repeat(numel / data.len()),
            Expansion::Columns => {
                let cols = numel / data.len();
                data.iter()
                    .flat_map(|&v| std::iter::repeat(v).take(cols))
                    .collect()
            }
        }
    }

    /// Sum a full-shape gradient back onto the source shape `from`.
    pub fn reduce(self, grad: &[f32], from: &Shape) -> Vec<f32> {
        match self {
            Expansion::Identity => grad.to_vec(),
            Expansion::Scalar => vec![grad.iter().sum(); from.numel()],
            Expansion::Rows => {
                let cols = from.numel();
                let mut out = vec![0.0f32; cols];
                for row in grad.chunks_exact(cols) {
                    for (acc, g) in out.iter_mut().zip(row) {
                        *acc += g;
                    }
                }
                out
            }
            Expansion::Columns => {
                let cols = grad.len() / from.numel();
                grad.chunks_exact(cols).map(|row| row.iter().sum()).collect()
            }
        }
    }
}

/// A resolved binary broadcast: the output shape plus how each side expands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub out: Shape,
    pub lhs_shape: Shape,
    pub rhs_shape: Shape,
    pub lhs: Expansion,
    pub rhs: Expansion,
}

impl Broadcast {
    pub fn expand_lhs(&self, data: &[f32]) -> Vec<f32> {
        self.lhs.expand(data, &self.out)
    }

    pub fn expand_rhs(&self, data: &[f32]) -> Vec<f32> {
        self.rhs.expand(data, &self.out)
    }

    /// Reduce a gradient of shape `out` to the left operand's shape.
    pub fn reduce_lhs(&self, grad: &[f32]) -> Vec<f32> {
        self.lhs.reduce(grad, &self.lhs_shape)
    }

    /// Reduce a gradient of shape `out` to the right operand's shape.
    pub fn reduce_rhs(&self, grad: &[f32]) -> Vec<f32> {
        self.rhs.reduce(grad, &self.rhs_shape)
    }
}

/// Resolve two operand shapes for an element-wise binary kernel.
///
/// The right operand is expanded onto the left when possible, otherwise the
/// left onto the right. Anything else is [`ShapeError::Incompatible`].
pub fn broadcast(lhs: &Shape, rhs: &Shape) -> Result<Broadcast, ShapeError> {
    if let Some(rhs_expansion) = Expansion::between(rhs, lhs) {
        return Ok(Broadcast {
            out: lhs.clone(),
            lhs_shape: lhs.clone(),
            rhs_shape: rhs.clone(),
            lhs: Expansion::Identity,
            rhs: rhs_expansion,
        });
    }
    if let Some(lhs_expansion) = Expansion::between(lhs, rhs) {
        return Ok(Broadcast {
            out: rhs.clone(),
            lhs_shape: lhs.clone(),
            rhs_shape: rhs.clone(),
            lhs: lhs_expansion,
            rhs: Expansion::Identity,
        });
    }
    Err(ShapeError::Incompatible {
        lhs: lhs.clone(),
        rhs: rhs.clone(),
    })
}

/// Validate a matrix product and return `(m, k, n)` for `[m, k] @ [k, n]`.
pub fn matmul_dims(lhs: &Shape, rhs: &Shape) -> Result<(usize, usize, usize), ShapeError> {
    let (m, k) = lhs.as_matrix().ok_or_else(|| ShapeError::NotMatrix {
        op: "matmul",
        shape: lhs.clone(),
    })?;
    let (k2, n) = rhs.as_matrix().ok_or_else(|| ShapeError::NotMatrix {
        op: "matmul",
        shape: rhs.clone(),
    })?;
    if k != k2 {
        return Err(ShapeError::MatMulInner {
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        });
    }
    Ok((m, k, n))
}
