//! Dense host tensors: the values stored in a [`Graph`](crate::graph::Graph).

use crate::error::{Result, ShapeError};
use crate::graph::{OpId, TensorId};
use crate::shape::Shape;

/// A dense row-major `f32` tensor.
///
/// `grad` and `producer` are graph edges expressed as arena ids. They are only
/// meaningful once the tensor has been inserted into a graph, and are never
/// copied by the host-side helpers below.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
    requires_grad: bool,
    pub(crate) grad: Option<TensorId>,
    pub(crate) producer: Option<OpId>,
}

impl Tensor {
    /// Build a tensor, checking `data.len()` against the product of `dims`.
    pub fn new(data: Vec<f32>, dims: &[usize], requires_grad: bool) -> Result<Self> {
        let shape = Shape::try_from(dims)?;
        Self::from_parts(data, shape, requires_grad)
    }

    pub fn from_parts(data: Vec<f32>, shape: Shape, requires_grad: bool) -> Result<Self> {
        if data.len() != shape.numel() {
            return Err(ShapeError::DataLength {
                len: data.len(),
                numel: shape.numel(),
                shape,
            }
            .into());
        }
        Ok(Self::unchecked(data, shape, requires_grad))
    }

    pub(crate) fn unchecked(data: Vec<f32>, shape: Shape, requires_grad: bool) -> Self {
        debug_assert_eq!(data.len(), shape.numel());
        Tensor {
            data,
            shape,
            requires_grad,
            grad: None,
            producer: None,
        }
    }

    /// A tensor of `shape` with every element set to `value`.
    pub fn full(shape: Shape, value: f32, requires_grad: bool) -> Self {
        Self::unchecked(vec![value; shape.numel()], shape, requires_grad)
    }

    /// A single-element tensor of shape `[1]`.
    pub fn scalar(value: f32, requires_grad: bool) -> Self {
        Self::full(Shape::scalar(), value, requires_grad)
    }

    /// Ones with `other`'s shape. Never requires grad.
    pub fn ones_like(other: &Tensor) -> Self {
        Self::full(other.shape.clone(), 1.0, false)
    }

    /// Zeros with `other`'s shape. Never requires grad.
    pub fn zeros_like(other: &Tensor) -> Self {
        Self::full(other.shape.clone(), 0.0, false)
    }

    // === Accessors ===

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// The arena id of the accumulated gradient, if any contribution arrived.
    pub fn grad_id(&self) -> Option<TensorId> {
        self.grad
    }

    /// The operation that produced this tensor; `None` for leaves.
    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }

    pub fn is_leaf(&self) -> bool {
        self.producer.is_none()
    }

    /// The value of a single-element tensor.
    pub fn item(&self) -> Option<f32> {
        if self.shape.is_scalar() {
            Some(self.data[0])
        } else {
            None
        }
    }

    // === Host-side transforms ===

    /// Swap the two axes of a matrix: `out[j, i] = self[i, j]`.
    pub fn transpose(&self) -> Result<Tensor> {
        let (rows, cols) = self.shape.as_matrix().ok_or_else(|| ShapeError::NotMatrix {
            op: "transpose",
            shape: self.shape.clone(),
        })?;
        let mut out = vec![0.0f32; self.data.len()];
        for i in 0..rows {
            for j in 0..cols {
                out[j * rows + i] = self.data[i * cols + j];
            }
        }
        let shape = Shape::new(vec![cols, rows])?;
        Ok(Self::unchecked(out, shape, self.requires_grad))
    }

    /// Sum over `axis`, or over every element when `axis` is `None`.
    ///
    /// The reduced axis is removed; reducing the last remaining axis yields
    /// shape `[1]`.
    pub fn sum(&self, axis: Option<usize>) -> Result<Tensor> {
        let Some(axis) = axis else {
            let total = self.data.iter().sum();
            return Ok(Self::scalar(total, self.requires_grad));
        };
        let (outer, len, inner) = self.shape.split_at_axis(axis)?;
        let mut out = vec![0.0f32; outer * inner];
        for o in 0..outer {
            for a in 0..len {
                let base = (o * len + a) * inner;
                for i in 0..inner {
                    out[o * inner + i] += self.data[base + i];
                }
            }
        }
        let mut dims = self.shape.dims().to_vec();
        dims.remove(axis);
        let shape = if dims.is_empty() {
            Shape::scalar()
        } else {
            Shape::new(dims)?
        };
        Ok(Self::unchecked(out, shape, self.requires_grad))
    }

    /// Mean over `axis`, or over every element when `axis` is `None`.
    pub fn mean(&self, axis: Option<usize>) -> Result<Tensor> {
        let count = match axis {
            None => self.numel(),
            Some(axis) => self.shape.split_at_axis(axis)?.1,
        };
        let mut out = self.sum(axis)?;
        let scale = 1.0 / count as f32;
        out.data.iter_mut().for_each(|v| *v *= scale);
        Ok(out)
    }

    /// Join `self` and `other` along `axis`. All other dimensions must match.
    pub fn concat(&self, other: &Tensor, axis: usize) -> Result<Tensor> {
        let mismatch = || ShapeError::Concat {
            lhs: self.shape.clone(),
            rhs: other.shape.clone(),
            axis,
        };
        if self.shape.ndim() != other.shape.ndim() {
            return Err(mismatch().into());
        }
        let (outer, lhs_len, inner) = self.shape.split_at_axis(axis)?;
        let (_, rhs_len, _) = other.shape.split_at_axis(axis)?;
        let same_elsewhere = self
            .shape
            .dims()
            .iter()
            .zip(other.shape.dims())
            .enumerate()
            .all(|(d, (l, r))| d == axis || l == r);
        if !same_elsewhere {
            return Err(mismatch().into());
        }

        let lhs_block = lhs_len * inner;
        let rhs_block = rhs_len * inner;
        let mut out = Vec::with_capacity(self.numel() + other.numel());
        for o in 0..outer {
            out.extend_from_slice(&self.data[o * lhs_block..(o + 1) * lhs_block]);
            out.extend_from_slice(&other.data[o * rhs_block..(o + 1) * rhs_block]);
        }
        let mut dims = self.shape.dims().to_vec();
        dims[axis] = lhs_len + rhs_len;
        Ok(Self::unchecked(
            out,
            Shape::new(dims)?,
            self.requires_grad || other.requires_grad,
        ))
    }

    // === Host-side statistics ===

    fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        let data = self.data.iter().map(|&v| f(v)).collect();
        Self::unchecked(data, self.shape.clone(), self.requires_grad)
    }

    /// Element-wise square root.
    pub fn sqrt(&self) -> Tensor {
        self.map(f32::sqrt)
    }

    /// Element-wise power.
    pub fn pow(&self, exponent: f32) -> Tensor {
        self.map(|v| v.powf(exponent))
    }

    /// Population variance over `axis`, or over every element when `axis` is `None`.
    pub fn variance(&self, axis: Option<usize>) -> Result<Tensor> {
        let mean = self.mean(axis)?;
        let squares = match axis {
            None => {
                let m = mean.data[0];
                self.data.iter().map(|v| (v - m) * (v - m)).collect()
            }
            Some(axis) => {
                let (_, len, inner) = self.shape.split_at_axis(axis)?;
                self.data
                    .iter()
                    .enumerate()
                    .map(|(idx, v)| {
                        let d = v - mean.data[(idx / (len * inner)) * inner + idx % inner];
                        d * d
                    })
                    .collect()
            }
        };
        Self::unchecked(squares, self.shape.clone(), self.requires_grad).mean(axis)
    }

    /// `p`-norm over `axis` (all elements when `None`): `(sum |x|^p)^(1/p)`.
    ///
    /// `p` should be positive.
    pub fn norm(&self, p: f32, axis: Option<usize>) -> Result<Tensor> {
        let powered = self.map(|v| v.abs().powf(p));
        Ok(powered.sum(axis)?.pow(1.0 / p))
    }

    /// Select a sub-tensor, one [`SliceArg`] per leading axis.
    ///
    /// Axes without an argument are kept whole. [`SliceArg::Index`] drops its
    /// axis; dropping every axis yields shape `[1]`.
    pub fn slice(&self, args: &[SliceArg]) -> Result<Tensor> {
        let dims = self.shape.dims();
        if args.len() > dims.len() {
            return Err(ShapeError::TooManyIndices {
                shape: self.shape.clone(),
                got: args.len(),
            }
            .into());
        }

        let mut picks = Vec::with_capacity(dims.len());
        let mut out_dims = Vec::new();
        for (axis, &len) in dims.iter().enumerate() {
            let arg = args.get(axis).copied().unwrap_or(SliceArg::Full);
            let (indices, keep) = arg.resolve(len, axis, &self.shape)?;
            if keep {
                out_dims.push(indices.len());
            }
            picks.push(indices);
        }

        let mut strides = vec![1usize; dims.len()];
        for axis in (0..dims.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * dims[axis + 1];
        }

        let total = picks.iter().map(Vec::len).product();
        let mut out = Vec::with_capacity(total);
        let mut pos = vec![0usize; dims.len()];
        'outer: loop {
            let offset: usize = pos
                .iter()
                .enumerate()
                .map(|(axis, &p)| picks[axis][p] * strides[axis])
                .sum();
            out.push(self.data[offset]);

            let mut axis = dims.len();
            loop {
                if axis == 0 {
                    break 'outer;
                }
                axis -= 1;
                pos[axis] += 1;
                if pos[axis] < picks[axis].len() {
                    break;
                }
                pos[axis] = 0;
            }
        }

        let shape = if out_dims.is_empty() {
            Shape::scalar()
        } else {
            Shape::new(out_dims)?
        };
        Ok(Self::unchecked(out, shape, self.requires_grad))
    }
}

/// One axis of a [`Tensor::slice`] selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceArg {
    /// A single position; the axis is removed. Negative counts from the end.
    Index(isize),
    /// `start..end` every `step`. Missing bounds default to the full axis in
    /// the direction of `step`; negative bounds count from the end.
    Range {
        start: Option<isize>,
        end: Option<isize>,
        step: isize,
    },
    /// The whole axis.
    Full,
}

impl SliceArg {
    pub fn range(start: isize, end: isize) -> Self {
        SliceArg::Range {
            start: Some(start),
            end: Some(end),
            step: 1,
        }
    }

    /// The whole axis every `step` elements; a negative step walks backwards.
    pub fn every(step: isize) -> Self {
        SliceArg::Range {
            start: None,
            end: None,
            step,
        }
    }

    /// Positions selected along an axis of length `len`, and whether the axis survives.
    fn resolve(self, len: usize, axis: usize, shape: &Shape) -> Result<(Vec<usize>, bool)> {
        let n = len as isize;
        let wrap = |v: isize| if v < 0 { v + n } else { v };
        match self {
            SliceArg::Full => Ok(((0..len).collect(), true)),
            SliceArg::Index(index) => {
                let i = wrap(index);
                if i < 0 || i >= n {
                    return Err(ShapeError::Index {
                        index,
                        axis,
                        shape: shape.clone(),
                    }
                    .into());
                }
                Ok((vec![i as usize], false))
            }
            SliceArg::Range { start, end, step } => {
                if step == 0 {
                    return Err(ShapeError::ZeroStep.into());
                }
                let mut picked = Vec::new();
                if step > 0 {
                    let mut i = start.map(wrap).unwrap_or(0).clamp(0, n);
                    let stop = end.map(wrap).unwrap_or(n).clamp(0, n);
                    while i < stop {
                        picked.push(i as usize);
                        i += step;
                    }
                } else {
                    let mut i = start.map(wrap).unwrap_or(n - 1).clamp(-1, n - 1);
                    let stop = end.map(wrap).unwrap_or(-1).clamp(-1, n - 1);
                    while i > stop {
                        picked.push(i as usize);
                        i += step;
                    }
                }
                if picked.is_empty() {
                    return Err(ShapeError::EmptySlice {
                        axis,
                        shape: shape.clone(),
                    }
                    .into());
                }
                Ok((picked, true))
            }
        }
    }
}
