//! # stoat-ops
//!
//! The operator catalogue for Stoat expression graphs.
//!
//! Every operator is a plain struct implementing
//! [`Operator`](stoat_core::Operator) for any backend. The [`Ops`] extension
//! trait turns them into expression-building methods on
//! [`Graph`](stoat_core::Graph):
//!
//! ```ignore
//! use stoat_ops::Ops;
//!
//! let h = graph.affine(x, w, b, false, false, 1.0)?;
//! let y = graph.softmax(h, -1)?;
//! ```
//!
//! Building an expression validates shapes and element types immediately;
//! values are computed by `Graph::forward`.

pub mod binary;
pub mod linalg;
pub mod misc;
pub mod movement;
pub mod reduce;
pub mod unary;
mod util;

use std::sync::Arc;

use stoat_core::{
    init, normalize_axis, Backend, BinaryOp, CmpOp, DType, Error, Expr, Graph, Initializer,
    Operator, ReduceOp, Result, Shape, TensorMeta,
};

pub use binary::{Binary, Compare, LogAddExp};
pub use linalg::MatMul;
pub use misc::{Clip, ClipGradient, DebugOp, StopGradient};
pub use movement::{Cast, Concat, Gather, IndexSelect, IndexSelectBy, Narrow, Permute, Reshape};
pub use reduce::{LogSoftmax, LogSumExp, Reduce, Softmax};
pub use unary::{PRelu, ScalarAffine, Swish, Unary, UnaryKind};

/// Slope of `leaky_relu` for negative inputs.
pub const LEAKY_RELU_ALPHA: f64 = 0.01;
/// `gelu(x) ≈ swish(x, 1.702)`.
pub const GELU_BETA: f64 = 1.702;
/// Added to masked-out logits by `softmax_masked`.
pub const MASK_PENALTY: f64 = -99999999.0;

fn single(inputs: &[Expr], op: &'static str) -> Result<Expr> {
    match inputs {
        [x] => Ok(*x),
        _ => Err(Error::unsupported(
            op,
            format!("expects exactly one input, got {}", inputs.len()),
        )),
    }
}

/// Expression-building methods over the operator catalogue.
///
/// Implementors only provide node insertion and metadata lookup; every
/// operator method is derived from those.
pub trait Ops<B: Backend> {
    /// Insert a node computed by `op` over `inputs`.
    fn apply(&mut self, op: impl Operator<B>, inputs: &[Expr]) -> Result<Expr>;

    /// Output shape and dtype of `x`.
    fn meta_of(&self, x: Expr) -> Result<TensorMeta>;

    /// A constant with the shape and dtype of `x`, filled by `init`.
    fn constant_like(&mut self, x: Expr, init: Initializer<B>) -> Result<Expr>;

    /// A rank-0 constant `v` in the dtype of `x`.
    fn scalar_like(&mut self, x: Expr, v: f64) -> Result<Expr>;

    /// `axis` counted from the front of `x`'s shape. Operators are built
    /// with this form so that `-1` and `rank - 1` share one node.
    fn resolve_axis(&self, x: Expr, axis: isize) -> Result<isize> {
        Ok(self.meta_of(x)?.shape.axis(axis)? as isize)
    }

    //  Activations

    fn sigmoid(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Unary::new(UnaryKind::Sigmoid), &[x])
    }

    /// `x * sigmoid(x)`.
    fn swish(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Swish { beta: 1.0 }, &[x])
    }

    /// Sigmoid approximation of GELU.
    fn gelu(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Swish { beta: GELU_BETA }, &[x])
    }

    fn tanh(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Unary::new(UnaryKind::Tanh), &[x])
    }

    fn relu(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Unary::new(UnaryKind::Relu), &[x])
    }

    fn leaky_relu(&mut self, x: Expr) -> Result<Expr> {
        self.apply(
            PRelu {
                alpha: LEAKY_RELU_ALPHA,
            },
            &[x],
        )
    }

    /// ReLU with slope `alpha` below zero.
    fn prelu(&mut self, x: Expr, alpha: f64) -> Result<Expr> {
        self.apply(PRelu { alpha }, &[x])
    }

    //  N-ary forms

    /// Sum of a list of expressions. Only the one-element list is supported.
    fn plus_n(&mut self, xs: &[Expr]) -> Result<Expr> {
        single(xs, "plus")
    }

    fn sigmoid_n(&mut self, xs: &[Expr]) -> Result<Expr> {
        let x = single(xs, "sigmoid")?;
        self.sigmoid(x)
    }

    fn swish_n(&mut self, xs: &[Expr]) -> Result<Expr> {
        let x = single(xs, "swish")?;
        self.swish(x)
    }

    fn gelu_n(&mut self, xs: &[Expr]) -> Result<Expr> {
        let x = single(xs, "gelu")?;
        self.gelu(x)
    }

    fn relu_n(&mut self, xs: &[Expr]) -> Result<Expr> {
        let x = single(xs, "relu")?;
        self.relu(x)
    }

    fn leaky_relu_n(&mut self, xs: &[Expr]) -> Result<Expr> {
        let x = single(xs, "leaky_relu")?;
        self.leaky_relu(x)
    }

    fn prelu_n(&mut self, xs: &[Expr], alpha: f64) -> Result<Expr> {
        let x = single(xs, "prelu")?;
        self.prelu(x, alpha)
    }

    /// `tanh(x₀ + x₁ + …)`.
    fn tanh_n(&mut self, xs: &[Expr]) -> Result<Expr> {
        let (&first, rest) = xs
            .split_first()
            .ok_or_else(|| Error::unsupported("tanh", "expects at least one input"))?;
        let mut sum = first;
        for &x in rest {
            sum = self.add(sum, x)?;
        }
        self.tanh(sum)
    }

    //  Element-wise math

    fn exp(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Unary::new(UnaryKind::Exp), &[x])
    }

    fn log(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Unary::new(UnaryKind::Log), &[x])
    }

    fn sin(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Unary::new(UnaryKind::Sin), &[x])
    }

    fn cos(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Unary::new(UnaryKind::Cos), &[x])
    }

    fn tan(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Unary::new(UnaryKind::Tan), &[x])
    }

    fn neg(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Unary::new(UnaryKind::Neg), &[x])
    }

    /// `sqrt(x + eps)`.
    fn sqrt(&mut self, x: Expr, eps: f64) -> Result<Expr> {
        self.apply(Unary::new(UnaryKind::Sqrt { eps }), &[x])
    }

    fn square(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Unary::new(UnaryKind::Square), &[x])
    }

    fn abs(&mut self, x: Expr) -> Result<Expr> {
        self.apply(Unary::new(UnaryKind::Abs), &[x])
    }

    fn add(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.apply(Binary::new(BinaryOp::Add), &[a, b])
    }

    fn sub(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.apply(Binary::new(BinaryOp::Sub), &[a, b])
    }

    fn mul(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.apply(Binary::new(BinaryOp::Mul), &[a, b])
    }

    fn div(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.apply(Binary::new(BinaryOp::Div), &[a, b])
    }

    fn maximum(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.apply(Binary::new(BinaryOp::Maximum), &[a, b])
    }

    fn minimum(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.apply(Binary::new(BinaryOp::Minimum), &[a, b])
    }

    /// `log(exp(a) + exp(b))`.
    fn logaddexp(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.apply(LogAddExp, &[a, b])
    }

    //  Scalar forms

    fn add_scalar(&mut self, x: Expr, s: f64) -> Result<Expr> {
        self.apply(ScalarAffine { mul: 1.0, add: s }, &[x])
    }

    /// `x - s`
    fn sub_scalar(&mut self, x: Expr, s: f64) -> Result<Expr> {
        self.apply(ScalarAffine { mul: 1.0, add: -s }, &[x])
    }

    /// `s - x`
    fn scalar_sub(&mut self, s: f64, x: Expr) -> Result<Expr> {
        self.apply(ScalarAffine { mul: -1.0, add: s }, &[x])
    }

    fn mul_scalar(&mut self, x: Expr, s: f64) -> Result<Expr> {
        self.apply(ScalarAffine { mul: s, add: 0.0 }, &[x])
    }

    /// `x / s`, rounded exactly like `div` against a constant.
    fn div_scalar(&mut self, x: Expr, s: f64) -> Result<Expr> {
        let c = self.scalar_like(x, s)?;
        self.div(x, c)
    }

    /// `s / x`
    fn scalar_div(&mut self, s: f64, x: Expr) -> Result<Expr> {
        let c = self.scalar_like(x, s)?;
        self.div(c, x)
    }

    fn maximum_scalar(&mut self, x: Expr, s: f64) -> Result<Expr> {
        let c = self.scalar_like(x, s)?;
        self.maximum(x, c)
    }

    fn minimum_scalar(&mut self, x: Expr, s: f64) -> Result<Expr> {
        let c = self.scalar_like(x, s)?;
        self.minimum(x, c)
    }

    //  Comparisons (0/1, not differentiable)

    fn compare(&mut self, op: CmpOp, a: Expr, b: Expr) -> Result<Expr> {
        self.apply(Compare::new(op), &[a, b])
    }

    fn compare_scalar(&mut self, op: CmpOp, x: Expr, s: f64) -> Result<Expr> {
        let c = self.scalar_like(x, s)?;
        self.compare(op, x, c)
    }

    fn lt(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.compare(CmpOp::Lt, a, b)
    }

    fn le(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.compare(CmpOp::Le, a, b)
    }

    fn gt(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.compare(CmpOp::Gt, a, b)
    }

    fn ge(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.compare(CmpOp::Ge, a, b)
    }

    fn eq(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.compare(CmpOp::Eq, a, b)
    }

    fn ne(&mut self, a: Expr, b: Expr) -> Result<Expr> {
        self.compare(CmpOp::Ne, a, b)
    }

    fn lt_scalar(&mut self, x: Expr, s: f64) -> Result<Expr> {
        self.compare_scalar(CmpOp::Lt, x, s)
    }

    fn le_scalar(&mut self, x: Expr, s: f64) -> Result<Expr> {
        self.compare_scalar(CmpOp::Le, x, s)
    }

    fn gt_scalar(&mut self, x: Expr, s: f64) -> Result<Expr> {
        self.compare_scalar(CmpOp::Gt, x, s)
    }

    fn ge_scalar(&mut self, x: Expr, s: f64) -> Result<Expr> {
        self.compare_scalar(CmpOp::Ge, x, s)
    }

    fn eq_scalar(&mut self, x: Expr, s: f64) -> Result<Expr> {
        self.compare_scalar(CmpOp::Eq, x, s)
    }

    fn ne_scalar(&mut self, x: Expr, s: f64) -> Result<Expr> {
        self.compare_scalar(CmpOp::Ne, x, s)
    }

    //  Linear algebra

    /// `scale · op(a) @ op(b)` where `b` is a matrix and `a` has rank >= 2.
    fn dot(&mut self, a: Expr, b: Expr, trans_a: bool, trans_b: bool, scale: f64) -> Result<Expr> {
        self.apply(MatMul::dot(trans_a, trans_b, scale), &[a, b])
    }

    /// Batched product; the leading axes of `a` and `b` broadcast.
    fn bdot(&mut self, a: Expr, b: Expr, trans_a: bool, trans_b: bool, scale: f64) -> Result<Expr> {
        self.apply(MatMul::bdot(trans_a, trans_b, scale), &[a, b])
    }

    /// `dot(a, b) + c` with `c` broadcast over the rows.
    fn affine(
        &mut self,
        a: Expr,
        b: Expr,
        c: Expr,
        trans_a: bool,
        trans_b: bool,
        scale: f64,
    ) -> Result<Expr> {
        let ab = self.dot(a, b, trans_a, trans_b, scale)?;
        self.add(ab, c)
    }

    //  Shape

    /// Swap the last two axes.
    fn transpose(&mut self, x: Expr) -> Result<Expr> {
        let rank = self.meta_of(x)?.shape.rank();
        if rank < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: rank,
            });
        }
        self.swap_axes(x, -2, -1)
    }

    /// Output axis `i` is input axis `axes[i]`.
    fn transpose_axes(&mut self, x: Expr, axes: &[isize]) -> Result<Expr> {
        let axes = axes
            .iter()
            .map(|&a| self.resolve_axis(x, a))
            .collect::<Result<Vec<_>>>()?;
        self.apply(Permute::new(axes), &[x])
    }

    fn swap_axes(&mut self, x: Expr, a: isize, b: isize) -> Result<Expr> {
        let rank = self.meta_of(x)?.shape.rank();
        let (a, b) = (normalize_axis(a, rank)?, normalize_axis(b, rank)?);
        if a == b {
            return Ok(x);
        }
        let mut axes: Vec<isize> = (0..rank as isize).collect();
        axes.swap(a, b);
        self.transpose_axes(x, &axes)
    }

    fn reshape(&mut self, x: Expr, shape: impl Into<Shape>) -> Result<Expr> {
        let shape = shape.into();
        if self.meta_of(x)?.shape == shape {
            return Ok(x);
        }
        self.apply(Reshape::new(shape), &[x])
    }

    /// Collapse to rank 1.
    fn flatten(&mut self, x: Expr) -> Result<Expr> {
        let n = self.meta_of(x)?.elem_count();
        self.reshape(x, n)
    }

    /// Collapse all leading axes: `[.., n] → [m, n]`.
    fn flatten_2d(&mut self, x: Expr) -> Result<Expr> {
        let shape = self.meta_of(x)?.shape;
        let (rows, cols) = match shape.dims().split_last() {
            Some((&last, lead)) => (lead.iter().product::<usize>(), last),
            None => (1, 1),
        };
        self.reshape(x, (rows, cols))
    }

    /// Prepend axes of extent 1 until the rank is at least `n`.
    fn atleast_nd(&mut self, x: Expr, n: usize) -> Result<Expr> {
        let shape = self.meta_of(x)?.shape;
        if shape.rank() >= n {
            return Ok(x);
        }
        let mut dims = vec![1; n - shape.rank()];
        dims.extend_from_slice(shape.dims());
        self.reshape(x, dims)
    }

    fn atleast_1d(&mut self, x: Expr) -> Result<Expr> {
        self.atleast_nd(x, 1)
    }

    fn atleast_2d(&mut self, x: Expr) -> Result<Expr> {
        self.atleast_nd(x, 2)
    }

    fn atleast_3d(&mut self, x: Expr) -> Result<Expr> {
        self.atleast_nd(x, 3)
    }

    fn atleast_4d(&mut self, x: Expr) -> Result<Expr> {
        self.atleast_nd(x, 4)
    }

    fn concatenate(&mut self, xs: &[Expr], axis: isize) -> Result<Expr> {
        let axis = match xs {
            [] => axis,
            [x] => return Ok(*x),
            [x, ..] => self.resolve_axis(*x, axis)?,
        };
        self.apply(Concat::new(axis), xs)
    }

    /// `x` concatenated with itself `repeats` times along `axis`.
    fn repeat(&mut self, x: Expr, repeats: usize, axis: isize) -> Result<Expr> {
        if repeats == 0 {
            return Err(Error::msg("repeat count must be at least 1"));
        }
        self.concatenate(&vec![x; repeats], axis)
    }

    fn narrow(&mut self, x: Expr, axis: isize, start: usize, len: usize) -> Result<Expr> {
        let axis = self.resolve_axis(x, axis)?;
        self.apply(Narrow::new(axis, start, len), &[x])
    }

    fn index_select(&mut self, x: Expr, axis: isize, indices: &[usize]) -> Result<Expr> {
        let axis = self.resolve_axis(x, axis)?;
        self.apply(IndexSelect::new(axis, indices.to_vec()), &[x])
    }

    /// `index_select` with the positions taken from a rank-1 integer
    /// expression, read when the graph is computed.
    fn index_select_by(&mut self, x: Expr, axis: isize, indices: Expr) -> Result<Expr> {
        let axis = self.resolve_axis(x, axis)?;
        self.apply(IndexSelectBy::new(axis), &[x, indices])
    }

    /// Pick one entry along `axis` per index element; `indices` has the
    /// rank of `x` and the same extents off `axis`.
    fn gather(&mut self, x: Expr, axis: isize, indices: Expr) -> Result<Expr> {
        let axis = self.resolve_axis(x, axis)?;
        self.apply(Gather::new(axis), &[x, indices])
    }

    /// Select rows (axis 0) of a matrix.
    fn rows(&mut self, x: Expr, indices: &[usize]) -> Result<Expr> {
        self.index_select(x, 0, indices)
    }

    /// Select columns (last axis).
    fn cols(&mut self, x: Expr, indices: &[usize]) -> Result<Expr> {
        self.index_select(x, -1, indices)
    }

    fn rows_by(&mut self, x: Expr, indices: Expr) -> Result<Expr> {
        self.index_select_by(x, 0, indices)
    }

    fn cols_by(&mut self, x: Expr, indices: Expr) -> Result<Expr> {
        self.index_select_by(x, -1, indices)
    }

    fn cast(&mut self, x: Expr, dtype: DType) -> Result<Expr> {
        if self.meta_of(x)?.dtype == dtype {
            return Ok(x);
        }
        self.apply(Cast::new(dtype), &[x])
    }

    //  Reductions (the reduced axis is kept with extent 1)

    fn reduce(&mut self, op: ReduceOp, x: Expr, axis: isize) -> Result<Expr> {
        let axis = self.resolve_axis(x, axis)?;
        self.apply(Reduce::new(op, axis), &[x])
    }

    fn sum(&mut self, x: Expr, axis: isize) -> Result<Expr> {
        self.reduce(ReduceOp::Sum, x, axis)
    }

    fn mean(&mut self, x: Expr, axis: isize) -> Result<Expr> {
        self.reduce(ReduceOp::Mean, x, axis)
    }

    fn max(&mut self, x: Expr, axis: isize) -> Result<Expr> {
        self.reduce(ReduceOp::Max, x, axis)
    }

    fn min(&mut self, x: Expr, axis: isize) -> Result<Expr> {
        self.reduce(ReduceOp::Min, x, axis)
    }

    fn prod(&mut self, x: Expr, axis: isize) -> Result<Expr> {
        self.reduce(ReduceOp::Prod, x, axis)
    }

    /// Population variance: `mean((x - mean(x))²)`.
    fn var(&mut self, x: Expr, axis: isize) -> Result<Expr> {
        let m = self.mean(x, axis)?;
        let d = self.sub(x, m)?;
        let d2 = self.square(d)?;
        self.mean(d2, axis)
    }

    /// Population standard deviation.
    fn std(&mut self, x: Expr, axis: isize) -> Result<Expr> {
        let v = self.var(x, axis)?;
        self.sqrt(v, 0.0)
    }

    fn logsumexp(&mut self, x: Expr, axis: isize) -> Result<Expr> {
        let axis = self.resolve_axis(x, axis)?;
        self.apply(LogSumExp::new(axis), &[x])
    }

    fn softmax(&mut self, x: Expr, axis: isize) -> Result<Expr> {
        let axis = self.resolve_axis(x, axis)?;
        self.apply(Softmax::new(axis), &[x])
    }

    /// Softmax over the entries where `mask` is 1. `mask` holds 0/1 and
    /// broadcasts against `x`; masked-out logits are pushed down by
    /// [`MASK_PENALTY`] so they receive (numerically) zero weight.
    fn softmax_masked(&mut self, x: Expr, mask: Expr, axis: isize) -> Result<Expr> {
        let off = self.scalar_sub(1.0, mask)?;
        let penalty = self.mul_scalar(off, MASK_PENALTY)?;
        let logits = self.add(x, penalty)?;
        self.softmax(logits, axis)
    }

    fn log_softmax(&mut self, x: Expr, axis: isize) -> Result<Expr> {
        let axis = self.resolve_axis(x, axis)?;
        self.apply(LogSoftmax::new(axis), &[x])
    }

    //  Gradient plumbing

    /// Clamp values into `[-c, c]`.
    fn clip(&mut self, x: Expr, c: f64) -> Result<Expr> {
        self.apply(Clip { c }, &[x])
    }

    /// Identity whose gradient is clamped into `[-c, c]`.
    fn clip_gradient(&mut self, x: Expr, c: f64) -> Result<Expr> {
        self.apply(ClipGradient { c }, &[x])
    }

    fn stop_gradient(&mut self, x: Expr) -> Result<Expr> {
        self.apply(StopGradient, &[x])
    }

    /// Identity that logs `x` (at `info`) whenever it is computed.
    fn debug(&mut self, x: Expr, message: &str) -> Result<Expr> {
        self.apply(DebugOp::new(message), &[x])
    }
}

impl<B: Backend> Ops<B> for Graph<B> {
    fn apply(&mut self, op: impl Operator<B>, inputs: &[Expr]) -> Result<Expr> {
        self.add_node(Arc::new(op), inputs)
    }

    fn meta_of(&self, x: Expr) -> Result<TensorMeta> {
        self.meta(x).cloned()
    }

    fn constant_like(&mut self, x: Expr, init: Initializer<B>) -> Result<Expr> {
        let meta = self.meta(x)?.clone();
        self.constant(meta.shape, init, meta.dtype)
    }

    fn scalar_like(&mut self, x: Expr, v: f64) -> Result<Expr> {
        let dtype = self.meta(x)?.dtype;
        self.constant((), init::from_value::<B>(v), dtype)
    }
}
