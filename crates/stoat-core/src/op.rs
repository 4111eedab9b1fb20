// Operator — The contract every node kind implements
//
// The graph engine knows nothing about what `add`, `dot` or `softmax` do. It
// only relies on four capabilities of each operator:
//
//   infer      — output shape/dtype from input shapes/dtypes + parameters
//   forward    — compute the output buffer from materialized input buffers
//   backward   — accumulate gradient contributions for trainable inputs
//   key_params — parameters that, together with the operator name and the
//                input node ids, identify the node for deduplication
//
// Example: c = a * b
//   infer:    shape = broadcast(a, b), dtype = promote(a, b)
//   forward:  B::binary_op(Mul, a, b)
//   backward: grad_a += reduce_broadcast(grad_c * b)
//             grad_b += reduce_broadcast(grad_c * a)
//
// New operators implement this trait in their own crate and are added to a
// graph through `Graph::add_node`; the core never changes.

use std::fmt;

use crate::backend::{Backend, BackendStorage, BinaryOp, ReduceOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::node::NodeId;
use crate::shape::Shape;

/// Shape and element type of a node's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorMeta {
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        TensorMeta {
            shape: shape.into(),
            dtype,
        }
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.elem_count() * self.dtype.size_in_bytes()
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

/// One hashable operator parameter.
///
/// Floats are keyed by their bit pattern so that `0.5` and `0.5` collapse but
/// `0.0` and `-0.0` do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyParam {
    Int(i64),
    Float(u64),
    Bool(bool),
    Ints(Vec<i64>),
    Shape(Shape),
    DType(DType),
    Str(String),
}

impl From<i64> for KeyParam {
    fn from(v: i64) -> Self {
        KeyParam::Int(v)
    }
}

impl From<isize> for KeyParam {
    fn from(v: isize) -> Self {
        KeyParam::Int(v as i64)
    }
}

impl From<usize> for KeyParam {
    fn from(v: usize) -> Self {
        KeyParam::Int(v as i64)
    }
}

impl From<f64> for KeyParam {
    fn from(v: f64) -> Self {
        KeyParam::Float(v.to_bits())
    }
}

impl From<bool> for KeyParam {
    fn from(v: bool) -> Self {
        KeyParam::Bool(v)
    }
}

impl From<&[usize]> for KeyParam {
    fn from(v: &[usize]) -> Self {
        KeyParam::Ints(v.iter().map(|&i| i as i64).collect())
    }
}

impl From<&[isize]> for KeyParam {
    fn from(v: &[isize]) -> Self {
        KeyParam::Ints(v.iter().map(|&i| i as i64).collect())
    }
}

impl From<Shape> for KeyParam {
    fn from(v: Shape) -> Self {
        KeyParam::Shape(v)
    }
}

impl From<DType> for KeyParam {
    fn from(v: DType) -> Self {
        KeyParam::DType(v)
    }
}

impl From<&str> for KeyParam {
    fn from(v: &str) -> Self {
        KeyParam::Str(v.to_string())
    }
}

/// Identity of a node for common-subexpression elimination: operator kind,
/// operator parameters and the (reference-equal) input nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructuralKey {
    pub op: &'static str,
    pub params: Vec<KeyParam>,
    pub inputs: Vec<NodeId>,
}

/// The polymorphic interface of the operator catalogue.
pub trait Operator<B: Backend>: fmt::Debug + Send + Sync + 'static {
    /// Operator kind, e.g. `"add"`.
    fn name(&self) -> &'static str;

    /// Output shape/dtype for the given inputs. Must be pure.
    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta>;

    /// Compute the output from materialized inputs.
    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage>;

    /// Accumulate gradient contributions for the inputs via
    /// [`BackwardCtx::accumulate`]. Must treat an absent output gradient as
    /// "nothing flowed in" and return without contributing.
    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()>;

    /// Parameters that distinguish two nodes of this kind over the same
    /// inputs. `None` means nodes of this operator are never merged.
    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(Vec::new())
    }

    /// Whether gradients can flow through this operator at all.
    fn differentiable(&self) -> bool {
        true
    }
}

/// Read-only view of the inputs handed to [`Operator::forward`].
pub struct ForwardCtx<'a, B: Backend> {
    device: &'a B::Device,
    inputs: Vec<&'a B::Storage>,
    input_meta: Vec<&'a TensorMeta>,
    output_meta: &'a TensorMeta,
}

impl<'a, B: Backend> ForwardCtx<'a, B> {
    pub fn new(
        device: &'a B::Device,
        inputs: Vec<&'a B::Storage>,
        input_meta: Vec<&'a TensorMeta>,
        output_meta: &'a TensorMeta,
    ) -> Self {
        ForwardCtx {
            device,
            inputs,
            input_meta,
            output_meta,
        }
    }

    pub fn device(&self) -> &'a B::Device {
        self.device
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, i: usize) -> &'a B::Storage {
        self.inputs[i]
    }

    pub fn input_meta(&self, i: usize) -> &'a TensorMeta {
        self.input_meta[i]
    }

    pub fn input_shape(&self, i: usize) -> &'a Shape {
        &self.input_meta[i].shape
    }

    pub fn output_meta(&self) -> &'a TensorMeta {
        self.output_meta
    }

    /// Input `i` converted to the output dtype (a clone if it already matches).
    pub fn input_as_output_dtype(&self, i: usize) -> Result<B::Storage> {
        let dtype = self.output_meta.dtype;
        if self.inputs[i].dtype() == dtype {
            Ok(self.inputs[i].clone())
        } else {
            B::cast(self.inputs[i], dtype, self.device)
        }
    }
}

/// Inputs, output and output gradient handed to [`Operator::backward`],
/// plus the per-input gradient contributions the operator produces.
pub struct BackwardCtx<'a, B: Backend> {
    device: &'a B::Device,
    inputs: Vec<&'a B::Storage>,
    input_meta: Vec<&'a TensorMeta>,
    output: &'a B::Storage,
    output_meta: &'a TensorMeta,
    output_grad: Option<&'a B::Storage>,
    needs_grad: Vec<bool>,
    grads: Vec<Option<B::Storage>>,
}

impl<'a, B: Backend> BackwardCtx<'a, B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &'a B::Device,
        inputs: Vec<&'a B::Storage>,
        input_meta: Vec<&'a TensorMeta>,
        output: &'a B::Storage,
        output_meta: &'a TensorMeta,
        output_grad: Option<&'a B::Storage>,
        needs_grad: Vec<bool>,
    ) -> Self {
        let n = inputs.len();
        BackwardCtx {
            device,
            inputs,
            input_meta,
            output,
            output_meta,
            output_grad,
            needs_grad,
            grads: vec![None; n],
        }
    }

    pub fn device(&self) -> &'a B::Device {
        self.device
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, i: usize) -> &'a B::Storage {
        self.inputs[i]
    }

    pub fn input_meta(&self, i: usize) -> &'a TensorMeta {
        self.input_meta[i]
    }

    pub fn input_shape(&self, i: usize) -> &'a Shape {
        &self.input_meta[i].shape
    }

    /// The node's own forward value.
    pub fn output(&self) -> &'a B::Storage {
        self.output
    }

    pub fn output_meta(&self) -> &'a TensorMeta {
        self.output_meta
    }

    pub fn output_shape(&self) -> &'a Shape {
        &self.output_meta.shape
    }

    /// Gradient flowing into this node, if any.
    pub fn output_grad(&self) -> Option<&'a B::Storage> {
        self.output_grad
    }

    /// Whether input `i` is trainable and wants a contribution.
    pub fn needs_grad(&self, i: usize) -> bool {
        self.needs_grad[i]
    }

    /// Input `i` converted to the output dtype (what the forward pass saw).
    pub fn input_as_output_dtype(&self, i: usize) -> Result<B::Storage> {
        let dtype = self.output_meta.dtype;
        if self.inputs[i].dtype() == dtype {
            Ok(self.inputs[i].clone())
        } else {
            B::cast(self.inputs[i], dtype, self.device)
        }
    }

    /// Add `grad` (exactly the shape of input `i`) to input `i`'s contribution.
    /// Inputs that are not trainable are skipped.
    pub fn accumulate(&mut self, i: usize, grad: B::Storage) -> Result<()> {
        if !self.needs_grad[i] {
            return Ok(());
        }
        let meta = self.input_meta[i];
        if grad.len() != meta.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: meta.shape.clone(),
                expected: meta.elem_count(),
                got: grad.len(),
            });
        }
        let grad = if grad.dtype() != meta.dtype {
            B::cast(&grad, meta.dtype, self.device)?
        } else {
            grad
        };
        self.grads[i] = Some(match self.grads[i].take() {
            Some(existing) => {
                B::binary_op(BinaryOp::Add, &existing, &meta.shape, &grad, &meta.shape)?
            }
            None => grad,
        });
        Ok(())
    }

    /// Like [`accumulate`](Self::accumulate), for a gradient in a broadcast
    /// shape: sums over the broadcast axes first.
    pub fn accumulate_broadcast(
        &mut self,
        i: usize,
        grad: B::Storage,
        grad_shape: &Shape,
    ) -> Result<()> {
        if !self.needs_grad[i] {
            return Ok(());
        }
        let target = self.input_meta[i].shape.clone();
        let reduced = reduce_broadcast_grad::<B>(grad, grad_shape, &target)?;
        self.accumulate(i, reduced)
    }

    pub(crate) fn into_grads(self) -> Vec<Option<B::Storage>> {
        self.grads
    }
}

/// When broadcasting expands a tensor's shape, the backward pass must sum
/// the gradient over the broadcast dimensions to match the original shape.
///
/// For example, if lhs was [1, 4] broadcast to [3, 4]:
///   grad_output is [3, 4], but grad_lhs must be [1, 4] → sum over dim 0
///
/// If lhs was [4] broadcast to [3, 4]:
///   grad_output is [3, 4], grad_lhs must be [4] → sum over dim 0; since
///   buffers are contiguous the [1, 4] result already is the [4] buffer.
pub fn reduce_broadcast_grad<B: Backend>(
    grad: B::Storage,
    grad_shape: &Shape,
    target: &Shape,
) -> Result<B::Storage> {
    let grad_dims = grad_shape.dims();
    let target_dims = target.dims();

    if grad_dims == target_dims {
        return Ok(grad);
    }
    if target_dims.len() > grad_dims.len() {
        return Err(Error::ShapeMismatch {
            expected: target.clone(),
            got: grad_shape.clone(),
        });
    }

    let offset = grad_dims.len() - target_dims.len();
    let mut padded_target = vec![1usize; grad_dims.len()];
    padded_target[offset..].copy_from_slice(target_dims);

    let mut result = grad;
    let mut current = grad_shape.clone();
    for d in 0..grad_dims.len() {
        if padded_target[d] == 1 && grad_dims[d] > 1 {
            result = B::reduce_op(ReduceOp::Sum, &result, &current, d)?;
            current = current.with_dim(d, 1);
        } else if padded_target[d] != grad_dims[d] {
            return Err(Error::ShapeMismatch {
                expected: target.clone(),
                got: grad_shape.clone(),
            });
        }
    }
    Ok(result)
}
