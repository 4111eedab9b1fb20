// Shape operators — Permute, reshape, concatenate, slice, gather, cast
//
// These move data without arithmetic. Gradients flow back through the
// inverse movement:
//
//   permute       inverse permutation of the gradient
//   reshape       the gradient buffer unchanged (same element order)
//   concat        narrow the gradient back into one piece per input
//   narrow        scatter the gradient into a zero buffer at [start, start+len)
//   index_select  scatter-add the gradient at the selected indices
//   gather        scatter-add each gradient element at its gathered position
//   cast          the gradient cast back to the input dtype
//
// Axes are stored as given (negative allowed) and normalized against the
// input rank in `infer`, which is where out-of-range axes are reported.
// Indices held in an expression are only known at forward time, so their
// bounds are checked by the backend kernel.

use stoat_core::{
    normalize_axis, Backend, BackwardCtx, DType, Error, ForwardCtx, KeyParam, Operator, Result,
    Shape, TensorMeta,
};

use crate::util::{expect_inputs, host_indices, require_index};

//  Permute

/// Reorder axes: output axis `i` is input axis `axes[i]`.
#[derive(Debug, Clone)]
pub struct Permute {
    axes: Vec<isize>,
}

impl Permute {
    pub fn new(axes: Vec<isize>) -> Self {
        Permute { axes }
    }

    fn resolve(&self, rank: usize) -> Result<Vec<usize>> {
        let invalid = || Error::InvalidPermutation {
            perm: self.axes.clone(),
            rank,
        };
        if self.axes.len() != rank {
            return Err(invalid());
        }
        let mut seen = vec![false; rank];
        let mut perm = Vec::with_capacity(rank);
        for &a in &self.axes {
            let a = normalize_axis(a, rank)?;
            if seen[a] {
                return Err(invalid());
            }
            seen[a] = true;
            perm.push(a);
        }
        Ok(perm)
    }
}

impl<B: Backend> Operator<B> for Permute {
    fn name(&self) -> &'static str {
        "permute"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 1, "permute")?;
        let dims = inputs[0].shape.dims();
        let perm = self.resolve(dims.len())?;
        let out: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();
        Ok(TensorMeta::new(out, inputs[0].dtype))
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let shape = ctx.input_shape(0);
        let perm = self.resolve(shape.rank())?;
        B::permute(ctx.input(0), shape, &perm)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        let perm = self.resolve(ctx.input_shape(0).rank())?;
        let mut inverse = vec![0; perm.len()];
        for (i, &p) in perm.iter().enumerate() {
            inverse[p] = i;
        }
        let dx = B::permute(g, ctx.output_shape(), &inverse)?;
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.axes.as_slice().into()])
    }
}

//  Reshape

/// Same elements in the same order, new shape.
#[derive(Debug, Clone)]
pub struct Reshape {
    shape: Shape,
}

impl Reshape {
    pub fn new(shape: impl Into<Shape>) -> Self {
        Reshape {
            shape: shape.into(),
        }
    }
}

impl<B: Backend> Operator<B> for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 1, "reshape")?;
        self.shape.validate()?;
        let src = inputs[0].elem_count();
        if src != self.shape.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src,
                dst: self.shape.elem_count(),
                dst_shape: self.shape.clone(),
            });
        }
        Ok(TensorMeta::new(self.shape.clone(), inputs[0].dtype))
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        Ok(ctx.input(0).clone())
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        ctx.accumulate(0, g.clone())
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.shape.clone().into()])
    }
}

//  Concat

/// Join inputs along one axis. All other extents must agree.
#[derive(Debug, Clone)]
pub struct Concat {
    axis: isize,
}

impl Concat {
    pub fn new(axis: isize) -> Self {
        Concat { axis }
    }
}

impl<B: Backend> Operator<B> for Concat {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        let first = inputs
            .first()
            .ok_or_else(|| Error::msg("concat needs at least one input"))?;
        let rank = first.shape.rank();
        let axis = normalize_axis(self.axis, rank)?;
        let mut dtype = first.dtype;
        let mut extent = 0;
        for meta in inputs {
            if meta.shape.rank() != rank {
                return Err(Error::RankMismatch {
                    expected: rank,
                    got: meta.shape.rank(),
                });
            }
            let matches = meta
                .shape
                .dims()
                .iter()
                .zip(first.shape.dims())
                .enumerate()
                .all(|(d, (a, b))| d == axis || a == b);
            if !matches {
                return Err(Error::ShapeMismatch {
                    expected: first.shape.with_dim(axis, meta.shape.dims()[axis]),
                    got: meta.shape.clone(),
                });
            }
            dtype = DType::promote(dtype, meta.dtype, "concat")?;
            extent += meta.shape.dims()[axis];
        }
        Ok(TensorMeta::new(first.shape.with_dim(axis, extent), dtype))
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let out = ctx.output_meta();
        let axis = normalize_axis(self.axis, out.shape.rank())?;
        let parts = (0..ctx.num_inputs())
            .map(|i| ctx.input_as_output_dtype(i))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<(&B::Storage, &Shape)> = parts
            .iter()
            .enumerate()
            .map(|(i, s)| (s, ctx.input_shape(i)))
            .collect();
        B::cat(&views, &out.shape, axis)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        let out_shape = ctx.output_shape();
        let axis = normalize_axis(self.axis, out_shape.rank())?;
        let mut start = 0;
        for i in 0..ctx.num_inputs() {
            let len = ctx.input_shape(i).dims()[axis];
            if ctx.needs_grad(i) {
                let piece = B::narrow(g, out_shape, axis, start, len)?;
                ctx.accumulate(i, piece)?;
            }
            start += len;
        }
        Ok(())
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.axis.into()])
    }
}

//  Narrow

/// The slice `[start, start + len)` along one axis.
#[derive(Debug, Clone)]
pub struct Narrow {
    axis: isize,
    start: usize,
    len: usize,
}

impl Narrow {
    pub fn new(axis: isize, start: usize, len: usize) -> Self {
        Narrow { axis, start, len }
    }
}

impl<B: Backend> Operator<B> for Narrow {
    fn name(&self) -> &'static str {
        "narrow"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 1, "narrow")?;
        let shape = &inputs[0].shape;
        let axis = normalize_axis(self.axis, shape.rank())?;
        let extent = shape.dims()[axis];
        if self.len == 0 || self.start + self.len > extent {
            return Err(Error::SliceOutOfBounds {
                axis,
                start: self.start,
                len: self.len,
                extent,
            });
        }
        Ok(TensorMeta::new(shape.with_dim(axis, self.len), inputs[0].dtype))
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, shape.rank())?;
        B::narrow(ctx.input(0), shape, axis, self.start, self.len)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        let in_shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, in_shape.rank())?;
        let indices: Vec<usize> = (self.start..self.start + self.len).collect();
        let dx = B::index_add(g, ctx.output_shape(), in_shape, axis, &indices)?;
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.axis.into(), self.start.into(), self.len.into()])
    }
}

//  IndexSelect

/// Gather entries along one axis; indices may repeat and come in any order.
#[derive(Debug, Clone)]
pub struct IndexSelect {
    axis: isize,
    indices: Vec<usize>,
}

impl IndexSelect {
    pub fn new(axis: isize, indices: Vec<usize>) -> Self {
        IndexSelect { axis, indices }
    }
}

impl<B: Backend> Operator<B> for IndexSelect {
    fn name(&self) -> &'static str {
        "index_select"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 1, "index_select")?;
        let shape = &inputs[0].shape;
        let axis = normalize_axis(self.axis, shape.rank())?;
        let extent = shape.dims()[axis];
        if self.indices.is_empty() {
            return Err(Error::msg("index_select needs at least one index"));
        }
        if let Some(&bad) = self.indices.iter().find(|&&i| i >= extent) {
            return Err(Error::SliceOutOfBounds {
                axis,
                start: bad,
                len: 1,
                extent,
            });
        }
        Ok(TensorMeta::new(
            shape.with_dim(axis, self.indices.len()),
            inputs[0].dtype,
        ))
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, shape.rank())?;
        B::index_select(ctx.input(0), shape, axis, &self.indices)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        let in_shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, in_shape.rank())?;
        let dx = B::index_add(g, ctx.output_shape(), in_shape, axis, &self.indices)?;
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.axis.into(), self.indices.as_slice().into()])
    }
}

/// `index_select` with the indices read from a rank-1 integer expression.
#[derive(Debug, Clone)]
pub struct IndexSelectBy {
    axis: isize,
}

impl IndexSelectBy {
    pub fn new(axis: isize) -> Self {
        IndexSelectBy { axis }
    }
}

impl<B: Backend> Operator<B> for IndexSelectBy {
    fn name(&self) -> &'static str {
        "index_select_by"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 2, "index_select_by")?;
        let (x, idx) = (inputs[0], inputs[1]);
        let axis = normalize_axis(self.axis, x.shape.rank())?;
        require_index(idx, "index_select_by")?;
        if idx.shape.rank() != 1 || idx.shape.elem_count() == 0 {
            return Err(Error::msg(format!(
                "index_select_by needs a non-empty rank-1 index, got {}",
                idx.shape
            )));
        }
        Ok(TensorMeta::new(
            x.shape.with_dim(axis, idx.shape.elem_count()),
            x.dtype,
        ))
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, shape.rank())?;
        let indices = host_indices::<B>(ctx.input(1), "index_select_by")?;
        B::index_select(ctx.input(0), shape, axis, &indices)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        if !ctx.needs_grad(0) {
            return Ok(());
        }
        let in_shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, in_shape.rank())?;
        let indices = host_indices::<B>(ctx.input(1), "index_select_by")?;
        let dx = B::index_add(g, ctx.output_shape(), in_shape, axis, &indices)?;
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.axis.into()])
    }
}

/// Per-element selection along one axis: `y[.., j, ..] = x[.., idx[.., j, ..], ..]`.
/// The index has the rank of `x` and matches it off `axis`.
#[derive(Debug, Clone)]
pub struct Gather {
    axis: isize,
}

impl Gather {
    pub fn new(axis: isize) -> Self {
        Gather { axis }
    }
}

impl<B: Backend> Operator<B> for Gather {
    fn name(&self) -> &'static str {
        "gather"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 2, "gather")?;
        let (x, idx) = (inputs[0], inputs[1]);
        let axis = normalize_axis(self.axis, x.shape.rank())?;
        require_index(idx, "gather")?;
        let k = idx.shape.dims().get(axis).copied().unwrap_or(0);
        let expected = x.shape.with_dim(axis, k);
        if idx.shape != expected || k == 0 {
            return Err(Error::ShapeMismatch {
                expected,
                got: idx.shape.clone(),
            });
        }
        Ok(TensorMeta::new(idx.shape.clone(), x.dtype))
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, shape.rank())?;
        let indices = host_indices::<B>(ctx.input(1), "gather")?;
        B::gather(ctx.input(0), shape, axis, &indices, ctx.input_shape(1))
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        if !ctx.needs_grad(0) {
            return Ok(());
        }
        let in_shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, in_shape.rank())?;
        let indices = host_indices::<B>(ctx.input(1), "gather")?;
        let dx = B::scatter_add(g, ctx.output_shape(), in_shape, axis, &indices)?;
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.axis.into()])
    }
}

//  Cast

/// Element type conversion.
#[derive(Debug, Clone)]
pub struct Cast {
    dtype: DType,
}

impl Cast {
    pub fn new(dtype: DType) -> Self {
        Cast { dtype }
    }
}

impl<B: Backend> Operator<B> for Cast {
    fn name(&self) -> &'static str {
        "cast"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 1, "cast")?;
        Ok(TensorMeta::new(inputs[0].shape.clone(), self.dtype))
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        ctx.input_as_output_dtype(0)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        // accumulate casts back to the input dtype
        ctx.accumulate(0, g.clone())
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.dtype.into()])
    }
}
