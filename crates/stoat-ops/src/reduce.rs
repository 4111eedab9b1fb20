// Reductions — sum/mean/max/min/prod, logsumexp, softmax
//
// Every reduction keeps the reduced axis with extent 1, so the output
// broadcasts back against the input without reshaping.
//
//   sum        dx = broadcast(g)
//   mean       dx = broadcast(g) / n
//   max/min    dx = broadcast(g) * [x == y]   (ties all receive g)
//   prod       dx = broadcast(g) * product of the other entries in the slice
//   logsumexp  dx = broadcast(g) * exp(x - y)
//   softmax    dx = y * (g - sum(g * y))
//   logsoftmax dx = g - exp(y) * sum(g)
//
// Softmax-style operators subtract the per-slice maximum before
// exponentiating.

use stoat_core::{
    normalize_axis, Backend, BackwardCtx, BinaryOp, CmpOp, ForwardCtx, KeyParam, Operator,
    ReduceOp, Result, Shape, TensorMeta, UnaryOp,
};

use crate::util::{expect_inputs, require_float, require_numeric, same};

fn reduced_meta(inputs: &[&TensorMeta], axis: isize, op: &'static str) -> Result<TensorMeta> {
    expect_inputs(inputs, 1, op)?;
    let shape = &inputs[0].shape;
    let axis = normalize_axis(axis, shape.rank())?;
    Ok(TensorMeta::new(shape.with_dim(axis, 1), inputs[0].dtype))
}

/// `x - max(x, axis)` and `exp` of it, the stable core of the softmax family.
fn shifted_exp<B: Backend>(
    x: &B::Storage,
    shape: &Shape,
    axis: usize,
) -> Result<(B::Storage, B::Storage)> {
    let m = B::reduce_op(ReduceOp::Max, x, shape, axis)?;
    let shifted = B::binary_op(BinaryOp::Sub, x, shape, &m, &shape.with_dim(axis, 1))?;
    let e = B::unary_op(UnaryOp::Exp, &shifted)?;
    Ok((shifted, e))
}

/// `1` where `x` is zero, `0` elsewhere.
fn is_zero<B: Backend>(x: &B::Storage) -> Result<B::Storage> {
    let nonzero = B::unary_op(UnaryOp::Abs, &B::unary_op(UnaryOp::Sign, x)?)?;
    B::affine(&nonzero, -1.0, 1.0)
}

/// For every entry, the product of the other entries of its slice along
/// `axis`. Zeros are counted rather than divided by: with one zero in a
/// slice only that position gets a nonzero value, with two or more the
/// whole slice is zero.
fn prod_of_others<B: Backend>(x: &B::Storage, shape: &Shape, axis: usize) -> Result<B::Storage> {
    let out_shape = shape.with_dim(axis, 1);
    let z = is_zero::<B>(x)?;
    let x1 = same::<B>(BinaryOp::Add, x, &z, shape)?;
    let p1 = B::reduce_op(ReduceOp::Prod, &x1, shape, axis)?;
    let zeros = B::reduce_op(ReduceOp::Sum, &z, shape, axis)?;

    let others = B::binary_op(BinaryOp::Div, &p1, &out_shape, &x1, shape)?;
    let no_zero = is_zero::<B>(&zeros)?;
    let one_zero = is_zero::<B>(&B::affine(&zeros, 1.0, -1.0)?)?;
    let at_zero = B::binary_op(BinaryOp::Mul, &one_zero, &out_shape, &z, shape)?;
    let weight = B::binary_op(BinaryOp::Add, &no_zero, &out_shape, &at_zero, shape)?;
    same::<B>(BinaryOp::Mul, &others, &weight, shape)
}

/// Reduction along one axis.
#[derive(Debug, Clone)]
pub struct Reduce {
    op: ReduceOp,
    axis: isize,
}

impl Reduce {
    pub fn new(op: ReduceOp, axis: isize) -> Self {
        Reduce { op, axis }
    }

    fn op_name(&self) -> &'static str {
        match self.op {
            ReduceOp::Sum => "sum",
            ReduceOp::Mean => "mean",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
            ReduceOp::Prod => "prod",
        }
    }
}

impl<B: Backend> Operator<B> for Reduce {
    fn name(&self) -> &'static str {
        self.op_name()
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        let meta = reduced_meta(inputs, self.axis, self.op_name())?;
        require_numeric(&meta, self.op_name())?;
        Ok(meta)
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, shape.rank())?;
        B::reduce_op(self.op, ctx.input(0), shape, axis)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        if !ctx.needs_grad(0) {
            return Ok(());
        }
        let in_shape = ctx.input_shape(0);
        let out_shape = ctx.output_shape();
        let axis = normalize_axis(self.axis, in_shape.rank())?;
        let spread = B::broadcast_to(g, out_shape, in_shape)?;

        let dx = match self.op {
            ReduceOp::Sum => spread,
            ReduceOp::Mean => B::affine(&spread, 1.0 / in_shape.dims()[axis] as f64, 0.0)?,
            ReduceOp::Max | ReduceOp::Min => {
                let hit = B::cmp_op(CmpOp::Eq, ctx.input(0), in_shape, ctx.output(), out_shape)?;
                same::<B>(BinaryOp::Mul, &spread, &hit, in_shape)?
            }
            ReduceOp::Prod => {
                let others = prod_of_others::<B>(ctx.input(0), in_shape, axis)?;
                same::<B>(BinaryOp::Mul, &spread, &others, in_shape)?
            }
        };
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.axis.into()])
    }
}

/// `log(sum(exp(x), axis))`.
#[derive(Debug, Clone)]
pub struct LogSumExp {
    axis: isize,
}

impl LogSumExp {
    pub fn new(axis: isize) -> Self {
        LogSumExp { axis }
    }
}

impl<B: Backend> Operator<B> for LogSumExp {
    fn name(&self) -> &'static str {
        "logsumexp"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        let meta = reduced_meta(inputs, self.axis, "logsumexp")?;
        require_float(&meta, "logsumexp")?;
        Ok(meta)
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        // max + log(sum(exp(x - max)))
        let x = ctx.input(0);
        let shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, shape.rank())?;
        let m = B::reduce_op(ReduceOp::Max, x, shape, axis)?;
        let (_, e) = shifted_exp::<B>(x, shape, axis)?;
        let s = B::reduce_op(ReduceOp::Sum, &e, shape, axis)?;
        let ls = B::unary_op(UnaryOp::Log, &s)?;
        same::<B>(BinaryOp::Add, &m, &ls, &ctx.output_meta().shape)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        if !ctx.needs_grad(0) {
            return Ok(());
        }
        let in_shape = ctx.input_shape(0);
        let out_shape = ctx.output_shape();
        let d = B::binary_op(BinaryOp::Sub, ctx.input(0), in_shape, ctx.output(), out_shape)?;
        let w = B::unary_op(UnaryOp::Exp, &d)?;
        let dx = B::binary_op(BinaryOp::Mul, &w, in_shape, g, out_shape)?;
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.axis.into()])
    }
}

/// Normalized exponentials along one axis.
#[derive(Debug, Clone)]
pub struct Softmax {
    axis: isize,
}

impl Softmax {
    pub fn new(axis: isize) -> Self {
        Softmax { axis }
    }
}

impl<B: Backend> Operator<B> for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 1, "softmax")?;
        normalize_axis(self.axis, inputs[0].shape.rank())?;
        require_float(inputs[0], "softmax")?;
        Ok(inputs[0].clone())
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, shape.rank())?;
        let (_, e) = shifted_exp::<B>(ctx.input(0), shape, axis)?;
        let s = B::reduce_op(ReduceOp::Sum, &e, shape, axis)?;
        B::binary_op(BinaryOp::Div, &e, shape, &s, &shape.with_dim(axis, 1))
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        if !ctx.needs_grad(0) {
            return Ok(());
        }
        let shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, shape.rank())?;
        let y = ctx.output();
        let gy = same::<B>(BinaryOp::Mul, g, y, shape)?;
        let dot = B::reduce_op(ReduceOp::Sum, &gy, shape, axis)?;
        let centered = B::binary_op(BinaryOp::Sub, g, shape, &dot, &shape.with_dim(axis, 1))?;
        let dx = same::<B>(BinaryOp::Mul, y, &centered, shape)?;
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.axis.into()])
    }
}

/// `x - logsumexp(x, axis)`.
#[derive(Debug, Clone)]
pub struct LogSoftmax {
    axis: isize,
}

impl LogSoftmax {
    pub fn new(axis: isize) -> Self {
        LogSoftmax { axis }
    }
}

impl<B: Backend> Operator<B> for LogSoftmax {
    fn name(&self) -> &'static str {
        "logsoftmax"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 1, "logsoftmax")?;
        normalize_axis(self.axis, inputs[0].shape.rank())?;
        require_float(inputs[0], "logsoftmax")?;
        Ok(inputs[0].clone())
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, shape.rank())?;
        let (shifted, e) = shifted_exp::<B>(ctx.input(0), shape, axis)?;
        let s = B::reduce_op(ReduceOp::Sum, &e, shape, axis)?;
        let ls = B::unary_op(UnaryOp::Log, &s)?;
        B::binary_op(BinaryOp::Sub, &shifted, shape, &ls, &shape.with_dim(axis, 1))
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        if !ctx.needs_grad(0) {
            return Ok(());
        }
        let shape = ctx.input_shape(0);
        let axis = normalize_axis(self.axis, shape.rank())?;
        let p = B::unary_op(UnaryOp::Exp, ctx.output())?;
        let total = B::reduce_op(ReduceOp::Sum, g, shape, axis)?;
        let scaled = B::binary_op(BinaryOp::Mul, &p, shape, &total, &shape.with_dim(axis, 1))?;
        let dx = same::<B>(BinaryOp::Sub, g, &scaled, shape)?;
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.axis.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::{DType, Error};
    use stoat_cpu::CpuBackend;

    #[test]
    fn test_reduce_keeps_axis() {
        let x = TensorMeta::new((2, 3, 4), DType::F32);
        let out =
            <Reduce as Operator<CpuBackend>>::infer(&Reduce::new(ReduceOp::Sum, -2), &[&x]).unwrap();
        assert_eq!(out.shape, Shape::from((2, 1, 4)));
    }

    #[test]
    fn test_prod_of_others_with_zeros() {
        let shape = Shape::from((3, 3));
        let x = CpuBackend::from_f64_slice(
            &[2.0, 3.0, 4.0, 2.0, 0.0, 5.0, 0.0, 1.0, 0.0],
            DType::F64,
            &stoat_cpu::CpuDevice,
        )
        .unwrap();
        let others = prod_of_others::<CpuBackend>(&x, &shape, 1).unwrap();
        assert_eq!(
            CpuBackend::to_f64_vec(&others).unwrap(),
            vec![12.0, 8.0, 6.0, 0.0, 10.0, 0.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_axis_out_of_range() {
        let x = TensorMeta::new((2, 3), DType::F32);
        let err = <Softmax as Operator<CpuBackend>>::infer(&Softmax::new(2), &[&x]).unwrap_err();
        assert!(matches!(err, Error::AxisOutOfRange { axis: 2, rank: 2 }));
    }

    #[test]
    fn test_softmax_rejects_integers() {
        let x = TensorMeta::new((2, 3), DType::I64);
        assert!(<LogSoftmax as Operator<CpuBackend>>::infer(&LogSoftmax::new(-1), &[&x]).is_err());
    }
}
