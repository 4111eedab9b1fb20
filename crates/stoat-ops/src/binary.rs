// Binary operators — Broadcasting arithmetic and comparisons
//
// Both inputs broadcast to a common shape and are cast to the promoted dtype
// before the kernel runs. Gradients are computed in the output shape/dtype
// and handed to `accumulate_broadcast`, which sums the broadcast axes and
// casts back to each input's dtype.
//
//   add   da = g            db = g
//   sub   da = g            db = -g
//   mul   da = g * b        db = g * a
//   div   da = g / b        db = -g * a / b² = -g * y / b
//   max   da = g * [a >= b] db = g * [a < b]
//   min   da = g * [a <= b] db = g * [a > b]
//
// Comparisons produce 0/1 in the promoted dtype and are not differentiable.

use stoat_core::{
    broadcast_shapes, Backend, BackwardCtx, BinaryOp, CmpOp, DType, ForwardCtx,
    Operator, Result, TensorMeta, UnaryOp,
};

use crate::util::{expect_inputs, require_float, require_numeric, same};

fn infer_broadcast(inputs: &[&TensorMeta], op: &'static str) -> Result<TensorMeta> {
    expect_inputs(inputs, 2, op)?;
    let shape = broadcast_shapes(&inputs[0].shape, &inputs[1].shape)?;
    let dtype = DType::promote(inputs[0].dtype, inputs[1].dtype, op)?;
    Ok(TensorMeta::new(shape, dtype))
}

/// Element-wise binary arithmetic with broadcasting.
#[derive(Debug, Clone)]
pub struct Binary {
    op: BinaryOp,
}

impl Binary {
    pub fn new(op: BinaryOp) -> Self {
        Binary { op }
    }

    fn op_name(op: BinaryOp) -> &'static str {
        match op {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
        }
    }
}

impl<B: Backend> Operator<B> for Binary {
    fn name(&self) -> &'static str {
        Self::op_name(self.op)
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        let meta = infer_broadcast(inputs, Self::op_name(self.op))?;
        require_numeric(&meta, Self::op_name(self.op))?;
        Ok(meta)
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let a = ctx.input_as_output_dtype(0)?;
        let b = ctx.input_as_output_dtype(1)?;
        B::binary_op(self.op, &a, ctx.input_shape(0), &b, ctx.input_shape(1))
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        let out_shape = ctx.output_shape();
        let (a_shape, b_shape) = (ctx.input_shape(0), ctx.input_shape(1));
        let (need_a, need_b) = (ctx.needs_grad(0), ctx.needs_grad(1));

        match self.op {
            BinaryOp::Add => {
                ctx.accumulate_broadcast(0, g.clone(), out_shape)?;
                ctx.accumulate_broadcast(1, g.clone(), out_shape)?;
            }
            BinaryOp::Sub => {
                ctx.accumulate_broadcast(0, g.clone(), out_shape)?;
                if need_b {
                    ctx.accumulate_broadcast(1, B::affine(g, -1.0, 0.0)?, out_shape)?;
                }
            }
            BinaryOp::Mul => {
                let a = ctx.input_as_output_dtype(0)?;
                let b = ctx.input_as_output_dtype(1)?;
                if need_a {
                    let da = B::binary_op(BinaryOp::Mul, g, out_shape, &b, b_shape)?;
                    ctx.accumulate_broadcast(0, da, out_shape)?;
                }
                if need_b {
                    let db = B::binary_op(BinaryOp::Mul, g, out_shape, &a, a_shape)?;
                    ctx.accumulate_broadcast(1, db, out_shape)?;
                }
            }
            BinaryOp::Div => {
                let b = ctx.input_as_output_dtype(1)?;
                if need_a {
                    let da = B::binary_op(BinaryOp::Div, g, out_shape, &b, b_shape)?;
                    ctx.accumulate_broadcast(0, da, out_shape)?;
                }
                if need_b {
                    let gy = same::<B>(BinaryOp::Mul, g, ctx.output(), out_shape)?;
                    let q = B::binary_op(BinaryOp::Div, &gy, out_shape, &b, b_shape)?;
                    ctx.accumulate_broadcast(1, B::affine(&q, -1.0, 0.0)?, out_shape)?;
                }
            }
            BinaryOp::Maximum | BinaryOp::Minimum => {
                let a = ctx.input_as_output_dtype(0)?;
                let b = ctx.input_as_output_dtype(1)?;
                // ties route the gradient to `a`
                let cmp = if self.op == BinaryOp::Maximum {
                    CmpOp::Ge
                } else {
                    CmpOp::Le
                };
                let mask_a = B::cmp_op(cmp, &a, a_shape, &b, b_shape)?;
                if need_a {
                    let da = same::<B>(BinaryOp::Mul, g, &mask_a, out_shape)?;
                    ctx.accumulate_broadcast(0, da, out_shape)?;
                }
                if need_b {
                    let mask_b = B::affine(&mask_a, -1.0, 1.0)?;
                    let db = same::<B>(BinaryOp::Mul, g, &mask_b, out_shape)?;
                    ctx.accumulate_broadcast(1, db, out_shape)?;
                }
            }
        }
        Ok(())
    }
}

/// `log(exp(a) + exp(b))`, computed around the larger argument.
#[derive(Debug, Clone)]
pub struct LogAddExp;

impl<B: Backend> Operator<B> for LogAddExp {
    fn name(&self) -> &'static str {
        "logaddexp"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        let meta = infer_broadcast(inputs, "logaddexp")?;
        require_float(&meta, "logaddexp")?;
        Ok(meta)
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        // m + log(exp(a - m) + exp(b - m)),  m = max(a, b)
        let (a_shape, b_shape) = (ctx.input_shape(0), ctx.input_shape(1));
        let out_shape = &ctx.output_meta().shape;
        let a = ctx.input_as_output_dtype(0)?;
        let b = ctx.input_as_output_dtype(1)?;
        let m = B::binary_op(BinaryOp::Maximum, &a, a_shape, &b, b_shape)?;
        let ea = B::unary_op(
            UnaryOp::Exp,
            &B::binary_op(BinaryOp::Sub, &a, a_shape, &m, out_shape)?,
        )?;
        let eb = B::unary_op(
            UnaryOp::Exp,
            &B::binary_op(BinaryOp::Sub, &b, b_shape, &m, out_shape)?,
        )?;
        let s = B::unary_op(UnaryOp::Log, &same::<B>(BinaryOp::Add, &ea, &eb, out_shape)?)?;
        same::<B>(BinaryOp::Add, &m, &s, out_shape)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        // da = g * exp(a - y),  db = g * exp(b - y)
        let out_shape = ctx.output_shape();
        let y = ctx.output();
        for i in 0..2 {
            if !ctx.needs_grad(i) {
                continue;
            }
            let x = ctx.input_as_output_dtype(i)?;
            let d = B::binary_op(BinaryOp::Sub, &x, ctx.input_shape(i), y, out_shape)?;
            let w = B::unary_op(UnaryOp::Exp, &d)?;
            let dx = same::<B>(BinaryOp::Mul, g, &w, out_shape)?;
            ctx.accumulate_broadcast(i, dx, out_shape)?;
        }
        Ok(())
    }
}

/// Element-wise comparison producing 0/1. Not differentiable.
#[derive(Debug, Clone)]
pub struct Compare {
    op: CmpOp,
}

impl Compare {
    pub fn new(op: CmpOp) -> Self {
        Compare { op }
    }

    fn op_name(op: CmpOp) -> &'static str {
        match op {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
        }
    }
}

impl<B: Backend> Operator<B> for Compare {
    fn name(&self) -> &'static str {
        Self::op_name(self.op)
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        infer_broadcast(inputs, Self::op_name(self.op))
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let a = ctx.input_as_output_dtype(0)?;
        let b = ctx.input_as_output_dtype(1)?;
        B::cmp_op(self.op, &a, ctx.input_shape(0), &b, ctx.input_shape(1))
    }

    fn backward(&self, _ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        Ok(())
    }

    fn differentiable(&self) -> bool {
        false
    }
}
