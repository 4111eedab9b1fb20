// Gradient plumbing and diagnostics
//
//   clip           y = clamp(x, -c, c);  gradient passes where |x| <= c
//   clip_gradient  y = x;                gradient clamped to [-c, c]
//   stop_gradient  y = x;                no gradient
//   debug          y = x;                logs the value (and the gradient)

use log::info;
use stoat_core::{
    Backend, BackwardCtx, BinaryOp, CmpOp, ForwardCtx, KeyParam, Operator, Result, Shape,
    TensorMeta, UnaryOp,
};

use crate::util::{expect_inputs, require_numeric, same, scalar};

fn identity_meta(inputs: &[&TensorMeta], op: &'static str) -> Result<TensorMeta> {
    expect_inputs(inputs, 1, op)?;
    Ok(inputs[0].clone())
}

/// Clamp values into `[-c, c]`.
#[derive(Debug, Clone)]
pub struct Clip {
    pub c: f64,
}

impl<B: Backend> Operator<B> for Clip {
    fn name(&self) -> &'static str {
        "clip"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        let meta = identity_meta(inputs, "clip")?;
        require_numeric(&meta, "clip")?;
        Ok(meta)
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let x = ctx.input(0);
        let shape = ctx.input_shape(0);
        let rank0 = Shape::from(());
        let dtype = ctx.output_meta().dtype;
        let hi = scalar::<B>(self.c, dtype, ctx.device())?;
        let lo = scalar::<B>(-self.c, dtype, ctx.device())?;
        let upper = B::binary_op(BinaryOp::Minimum, x, shape, &hi, &rank0)?;
        B::binary_op(BinaryOp::Maximum, &upper, shape, &lo, &rank0)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        if !ctx.needs_grad(0) {
            return Ok(());
        }
        let shape = ctx.input_shape(0);
        let c = scalar::<B>(self.c, ctx.output_meta().dtype, ctx.device())?;
        let mag = B::unary_op(UnaryOp::Abs, ctx.input(0))?;
        let inside = B::cmp_op(CmpOp::Le, &mag, shape, &c, &Shape::from(()))?;
        let dx = same::<B>(BinaryOp::Mul, g, &inside, shape)?;
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.c.into()])
    }
}

/// Identity on the forward pass; clamps the gradient into `[-c, c]`.
#[derive(Debug, Clone)]
pub struct ClipGradient {
    pub c: f64,
}

impl<B: Backend> Operator<B> for ClipGradient {
    fn name(&self) -> &'static str {
        "clip_gradient"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        identity_meta(inputs, "clip_gradient")
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        Ok(ctx.input(0).clone())
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        if !ctx.needs_grad(0) {
            return Ok(());
        }
        let shape = ctx.output_shape();
        let rank0 = Shape::from(());
        let dtype = ctx.output_meta().dtype;
        let hi = scalar::<B>(self.c, dtype, ctx.device())?;
        let lo = scalar::<B>(-self.c, dtype, ctx.device())?;
        let upper = B::binary_op(BinaryOp::Minimum, g, shape, &hi, &rank0)?;
        let dx = B::binary_op(BinaryOp::Maximum, &upper, shape, &lo, &rank0)?;
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.c.into()])
    }
}

/// Identity that blocks gradient flow.
#[derive(Debug, Clone)]
pub struct StopGradient;

impl<B: Backend> Operator<B> for StopGradient {
    fn name(&self) -> &'static str {
        "stop_gradient"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        identity_meta(inputs, "stop_gradient")
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        Ok(ctx.input(0).clone())
    }

    fn backward(&self, _ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        Ok(())
    }

    fn differentiable(&self) -> bool {
        false
    }
}

/// Identity that logs its value when computed and its gradient when
/// backpropagated through.
#[derive(Debug, Clone)]
pub struct DebugOp {
    message: String,
}

impl DebugOp {
    pub fn new(message: impl Into<String>) -> Self {
        DebugOp {
            message: message.into(),
        }
    }
}

impl<B: Backend> Operator<B> for DebugOp {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        identity_meta(inputs, "debug")
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let x = ctx.input(0);
        info!(
            "{} {} value: {:?}",
            self.message,
            ctx.output_meta(),
            B::to_f64_vec(x)?
        );
        Ok(x.clone())
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        info!("{} grad: {:?}", self.message, B::to_f64_vec(g)?);
        ctx.accumulate(0, g.clone())
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.message.as_str().into()])
    }
}
