// Unary operators — Element-wise math and activations
//
// Each operator maps one input to an output of the same shape and dtype.
// The backward rules use the forward output where that is cheaper than
// recomputing from the input:
//
//   exp      dy/dx = y
//   tanh     dy/dx = 1 - y²
//   sigmoid  dy/dx = y (1 - y)
//   sqrt     dy/dx = 1 / (2y)
//   tan      dy/dx = 1 + y²
//
// Activations with a parameter (swish's beta, prelu's alpha) and the scalar
// affine map `x * mul + add` live here as separate operator kinds so that
// the parameter becomes part of the structural key.

use stoat_core::{
    Backend, BackwardCtx, BinaryOp, ForwardCtx, KeyParam, Operator, Result, TensorMeta, UnaryOp,
};

use crate::util::{
    expect_inputs, positive_mask, require_float, require_numeric, same, unary,
};

/// Which element-wise function a [`Unary`] node computes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryKind {
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Neg,
    Square,
    Abs,
    /// `sqrt(x + eps)`
    Sqrt { eps: f64 },
    Sigmoid,
    Tanh,
    Relu,
}

impl UnaryKind {
    fn name(&self) -> &'static str {
        match self {
            UnaryKind::Exp => "exp",
            UnaryKind::Log => "log",
            UnaryKind::Sin => "sin",
            UnaryKind::Cos => "cos",
            UnaryKind::Tan => "tan",
            UnaryKind::Neg => "neg",
            UnaryKind::Square => "square",
            UnaryKind::Abs => "abs",
            UnaryKind::Sqrt { .. } => "sqrt",
            UnaryKind::Sigmoid => "sigmoid",
            UnaryKind::Tanh => "tanh",
            UnaryKind::Relu => "relu",
        }
    }

    /// Integer inputs make sense for these; the rest need floats.
    fn accepts_integers(&self) -> bool {
        matches!(
            self,
            UnaryKind::Neg | UnaryKind::Square | UnaryKind::Abs | UnaryKind::Relu
        )
    }
}

/// Element-wise unary function.
#[derive(Debug, Clone)]
pub struct Unary {
    kind: UnaryKind,
}

impl Unary {
    pub fn new(kind: UnaryKind) -> Self {
        Unary { kind }
    }

    pub fn kind(&self) -> UnaryKind {
        self.kind
    }
}

impl<B: Backend> Operator<B> for Unary {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 1, self.kind.name())?;
        if self.kind.accepts_integers() {
            require_numeric(inputs[0], self.kind.name())?;
        } else {
            require_float(inputs[0], self.kind.name())?;
        }
        Ok(inputs[0].clone())
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let x = ctx.input(0);
        let op = match self.kind {
            UnaryKind::Exp => UnaryOp::Exp,
            UnaryKind::Log => UnaryOp::Log,
            UnaryKind::Sin => UnaryOp::Sin,
            UnaryKind::Cos => UnaryOp::Cos,
            UnaryKind::Tan => UnaryOp::Tan,
            UnaryKind::Neg => UnaryOp::Neg,
            UnaryKind::Square => UnaryOp::Square,
            UnaryKind::Abs => UnaryOp::Abs,
            UnaryKind::Sqrt { eps } if eps != 0.0 => {
                return B::unary_op(UnaryOp::Sqrt, &B::affine(x, 1.0, eps)?);
            }
            UnaryKind::Sqrt { .. } => UnaryOp::Sqrt,
            UnaryKind::Sigmoid => UnaryOp::Sigmoid,
            UnaryKind::Tanh => UnaryOp::Tanh,
            UnaryKind::Relu => UnaryOp::Relu,
        };
        B::unary_op(op, x)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        if !ctx.needs_grad(0) {
            return Ok(());
        }
        let x = ctx.input(0);
        let y = ctx.output();
        let shape = ctx.input_shape(0);

        let dx = match self.kind {
            UnaryKind::Exp => same::<B>(BinaryOp::Mul, g, y, shape)?,
            UnaryKind::Log => same::<B>(BinaryOp::Div, g, x, shape)?,
            UnaryKind::Sin => same::<B>(BinaryOp::Mul, g, &unary::<B>(UnaryOp::Cos, x)?, shape)?,
            UnaryKind::Cos => {
                let sin = unary::<B>(UnaryOp::Sin, x)?;
                B::affine(&same::<B>(BinaryOp::Mul, g, &sin, shape)?, -1.0, 0.0)?
            }
            UnaryKind::Tan => {
                let sec2 = B::affine(&unary::<B>(UnaryOp::Square, y)?, 1.0, 1.0)?;
                same::<B>(BinaryOp::Mul, g, &sec2, shape)?
            }
            UnaryKind::Neg => B::affine(g, -1.0, 0.0)?,
            UnaryKind::Square => same::<B>(BinaryOp::Mul, g, &B::affine(x, 2.0, 0.0)?, shape)?,
            UnaryKind::Abs => same::<B>(BinaryOp::Mul, g, &unary::<B>(UnaryOp::Sign, x)?, shape)?,
            UnaryKind::Sqrt { .. } => {
                same::<B>(BinaryOp::Div, &B::affine(g, 0.5, 0.0)?, y, shape)?
            }
            UnaryKind::Sigmoid => {
                let one_minus = B::affine(y, -1.0, 1.0)?;
                let dydx = same::<B>(BinaryOp::Mul, y, &one_minus, shape)?;
                same::<B>(BinaryOp::Mul, g, &dydx, shape)?
            }
            UnaryKind::Tanh => {
                let dydx = B::affine(&unary::<B>(UnaryOp::Square, y)?, -1.0, 1.0)?;
                same::<B>(BinaryOp::Mul, g, &dydx, shape)?
            }
            UnaryKind::Relu => {
                let mask = positive_mask::<B>(x, shape, ctx.device())?;
                same::<B>(BinaryOp::Mul, g, &mask, shape)?
            }
        };
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(match self.kind {
            UnaryKind::Sqrt { eps } => vec![eps.into()],
            _ => Vec::new(),
        })
    }
}

/// `x * mul + add` with constant scalars. Backs the scalar arithmetic forms.
#[derive(Debug, Clone)]
pub struct ScalarAffine {
    pub mul: f64,
    pub add: f64,
}

impl<B: Backend> Operator<B> for ScalarAffine {
    fn name(&self) -> &'static str {
        "scalar_affine"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 1, "scalar_affine")?;
        require_numeric(inputs[0], "scalar_affine")?;
        Ok(inputs[0].clone())
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        B::affine(ctx.input(0), self.mul, self.add)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        if ctx.needs_grad(0) {
            let dx = B::affine(g, self.mul, 0.0)?;
            ctx.accumulate(0, dx)?;
        }
        Ok(())
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.mul.into(), self.add.into()])
    }
}

/// Swish: `x * sigmoid(beta * x)`. GELU is approximated as swish with
/// beta = 1.702.
#[derive(Debug, Clone)]
pub struct Swish {
    pub beta: f64,
}

impl Swish {
    fn gate<B: Backend>(&self, x: &B::Storage) -> Result<B::Storage> {
        B::unary_op(UnaryOp::Sigmoid, &B::affine(x, self.beta, 0.0)?)
    }
}

impl<B: Backend> Operator<B> for Swish {
    fn name(&self) -> &'static str {
        "swish"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 1, "swish")?;
        require_float(inputs[0], "swish")?;
        Ok(inputs[0].clone())
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let x = ctx.input(0);
        let s = self.gate::<B>(x)?;
        same::<B>(BinaryOp::Mul, x, &s, ctx.input_shape(0))
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        if !ctx.needs_grad(0) {
            return Ok(());
        }
        // dy/dx = s + beta * y * (1 - s),  s = sigmoid(beta x)
        let shape = ctx.input_shape(0);
        let s = self.gate::<B>(ctx.input(0))?;
        let one_minus = B::affine(&s, -1.0, 1.0)?;
        let t = same::<B>(BinaryOp::Mul, ctx.output(), &one_minus, shape)?;
        let dydx = same::<B>(BinaryOp::Add, &s, &B::affine(&t, self.beta, 0.0)?, shape)?;
        let dx = same::<B>(BinaryOp::Mul, g, &dydx, shape)?;
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.beta.into()])
    }
}

/// Parametric ReLU with a fixed (non-trainable) slope for `x <= 0`.
#[derive(Debug, Clone)]
pub struct PRelu {
    pub alpha: f64,
}

impl PRelu {
    /// 1 where x > 0, alpha elsewhere.
    fn slope<B: Backend>(
        &self,
        x: &B::Storage,
        shape: &stoat_core::Shape,
        device: &B::Device,
    ) -> Result<B::Storage> {
        let mask = positive_mask::<B>(x, shape, device)?;
        B::affine(&mask, 1.0 - self.alpha, self.alpha)
    }
}

impl<B: Backend> Operator<B> for PRelu {
    fn name(&self) -> &'static str {
        "prelu"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 1, "prelu")?;
        require_float(inputs[0], "prelu")?;
        Ok(inputs[0].clone())
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let shape = ctx.input_shape(0);
        let slope = self.slope::<B>(ctx.input(0), shape, ctx.device())?;
        same::<B>(BinaryOp::Mul, ctx.input(0), &slope, shape)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        if !ctx.needs_grad(0) {
            return Ok(());
        }
        let shape = ctx.input_shape(0);
        let slope = self.slope::<B>(ctx.input(0), shape, ctx.device())?;
        let dx = same::<B>(BinaryOp::Mul, g, &slope, shape)?;
        ctx.accumulate(0, dx)
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![self.alpha.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::{DType, ErrorKind};
    use stoat_cpu::CpuBackend;

    #[test]
    fn test_float_only_kinds_reject_integers() {
        let meta = TensorMeta::new((2, 2), DType::I32);
        let exp = Unary::new(UnaryKind::Exp);
        let err = <Unary as Operator<CpuBackend>>::infer(&exp, &[&meta]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);

        let neg = Unary::new(UnaryKind::Neg);
        let out = <Unary as Operator<CpuBackend>>::infer(&neg, &[&meta]).unwrap();
        assert_eq!(out, meta);
    }

    #[test]
    fn test_sqrt_eps_is_part_of_key() {
        let a = Unary::new(UnaryKind::Sqrt { eps: 0.0 });
        let b = Unary::new(UnaryKind::Sqrt { eps: 1e-6 });
        assert_ne!(
            <Unary as Operator<CpuBackend>>::key_params(&a),
            <Unary as Operator<CpuBackend>>::key_params(&b)
        );
    }
}
