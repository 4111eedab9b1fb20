// Lambda — Operator built from user closures
//
// For one-off computations that do not deserve a catalogue entry. The output
// shape and dtype are declared up front (the closure cannot be inspected), and
// the graph checks the produced buffer against them. Without a backward
// closure the node contributes no gradient to its inputs.
//
// Two lambdas over the same inputs are never merged: closures have no
// structural identity.

use std::fmt;
use std::sync::Arc;

use crate::backend::{Backend, BackendStorage};
use crate::error::{Error, Result};
use crate::op::{BackwardCtx, ForwardCtx, KeyParam, Operator, TensorMeta};

pub type LambdaForward<B> =
    Arc<dyn Fn(&ForwardCtx<'_, B>) -> Result<<B as Backend>::Storage> + Send + Sync>;

pub type LambdaBackward<B> = Arc<dyn Fn(&mut BackwardCtx<'_, B>) -> Result<()> + Send + Sync>;

/// Operator whose forward (and optionally backward) are closures.
pub struct LambdaOp<B: Backend> {
    meta: TensorMeta,
    num_inputs: usize,
    forward: LambdaForward<B>,
    backward: Option<LambdaBackward<B>>,
}

impl<B: Backend> LambdaOp<B> {
    pub fn new(
        meta: TensorMeta,
        num_inputs: usize,
        forward: LambdaForward<B>,
        backward: Option<LambdaBackward<B>>,
    ) -> Result<Self> {
        meta.shape.validate()?;
        Ok(LambdaOp {
            meta,
            num_inputs,
            forward,
            backward,
        })
    }
}

impl<B: Backend> fmt::Debug for LambdaOp<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LambdaOp")
            .field("meta", &format_args!("{}", self.meta))
            .field("num_inputs", &self.num_inputs)
            .field("has_backward", &self.backward.is_some())
            .finish()
    }
}

impl<B: Backend> Operator<B> for LambdaOp<B> {
    fn name(&self) -> &'static str {
        "lambda"
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        if inputs.len() != self.num_inputs {
            return Err(Error::msg(format!(
                "lambda declared {} inputs, got {}",
                self.num_inputs,
                inputs.len()
            )));
        }
        Ok(self.meta.clone())
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let out = (self.forward)(ctx)?;
        if out.len() != self.meta.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: self.meta.shape.clone(),
                expected: self.meta.elem_count(),
                got: out.len(),
            });
        }
        if out.dtype() != self.meta.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.meta.dtype,
                got: out.dtype(),
            });
        }
        Ok(out)
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        if ctx.output_grad().is_none() {
            return Ok(());
        }
        match &self.backward {
            Some(f) => f(ctx),
            None => Ok(()),
        }
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        None
    }

    fn differentiable(&self) -> bool {
        self.backward.is_some()
    }
}
