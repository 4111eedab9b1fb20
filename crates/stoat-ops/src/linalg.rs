// Matrix products — dot and batched dot
//
//   Y = scale · op(A) @ op(B),   op(X) = X or Xᵀ (last two axes swapped)
//
// `dot` accepts an A of any rank >= 2 against a matrix B; `bdot` broadcasts
// the leading (batch) axes of both operands. The backward rule works on the
// oriented operands and transposes back when the input was transposed:
//
//   d op(A) = scale · G @ op(B)ᵀ
//   d op(B) = scale · op(A)ᵀ @ G
//
// followed by `accumulate_broadcast`, which sums batch axes an operand was
// broadcast over.

use stoat_core::{
    broadcast_shapes, Backend, BackwardCtx, DType, Error, ForwardCtx, KeyParam, Operator, Result,
    Shape, TensorMeta,
};

use crate::util::{expect_inputs, require_numeric, swap_last_two};

/// Matrix product with optional transposition of either operand and a scalar
/// scale on the result.
#[derive(Debug, Clone)]
pub struct MatMul {
    pub trans_a: bool,
    pub trans_b: bool,
    pub scale: f64,
    /// `bdot` semantics: B may carry batch axes.
    pub batched: bool,
}

impl MatMul {
    pub fn dot(trans_a: bool, trans_b: bool, scale: f64) -> Self {
        MatMul {
            trans_a,
            trans_b,
            scale,
            batched: false,
        }
    }

    pub fn bdot(trans_a: bool, trans_b: bool, scale: f64) -> Self {
        MatMul {
            trans_a,
            trans_b,
            scale,
            batched: true,
        }
    }

    fn op_name(&self) -> &'static str {
        if self.batched {
            "bdot"
        } else {
            "dot"
        }
    }
}

fn oriented_dims(shape: &Shape, trans: bool) -> Vec<usize> {
    let mut dims = shape.dims().to_vec();
    if trans {
        let r = dims.len();
        dims.swap(r - 2, r - 1);
    }
    dims
}

/// The operand as the product sees it.
fn orient<B: Backend>(x: B::Storage, shape: &Shape, trans: bool) -> Result<(B::Storage, Shape)> {
    if trans {
        swap_last_two::<B>(&x, shape)
    } else {
        Ok((x, shape.clone()))
    }
}

impl<B: Backend> Operator<B> for MatMul {
    fn name(&self) -> &'static str {
        self.op_name()
    }

    fn infer(&self, inputs: &[&TensorMeta]) -> Result<TensorMeta> {
        expect_inputs(inputs, 2, self.op_name())?;
        let (a, b) = (inputs[0], inputs[1]);
        for rank in [a.shape.rank(), b.shape.rank()] {
            if rank < 2 {
                return Err(Error::RankMismatch {
                    expected: 2,
                    got: rank,
                });
            }
        }
        if !self.batched && b.shape.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: b.shape.rank(),
            });
        }
        let dtype = DType::promote(a.dtype, b.dtype, self.op_name())?;
        let out = TensorMeta::new(Shape::from(()), dtype);
        require_numeric(&out, self.op_name())?;

        let ad = oriented_dims(&a.shape, self.trans_a);
        let bd = oriented_dims(&b.shape, self.trans_b);
        let (ar, br) = (ad.len(), bd.len());
        let (m, k1) = (ad[ar - 2], ad[ar - 1]);
        let (k2, n) = (bd[br - 2], bd[br - 1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }

        let batch = broadcast_shapes(
            &Shape::new(ad[..ar - 2].to_vec()),
            &Shape::new(bd[..br - 2].to_vec()),
        )?;
        let mut dims = batch.dims().to_vec();
        dims.extend([m, n]);
        Ok(TensorMeta::new(dims, dtype))
    }

    fn forward(&self, ctx: &ForwardCtx<'_, B>) -> Result<B::Storage> {
        let (a, a_shape) = orient::<B>(ctx.input_as_output_dtype(0)?, ctx.input_shape(0), self.trans_a)?;
        let (b, b_shape) = orient::<B>(ctx.input_as_output_dtype(1)?, ctx.input_shape(1), self.trans_b)?;
        let y = B::matmul(&a, &a_shape, &b, &b_shape)?;
        if self.scale == 1.0 {
            Ok(y)
        } else {
            B::affine(&y, self.scale, 0.0)
        }
    }

    fn backward(&self, ctx: &mut BackwardCtx<'_, B>) -> Result<()> {
        let Some(g) = ctx.output_grad() else {
            return Ok(());
        };
        let out_shape = ctx.output_shape();
        let g = if self.scale == 1.0 {
            g.clone()
        } else {
            B::affine(g, self.scale, 0.0)?
        };
        let (a, a_shape) = orient::<B>(ctx.input_as_output_dtype(0)?, ctx.input_shape(0), self.trans_a)?;
        let (b, b_shape) = orient::<B>(ctx.input_as_output_dtype(1)?, ctx.input_shape(1), self.trans_b)?;

        if ctx.needs_grad(0) {
            let (bt, bt_shape) = swap_last_two::<B>(&b, &b_shape)?;
            let da = B::matmul(&g, out_shape, &bt, &bt_shape)?;
            let da_shape = out_shape.with_dim(out_shape.rank() - 1, a_shape.dims()[a_shape.rank() - 1]);
            let (da, da_shape) = if self.trans_a {
                swap_last_two::<B>(&da, &da_shape)?
            } else {
                (da, da_shape)
            };
            ctx.accumulate_broadcast(0, da, &da_shape)?;
        }
        if ctx.needs_grad(1) {
            let (at, at_shape) = swap_last_two::<B>(&a, &a_shape)?;
            let db = B::matmul(&at, &at_shape, &g, out_shape)?;
            let k = b_shape.dims()[b_shape.rank() - 2];
            let db_shape = out_shape.with_dim(out_shape.rank() - 2, k);
            let (db, db_shape) = if self.trans_b {
                swap_last_two::<B>(&db, &db_shape)?
            } else {
                (db, db_shape)
            };
            ctx.accumulate_broadcast(1, db, &db_shape)?;
        }
        Ok(())
    }

    fn key_params(&self) -> Option<Vec<KeyParam>> {
        Some(vec![
            self.trans_a.into(),
            self.trans_b.into(),
            self.scale.into(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::ErrorKind;
    use stoat_cpu::CpuBackend;

    fn infer(op: &MatMul, a: TensorMeta, b: TensorMeta) -> Result<TensorMeta> {
        <MatMul as Operator<CpuBackend>>::infer(op, &[&a, &b])
    }

    #[test]
    fn test_dot_shapes() {
        let out = infer(
            &MatMul::dot(false, false, 1.0),
            TensorMeta::new((2, 3, 4), DType::F32),
            TensorMeta::new((4, 5), DType::F32),
        )
        .unwrap();
        assert_eq!(out.shape, Shape::from((2, 3, 5)));

        let out = infer(
            &MatMul::dot(true, true, 1.0),
            TensorMeta::new((4, 3), DType::F32),
            TensorMeta::new((5, 4), DType::F32),
        )
        .unwrap();
        assert_eq!(out.shape, Shape::from((3, 5)));
    }

    #[test]
    fn test_bdot_broadcasts_batch() {
        let out = infer(
            &MatMul::bdot(false, false, 1.0),
            TensorMeta::new((2, 1, 3, 4), DType::F64),
            TensorMeta::new((5, 4, 6), DType::F64),
        )
        .unwrap();
        assert_eq!(out.shape, Shape::from(vec![2, 5, 3, 6]));
    }

    #[test]
    fn test_dot_errors() {
        let err = infer(
            &MatMul::dot(false, false, 1.0),
            TensorMeta::new((2, 3), DType::F32),
            TensorMeta::new((4, 5), DType::F32),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MatmulShapeMismatch { k1: 3, k2: 4, .. }));

        let err = infer(
            &MatMul::dot(false, false, 1.0),
            TensorMeta::new((2, 3), DType::F32),
            TensorMeta::new((2, 3, 5), DType::F32),
        )
        .unwrap_err();
        assert!(matches!(err, Error::RankMismatch { .. }));

        let err = infer(
            &MatMul::dot(false, false, 1.0),
            TensorMeta::new(3, DType::F32),
            TensorMeta::new((3, 5), DType::F32),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
    }
}
