// Shared helpers for operator implementations: thin wrappers over the
// Backend kernels that keep the forward/backward code readable.

use stoat_core::{
    bail, Backend, BackendStorage, BinaryOp, CmpOp, DType, Error, Result, Shape, TensorMeta,
    UnaryOp,
};

/// A rank-0 buffer holding `v`; broadcasts against anything.
pub(crate) fn scalar<B: Backend>(v: f64, dtype: DType, device: &B::Device) -> Result<B::Storage> {
    B::full(&Shape::from(()), v, dtype, device)
}

pub(crate) fn unary<B: Backend>(op: UnaryOp, x: &B::Storage) -> Result<B::Storage> {
    B::unary_op(op, x)
}

/// `lhs op rhs` where both live in `shape` (no broadcasting involved).
pub(crate) fn same<B: Backend>(
    op: BinaryOp,
    lhs: &B::Storage,
    rhs: &B::Storage,
    shape: &Shape,
) -> Result<B::Storage> {
    B::binary_op(op, lhs, shape, rhs, shape)
}

/// 1 where `x > 0`, else 0, in x's dtype.
pub(crate) fn positive_mask<B: Backend>(
    x: &B::Storage,
    shape: &Shape,
    device: &B::Device,
) -> Result<B::Storage> {
    let zero = scalar::<B>(0.0, x.dtype(), device)?;
    B::cmp_op(CmpOp::Gt, x, shape, &zero, &Shape::from(()))
}

/// Swap the last two axes of a contiguous buffer.
pub(crate) fn swap_last_two<B: Backend>(
    x: &B::Storage,
    shape: &Shape,
) -> Result<(B::Storage, Shape)> {
    let rank = shape.rank();
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.swap(rank - 2, rank - 1);
    let mut dims = shape.dims().to_vec();
    dims.swap(rank - 2, rank - 1);
    Ok((B::permute(x, shape, &perm)?, Shape::new(dims)))
}

/// Reject non-float inputs for operators that only make sense on floats.
pub(crate) fn require_float(meta: &TensorMeta, op: &'static str) -> Result<()> {
    if !meta.dtype.is_float() {
        return Err(Error::IncompatibleTypes {
            lhs: meta.dtype,
            rhs: meta.dtype,
            op,
        });
    }
    Ok(())
}

/// Reject Bool inputs for arithmetic.
pub(crate) fn require_numeric(meta: &TensorMeta, op: &'static str) -> Result<()> {
    if meta.dtype == DType::Bool {
        return Err(Error::IncompatibleTypes {
            lhs: meta.dtype,
            rhs: meta.dtype,
            op,
        });
    }
    Ok(())
}

/// Reject index operands that do not hold integers.
pub(crate) fn require_index(meta: &TensorMeta, op: &'static str) -> Result<()> {
    if !meta.dtype.is_int() {
        return Err(Error::IncompatibleTypes {
            lhs: meta.dtype,
            rhs: meta.dtype,
            op,
        });
    }
    Ok(())
}

/// Copy an integer index buffer to the host as positions.
pub(crate) fn host_indices<B: Backend>(x: &B::Storage, op: &'static str) -> Result<Vec<usize>> {
    B::to_f64_vec(x)?
        .into_iter()
        .map(|v| {
            if v < 0.0 {
                bail!("{op}: negative index {v}");
            }
            Ok(v as usize)
        })
        .collect()
}

/// Check the number of inputs an operator received.
pub(crate) fn expect_inputs(inputs: &[&TensorMeta], n: usize, op: &'static str) -> Result<()> {
    if inputs.len() != n {
        bail!("{op} expects {n} input(s), got {}", inputs.len());
    }
    Ok(())
}
