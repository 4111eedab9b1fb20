// CPU Backend — Host-memory implementation of the Stoat Backend trait
//
// ARCHITECTURE:
// - CpuDevice is a unit handle (there is one host)
// - CpuStorage is an enum over Vec<T> for each supported dtype
// - Arithmetic kernels convert to f64 at the storage boundary, compute, and
//   convert back to the storage's dtype; F16/BF16 therefore compute in f64
//   and round once on store
// - Data movement (permute, broadcast, narrow, cat, index_select) copies the
//   native element type and never rounds
// - Large element-wise kernels and matmul rows run on the rayon pool (see
//   kernels.rs)
//
// USAGE:
//   let mut graph = Graph::<CpuBackend>::new(CpuDevice);
//   let x = graph.constant((2, 3), init::ones::<CpuBackend>(), DType::F32)?;

pub mod kernels;

use std::fmt;

use half::{bf16, f16};

use stoat_core::backend::{
    Backend, BackendDevice, BackendStorage, BinaryOp, CmpOp, ReduceOp, UnaryOp,
};
use stoat_core::dtype::DType;
use stoat_core::error::{Error, Result};
use stoat_core::shape::{broadcast_shapes, Shape};

// CpuDevice

/// The host. Cheap to copy; every CpuStorage lives here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

// CpuStorage — Host memory for each supported dtype

/// Host-side storage, one variant per dtype. Bool is stored one byte per
/// element (0 or 1).
#[derive(Clone)]
pub enum CpuStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<u8>),
}

/// Apply a generic slice kernel to whichever variant `$storage` holds,
/// keeping the variant.
macro_rules! map_elems {
    ($storage:expr, |$v:ident| $body:expr) => {
        match $storage {
            CpuStorage::F16($v) => CpuStorage::F16($body),
            CpuStorage::BF16($v) => CpuStorage::BF16($body),
            CpuStorage::F32($v) => CpuStorage::F32($body),
            CpuStorage::F64($v) => CpuStorage::F64($body),
            CpuStorage::U8($v) => CpuStorage::U8($body),
            CpuStorage::U32($v) => CpuStorage::U32($body),
            CpuStorage::I32($v) => CpuStorage::I32($body),
            CpuStorage::I64($v) => CpuStorage::I64($body),
            CpuStorage::Bool($v) => CpuStorage::Bool($body),
        }
    };
}

/// Concatenate storages that all hold `$variant`.
macro_rules! cat_variant {
    ($variant:ident, $inputs:expr, $out_shape:expr, $axis:expr, $dtype:expr) => {{
        let mut parts = Vec::with_capacity($inputs.len());
        for (storage, shape) in $inputs {
            match storage {
                CpuStorage::$variant(v) => parts.push((v.as_slice(), shape)),
                other => {
                    return Err(Error::DTypeMismatch {
                        expected: $dtype,
                        got: other.dtype(),
                    })
                }
            }
        }
        CpuStorage::$variant(kernels::cat(&parts, $out_shape, $axis))
    }};
}

impl fmt::Debug for CpuStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuStorage::{:?}(len={})", self.dtype(), self.len())
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::U32(_) => DType::U32,
            CpuStorage::I32(_) => DType::I32,
            CpuStorage::I64(_) => DType::I64,
            CpuStorage::Bool(_) => DType::Bool,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len(),
            CpuStorage::BF16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::U8(v) => v.len(),
            CpuStorage::U32(v) => v.len(),
            CpuStorage::I32(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
            CpuStorage::Bool(v) => v.len(),
        }
    }
}

impl CpuStorage {
    /// Build storage of `dtype` from f64 values. Integer targets truncate
    /// toward zero and saturate; Bool maps non-zero to 1.
    pub fn from_f64_vec(data: Vec<f64>, dtype: DType) -> Self {
        match dtype {
            DType::F16 => CpuStorage::F16(data.iter().map(|&v| f16::from_f64(v)).collect()),
            DType::BF16 => CpuStorage::BF16(data.iter().map(|&v| bf16::from_f64(v)).collect()),
            DType::F32 => CpuStorage::F32(data.iter().map(|&v| v as f32).collect()),
            DType::F64 => CpuStorage::F64(data),
            DType::U8 => CpuStorage::U8(data.iter().map(|&v| v as u8).collect()),
            DType::U32 => CpuStorage::U32(data.iter().map(|&v| v as u32).collect()),
            DType::I32 => CpuStorage::I32(data.iter().map(|&v| v as i32).collect()),
            DType::I64 => CpuStorage::I64(data.iter().map(|&v| v as i64).collect()),
            DType::Bool => CpuStorage::Bool(data.iter().map(|&v| (v != 0.0) as u8).collect()),
        }
    }

    /// Copy all elements out as f64.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            CpuStorage::F16(v) => v.iter().map(|x| x.to_f64()).collect(),
            CpuStorage::BF16(v) => v.iter().map(|x| x.to_f64()).collect(),
            CpuStorage::F32(v) => v.iter().map(|&x| x as f64).collect(),
            CpuStorage::F64(v) => v.clone(),
            CpuStorage::U8(v) | CpuStorage::Bool(v) => v.iter().map(|&x| x as f64).collect(),
            CpuStorage::U32(v) => v.iter().map(|&x| x as f64).collect(),
            CpuStorage::I32(v) => v.iter().map(|&x| x as f64).collect(),
            CpuStorage::I64(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }

    /// The underlying f32 slice (error if the dtype differs).
    pub fn as_f32_slice(&self) -> Result<&[f32]> {
        match self {
            CpuStorage::F32(v) => Ok(v),
            _ => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: self.dtype(),
            }),
        }
    }

    /// The underlying f64 slice (error if the dtype differs).
    pub fn as_f64_slice(&self) -> Result<&[f64]> {
        match self {
            CpuStorage::F64(v) => Ok(v),
            _ => Err(Error::DTypeMismatch {
                expected: DType::F64,
                got: self.dtype(),
            }),
        }
    }
}

impl From<Vec<f32>> for CpuStorage {
    fn from(v: Vec<f32>) -> Self {
        CpuStorage::F32(v)
    }
}

impl From<Vec<f64>> for CpuStorage {
    fn from(v: Vec<f64>) -> Self {
        CpuStorage::F64(v)
    }
}

// Helpers

fn check_len(storage: &CpuStorage, shape: &Shape) -> Result<()> {
    if storage.len() != shape.elem_count() {
        return Err(Error::ElementCountMismatch {
            shape: shape.clone(),
            expected: shape.elem_count(),
            got: storage.len(),
        });
    }
    Ok(())
}

fn check_same_dtype(lhs: &CpuStorage, rhs: &CpuStorage) -> Result<DType> {
    if lhs.dtype() != rhs.dtype() {
        return Err(Error::DTypeMismatch {
            expected: lhs.dtype(),
            got: rhs.dtype(),
        });
    }
    Ok(lhs.dtype())
}

fn check_axis(shape: &Shape, axis: usize) -> Result<()> {
    if axis >= shape.rank() {
        return Err(Error::AxisOutOfRange {
            axis: axis as isize,
            rank: shape.rank(),
        });
    }
    Ok(())
}

fn check_indices(shape: &Shape, axis: usize, indices: &[usize]) -> Result<()> {
    let extent = shape.dims()[axis];
    if let Some(&bad) = indices.iter().find(|&&i| i >= extent) {
        return Err(Error::SliceOutOfBounds {
            axis,
            start: bad,
            len: 1,
            extent,
        });
    }
    Ok(())
}

fn check_gather_shape(
    shape: &Shape,
    index_shape: &Shape,
    axis: usize,
    indices: &[usize],
) -> Result<()> {
    let expected = shape.with_dim(axis, index_shape.dims().get(axis).copied().unwrap_or(0));
    if *index_shape != expected || indices.len() != index_shape.elem_count() {
        return Err(Error::ShapeMismatch {
            expected,
            got: index_shape.clone(),
        });
    }
    Ok(())
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

// CpuBackend — The Backend trait implementation

/// Marker type selecting the CPU kernels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        Self::full(shape, 0.0, dtype, device)
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64_vec(vec![val; shape.elem_count()], dtype))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64_vec(data.to_vec(), dtype))
    }

    fn to_f64_vec(input: &CpuStorage) -> Result<Vec<f64>> {
        Ok(input.to_f64_vec())
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_shape: &Shape,
        rhs: &CpuStorage,
        rhs_shape: &Shape,
    ) -> Result<CpuStorage> {
        let dtype = check_same_dtype(lhs, rhs)?;
        check_len(lhs, lhs_shape)?;
        check_len(rhs, rhs_shape)?;
        let out_shape = broadcast_shapes(lhs_shape, rhs_shape)?;
        let rhs_data = rhs.to_f64_vec();
        if op == BinaryOp::Div && !dtype.is_float() && rhs_data.contains(&0.0) {
            return Err(Error::msg(format!("integer division by zero ({dtype})")));
        }
        let f: fn(f64, f64) -> f64 = match op {
            BinaryOp::Add => |a, b| a + b,
            BinaryOp::Sub => |a, b| a - b,
            BinaryOp::Mul => |a, b| a * b,
            BinaryOp::Div => |a, b| a / b,
            BinaryOp::Maximum => f64::max,
            BinaryOp::Minimum => f64::min,
        };
        let out = kernels::zip_broadcast(
            &lhs.to_f64_vec(),
            lhs_shape,
            &rhs_data,
            rhs_shape,
            &out_shape,
            f,
        );
        Ok(CpuStorage::from_f64_vec(out, dtype))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage) -> Result<CpuStorage> {
        let f: fn(f64) -> f64 = match op {
            UnaryOp::Neg => |x| -x,
            UnaryOp::Abs => f64::abs,
            UnaryOp::Sign => |x| {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            },
            UnaryOp::Exp => f64::exp,
            UnaryOp::Log => f64::ln,
            UnaryOp::Sqrt => f64::sqrt,
            UnaryOp::Square => |x| x * x,
            UnaryOp::Recip => |x| 1.0 / x,
            UnaryOp::Sin => f64::sin,
            UnaryOp::Cos => f64::cos,
            UnaryOp::Tan => f64::tan,
            UnaryOp::Relu => |x| x.max(0.0),
            UnaryOp::Sigmoid => sigmoid,
            UnaryOp::Tanh => f64::tanh,
        };
        let out = kernels::map(&input.to_f64_vec(), f);
        Ok(CpuStorage::from_f64_vec(out, input.dtype()))
    }

    fn affine(input: &CpuStorage, mul: f64, add: f64) -> Result<CpuStorage> {
        let out = kernels::map(&input.to_f64_vec(), |x| x * mul + add);
        Ok(CpuStorage::from_f64_vec(out, input.dtype()))
    }

    fn cmp_op(
        op: CmpOp,
        lhs: &CpuStorage,
        lhs_shape: &Shape,
        rhs: &CpuStorage,
        rhs_shape: &Shape,
    ) -> Result<CpuStorage> {
        let dtype = check_same_dtype(lhs, rhs)?;
        check_len(lhs, lhs_shape)?;
        check_len(rhs, rhs_shape)?;
        let out_shape = broadcast_shapes(lhs_shape, rhs_shape)?;
        let pred: fn(f64, f64) -> bool = match op {
            CmpOp::Eq => |a, b| a == b,
            CmpOp::Ne => |a, b| a != b,
            CmpOp::Gt => |a, b| a > b,
            CmpOp::Ge => |a, b| a >= b,
            CmpOp::Lt => |a, b| a < b,
            CmpOp::Le => |a, b| a <= b,
        };
        let out = kernels::zip_broadcast(
            &lhs.to_f64_vec(),
            lhs_shape,
            &rhs.to_f64_vec(),
            rhs_shape,
            &out_shape,
            |a, b| if pred(a, b) { 1.0 } else { 0.0 },
        );
        Ok(CpuStorage::from_f64_vec(out, dtype))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        shape: &Shape,
        axis: usize,
    ) -> Result<CpuStorage> {
        check_len(input, shape)?;
        check_axis(shape, axis)?;
        let data = input.to_f64_vec();
        let out = match op {
            ReduceOp::Sum => kernels::reduce(&data, shape, axis, 0.0, |a, b| a + b),
            ReduceOp::Mean => {
                let n = shape.dims()[axis] as f64;
                let mut sums = kernels::reduce(&data, shape, axis, 0.0, |a, b| a + b);
                sums.iter_mut().for_each(|s| *s /= n);
                sums
            }
            ReduceOp::Max => kernels::reduce(&data, shape, axis, f64::NEG_INFINITY, f64::max),
            ReduceOp::Min => kernels::reduce(&data, shape, axis, f64::INFINITY, f64::min),
            ReduceOp::Prod => kernels::reduce(&data, shape, axis, 1.0, |a, b| a * b),
        };
        Ok(CpuStorage::from_f64_vec(out, input.dtype()))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_shape: &Shape,
        rhs: &CpuStorage,
        rhs_shape: &Shape,
    ) -> Result<CpuStorage> {
        let dtype = check_same_dtype(lhs, rhs)?;
        check_len(lhs, lhs_shape)?;
        check_len(rhs, rhs_shape)?;
        let (ld, rd) = (lhs_shape.dims(), rhs_shape.dims());
        for rank in [ld.len(), rd.len()] {
            if rank < 2 {
                return Err(Error::RankMismatch {
                    expected: 2,
                    got: rank,
                });
            }
        }
        let (m, k) = (ld[ld.len() - 2], ld[ld.len() - 1]);
        let (k2, n) = (rd[rd.len() - 2], rd[rd.len() - 1]);
        if k != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1: k, k2, n });
        }

        let lb = Shape::new(ld[..ld.len() - 2].to_vec());
        let rb = Shape::new(rd[..rd.len() - 2].to_vec());
        let batch = broadcast_shapes(&lb, &rb)?;
        let ls = lb.broadcast_strides(&batch);
        let rs = rb.broadcast_strides(&batch);
        let offsets: Vec<(usize, usize)> = (0..batch.elem_count())
            .map(|b| {
                (
                    kernels::offset_of(b, batch.dims(), &ls) * m * k,
                    kernels::offset_of(b, batch.dims(), &rs) * k * n,
                )
            })
            .collect();

        let out = kernels::matmul(&lhs.to_f64_vec(), &rhs.to_f64_vec(), &offsets, m, k, n);
        Ok(CpuStorage::from_f64_vec(out, dtype))
    }

    fn permute(input: &CpuStorage, shape: &Shape, perm: &[usize]) -> Result<CpuStorage> {
        check_len(input, shape)?;
        let rank = shape.rank();
        let mut seen = vec![false; rank];
        let valid = perm.len() == rank
            && perm.iter().all(|&p| p < rank && !std::mem::replace(&mut seen[p], true));
        if !valid {
            return Err(Error::InvalidPermutation {
                perm: perm.iter().map(|&p| p as isize).collect(),
                rank,
            });
        }
        let src_strides = shape.stride_contiguous();
        let dims: Vec<usize> = perm.iter().map(|&p| shape.dims()[p]).collect();
        let strides: Vec<usize> = perm.iter().map(|&p| src_strides[p]).collect();
        Ok(map_elems!(input, |v| kernels::strided_copy(v, &dims, &strides, 0)))
    }

    fn broadcast_to(input: &CpuStorage, shape: &Shape, target: &Shape) -> Result<CpuStorage> {
        check_len(input, shape)?;
        if shape.rank() > target.rank() || broadcast_shapes(shape, target)? != *target {
            return Err(Error::ShapeMismatch {
                expected: target.clone(),
                got: shape.clone(),
            });
        }
        let strides = shape.broadcast_strides(target);
        Ok(map_elems!(input, |v| kernels::strided_copy(
            v,
            target.dims(),
            &strides,
            0
        )))
    }

    fn narrow(
        input: &CpuStorage,
        shape: &Shape,
        axis: usize,
        start: usize,
        len: usize,
    ) -> Result<CpuStorage> {
        check_len(input, shape)?;
        check_axis(shape, axis)?;
        let extent = shape.dims()[axis];
        if len == 0 || start + len > extent {
            return Err(Error::SliceOutOfBounds {
                axis,
                start,
                len,
                extent,
            });
        }
        let strides = shape.stride_contiguous();
        let dims = shape.with_dim(axis, len);
        let base = start * strides[axis];
        Ok(map_elems!(input, |v| kernels::strided_copy(
            v,
            dims.dims(),
            &strides,
            base
        )))
    }

    fn cat(
        inputs: &[(&CpuStorage, &Shape)],
        out_shape: &Shape,
        axis: usize,
    ) -> Result<CpuStorage> {
        let first = inputs
            .first()
            .ok_or_else(|| Error::msg("cat needs at least one input"))?;
        check_axis(out_shape, axis)?;
        for (storage, shape) in inputs {
            check_len(storage, shape)?;
        }
        let dtype = first.0.dtype();
        let inputs: Vec<(&CpuStorage, &Shape)> = inputs.to_vec();
        Ok(match dtype {
            DType::F16 => cat_variant!(F16, inputs, out_shape, axis, dtype),
            DType::BF16 => cat_variant!(BF16, inputs, out_shape, axis, dtype),
            DType::F32 => cat_variant!(F32, inputs, out_shape, axis, dtype),
            DType::F64 => cat_variant!(F64, inputs, out_shape, axis, dtype),
            DType::U8 => cat_variant!(U8, inputs, out_shape, axis, dtype),
            DType::U32 => cat_variant!(U32, inputs, out_shape, axis, dtype),
            DType::I32 => cat_variant!(I32, inputs, out_shape, axis, dtype),
            DType::I64 => cat_variant!(I64, inputs, out_shape, axis, dtype),
            DType::Bool => cat_variant!(Bool, inputs, out_shape, axis, dtype),
        })
    }

    fn index_select(
        input: &CpuStorage,
        shape: &Shape,
        axis: usize,
        indices: &[usize],
    ) -> Result<CpuStorage> {
        check_len(input, shape)?;
        check_axis(shape, axis)?;
        check_indices(shape, axis, indices)?;
        Ok(map_elems!(input, |v| kernels::index_select(
            v, shape, axis, indices
        )))
    }

    fn index_add(
        src: &CpuStorage,
        src_shape: &Shape,
        out_shape: &Shape,
        axis: usize,
        indices: &[usize],
    ) -> Result<CpuStorage> {
        check_len(src, src_shape)?;
        check_axis(out_shape, axis)?;
        check_indices(out_shape, axis, indices)?;
        let expected = out_shape.with_dim(axis, indices.len());
        if *src_shape != expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: src_shape.clone(),
            });
        }
        let out = kernels::index_add(&src.to_f64_vec(), out_shape, axis, indices);
        Ok(CpuStorage::from_f64_vec(out, src.dtype()))
    }

    fn gather(
        input: &CpuStorage,
        shape: &Shape,
        axis: usize,
        indices: &[usize],
        index_shape: &Shape,
    ) -> Result<CpuStorage> {
        check_len(input, shape)?;
        check_axis(shape, axis)?;
        check_gather_shape(shape, index_shape, axis, indices)?;
        check_indices(shape, axis, indices)?;
        Ok(map_elems!(input, |v| kernels::gather(
            v,
            shape,
            axis,
            indices,
            index_shape
        )))
    }

    fn scatter_add(
        src: &CpuStorage,
        index_shape: &Shape,
        out_shape: &Shape,
        axis: usize,
        indices: &[usize],
    ) -> Result<CpuStorage> {
        check_len(src, index_shape)?;
        check_axis(out_shape, axis)?;
        check_gather_shape(out_shape, index_shape, axis, indices)?;
        check_indices(out_shape, axis, indices)?;
        let out = kernels::scatter_add(&src.to_f64_vec(), index_shape, out_shape, axis, indices);
        Ok(CpuStorage::from_f64_vec(out, src.dtype()))
    }

    fn cast(input: &CpuStorage, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        if input.dtype() == dtype {
            return Ok(input.clone());
        }
        Ok(CpuStorage::from_f64_vec(input.to_f64_vec(), dtype))
    }
}

/// Convenience type alias for graphs on the CPU.
pub type CpuGraph = stoat_core::Graph<CpuBackend>;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn f32s(data: &[f32]) -> CpuStorage {
        CpuStorage::F32(data.to_vec())
    }

    #[test]
    fn test_binary_broadcast_add() {
        let a = f32s(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = f32s(&[10.0, 20.0, 30.0]);
        let out = CpuBackend::binary_op(
            BinaryOp::Add,
            &a,
            &Shape::from((2, 3)),
            &b,
            &Shape::from(3),
        )
        .unwrap();
        assert_eq!(
            out.as_f32_slice().unwrap(),
            &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
        );
    }

    #[test]
    fn test_binary_dtype_mismatch() {
        let a = f32s(&[1.0]);
        let b = CpuStorage::F64(vec![1.0]);
        let err = CpuBackend::binary_op(BinaryOp::Add, &a, &Shape::from(1), &b, &Shape::from(1))
            .unwrap_err();
        assert!(matches!(err, Error::DTypeMismatch { .. }));
    }

    #[test]
    fn test_integer_division() {
        let a = CpuStorage::I32(vec![7, -7]);
        let shape = Shape::from(2);
        let b = CpuStorage::I32(vec![2, 2]);
        let out = CpuBackend::binary_op(BinaryOp::Div, &a, &shape, &b, &shape).unwrap();
        assert_eq!(out.to_f64_vec(), vec![3.0, -3.0]);

        let zero = CpuStorage::I32(vec![0, 2]);
        let err = CpuBackend::binary_op(BinaryOp::Div, &a, &shape, &zero, &shape).unwrap_err();
        assert!(matches!(err, Error::Msg(_)));

        // floats follow IEEE
        let out = CpuBackend::binary_op(
            BinaryOp::Div,
            &f32s(&[1.0]),
            &Shape::from(1),
            &f32s(&[0.0]),
            &Shape::from(1),
        )
        .unwrap();
        assert_eq!(out.as_f32_slice().unwrap(), &[f32::INFINITY]);
    }

    #[test]
    fn test_unary_sigmoid_is_stable() {
        let x = CpuStorage::F64(vec![-800.0, 0.0, 800.0]);
        let out = CpuBackend::unary_op(UnaryOp::Sigmoid, &x).unwrap();
        let v = out.as_f64_slice().unwrap();
        assert_relative_eq!(v[0], 0.0);
        assert_relative_eq!(v[1], 0.5);
        assert_relative_eq!(v[2], 1.0);
    }

    #[test]
    fn test_reduce_mean_and_max() {
        let x = CpuStorage::F64(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let shape = Shape::from((2, 3));
        let mean = CpuBackend::reduce_op(ReduceOp::Mean, &x, &shape, 1).unwrap();
        assert_eq!(mean.to_f64_vec(), vec![2.0, 5.0]);
        let max = CpuBackend::reduce_op(ReduceOp::Max, &x, &shape, 0).unwrap();
        assert_eq!(max.to_f64_vec(), vec![4.0, 5.0, 6.0]);
        assert!(CpuBackend::reduce_op(ReduceOp::Sum, &x, &shape, 2).is_err());
        let prod = CpuBackend::reduce_op(ReduceOp::Prod, &x, &shape, 1).unwrap();
        assert_eq!(prod.to_f64_vec(), vec![6.0, 120.0]);
    }

    #[test]
    fn test_gather_checks_indices() {
        let x = CpuStorage::I64(vec![10, 20, 30, 40]);
        let shape = Shape::from((2, 2));
        let out = CpuBackend::gather(&x, &shape, 0, &[1, 0], &Shape::from((1, 2))).unwrap();
        assert_eq!(out.to_f64_vec(), vec![30.0, 20.0]);

        let err = CpuBackend::gather(&x, &shape, 0, &[2, 0], &Shape::from((1, 2))).unwrap_err();
        assert!(matches!(err, Error::SliceOutOfBounds { .. }));
        let err = CpuBackend::gather(&x, &shape, 0, &[0, 0, 0], &Shape::from((1, 3))).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_batched_matmul_broadcasts_batch() {
        // lhs [2, 1, 2] (two row vectors), rhs [2, 2] shared by both batches
        let lhs = CpuStorage::F64(vec![1.0, 0.0, 0.0, 1.0]);
        let rhs = CpuStorage::F64(vec![1.0, 2.0, 3.0, 4.0]);
        let out = CpuBackend::matmul(
            &lhs,
            &Shape::from((2, 1, 2)),
            &rhs,
            &Shape::from((2, 2)),
        )
        .unwrap();
        assert_eq!(out.to_f64_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_matmul_inner_mismatch() {
        let a = CpuStorage::F64(vec![0.0; 6]);
        let err = CpuBackend::matmul(&a, &Shape::from((2, 3)), &a, &Shape::from((2, 3)))
            .unwrap_err();
        assert!(matches!(err, Error::MatmulShapeMismatch { k1: 3, k2: 2, .. }));
    }

    #[test]
    fn test_permute_and_narrow_keep_integers_exact() {
        let big = i64::MAX - 1;
        let x = CpuStorage::I64(vec![big, 1, 2, 3, 4, 5]);
        let t = CpuBackend::permute(&x, &Shape::from((2, 3)), &[1, 0]).unwrap();
        match &t {
            CpuStorage::I64(v) => assert_eq!(v, &vec![big, 3, 1, 4, 2, 5]),
            other => panic!("unexpected {:?}", other),
        }
        let n = CpuBackend::narrow(&x, &Shape::from((2, 3)), 1, 1, 2).unwrap();
        match &n {
            CpuStorage::I64(v) => assert_eq!(v, &vec![1, 2, 4, 5]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(CpuBackend::permute(&x, &Shape::from((2, 3)), &[0, 0]).is_err());
    }

    #[test]
    fn test_cat_rejects_mixed_dtypes() {
        let a = f32s(&[1.0]);
        let b = CpuStorage::F64(vec![2.0]);
        let s = Shape::from(1);
        let err = CpuBackend::cat(&[(&a, &s), (&b, &s)], &Shape::from(2), 0).unwrap_err();
        assert!(matches!(err, Error::DTypeMismatch { .. }));
    }

    #[test]
    fn test_index_select_out_of_bounds() {
        let x = f32s(&[1.0, 2.0, 3.0]);
        let err = CpuBackend::index_select(&x, &Shape::from(3), 0, &[3]).unwrap_err();
        assert!(matches!(err, Error::SliceOutOfBounds { start: 3, .. }));
    }

    #[test]
    fn test_half_roundtrip_and_cast() {
        let x = CpuBackend::from_f64_slice(&[0.5, -2.0], DType::F16, &CpuDevice).unwrap();
        assert_eq!(x.dtype(), DType::F16);
        assert_eq!(x.size_in_bytes(), 4);
        let y = CpuBackend::cast(&x, DType::F32, &CpuDevice).unwrap();
        assert_eq!(y.as_f32_slice().unwrap(), &[0.5, -2.0]);
        let b = CpuBackend::from_f64_slice(&[0.0, 3.0], DType::Bool, &CpuDevice).unwrap();
        assert_eq!(b.to_f64_vec(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_large_map_uses_parallel_path() {
        let n = kernels::PAR_THRESHOLD * 2;
        let x = CpuStorage::F64((0..n).map(|i| i as f64).collect());
        let y = CpuBackend::affine(&x, 2.0, 1.0).unwrap();
        let v = y.as_f64_slice().unwrap();
        assert_eq!(v.len(), n);
        assert_eq!(v[n - 1], 2.0 * (n - 1) as f64 + 1.0);
    }
}
