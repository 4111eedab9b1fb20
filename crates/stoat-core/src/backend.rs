use std::fmt;

use crate::dtype::DType;
use crate::error::Result;
use crate::shape::Shape;

// Backend — Kernel/storage layer consumed by the graph engine
//
// The graph never touches memory directly. It asks the backend to allocate
// buffers by (Shape, DType), to move data to and from the host, and (through
// operators) to run kernels. Operators are written once against this trait
// and work on every backend.
//
// All buffers are dense and contiguous in row-major order, so kernels take a
// plain `&Shape` next to each storage. Operations return new storage
// (immutable semantics); the graph decides which buffers stay alive.

/// Identifies a compute device (e.g., "cpu").
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device.
    fn name(&self) -> String;
}

/// A storage buffer that holds tensor data on a specific device.
pub trait BackendStorage: Clone + fmt::Debug + Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes occupied by the elements.
    fn size_in_bytes(&self) -> usize {
        self.len() * self.dtype().size_in_bytes()
    }
}

/// Element-wise binary operations (with broadcasting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sign,
    Exp,
    Log,
    Sqrt,
    Square,
    Recip,
    Sin,
    Cos,
    Tan,
    Relu,
    Sigmoid,
    Tanh,
}

/// Reduction operations along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
    Prod,
}

/// Comparison operations (produce 0/1 in the input element type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// The main Backend trait. Implementing this for a struct (e.g., CpuBackend)
/// makes that struct a complete kernel/storage layer for Stoat.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device type for this backend.
    type Device: BackendDevice;
    /// The storage type for this backend.
    type Storage: BackendStorage;

    //  Allocation

    /// Allocate storage filled with zeros.
    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate storage filled with ones.
    fn ones(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        Self::full(shape, 1.0, dtype, device)
    }

    /// Allocate storage filled with a constant value.
    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Copy data from this storage to a Vec<f64> on the host (for inspection).
    fn to_f64_vec(input: &Self::Storage) -> Result<Vec<f64>>;

    //  Element-wise

    /// Apply a binary op element-wise with broadcasting. Both inputs must
    /// share a dtype; the result has that dtype and the broadcast shape.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_shape: &Shape,
        rhs: &Self::Storage,
        rhs_shape: &Shape,
    ) -> Result<Self::Storage>;

    /// Apply a unary op element-wise: result[i] = op(input[i]).
    fn unary_op(op: UnaryOp, input: &Self::Storage) -> Result<Self::Storage>;

    /// Affine transform: result = input * mul + add.
    fn affine(input: &Self::Storage, mul: f64, add: f64) -> Result<Self::Storage>;

    /// Element-wise comparison with broadcasting, 1 where true and 0 elsewhere.
    fn cmp_op(
        op: CmpOp,
        lhs: &Self::Storage,
        lhs_shape: &Shape,
        rhs: &Self::Storage,
        rhs_shape: &Shape,
    ) -> Result<Self::Storage>;

    //  Reductions

    /// Reduce along `axis`, keeping it with extent 1.
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        shape: &Shape,
        axis: usize,
    ) -> Result<Self::Storage>;

    //  Linear algebra

    /// Batched matrix multiply: `[..., m, k] @ [..., k, n] → [..., m, n]`,
    /// broadcasting the leading (batch) axes.
    fn matmul(
        lhs: &Self::Storage,
        lhs_shape: &Shape,
        rhs: &Self::Storage,
        rhs_shape: &Shape,
    ) -> Result<Self::Storage>;

    //  Data movement

    /// Reorder axes: output axis `i` is input axis `perm[i]`.
    fn permute(input: &Self::Storage, shape: &Shape, perm: &[usize]) -> Result<Self::Storage>;

    /// Materialize a broadcast of `input` to `target`.
    fn broadcast_to(input: &Self::Storage, shape: &Shape, target: &Shape)
        -> Result<Self::Storage>;

    /// Contiguous slice `[start, start + len)` along `axis`.
    fn narrow(
        input: &Self::Storage,
        shape: &Shape,
        axis: usize,
        start: usize,
        len: usize,
    ) -> Result<Self::Storage>;

    /// Concatenate storages along `axis`. `out_shape` is pre-validated.
    fn cat(
        inputs: &[(&Self::Storage, &Shape)],
        out_shape: &Shape,
        axis: usize,
    ) -> Result<Self::Storage>;

    /// Select entries `indices` along `axis`.
    fn index_select(
        input: &Self::Storage,
        shape: &Shape,
        axis: usize,
        indices: &[usize],
    ) -> Result<Self::Storage>;

    /// Inverse of `index_select` for gradients: a zero buffer of `out_shape`
    /// with `src` slices added at `indices` along `axis` (repeats accumulate).
    fn index_add(
        src: &Self::Storage,
        src_shape: &Shape,
        out_shape: &Shape,
        axis: usize,
        indices: &[usize],
    ) -> Result<Self::Storage>;

    /// Element-wise selection along `axis`: the output has `index_shape`,
    /// which matches `shape` on every other axis, and position `p` reads the
    /// input at `p` with its `axis` coordinate replaced by `indices[p]`.
    fn gather(
        input: &Self::Storage,
        shape: &Shape,
        axis: usize,
        indices: &[usize],
        index_shape: &Shape,
    ) -> Result<Self::Storage>;

    /// Inverse of `gather` for gradients: a zero buffer of `out_shape` with
    /// every `src` element added at its gathered position (repeats accumulate).
    fn scatter_add(
        src: &Self::Storage,
        index_shape: &Shape,
        out_shape: &Shape,
        axis: usize,
        indices: &[usize],
    ) -> Result<Self::Storage>;

    /// Cast storage to a different dtype.
    ///
    /// The default implementation goes through `to_f64_vec` + `from_f64_slice`.
    fn cast(input: &Self::Storage, dtype: DType, device: &Self::Device) -> Result<Self::Storage> {
        let data = Self::to_f64_vec(input)?;
        Self::from_f64_slice(&data, dtype, device)
    }
}
