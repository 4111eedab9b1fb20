//! # Stoat
//!
//! Symbolic tensor expressions with reverse-mode automatic differentiation.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use stoat::prelude::*;
//!
//! # fn main() -> stoat::Result<()> {
//! let mut g = CpuGraph::new(CpuDevice);
//! let x = g.parameter("x", (2, 3), init::ones::<CpuBackend>(), DType::F64)?;
//! let w = g.parameter("w", (2, 3), init::from_value::<CpuBackend>(0.5), DType::F64)?;
//! let y = g.mul(x, w)?;
//! let z = g.sum(y, 0)?;
//!
//! g.forward()?;
//! g.backward(z)?;
//! assert_eq!(g.grad_to_f64_vec(x)?, Some(vec![0.5; 6]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `stoat-core` | Shape, DType, Backend trait, Operator contract, Graph, autodiff, checkpointing |
//! | `stoat-cpu` | CPU backend with rayon parallelism and half-precision storage |
//! | `stoat-ops` | Operator catalogue and the `Ops` expression-building trait |

/// Re-export core types.
pub use stoat_core::{
    backend::{Backend, BackendDevice, BackendStorage, BinaryOp, CmpOp, ReduceOp, UnaryOp},
    BackwardCtx, DType, Error, ErrorKind, Expr, ForwardCtx, Graph, GraphConfig, Initializer,
    KeyParam, LambdaBackward, MemoryStats, NodeId, Operator, Result, Shape, TensorMeta,
    WithDType,
};

/// Leaf initializers.
pub use stoat_core::init;

/// Re-export the CPU backend.
pub use stoat_cpu::{CpuBackend, CpuDevice, CpuGraph, CpuStorage};

/// Re-export the operator catalogue.
pub mod ops {
    pub use stoat_ops::*;
}

pub use stoat_ops::Ops;

/// Everything needed to build and differentiate expressions on the CPU.
pub mod prelude {
    pub use crate::init;
    pub use crate::{
        Backend, CpuBackend, CpuDevice, CpuGraph, DType, Error, Expr, Graph, GraphConfig, Ops,
        Result, Shape,
    };
}
