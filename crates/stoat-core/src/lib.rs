//! # stoat-core
//!
//! Expression graph and reverse-mode automatic differentiation for Stoat.
//!
//! This crate provides:
//! - [`Graph`] — owner of nodes, buffers and gradients; forward/backward
//! - [`Expr`] — cheap `Copy` handle to a node of a graph
//! - [`Operator`] trait — the contract every operator kind implements
//! - [`Backend`] trait — allocation and kernels the engine runs on
//! - [`Shape`] / [`DType`] — shapes, broadcasting and element type promotion
//! - [`MemoryStats`] — buffer accounting, checkpoint release and recompute
// - Shape/DType: shape algebra, broadcasting, type promotion
// - Backend: kernel/storage abstraction (CPU lives in stoat-cpu)
// - Op/Node/Tape: operator contract, graph vertices, creation order
// - Memory: release policy and checkpoint recomputation plans
// - Graph: construction, forward, backward, episodes

pub mod backend;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod init;
pub mod lambda;
pub mod memory;
pub mod node;
pub mod op;
pub mod shape;
pub mod tape;

pub use backend::{Backend, BackendDevice, BackendStorage, BinaryOp, CmpOp, ReduceOp, UnaryOp};
pub use dtype::{DType, WithDType};
pub use error::{Error, ErrorKind, Result};
pub use graph::{Graph, GraphConfig};
pub use init::Initializer;
pub use lambda::{LambdaBackward, LambdaForward, LambdaOp};
pub use memory::MemoryStats;
pub use node::{Expr, NodeId};
pub use op::{reduce_broadcast_grad, BackwardCtx, ForwardCtx, KeyParam, Operator, TensorMeta};
pub use shape::{broadcast_shapes, normalize_axis, Shape};
