// Node — Graph vertex and the user-facing Expr handle
//
// Nodes live in arenas owned by the Graph and are addressed by index:
//
//   NodeId::Param(i)  — long-lived parameter arena, survives episode resets
//   NodeId::Tape(i)   — per-episode arena; the index is the creation order
//
// A node only ever references nodes that existed before it, so the graph is
// acyclic by construction and the episode arena order is a topological order.
//
// Buffer bookkeeping per node:
//
//   value        forward buffer (None until computed, or after release)
//   computed     has the value been produced at least once this episode
//   grad         gradient accumulator (None until backward reaches it)
//   consumers    number of input edges pointing at this node
//   fwd_pending  consumer edges whose consumer has not run forward yet
//   bwd_pending  consumer edges whose consumer has not been backward-visited

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::Backend;
use crate::init::Initializer;
use crate::op::{Operator, TensorMeta};

/// Index of a node inside one of the graph's arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Param(usize),
    Tape(usize),
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Param(i) => write!(f, "p{}", i),
            NodeId::Tape(i) => write!(f, "n{}", i),
        }
    }
}

/// Unique identifier of a Graph instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(pub(crate) u64);

impl GraphId {
    /// Generate a new unique graph ID (uses a global atomic counter).
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        GraphId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// User-facing handle to a graph node.
///
/// Copying an Expr copies the reference, never the node. An Expr is only
/// valid for the graph that produced it and, unless it names a parameter,
/// only within the episode it was created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Expr {
    pub(crate) graph: GraphId,
    pub(crate) episode: u64,
    pub(crate) id: NodeId,
}

impl Expr {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({}@{})", self.id, self.episode)
    }
}

/// How a node produces its value.
pub enum NodeKind<B: Backend> {
    /// Constant or parameter: filled once by an initializer.
    Leaf(Initializer<B>),
    /// Computed from inputs by an operator.
    Op(Arc<dyn Operator<B>>),
}

impl<B: Backend> Clone for NodeKind<B> {
    fn clone(&self) -> Self {
        match self {
            NodeKind::Leaf(init) => NodeKind::Leaf(init.clone()),
            NodeKind::Op(op) => NodeKind::Op(Arc::clone(op)),
        }
    }
}

impl<B: Backend> fmt::Debug for NodeKind<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Leaf(_) => write!(f, "Leaf"),
            NodeKind::Op(op) => write!(f, "Op({:?})", op),
        }
    }
}

/// A graph vertex: one operator (or initializer), its inputs and buffers.
pub struct Node<B: Backend> {
    pub(crate) kind: NodeKind<B>,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) meta: TensorMeta,
    pub(crate) name: Option<String>,

    pub(crate) value: Option<B::Storage>,
    pub(crate) computed: bool,
    pub(crate) grad: Option<B::Storage>,

    pub(crate) trainable: bool,
    pub(crate) checkpoint: bool,
    pub(crate) keep: bool,

    pub(crate) consumers: usize,
    pub(crate) fwd_pending: usize,
    pub(crate) bwd_pending: usize,
}

impl<B: Backend> Node<B> {
    pub(crate) fn leaf(init: Initializer<B>, meta: TensorMeta, trainable: bool) -> Self {
        Node {
            kind: NodeKind::Leaf(init),
            inputs: Vec::new(),
            meta,
            name: None,
            value: None,
            computed: false,
            grad: None,
            trainable,
            checkpoint: false,
            keep: false,
            consumers: 0,
            fwd_pending: 0,
            bwd_pending: 0,
        }
    }

    pub(crate) fn op(
        op: Arc<dyn Operator<B>>,
        inputs: Vec<NodeId>,
        meta: TensorMeta,
        trainable: bool,
    ) -> Self {
        Node {
            kind: NodeKind::Op(op),
            inputs,
            meta,
            name: None,
            value: None,
            computed: false,
            grad: None,
            trainable,
            checkpoint: false,
            keep: false,
            consumers: 0,
            fwd_pending: 0,
            bwd_pending: 0,
        }
    }

    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn kind(&self) -> &NodeKind<B> {
        &self.kind
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn is_checkpoint(&self) -> bool {
        self.checkpoint
    }

    pub fn is_live(&self) -> bool {
        self.value.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn op_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::Leaf(_) => "leaf",
            NodeKind::Op(op) => op.name(),
        }
    }

    /// Whether the memory manager may drop this node's forward buffer.
    /// Leaves own their data, and graph outputs (no consumers) or pinned
    /// nodes stay readable after the pass.
    pub(crate) fn releasable(&self) -> bool {
        !self.is_leaf() && !self.keep && self.consumers > 0
    }
}

impl<B: Backend> fmt::Debug for Node<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("op", &self.op_name())
            .field("inputs", &self.inputs)
            .field("meta", &format_args!("{}", self.meta))
            .field("live", &self.value.is_some())
            .field("trainable", &self.trainable)
            .field("checkpoint", &self.checkpoint)
            .finish()
    }
}
