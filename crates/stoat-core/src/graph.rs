// Graph — Expression construction, forward materialization and reverse-mode
// gradient accumulation
//
// A Graph owns every node. Callers hold `Expr` handles, which are plain
// (graph, episode, node) triples, so building an expression never clones a
// tensor and never needs reference counting between nodes.
//
// LIFECYCLE OF ONE EPISODE:
//
//   1. build      constant / parameter / add_node append nodes to the tape;
//                 inference runs immediately, so shape and type errors are
//                 reported by the call that caused them
//   2. forward    walk the tape from the cursor, materializing values
//   3. backward   seed the root(s), walk the tape in reverse, accumulate
//                 contributions into trainable inputs
//   4. reset      drop every episode node; parameters stay
//
// The graph can be extended after forward(); the next forward() only runs the
// new suffix. backward() refuses to run while such a suffix is pending.
//
// DEDUPLICATION:
//
//   Each operator node gets a structural key (kind, key parameters, input
//   ids). Building the same key twice in one episode returns the existing
//   node, so `a + b` written twice is evaluated once and its gradient flows
//   through one node.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::backend::{Backend, BackendStorage, BinaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::init::Initializer;
use crate::lambda::{LambdaBackward, LambdaOp};
use crate::memory::{plan_materialization, MemoryManager, MemoryStats};
use crate::node::{Expr, GraphId, Node, NodeId, NodeKind};
use crate::op::{BackwardCtx, ForwardCtx, Operator, StructuralKey, TensorMeta};
use crate::shape::Shape;
use crate::tape::Tape;

// Configuration

/// Execution policy of a [`Graph`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphConfig {
    /// Free buffers as soon as nothing needs them (default: true).
    pub release_buffers: bool,
    /// Keep intermediate gradients after backward (default: false).
    pub retain_grads: bool,
    /// Merge structurally identical nodes (default: true).
    pub deduplicate: bool,
    /// Seed of the RNG used by random initializers (default: 42).
    pub seed: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            release_buffers: true,
            retain_grads: false,
            deduplicate: true,
            seed: 42,
        }
    }
}

impl GraphConfig {
    pub fn with_release_buffers(mut self, release: bool) -> Self {
        self.release_buffers = release;
        self
    }

    pub fn with_retain_grads(mut self, retain: bool) -> Self {
        self.retain_grads = retain;
        self
    }

    pub fn with_deduplicate(mut self, dedup: bool) -> Self {
        self.deduplicate = dedup;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

// Graph

/// Owner of all nodes, buffers and gradients of a computation.
pub struct Graph<B: Backend> {
    id: GraphId,
    device: B::Device,
    config: GraphConfig,

    params: Vec<Node<B>>,
    param_names: HashMap<String, usize>,

    nodes: Vec<Node<B>>,
    tape: Tape,
    dedup: HashMap<StructuralKey, usize>,

    memory: MemoryManager,
    rng: StdRng,
    episode: u64,
    forwarded: bool,
}

impl<B: Backend> Graph<B> {
    pub fn new(device: B::Device) -> Self {
        Self::with_config(device, GraphConfig::default())
    }

    pub fn with_config(device: B::Device, config: GraphConfig) -> Self {
        Graph {
            id: GraphId::new(),
            device,
            memory: MemoryManager::new(config.release_buffers),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            params: Vec::new(),
            param_names: HashMap::new(),
            nodes: Vec::new(),
            tape: Tape::new(),
            dedup: HashMap::new(),
            episode: 0,
            forwarded: false,
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Current episode number; starts at 0, incremented by [`reset`](Self::reset).
    pub fn episode(&self) -> u64 {
        self.episode
    }

    /// Number of nodes in the current episode.
    pub fn len(&self) -> usize {
        self.tape.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tape.is_empty()
    }

    pub fn num_parameters(&self) -> usize {
        self.params.len()
    }

    /// Handles to every parameter, in creation order.
    pub fn parameters(&self) -> Vec<Expr> {
        (0..self.params.len())
            .map(|i| self.expr(NodeId::Param(i)))
            .collect()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.memory.stats()
    }

    // Handles

    fn expr(&self, id: NodeId) -> Expr {
        Expr {
            graph: self.id,
            episode: self.episode,
            id,
        }
    }

    /// Check that `expr` belongs to this graph and is still valid.
    fn resolve(&self, expr: Expr) -> Result<NodeId> {
        if expr.graph != self.id {
            return Err(Error::ForeignExpr {
                expr_graph: expr.graph.0,
                graph: self.id.0,
            });
        }
        match expr.id {
            NodeId::Param(i) if i < self.params.len() => Ok(expr.id),
            NodeId::Tape(i) if expr.episode == self.episode && i < self.nodes.len() => Ok(expr.id),
            NodeId::Tape(_) if expr.episode != self.episode => Err(Error::ExpiredExpr {
                expr_episode: expr.episode,
                episode: self.episode,
            }),
            _ => Err(Error::graph_state(format!("unknown node {}", expr.id))),
        }
    }

    fn node(&self, id: NodeId) -> &Node<B> {
        match id {
            NodeId::Param(i) => &self.params[i],
            NodeId::Tape(i) => &self.nodes[i],
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<B> {
        match id {
            NodeId::Param(i) => &mut self.params[i],
            NodeId::Tape(i) => &mut self.nodes[i],
        }
    }

    // Leaves

    /// A non-trainable leaf filled by `init` on first use.
    pub fn constant(
        &mut self,
        shape: impl Into<Shape>,
        init: Initializer<B>,
        dtype: DType,
    ) -> Result<Expr> {
        let meta = TensorMeta::new(shape, dtype);
        meta.shape.validate()?;
        let index = self.nodes.len();
        self.nodes.push(Node::leaf(init, meta, false));
        self.tape.push(index);
        trace!("constant n{} {}", index, self.nodes[index].meta);
        Ok(self.expr(NodeId::Tape(index)))
    }

    /// A named, long-lived leaf that survives [`reset`](Self::reset).
    ///
    /// Asking for an existing name returns that parameter; the shape and
    /// dtype must agree with the ones it was created with. Float parameters
    /// are trainable.
    pub fn parameter(
        &mut self,
        name: &str,
        shape: impl Into<Shape>,
        init: Initializer<B>,
        dtype: DType,
    ) -> Result<Expr> {
        let shape = shape.into();
        if let Some(&index) = self.param_names.get(name) {
            let meta = &self.params[index].meta;
            if meta.shape != shape {
                return Err(Error::ShapeMismatch {
                    expected: meta.shape.clone(),
                    got: shape,
                });
            }
            if meta.dtype != dtype {
                return Err(Error::DTypeMismatch {
                    expected: meta.dtype,
                    got: dtype,
                });
            }
            return Ok(self.expr(NodeId::Param(index)));
        }

        shape.validate()?;
        let meta = TensorMeta::new(shape, dtype);
        let mut node = Node::leaf(init, meta, dtype.is_float());
        node.name = Some(name.to_string());
        let index = self.params.len();
        self.params.push(node);
        self.param_names.insert(name.to_string(), index);
        debug!("parameter '{}' = p{} {}", name, index, self.params[index].meta);
        Ok(self.expr(NodeId::Param(index)))
    }

    /// Look up a parameter by name.
    pub fn parameter_by_name(&self, name: &str) -> Option<Expr> {
        self.param_names
            .get(name)
            .map(|&i| self.expr(NodeId::Param(i)))
    }

    /// Change whether a leaf receives gradients. Trainability of the nodes
    /// built on top of it is updated accordingly.
    pub fn set_trainable(&mut self, expr: Expr, trainable: bool) -> Result<()> {
        let id = self.resolve(expr)?;
        let node = self.node(id);
        if !node.is_leaf() {
            return Err(Error::unsupported(
                "set_trainable",
                format!("{} is computed by '{}', only leaves can be marked", id, node.op_name()),
            ));
        }
        if trainable && !node.meta.dtype.is_float() {
            return Err(Error::IncompatibleTypes {
                lhs: node.meta.dtype,
                rhs: node.meta.dtype,
                op: "set_trainable",
            });
        }
        self.node_mut(id).trainable = trainable;
        self.refresh_trainable();
        Ok(())
    }

    /// Overwrite a leaf's value. Everything computed from it in the current
    /// episode is invalidated and runs again on the next forward().
    pub fn set_value(&mut self, expr: Expr, data: &[f64]) -> Result<()> {
        let id = self.resolve(expr)?;
        let node = self.node(id);
        if !node.is_leaf() {
            return Err(Error::unsupported(
                "set_value",
                format!("{} is computed by '{}', only leaves hold data", id, node.op_name()),
            ));
        }
        if data.len() != node.meta.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: node.meta.shape.clone(),
                expected: node.meta.elem_count(),
                got: data.len(),
            });
        }
        let storage = B::from_f64_slice(data, node.meta.dtype, &self.device)?;
        self.memory.track(&storage);
        let node = match id {
            NodeId::Param(i) => &mut self.params[i],
            NodeId::Tape(i) => &mut self.nodes[i],
        };
        if let Some(old) = node.value.replace(storage) {
            self.memory.untrack(&old);
        }
        node.computed = true;
        self.invalidate_episode_values();
        Ok(())
    }

    /// Drop a leaf's value so that its initializer runs again on next use.
    pub fn invalidate(&mut self, expr: Expr) -> Result<()> {
        let id = self.resolve(expr)?;
        let node = match id {
            NodeId::Param(i) => &mut self.params[i],
            NodeId::Tape(i) => &mut self.nodes[i],
        };
        if !node.is_leaf() {
            return Err(Error::unsupported(
                "invalidate",
                format!("{} is computed by '{}', only leaves can be invalidated", id, node.op_name()),
            ));
        }
        if let Some(old) = node.value.take() {
            self.memory.untrack(&old);
        }
        node.computed = false;
        self.invalidate_episode_values();
        Ok(())
    }

    /// Clear accumulated parameter gradients.
    pub fn zero_grads(&mut self) {
        for node in self.params.iter_mut() {
            if let Some(grad) = node.grad.take() {
                self.memory.untrack(&grad);
            }
        }
    }

    // Operator nodes

    /// Append an operator node over `inputs`.
    ///
    /// Output shape and dtype are inferred immediately; on failure nothing is
    /// added. If an identical node already exists in this episode it is
    /// returned instead.
    pub fn add_node(&mut self, op: Arc<dyn Operator<B>>, inputs: &[Expr]) -> Result<Expr> {
        let ids = inputs
            .iter()
            .map(|&e| self.resolve(e))
            .collect::<Result<Vec<_>>>()?;

        let meta = {
            let metas: Vec<&TensorMeta> = ids.iter().map(|&i| &self.node(i).meta).collect();
            op.infer(&metas)?
        };
        meta.shape.validate()?;

        let key = if self.config.deduplicate {
            op.key_params().map(|params| StructuralKey {
                op: op.name(),
                params,
                inputs: ids.clone(),
            })
        } else {
            None
        };
        if let Some(&index) = key.as_ref().and_then(|k| self.dedup.get(k)) {
            trace!("dedup {} -> n{}", op.name(), index);
            return Ok(self.expr(NodeId::Tape(index)));
        }

        let trainable = op.differentiable()
            && meta.dtype.is_float()
            && ids.iter().any(|&i| self.node(i).trainable);

        for &input in &ids {
            let node = self.node_mut(input);
            node.consumers += 1;
            node.fwd_pending += 1;
        }

        let index = self.nodes.len();
        trace!("node n{} = {}({:?}) {}", index, op.name(), ids, meta);
        if let Some(k) = key {
            self.dedup.insert(k, index);
        }
        self.nodes.push(Node::op(op, ids, meta, trainable));
        self.tape.push(index);
        Ok(self.expr(NodeId::Tape(index)))
    }

    /// Append a node computed by user closures. The output shape and dtype
    /// are declared here; without `backward` the node passes no gradient.
    pub fn lambda<F>(
        &mut self,
        inputs: &[Expr],
        shape: impl Into<Shape>,
        dtype: DType,
        forward: F,
        backward: Option<LambdaBackward<B>>,
    ) -> Result<Expr>
    where
        F: Fn(&ForwardCtx<'_, B>) -> Result<B::Storage> + Send + Sync + 'static,
    {
        let op = LambdaOp::new(
            TensorMeta::new(shape, dtype),
            inputs.len(),
            Arc::new(forward),
            backward,
        )?;
        self.add_node(Arc::new(op), inputs)
    }

    /// Mark a node as a checkpoint: its value is dropped once its direct
    /// consumers have run, and recomputed when needed again.
    pub fn checkpoint(&mut self, expr: Expr) -> Result<Expr> {
        let id = self.resolve(expr)?;
        if self.node(id).is_leaf() {
            return Ok(expr);
        }
        self.node_mut(id).checkpoint = true;
        self.release_checkpoint(id);
        Ok(expr)
    }

    /// Pin a node's value (and gradient) so they survive the release policy.
    pub fn keep(&mut self, expr: Expr) -> Result<Expr> {
        let id = self.resolve(expr)?;
        self.node_mut(id).keep = true;
        Ok(expr)
    }

    fn refresh_trainable(&mut self) {
        for index in 0..self.nodes.len() {
            let trainable = match &self.nodes[index].kind {
                NodeKind::Leaf(_) => continue,
                NodeKind::Op(op) => {
                    op.differentiable()
                        && self.nodes[index].meta.dtype.is_float()
                        && self.nodes[index]
                            .inputs
                            .iter()
                            .any(|&i| self.node(i).trainable)
                }
            };
            self.nodes[index].trainable = trainable;
        }
    }

    /// Forget every computed value of the current episode (a leaf changed).
    fn invalidate_episode_values(&mut self) {
        for node in self.nodes.iter_mut() {
            if !node.is_leaf() {
                if let Some(old) = node.value.take() {
                    self.memory.untrack(&old);
                }
                node.computed = false;
            }
            if let Some(old) = node.grad.take() {
                self.memory.untrack(&old);
            }
            node.fwd_pending = node.consumers;
        }
        self.tape.rewind();
        self.forwarded = false;
    }

    // Forward

    /// Materialize every node of the episode not computed yet.
    pub fn forward(&mut self) -> Result<()> {
        let pending = self.tape.pending().to_vec();
        debug!(
            "forward: episode {}, {} of {} nodes pending",
            self.episode,
            pending.len(),
            self.tape.len()
        );
        for index in pending {
            self.materialize(NodeId::Tape(index), true)?;
        }
        self.tape.advance();
        self.forwarded = true;
        debug!("forward done: {:?}", self.memory.stats());
        Ok(())
    }

    /// Materialize only what `expr` depends on.
    pub fn forward_to(&mut self, expr: Expr) -> Result<()> {
        let id = self.resolve(expr)?;
        self.materialize(id, true)
    }

    /// Compute `target` and whatever it needs that is not live.
    ///
    /// With `release` set, checkpoints whose consumers have all run are
    /// dropped again afterwards (forward phase). During backward the caller
    /// needs the values right after this returns, so nothing is dropped.
    fn materialize(&mut self, target: NodeId, release: bool) -> Result<()> {
        let plan = plan_materialization(
            target,
            |id| self.node(id).is_live(),
            |id| self.node(id).inputs.clone(),
        );
        let mut candidates = Vec::new();
        for id in plan {
            self.compute(id, &mut candidates)?;
        }
        if release {
            for id in candidates {
                self.release_checkpoint(id);
            }
        }
        Ok(())
    }

    /// Run one node's initializer or operator. Inputs must be live.
    fn compute(&mut self, id: NodeId, candidates: &mut Vec<NodeId>) -> Result<()> {
        let recompute = self.node(id).computed;
        let kind = self.node(id).kind.clone();

        let value = match kind {
            NodeKind::Leaf(init) => {
                let meta = self.node(id).meta.clone();
                init(&meta, &self.device, &mut self.rng)?
            }
            NodeKind::Op(op) => {
                let node = self.node(id);
                let inputs = node
                    .inputs
                    .iter()
                    .map(|&i| {
                        self.node(i).value.as_ref().ok_or_else(|| {
                            Error::graph_state(format!("input {} of {} is not materialized", i, id))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let metas = node.inputs.iter().map(|&i| &self.node(i).meta).collect();
                let ctx = ForwardCtx::new(&self.device, inputs, metas, &node.meta);
                op.forward(&ctx)?
            }
        };

        let meta = &self.node(id).meta;
        if value.len() != meta.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: meta.shape.clone(),
                expected: meta.elem_count(),
                got: value.len(),
            });
        }
        if value.dtype() != meta.dtype {
            return Err(Error::DTypeMismatch {
                expected: meta.dtype,
                got: value.dtype(),
            });
        }

        if recompute {
            self.memory.note_recompute();
            trace!("recompute {} ({})", id, self.node(id).op_name());
        } else {
            trace!("compute {} ({})", id, self.node(id).op_name());
        }
        self.memory.track(&value);
        let node = self.node_mut(id);
        node.value = Some(value);
        node.computed = true;

        if recompute {
            if node.checkpoint {
                candidates.push(id);
            }
        } else {
            let inputs = node.inputs.clone();
            for input in inputs {
                let node = self.node_mut(input);
                node.fwd_pending = node.fwd_pending.saturating_sub(1);
                if node.checkpoint && node.fwd_pending == 0 {
                    candidates.push(input);
                }
            }
        }
        Ok(())
    }

    fn release_checkpoint(&mut self, id: NodeId) {
        if !self.memory.releases_buffers() {
            return;
        }
        let node = match id {
            NodeId::Param(i) => &mut self.params[i],
            NodeId::Tape(i) => &mut self.nodes[i],
        };
        if node.checkpoint && node.computed && node.fwd_pending == 0 && node.releasable() {
            if self.memory.release(&mut node.value) {
                trace!("release checkpoint {}", id);
            }
        }
    }

    // Backward

    /// Reverse pass from `root`, seeded with ones.
    pub fn backward(&mut self, root: Expr) -> Result<()> {
        self.backward_from(&[(root, None)])
    }

    /// Reverse pass from `root`, seeded with `seed` (row-major, one value
    /// per element of `root`).
    pub fn backward_with_seed(&mut self, root: Expr, seed: &[f64]) -> Result<()> {
        self.backward_from(&[(root, Some(seed))])
    }

    /// Reverse pass from several roots at once. A `None` seed means ones.
    pub fn backward_from(&mut self, seeds: &[(Expr, Option<&[f64]>)]) -> Result<()> {
        if !self.forwarded {
            return Err(Error::graph_state(
                "backward() called before forward() in this episode",
            ));
        }
        if !self.tape.is_scheduled() {
            return Err(Error::graph_state(format!(
                "graph was extended by {} node(s) after forward(); run forward() again",
                self.tape.pending().len()
            )));
        }

        let roots = seeds
            .iter()
            .map(|&(expr, seed)| self.resolve(expr).map(|id| (id, seed)))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "backward: episode {}, {} root(s), {} nodes",
            self.episode,
            roots.len(),
            self.tape.len()
        );

        for node in self.nodes.iter_mut() {
            if let Some(old) = node.grad.take() {
                self.memory.untrack(&old);
            }
            node.bwd_pending = node.consumers;
        }

        let root_ids: Vec<NodeId> = roots.iter().map(|&(id, _)| id).collect();
        for (id, seed) in roots {
            let meta = self.node(id).meta.clone();
            if !self.node(id).trainable {
                debug!("backward: root {} is not trainable, nothing to do", id);
                continue;
            }
            let grad = match seed {
                Some(data) => {
                    if data.len() != meta.elem_count() {
                        return Err(Error::ElementCountMismatch {
                            shape: meta.shape.clone(),
                            expected: meta.elem_count(),
                            got: data.len(),
                        });
                    }
                    B::from_f64_slice(data, meta.dtype, &self.device)?
                }
                None => B::ones(&meta.shape, meta.dtype, &self.device)?,
            };
            self.accumulate_grad(id, grad)?;
        }

        let order: Vec<usize> = self.tape.reverse().collect();
        for index in order {
            let id = NodeId::Tape(index);
            self.backward_step(id)?;

            let inputs = self.nodes[index].inputs.clone();
            for input in inputs {
                let node = self.node_mut(input);
                node.bwd_pending = node.bwd_pending.saturating_sub(1);
            }
            self.release_visited(id, root_ids.contains(&id));
        }

        debug!("backward done: {:?}", self.memory.stats());
        Ok(())
    }

    fn backward_step(&mut self, id: NodeId) -> Result<()> {
        let op = {
            let node = self.node(id);
            if !node.trainable || node.grad.is_none() {
                return Ok(());
            }
            match &node.kind {
                NodeKind::Op(op) => Arc::clone(op),
                NodeKind::Leaf(_) => return Ok(()),
            }
        };

        let inputs = self.node(id).inputs.clone();
        for &input in &inputs {
            self.materialize(input, false)?;
        }
        self.materialize(id, false)?;

        let contributions = {
            let node = self.node(id);
            let values = inputs
                .iter()
                .map(|&i| {
                    self.node(i).value.as_ref().ok_or_else(|| {
                        Error::graph_state(format!("input {} of {} is not materialized", i, id))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let metas = inputs.iter().map(|&i| &self.node(i).meta).collect();
            let needs_grad = inputs.iter().map(|&i| self.node(i).trainable).collect();
            let output = node
                .value
                .as_ref()
                .ok_or_else(|| Error::graph_state(format!("{} is not materialized", id)))?;
            let mut ctx = BackwardCtx::new(
                &self.device,
                values,
                metas,
                output,
                &node.meta,
                node.grad.as_ref(),
                needs_grad,
            );
            op.backward(&mut ctx)?;
            ctx.into_grads()
        };
        trace!("backward {} ({})", id, op.name());

        for (input, grad) in inputs.into_iter().zip(contributions) {
            if let Some(grad) = grad {
                self.accumulate_grad(input, grad)?;
            }
        }
        Ok(())
    }

    /// Add `grad` into a node's gradient buffer.
    fn accumulate_grad(&mut self, id: NodeId, grad: B::Storage) -> Result<()> {
        let node = match id {
            NodeId::Param(i) => &mut self.params[i],
            NodeId::Tape(i) => &mut self.nodes[i],
        };
        let summed = match node.grad.take() {
            Some(existing) => {
                let shape = &node.meta.shape;
                let summed = B::binary_op(BinaryOp::Add, &existing, shape, &grad, shape)?;
                self.memory.replace(&existing, &summed);
                summed
            }
            None => {
                self.memory.track(&grad);
                grad
            }
        };
        node.grad = Some(summed);
        Ok(())
    }

    /// Release a node after its backward visit once every consumer is done.
    /// A root keeps its gradient.
    fn release_visited(&mut self, id: NodeId, is_root: bool) {
        if !self.memory.releases_buffers() {
            return;
        }
        let retain_grads = self.config.retain_grads;
        let node = match id {
            NodeId::Param(i) => &mut self.params[i],
            NodeId::Tape(i) => &mut self.nodes[i],
        };
        if node.bwd_pending != 0 || !node.releasable() {
            return;
        }
        if self.memory.release(&mut node.value) {
            trace!("release value {}", id);
        }
        if !retain_grads && !is_root && self.memory.release(&mut node.grad) {
            trace!("release grad {}", id);
        }
    }

    // Episodes

    /// Start a new episode: every non-parameter node and buffer is dropped
    /// and outstanding episode Exprs become invalid. Parameters keep their
    /// values and accumulated gradients.
    pub fn reset(&mut self) {
        debug!(
            "reset: episode {} -> {}, dropping {} nodes",
            self.episode,
            self.episode + 1,
            self.nodes.len()
        );
        self.nodes.clear();
        self.tape.clear();
        self.dedup.clear();
        self.episode += 1;
        self.forwarded = false;

        let mut live = 0;
        for node in self.params.iter_mut() {
            node.consumers = 0;
            node.fwd_pending = 0;
            node.bwd_pending = 0;
            live += node.value.as_ref().map_or(0, |v| v.size_in_bytes());
            live += node.grad.as_ref().map_or(0, |g| g.size_in_bytes());
        }
        self.memory.reset(live);
    }

    // Retrieval

    pub fn meta(&self, expr: Expr) -> Result<&TensorMeta> {
        Ok(&self.node(self.resolve(expr)?).meta)
    }

    pub fn shape(&self, expr: Expr) -> Result<&Shape> {
        Ok(&self.meta(expr)?.shape)
    }

    pub fn dtype(&self, expr: Expr) -> Result<DType> {
        Ok(self.meta(expr)?.dtype)
    }

    /// Name of the operator (or `"leaf"`) that produces `expr`.
    pub fn op_name(&self, expr: Expr) -> Result<&'static str> {
        Ok(self.node(self.resolve(expr)?).op_name())
    }

    /// The forward value. Fails if it was never computed or has been
    /// released (use [`keep`](Self::keep) to pin intermediate values).
    pub fn value(&self, expr: Expr) -> Result<&B::Storage> {
        let id = self.resolve(expr)?;
        self.node(id).value.as_ref().ok_or_else(|| {
            Error::graph_state(format!(
                "{} has no value (not computed yet, or released after use)",
                id
            ))
        })
    }

    /// The accumulated gradient, or `None` if no gradient reached the node.
    pub fn grad(&self, expr: Expr) -> Result<Option<&B::Storage>> {
        Ok(self.node(self.resolve(expr)?).grad.as_ref())
    }

    pub fn to_f64_vec(&self, expr: Expr) -> Result<Vec<f64>> {
        B::to_f64_vec(self.value(expr)?)
    }

    pub fn grad_to_f64_vec(&self, expr: Expr) -> Result<Option<Vec<f64>>> {
        self.grad(expr)?.map(|g| B::to_f64_vec(g)).transpose()
    }

    pub fn is_trainable(&self, expr: Expr) -> Result<bool> {
        Ok(self.node(self.resolve(expr)?).trainable)
    }

    pub fn is_checkpoint(&self, expr: Expr) -> Result<bool> {
        Ok(self.node(self.resolve(expr)?).checkpoint)
    }

    /// Whether the node currently holds its forward value.
    pub fn is_live(&self, expr: Expr) -> Result<bool> {
        Ok(self.node(self.resolve(expr)?).is_live())
    }
}

impl<B: Backend> std::fmt::Debug for Graph<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("episode", &self.episode)
            .field("params", &self.params.len())
            .field("nodes", &self.nodes.len())
            .field("forwarded", &self.forwarded)
            .field("memory", &self.memory.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = GraphConfig::default()
            .with_release_buffers(false)
            .with_retain_grads(true)
            .with_deduplicate(false)
            .with_seed(7);
        assert!(!config.release_buffers);
        assert!(config.retain_grads);
        assert!(!config.deduplicate);
        assert_eq!(config.seed, 7);
    }

    #[test]
    fn test_config_defaults() {
        let config = GraphConfig::default();
        assert!(config.release_buffers);
        assert!(!config.retain_grads);
        assert!(config.deduplicate);
        assert_eq!(config.seed, 42);
    }
}
