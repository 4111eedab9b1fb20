// Memory — Buffer lifetime accounting and checkpoint recomputation planning
//
// The graph keeps every forward buffer alive only as long as something still
// needs it:
//
//   forward   a checkpointed node is released as soon as all of its direct
//             consumers have computed their own values
//   backward  after a node's own backward step, once every consumer has been
//             visited, its forward buffer (and its gradient, unless gradients
//             are retained) is released
//
// When a released buffer is needed again, `plan_materialization` produces the
// minimal list of nodes to recompute, inputs before consumers. The plan is
// built with an explicit stack so deep chains of checkpoints cannot overflow
// the call stack.
//
// GRADIENT CHECKPOINTING:
//
//   Without checkpoints, every activation stays alive from forward until
//   backward reaches it: memory grows with the depth of the network. Marking
//   every k-th activation as a checkpoint trades one extra forward
//   computation of those nodes for not holding them between passes.

use std::collections::HashSet;

use crate::backend::BackendStorage;
use crate::node::NodeId;

/// Snapshot of the memory manager's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes currently held by forward and gradient buffers.
    pub live_bytes: usize,
    /// High-water mark of `live_bytes` since the last reset.
    pub peak_bytes: usize,
    /// Buffers handed back by the release policy.
    pub released: usize,
    /// Node values computed again after having been released.
    pub recomputed: usize,
}

/// Tracks buffer bytes and applies the release policy.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    release_buffers: bool,
    stats: MemoryStats,
}

impl MemoryManager {
    pub fn new(release_buffers: bool) -> Self {
        MemoryManager {
            release_buffers,
            stats: MemoryStats::default(),
        }
    }

    /// Whether buffers are freed as soon as nothing needs them.
    pub fn releases_buffers(&self) -> bool {
        self.release_buffers
    }

    /// Account for a newly produced buffer.
    pub fn track<S: BackendStorage>(&mut self, storage: &S) {
        self.stats.live_bytes += storage.size_in_bytes();
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.live_bytes);
    }

    /// Account for a buffer that replaces `old` (e.g. gradient accumulation).
    pub fn replace<S: BackendStorage>(&mut self, old: &S, new: &S) {
        self.untrack(old);
        self.track(new);
    }

    /// Account for a buffer dropped outside of the release policy.
    pub fn untrack<S: BackendStorage>(&mut self, storage: &S) {
        self.stats.live_bytes = self.stats.live_bytes.saturating_sub(storage.size_in_bytes());
    }

    /// Drop the buffer in `slot`. Returns whether anything was released.
    pub fn release<S: BackendStorage>(&mut self, slot: &mut Option<S>) -> bool {
        match slot.take() {
            Some(storage) => {
                self.untrack(&storage);
                self.stats.released += 1;
                true
            }
            None => false,
        }
    }

    pub fn note_recompute(&mut self) {
        self.stats.recomputed += 1;
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats
    }

    /// Start a new accounting period with `live_bytes` still held
    /// (parameters survive episode resets).
    pub fn reset(&mut self, live_bytes: usize) {
        self.stats = MemoryStats {
            live_bytes,
            peak_bytes: live_bytes,
            ..MemoryStats::default()
        };
    }
}

/// Order in which to compute `target` and whatever it transitively needs.
///
/// `is_live` reports whether a node already holds its value and
/// `inputs_of` lists a node's inputs. Returns nodes in dependency order
/// (every node after all of its missing inputs), each at most once; an
/// empty plan means `target` is already live.
pub fn plan_materialization(
    target: NodeId,
    is_live: impl Fn(NodeId) -> bool,
    inputs_of: impl Fn(NodeId) -> Vec<NodeId>,
) -> Vec<NodeId> {
    let mut plan = Vec::new();
    if is_live(target) {
        return plan;
    }

    let mut seen = HashSet::new();
    // (node, inputs already pushed)
    let mut stack = vec![(target, false)];
    seen.insert(target);

    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            plan.push(id);
            continue;
        }
        stack.push((id, true));
        for input in inputs_of(id) {
            if !is_live(input) && seen.insert(input) {
                stack.push((input, false));
            }
        }
    }
    plan
}
