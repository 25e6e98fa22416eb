//! The shared, reference-counted filter chain.
//!
//! Installed filters form a tree: each install prepends a node whose `prev`
//! link points at the chain it was layered on, and fork makes the child
//! share the parent's leaf. From any one task the tree looks like a singly
//! linked list from its leaf to the root. Nodes are owned by an arena and
//! addressed by [`NodeId`] handles rather than pointers, which keeps
//! destruction an explicit, iterative walk.
//!
//! # Invariants
//!
//! - A node reachable from any task is never mutated again except for its
//!   usage count and `log` flag.
//! - Structural arena changes (insert, free) happen under the arena write
//!   lock; usage counts are atomics so forks and releases on unrelated
//!   tasks only contend on the read side.
//! - Release walks `prev` iteratively, freeing every node whose count hits
//!   zero and stopping at the first node still shared; deep chains must not
//!   recurse.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::notify::NotificationChannel;
use crate::program::CompiledProgram;

/// Instruction-count ceiling for any path from a leaf to the root.
pub const MAX_INSNS_PER_PATH: u64 = (1 << 18) / 8;

/// Fixed per-layer instruction overhead charged against the path budget.
pub const LAYER_OVERHEAD_INSNS: u64 = 4;

/// Handle to one node in the filter arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

/// One installed filter: a compiled program plus chain metadata.
pub(crate) struct FilterNode {
    /// The verified program this node evaluates.
    pub(crate) program: Box<dyn CompiledProgram>,
    /// Whether non-allow outcomes from this node ask to be logged.
    pub(crate) log: AtomicBool,
    /// The chain this node was layered on; `None` is the root.
    pub(crate) prev: Option<NodeId>,
    /// Rendezvous channel, present only for listener installs.
    pub(crate) notify: Option<Arc<NotificationChannel>>,
    /// Tasks and descendants (and at most one listener) holding this node.
    usage: AtomicUsize,
}

impl FilterNode {
    pub(crate) fn new(
        program: Box<dyn CompiledProgram>,
        log: bool,
        prev: Option<NodeId>,
        notify: Option<Arc<NotificationChannel>>,
    ) -> Self {
        Self {
            program,
            log: AtomicBool::new(log),
            prev,
            notify,
            usage: AtomicUsize::new(1),
        }
    }

    /// Current usage count; diagnostic only, racy by nature.
    pub(crate) fn usage(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    /// Takes one more reference.
    pub(crate) fn bump(&self) {
        self.usage.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference; true when this was the last one.
    pub(crate) fn unref(&self) -> bool {
        self.usage.fetch_sub(1, Ordering::Release) == 1
    }
}

/// Arena owning every live filter node.
///
/// Freed slots are recycled; a [`NodeId`] stays valid exactly as long as
/// its usage count is held above zero, which every handle owner
/// guarantees by construction.
#[derive(Default)]
pub(crate) struct FilterArena {
    slots: Vec<Option<FilterNode>>,
    free: Vec<usize>,
}

impl FilterArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts a node with an initial usage count of one.
    pub(crate) fn insert(&mut self, node: FilterNode) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                NodeId(slot as u32)
            }
            None => {
                self.slots.push(Some(node));
                NodeId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&FilterNode> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// Frees a slot, returning the node for the caller to unwind.
    pub(crate) fn remove(&mut self, id: NodeId) -> Option<FilterNode> {
        let slot = self.slots.get_mut(id.0 as usize)?;
        let node = slot.take();
        if node.is_some() {
            self.free.push(id.0 as usize);
        }
        node
    }

    /// Number of live nodes, diagnostic only.
    pub(crate) fn live_nodes(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether `parent` appears on the chain starting at `child`.
    ///
    /// `None` is the root ancestor of every chain.
    pub(crate) fn is_ancestor(
        &self,
        parent: Option<NodeId>,
        child: Option<NodeId>,
    ) -> bool {
        let Some(parent) = parent else {
            return true;
        };
        let mut cursor = child;
        while let Some(id) = cursor {
            if id == parent {
                return true;
            }
            cursor = self.get(id).and_then(|node| node.prev);
        }
        false
    }

    /// Chain length from `leaf` to the root.
    pub(crate) fn chain_len(&self, leaf: Option<NodeId>) -> usize {
        let mut len = 0;
        let mut cursor = leaf;
        while let Some(id) = cursor {
            len += 1;
            cursor = self.get(id).and_then(|node| node.prev);
        }
        len
    }

    /// Budgeted instruction total for the chain starting at `leaf`: each
    /// layer is charged its program length plus the fixed overhead.
    pub(crate) fn path_instruction_total(&self, leaf: Option<NodeId>) -> u64 {
        let mut total = 0u64;
        let mut cursor = leaf;
        while let Some(id) = cursor {
            match self.get(id) {
                Some(node) => {
                    total += node.program.instruction_count() as u64 + LAYER_OVERHEAD_INSNS;
                    cursor = node.prev;
                }
                None => break,
            }
        }
        total
    }

    /// Whether any node on the chain starting at `leaf` carries a
    /// notification channel.
    pub(crate) fn chain_has_listener(&self, leaf: Option<NodeId>) -> bool {
        let mut cursor = leaf;
        while let Some(id) = cursor {
            match self.get(id) {
                Some(node) => {
                    if node.notify.is_some() {
                        return true;
                    }
                    cursor = node.prev;
                }
                None => break,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::RET_ALLOW;
    use crate::program::testing::{ret_program, StubCompiler};
    use crate::program::{prepare, ProgramCompiler};

    fn node(arena: &mut FilterArena, prev: Option<NodeId>) -> NodeId {
        let compiler = StubCompiler::new();
        let program = prepare(&compiler, &ret_program(RET_ALLOW)).unwrap();
        arena.insert(FilterNode::new(program, false, prev, None))
    }

    fn sized_node(arena: &mut FilterArena, prev: Option<NodeId>, len: usize) -> NodeId {
        let compiler = StubCompiler::with_fallback(|_| RET_ALLOW);
        let bytes = crate::program::testing::padded_program(RET_ALLOW, len);
        let program = compiler
            .compile(&crate::program::decode_program(&bytes).unwrap())
            .unwrap();
        arena.insert(FilterNode::new(program, false, prev, None))
    }

    #[test]
    fn insert_recycles_freed_slots() {
        let mut arena = FilterArena::new();
        let a = node(&mut arena, None);
        let b = node(&mut arena, None);
        assert_ne!(a, b);
        arena.remove(a);
        let c = node(&mut arena, None);
        assert_eq!(c, a);
        assert_eq!(arena.live_nodes(), 2);
    }

    #[test]
    fn ancestor_of_none_is_everything() {
        let mut arena = FilterArena::new();
        let a = node(&mut arena, None);
        assert!(arena.is_ancestor(None, Some(a)));
        assert!(arena.is_ancestor(None, None));
    }

    #[test]
    fn ancestor_walks_prev_links() {
        let mut arena = FilterArena::new();
        let root = node(&mut arena, None);
        let mid = node(&mut arena, Some(root));
        let leaf = node(&mut arena, Some(mid));
        let stranger = node(&mut arena, None);

        assert!(arena.is_ancestor(Some(root), Some(leaf)));
        assert!(arena.is_ancestor(Some(mid), Some(leaf)));
        assert!(arena.is_ancestor(Some(leaf), Some(leaf)));
        assert!(!arena.is_ancestor(Some(leaf), Some(root)));
        assert!(!arena.is_ancestor(Some(stranger), Some(leaf)));
        assert!(!arena.is_ancestor(Some(root), None));
    }

    #[test]
    fn path_total_charges_layer_overhead() {
        let mut arena = FilterArena::new();
        let root = sized_node(&mut arena, None, 10);
        let leaf = sized_node(&mut arena, Some(root), 3);
        assert_eq!(
            arena.path_instruction_total(Some(leaf)),
            10 + LAYER_OVERHEAD_INSNS + 3 + LAYER_OVERHEAD_INSNS
        );
        assert_eq!(arena.path_instruction_total(None), 0);
    }

    #[test]
    fn chain_len_counts_to_root() {
        let mut arena = FilterArena::new();
        let root = node(&mut arena, None);
        let leaf = node(&mut arena, Some(root));
        assert_eq!(arena.chain_len(Some(leaf)), 2);
        assert_eq!(arena.chain_len(Some(root)), 1);
        assert_eq!(arena.chain_len(None), 0);
    }

    #[test]
    fn usage_counting_is_per_node() {
        let mut arena = FilterArena::new();
        let a = node(&mut arena, None);
        let n = arena.get(a).unwrap();
        assert_eq!(n.usage(), 1);
        n.bump();
        assert_eq!(n.usage(), 2);
        assert!(!n.unref());
        assert!(n.unref());
    }
}
