//! The persistent exploration tree: [`ExplorationNode`] bookkeeping, the
//! preemption-count computation, and sleep-set propagation (spec.md §4.1).
//!
//! Nodes are keyed by the path of thread choices from the root rather than
//! linked by back-pointers, per spec.md §9 "model this with an arena+index
//! scheme ... with no back-pointers" — the path itself is the index.

use crate::event::ThreadId;
use crate::key::ObjectKey;
use std::collections::{BTreeMap, BTreeSet};

/// One scheduling decision in the tree (spec.md §3 `ExplorationNode`).
///
/// Keyed externally by the path of thread choices leading to it; a node
/// survives across executions so that `done`/`sleep`/`backtrack` accumulate
/// as new executions visit it.
#[derive(Debug, Clone, Default)]
pub struct ExplorationNode {
    /// Threads that were runnable when this decision was made.
    pub enabled: BTreeSet<ThreadId>,
    /// The thread chosen on the most recent visit. Transient: a node may be
    /// visited again later with a different choice drawn from `backtrack`.
    pub chosen: Option<ThreadId>,
    /// Threads already explored from this point.
    pub done: BTreeSet<ThreadId>,
    /// Threads whose alternative has been proved Mazurkiewicz-equivalent to
    /// one already explored, and so need not be retried.
    pub sleep: BTreeSet<ThreadId>,
    /// Threads whose alternative still must be explored at this point.
    pub backtrack: BTreeSet<ThreadId>,
    /// First event reported by each thread the first time it ran from this
    /// node, used only for the sleep-set conflict check below. Not part of
    /// the specified node shape; pure bookkeeping.
    pub(crate) first_events: BTreeMap<ThreadId, (ObjectKey, crate::event::EventKind)>,
}

impl ExplorationNode {
    /// `backtrack` entries not yet explored or slept — the actual set of
    /// alternatives this node still owes the engine.
    pub fn pending(&self) -> BTreeSet<ThreadId> {
        self.backtrack
            .difference(&self.done)
            .filter(|t| !self.sleep.contains(t))
            .copied()
            .collect()
    }
}

/// The full persistent tree, keyed by path-from-root.
#[derive(Debug, Default)]
pub struct ExplorationTree {
    nodes: BTreeMap<Vec<ThreadId>, ExplorationNode>,
}

impl ExplorationTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// The node at `path`, creating an empty one if this is its first visit.
    pub fn node_mut(&mut self, path: &[ThreadId]) -> &mut ExplorationNode {
        self.nodes.entry(path.to_vec()).or_default()
    }

    pub fn node(&self, path: &[ThreadId]) -> Option<&ExplorationNode> {
        self.nodes.get(path)
    }

    /// Propagate a child's initial sleep set per spec.md §4.1 "Sleep-set
    /// propagation": inherited from the parent's `sleep ∪ backtrack`, minus
    /// `chosen` itself, minus any sibling whose cached first event conflicts
    /// with `chosen`'s first event this run. Threads whose first event is
    /// unknown are conservatively kept asleep-ineligible (not added) rather
    /// than assumed independent — a documented simplification (DESIGN.md).
    pub fn child_sleep_set(
        &self,
        parent_path: &[ThreadId],
        chosen: ThreadId,
        chosen_first_event: Option<&(ObjectKey, crate::event::EventKind)>,
    ) -> BTreeSet<ThreadId> {
        let Some(parent) = self.node(parent_path) else {
            return BTreeSet::new();
        };
        let mut inherited: BTreeSet<ThreadId> =
            parent.sleep.union(&parent.backtrack).copied().collect();
        inherited.remove(&chosen);

        match chosen_first_event {
            None => BTreeSet::new(),
            Some((key, kind)) => inherited
                .into_iter()
                .filter(|t| match parent.first_events.get(t) {
                    Some((other_key, other_kind)) => {
                        !conflicts(key, *kind, other_key, *other_kind)
                    }
                    // Unknown pending event: conservatively drop from sleep
                    // rather than risk skipping a schedule that differs.
                    None => false,
                })
                .collect(),
        }
    }
}

fn conflicts(
    a_key: &ObjectKey,
    a_kind: crate::event::EventKind,
    b_key: &ObjectKey,
    b_kind: crate::event::EventKind,
) -> bool {
    use crate::event::EventKind::*;
    a_key == b_key
        && matches!(a_kind, Read | Write)
        && matches!(b_kind, Read | Write)
        && (matches!(a_kind, Write) || matches!(b_kind, Write))
}

/// Number of thread switches along `path` where the outgoing thread was
/// still runnable at the switch point (spec.md §4.1 "Preemption count").
///
/// `enabled_at(j)` must return the `enabled` set recorded at the node
/// reached after `j` decisions (i.e. the node deciding step `j`).
pub fn preemption_count(path: &[ThreadId], tree: &ExplorationTree) -> u32 {
    let mut count = 0;
    for j in 1..path.len() {
        if path[j] != path[j - 1] {
            if let Some(node) = tree.node(&path[..j]) {
                if node.enabled.contains(&path[j - 1]) {
                    count += 1;
                }
            }
        }
    }
    count
}
