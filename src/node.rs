use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::element::Element;

/// One link of a bucket chain.
///
/// Both `hash` and `next` are fixed when the node is created: chains are
/// prepend-only and are replaced wholesale during removal and
/// restructuring, never spliced. The element is held weakly; a node whose
/// referent is gone is a tombstone awaiting the next restructure.
pub(crate) struct RefNode<K, V> {
    pub(crate) hash: u64,
    pub(crate) id: u64,
    pub(crate) entry: Weak<Element<K, V>>,
    pub(crate) next: Atomic<RefNode<K, V>>,
}

impl<K, V> RefNode<K, V> {
    /// Allocates a node chained in front of `next`.
    pub(crate) fn chained<'g>(
        hash: u64,
        id: u64,
        entry: Weak<Element<K, V>>,
        next: Shared<'g, RefNode<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, RefNode<K, V>> {
        Owned::new(RefNode {
            hash,
            id,
            entry,
            next: Atomic::from(next),
        })
        .into_shared(guard)
    }

    /// Strong handle to the referent, if it is still alive.
    pub(crate) fn upgrade(&self) -> Option<Arc<Element<K, V>>> {
        self.entry.upgrade()
    }

    /// Whether the referent is still alive. Racy in the way any liveness
    /// check is: a `true` may be stale by the time it is used.
    pub(crate) fn is_live(&self) -> bool {
        self.entry.strong_count() > 0
    }

    pub(crate) fn next<'g>(&self, guard: &'g Guard) -> Shared<'g, RefNode<K, V>> {
        self.next.load(Ordering::Acquire, guard)
    }
}
