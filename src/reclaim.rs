use std::collections::hash_map::RandomState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use hashbrown::HashMap;

use crate::element::Element;
use crate::lock::ShardMutex;

/// How the map holds its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReclaimMode {
    /// An entry lives only while some [`ElementGuard`] pins it. Dropping
    /// the last guard reclaims the entry.
    ///
    /// [`ElementGuard`]: crate::ElementGuard
    Weak,
    /// The map additionally retains every entry until
    /// [`advise_memory_pressure`] sheds the retention, after which
    /// unpinned entries reclaim as in weak mode. This is the default.
    ///
    /// [`advise_memory_pressure`]: crate::WispMap::advise_memory_pressure
    #[default]
    Soft,
}

/// Lock-free channel carrying the ids of reclaimed or released elements
/// from wherever they die to the owning segment's maintenance path.
pub(crate) struct ReclaimInbox {
    queue: SegQueue<u64>,
}

impl ReclaimInbox {
    fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    pub(crate) fn push(&self, id: u64) {
        self.queue.push(id);
    }

    fn pop(&self) -> Option<u64> {
        self.queue.pop()
    }
}

/// Per-segment registry: builds elements in the configured mode, keeps the
/// soft-mode retention table, and bridges reclamation into the inbox.
pub(crate) struct ReferenceManager<K, V> {
    retained: ShardMutex<HashMap<u64, Arc<Element<K, V>>, RandomState>>,
    inbox: Arc<ReclaimInbox>,
    next_id: AtomicU64,
    mode: ReclaimMode,
}

impl<K, V> ReferenceManager<K, V> {
    pub(crate) fn new(mode: ReclaimMode) -> Self {
        Self {
            retained: ShardMutex::new(HashMap::with_hasher(RandomState::new())),
            inbox: Arc::new(ReclaimInbox::new()),
            next_id: AtomicU64::new(0),
            mode,
        }
    }

    /// Builds a new element wired to this manager's inbox. In soft mode the
    /// retention table takes an extra strong reference so the entry outlives
    /// its guards until pressure is advised.
    pub(crate) fn create_element(&self, key: K, value: V) -> Arc<Element<K, V>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let element = Arc::new(Element::new(key, value, id, Arc::downgrade(&self.inbox)));
        if self.mode == ReclaimMode::Soft {
            self.retained.lock().insert(id, Arc::clone(&element));
        }
        element
    }

    /// Non-blocking: one id whose element has been reclaimed or released
    /// since the last poll, if any.
    pub(crate) fn poll_for_purge(&self) -> Option<u64> {
        self.inbox.pop()
    }

    /// Explicit release during removal. Pushing here guarantees the id
    /// surfaces from [`poll_for_purge`] promptly even while guards keep the
    /// element itself alive; the eventual drop hook may surface it a second
    /// time, which the exact-count rebuild tolerates.
    ///
    /// [`poll_for_purge`]: ReferenceManager::poll_for_purge
    pub(crate) fn release(&self, id: u64) {
        self.retained.lock().remove(&id);
        self.inbox.push(id);
    }

    /// Memory pressure: drop all soft retention. Entries without guards die
    /// here and report themselves through their drop hooks.
    pub(crate) fn shed_retention(&self) {
        let dropped = std::mem::take(&mut *self.retained.lock());
        drop(dropped);
    }

    #[cfg(test)]
    pub(crate) fn retained_len(&self) -> usize {
        self.retained.lock().len()
    }
}
