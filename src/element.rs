use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use crate::lock::ShardMutex;
use crate::reclaim::ReclaimInbox;

/// A key/value entry. The key is immutable; the value is replaced in place
/// so overwrites never relink the chain node pointing here.
///
/// The map itself holds elements only weakly. Whoever drops the last strong
/// reference triggers the drop hook, which reports the element's id to the
/// owning segment's reclaim inbox.
pub(crate) struct Element<K, V> {
    key: K,
    value: ShardMutex<Arc<V>>,
    id: u64,
    inbox: Weak<ReclaimInbox>,
}

impl<K, V> Element<K, V> {
    pub(crate) fn new(key: K, value: V, id: u64, inbox: Weak<ReclaimInbox>) -> Self {
        Self {
            key,
            value: ShardMutex::new(Arc::new(value)),
            id,
            inbox,
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot of the current value. Later in-place replacement does not
    /// affect snapshots already taken.
    pub(crate) fn value(&self) -> Arc<V> {
        self.value.lock().clone()
    }

    /// Replaces the value in place, returning the previous one.
    pub(crate) fn replace_value(&self, value: Arc<V>) -> Arc<V> {
        std::mem::replace(&mut *self.value.lock(), value)
    }
}

impl<K, V> Drop for Element<K, V> {
    fn drop(&mut self) {
        // The last strong reference is gone: this element has been
        // reclaimed. Surface it to the maintenance path. A dead inbox means
        // the owning map is already gone and nobody is left to purge.
        if let Some(inbox) = self.inbox.upgrade() {
            inbox.push(self.id);
        }
    }
}

/// A strong pin of one entry together with the value snapshot taken when
/// the guard was created.
///
/// Guards are what keep weak-mode entries alive: an entry stays in the map
/// while at least one guard for it exists. Dropping the last guard makes
/// the entry eligible for purging.
pub struct ElementGuard<K, V> {
    element: Arc<Element<K, V>>,
    value: Arc<V>,
}

impl<K, V> ElementGuard<K, V> {
    pub(crate) fn new(element: Arc<Element<K, V>>, value: Arc<V>) -> Self {
        Self { element, value }
    }

    /// The entry's key.
    pub fn key(&self) -> &K {
        self.element.key()
    }

    /// The value snapshot held by this guard.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Key and value together.
    pub fn pair(&self) -> (&K, &V) {
        (self.key(), self.value())
    }
}

impl<K, V> Clone for ElementGuard<K, V> {
    fn clone(&self) -> Self {
        Self {
            element: Arc::clone(&self.element),
            value: Arc::clone(&self.value),
        }
    }
}

impl<K, V> Deref for ElementGuard<K, V> {
    type Target = V;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for ElementGuard<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementGuard")
            .field("key", self.key())
            .field("value", self.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::{ReclaimMode, ReferenceManager};

    #[test]
    fn replace_returns_previous() {
        let manager: ReferenceManager<&str, u32> = ReferenceManager::new(ReclaimMode::Weak);
        let element = manager.create_element("k", 1);
        let old = element.replace_value(Arc::new(2));
        assert_eq!(*old, 1);
        assert_eq!(*element.value(), 2);
    }

    #[test]
    fn guard_keeps_snapshot_across_replacement() {
        let manager: ReferenceManager<&str, u32> = ReferenceManager::new(ReclaimMode::Weak);
        let element = manager.create_element("k", 1);
        let guard = ElementGuard::new(Arc::clone(&element), element.value());
        element.replace_value(Arc::new(2));
        assert_eq!(*guard, 1);
        assert_eq!(*element.value(), 2);
    }

    #[test]
    fn guard_accessors() {
        let manager: ReferenceManager<&str, u32> = ReferenceManager::new(ReclaimMode::Weak);
        let element = manager.create_element("k", 7);
        let guard = ElementGuard::new(Arc::clone(&element), element.value());
        assert_eq!(*guard.key(), "k");
        assert_eq!(*guard.value(), 7);
        assert_eq!(guard.pair(), (&"k", &7));
        let clone = guard.clone();
        assert_eq!(*clone, 7);
    }

    #[test]
    fn dropping_last_strong_reference_reports_to_inbox() {
        let manager: ReferenceManager<&str, u32> = ReferenceManager::new(ReclaimMode::Weak);
        let element = manager.create_element("k", 1);
        let id = element.id();
        assert_eq!(manager.poll_for_purge(), None);
        drop(element);
        assert_eq!(manager.poll_for_purge(), Some(id));
        assert_eq!(manager.poll_for_purge(), None);
    }
}
