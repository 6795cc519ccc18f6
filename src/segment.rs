use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use hashbrown::HashSet;

use crate::element::{Element, ElementGuard};
use crate::lock::ShardMutex;
use crate::node::RefNode;
use crate::options::MAX_TABLE_LEN;
use crate::reclaim::{ReclaimMode, ReferenceManager};

/// Bucket array of chain heads. Published wholesale when the segment grows;
/// individual heads are republished (whole prebuilt chains only) during
/// in-place restructuring.
struct Table<K, V> {
    buckets: Box<[Atomic<RefNode<K, V>>]>,
}

impl<K, V> Table<K, V> {
    fn new(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        Self {
            buckets: (0..len).map(|_| Atomic::null()).collect(),
        }
    }

    fn from_heads(heads: Vec<Shared<'_, RefNode<K, V>>>) -> Self {
        Self {
            buckets: heads.into_iter().map(Atomic::from).collect(),
        }
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, hash: u64) -> &Atomic<RefNode<K, V>> {
        &self.buckets[hash as usize & (self.buckets.len() - 1)]
    }
}

fn resize_threshold(len: usize, load_factor: f32) -> usize {
    (len as f32 * load_factor) as usize
}

/// A mutation intent, dispatched under the segment lock.
pub(crate) enum Mutation<'q, Q: ?Sized, K, V> {
    /// Map `key` to `value`; `overwrite` selects between put and
    /// put-if-absent behavior on an existing live mapping.
    Insert { key: K, value: V, overwrite: bool },
    /// Unlink the live entry matching `key`, subject to `condition`.
    Remove {
        key: &'q Q,
        condition: Option<&'q mut (dyn FnMut(&K, &V) -> bool + 'q)>,
    },
}

/// What a mutation observed and did.
pub(crate) struct MutationResult<K, V> {
    /// The live mapping already present: the pre-replacement snapshot for
    /// overwrites, the untouched snapshot for declined put-if-absent, the
    /// removed mapping for removals.
    pub(crate) existing: Option<ElementGuard<K, V>>,
    /// The mapping created by this mutation, if any.
    pub(crate) inserted: Option<ElementGuard<K, V>>,
}

impl<K, V> MutationResult<K, V> {
    fn none() -> Self {
        Self {
            existing: None,
            inserted: None,
        }
    }
}

/// One independently lockable shard: an epoch-published table of prepend-only
/// chains, a live-count upper bound, and the reclaim machinery for the
/// entries routed here.
pub(crate) struct Segment<K, V> {
    lock: ShardMutex<()>,
    table: Atomic<Table<K, V>>,
    count: AtomicUsize,
    threshold: AtomicUsize,
    initial_len: usize,
    load_factor: f32,
    manager: ReferenceManager<K, V>,
}

impl<K, V> Segment<K, V>
where
    K: Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(initial_len: usize, load_factor: f32, mode: ReclaimMode) -> Self {
        Self {
            lock: ShardMutex::new(()),
            table: Atomic::new(Table::new(initial_len)),
            count: AtomicUsize::new(0),
            threshold: AtomicUsize::new(resize_threshold(initial_len, load_factor)),
            initial_len,
            load_factor,
            manager: ReferenceManager::new(mode),
        }
    }

    /// Lock-free lookup yielding a pinned guard.
    pub(crate) fn find<Q>(&self, hash: u64, key: &Q) -> Option<ElementGuard<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.entry_of(hash, key).map(|element| {
            let value = element.value();
            ElementGuard::new(element, value)
        })
    }

    pub(crate) fn contains<Q>(&self, hash: u64, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.entry_of(hash, key).is_some()
    }

    fn entry_of<Q>(&self, hash: u64, key: &Q) -> Option<Arc<Element<K, V>>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        if self.count.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let guard = epoch::pin();
        let table = self.table.load(Ordering::Acquire, &guard);
        // Invariant: the table pointer is non-null for the segment's lifetime.
        let table = unsafe { table.deref() };
        let mut cur = table.bucket(hash).load(Ordering::Acquire, &guard);
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.hash == hash {
                if let Some(element) = node.upgrade() {
                    if element.key().borrow() == key {
                        return Some(element);
                    }
                }
            }
            cur = node.next(&guard);
        }
        None
    }

    pub(crate) fn insert(&self, hash: u64, key: K, value: V, overwrite: bool) -> MutationResult<K, V> {
        self.mutate::<K>(
            hash,
            Mutation::Insert {
                key,
                value,
                overwrite,
            },
        )
    }

    pub(crate) fn remove<Q>(&self, hash: u64, key: &Q) -> MutationResult<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.mutate(
            hash,
            Mutation::Remove {
                key,
                condition: None,
            },
        )
    }

    pub(crate) fn remove_if<Q, F>(&self, hash: u64, key: &Q, condition: F) -> MutationResult<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        F: FnOnce(&K, &V) -> bool,
    {
        let mut condition = Some(condition);
        let mut check = |key: &K, value: &V| match condition.take() {
            Some(f) => f(key, value),
            None => false,
        };
        self.mutate(
            hash,
            Mutation::Remove {
                key,
                condition: Some(&mut check),
            },
        )
    }

    /// The generic mutation primitive: restructure policy, lock, dispatch.
    pub(crate) fn mutate<Q>(&self, hash: u64, mutation: Mutation<'_, Q, K, V>) -> MutationResult<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let inserting = matches!(mutation, Mutation::Insert { .. });
        if inserting {
            self.restructure_if_necessary(true);
        } else if self.count.load(Ordering::Relaxed) == 0 {
            // Removing from an empty segment: nothing to unlink or purge.
            return MutationResult::none();
        }

        let result = {
            let _lock = self.lock.lock();
            let guard = epoch::pin();
            self.mutate_locked(hash, mutation, &guard)
        };

        self.restructure_if_necessary(inserting);
        result
    }

    fn mutate_locked<Q>(
        &self,
        hash: u64,
        mutation: Mutation<'_, Q, K, V>,
        guard: &Guard,
    ) -> MutationResult<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let table = self.table.load(Ordering::Acquire, guard);
        // Invariant: the table pointer is non-null for the segment's lifetime.
        let table = unsafe { table.deref() };
        let head = table.bucket(hash).load(Ordering::Acquire, guard);

        let search: &Q = match &mutation {
            Mutation::Insert { key, .. } => key.borrow(),
            Mutation::Remove { key, .. } => *key,
        };
        let mut found: Option<(Shared<'_, RefNode<K, V>>, Arc<Element<K, V>>)> = None;
        let mut cur = head;
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.hash == hash {
                if let Some(element) = node.upgrade() {
                    if element.key().borrow() == search {
                        found = Some((cur, element));
                        break;
                    }
                }
            }
            cur = node.next(guard);
        }

        match mutation {
            Mutation::Insert {
                key,
                value,
                overwrite,
            } => match found {
                Some((_, element)) => {
                    let prior = if overwrite {
                        element.replace_value(Arc::new(value))
                    } else {
                        element.value()
                    };
                    MutationResult {
                        existing: Some(ElementGuard::new(element, prior)),
                        inserted: None,
                    }
                }
                None => {
                    let element = self.manager.create_element(key, value);
                    let node =
                        RefNode::chained(hash, element.id(), Arc::downgrade(&element), head, guard);
                    table.bucket(hash).store(node, Ordering::Release);
                    self.count.fetch_add(1, Ordering::Relaxed);
                    let value = element.value();
                    MutationResult {
                        existing: None,
                        inserted: Some(ElementGuard::new(element, value)),
                    }
                }
            },
            Mutation::Remove { condition, .. } => match found {
                Some((target, element)) => {
                    let value = element.value();
                    if let Some(condition) = condition {
                        if !condition(element.key(), &value) {
                            return MutationResult::none();
                        }
                    }

                    // Rebuild the chain: rewrap the prefix, share the
                    // untouched suffix past the target.
                    let target_node = unsafe { target.deref() };
                    let mut new_head = target_node.next(guard);
                    let mut prefix = Vec::new();
                    let mut cur = head;
                    while cur.as_raw() != target.as_raw() {
                        prefix.push(cur);
                        cur = unsafe { cur.deref() }.next(guard);
                    }
                    for shared in prefix.iter().rev() {
                        let node = unsafe { shared.deref() };
                        new_head =
                            RefNode::chained(node.hash, node.id, node.entry.clone(), new_head, guard);
                    }
                    table.bucket(hash).store(new_head, Ordering::Release);
                    for shared in prefix {
                        // Safety: rewrapped above, unreachable from the new chain.
                        unsafe { guard.defer_destroy(shared) };
                    }
                    // Safety: omitted from the new chain.
                    unsafe { guard.defer_destroy(target) };

                    self.manager.release(element.id());
                    MutationResult {
                        existing: Some(ElementGuard::new(element, value)),
                        inserted: None,
                    }
                }
                None => MutationResult::none(),
            },
        }
    }

    /// Unlocked check, then the locked purge-and-maybe-resize pass. Cheap
    /// when the inbox is empty and the threshold has not been crossed.
    pub(crate) fn restructure_if_necessary(&self, allow_resize: bool) {
        let count = self.count.load(Ordering::Relaxed);
        let needs_resize = count > 0 && count >= self.threshold.load(Ordering::Relaxed);
        let first = self.manager.poll_for_purge();
        if first.is_none() && !(allow_resize && needs_resize) {
            return;
        }
        let _lock = self.lock.lock();
        self.restructure(allow_resize, first);
    }

    /// Caller holds the segment lock; `first` was already consumed from the
    /// inbox by the unlocked check.
    fn restructure(&self, allow_resize: bool, first: Option<u64>) {
        let guard = epoch::pin();

        let mut purged: HashSet<u64, RandomState> = HashSet::with_hasher(RandomState::new());
        if let Some(id) = first {
            purged.insert(id);
            while let Some(id) = self.manager.poll_for_purge() {
                purged.insert(id);
            }
        }

        let estimated = self
            .count
            .load(Ordering::Relaxed)
            .saturating_sub(purged.len());
        let needs_resize = estimated > 0 && estimated >= self.threshold.load(Ordering::Relaxed);

        let table_shared = self.table.load(Ordering::Acquire, &guard);
        // Invariant: the table pointer is non-null for the segment's lifetime.
        let table = unsafe { table_shared.deref() };
        let old_len = table.len();
        let growing = allow_resize && needs_resize && old_len < MAX_TABLE_LEN;
        let new_len = if growing { old_len * 2 } else { old_len };

        // Mark and rebuild: every survivor is rewrapped at its recomputed
        // bucket. Replacement chains are complete before any head is
        // published, so readers only ever see whole chains.
        let mut heads: Vec<Shared<'_, RefNode<K, V>>> = vec![Shared::null(); new_len];
        let mut retired: Vec<Shared<'_, RefNode<K, V>>> = Vec::new();
        let mut rebuilt = 0usize;

        for bucket in table.buckets.iter() {
            let mut cur = bucket.load(Ordering::Acquire, &guard);
            while let Some(node) = unsafe { cur.as_ref() } {
                retired.push(cur);
                // A reference that dies after this check lingers until the
                // next pass.
                if !purged.contains(&node.id) && node.is_live() {
                    let index = node.hash as usize & (new_len - 1);
                    heads[index] = RefNode::chained(
                        node.hash,
                        node.id,
                        node.entry.clone(),
                        heads[index],
                        &guard,
                    );
                    rebuilt += 1;
                }
                cur = node.next(&guard);
            }
        }

        if growing {
            self.table
                .store(Owned::new(Table::from_heads(heads)), Ordering::Release);
            self.threshold
                .store(resize_threshold(new_len, self.load_factor), Ordering::Relaxed);
            // Safety: unreachable once the new table is published; its nodes
            // are retired individually below.
            unsafe { guard.defer_destroy(table_shared) };
        } else {
            for (bucket, head) in table.buckets.iter().zip(heads) {
                bucket.store(head, Ordering::Release);
            }
        }

        for node in retired {
            // Safety: every pre-pass node was replaced by the rebuild and is
            // unreachable from the published table.
            unsafe { guard.defer_destroy(node) };
        }

        self.count.store(rebuilt, Ordering::Relaxed);
    }

    /// Exact number of live entries, by a full lock-free walk.
    pub(crate) fn live_entries(&self) -> usize {
        if self.count.load(Ordering::Relaxed) == 0 {
            return 0;
        }
        let guard = epoch::pin();
        // Invariant: the table pointer is non-null for the segment's lifetime.
        let table = unsafe { self.table.load(Ordering::Acquire, &guard).deref() };
        let mut live = 0;
        for bucket in table.buckets.iter() {
            let mut cur = bucket.load(Ordering::Acquire, &guard);
            while let Some(node) = unsafe { cur.as_ref() } {
                if node.is_live() {
                    live += 1;
                }
                cur = node.next(&guard);
            }
        }
        live
    }

    /// Pins every live entry reachable from the table published at call
    /// time. The iterator consumes one segment's snapshot at a time.
    pub(crate) fn snapshot(&self) -> Vec<ElementGuard<K, V>> {
        let guard = epoch::pin();
        // Invariant: the table pointer is non-null for the segment's lifetime.
        let table = unsafe { self.table.load(Ordering::Acquire, &guard).deref() };
        let mut entries = Vec::new();
        for bucket in table.buckets.iter() {
            let mut cur = bucket.load(Ordering::Acquire, &guard);
            while let Some(node) = unsafe { cur.as_ref() } {
                if let Some(element) = node.upgrade() {
                    let value = element.value();
                    entries.push(ElementGuard::new(element, value));
                }
                cur = node.next(&guard);
            }
        }
        entries
    }

    /// Replaces the table with a fresh one of the initial length and drops
    /// all soft retention.
    pub(crate) fn clear(&self) {
        if self.count.load(Ordering::Relaxed) == 0 {
            return;
        }
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let old_shared = self.table.swap(
            Owned::new(Table::new(self.initial_len)),
            Ordering::AcqRel,
            &guard,
        );
        let old = unsafe { old_shared.deref() };
        for bucket in old.buckets.iter() {
            let mut cur = bucket.load(Ordering::Acquire, &guard);
            while let Some(node) = unsafe { cur.as_ref() } {
                let next = node.next(&guard);
                // Safety: unreachable, the replacement table is published.
                unsafe { guard.defer_destroy(cur) };
                cur = next;
            }
        }
        // Safety: same as above.
        unsafe { guard.defer_destroy(old_shared) };
        self.count.store(0, Ordering::Relaxed);
        self.threshold.store(
            resize_threshold(self.initial_len, self.load_factor),
            Ordering::Relaxed,
        );
        self.manager.shed_retention();
    }

    /// Drops all soft retention for this segment.
    pub(crate) fn shed_retention(&self) {
        self.manager.shed_retention();
    }

    #[cfg(test)]
    pub(crate) fn table_len(&self) -> usize {
        let guard = epoch::pin();
        unsafe { self.table.load(Ordering::Acquire, &guard).deref() }.len()
    }

    #[cfg(test)]
    pub(crate) fn raw_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl<K, V> Drop for Segment<K, V> {
    fn drop(&mut self) {
        // Tear down the current table. Replaced tables and unlinked nodes
        // were already retired to the collector.
        let guard = unsafe { epoch::unprotected() };
        let table_shared = self.table.swap(Shared::null(), Ordering::Relaxed, guard);
        if table_shared.is_null() {
            return;
        }
        {
            let table = unsafe { table_shared.deref() };
            for bucket in table.buckets.iter() {
                let mut cur = bucket.load(Ordering::Relaxed, guard);
                while !cur.is_null() {
                    let next = unsafe { cur.deref() }.next(guard);
                    drop(unsafe { cur.into_owned() });
                    cur = next;
                }
            }
        }
        drop(unsafe { table_shared.into_owned() });
    }
}
