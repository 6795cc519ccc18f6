//! A concurrent hash map whose entries can be reclaimed when no longer
//! pinned.
//!
//! Entries are held through reclaimable references rather than owned
//! outright. In [`ReclaimMode::Weak`] an entry stays alive only while some
//! [`ElementGuard`] pins it; in the default [`ReclaimMode::Soft`] the map
//! itself keeps entries alive until [`WispMap::advise_memory_pressure`]
//! tells it to let go. Reclaimed entries are purged from the table
//! opportunistically during later operations, so the map self-cleans under
//! ordinary use.
//!
//! Reads are lock-free. Writes lock only the segment that owns the key, so
//! mutations on disjoint keys proceed in parallel.
//!
//! ```
//! use wispmap::WispMap;
//!
//! let map = WispMap::new();
//! map.insert("alpha", 1);
//! map.insert("beta", 2);
//!
//! assert_eq!(*map.get("alpha").unwrap(), 1);
//! assert_eq!(map.len(), 2);
//!
//! let removed = map.remove("alpha").unwrap();
//! assert_eq!(*removed, 1);
//! assert!(!map.contains_key("alpha"));
//! ```

mod element;
mod iter;
mod lock;
mod node;
mod options;
mod reclaim;
mod segment;
#[cfg(feature = "serde")]
mod serde;
mod util;

pub use element::ElementGuard;
pub use iter::Iter;
pub use options::{
    Options, OptionsError, DEFAULT_CONCURRENCY, DEFAULT_INITIAL_CAPACITY, DEFAULT_LOAD_FACTOR,
};
pub use reclaim::ReclaimMode;

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use crossbeam_utils::CachePadded;

use crate::options::{MAX_CONCURRENCY, MAX_TABLE_LEN};
use crate::segment::Segment;

/// Concurrent hash map over reclaimable entries.
///
/// Keys are routed to one of a fixed set of segments by the high bits of
/// their hash; each segment locks independently for writes and is read
/// without locking. See the crate docs for the reclamation model.
pub struct WispMap<K, V, S = RandomState> {
    segments: Box<[CachePadded<Segment<K, V>>]>,
    hasher: S,
    shift: u32,
    load_factor: f32,
    mode: ReclaimMode,
}

impl<K, V> WispMap<K, V, RandomState>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a map with default capacity, concurrency, and reclaim mode.
    pub fn new() -> Self {
        Self::with_options(&Options::new(), RandomState::new())
    }

    /// Creates a map sized to hold `capacity` entries before any segment
    /// grows.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_options(&Options::new().initial_capacity(capacity), RandomState::new())
    }

    /// Creates a map holding its entries in the given [`ReclaimMode`].
    pub fn with_mode(mode: ReclaimMode) -> Self {
        Self::with_options(&Options::new().mode(mode), RandomState::new())
    }
}

impl<K, V, S> WispMap<K, V, S> {
    pub(crate) fn segments(&self) -> &[CachePadded<Segment<K, V>>] {
        &self.segments
    }
}

impl<K, V, S> WispMap<K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_options(&Options::new(), hasher)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self::with_options(&Options::new().initial_capacity(capacity), hasher)
    }

    /// Builds the segment array for validated options. [`Options::build`]
    /// is the checked public entry.
    pub(crate) fn with_options(options: &Options, hasher: S) -> Self {
        let shift = util::calculate_shift(options.concurrency, MAX_CONCURRENCY);
        let segment_count = 1usize << shift;
        let per_segment = options.initial_capacity / segment_count
            + usize::from(options.initial_capacity % segment_count != 0);
        let table_shift = util::calculate_shift(per_segment, MAX_TABLE_LEN);
        let initial_len = 1usize << table_shift;
        let segments = (0..segment_count)
            .map(|_| CachePadded::new(Segment::new(initial_len, options.load_factor, options.mode)))
            .collect();
        Self {
            segments,
            hasher,
            shift,
            load_factor: options.load_factor,
            mode: options.mode,
        }
    }

    fn segment_for(&self, hash: u64) -> &Segment<K, V> {
        // A single segment has shift 0; the wrapping full-width shift is a
        // no-op there and the zero mask routes everything to index 0.
        let index = hash.wrapping_shr(64 - self.shift) as usize & (self.segments.len() - 1);
        &self.segments[index]
    }

    /// Returns a guard pinning the live entry for `key`, if any.
    ///
    /// Lock-free. The guard's value is the snapshot current at lookup
    /// time; in weak mode the entry cannot be reclaimed while the guard
    /// lives.
    pub fn get<Q>(&self, key: &Q) -> Option<ElementGuard<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
    {
        let hash = util::hash_key(&self.hasher, key);
        let segment = self.segment_for(hash);
        segment.restructure_if_necessary(false);
        segment.find(hash, key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
    {
        let hash = util::hash_key(&self.hasher, key);
        let segment = self.segment_for(hash);
        segment.restructure_if_necessary(false);
        segment.contains(hash, key)
    }

    /// Maps `key` to `value`, replacing any live mapping's value in place.
    ///
    /// Returns a guard over the previous value when one was present. A
    /// replaced entry keeps its identity: guards taken earlier stay valid
    /// and keep the snapshot they were created with.
    pub fn insert(&self, key: K, value: V) -> Option<ElementGuard<K, V>> {
        let hash = util::hash_key(&self.hasher, &key);
        self.segment_for(hash).insert(hash, key, value, true).existing
    }

    /// Maps `key` to `value` only when no live mapping exists.
    ///
    /// Returns a guard over the existing value when one blocked the
    /// insert.
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<ElementGuard<K, V>> {
        let hash = util::hash_key(&self.hasher, &key);
        self.segment_for(hash).insert(hash, key, value, false).existing
    }

    /// Returns a guard for `key`, inserting `value` first when no live
    /// mapping exists.
    ///
    /// ```
    /// use wispmap::WispMap;
    ///
    /// let map = WispMap::new();
    /// assert_eq!(*map.get_or_insert("k", 1), 1);
    /// assert_eq!(*map.get_or_insert("k", 9), 1);
    /// ```
    pub fn get_or_insert(&self, key: K, value: V) -> ElementGuard<K, V> {
        let hash = util::hash_key(&self.hasher, &key);
        let result = self.segment_for(hash).insert(hash, key, value, false);
        match result.existing.or(result.inserted) {
            Some(entry) => entry,
            // An insert that created nothing must have found something.
            None => unreachable!("insert reported neither an existing nor an inserted entry"),
        }
    }

    /// Removes the live mapping for `key`, returning a guard over its
    /// value.
    pub fn remove<Q>(&self, key: &Q) -> Option<ElementGuard<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
    {
        let hash = util::hash_key(&self.hasher, key);
        self.segment_for(hash).remove(hash, key).existing
    }

    /// Removes the live mapping for `key` only when `condition` accepts
    /// it.
    ///
    /// The condition runs under the segment lock with the entry still
    /// mapped; a declined removal leaves the map untouched and returns
    /// `None`.
    pub fn remove_if<Q, F>(&self, key: &Q, condition: F) -> Option<ElementGuard<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
        F: FnOnce(&K, &V) -> bool,
    {
        let hash = util::hash_key(&self.hasher, key);
        self.segment_for(hash).remove_if(hash, key, condition).existing
    }

    /// Number of live entries, counted by a full traversal.
    ///
    /// Exact with respect to each segment at the moment it is visited;
    /// concurrent mutation can change the total before it returns.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|segment| segment.live_entries()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| segment.live_entries() == 0)
    }

    /// Drops every entry and resets each segment to its initial table
    /// length.
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.clear();
        }
    }

    /// Iterates over pinned entry guards. See [`Iter`] for the consistency
    /// contract.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter::new(self)
    }

    /// Releases the map's own hold on softly held entries.
    ///
    /// After this call a softly held entry survives only while guards pin
    /// it, exactly as in weak mode; entries left unpinned become
    /// reclaimable at once. No-op in weak mode.
    ///
    /// ```
    /// use wispmap::WispMap;
    ///
    /// let map = WispMap::new();
    /// map.insert("transient", 1);
    /// map.advise_memory_pressure();
    /// assert!(map.get("transient").is_none());
    /// ```
    pub fn advise_memory_pressure(&self) {
        for segment in self.segments.iter() {
            segment.shed_retention();
        }
    }

    /// The reclaim mode this map was built with.
    pub fn mode(&self) -> ReclaimMode {
        self.mode
    }

    /// Number of independently locked segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The load factor each segment grows at.
    pub fn load_factor(&self) -> f32 {
        self.load_factor
    }

    pub fn hasher(&self) -> &S {
        &self.hasher
    }
}

impl<K, V, S> Default for WispMap<K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::with_options(&Options::new(), S::default())
    }
}

impl<K, V, S> fmt::Debug for WispMap<K, V, S>
where
    K: fmt::Debug + Eq + Hash + Send + Sync + 'static,
    V: fmt::Debug + Send + Sync + 'static,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for entry in self.iter() {
            map.entry(entry.key(), entry.value());
        }
        map.finish()
    }
}

impl<K, V, S> Extend<(K, V)> for WispMap<K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for WispMap<K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::default();
        map.extend(iter);
        map
    }
}

impl<'a, K, V, S> IntoIterator for &'a WispMap<K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = ElementGuard<K, V>;
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout() {
        let map: WispMap<u32, u32> = WispMap::new();
        assert_eq!(map.segment_count(), 16);
        assert_eq!(map.load_factor(), DEFAULT_LOAD_FACTOR);
        assert_eq!(map.mode(), ReclaimMode::Soft);
        for segment in map.segments() {
            assert_eq!(segment.table_len(), 1);
        }
    }

    #[test]
    fn requested_layout_rounds_up() {
        let map: WispMap<u32, u32> = Options::new()
            .initial_capacity(5)
            .load_factor(0.5)
            .concurrency(3)
            .build()
            .unwrap();
        assert_eq!(map.segment_count(), 4);
        assert_eq!(map.load_factor(), 0.5);
        for segment in map.segments() {
            assert_eq!(segment.table_len(), 2);
        }
    }

    #[test]
    fn routing_is_stable_and_uses_high_bits() {
        let map: WispMap<u32, u32> = WispMap::new();
        // Top four bits select among the sixteen default segments.
        for index in 0..16u64 {
            let expected = &*map.segments()[index as usize] as *const Segment<u32, u32>;
            let routed = map.segment_for((index << 60) | 0x0FFF) as *const Segment<u32, u32>;
            assert!(std::ptr::eq(routed, expected));
            // Low bits never change the routing.
            assert!(std::ptr::eq(map.segment_for(index << 60), expected));
        }
    }

    #[test]
    fn single_segment_map_works() {
        let map: WispMap<u32, u32> = Options::new()
            .concurrency(1)
            .initial_capacity(2)
            .build()
            .unwrap();
        assert_eq!(map.segment_count(), 1);
        for k in 0..100 {
            map.insert(k, k + 1);
        }
        assert_eq!(map.len(), 100);
        for k in 0..100 {
            assert_eq!(*map.get(&k).unwrap(), k + 1);
        }
    }

    #[test]
    fn insert_returns_previous() {
        let map = WispMap::new();
        assert!(map.insert("k", 1).is_none());
        let previous = map.insert("k", 2).unwrap();
        assert_eq!(*previous, 1);
        assert_eq!(*map.get("k").unwrap(), 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn replacement_keeps_entry_identity() {
        let map = WispMap::new();
        let first = map.get_or_insert("k", 1);
        map.insert("k", 2);
        // The old guard keeps its snapshot; a fresh read sees the new value.
        assert_eq!(*first, 1);
        assert_eq!(*map.get("k").unwrap(), 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn insert_if_absent_and_get_or_insert() {
        let map = WispMap::new();
        assert!(map.insert_if_absent("k", 1).is_none());
        let existing = map.insert_if_absent("k", 5).unwrap();
        assert_eq!(*existing, 1);
        assert_eq!(*map.get_or_insert("k", 9), 1);
        assert_eq!(*map.get_or_insert("fresh", 9), 9);
    }

    #[test]
    fn remove_returns_value_and_unmaps() {
        let map = WispMap::new();
        map.insert("k", 7);
        let removed = map.remove("k").unwrap();
        assert_eq!(*removed, 7);
        assert!(map.remove("k").is_none());
        assert!(map.get("k").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn remove_if_consults_condition() {
        let map = WispMap::new();
        map.insert("k", 7);
        assert!(map.remove_if("k", |_, v| *v > 100).is_none());
        assert!(map.contains_key("k"));
        assert!(map.remove_if("k", |_, v| *v == 7).is_some());
        assert!(!map.contains_key("k"));
    }

    #[test]
    fn weak_entries_die_without_guards() {
        let map = WispMap::with_mode(ReclaimMode::Weak);
        assert_eq!(map.mode(), ReclaimMode::Weak);
        let guard = map.get_or_insert("pinned", 1);
        map.insert("loose", 2);
        assert_eq!(*map.get("pinned").unwrap(), 1);
        assert!(map.get("loose").is_none());
        assert_eq!(map.len(), 1);
        drop(guard);
        assert!(map.get("pinned").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn soft_entries_survive_until_pressure() {
        let map = WispMap::new();
        map.insert("k", 1);
        assert_eq!(*map.get("k").unwrap(), 1);
        map.advise_memory_pressure();
        assert!(map.get("k").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn pinned_soft_entries_survive_pressure() {
        let map = WispMap::new();
        let guard = map.get_or_insert("k", 1);
        map.advise_memory_pressure();
        assert_eq!(*map.get("k").unwrap(), 1);
        drop(guard);
        assert!(map.get("k").is_none());
    }

    #[test]
    fn len_is_exact_after_churn() {
        let map = WispMap::new();
        for k in 0..512u32 {
            map.insert(k, k);
        }
        for k in 0..512u32 {
            if k % 3 == 0 {
                map.remove(&k);
            }
        }
        let expected = (0..512u32).filter(|k| k % 3 != 0).count();
        assert_eq!(map.len(), expected);
        assert_eq!(map.iter().count(), expected);
    }

    #[test]
    fn clear_empties_every_segment() {
        let map = WispMap::new();
        for k in 0..256u32 {
            map.insert(k, k);
        }
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
        map.insert(1, 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn debug_formats_entries() {
        let map = WispMap::new();
        map.insert("k", 1);
        let rendered = format!("{map:?}");
        assert!(rendered.contains("\"k\""));
        assert!(rendered.contains('1'));
    }

    #[test]
    fn from_iterator_and_extend() {
        let mut map: WispMap<u32, u32> = (0..10u32).map(|k| (k, k * 2)).collect();
        assert_eq!(map.len(), 10);
        map.extend((10..20u32).map(|k| (k, k * 2)));
        assert_eq!(map.len(), 20);
        for k in 0..20u32 {
            assert_eq!(*map.get(&k).unwrap(), k * 2);
        }
    }

    #[test]
    fn borrowed_key_lookups() {
        let map = WispMap::new();
        map.insert("owned".to_string(), 1);
        assert!(map.contains_key("owned"));
        assert_eq!(*map.get("owned").unwrap(), 1);
        assert!(map.remove("owned").is_some());
    }
}
