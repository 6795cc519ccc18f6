use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

use crate::element::ElementGuard;
use crate::WispMap;

/// Iterator over a map yielding pinned entry guards.
///
/// Iteration is weakly consistent: it never blocks writers and tolerates
/// concurrent inserts, removals, and table growth. Each entry present for
/// the whole iteration is yielded exactly once; entries mutated during it
/// may or may not be seen.
///
/// # Examples
///
/// ```
/// use wispmap::WispMap;
///
/// let map = WispMap::new();
/// map.insert("hello", "world");
/// map.insert("alex", "steve");
/// assert_eq!(map.iter().count(), 2);
/// ```
pub struct Iter<'a, K, V, S = RandomState> {
    map: &'a WispMap<K, V, S>,
    segment: usize,
    current: Option<std::vec::IntoIter<ElementGuard<K, V>>>,
    last: Option<ElementGuard<K, V>>,
}

impl<'a, K, V, S> Iter<'a, K, V, S> {
    pub(crate) fn new(map: &'a WispMap<K, V, S>) -> Self {
        Self {
            map,
            segment: 0,
            current: None,
            last: None,
        }
    }
}

impl<'a, K, V, S> Clone for Iter<'a, K, V, S> {
    fn clone(&self) -> Self {
        Iter {
            map: self.map,
            segment: self.segment,
            current: self.current.clone(),
            last: self.last.clone(),
        }
    }
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S>
where
    K: Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    type Item = ElementGuard<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if let Some(entry) = current.next() {
                    self.last = Some(entry.clone());
                    return Some(entry);
                }
            }

            let segment = self.map.segments().get(self.segment)?;
            self.segment += 1;
            self.current = Some(segment.snapshot().into_iter());
        }
    }
}

impl<'a, K, V, S> Iter<'a, K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    /// Removes the entry most recently yielded by `next` from the map.
    ///
    /// Returns the removed mapping, or `None` when another thread removed
    /// or reclaimed it first.
    ///
    /// # Panics
    ///
    /// Panics when called before the first yield, or a second time for the
    /// same yielded entry.
    ///
    /// # Examples
    ///
    /// ```
    /// use wispmap::WispMap;
    ///
    /// let map = WispMap::new();
    /// map.insert("hello", "world");
    /// let mut iter = map.iter();
    /// iter.next();
    /// iter.remove_current();
    /// assert!(map.is_empty());
    /// ```
    pub fn remove_current(&mut self) -> Option<ElementGuard<K, V>> {
        match self.last.take() {
            Some(entry) => self.map.remove(entry.key()),
            None => panic!("remove_current called before an element was yielded"),
        }
    }
}
