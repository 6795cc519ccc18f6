use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

use thiserror::Error;

use crate::reclaim::ReclaimMode;
use crate::WispMap;

/// Capacity used when none is given.
pub const DEFAULT_INITIAL_CAPACITY: usize = 16;
/// Load factor used when none is given.
pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;
/// Concurrency level used when none is given.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Hard cap on the number of segments.
pub(crate) const MAX_CONCURRENCY: usize = 1 << 16;
/// Hard cap on a single segment's bucket array length.
pub(crate) const MAX_TABLE_LEN: usize = 1 << 30;

/// Rejected construction parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptionsError {
    /// The load factor was zero, negative, or not finite.
    #[error("load factor must be positive and finite, got {0}")]
    LoadFactor(f32),
    /// The concurrency level was zero.
    #[error("concurrency level must be at least one")]
    Concurrency,
}

/// Builder for maps that need a non-default shape.
///
/// ```
/// use wispmap::{Options, ReclaimMode};
///
/// let map = Options::new()
///     .initial_capacity(64)
///     .concurrency(4)
///     .mode(ReclaimMode::Soft)
///     .build::<u32, String>()
///     .unwrap();
/// map.insert(1, "one".to_string());
/// assert_eq!(map.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) initial_capacity: usize,
    pub(crate) load_factor: f32,
    pub(crate) concurrency: usize,
    pub(crate) mode: ReclaimMode,
}

impl Options {
    pub fn new() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            concurrency: DEFAULT_CONCURRENCY,
            mode: ReclaimMode::default(),
        }
    }

    /// Number of entries the map should hold before any segment grows.
    pub fn initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// Fill fraction past which a segment doubles its table.
    pub fn load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Expected number of threads mutating the map at once. Rounded up to a
    /// power of two and capped; one segment is built per unit.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// How entries are held once no guard pins them. See [`ReclaimMode`].
    pub fn mode(mut self, mode: ReclaimMode) -> Self {
        self.mode = mode;
        self
    }

    fn validate(&self) -> Result<(), OptionsError> {
        if !self.load_factor.is_finite() || self.load_factor <= 0.0 {
            return Err(OptionsError::LoadFactor(self.load_factor));
        }
        if self.concurrency == 0 {
            return Err(OptionsError::Concurrency);
        }
        Ok(())
    }

    /// Builds a map with the standard hasher.
    pub fn build<K, V>(&self) -> Result<WispMap<K, V, RandomState>, OptionsError>
    where
        K: Eq + Hash + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.build_with_hasher(RandomState::default())
    }

    /// Builds a map that hashes keys with `hasher`.
    pub fn build_with_hasher<K, V, S>(&self, hasher: S) -> Result<WispMap<K, V, S>, OptionsError>
    where
        K: Eq + Hash + Send + Sync + 'static,
        V: Send + Sync + 'static,
        S: BuildHasher,
    {
        self.validate()?;
        Ok(WispMap::with_options(self, hasher))
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let options = Options::new();
        assert_eq!(options.initial_capacity, DEFAULT_INITIAL_CAPACITY);
        assert_eq!(options.load_factor, DEFAULT_LOAD_FACTOR);
        assert_eq!(options.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(options.mode, ReclaimMode::Soft);
    }

    #[test]
    fn builder_setters_apply() {
        let options = Options::new()
            .initial_capacity(5)
            .load_factor(0.5)
            .concurrency(3)
            .mode(ReclaimMode::Weak);
        assert_eq!(options.initial_capacity, 5);
        assert_eq!(options.load_factor, 0.5);
        assert_eq!(options.concurrency, 3);
        assert_eq!(options.mode, ReclaimMode::Weak);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = Options::new().concurrency(0).build::<u32, u32>().unwrap_err();
        assert_eq!(err, OptionsError::Concurrency);
    }

    #[test]
    fn bad_load_factors_are_rejected() {
        for bad in [0.0f32, -1.0, f32::NAN, f32::INFINITY] {
            let result = Options::new().load_factor(bad).build::<u32, u32>();
            assert!(matches!(result, Err(OptionsError::LoadFactor(_))), "accepted {bad}");
        }
    }

    #[test]
    fn zero_capacity_builds() {
        let map = Options::new().initial_capacity(0).build::<u32, u32>().unwrap();
        map.insert(1, 1);
        assert_eq!(map.len(), 1);
    }
}
