use core::hash::{BuildHasher, Hash, Hasher};

/// Avalanche mix applied to every key hash before it is split into a
/// segment selector (high bits) and a bucket index (low bits).
///
/// Weak hash implementations tend to cluster in the low bits; mixing
/// spreads them across the whole word so the two bit ranges stay
/// uncorrelated.
pub(crate) fn spread(hash: u64) -> u64 {
    let mut h = hash;
    h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
    h ^= h >> 10;
    h = h.wrapping_add(h << 3);
    h ^= h >> 6;
    h = h.wrapping_add((h << 2).wrapping_add(h << 14));
    h ^ (h >> 16)
}

/// Hashes `key` with the map's hasher and mixes the result.
pub(crate) fn hash_key<S: BuildHasher, Q: Hash + ?Sized>(build_hasher: &S, key: &Q) -> u64 {
    let mut hasher = build_hasher.build_hasher();
    key.hash(&mut hasher);
    spread(hasher.finish())
}

/// Smallest shift such that `1 << shift` covers `minimum`, capped so the
/// resulting size never exceeds `maximum`.
pub(crate) fn calculate_shift(minimum: usize, maximum: usize) -> u32 {
    let mut shift = 0;
    let mut value = 1usize;
    while value < minimum && value < maximum {
        value <<= 1;
        shift += 1;
    }
    shift
}
