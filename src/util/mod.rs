//! Shared math and collection primitives.

pub mod bounds;
pub mod tick;
pub mod vec2;

/// Hot-path hash map keyed by small values (network ids, chunk coords).
pub type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;

/// Hot-path hash set, same hasher as [`FxHashMap`].
pub type FxHashSet<T> = hashbrown::HashSet<T, rustc_hash::FxBuildHasher>;
