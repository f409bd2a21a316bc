//! Visibility tree construction and caching.
//!
//! For every (eye mask, chunk) pair some viewer needs this tick, a tree of
//! the chunk's visible entities plus their ancestor chains is built. Trees
//! are cached across ticks keyed by that pair and only rebuilt when the
//! underlying chunk is dirty, so viewers sharing a mask share the work.
//! The build phase is read-only over the index and cache and runs in
//! parallel; [`TreeCache::register`] applies the results single-threaded.

use smallvec::SmallVec;
use tracing::warn;

use crate::chunk::{ChunkIndex, ChunkLocation};
use crate::pool::{Pool, Recycle};
use crate::util::{FxHashMap, FxHashSet};
use crate::world::{NetworkId, VisMask, WorldSource};

/// Cache key: one tree per eye mask per chunk.
pub type TreeKey = (VisMask, ChunkLocation);

/// Parent chains longer than this are assumed cyclic and dropped.
const MAX_CHAIN_DEPTH: usize = 256;

/// Entities of one chunk visible to one eye mask, arranged parent-first.
///
/// `roots` are map or grid entities; every other member hangs off its parent
/// in `children`. Traversing roots then children yields every entity after
/// its full ancestor chain.
#[derive(Debug, Default)]
pub struct VisTree {
    pub roots: SmallVec<[NetworkId; 2]>,
    pub children: FxHashMap<NetworkId, SmallVec<[NetworkId; 4]>>,
}

impl VisTree {
    pub fn contains(&self, id: NetworkId) -> bool {
        self.roots.contains(&id) || self.children.values().any(|c| c.contains(&id))
    }

    /// Total entity count across roots and children.
    pub fn len(&self) -> usize {
        self.roots.len() + self.children.values().map(|c| c.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

impl Recycle for VisTree {
    fn recycle(&mut self) {
        self.roots.clear();
        self.children.clear();
    }

    fn is_clear(&self) -> bool {
        self.roots.is_empty() && self.children.is_empty()
    }
}

/// Result of one build job.
pub enum BuildOutcome {
    /// Chunk unchanged since the cached tree was built; keep the cache entry.
    Reused,
    /// Fresh build. `None` means the chunk currently has no entity visible
    /// to this mask; the empty result is cached so clean chunks stay cheap.
    Built(Option<VisTree>),
}

/// Build the tree for one (mask, chunk) job, or report that the cached one
/// is still valid. Read-only over `index` and `cache`; safe to call from
/// worker threads for disjoint jobs.
pub fn build_tree<W: WorldSource>(
    world: &W,
    index: &ChunkIndex,
    cache: &TreeCache,
    key: TreeKey,
    trees: &Pool<VisTree>,
    scratch: &Pool<FxHashSet<NetworkId>>,
) -> BuildOutcome {
    let (mask, location) = key;
    if !index.is_dirty(location) && cache.contains(key) {
        return BuildOutcome::Reused;
    }

    let Some(members) = index.chunk(location) else {
        return BuildOutcome::Built(None);
    };

    let mut tree = trees.get();
    let mut visited = scratch.get();
    for &id in members {
        add_with_ancestors(world, mask, id, &mut tree, &mut visited);
    }
    scratch.put(visited);

    if tree.roots.is_empty() {
        trees.put(tree);
        BuildOutcome::Built(None)
    } else {
        BuildOutcome::Built(Some(tree))
    }
}

/// Add `leaf` and its ancestor chain to the tree. The whole chain is
/// excluded if any entity along it fails the mask test; a stale reference
/// anywhere along it drops the chain with a warning.
fn add_with_ancestors<W: WorldSource>(
    world: &W,
    mask: VisMask,
    leaf: NetworkId,
    tree: &mut VisTree,
    visited: &mut FxHashSet<NetworkId>,
) {
    // Walk up until a root or an already-added ancestor.
    let mut chain: SmallVec<[(NetworkId, Option<NetworkId>, bool); 8]> = SmallVec::new();
    let mut current = leaf;
    loop {
        if visited.contains(&current) {
            break;
        }
        if chain.len() >= MAX_CHAIN_DEPTH {
            warn!(entity = %leaf, "parent chain exceeds depth limit, dropping entity");
            debug_assert!(false, "parent chain exceeds depth limit; cyclic hierarchy?");
            return;
        }
        let Some(meta) = world.resolve_entity(current) else {
            warn!(entity = %current, "stale entity in chunk while building visibility tree");
            return;
        };
        if !mask.can_see(meta.vis_mask) {
            return;
        }
        chain.push((current, meta.parent, meta.is_root));
        match meta.parent {
            Some(parent) if !meta.is_root => current = parent,
            _ => break,
        }
    }

    // Insert parent-first so every child's attachment point already exists.
    for &(id, parent, is_root) in chain.iter().rev() {
        if !visited.insert(id) {
            continue;
        }
        match parent {
            Some(parent) if !is_root => tree.children.entry(parent).or_default().push(id),
            _ => tree.roots.push(id),
        }
    }
}

/// Cross-tick tree store. Owned by the core, mutated only between the
/// parallel phases.
#[derive(Default)]
pub struct TreeCache {
    trees: FxHashMap<TreeKey, Option<VisTree>>,
}

impl TreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn contains(&self, key: TreeKey) -> bool {
        self.trees.contains_key(&key)
    }

    /// Cached tree for a key, `None` for missing entries and for cached
    /// empty results alike.
    #[inline]
    pub fn tree(&self, key: TreeKey) -> Option<&VisTree> {
        self.trees.get(&key).and_then(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Apply this tick's build outcomes: install fresh trees (returning
    /// replaced ones to the pool), clear dirty flags for every rebuilt
    /// chunk, and evict cache entries no current viewer asked for.
    ///
    /// `jobs` and `outcomes` are parallel slices. Every job touching a dirty
    /// chunk is guaranteed to have rebuilt, so clearing the flag here cannot
    /// strand a stale sibling entry: siblings not in `jobs` are evicted.
    pub fn register(
        &mut self,
        index: &mut ChunkIndex,
        jobs: &[TreeKey],
        outcomes: Vec<BuildOutcome>,
        pool: &Pool<VisTree>,
    ) {
        debug_assert_eq!(jobs.len(), outcomes.len());

        let mut wanted: FxHashSet<TreeKey> = FxHashSet::default();
        wanted.reserve(jobs.len());
        for &key in jobs {
            wanted.insert(key);
        }
        let evicted: Vec<TreeKey> = self
            .trees
            .keys()
            .filter(|key| !wanted.contains(*key))
            .copied()
            .collect();
        for key in evicted {
            if let Some(Some(tree)) = self.trees.remove(&key) {
                pool.put(tree);
            }
        }

        for (&key, outcome) in jobs.iter().zip(outcomes) {
            match outcome {
                BuildOutcome::Reused => {}
                BuildOutcome::Built(tree) => {
                    if let Some(Some(old)) = self.trees.insert(key, tree) {
                        pool.put(old);
                    }
                    index.clear_dirty(key.1);
                }
            }
        }
    }
}
