//! Spatial chunk index.
//!
//! Tracks which entities occupy which coarse grid cell, separately for
//! map-relative and grid-relative space, and remembers which cells changed
//! since their visibility trees were last built. Mutated only through the
//! move/delete entry points during the single-threaded simulation phase;
//! read-only while trees are built in parallel.

use crate::util::bounds::Aabb;
use crate::util::tick::Tick;
use crate::util::vec2::Vec2;
use crate::util::{FxHashMap, FxHashSet};
use crate::world::{GridId, MapId, NetworkId};

/// Side length of one chunk cell, in world units.
pub const CHUNK_SIZE: f32 = 8.0;

/// Integer chunk cell coordinate, scaled by [`CHUNK_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
}

impl ChunkCoord {
    #[inline]
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chunk containing a (map- or grid-local) position.
    #[inline]
    pub fn from_position(pos: Vec2) -> Self {
        Self {
            x: (pos.x / CHUNK_SIZE).floor() as i32,
            y: (pos.y / CHUNK_SIZE).floor() as i32,
        }
    }

    /// Every chunk coordinate a square view region overlaps. The region is
    /// centered on `center` with the given half extent, in the same
    /// coordinate space as the chunks being enumerated.
    pub fn covering(center: Vec2, half_extent: f32) -> impl Iterator<Item = ChunkCoord> {
        Self::covering_bounds(Aabb::centered(center, half_extent))
    }

    /// Every chunk coordinate a bounding box overlaps, in the box's own
    /// coordinate space.
    pub fn covering_bounds(bounds: Aabb) -> impl Iterator<Item = ChunkCoord> {
        let min = ChunkCoord::from_position(bounds.min);
        let max = ChunkCoord::from_position(bounds.max);
        (min.x..=max.x).flat_map(move |x| (min.y..=max.y).map(move |y| ChunkCoord::new(x, y)))
    }
}

/// A spatial partition cell. Map-relative and grid-relative cells are
/// distinct key spaces and never interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkLocation {
    Map { map: MapId, coord: ChunkCoord },
    Grid { grid: GridId, coord: ChunkCoord },
}

impl ChunkLocation {
    #[inline]
    pub fn map(map: MapId, coord: ChunkCoord) -> Self {
        ChunkLocation::Map { map, coord }
    }

    #[inline]
    pub fn grid(grid: GridId, coord: ChunkCoord) -> Self {
        ChunkLocation::Grid { grid, coord }
    }

    /// Whether this cell is on the null map (never replicated).
    pub fn is_nullspace(&self) -> bool {
        matches!(self, ChunkLocation::Map { map, .. } if map.is_nullspace())
    }
}

/// Summary counters for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ChunkIndexStats {
    pub chunks: usize,
    pub entities: usize,
    pub dirty_chunks: usize,
    pub pending_deletions: usize,
}

/// Membership index: which entities sit in which chunk, which chunks have
/// changed since the tree cache last saw them, and which entities were
/// deleted on which tick.
pub struct ChunkIndex {
    chunks: FxHashMap<ChunkLocation, FxHashSet<NetworkId>>,
    locations: FxHashMap<NetworkId, ChunkLocation>,
    dirty: FxHashSet<ChunkLocation>,
    /// Append-only within a tick; culled once every viewer has acked past an
    /// entry's tick.
    deletion_log: Vec<(Tick, NetworkId)>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self {
            chunks: FxHashMap::default(),
            locations: FxHashMap::default(),
            dirty: FxHashSet::default(),
            deletion_log: Vec::new(),
        }
    }

    /// First-time registration of an entity in the index.
    pub fn insert(&mut self, id: NetworkId, location: ChunkLocation) {
        debug_assert!(
            !self.locations.contains_key(&id),
            "insert called for an already-indexed entity {id}"
        );
        self.locations.insert(id, location);
        self.chunks.entry(location).or_default().insert(id);
        self.dirty.insert(location);
    }

    /// Move an already-indexed entity, marking both the old and new cell
    /// dirty. `force_dirty` marks the cell even if the entity did not change
    /// cells (used when an ancestor's visibility changed).
    ///
    /// Updating an entity that was never indexed is a logic error upstream;
    /// tolerated as a plain insert in release builds.
    pub fn update(&mut self, id: NetworkId, location: ChunkLocation, force_dirty: bool) {
        match self.locations.get_mut(&id) {
            Some(old) if *old == location => {
                if force_dirty {
                    self.dirty.insert(location);
                }
            }
            Some(old) => {
                let previous = *old;
                *old = location;
                if let Some(members) = self.chunks.get_mut(&previous) {
                    members.remove(&id);
                    if members.is_empty() {
                        self.chunks.remove(&previous);
                    }
                }
                self.dirty.insert(previous);
                self.chunks.entry(location).or_default().insert(id);
                self.dirty.insert(location);
            }
            None => {
                debug_assert!(false, "update called for unindexed entity {id}");
                self.locations.insert(id, location);
                self.chunks.entry(location).or_default().insert(id);
                self.dirty.insert(location);
            }
        }
    }

    /// Take an entity out of the index without logging a deletion. Used when
    /// an entity moves to nullspace: viewers see it leave view, not die.
    pub fn unindex(&mut self, id: NetworkId) {
        if let Some(location) = self.locations.remove(&id) {
            if let Some(members) = self.chunks.get_mut(&location) {
                members.remove(&id);
                if members.is_empty() {
                    self.chunks.remove(&location);
                }
            }
            self.dirty.insert(location);
        }
    }

    /// Remove an entity and log its deletion at `tick`. Viewers that still
    /// have an older ack will be told about the deletion from this log.
    pub fn remove(&mut self, tick: Tick, id: NetworkId) {
        self.unindex(id);
        self.deletion_log.push((tick, id));
    }

    /// Whether the cell changed since [`clear_dirty`](Self::clear_dirty) was
    /// last called for it. Mask-independent: dirtiness is a property of the
    /// cell, not of any particular visibility tree built from it.
    #[inline]
    pub fn is_dirty(&self, location: ChunkLocation) -> bool {
        self.dirty.contains(&location)
    }

    /// Consume the dirty flag once every tree for this cell has been
    /// rebuilt (or the cell was found transiently invisible).
    #[inline]
    pub fn clear_dirty(&mut self, location: ChunkLocation) {
        self.dirty.remove(&location);
    }

    /// Externally force a rebuild of every tree sharing this cell.
    #[inline]
    pub fn mark_dirty(&mut self, location: ChunkLocation) {
        self.dirty.insert(location);
    }

    #[inline]
    pub fn chunk(&self, location: ChunkLocation) -> Option<&FxHashSet<NetworkId>> {
        self.chunks.get(&location)
    }

    #[inline]
    pub fn location_of(&self, id: NetworkId) -> Option<ChunkLocation> {
        self.locations.get(&id).copied()
    }

    /// Every indexed entity. Used by the culling-disabled path.
    pub fn entities(&self) -> impl Iterator<Item = NetworkId> + '_ {
        self.locations.keys().copied()
    }

    /// Entities deleted on ticks strictly after `from`.
    pub fn deletions_since(&self, from: Tick) -> Vec<NetworkId> {
        self.deletion_log
            .iter()
            .filter(|(tick, _)| *tick > from)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Discard deletion-log entries no viewer can still need: everything at
    /// or before the oldest acknowledged tick across all viewers.
    pub fn cull_deletions(&mut self, oldest_ack: Tick) {
        self.deletion_log.retain(|(tick, _)| *tick > oldest_ack);
    }

    pub fn stats(&self) -> ChunkIndexStats {
        ChunkIndexStats {
            chunks: self.chunks.len(),
            entities: self.locations.len(),
            dirty_chunks: self.dirty.len(),
            pending_deletions: self.deletion_log.len(),
        }
    }
}

impl Default for ChunkIndex {
    fn default() -> Self {
        Self::new()
    }
}
