//! Viewer-to-chunk resolution.
//!
//! Turns each viewer's eye positions into the set of chunks their view
//! region overlaps, in map space and in the local space of every grid the
//! region touches, then deduplicates across viewers into a flat list of
//! (mask, chunk) build jobs. Viewers sharing an eye mask over the same
//! chunk share one job and therefore one tree.

use smallvec::SmallVec;
use tracing::warn;

use crate::chunk::{ChunkCoord, ChunkLocation};
use crate::pool::Pool;
use crate::tree::TreeKey;
use crate::util::bounds::Aabb;
use crate::util::vec2::Vec2;
use crate::util::{FxHashMap, FxHashSet};
use crate::world::{NetworkId, ViewerId, WorldSource};

/// A viewer's eye entities for one tick: the attached entity plus any extra
/// view subscriptions.
#[derive(Debug)]
pub struct ViewerEyes {
    pub viewer: ViewerId,
    pub eyes: SmallVec<[NetworkId; 2]>,
}

/// Output of one resolution pass. `viewer_jobs` is parallel to the input
/// viewer slice; its sets index into `jobs` and come from the index-set
/// pool, to be returned once the tick's deltas are computed.
pub struct ResolvedViews {
    pub jobs: Vec<TreeKey>,
    pub viewer_jobs: Vec<FxHashSet<usize>>,
}

/// Maps eyes to chunk jobs. Holds only reusable scratch; resolution runs
/// single-threaded before the parallel build phase.
#[derive(Default)]
pub struct ChunkResolver {
    job_index: FxHashMap<TreeKey, usize>,
}

impl ChunkResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve<W: WorldSource>(
        &mut self,
        world: &W,
        view_size: f32,
        viewers: &[ViewerEyes],
        index_sets: &Pool<FxHashSet<usize>>,
    ) -> ResolvedViews {
        self.job_index.clear();
        let half_extent = view_size * 0.5;
        let mut jobs: Vec<TreeKey> = Vec::new();
        let mut viewer_jobs: Vec<FxHashSet<usize>> = Vec::with_capacity(viewers.len());

        for viewer in viewers {
            let mut set = index_sets.get();
            for &eye in &viewer.eyes {
                self.resolve_eye(world, eye, half_extent, &mut jobs, &mut set);
            }
            viewer_jobs.push(set);
        }

        ResolvedViews { jobs, viewer_jobs }
    }

    fn resolve_eye<W: WorldSource>(
        &mut self,
        world: &W,
        eye: NetworkId,
        half_extent: f32,
        jobs: &mut Vec<TreeKey>,
        out: &mut FxHashSet<usize>,
    ) {
        let Some(meta) = world.resolve_entity(eye) else {
            warn!(entity = %eye, "stale eye entity, skipping");
            return;
        };
        if meta.map.is_nullspace() {
            return;
        }
        let mask = world.eye_visibility(eye);
        let position = world.world_position(eye);
        let bounds = Aabb::centered(position, half_extent);

        for coord in ChunkCoord::covering(position, half_extent) {
            let key = (mask, ChunkLocation::map(meta.map, coord));
            out.insert(intern(&mut self.job_index, jobs, key));
        }

        for grid in world.grids_intersecting(meta.map, bounds) {
            let transform = world.grid_transform(grid);
            // The view box is axis-aligned in world space; in the space of a
            // rotated grid it is not, so take the AABB of its corners.
            let corners = [
                bounds.min,
                Vec2::new(bounds.min.x, bounds.max.y),
                Vec2::new(bounds.max.x, bounds.min.y),
                bounds.max,
            ]
            .map(|c| transform.inverse_transform_point(c));
            let local = Aabb::new(
                corners[0].min(corners[1]).min(corners[2].min(corners[3])),
                corners[0].max(corners[1]).max(corners[2].max(corners[3])),
            );
            for coord in ChunkCoord::covering_bounds(local) {
                let key = (mask, ChunkLocation::grid(grid, coord));
                out.insert(intern(&mut self.job_index, jobs, key));
            }
        }
    }
}

fn intern(job_index: &mut FxHashMap<TreeKey, usize>, jobs: &mut Vec<TreeKey>, key: TreeKey) -> usize {
    *job_index.entry(key).or_insert_with(|| {
        jobs.push(key);
        jobs.len() - 1
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CHUNK_SIZE;
    use crate::world::mem::MemWorld;
    use crate::world::{Transform, VisMask};
    use smallvec::smallvec;
    use uuid::Uuid;

    fn eyes_of(eye: NetworkId) -> ViewerEyes {
        ViewerEyes {
            viewer: Uuid::new_v4(),
            eyes: smallvec![eye],
        }
    }

    #[test]
    fn test_map_chunks_cover_view() {
        let mut world = MemWorld::new();
        let (map_net, map) = world.spawn_map();
        let eye = world.spawn(map_net, VisMask::NONE, Vec2::new(4.0, 4.0));

        let mut resolver = ChunkResolver::new();
        let pool = Pool::default();
        let resolved = resolver.resolve(&world, 2.0 * CHUNK_SIZE, &[eyes_of(eye)], &pool);

        // View [-4, 12] spans chunks -1..=1 on both axes.
        assert_eq!(resolved.jobs.len(), 9);
        assert!(resolved.jobs.iter().all(|(_, loc)| matches!(
            loc,
            ChunkLocation::Map { map: m, .. } if *m == map
        )));
        assert_eq!(resolved.viewer_jobs[0].len(), 9);
    }

    #[test]
    fn test_shared_mask_shares_jobs() {
        let mut world = MemWorld::new();
        let (map_net, _) = world.spawn_map();
        let a = world.spawn(map_net, VisMask::NONE, Vec2::new(4.0, 4.0));
        let b = world.spawn(map_net, VisMask::NONE, Vec2::new(4.0, 4.0));

        let mut resolver = ChunkResolver::new();
        let pool = Pool::default();
        let resolved = resolver.resolve(&world, CHUNK_SIZE, &[eyes_of(a), eyes_of(b)], &pool);

        assert_eq!(resolved.viewer_jobs[0], resolved.viewer_jobs[1]);
        assert_eq!(resolved.jobs.len(), resolved.viewer_jobs[0].len());
    }

    #[test]
    fn test_distinct_masks_do_not_share() {
        let mut world = MemWorld::new();
        let (map_net, _) = world.spawn_map();
        let a = world.spawn(map_net, VisMask::NONE, Vec2::new(4.0, 4.0));
        let b = world.spawn(map_net, VisMask::NONE, Vec2::new(4.0, 4.0));
        world.set_eye_mask(b, VisMask(0b11));

        let mut resolver = ChunkResolver::new();
        let pool = Pool::default();
        let resolved = resolver.resolve(&world, CHUNK_SIZE, &[eyes_of(a), eyes_of(b)], &pool);

        assert!(resolved.viewer_jobs[0].is_disjoint(&resolved.viewer_jobs[1]));
    }

    #[test]
    fn test_grid_chunks_in_local_space() {
        let mut world = MemWorld::new();
        let (map_net, map) = world.spawn_map();
        // Grid offset far from the origin; the eye sits on its origin cell.
        let (_, grid) = world.spawn_grid(
            map,
            Transform::new(Vec2::new(100.0, 100.0), 0.0),
            Aabb::centered(Vec2::new(100.0, 100.0), 32.0),
        );
        let eye = world.spawn(map_net, VisMask::NONE, Vec2::new(100.0, 100.0));

        let mut resolver = ChunkResolver::new();
        let pool = Pool::default();
        let resolved = resolver.resolve(&world, CHUNK_SIZE, &[eyes_of(eye)], &pool);

        let grid_cells: Vec<_> = resolved
            .jobs
            .iter()
            .filter_map(|(_, loc)| match loc {
                ChunkLocation::Grid { grid: g, coord } if *g == grid => Some(*coord),
                _ => None,
            })
            .collect();
        // Locally the view is centered on (0, 0), so its cells straddle the
        // grid origin rather than sitting near chunk (12, 12).
        assert!(!grid_cells.is_empty());
        assert!(grid_cells.contains(&ChunkCoord::new(0, 0)));
        assert!(grid_cells.contains(&ChunkCoord::new(-1, -1)));
    }

    #[test]
    fn test_nullspace_eye_resolves_nothing() {
        let mut world = MemWorld::new();
        let null_root = world.spawn_nullspace_root();
        let eye = world.spawn(null_root, VisMask::NONE, Vec2::ZERO);

        let mut resolver = ChunkResolver::new();
        let pool = Pool::default();
        let resolved = resolver.resolve(&world, CHUNK_SIZE, &[eyes_of(eye)], &pool);
        assert!(resolved.jobs.is_empty());
        assert!(resolved.viewer_jobs[0].is_empty());
    }
}
