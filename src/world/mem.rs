//! In-memory [`WorldSource`] implementation.
//!
//! A minimal entity store with maps, grids and a transform hierarchy,
//! enough to drive the replication core in tests and benchmarks. State
//! payloads are [`MemState`] markers recording what diff was requested
//! rather than real component data.

use smallvec::SmallVec;

use crate::util::bounds::Aabb;
use crate::util::tick::Tick;
use crate::util::vec2::Vec2;
use crate::util::FxHashMap;
use crate::world::{
    EntityId, EntityMeta, ExpandedVisibility, GridId, MapId, NetworkId, Transform, ViewerId,
    VisMask, WorldSource,
};

/// Stand-in state payload: the diff request that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemState {
    pub entity: EntityId,
    pub from: Tick,
    pub to: Tick,
}

struct Entry {
    entity: EntityId,
    mask: VisMask,
    parent: Option<NetworkId>,
    children: Vec<NetworkId>,
    map: MapId,
    grid: Option<GridId>,
    is_root: bool,
    position: Vec2,
    eye_mask: VisMask,
}

struct GridEntry {
    map: MapId,
    transform: Transform,
    bounds: Aabb,
}

/// Simple hierarchy-backed world.
#[derive(Default)]
pub struct MemWorld {
    entities: FxHashMap<NetworkId, Entry>,
    grids: FxHashMap<GridId, GridEntry>,
    maps: FxHashMap<MapId, NetworkId>,
    null_root: Option<NetworkId>,
    next_net: u64,
    next_entity: u32,
    next_map: u32,
}

impl MemWorld {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> (NetworkId, EntityId) {
        self.next_net += 1;
        self.next_entity += 1;
        (NetworkId::new(self.next_net), EntityId(self.next_entity))
    }

    /// Create a new map and its root entity.
    pub fn spawn_map(&mut self) -> (NetworkId, MapId) {
        self.next_map += 1;
        let map = MapId(self.next_map);
        let (net, entity) = self.allocate();
        self.entities.insert(
            net,
            Entry {
                entity,
                mask: VisMask::NONE,
                parent: None,
                children: Vec::new(),
                map,
                grid: None,
                is_root: true,
                position: Vec2::ZERO,
                eye_mask: VisMask::DEFAULT,
            },
        );
        self.maps.insert(map, net);
        (net, map)
    }

    /// Create a grid on `map` with the given world placement and bounds.
    pub fn spawn_grid(
        &mut self,
        map: MapId,
        transform: Transform,
        bounds: Aabb,
    ) -> (NetworkId, GridId) {
        let map_root = *self.maps.get(&map).expect("unknown map");
        let (net, entity) = self.allocate();
        let grid = GridId(net);
        self.entities.insert(
            net,
            Entry {
                entity,
                mask: VisMask::NONE,
                parent: Some(map_root),
                children: Vec::new(),
                map,
                grid: Some(grid),
                is_root: true,
                position: transform.position,
                eye_mask: VisMask::DEFAULT,
            },
        );
        self.entity_mut(map_root).children.push(net);
        self.grids.insert(
            grid,
            GridEntry {
                map,
                transform,
                bounds,
            },
        );
        (net, grid)
    }

    /// Root entity for entities parked outside any map.
    pub fn spawn_nullspace_root(&mut self) -> NetworkId {
        if let Some(root) = self.null_root {
            return root;
        }
        let (net, entity) = self.allocate();
        self.entities.insert(
            net,
            Entry {
                entity,
                mask: VisMask::NONE,
                parent: None,
                children: Vec::new(),
                map: MapId::NULLSPACE,
                grid: None,
                is_root: true,
                position: Vec2::ZERO,
                eye_mask: VisMask::DEFAULT,
            },
        );
        self.null_root = Some(net);
        net
    }

    /// Spawn an entity under `parent` at a world position. Map and grid
    /// membership are inherited from the parent.
    pub fn spawn(&mut self, parent: NetworkId, mask: VisMask, position: Vec2) -> NetworkId {
        let (map, grid) = {
            let p = self.entity(parent);
            (p.map, p.grid)
        };
        let (net, entity) = self.allocate();
        self.entities.insert(
            net,
            Entry {
                entity,
                mask,
                parent: Some(parent),
                children: Vec::new(),
                map,
                grid,
                is_root: false,
                position,
                eye_mask: VisMask::DEFAULT,
            },
        );
        self.entity_mut(parent).children.push(net);
        net
    }

    pub fn set_position(&mut self, id: NetworkId, position: Vec2) {
        self.entity_mut(id).position = position;
    }

    pub fn set_mask(&mut self, id: NetworkId, mask: VisMask) {
        self.entity_mut(id).mask = mask;
    }

    pub fn set_eye_mask(&mut self, id: NetworkId, mask: VisMask) {
        self.entity_mut(id).eye_mask = mask;
    }

    /// Reparent an entity; its subtree inherits the new map and grid.
    pub fn set_parent(&mut self, id: NetworkId, parent: NetworkId) {
        let old_parent = self.entity(id).parent;
        if let Some(old) = old_parent {
            self.entity_mut(old).children.retain(|&c| c != id);
        }
        let (map, grid) = {
            let p = self.entity(parent);
            (p.map, p.grid)
        };
        {
            let entry = self.entity_mut(id);
            entry.parent = Some(parent);
        }
        self.entity_mut(parent).children.push(id);

        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let entry = self.entity_mut(current);
            entry.map = map;
            if !entry.is_root {
                entry.grid = grid;
            }
            stack.extend(entry.children.iter().copied());
        }
    }

    /// Park an entity in nullspace.
    pub fn move_to_nullspace(&mut self, id: NetworkId) {
        let root = self.spawn_nullspace_root();
        self.set_parent(id, root);
    }

    /// Delete an entity and its whole subtree.
    pub fn despawn(&mut self, id: NetworkId) {
        if let Some(entry) = self.entities.get(&id) {
            if let Some(parent) = entry.parent {
                if let Some(p) = self.entities.get_mut(&parent) {
                    p.children.retain(|&c| c != id);
                }
            }
        }
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(entry) = self.entities.remove(&current) {
                stack.extend(entry.children);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn entity(&self, id: NetworkId) -> &Entry {
        self.entities.get(&id).expect("unknown entity")
    }

    fn entity_mut(&mut self, id: NetworkId) -> &mut Entry {
        self.entities.get_mut(&id).expect("unknown entity")
    }
}

impl WorldSource for MemWorld {
    type State = MemState;

    fn resolve_entity(&self, id: NetworkId) -> Option<EntityMeta> {
        self.entities.get(&id).map(|e| EntityMeta {
            entity: e.entity,
            vis_mask: e.mask,
            parent: e.parent,
            grid: e.grid,
            map: e.map,
            is_root: e.is_root,
        })
    }

    fn children(&self, id: NetworkId) -> SmallVec<[NetworkId; 4]> {
        self.entities
            .get(&id)
            .map(|e| e.children.iter().copied().collect())
            .unwrap_or_default()
    }

    fn world_position(&self, id: NetworkId) -> Vec2 {
        self.entities.get(&id).map(|e| e.position).unwrap_or(Vec2::ZERO)
    }

    fn grid_transform(&self, grid: GridId) -> Transform {
        self.grids
            .get(&grid)
            .map(|g| g.transform)
            .unwrap_or_default()
    }

    fn grids_intersecting(&self, map: MapId, bounds: Aabb) -> SmallVec<[GridId; 4]> {
        self.grids
            .iter()
            .filter(|(_, g)| g.map == map && g.bounds.intersects(&bounds))
            .map(|(&id, _)| id)
            .collect()
    }

    fn eye_visibility(&self, eye: NetworkId) -> VisMask {
        self.entities
            .get(&eye)
            .map(|e| e.eye_mask)
            .unwrap_or(VisMask::DEFAULT)
    }

    fn diff_components(&self, entity: EntityId, from: Tick, to: Tick) -> Option<Self::State> {
        Some(MemState { entity, from, to })
    }

    fn expand_visibility(&self, _viewer: ViewerId, _out: &mut ExpandedVisibility) {}
}
