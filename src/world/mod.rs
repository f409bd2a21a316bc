//! External-collaborator interfaces.
//!
//! The replication core never owns the simulation: entity metadata, transforms
//! and component state all live outside and are reached through the narrow
//! [`WorldSource`] trait. Everything here is id-based; the core stores
//! [`NetworkId`]s and resolves them on demand rather than holding references
//! into the simulation.

pub mod mem;

use smallvec::SmallVec;
use uuid::Uuid;

use crate::util::bounds::Aabb;
use crate::util::tick::Tick;
use crate::util::vec2::Vec2;

/// One connected client receiving a personalized state stream.
pub type ViewerId = Uuid;

/// Network-stable entity identity. Monotonically assigned, never reused
/// within a network session; this is the id that appears in all wire-visible
/// state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkId(pub u64);

impl NetworkId {
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "net:{}", self.0)
    }
}

/// Process-local entity identity. Stable only while the entity is alive;
/// slots are reused after deletion, so this must never be stored across ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId(pub u32);

/// Identity of a grid entity. Grids are themselves entities and appear as
/// roots of visibility trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridId(pub NetworkId);

/// Identity of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapId(pub u32);

impl MapId {
    /// The null map: entities here are never replicated through view culling.
    pub const NULLSPACE: MapId = MapId(0);

    #[inline]
    pub const fn is_nullspace(self) -> bool {
        self.0 == 0
    }
}

/// Visibility layer bitset.
///
/// An entity is visible to an eye only if the eye's mask is a superset of the
/// entity's mask bits (and of every ancestor's mask bits).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct VisMask(pub u32);

impl VisMask {
    /// Default layer for ordinary entities and eyes.
    pub const DEFAULT: VisMask = VisMask(1);

    /// No layer bits: visible to every eye.
    pub const NONE: VisMask = VisMask(0);

    /// Whether an eye carrying `self` can see an entity on `entity` layers.
    #[inline]
    pub const fn can_see(self, entity: VisMask) -> bool {
        (self.0 & entity.0) == entity.0
    }
}

/// Snapshot of the entity metadata the core needs, resolved per use from the
/// external entity store.
#[derive(Debug, Clone, Copy)]
pub struct EntityMeta {
    /// Process-local id, valid only for the current tick.
    pub entity: EntityId,
    /// Visibility layers this entity occupies.
    pub vis_mask: VisMask,
    /// Parent entity, `None` only for map roots.
    pub parent: Option<NetworkId>,
    /// Grid this entity is cached relative to, if any.
    pub grid: Option<GridId>,
    /// Map this entity lives on.
    pub map: MapId,
    /// Whether this entity is a map or grid entity (a visibility-tree root).
    pub is_root: bool,
}

/// World-space placement of a grid.
#[derive(Debug, Clone, Copy, Default)]
pub struct Transform {
    pub position: Vec2,
    pub rotation: f32,
}

impl Transform {
    #[inline]
    pub fn new(position: Vec2, rotation: f32) -> Self {
        Self { position, rotation }
    }

    /// Local → world.
    #[inline]
    pub fn transform_point(&self, local: Vec2) -> Vec2 {
        local.rotate(self.rotation) + self.position
    }

    /// World → local (the inverse transform).
    #[inline]
    pub fn inverse_transform_point(&self, world: Vec2) -> Vec2 {
        (world - self.position).rotate(-self.rotation)
    }
}

/// Extra entities a game system wants replicated to one viewer this tick,
/// collected before budget enforcement.
#[derive(Debug, Default)]
pub struct ExpandedVisibility {
    /// Entities added with their ancestor chain, but not their children.
    pub entities: Vec<NetworkId>,
    /// Entities added with ancestor chain and full subtree.
    pub recursive: Vec<NetworkId>,
}

impl ExpandedVisibility {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.recursive.is_empty()
    }
}

/// Read-only view of the simulation, consumed during tick processing.
///
/// A deleted entity resolves to `None`; callers log and skip, never abort the
/// tick. Implementations must be safe to read from the parallel tree-build
/// and delta phases.
pub trait WorldSource: Sync {
    /// Serialized (or serializable) per-entity state produced by the diff
    /// collaborator. Opaque to the core.
    type State: Send;

    /// Resolve a network id to live entity metadata, `None` if deleted.
    fn resolve_entity(&self, id: NetworkId) -> Option<EntityMeta>;

    /// Direct children of an entity in the transform hierarchy.
    fn children(&self, id: NetworkId) -> SmallVec<[NetworkId; 4]>;

    /// Current world-space position of an entity.
    fn world_position(&self, id: NetworkId) -> Vec2;

    /// World-space placement of a grid; `inverse_transform_point` maps world
    /// coordinates into grid-local space.
    fn grid_transform(&self, grid: GridId) -> Transform;

    /// Grids on `map` whose world bounds intersect `bounds`.
    fn grids_intersecting(&self, map: MapId, bounds: Aabb) -> SmallVec<[GridId; 4]>;

    /// Visibility mask of an eye entity. Defaults to [`VisMask::DEFAULT`]
    /// when the entity carries no eye data.
    fn eye_visibility(&self, _eye: NetworkId) -> VisMask {
        VisMask::DEFAULT
    }

    /// Component state delta for `entity` over `(from, to]`. `from` of zero
    /// requests the full state. `None` means the entity has nothing to send.
    fn diff_components(&self, entity: EntityId, from: Tick, to: Tick) -> Option<Self::State>;

    /// Extension point: game logic may append extra entities to a viewer's
    /// visible set this tick. Invoked once per viewer per tick, before
    /// budget enforcement.
    fn expand_visibility(&self, _viewer: ViewerId, _out: &mut ExpandedVisibility) {}
}
