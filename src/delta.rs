//! Per-viewer delta computation.
//!
//! Walks the visibility trees a viewer's chunks resolved to, classifies
//! every entity against the viewer's send records (brand new, entering,
//! or steadily visible), enforces the per-tick entry budgets, and emits
//! one [`ViewerDelta`] of full and diff states plus leave/delete
//! notifications. Runs per viewer on worker threads; each call owns its
//! session exclusively and only reads the shared index and trees.

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::chunk::ChunkIndex;
use crate::config::ReplicationConfig;
use crate::pool::Pool;
use crate::session::{SendVisibility, ViewerSession};
use crate::tree::VisTree;
use crate::util::tick::Tick;
use crate::util::{FxHashMap, FxHashSet};
use crate::world::{ExpandedVisibility, NetworkId, ViewerId, WorldSource};

/// Parent chains longer than this are assumed cyclic and dropped.
const MAX_CHAIN_DEPTH: usize = 256;

/// One entity's contribution to a delta.
#[derive(Debug)]
pub struct EntityUpdate<S> {
    pub entity: NetworkId,
    pub visibility: SendVisibility,
    /// Component state payload; `None` for a full send of an entity with
    /// nothing to serialize.
    pub state: Option<S>,
}

/// Counters for one viewer's delta.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaStats {
    /// Entities in the visible set this tick.
    pub visible: usize,
    pub full_sends: usize,
    pub diff_sends: usize,
    /// Entities withheld because the new-entity budget bound.
    pub skipped_new: usize,
    /// Entities withheld because the entered-entity budget bound.
    pub skipped_entered: usize,
    pub stale_refs: usize,
}

/// Everything one viewer is told about one tick.
#[derive(Debug)]
pub struct ViewerDelta<S> {
    pub viewer: ViewerId,
    /// Tick the viewer last acknowledged; states diff against it.
    pub from_tick: Tick,
    pub to_tick: Tick,
    /// Entity states, every parent ordered before its children.
    pub states: Vec<EntityUpdate<S>>,
    /// Entities deleted since `from_tick`.
    pub deletions: Vec<NetworkId>,
    /// Entities that were visible last tick and no longer are.
    pub left_view: Vec<NetworkId>,
    /// The server acknowledged this delta on the viewer's behalf because
    /// the viewer exceeded the ack timeout; the client must accept it as
    /// its new baseline.
    pub force_ack: bool,
    pub stats: DeltaStats,
}

enum AddResult {
    Added,
    AlreadySent,
    Skipped,
}

struct DeltaBuilder<'a, W: WorldSource> {
    world: &'a W,
    session: &'a mut ViewerSession,
    from_tick: Tick,
    to_tick: Tick,
    window: u32,
    new_budget: usize,
    entered_budget: usize,
    new_used: usize,
    entered_used: usize,
    states: Vec<EntityUpdate<W::State>>,
    sent_list: Vec<NetworkId>,
    stats: DeltaStats,
}

impl<'a, W: WorldSource> DeltaBuilder<'a, W> {
    /// Try to include one entity in the delta. Call order must guarantee
    /// the entity's parent was added first (tree walks and ancestor chains
    /// both do).
    fn try_add(&mut self, id: NetworkId, budget_exempt: bool) -> AddResult {
        let record = self.session.records.get(&id).copied().unwrap_or_default();
        if record.last_sent == self.to_tick {
            return AddResult::AlreadySent;
        }
        let Some(meta) = self.world.resolve_entity(id) else {
            warn!(entity = %id, "stale entity reference in visible set");
            self.stats.stale_refs += 1;
            return AddResult::Skipped;
        };

        // Brand new: never told about it, or last told so long ago the
        // sent-list history can no longer vouch for what arrived.
        let brand_new =
            record.last_sent.is_zero() || record.last_sent + self.window < self.from_tick;
        let entering = brand_new
            || record.last_sent < self.from_tick
            || record.last_left_view >= self.from_tick;

        if entering && !budget_exempt {
            if self.entered_used >= self.entered_budget {
                self.stats.skipped_entered += 1;
                return AddResult::Skipped;
            }
            if brand_new && self.new_used >= self.new_budget {
                self.stats.skipped_new += 1;
                return AddResult::Skipped;
            }
            self.entered_used += 1;
            if brand_new {
                self.new_used += 1;
            }
        }

        debug_assert!(
            meta.is_root
                || meta.parent.map_or(true, |p| self
                    .session
                    .records
                    .get(&p)
                    .is_some_and(|r| r.last_sent == self.to_tick)),
            "entity {id} added before its parent"
        );

        // An entity the viewer has never confirmed receiving must keep
        // getting full state, whatever else its record says.
        let full = entering || record.entity_last_acked.is_zero();
        let (visibility, diff_from) = if full {
            (SendVisibility::Full, record.entity_last_acked)
        } else {
            (SendVisibility::Diff, self.from_tick)
        };
        let state = self.world.diff_components(meta.entity, diff_from, self.to_tick);

        let stored = self.session.records.entry(id).or_default();
        stored.last_sent = self.to_tick;
        self.sent_list.push(id);

        match visibility {
            SendVisibility::Full => {
                self.stats.full_sends += 1;
                self.states.push(EntityUpdate {
                    entity: id,
                    visibility,
                    state,
                });
            }
            SendVisibility::Diff => {
                // Unchanged entities stay in the sent list but carry no
                // payload.
                if let Some(state) = state {
                    self.stats.diff_sends += 1;
                    self.states.push(EntityUpdate {
                        entity: id,
                        visibility,
                        state: Some(state),
                    });
                }
            }
        }
        AddResult::Added
    }

    /// Depth-first walk of one cached tree. A budget-skipped entity prunes
    /// its subtree: children come back next tick once the parent fits.
    fn walk_tree(&mut self, tree: &VisTree) {
        let mut stack: SmallVec<[NetworkId; 32]> = SmallVec::new();
        for &root in tree.roots.iter().rev() {
            stack.push(root);
        }
        while let Some(id) = stack.pop() {
            if matches!(self.try_add(id, false), AddResult::Skipped) {
                continue;
            }
            if let Some(children) = tree.children.get(&id) {
                for &child in children.iter().rev() {
                    stack.push(child);
                }
            }
        }
    }

    /// Add an entity preceded by its full ancestor chain. The chain aborts
    /// as a unit on a stale reference or a budget skip.
    fn add_with_ancestors(&mut self, leaf: NetworkId, budget_exempt: bool) {
        let mut chain: SmallVec<[NetworkId; 8]> = SmallVec::new();
        let mut current = leaf;
        loop {
            if self.sent_this_tick(current) {
                break;
            }
            if chain.len() >= MAX_CHAIN_DEPTH {
                warn!(entity = %leaf, "parent chain exceeds depth limit, dropping entity");
                debug_assert!(false, "parent chain exceeds depth limit; cyclic hierarchy?");
                return;
            }
            let Some(meta) = self.world.resolve_entity(current) else {
                warn!(entity = %current, "stale entity in ancestor chain");
                self.stats.stale_refs += 1;
                return;
            };
            chain.push(current);
            match meta.parent {
                Some(parent) if !meta.is_root => current = parent,
                _ => break,
            }
        }
        for &id in chain.iter().rev() {
            if matches!(self.try_add(id, budget_exempt), AddResult::Skipped) {
                return;
            }
        }
    }

    /// Add an entity, its ancestors, and its entire descendant subtree.
    fn add_subtree(&mut self, root: NetworkId, budget_exempt: bool) {
        self.add_with_ancestors(root, budget_exempt);
        if !self.sent_this_tick(root) {
            return;
        }
        let mut seen: FxHashSet<NetworkId> = FxHashSet::default();
        seen.insert(root);
        let mut stack: SmallVec<[NetworkId; 16]> = self.world.children(root).into_iter().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if matches!(self.try_add(id, budget_exempt), AddResult::Skipped) {
                continue;
            }
            stack.extend(self.world.children(id));
        }
    }

    #[inline]
    fn sent_this_tick(&self, id: NetworkId) -> bool {
        self.session
            .records
            .get(&id)
            .is_some_and(|r| r.last_sent == self.to_tick)
    }
}

/// Compute one viewer's delta for `to_tick`.
///
/// Sources are drained in a fixed order: the viewer's chunk trees, global
/// overrides, session overrides, the viewer's own eyes, then whatever the
/// world's expansion hook appends. Overrides and eyes bypass both the mask
/// test (already absent from their path) and the entry budgets.
#[allow(clippy::too_many_arguments)]
pub fn compute_viewer_delta<W: WorldSource>(
    world: &W,
    index: &ChunkIndex,
    config: &ReplicationConfig,
    trees: &[Option<&VisTree>],
    viewer_jobs: &FxHashSet<usize>,
    global_overrides: &[(NetworkId, bool)],
    session: &mut ViewerSession,
    to_tick: Tick,
    sent_lists: &Pool<Vec<NetworkId>>,
) -> ViewerDelta<W::State> {
    let requested_full = session.requested_full;
    // A requested resync is computed as if nothing had ever been sent:
    // every entity classifies brand new and the retained deletion history
    // replays in full.
    let from_tick = if requested_full {
        Tick::ZERO
    } else {
        session.from_tick()
    };
    let eyes = session.eyes();
    let session_overrides: SmallVec<[(NetworkId, bool); 4]> =
        session.overrides.iter().map(|(&id, &r)| (id, r)).collect();
    let new_budget = session.effective_new_budget(config);
    let entered_budget = session.effective_entered_budget(config);

    let mut builder = DeltaBuilder {
        world,
        session,
        from_tick,
        to_tick,
        window: config.window as u32,
        new_budget,
        entered_budget,
        new_used: 0,
        entered_used: 0,
        states: Vec::new(),
        sent_list: sent_lists.get(),
        stats: DeltaStats::default(),
    };

    if config.culling_enabled {
        // Job sets hash in arbitrary order; sort so output order is stable.
        let mut order: SmallVec<[usize; 32]> = viewer_jobs.iter().copied().collect();
        order.sort_unstable();
        for idx in order {
            if let Some(tree) = trees.get(idx).copied().flatten() {
                builder.walk_tree(tree);
            }
        }
    } else {
        let mut all: Vec<NetworkId> = index.entities().collect();
        all.sort_unstable();
        for id in all {
            builder.add_with_ancestors(id, false);
        }
    }

    for &(id, recursive) in global_overrides {
        if recursive {
            builder.add_subtree(id, true);
        } else {
            builder.add_with_ancestors(id, true);
        }
    }
    for &(id, recursive) in &session_overrides {
        if recursive {
            builder.add_subtree(id, true);
        } else {
            builder.add_with_ancestors(id, true);
        }
    }
    for &eye in &eyes {
        builder.add_with_ancestors(eye, true);
    }

    let mut expanded = ExpandedVisibility::default();
    world.expand_visibility(builder.session.id, &mut expanded);
    for &id in &expanded.entities {
        builder.add_with_ancestors(id, true);
    }
    for &id in &expanded.recursive {
        builder.add_subtree(id, true);
    }

    let DeltaBuilder {
        states,
        sent_list,
        mut stats,
        ..
    } = builder;
    stats.visible = sent_list.len();

    // Entities in last tick's delta but not this one have left view. A
    // missing record means the entity was deleted; that is reported through
    // `deletions`, not here.
    let mut left_view = Vec::new();
    if let Some(previous) = session.sent.last_list() {
        for &id in previous {
            if session
                .records
                .get(&id)
                .is_some_and(|r| r.last_sent != to_tick)
            {
                left_view.push(id);
            }
        }
    }
    for &id in &left_view {
        if let Some(record) = session.records.get_mut(&id) {
            record.last_left_view = to_tick;
        }
    }

    let deletions = index.deletions_since(from_tick);

    let last_ack = session.last_ack;
    session.sent.record(to_tick, sent_list, last_ack, sent_lists);

    if requested_full {
        // The resync is served; advance the watermark so the deletion
        // history does not replay again next tick. Per-entity acks still
        // wait on the client, so everything stays on full sends until then.
        session.last_ack = to_tick;
        session.requested_full = false;
    }

    let force_ack =
        config.force_ack_threshold > 0 && to_tick.since(session.last_ack) > config.force_ack_threshold;
    if force_ack {
        debug!(viewer = %session.id, %to_tick, "ack timeout exceeded, acknowledging on the viewer's behalf");
        session.apply_ack(to_tick, sent_lists);
    }

    ViewerDelta {
        viewer: session.id,
        from_tick,
        to_tick,
        states,
        deletions,
        left_view,
        force_ack,
        stats,
    }
}

/// Session-global override sets shared by every viewer.
#[derive(Default)]
pub struct OverrideRegistry {
    entries: FxHashMap<NetworkId, bool>,
}

impl OverrideRegistry {
    pub fn add(&mut self, id: NetworkId, recursive: bool) {
        self.entries.insert(id, recursive);
    }

    pub fn remove(&mut self, id: NetworkId) {
        self.entries.remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot as a slice-friendly list for the parallel delta phase.
    pub fn snapshot(&self) -> Vec<(NetworkId, bool)> {
        let mut list: Vec<(NetworkId, bool)> =
            self.entries.iter().map(|(&id, &r)| (id, r)).collect();
        list.sort_unstable_by_key(|(id, _)| *id);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkCoord, ChunkLocation};
    use crate::tree::{build_tree, TreeCache, TreeKey};
    use crate::util::vec2::Vec2;
    use crate::world::mem::{MemState, MemWorld};
    use crate::world::{MapId, VisMask};
    use uuid::Uuid;

    struct Fixture {
        world: MemWorld,
        index: ChunkIndex,
        cache: TreeCache,
        config: ReplicationConfig,
        trees_pool: Pool<crate::tree::VisTree>,
        scratch: Pool<FxHashSet<NetworkId>>,
        sent_lists: Pool<Vec<NetworkId>>,
        jobs: Vec<TreeKey>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                world: MemWorld::new(),
                index: ChunkIndex::new(),
                cache: TreeCache::new(),
                config: ReplicationConfig::default(),
                trees_pool: Pool::default(),
                scratch: Pool::default(),
                sent_lists: Pool::default(),
                jobs: Vec::new(),
            }
        }

        fn tick(
            &mut self,
            session: &mut ViewerSession,
            to_tick: u32,
            overrides: &[(NetworkId, bool)],
        ) -> ViewerDelta<MemState> {
            let outcomes: Vec<_> = self
                .jobs
                .iter()
                .map(|&key| {
                    build_tree(
                        &self.world,
                        &self.index,
                        &self.cache,
                        key,
                        &self.trees_pool,
                        &self.scratch,
                    )
                })
                .collect();
            self.cache
                .register(&mut self.index, &self.jobs, outcomes, &self.trees_pool);
            let trees: Vec<_> = self.jobs.iter().map(|&key| self.cache.tree(key)).collect();
            let viewer_jobs: FxHashSet<usize> = (0..self.jobs.len()).collect();
            compute_viewer_delta(
                &self.world,
                &self.index,
                &self.config,
                &trees,
                &viewer_jobs,
                overrides,
                session,
                Tick::new(to_tick),
                &self.sent_lists,
            )
        }
    }

    fn cell(map: MapId, x: i32, y: i32) -> ChunkLocation {
        ChunkLocation::map(map, ChunkCoord::new(x, y))
    }

    fn session() -> ViewerSession {
        ViewerSession::new(Uuid::new_v4(), 20, Tick::ZERO)
    }

    fn sent_ids(delta: &ViewerDelta<MemState>) -> Vec<NetworkId> {
        delta.states.iter().map(|u| u.entity).collect()
    }

    #[test]
    fn test_full_then_diff() {
        let mut fx = Fixture::new();
        let (map_net, map) = fx.world.spawn_map();
        let entity = fx.world.spawn(map_net, VisMask::NONE, Vec2::new(1.0, 1.0));
        fx.index.insert(entity, cell(map, 0, 0));
        fx.jobs = vec![(VisMask::DEFAULT, cell(map, 0, 0))];

        let mut s = session();
        let delta = fx.tick(&mut s, 1, &[]);
        assert_eq!(sent_ids(&delta), vec![map_net, entity], "parent precedes child");
        assert!(delta.states.iter().all(|u| u.visibility == SendVisibility::Full));

        s.apply_ack(Tick::new(1), &fx.sent_lists);
        let delta = fx.tick(&mut s, 2, &[]);
        assert_eq!(delta.from_tick, Tick::new(1));
        assert!(delta.states.iter().all(|u| u.visibility == SendVisibility::Diff));
        let update = delta.states.iter().find(|u| u.entity == entity).unwrap();
        let state = update.state.as_ref().unwrap();
        assert_eq!(state.from, Tick::new(1));
        assert_eq!(state.to, Tick::new(2));
    }

    #[test]
    fn test_unacked_viewer_keeps_getting_full() {
        let mut fx = Fixture::new();
        let (map_net, map) = fx.world.spawn_map();
        let entity = fx.world.spawn(map_net, VisMask::NONE, Vec2::new(1.0, 1.0));
        fx.index.insert(entity, cell(map, 0, 0));
        fx.jobs = vec![(VisMask::DEFAULT, cell(map, 0, 0))];

        let mut s = session();
        fx.tick(&mut s, 1, &[]);
        let delta = fx.tick(&mut s, 2, &[]);
        let update = delta.states.iter().find(|u| u.entity == entity).unwrap();
        assert_eq!(update.visibility, SendVisibility::Full);
        // Full state diffs from the last acked tick, which is never.
        assert_eq!(update.state.as_ref().unwrap().from, Tick::ZERO);
    }

    #[test]
    fn test_new_budget_prunes_subtree() {
        let mut fx = Fixture::new();
        let (map_net, map) = fx.world.spawn_map();
        let entity = fx.world.spawn(map_net, VisMask::NONE, Vec2::new(1.0, 1.0));
        fx.index.insert(entity, cell(map, 0, 0));
        fx.jobs = vec![(VisMask::DEFAULT, cell(map, 0, 0))];
        fx.config.new_entity_budget = 1;

        let mut s = session();
        let delta = fx.tick(&mut s, 1, &[]);
        assert_eq!(sent_ids(&delta), vec![map_net], "only the root fit the budget");
        assert_eq!(delta.stats.skipped_new, 1);

        // The skipped entity arrives once budget frees up.
        fx.config.new_entity_budget = 256;
        let delta = fx.tick(&mut s, 2, &[]);
        assert!(sent_ids(&delta).contains(&entity));
    }

    #[test]
    fn test_entered_budget_skip_counted_as_entered() {
        let mut fx = Fixture::new();
        let (map_net, map) = fx.world.spawn_map();
        let entity = fx.world.spawn(map_net, VisMask::NONE, Vec2::new(1.0, 1.0));
        fx.index.insert(entity, cell(map, 0, 0));
        fx.jobs = vec![(VisMask::DEFAULT, cell(map, 0, 0))];
        fx.config.entered_entity_budget = 1;

        let mut s = session();
        let delta = fx.tick(&mut s, 1, &[]);
        assert_eq!(sent_ids(&delta), vec![map_net]);
        // Brand new, but the entered budget was the one that bound.
        assert_eq!(delta.stats.skipped_entered, 1);
        assert_eq!(delta.stats.skipped_new, 0);
    }

    #[test]
    fn test_left_view_reported_once_and_reentry_is_full() {
        let mut fx = Fixture::new();
        let (map_net, map) = fx.world.spawn_map();
        let near = fx.world.spawn(map_net, VisMask::NONE, Vec2::new(1.0, 1.0));
        let far = fx.world.spawn(map_net, VisMask::NONE, Vec2::new(20.0, 1.0));
        fx.index.insert(near, cell(map, 0, 0));
        fx.index.insert(far, cell(map, 2, 0));

        // Tick 1: both chunks in view.
        fx.jobs = vec![
            (VisMask::DEFAULT, cell(map, 0, 0)),
            (VisMask::DEFAULT, cell(map, 2, 0)),
        ];
        let mut s = session();
        fx.tick(&mut s, 1, &[]);
        s.apply_ack(Tick::new(1), &fx.sent_lists);

        // Tick 2: far chunk out of view.
        fx.jobs = vec![(VisMask::DEFAULT, cell(map, 0, 0))];
        let delta = fx.tick(&mut s, 2, &[]);
        assert_eq!(delta.left_view, vec![far]);
        s.apply_ack(Tick::new(2), &fx.sent_lists);

        // Tick 3: still out of view, not reported again.
        let delta = fx.tick(&mut s, 3, &[]);
        assert!(delta.left_view.is_empty());
        s.apply_ack(Tick::new(3), &fx.sent_lists);

        // Tick 4: back in view, full send despite earlier acks.
        fx.jobs = vec![
            (VisMask::DEFAULT, cell(map, 0, 0)),
            (VisMask::DEFAULT, cell(map, 2, 0)),
        ];
        let delta = fx.tick(&mut s, 4, &[]);
        let update = delta.states.iter().find(|u| u.entity == far).unwrap();
        assert_eq!(update.visibility, SendVisibility::Full);
    }

    #[test]
    fn test_override_bypasses_mask_and_budget() {
        let mut fx = Fixture::new();
        let (map_net, map) = fx.world.spawn_map();
        let hidden = fx.world.spawn(map_net, VisMask(0b10), Vec2::new(1.0, 1.0));
        fx.index.insert(hidden, cell(map, 0, 0));
        fx.jobs = vec![(VisMask::DEFAULT, cell(map, 0, 0))];
        fx.config.new_entity_budget = 0;
        fx.config.entered_entity_budget = 0;

        let mut s = session();
        let delta = fx.tick(&mut s, 1, &[(hidden, false)]);
        assert_eq!(sent_ids(&delta), vec![map_net, hidden]);
    }

    #[test]
    fn test_recursive_override_includes_descendants() {
        let mut fx = Fixture::new();
        let (map_net, _) = fx.world.spawn_map();
        let parent = fx.world.spawn(map_net, VisMask(0b10), Vec2::new(50.0, 50.0));
        let child = fx.world.spawn(parent, VisMask(0b10), Vec2::new(50.0, 50.0));
        // Not indexed into any chunk the viewer resolves.
        fx.jobs = vec![];

        let mut s = session();
        let delta = fx.tick(&mut s, 1, &[(parent, true)]);
        let ids = sent_ids(&delta);
        assert!(ids.contains(&parent));
        assert!(ids.contains(&child));
        assert!(ids.contains(&map_net), "ancestor chain included");
    }

    #[test]
    fn test_session_override_and_eye_always_sent() {
        let mut fx = Fixture::new();
        let (map_net, _) = fx.world.spawn_map();
        let body = fx.world.spawn(map_net, VisMask::NONE, Vec2::new(90.0, 90.0));
        let pinned = fx.world.spawn(map_net, VisMask::NONE, Vec2::new(91.0, 90.0));
        fx.jobs = vec![];

        let mut s = session();
        s.attached = Some(body);
        s.overrides.insert(pinned, false);
        let delta = fx.tick(&mut s, 1, &[]);
        let ids = sent_ids(&delta);
        assert!(ids.contains(&body), "attached eye is always replicated");
        assert!(ids.contains(&pinned));
    }

    #[test]
    fn test_force_ack_after_threshold() {
        let mut fx = Fixture::new();
        let (map_net, map) = fx.world.spawn_map();
        let entity = fx.world.spawn(map_net, VisMask::NONE, Vec2::new(1.0, 1.0));
        fx.index.insert(entity, cell(map, 0, 0));
        fx.jobs = vec![(VisMask::DEFAULT, cell(map, 0, 0))];
        fx.config.force_ack_threshold = 2;

        let mut s = session();
        assert!(!fx.tick(&mut s, 1, &[]).force_ack);
        assert!(!fx.tick(&mut s, 2, &[]).force_ack);
        let delta = fx.tick(&mut s, 3, &[]);
        assert!(delta.force_ack);
        assert_eq!(s.last_ack(), Tick::new(3));

        // The forced baseline makes the next delta a diff.
        let delta = fx.tick(&mut s, 4, &[]);
        let update = delta.states.iter().find(|u| u.entity == entity).unwrap();
        assert_eq!(update.visibility, SendVisibility::Diff);
    }

    #[test]
    fn test_deletions_reported_until_acked() {
        let mut fx = Fixture::new();
        let (map_net, map) = fx.world.spawn_map();
        let entity = fx.world.spawn(map_net, VisMask::NONE, Vec2::new(1.0, 1.0));
        fx.index.insert(entity, cell(map, 0, 0));
        fx.jobs = vec![(VisMask::DEFAULT, cell(map, 0, 0))];

        let mut s = session();
        fx.tick(&mut s, 1, &[]);
        s.apply_ack(Tick::new(1), &fx.sent_lists);

        fx.world.despawn(entity);
        fx.index.remove(Tick::new(2), entity);
        s.forget_entity(entity);

        let delta = fx.tick(&mut s, 2, &[]);
        assert_eq!(delta.deletions, vec![entity]);
        assert!(!delta.left_view.contains(&entity), "deleted, not left");

        // Unacked, so the deletion is repeated.
        let delta = fx.tick(&mut s, 3, &[]);
        assert_eq!(delta.deletions, vec![entity]);

        s.apply_ack(Tick::new(3), &fx.sent_lists);
        let delta = fx.tick(&mut s, 4, &[]);
        assert!(delta.deletions.is_empty());
    }

    #[test]
    fn test_culling_disabled_sends_everything() {
        let mut fx = Fixture::new();
        fx.config.culling_enabled = false;
        let (map_net, map) = fx.world.spawn_map();
        let a = fx.world.spawn(map_net, VisMask::NONE, Vec2::new(1.0, 1.0));
        let b = fx.world.spawn(map_net, VisMask::NONE, Vec2::new(500.0, 500.0));
        fx.index.insert(a, cell(map, 0, 0));
        fx.index.insert(b, cell(map, 62, 62));
        fx.jobs = vec![];

        let mut s = session();
        let delta = fx.tick(&mut s, 1, &[]);
        let ids = sent_ids(&delta);
        assert!(ids.contains(&a));
        assert!(ids.contains(&b));
        assert!(ids.contains(&map_net));
    }
}
