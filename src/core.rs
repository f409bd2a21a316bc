//! Tick orchestration.
//!
//! [`ReplicationCore`] owns all replication state: the chunk index, the
//! tree cache, per-viewer sessions, override sets, and the buffer pools.
//! One call to [`process_tick`](ReplicationCore::process_tick) per
//! simulation tick runs the phases in order: drain queued acks, resolve
//! viewer eyes to chunk jobs, build dirty trees in parallel, install the
//! results, compute every viewer's delta in parallel, then trim the
//! deletion log to the oldest acknowledged tick.

use std::time::Instant;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, error, warn};

use crate::chunk::{ChunkCoord, ChunkIndex, ChunkIndexStats, ChunkLocation};
use crate::config::{ConfigError, ReplicationConfig};
use crate::delta::{compute_viewer_delta, OverrideRegistry, ViewerDelta};
use crate::pool::Pool;
use crate::resolver::{ChunkResolver, ResolvedViews, ViewerEyes};
use crate::session::ViewerSession;
use crate::tree::{build_tree, BuildOutcome, TreeCache, VisTree};
use crate::util::tick::Tick;
use crate::util::{FxHashMap, FxHashSet};
use crate::world::{EntityMeta, NetworkId, ViewerId, WorldSource};

/// Buffer pools shared across ticks and worker threads.
#[derive(Default)]
pub struct Pools {
    pub trees: Pool<VisTree>,
    pub index_sets: Pool<FxHashSet<usize>>,
    pub scratch_sets: Pool<FxHashSet<NetworkId>>,
    pub sent_lists: Pool<Vec<NetworkId>>,
}

/// Per-tick processing counters.
#[derive(Debug, Clone, Default)]
pub struct TickStats {
    pub viewers: usize,
    pub jobs: usize,
    pub trees_built: usize,
    pub trees_reused: usize,
    pub index: ChunkIndexStats,
}

/// One tick's worth of per-viewer deltas, ordered by viewer id.
pub struct TickOutput<S> {
    pub deltas: Vec<ViewerDelta<S>>,
    pub stats: TickStats,
}

pub struct ReplicationCore {
    config: ReplicationConfig,
    index: ChunkIndex,
    cache: TreeCache,
    resolver: ChunkResolver,
    overrides: OverrideRegistry,
    sessions: FxHashMap<ViewerId, ViewerSession>,
    pending_acks: Mutex<Vec<(ViewerId, Tick)>>,
    pools: Pools,
    current_tick: Tick,
}

impl ReplicationCore {
    pub fn new(config: ReplicationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            index: ChunkIndex::new(),
            cache: TreeCache::new(),
            resolver: ChunkResolver::new(),
            overrides: OverrideRegistry::default(),
            sessions: FxHashMap::default(),
            pending_acks: Mutex::new(Vec::new()),
            pools: Pools::default(),
            current_tick: Tick::ZERO,
        })
    }

    #[inline]
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn session(&self, viewer: ViewerId) -> Option<&ViewerSession> {
        self.sessions.get(&viewer)
    }

    /// Run one replication tick and produce a delta per connected viewer.
    pub fn process_tick<W: WorldSource>(&mut self, world: &W, to_tick: Tick) -> TickOutput<W::State> {
        let started = Instant::now();
        self.current_tick = to_tick;
        self.drain_acks();

        // Deterministic viewer order for resolution and output.
        let mut viewer_ids: Vec<ViewerId> = self.sessions.keys().copied().collect();
        viewer_ids.sort_unstable();
        let viewer_eyes: Vec<ViewerEyes> = viewer_ids
            .iter()
            .map(|&viewer| ViewerEyes {
                viewer,
                eyes: self.sessions[&viewer].eyes(),
            })
            .collect();

        let resolved = if self.config.culling_enabled {
            self.resolver.resolve(
                world,
                self.config.view_size,
                &viewer_eyes,
                &self.pools.index_sets,
            )
        } else {
            ResolvedViews {
                jobs: Vec::new(),
                viewer_jobs: viewer_ids
                    .iter()
                    .map(|_| self.pools.index_sets.get())
                    .collect(),
            }
        };

        // Tree build: read-only over index and cache, one job per task.
        let outcomes: Vec<BuildOutcome> = {
            let index = &self.index;
            let cache = &self.cache;
            let trees = &self.pools.trees;
            let scratch = &self.pools.scratch_sets;
            resolved
                .jobs
                .par_iter()
                .map(|&key| build_tree(world, index, cache, key, trees, scratch))
                .collect()
        };
        let trees_reused = outcomes
            .iter()
            .filter(|o| matches!(o, BuildOutcome::Reused))
            .count();
        let trees_built = outcomes.len() - trees_reused;
        self.cache
            .register(&mut self.index, &resolved.jobs, outcomes, &self.pools.trees);

        let trees: Vec<Option<&VisTree>> =
            resolved.jobs.iter().map(|&key| self.cache.tree(key)).collect();

        // Delta phase: each worker owns one session exclusively.
        let global = self.overrides.snapshot();
        let mut ordered: Vec<(ViewerId, &mut ViewerSession)> = self
            .sessions
            .iter_mut()
            .map(|(&viewer, session)| (viewer, session))
            .collect();
        ordered.sort_unstable_by_key(|(viewer, _)| *viewer);

        let config = &self.config;
        let index = &self.index;
        let sent_lists = &self.pools.sent_lists;
        let deltas: Vec<ViewerDelta<W::State>> = ordered
            .into_par_iter()
            .zip(resolved.viewer_jobs.par_iter())
            .map(|((_, session), viewer_jobs)| {
                compute_viewer_delta(
                    world,
                    index,
                    config,
                    &trees,
                    viewer_jobs,
                    &global,
                    session,
                    to_tick,
                    sent_lists,
                )
            })
            .collect();

        for set in resolved.viewer_jobs {
            self.pools.index_sets.put(set);
        }

        let oldest_ack = self
            .sessions
            .values()
            .map(|s| s.last_ack())
            .min()
            .unwrap_or(to_tick);
        self.index.cull_deletions(oldest_ack);

        let stats = TickStats {
            viewers: deltas.len(),
            jobs: resolved.jobs.len(),
            trees_built,
            trees_reused,
            index: self.index.stats(),
        };
        debug!(
            %to_tick,
            viewers = stats.viewers,
            jobs = stats.jobs,
            built = stats.trees_built,
            reused = stats.trees_reused,
            elapsed_us = started.elapsed().as_micros() as u64,
            "replication tick processed"
        );
        TickOutput { deltas, stats }
    }

    /// Queue a client acknowledgement; applied at the start of the next
    /// tick. Callable from network threads.
    pub fn queue_ack(&self, viewer: ViewerId, tick: Tick) {
        self.pending_acks.lock().push((viewer, tick));
    }

    fn drain_acks(&mut self) {
        let acks = std::mem::take(&mut *self.pending_acks.lock());
        for (viewer, tick) in acks {
            if let Some(session) = self.sessions.get_mut(&viewer) {
                session.apply_ack(tick, &self.pools.sent_lists);
            }
        }
    }

    pub fn on_viewer_join(&mut self, viewer: ViewerId) {
        if self.sessions.contains_key(&viewer) {
            error!(%viewer, "viewer joined twice, keeping existing session");
            return;
        }
        self.sessions.insert(
            viewer,
            ViewerSession::new(viewer, self.config.window, self.current_tick),
        );
    }

    pub fn on_viewer_leave(&mut self, viewer: ViewerId) {
        match self.sessions.remove(&viewer) {
            Some(mut session) => session.release(&self.pools.sent_lists),
            None => warn!(%viewer, "leave for unknown viewer"),
        }
    }

    /// Client requested a full resync of everything it can see.
    pub fn on_request_full(&mut self, viewer: ViewerId) {
        if let Some(session) = self.sessions.get_mut(&viewer) {
            session.request_full(&self.pools.sent_lists);
        }
    }

    pub fn set_attached_entity(&mut self, viewer: ViewerId, entity: Option<NetworkId>) {
        if let Some(session) = self.sessions.get_mut(&viewer) {
            session.attached = entity;
        }
    }

    pub fn add_view_subscription(&mut self, viewer: ViewerId, eye: NetworkId) {
        if let Some(session) = self.sessions.get_mut(&viewer) {
            if !session.view_subscriptions.contains(&eye) {
                session.view_subscriptions.push(eye);
            }
        }
    }

    pub fn remove_view_subscription(&mut self, viewer: ViewerId, eye: NetworkId) {
        if let Some(session) = self.sessions.get_mut(&viewer) {
            session.view_subscriptions.retain(|e| *e != eye);
        }
    }

    /// Replicate an entity to every viewer regardless of position or mask.
    pub fn add_global_override(&mut self, entity: NetworkId, recursive: bool) {
        self.overrides.add(entity, recursive);
    }

    pub fn remove_global_override(&mut self, entity: NetworkId) {
        self.overrides.remove(entity);
    }

    /// Replicate an entity to one viewer regardless of position or mask.
    pub fn add_session_override(&mut self, viewer: ViewerId, entity: NetworkId, recursive: bool) {
        if let Some(session) = self.sessions.get_mut(&viewer) {
            session.overrides.insert(entity, recursive);
        }
    }

    pub fn remove_session_override(&mut self, viewer: ViewerId, entity: NetworkId) {
        if let Some(session) = self.sessions.get_mut(&viewer) {
            session.overrides.remove(&entity);
        }
    }

    pub fn set_viewer_budgets(
        &mut self,
        viewer: ViewerId,
        new_entities: Option<usize>,
        entered_entities: Option<usize>,
    ) {
        if let Some(session) = self.sessions.get_mut(&viewer) {
            session.new_entity_budget = new_entities;
            session.entered_entity_budget = entered_entities;
        }
    }

    /// Register a freshly spawned entity. Roots (maps, grids) are not
    /// indexed; they enter trees through their descendants' ancestor
    /// chains.
    pub fn entity_spawned<W: WorldSource>(&mut self, world: &W, id: NetworkId) {
        let Some(meta) = world.resolve_entity(id) else {
            warn!(entity = %id, "spawned entity does not resolve");
            return;
        };
        if meta.is_root || meta.map.is_nullspace() {
            return;
        }
        self.index.insert(id, locate(world, &meta, id));
    }

    /// Reindex an entity (and its descendants, whose world positions moved
    /// with it) after a transform or parent change. `force_dirty` rebuilds
    /// the trees even when no chunk boundary was crossed, for changes that
    /// alter tree contents rather than position.
    pub fn entity_moved<W: WorldSource>(&mut self, world: &W, id: NetworkId, force_dirty: bool) {
        let mut stack: Vec<NetworkId> = vec![id];
        while let Some(current) = stack.pop() {
            let Some(meta) = world.resolve_entity(current) else {
                warn!(entity = %current, "moved entity does not resolve");
                continue;
            };
            if meta.is_root {
                // A moving grid carries its chunks with it; grid-local
                // coordinates are unchanged.
                continue;
            }
            if meta.map.is_nullspace() {
                self.index.unindex(current);
            } else {
                let location = locate(world, &meta, current);
                if self.index.location_of(current).is_some() {
                    self.index.update(current, location, force_dirty);
                } else {
                    self.index.insert(current, location);
                }
            }
            stack.extend(world.children(current));
        }
    }

    /// An entity's visibility mask changed: its chunks' trees must be
    /// rebuilt for every mask even though nothing moved.
    pub fn entity_visibility_changed<W: WorldSource>(&mut self, world: &W, id: NetworkId) {
        self.entity_moved(world, id, true);
    }

    /// Unregister a deleted entity and schedule deletion notices for every
    /// viewer that has not acknowledged past `tick`.
    pub fn entity_deleted(&mut self, tick: Tick, id: NetworkId) {
        self.index.remove(tick, id);
        for session in self.sessions.values_mut() {
            session.forget_entity(id);
        }
    }
}

/// Chunk an entity belongs in: grid-local when it sits on a grid, otherwise
/// map space.
fn locate<W: WorldSource>(world: &W, meta: &EntityMeta, id: NetworkId) -> ChunkLocation {
    let position = world.world_position(id);
    match meta.grid {
        Some(grid) => {
            let local = world.grid_transform(grid).inverse_transform_point(position);
            ChunkLocation::grid(grid, ChunkCoord::from_position(local))
        }
        None => ChunkLocation::map(meta.map, ChunkCoord::from_position(position)),
    }
}
