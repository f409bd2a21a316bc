//! Per-viewer replication state.
//!
//! Each connected viewer carries a send record per entity it has ever been
//! told about, plus a bounded history of what was sent on which tick so
//! that client acknowledgements can be mapped back to entities. History
//! older than the ack window is evicted, with a single overflow slot
//! keeping the oldest unacknowledged entry alive for slow clients.

use std::collections::VecDeque;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::ReplicationConfig;
use crate::pool::Pool;
use crate::util::tick::Tick;
use crate::util::FxHashMap;
use crate::world::{NetworkId, ViewerId};

/// How an entity's state was packaged in a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendVisibility {
    /// Full component state, sent when the entity enters view or the viewer
    /// has never acknowledged it.
    Full,
    /// Changes since the viewer's acknowledged tick.
    Diff,
}

/// What one viewer knows about one entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendRecord {
    /// Last tick this entity was included in a delta for the viewer.
    pub last_sent: Tick,
    /// Tick the entity last left the viewer's visible set, zero if never.
    pub last_left_view: Tick,
    /// Newest tick the viewer has acknowledged containing this entity.
    /// Zero means no send has ever been confirmed, so sends stay full.
    pub entity_last_acked: Tick,
}

/// Ring of (tick, entities sent) entries, at most `window` long, plus one
/// overflow slot holding the oldest evicted entry that was never acked.
pub struct SentHistory {
    window: usize,
    ring: VecDeque<(Tick, Vec<NetworkId>)>,
    overflow: Option<(Tick, Vec<NetworkId>)>,
}

impl SentHistory {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            ring: VecDeque::with_capacity(window + 1),
            overflow: None,
        }
    }

    /// Record the entity list sent at `tick`. Evicts the oldest entry once
    /// the ring exceeds the window: an already-acked entry goes back to the
    /// pool, an unacked one moves to the overflow slot. The overflow slot
    /// keeps the oldest such entry; later evictions are dropped.
    pub fn record(
        &mut self,
        tick: Tick,
        sent: Vec<NetworkId>,
        last_ack: Tick,
        pool: &Pool<Vec<NetworkId>>,
    ) {
        self.ring.push_back((tick, sent));
        if self.ring.len() <= self.window {
            return;
        }
        if let Some((evicted_tick, list)) = self.ring.pop_front() {
            if evicted_tick > last_ack && self.overflow.is_none() {
                self.overflow = Some((evicted_tick, list));
            } else {
                pool.put(list);
            }
        }
    }

    /// Entity list sent at exactly `tick`, if still retained.
    pub fn get(&self, tick: Tick) -> Option<&[NetworkId]> {
        if let Some((t, list)) = &self.overflow {
            if *t == tick {
                return Some(list);
            }
        }
        self.ring
            .iter()
            .find(|(t, _)| *t == tick)
            .map(|(_, list)| list.as_slice())
    }

    /// Release the overflow slot once the viewer has acked past it.
    pub fn prune(&mut self, last_ack: Tick, pool: &Pool<Vec<NetworkId>>) {
        if matches!(&self.overflow, Some((t, _)) if *t <= last_ack) {
            if let Some((_, list)) = self.overflow.take() {
                pool.put(list);
            }
        }
    }

    /// The most recently recorded entity list, if any.
    pub fn last_list(&self) -> Option<&[NetworkId]> {
        self.ring.back().map(|(_, list)| list.as_slice())
    }

    /// Return every retained list to the pool.
    pub fn clear(&mut self, pool: &Pool<Vec<NetworkId>>) {
        for (_, list) in self.ring.drain(..) {
            pool.put(list);
        }
        if let Some((_, list)) = self.overflow.take() {
            pool.put(list);
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len() + usize::from(self.overflow.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty() && self.overflow.is_none()
    }
}

/// Replication state for one connected viewer.
pub struct ViewerSession {
    pub id: ViewerId,
    /// Entity this viewer's camera follows, if any.
    pub attached: Option<NetworkId>,
    /// Extra eye entities (remote cameras, surveillance) the viewer sees
    /// through in addition to the attached entity.
    pub view_subscriptions: SmallVec<[NetworkId; 2]>,
    /// Session-local visibility overrides; value is the recursive flag.
    pub overrides: FxHashMap<NetworkId, bool>,
    /// Per-viewer cap overriding the configured new-entity budget.
    pub new_entity_budget: Option<usize>,
    /// Per-viewer cap overriding the configured entered-entity budget.
    pub entered_entity_budget: Option<usize>,
    pub(crate) records: FxHashMap<NetworkId, SendRecord>,
    pub(crate) sent: SentHistory,
    pub(crate) last_ack: Tick,
    pub(crate) requested_full: bool,
}

impl ViewerSession {
    /// `now` is the tick the viewer joined on. The ack watermark starts
    /// there: with no send records everything visible is brand new anyway,
    /// and counting the force-ack timeout from before the connection would
    /// trip it on the first delta.
    pub fn new(id: ViewerId, window: usize, now: Tick) -> Self {
        Self {
            id,
            attached: None,
            view_subscriptions: SmallVec::new(),
            overrides: FxHashMap::default(),
            new_entity_budget: None,
            entered_entity_budget: None,
            records: FxHashMap::default(),
            sent: SentHistory::new(window),
            last_ack: now,
            requested_full: false,
        }
    }

    /// Entities this viewer sees through, deduplicated.
    pub fn eyes(&self) -> SmallVec<[NetworkId; 2]> {
        let mut eyes: SmallVec<[NetworkId; 2]> = SmallVec::new();
        if let Some(attached) = self.attached {
            eyes.push(attached);
        }
        for &sub in &self.view_subscriptions {
            if !eyes.contains(&sub) {
                eyes.push(sub);
            }
        }
        eyes
    }

    #[inline]
    pub fn last_ack(&self) -> Tick {
        self.last_ack
    }

    /// Tick deltas for this viewer are computed from: everything after it is
    /// new to the viewer.
    #[inline]
    pub fn from_tick(&self) -> Tick {
        self.last_ack
    }

    pub fn record(&self, id: NetworkId) -> Option<&SendRecord> {
        self.records.get(&id)
    }

    pub fn effective_new_budget(&self, config: &ReplicationConfig) -> usize {
        self.new_entity_budget.unwrap_or(config.new_entity_budget)
    }

    pub fn effective_entered_budget(&self, config: &ReplicationConfig) -> usize {
        self.entered_entity_budget
            .unwrap_or(config.entered_entity_budget)
    }

    /// Apply a client acknowledgement of the delta sent at `tick`.
    ///
    /// Stale and duplicate acks are ignored. If the sent list for `tick` was
    /// already evicted the per-entity acks are lost and those entities keep
    /// receiving full sends until a retained tick is acked.
    pub fn apply_ack(&mut self, tick: Tick, pool: &Pool<Vec<NetworkId>>) {
        if tick <= self.last_ack {
            return;
        }
        let Self { sent, records, .. } = self;
        match sent.get(tick) {
            Some(list) => {
                for id in list {
                    if let Some(record) = records.get_mut(id) {
                        record.entity_last_acked = tick;
                    }
                }
            }
            None => {
                debug!(viewer = %self.id, %tick, "ack for evicted tick, per-entity acks lost");
            }
        }
        self.last_ack = tick;
        self.sent.prune(tick, pool);
    }

    /// Client asked for a full resync: forget everything sent so far. The
    /// next delta is computed as if nothing had ever been sent, replaying
    /// the visible set as full state and the retained deletion history,
    /// and advances the ack watermark once served.
    pub fn request_full(&mut self, pool: &Pool<Vec<NetworkId>>) {
        warn!(viewer = %self.id, "full state resync requested");
        self.records.clear();
        self.sent.clear(pool);
        self.requested_full = true;
    }

    /// Hand every pooled buffer back before the session is dropped.
    pub fn release(&mut self, pool: &Pool<Vec<NetworkId>>) {
        self.sent.clear(pool);
    }

    /// Forget a deleted entity entirely.
    pub fn forget_entity(&mut self, id: NetworkId) {
        self.records.remove(&id);
    }
}
