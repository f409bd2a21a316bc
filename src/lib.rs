//! Visibility-scoped state replication for networked simulations.
//!
//! The server side of an eventually-consistent replication stream: each
//! connected viewer receives only the slice of the world its eyes can see,
//! as per-tick deltas against the last tick the viewer acknowledged.
//! Entities are bucketed into coarse spatial chunks, visibility trees are
//! built per (eye mask, chunk) pair and cached across ticks, and per-viewer
//! deltas are computed in parallel with budgets capping how many entities
//! may enter a view in one tick.
//!
//! The crate never owns the simulation. Entity metadata, transforms and
//! component state are reached through the [`world::WorldSource`] trait;
//! the host calls [`core::ReplicationCore::process_tick`] once per tick and
//! ships the resulting [`delta::ViewerDelta`]s to its clients.

pub mod chunk;
pub mod config;
pub mod core;
pub mod delta;
pub mod pool;
pub mod resolver;
pub mod session;
pub mod tree;
pub mod util;
pub mod world;

pub use crate::config::ReplicationConfig;
pub use crate::core::{ReplicationCore, TickOutput, TickStats};
pub use crate::delta::{DeltaStats, EntityUpdate, ViewerDelta};
pub use crate::session::SendVisibility;
pub use crate::util::tick::Tick;
pub use crate::world::{NetworkId, ViewerId, VisMask, WorldSource};
