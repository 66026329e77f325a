//! Per-transaction bookkeeping for which physical worker connection a
//! distributed query's placements should run on.
//!
//! A coordinator backend executes queries against shards that may have
//! multiple physical placements (replicas) spread across worker nodes.
//! Within one distributed transaction, the same placement (or a family of
//! co-located placements) must keep running on the same physical connection
//! once it has been written to, or a self-deadlock or a read-your-own-writes
//! violation becomes possible. [`ConnectionManager`] is the arena that tracks
//! this and the two-pass algorithm (`Pass 1` picks a connection, `Pass 2`
//! records the assignment) that enforces it; [`reaper`] does the matching
//! per-shard failure accounting at commit time.
//!
//! See [`ConnectionManager::acquire_connection`] for the crate's one
//! entry point, and the `catalog`/`pool` modules for the two collaborators
//! it consumes.

pub mod arena;
pub mod catalog;
pub mod error;
pub mod knobs;
pub mod manager;
pub mod policy;
pub mod pool;
pub mod reaper;
pub mod types;

pub use catalog::{
    PlacementCatalog,
    PlacementCatalogRow,
    PlacementState,
};
pub use manager::ConnectionManager;
pub use pool::{
    ConnectionPool,
    PooledConnectionId,
};
pub use types::{
    AccessType,
    AcquireFlags,
    ColocationKey,
    NodeAddr,
    PlacementAccess,
    PlacementId,
    RepresentativeValue,
    ShardId,
    UserName,
};

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;
