//! Per-transaction arena: [`ConnectionRef`], [`PlacementEntry`],
//! [`ColocationEntry`] and [`ShardEntry`] are allocated in `slab::Slab`s owned
//! by the [`crate::manager::ConnectionManager`] and referenced by handle
//! rather than by raw pointer, so the whole arena can be cleared in one
//! stroke at transaction end.
//!
//! A co-located family's [`ColocationEntry`] and every [`PlacementEntry`] in
//! that family hold the *same* [`CrHandle`] value, so mutating the
//! [`ConnectionRef`] through either path is observed by both — this is how
//! DML exclusivity is enforced across co-located tables.

use crate::{
    pool::PooledConnectionId,
    types::{
        ColocationKey,
        PlacementId,
        ShardId,
        UserName,
    },
};

macro_rules! define_handle {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub usize);
    };
}

define_handle!(CrHandle);
define_handle!(PeHandle);
define_handle!(CeHandle);
define_handle!(SeHandle);

/// ConnectionReference (CR): the association between a placement (or
/// co-located family) and a live connection within this transaction.
#[derive(Debug, Clone)]
pub struct ConnectionRef {
    pub user: UserName,
    pub connection: Option<PooledConnectionId>,
    pub had_dml: bool,
    pub had_ddl: bool,
}

impl ConnectionRef {
    /// A freshly created CR for a placement or co-located family that has
    /// not yet been assigned a connection in this transaction.
    pub fn empty() -> Self {
        Self {
            user: UserName::new(),
            connection: None,
            had_dml: false,
            had_ddl: false,
        }
    }

    pub fn is_modified(&self) -> bool {
        self.had_dml || self.had_ddl
    }
}

/// PlacementEntry (PE): per-placement bookkeeping, lives exactly one
/// transaction.
#[derive(Debug, Clone)]
pub struct PlacementEntry {
    pub placement_id: PlacementId,
    pub primary: CrHandle,
    pub has_secondary_readers: bool,
    /// How many distinct connections, beyond the first, have been used to
    /// access this placement in the current transaction. Observational
    /// only — feeds a log warning when it grows unusually large, but does
    /// not affect `has_secondary_readers` or any decision-table outcome.
    pub secondary_reader_count: u32,
    pub failed: bool,
    pub colocation_link: Option<CeHandle>,
    pub shard_id: ShardId,
}

/// ColocationEntry (CE): per co-located family, keyed by [`ColocationKey`].
#[derive(Debug, Clone)]
pub struct ColocationEntry {
    pub key: ColocationKey,
    pub primary: CrHandle,
    pub has_secondary_readers: bool,
}

/// ShardEntry (SE): per-shard bookkeeping, used only by [`crate::reaper`] at
/// commit time.
#[derive(Debug, Clone)]
pub struct ShardEntry {
    pub shard_id: ShardId,
    pub placements: Vec<PeHandle>,
}

impl ShardEntry {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            placements: Vec::new(),
        }
    }

    /// Adds `pe` to this shard's placement list, de-duplicated by handle (a
    /// placement may be touched multiple times within one `acquire_connection`
    /// call, or across several calls in the same transaction).
    pub fn add_placement(&mut self, pe: PeHandle) {
        if !self.placements.contains(&pe) {
            self.placements.push(pe);
        }
    }
}
