//! Identifiers and small value types shared across the crate.

use std::fmt;

/// Catalog-assigned identifier of a physical shard replica.
pub type PlacementId = u64;

/// Identifier of the logical partition a placement belongs to.
pub type ShardId = u64;

/// Lower bound of a hash-partitioned placement's range, or an arbitrary stable
/// value for reference tables. Part of a [`ColocationKey`].
pub type RepresentativeValue = u32;

/// The role a connection was (or would be) established under. Reused
/// connections must have been established under the same role, since role
/// changes can change what's visible.
pub type UserName = String;

/// Key identifying a co-located family: placements on the same node, in the
/// same colocation group, sharing a hash-range lower bound must share a
/// connection within a transaction to avoid self-deadlock on foreign keys
/// between co-located tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColocationKey {
    pub node_name: String,
    pub node_port: u16,
    pub colocation_group_id: u32,
    pub representative_value: RepresentativeValue,
}

/// The SQL surface an access exercises against a placement, in ascending
/// order of how exclusive it needs to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessType {
    Select,
    Dml,
    Ddl,
}

impl AccessType {
    pub fn is_ddl(self) -> bool {
        matches!(self, AccessType::Ddl)
    }

    pub fn is_dml(self) -> bool {
        matches!(self, AccessType::Dml)
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessType::Select => "SELECT",
            AccessType::Dml => "DML",
            AccessType::Ddl => "DDL",
        };
        write!(f, "{s}")
    }
}

/// Mirrors the pool-facing flags the planner passes to `acquire_connection`.
/// Only the flags the policy engine itself interprets are modeled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcquireFlags {
    pub for_dml: bool,
    pub for_ddl: bool,
    pub force_new_connection: bool,
}

impl AcquireFlags {
    pub const fn new() -> Self {
        Self {
            for_dml: false,
            for_ddl: false,
            force_new_connection: false,
        }
    }

    /// The access type every placement in this batch is classified as, absent
    /// a placement-specific override.
    pub fn default_access_type(self) -> AccessType {
        if self.for_ddl {
            AccessType::Ddl
        } else if self.for_dml {
            AccessType::Dml
        } else {
            AccessType::Select
        }
    }
}

/// Coordinates of the worker node a placement lives on, passed to the
/// connection pool when no existing connection can be reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

/// One entry in the planner's ordered access list. The access type for the
/// whole batch is derived once from the call's [`AcquireFlags`]; it is not
/// per-access.
#[derive(Debug, Clone)]
pub struct PlacementAccess {
    pub placement_id: PlacementId,
    pub shard_id: ShardId,
    pub node: NodeAddr,
    /// Present iff the placement is hash-partitioned or a reference table.
    pub colocation: Option<ColocationKey>,
}

impl PlacementAccess {
    /// The sentinel used for zero-row SELECT pruning: such accesses carry no
    /// real shard and fall through to a default connection rather than
    /// participating in the bookkeeping.
    pub const INVALID_SHARD_ID: ShardId = 0;

    pub fn is_pruned(&self) -> bool {
        self.shard_id == Self::INVALID_SHARD_ID
    }
}
