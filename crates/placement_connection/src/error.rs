//! Structured errors for the connection manager.
//!
//! Every conflict the policy engine raises is tagged with
//! [`errors::ErrorMetadata`] the same way the rest of this codebase tags
//! client-classifiable failures, so callers (and tests) can match on
//! `short_msg` rather than parsing a message string.

use errors::{
    ErrorCode,
    ErrorMetadata,
};

use crate::types::PlacementId;

/// A conflict raised by the connection-assignment decision table: the
/// requested access cannot be served without risking a self-deadlock or a
/// read-your-own-writes violation. The caller is expected to abort the
/// distributed transaction.
pub fn conflict(placement_id: PlacementId, short_msg: &'static str, msg: String) -> anyhow::Error {
    anyhow::anyhow!(ErrorMetadata::bad_request(short_msg, msg)).context(format!(
        "placement connection conflict on placement {placement_id}"
    ))
}

pub fn ddl_after_multi_read(placement_id: PlacementId) -> anyhow::Error {
    conflict(
        placement_id,
        "DDLOnMultiplyReadPlacement",
        format!(
            "cannot perform DDL on placement {placement_id}, which has been read over multiple \
             connections"
        ),
    )
}

pub fn ddl_after_colocated_multi_read(placement_id: PlacementId) -> anyhow::Error {
    conflict(
        placement_id,
        "DDLOnMultiplyReadColocatedPlacement",
        format!(
            "cannot perform DDL on placement {placement_id}: a co-located placement has been \
             read over multiple connections"
        ),
    )
}

pub fn modified_over_multiple_connections(placement_id: PlacementId) -> anyhow::Error {
    conflict(
        placement_id,
        "PlacementModifiedOverMultipleConnections",
        format!(
            "placements have been modified over multiple connections in the same transaction \
             (placement {placement_id})"
        ),
    )
}

pub fn new_connection_disallowed_ddl(placement_id: PlacementId) -> anyhow::Error {
    conflict(
        placement_id,
        "NewConnectionDisallowedDdlInProgress",
        format!(
            "cannot open a new connection: DDL is already in progress on a busy connection for \
             placement {placement_id}"
        ),
    )
}

pub fn new_connection_disallowed_dml(placement_id: PlacementId) -> anyhow::Error {
    conflict(
        placement_id,
        "NewConnectionDisallowedDmlInProgress",
        format!(
            "cannot open a new connection: DML is already in progress on a busy connection for \
             placement {placement_id}"
        ),
    )
}

pub fn parallel_ddl_forbidden(placement_id: PlacementId) -> anyhow::Error {
    conflict(
        placement_id,
        "ParallelDdlForbidden",
        format!(
            "cannot perform DDL on placement {placement_id} over a new connection while it is \
             already accessed over the current connection"
        ),
    )
}

/// A fatal, transaction-ending failure: either every modifying connection on
/// a shard failed, or nothing committed anywhere at all. Uses the same
/// generic error code as
/// `ErrorMetadata::operational_internal_server_error()`, but keeps a
/// distinguishable `short_msg` so tests and metrics can tell fatal reasons
/// apart.
pub fn fatal(short_msg: &'static str, msg: String) -> anyhow::Error {
    anyhow::anyhow!(ErrorMetadata {
        code: ErrorCode::OperationalInternalServerError,
        short_msg: short_msg.into(),
        msg: msg.into(),
    })
}

pub fn all_replicas_failed(shard_id: u64) -> anyhow::Error {
    fatal(
        "ShardUnreachable",
        format!("could not make changes to shard {shard_id} on any node"),
    )
}

pub fn nothing_committed() -> anyhow::Error {
    fatal(
        "NoShardsCommitted",
        "could not commit any shard of this transaction on any node".to_string(),
    )
}
