//! The first-pass decision table and `can_reuse`.
//!
//! This module is deliberately free of arena/index bookkeeping: it takes the
//! already-looked-up state for one access and returns what
//! [`crate::manager::ConnectionManager::acquire_connection`] should do next.
//! That keeps the 9-row table testable in isolation from the slabs.

use crate::{
    arena::ConnectionRef,
    error,
    knobs,
    pool::PooledConnectionId,
    types::{
        AccessType,
        AcquireFlags,
        PlacementId,
        UserName,
    },
};

/// What Pass 1 learned about a single access against its placement's current
/// primary connection.
pub enum Pass1Result {
    /// Rule 1 or rule 9: this access places no constraint on `chosen`. Pass 2
    /// will either reuse whatever was chosen from another access, or (if
    /// nothing else in the batch chose anything) ask the pool for a fresh
    /// connection.
    NoConstraint,
    /// Rule 5: reuse `pc`'s connection. `locks_in` is true when `pc` already
    /// had writes, per the rule's "if pc.had_ddl ∨ pc.had_dml then locked_in =
    /// true".
    Reuse {
        connection: PooledConnectionId,
        locks_in: bool,
    },
}

/// Whether `pc`'s existing connection can be reused for a new access.
/// `claimed_exclusively` is read from the external pool; everything else is
/// local bookkeeping.
pub fn can_reuse(
    pc: &ConnectionRef,
    flags: AcquireFlags,
    user: &UserName,
    claimed_exclusively: bool,
) -> bool {
    if pc.connection.is_none() {
        return false;
    }
    if claimed_exclusively {
        return false;
    }
    let force_new = flags.force_new_connection && *knobs::PCM_FORCE_NEW_CONNECTION_ENABLED;
    if force_new {
        return false;
    }
    pc.user == *user
}

/// Runs the first-pass decision table for one access. `chosen`/`locked_in`
/// are the loop variables threaded across the whole `access_list` by the
/// caller; this function only reads them and reports what changed — it does
/// not mutate them, so the table stays a pure function of its inputs.
///
/// `ce_has_secondary_readers` is `None` when the placement has no co-located
/// family; `has_secondary_readers` is the placement's own flag.
#[allow(clippy::too_many_arguments)]
pub fn classify_access(
    placement_id: PlacementId,
    pc: &ConnectionRef,
    ce_has_secondary_readers: Option<bool>,
    has_secondary_readers: bool,
    access_type: AccessType,
    flags: AcquireFlags,
    user: &UserName,
    claimed_exclusively: bool,
    chosen: Option<PooledConnectionId>,
    locked_in: bool,
) -> anyhow::Result<Pass1Result> {
    macro_rules! log_row {
        ($row:expr, $outcome:expr) => {
            if *knobs::PCM_LOG_DECISIONS {
                tracing::debug!(placement_id, row = $row, outcome = $outcome, "decision table");
            }
        };
    }

    // Row 1.
    if pc.connection.is_none() {
        log_row!(1, "no existing connection, no constraint");
        return Ok(Pass1Result::NoConstraint);
    }

    // Row 2.
    if access_type.is_ddl() && has_secondary_readers {
        log_row!(2, "rejected: DDL after multi-read");
        return Err(error::ddl_after_multi_read(placement_id));
    }

    // Row 3.
    if access_type.is_ddl() && ce_has_secondary_readers.unwrap_or(false) {
        log_row!(3, "rejected: DDL after co-located multi-read");
        return Err(error::ddl_after_colocated_multi_read(placement_id));
    }

    // Row 4.
    if locked_in && pc.is_modified() && chosen != pc.connection {
        log_row!(4, "rejected: modified over multiple connections");
        return Err(error::modified_over_multiple_connections(placement_id));
    }

    // Row 5.
    if can_reuse(pc, flags, user, claimed_exclusively) {
        let locks_in = pc.is_modified();
        log_row!(5, "reusing existing connection");
        return Ok(Pass1Result::Reuse {
            connection: pc.connection.expect("checked above"),
            locks_in,
        });
    }

    // Rows 6-8.
    if pc.had_ddl {
        log_row!(6, "rejected: DDL already in progress on a busy connection");
        return Err(error::new_connection_disallowed_ddl(placement_id));
    }
    if pc.had_dml {
        log_row!(7, "rejected: DML already in progress on a busy connection");
        return Err(error::new_connection_disallowed_dml(placement_id));
    }
    if access_type.is_ddl() {
        log_row!(8, "rejected: parallel DDL forbidden");
        return Err(error::parallel_ddl_forbidden(placement_id));
    }

    // Row 9.
    log_row!(9, "existing connection not reusable, no constraint");
    Ok(Pass1Result::NoConstraint)
}
