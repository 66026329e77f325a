//! The per-shard failure accounting run by the coordinator's commit
//! orchestrator around the remote commit. Free functions rather than a
//! struct of its own — there is no state besides what each call reads off
//! the manager's arenas.

use crate::{
    arena::PeHandle,
    catalog::{
        PlacementCatalog,
        PlacementState,
    },
    error,
    manager::ConnectionManager,
    pool::ConnectionPool,
    types::ShardId,
};

/// `modified_ok`/`modified_failed` counts for one ShardEntry, plus the
/// placement handles that belong to `modified_failed` (so the caller can mark
/// them `failed` and drive the catalog transition).
struct ShardTally {
    shard_id: ShardId,
    modified_ok: usize,
    failed: Vec<PeHandle>,
}

fn tally<P: ConnectionPool, C: PlacementCatalog>(
    manager: &ConnectionManager<P, C>,
) -> Vec<ShardTally> {
    let placements = manager.placements();
    let connections = manager.connections();
    let pool = manager.pool();

    manager
        .shards()
        .iter()
        .map(|(_, shard)| {
            let mut modified_ok = 0;
            let mut failed = Vec::new();

            for &pe in &shard.placements {
                let entry = &placements[pe.0];
                let cr = &connections[entry.primary.0];
                if !cr.is_modified() {
                    continue;
                }
                let remote_failed = match cr.connection {
                    Some(conn) => pool.remote_tx_failed(conn),
                    None => true,
                };
                if remote_failed {
                    failed.push(pe);
                } else {
                    modified_ok += 1;
                }
            }

            ShardTally {
                shard_id: shard.shard_id,
                modified_ok,
                failed,
            }
        })
        .collect()
}

/// Marks every placement in `failed` as failed, unconditionally. This runs
/// for a shard regardless of whether the shard as a whole is going to be
/// treated as fatal: the bookkeeping on each `PlacementEntry` reflects what
/// actually happened to it, independent of how the caller chooses to react
/// at the shard level.
fn mark_failed<P: ConnectionPool, C: PlacementCatalog>(
    manager: &mut ConnectionManager<P, C>,
    failed: &[PeHandle],
) {
    for &pe in failed {
        manager.placements_mut()[pe.0].failed = true;
    }
}

/// Transitions each failed placement's catalog row from `Finalized` to
/// `Inactive`; placements in any other persisted state are left alone since
/// some other actor (e.g. an in-progress shard move) owns them.
fn invalidate_failed<P: ConnectionPool, C: PlacementCatalog>(
    manager: &mut ConnectionManager<P, C>,
    shard_id: ShardId,
    failed: &[PeHandle],
) -> anyhow::Result<()> {
    for &pe in failed {
        let placement_id = manager.placements()[pe.0].placement_id;
        let row = manager
            .catalog_mut()
            .load_group_placement(shard_id, placement_id)?;
        if row.state == PlacementState::Finalized {
            tracing::warn!(
                shard_id,
                placement_id,
                "invalidating placement after remote transaction failure"
            );
            manager
                .catalog_mut()
                .update_placement_state(placement_id, PlacementState::Inactive)?;
        }
    }
    Ok(())
}

/// Runs just before asking workers to commit. For every shard touched this
/// transaction, a placement whose connection carried a write but whose
/// remote transaction failed (or lost its connection) is marked failed; if
/// every modifying placement on a shard failed, nothing was persisted for
/// it, so it's excluded from catalog invalidation but every *other* shard in
/// the same call — fully succeeded or only partially failed — is still
/// invalidated, even though the call as a whole returns an error once the
/// loop is done.
pub fn check_pre_commit<P: ConnectionPool, C: PlacementCatalog>(
    manager: &mut ConnectionManager<P, C>,
) -> anyhow::Result<()> {
    let tallies = tally(manager);

    let mut fatal_shard = None;
    for t in &tallies {
        mark_failed(manager, &t.failed);
        if !t.failed.is_empty() && t.modified_ok == 0 {
            tracing::error!(shard_id = t.shard_id, "could not make changes to shard on any node");
            fatal_shard.get_or_insert(t.shard_id);
            continue;
        }
        invalidate_failed(manager, t.shard_id, &t.failed)?;
    }

    if let Some(shard_id) = fatal_shard {
        return Err(error::all_replicas_failed(shard_id));
    }

    Ok(())
}

/// Runs after the remote commit attempt. Same per-shard accounting as the
/// pre-commit pass, but a shard where every modifying placement failed is
/// only fatal here when `using_2pc` is true — two-phase commit still makes
/// rollback possible, so it's raised at the same severity as the pre-commit
/// case, and (mirroring `check_pre_commit`) such a shard is excluded from
/// catalog invalidation while every other shard in the call is still
/// invalidated. Without 2PC some remote commits may have already landed
/// non-atomically, so a per-shard failure is only a warning and is
/// invalidated like any other failed shard; the transaction as a whole is
/// still failed fatally below if literally nothing committed anywhere.
pub fn check_post_commit<P: ConnectionPool, C: PlacementCatalog>(
    manager: &mut ConnectionManager<P, C>,
    using_2pc: bool,
) -> anyhow::Result<()> {
    let tallies = tally(manager);

    let mut fatal_shard = None;
    let mut any_shard_attempted = false;
    let mut any_shard_succeeded = false;

    for t in &tallies {
        mark_failed(manager, &t.failed);

        let all_failed = !t.failed.is_empty() && t.modified_ok == 0;
        if t.modified_ok > 0 || !t.failed.is_empty() {
            any_shard_attempted = true;
        }
        if t.modified_ok > 0 {
            any_shard_succeeded = true;
        }

        if all_failed && using_2pc {
            tracing::error!(shard_id = t.shard_id, "could not make changes to shard on any node");
            fatal_shard.get_or_insert(t.shard_id);
            continue;
        }
        if all_failed {
            tracing::warn!(
                shard_id = t.shard_id,
                "could not make changes to shard on any node (not all outcomes atomic: 2PC \
                 was not used)"
            );
        }
        invalidate_failed(manager, t.shard_id, &t.failed)?;
    }

    if let Some(shard_id) = fatal_shard {
        return Err(error::all_replicas_failed(shard_id));
    }

    if any_shard_attempted && !any_shard_succeeded {
        tracing::error!("no shard committed on any node");
        return Err(error::nothing_committed());
    }

    Ok(())
}
