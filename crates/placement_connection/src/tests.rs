use errors::ErrorMetadataAnyhowExt;

use crate::{
    catalog::PlacementState,
    testing::{
        FakeCatalog,
        FakePool,
    },
    AccessType,
    AcquireFlags,
    ColocationKey,
    ConnectionManager,
    NodeAddr,
    PlacementAccess,
};

fn node(name: &str) -> NodeAddr {
    NodeAddr {
        host: name.to_string(),
        port: 5432,
    }
}

fn access(placement_id: u64, shard_id: u64, node: NodeAddr) -> PlacementAccess {
    PlacementAccess {
        placement_id,
        shard_id,
        node,
        colocation: None,
    }
}

fn colocated_access(placement_id: u64, shard_id: u64, node: NodeAddr, key: ColocationKey) -> PlacementAccess {
    PlacementAccess {
        placement_id,
        shard_id,
        node,
        colocation: Some(key),
    }
}

fn select() -> AcquireFlags {
    AcquireFlags::new()
}

fn dml() -> AcquireFlags {
    AcquireFlags {
        for_dml: true,
        ..AcquireFlags::new()
    }
}

fn ddl() -> AcquireFlags {
    AcquireFlags {
        for_ddl: true,
        ..AcquireFlags::new()
    }
}

fn force_new(mut flags: AcquireFlags) -> AcquireFlags {
    flags.force_new_connection = true;
    flags
}

fn manager() -> ConnectionManager<FakePool, FakeCatalog> {
    ConnectionManager::new(FakePool::new(), FakeCatalog::new())
}

#[test]
fn reuse_same_access_returns_same_connection() {
    let mut mgr = manager();
    let alice = "alice".to_string();

    let c1 = mgr
        .acquire_connection(select(), &[access(42, 1, node("w1"))], &alice)
        .unwrap();
    let c2 = mgr
        .acquire_connection(select(), &[access(42, 1, node("w1"))], &alice)
        .unwrap();

    assert_eq!(c1, c2);
    assert_eq!(mgr.pool().opened.len(), 1);
    assert_eq!(mgr.has_secondary_readers(42), Some(false));
}

#[test]
fn different_user_forces_new_connection_and_replaces_primary() {
    let mut mgr = manager();
    let alice = "alice".to_string();
    let bob = "bob".to_string();

    let c1 = mgr
        .acquire_connection(select(), &[access(42, 1, node("w1"))], &alice)
        .unwrap();
    let c2 = mgr
        .acquire_connection(select(), &[access(42, 1, node("w1"))], &bob)
        .unwrap();

    assert_ne!(c1, c2);
    let cr = mgr.connection_ref_for_placement(42).unwrap();
    assert_eq!(cr.connection, Some(c2));
    assert!(!cr.had_dml);
    assert!(!cr.had_ddl);
    assert_eq!(mgr.has_secondary_readers(42), Some(true));
}

#[test]
fn ddl_after_multi_read_rejects() {
    let mut mgr = manager();
    let alice = "alice".to_string();

    mgr.acquire_connection(select(), &[access(42, 1, node("w1"))], &alice)
        .unwrap();
    mgr.acquire_connection(force_new(select()), &[access(42, 1, node("w1"))], &alice)
        .unwrap();
    assert_eq!(mgr.has_secondary_readers(42), Some(true));

    let err = mgr
        .acquire_connection(ddl(), &[access(42, 1, node("w1"))], &alice)
        .unwrap_err();
    assert_eq!(err.short_msg(), "DDLOnMultiplyReadPlacement");
}

#[test]
fn write_then_different_writer_rejects() {
    let mut mgr = manager();
    let alice = "alice".to_string();

    mgr.acquire_connection(dml(), &[access(7, 1, node("w1"))], &alice)
        .unwrap();
    mgr.acquire_connection(dml(), &[access(9, 2, node("w2"))], &alice)
        .unwrap();

    let err = mgr
        .acquire_connection(
            dml(),
            &[access(7, 1, node("w1")), access(9, 2, node("w2"))],
            &alice,
        )
        .unwrap_err();
    assert_eq!(err.short_msg(), "PlacementModifiedOverMultipleConnections");
}

#[test]
fn colocated_dml_exclusivity() {
    let mut mgr = manager();
    let alice = "alice".to_string();
    let key = ColocationKey {
        node_name: "w1".to_string(),
        node_port: 5432,
        colocation_group_id: 1,
        representative_value: 0,
    };

    mgr.acquire_connection(
        dml(),
        &[colocated_access(100, 1, node("w1"), key.clone())],
        &alice,
    )
    .unwrap();

    // Reuses fine: same connection, same user.
    mgr.acquire_connection(
        dml(),
        &[colocated_access(101, 1, node("w1"), key.clone())],
        &alice,
    )
    .unwrap();

    // A new connection while the shared CR is still DML-held is rejected.
    let err = mgr
        .acquire_connection(
            force_new(dml()),
            &[colocated_access(101, 1, node("w1"), key)],
            &alice,
        )
        .unwrap_err();
    assert_eq!(err.short_msg(), "NewConnectionDisallowedDmlInProgress");
}

#[test]
fn pre_commit_raises_fatal_when_every_modifying_connection_on_a_shard_failed() {
    let mut mgr = manager();
    let alice = "alice".to_string();

    let c1 = mgr
        .acquire_connection(dml(), &[access(1, 1, node("w1"))], &alice)
        .unwrap();
    let c2 = mgr
        .acquire_connection(force_new(dml()), &[access(2, 1, node("w2"))], &alice)
        .unwrap();
    mgr.pool_mut().set_remote_tx_failed(c1, true);
    mgr.pool_mut().set_remote_tx_failed(c2, true);

    let err = mgr.mark_failed_placements_pre_commit().unwrap_err();
    assert_eq!(err.short_msg(), "ShardUnreachable");
}

#[test]
fn pre_commit_invalidates_only_finalized_failed_placements() {
    let mut mgr = manager();
    let alice = "alice".to_string();

    let ok_conn = mgr
        .acquire_connection(dml(), &[access(10, 2, node("w1"))], &alice)
        .unwrap();
    let failed_conn = mgr
        .acquire_connection(force_new(dml()), &[access(11, 2, node("w2"))], &alice)
        .unwrap();
    mgr.pool_mut().set_remote_tx_failed(failed_conn, true);
    assert!(!mgr.pool().remote_tx_failed(ok_conn));

    mgr.catalog_mut().set_state(11, PlacementState::Finalized);

    mgr.mark_failed_placements_pre_commit().unwrap();
    assert_eq!(mgr.catalog_mut().state_of(11), PlacementState::Inactive);
}

#[test]
fn pre_commit_invalidates_partially_failed_shard_even_when_another_shard_is_fatal() {
    let mut mgr = manager();
    let alice = "alice".to_string();

    // Shard 200: both modifying connections fail -> this shard is fatal.
    let s1c1 = mgr
        .acquire_connection(dml(), &[access(201, 200, node("w1"))], &alice)
        .unwrap();
    let s1c2 = mgr
        .acquire_connection(force_new(dml()), &[access(202, 200, node("w2"))], &alice)
        .unwrap();
    mgr.pool_mut().set_remote_tx_failed(s1c1, true);
    mgr.pool_mut().set_remote_tx_failed(s1c2, true);

    // Shard 300: one connection ok, one failed -> not fatal, should still be
    // walked and invalidated even though the overall call errors because of
    // shard 200.
    let s2_ok = mgr
        .acquire_connection(dml(), &[access(301, 300, node("w3"))], &alice)
        .unwrap();
    let s2_failed = mgr
        .acquire_connection(force_new(dml()), &[access(302, 300, node("w4"))], &alice)
        .unwrap();
    mgr.pool_mut().set_remote_tx_failed(s2_failed, true);
    assert!(!mgr.pool().remote_tx_failed(s2_ok));
    mgr.catalog_mut().set_state(302, PlacementState::Finalized);

    let err = mgr.mark_failed_placements_pre_commit().unwrap_err();
    assert_eq!(err.short_msg(), "ShardUnreachable");

    assert_eq!(mgr.catalog_mut().state_of(302), PlacementState::Inactive);
}

#[test]
fn post_commit_without_2pc_warns_per_shard_but_still_fails_when_nothing_committed() {
    let mut mgr = manager();
    let alice = "alice".to_string();

    let c1 = mgr
        .acquire_connection(dml(), &[access(20, 3, node("w1"))], &alice)
        .unwrap();
    mgr.pool_mut().set_remote_tx_failed(c1, true);

    let err = mgr.mark_failed_placements_post_commit(false).unwrap_err();
    assert_eq!(err.short_msg(), "NoShardsCommitted");
}

#[test]
fn post_commit_with_2pc_raises_fatal_per_shard_even_when_other_shards_succeeded() {
    let mut mgr = manager();
    let alice = "alice".to_string();

    let ok_conn = mgr
        .acquire_connection(dml(), &[access(30, 4, node("w1"))], &alice)
        .unwrap();
    let failed_conn = mgr
        .acquire_connection(force_new(dml()), &[access(31, 5, node("w2"))], &alice)
        .unwrap();
    assert!(!mgr.pool().remote_tx_failed(ok_conn));
    mgr.pool_mut().set_remote_tx_failed(failed_conn, true);

    let err = mgr.mark_failed_placements_post_commit(true).unwrap_err();
    assert_eq!(err.short_msg(), "ShardUnreachable");
}

#[test]
fn reset_all_clears_every_index() {
    let mut mgr = manager();
    let alice = "alice".to_string();

    mgr.acquire_connection(select(), &[access(1, 1, node("w1"))], &alice)
        .unwrap();
    assert_eq!(mgr.placement_index_len(), 1);
    assert_eq!(mgr.shard_index_len(), 1);

    mgr.on_xact_commit();

    assert_eq!(mgr.placement_index_len(), 0);
    assert_eq!(mgr.colocation_index_len(), 0);
    assert_eq!(mgr.shard_index_len(), 0);
}

#[test]
fn on_connection_closed_nulls_backlinks_but_keeps_primary_pinned() {
    let mut mgr = manager();
    let alice = "alice".to_string();

    let c1 = mgr
        .acquire_connection(select(), &[access(1, 1, node("w1"))], &alice)
        .unwrap();
    mgr.on_connection_closed(c1);

    let cr = mgr.connection_ref_for_placement(1).unwrap();
    assert_eq!(cr.connection, None);
    // The placement index still resolves (the CR is pinned, not dropped).
    assert_eq!(mgr.placement_index_len(), 1);
}

#[test]
fn access_type_is_select_unless_flags_say_otherwise() {
    assert_eq!(select().default_access_type(), AccessType::Select);
    assert_eq!(dml().default_access_type(), AccessType::Dml);
    assert_eq!(ddl().default_access_type(), AccessType::Ddl);
}

/// Property tests for invariants that hold across arbitrary sequences of
/// accesses, not just the handful of scenarios above. Mirrors the
/// `proptest!` style `errors` uses for its own invariants.
mod proptest_invariants {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone, proptest_derive::Arbitrary)]
    struct Op {
        #[proptest(strategy = "1u64..=4")]
        placement_id: u64,
        user_is_bob: bool,
        #[proptest(strategy = "0u8..3")]
        access_kind: u8,
        force_new: bool,
        node_is_w2: bool,
    }

    fn run(mgr: &mut ConnectionManager<crate::testing::FakePool, crate::testing::FakeCatalog>, op: &Op) {
        let user = if op.user_is_bob { "bob" } else { "alice" }.to_string();
        let node = NodeAddr {
            host: if op.node_is_w2 { "w2" } else { "w1" }.to_string(),
            port: 5432,
        };
        let mut flags = AcquireFlags::new();
        match op.access_kind {
            1 => flags.for_dml = true,
            2 => flags.for_ddl = true,
            _ => {},
        }
        flags.force_new_connection = op.force_new;

        // One shard per placement keeps this focused on the acquire-time
        // invariants; failure-rollup's shard grouping is covered separately.
        let access = access(op.placement_id, op.placement_id, node);
        let _ = mgr.acquire_connection(flags, &[access], &user);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() })]

        /// `has_secondary_readers` never resets to false within a
        /// transaction once set.
        #[test]
        fn secondary_readers_flag_is_monotonic(ops in proptest::collection::vec(any::<Op>(), 1..12)) {
            let mut mgr = manager();
            let mut seen = HashMap::new();

            for op in &ops {
                run(&mut mgr, op);
                let now = mgr.has_secondary_readers(op.placement_id).unwrap_or(false);
                let before = *seen.get(&op.placement_id).unwrap_or(&false);
                prop_assert!(
                    before == now || (!before && now),
                    "has_secondary_readers flipped back to false for placement {}",
                    op.placement_id
                );
                seen.insert(op.placement_id, now);
            }
        }

        /// After `reset_all()`, all three indices are empty, regardless of
        /// what happened beforehand.
        #[test]
        fn reset_all_always_empties_every_index(ops in proptest::collection::vec(any::<Op>(), 0..12)) {
            let mut mgr = manager();
            for op in &ops {
                run(&mut mgr, op);
            }
            mgr.reset_all();
            prop_assert_eq!(mgr.placement_index_len(), 0);
            prop_assert_eq!(mgr.colocation_index_len(), 0);
            prop_assert_eq!(mgr.shard_index_len(), 0);
        }

        /// Round-trip: repeating the exact same access immediately returns
        /// the same connection (rule 1 then rule 5), for any single access.
        #[test]
        fn repeating_the_same_access_reuses_the_connection(op in any::<Op>()) {
            let mut mgr = manager();
            let first = run_and_get(&mut mgr, &op);
            let second = run_and_get(&mut mgr, &op);
            prop_assert_eq!(first, second);
        }
    }

    fn run_and_get(
        mgr: &mut ConnectionManager<crate::testing::FakePool, crate::testing::FakeCatalog>,
        op: &Op,
    ) -> crate::PooledConnectionId {
        let user = if op.user_is_bob { "bob" } else { "alice" }.to_string();
        let node = NodeAddr {
            host: if op.node_is_w2 { "w2" } else { "w1" }.to_string(),
            port: 5432,
        };
        let mut flags = AcquireFlags::new();
        match op.access_kind {
            1 => flags.for_dml = true,
            2 => flags.for_ddl = true,
            _ => {},
        }
        // force_new is excluded here: repeating a forced-new access is not
        // expected to reuse the same connection (it asks for a fresh one by
        // design), so the round-trip claim only applies without it.
        let access = access(op.placement_id, op.placement_id, node);
        mgr.acquire_connection(flags, &[access], &user).unwrap()
    }
}
