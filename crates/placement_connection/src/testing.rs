//! In-memory test doubles for [`ConnectionPool`] and [`PlacementCatalog`],
//! shared by this crate's own tests and by any downstream crate that enables
//! the `testing` feature to exercise a [`crate::ConnectionManager`] without a
//! real pool or catalog.

use std::collections::HashMap;

use crate::{
    catalog::{
        PlacementCatalog,
        PlacementCatalogRow,
        PlacementState,
    },
    pool::{
        ConnectionPool,
        PooledConnectionId,
    },
    types::{
        NodeAddr,
        PlacementId,
        ShardId,
        UserName,
    },
};

/// A fake pool that hands out an incrementing [`PooledConnectionId`] per call
/// to `start_connection` (even for the same node/user), so tests control
/// reuse purely through `FakePool::set_remote_tx_failed` /
/// `claimed_exclusively` rather than accidental pool-level caching.
#[derive(Debug, Default)]
pub struct FakePool {
    next_id: u64,
    exclusively_claimed: HashMap<PooledConnectionId, bool>,
    remote_tx_failed: HashMap<PooledConnectionId, bool>,
    pub opened: Vec<(NodeAddr, UserName, bool)>,
}

impl FakePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_claimed_exclusively(&mut self, conn: PooledConnectionId, claimed: bool) {
        self.exclusively_claimed.insert(conn, claimed);
    }

    pub fn set_remote_tx_failed(&mut self, conn: PooledConnectionId, failed: bool) {
        self.remote_tx_failed.insert(conn, failed);
    }
}

impl ConnectionPool for FakePool {
    fn start_connection(
        &mut self,
        node: &NodeAddr,
        user: &UserName,
        force_new: bool,
    ) -> anyhow::Result<PooledConnectionId> {
        let id = PooledConnectionId(self.next_id);
        self.next_id += 1;
        self.opened.push((node.clone(), user.clone(), force_new));
        Ok(id)
    }

    fn claimed_exclusively(&self, conn: PooledConnectionId) -> bool {
        *self.exclusively_claimed.get(&conn).unwrap_or(&false)
    }

    fn remote_tx_failed(&self, conn: PooledConnectionId) -> bool {
        *self.remote_tx_failed.get(&conn).unwrap_or(&false)
    }
}

/// A fake catalog backed by a plain map, defaulting unknown placements to
/// [`PlacementState::Finalized`] (the common case in tests: a placement that
/// exists and hasn't already been invalidated by something else).
#[derive(Debug, Default)]
pub struct FakeCatalog {
    states: HashMap<PlacementId, PlacementState>,
    pub transitions: Vec<(PlacementId, PlacementState)>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&mut self, placement_id: PlacementId, state: PlacementState) {
        self.states.insert(placement_id, state);
    }

    pub fn state_of(&self, placement_id: PlacementId) -> PlacementState {
        *self
            .states
            .get(&placement_id)
            .unwrap_or(&PlacementState::Finalized)
    }
}

impl PlacementCatalog for FakeCatalog {
    fn load_group_placement(
        &mut self,
        _shard_id: ShardId,
        placement_id: PlacementId,
    ) -> anyhow::Result<PlacementCatalogRow> {
        Ok(PlacementCatalogRow {
            state: self.state_of(placement_id),
        })
    }

    fn update_placement_state(
        &mut self,
        placement_id: PlacementId,
        new_state: PlacementState,
    ) -> anyhow::Result<()> {
        self.states.insert(placement_id, new_state);
        self.transitions.push((placement_id, new_state));
        Ok(())
    }
}
