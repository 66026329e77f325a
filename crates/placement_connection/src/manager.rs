//! [`ConnectionManager`]: the single entry point this crate exposes.
//!
//! One instance is built once per coordinator backend process
//! (`ConnectionManager::new`) and is reused across every distributed
//! transaction that process executes; `reset_all` (called from
//! `on_xact_commit`/`on_xact_abort`) clears its per-transaction state between
//! them. There is no ambient global: callers hold the handle explicitly.

use std::collections::HashMap;

use slab::Slab;

use crate::{
    arena::{
        CeHandle,
        ColocationEntry,
        ConnectionRef,
        CrHandle,
        PeHandle,
        PlacementEntry,
        SeHandle,
        ShardEntry,
    },
    catalog::PlacementCatalog,
    knobs,
    policy::{
        self,
        Pass1Result,
    },
    pool::{
        ConnectionPool,
        PooledConnectionId,
    },
    reaper,
    types::{
        AcquireFlags,
        ColocationKey,
        PlacementAccess,
        PlacementId,
        ShardId,
        UserName,
    },
};

/// Per-transaction and process-wide state for connection assignment.
pub struct ConnectionManager<P, C> {
    pool: P,
    catalog: C,

    connections: Slab<ConnectionRef>,
    placements: Slab<PlacementEntry>,
    colocations: Slab<ColocationEntry>,
    shards: Slab<ShardEntry>,

    placement_index: HashMap<PlacementId, PeHandle>,
    colocation_index: HashMap<ColocationKey, CeHandle>,
    shard_index: HashMap<ShardId, SeHandle>,

    /// Mirrors each connection's list of referenced placements, indexed by
    /// the pool's connection id rather than stored on a per-connection
    /// object, since this crate has no connection object of its own — only
    /// the pool does.
    connection_backlinks: HashMap<PooledConnectionId, Vec<CrHandle>>,
}

impl<P: ConnectionPool, C: PlacementCatalog> ConnectionManager<P, C> {
    /// Builds empty indices once per process.
    pub fn new(pool: P, catalog: C) -> Self {
        Self {
            pool,
            catalog,
            connections: Slab::new(),
            placements: Slab::new(),
            colocations: Slab::new(),
            shards: Slab::new(),
            placement_index: HashMap::new(),
            colocation_index: HashMap::new(),
            shard_index: HashMap::new(),
            connection_backlinks: HashMap::new(),
        }
    }

    /// Picks (or opens) the single connection that should be used to execute
    /// `access_list` as a batch, threading through the bookkeeping that keeps
    /// a placement's writes pinned to one connection per transaction.
    pub fn acquire_connection(
        &mut self,
        flags: AcquireFlags,
        access_list: &[PlacementAccess],
        user: &UserName,
    ) -> anyhow::Result<PooledConnectionId> {
        anyhow::ensure!(
            !access_list.is_empty(),
            "acquire_connection called with an empty access_list"
        );
        let access_type = flags.default_access_type();

        // Pass 1: choose a connection.
        let mut chosen: Option<PooledConnectionId> = None;
        let mut locked_in = false;
        let mut touched = Vec::with_capacity(access_list.len());

        for access in access_list {
            if access.is_pruned() {
                touched.push(None);
                continue;
            }
            let pe = self.ensure_placement_entry(access);
            self.link_shard(access.shard_id, pe);

            let pe_ref = &self.placements[pe.0];
            let pc = &self.connections[pe_ref.primary.0];
            let ce_has_secondary_readers = pe_ref
                .colocation_link
                .map(|ce| self.colocations[ce.0].has_secondary_readers);
            let claimed_exclusively = pc
                .connection
                .map(|conn| self.pool.claimed_exclusively(conn))
                .unwrap_or(false);

            let outcome = policy::classify_access(
                access.placement_id,
                pc,
                ce_has_secondary_readers,
                pe_ref.has_secondary_readers,
                access_type,
                flags,
                user,
                claimed_exclusively,
                chosen,
                locked_in,
            )?;

            if let Pass1Result::Reuse {
                connection,
                locks_in,
            } = outcome
            {
                chosen = Some(connection);
                locked_in |= locks_in;
            }

            touched.push(Some(pe));
        }

        let chosen = match chosen {
            Some(conn) => conn,
            None => {
                let first = access_list
                    .iter()
                    .find(|access| !access.is_pruned())
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "acquire_connection: access_list contains only pruned accesses"
                        )
                    })?;
                let conn =
                    self.pool
                        .start_connection(&first.node, user, flags.force_new_connection)?;
                if *knobs::PCM_LOG_DECISIONS {
                    tracing::debug!(?conn, "opened new connection for placement access");
                }
                conn
            },
        };

        // Pass 2: record the assignment.
        for (access, pe) in access_list.iter().zip(touched.into_iter()) {
            let Some(pe) = pe else { continue };
            self.record_assignment(pe, chosen, user, access_type);
        }

        Ok(chosen)
    }

    /// Second pass over an already-classified placement: records the
    /// connection the first pass settled on. By the time this runs, the
    /// first pass has already guaranteed that whenever this lands in the
    /// "different connection" branch below, `pc` never carried a DML/DDL
    /// write (if it had, the first pass would have either reused it as
    /// `chosen` or raised a conflict) — so it is always safe to move the
    /// primary pointer to `chosen` there, including the SELECT-only case
    /// where a later reader simply replaces an earlier reader's connection.
    fn record_assignment(
        &mut self,
        pe: PeHandle,
        chosen: PooledConnectionId,
        user: &UserName,
        access_type: crate::types::AccessType,
    ) {
        let primary = self.placements[pe.0].primary;
        let cr = &mut self.connections[primary.0];

        if cr.connection == Some(chosen) {
            // Already correct; no change.
        } else if cr.connection.is_none() {
            cr.connection = Some(chosen);
            cr.user = user.clone();
            cr.had_dml = false;
            cr.had_ddl = false;
            self.connection_backlinks
                .entry(chosen)
                .or_default()
                .push(primary);
        } else {
            let old = cr.connection.replace(chosen);
            cr.user = user.clone();
            if let Some(old) = old {
                self.remove_backlink(old, primary);
            }
            self.connection_backlinks
                .entry(chosen)
                .or_default()
                .push(primary);
            self.mark_secondary_reader(pe);
        }

        let cr = &mut self.connections[primary.0];
        cr.had_dml |= access_type.is_dml();
        cr.had_ddl |= access_type.is_ddl();

        self.warn_if_fanning_out(pe);
    }

    fn mark_secondary_reader(&mut self, pe: PeHandle) {
        let entry = &mut self.placements[pe.0];
        entry.has_secondary_readers = true;
        entry.secondary_reader_count += 1;
        if let Some(ce) = entry.colocation_link {
            self.colocations[ce.0].has_secondary_readers = true;
        }
    }

    fn warn_if_fanning_out(&self, pe: PeHandle) {
        let entry = &self.placements[pe.0];
        if entry.secondary_reader_count >= *knobs::PCM_SECONDARY_READER_WARN_THRESHOLD {
            tracing::warn!(
                placement_id = entry.placement_id,
                secondary_connections = entry.secondary_reader_count,
                "transaction is reading placements over an unusually large number of connections"
            );
        }
    }

    fn remove_backlink(&mut self, conn: PooledConnectionId, cr: CrHandle) {
        if let Some(list) = self.connection_backlinks.get_mut(&conn) {
            list.retain(|handle| *handle != cr);
            if list.is_empty() {
                self.connection_backlinks.remove(&conn);
            }
        }
    }

    fn ensure_placement_entry(&mut self, access: &PlacementAccess) -> PeHandle {
        if let Some(&pe) = self.placement_index.get(&access.placement_id) {
            return pe;
        }
        let colocation_link = access
            .colocation
            .as_ref()
            .map(|key| self.ensure_colocation_entry(key));
        let primary = match colocation_link {
            Some(ce) => self.colocations[ce.0].primary,
            None => CrHandle(self.connections.insert(ConnectionRef::empty())),
        };
        let pe = PeHandle(self.placements.insert(PlacementEntry {
            placement_id: access.placement_id,
            primary,
            has_secondary_readers: false,
            secondary_reader_count: 0,
            failed: false,
            colocation_link,
            shard_id: access.shard_id,
        }));
        self.placement_index.insert(access.placement_id, pe);
        pe
    }

    fn ensure_colocation_entry(&mut self, key: &ColocationKey) -> CeHandle {
        if let Some(&ce) = self.colocation_index.get(key) {
            return ce;
        }
        let primary = CrHandle(self.connections.insert(ConnectionRef::empty()));
        let ce = CeHandle(self.colocations.insert(ColocationEntry {
            key: key.clone(),
            primary,
            has_secondary_readers: false,
        }));
        self.colocation_index.insert(key.clone(), ce);
        ce
    }

    fn link_shard(&mut self, shard_id: ShardId, pe: PeHandle) {
        let se = *self
            .shard_index
            .entry(shard_id)
            .or_insert_with(|| SeHandle(self.shards.insert(ShardEntry::new(shard_id))));
        self.shards[se.0].add_placement(pe);
    }

    /// Walks every shard touched this transaction just before asking workers
    /// to commit, marking and invalidating placements whose modifying
    /// connections all failed.
    pub fn mark_failed_placements_pre_commit(&mut self) -> anyhow::Result<()> {
        reaper::check_pre_commit(self)
    }

    /// Same per-shard failure accounting as the pre-commit pass, run after
    /// the remote commit attempt; `using_2pc` controls whether a shard where
    /// every modifying connection failed is fatal or merely a warning.
    pub fn mark_failed_placements_post_commit(&mut self, using_2pc: bool) -> anyhow::Result<()> {
        reaper::check_post_commit(self, using_2pc)
    }

    /// Clears all per-transaction state after a commit.
    pub fn on_xact_commit(&mut self) {
        self.reset_all();
    }

    /// Clears all per-transaction state after an abort.
    pub fn on_xact_abort(&mut self) {
        self.reset_all();
    }

    /// Full clear of all three indices and their arenas.
    pub fn reset_all(&mut self) {
        self.connections.clear();
        self.placements.clear();
        self.colocations.clear();
        self.shards.clear();
        self.placement_index.clear();
        self.colocation_index.clear();
        self.shard_index.clear();
        self.connection_backlinks.clear();
    }

    /// Called when the connection pool closes a connection mid-transaction
    /// (idle timeout, pool shrink): nulls every CR that still points at
    /// `conn`. `PE.primary` itself is deliberately left pinned — see
    /// DESIGN.md for why resetting it would be the wrong tradeoff.
    pub fn on_connection_closed(&mut self, conn: PooledConnectionId) {
        if let Some(backlinks) = self.connection_backlinks.remove(&conn) {
            for cr in backlinks {
                if let Some(cref) = self.connections.get_mut(cr.0) {
                    cref.connection = None;
                }
            }
        }
    }

    pub(crate) fn pool(&self) -> &P {
        &self.pool
    }

    pub(crate) fn pool_mut(&mut self) -> &mut P {
        &mut self.pool
    }

    pub(crate) fn catalog_mut(&mut self) -> &mut C {
        &mut self.catalog
    }

    pub(crate) fn connections(&self) -> &Slab<ConnectionRef> {
        &self.connections
    }

    pub(crate) fn placements(&self) -> &Slab<PlacementEntry> {
        &self.placements
    }

    pub(crate) fn placements_mut(&mut self) -> &mut Slab<PlacementEntry> {
        &mut self.placements
    }

    pub(crate) fn shards(&self) -> &Slab<ShardEntry> {
        &self.shards
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn placement_index_len(&self) -> usize {
        self.placement_index.len()
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn colocation_index_len(&self) -> usize {
        self.colocation_index.len()
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn shard_index_len(&self) -> usize {
        self.shard_index.len()
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn connection_ref_for_placement(&self, placement_id: PlacementId) -> Option<&ConnectionRef> {
        let pe = self.placement_index.get(&placement_id)?;
        let pe = &self.placements[pe.0];
        Some(&self.connections[pe.primary.0])
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn has_secondary_readers(&self, placement_id: PlacementId) -> Option<bool> {
        let pe = self.placement_index.get(&placement_id)?;
        Some(self.placements[pe.0].has_secondary_readers)
    }
}
