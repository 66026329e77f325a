//! The catalog boundary. The PCM never stores placement state itself; it
//! reads and writes through this trait so the crate has no schema and no
//! persistence of its own.

use crate::types::{
    PlacementId,
    ShardId,
};

/// Persisted lifecycle state of a placement row. Only `Finalized` and
/// `Inactive` are acted on by [`crate::reaper`]; other states belong to other
/// actors (e.g. an in-progress shard move) and are left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementState {
    Finalized,
    Inactive,
    /// Any other catalog state this crate does not need to distinguish
    /// (e.g. `BeingCopied`, `ToBeDropped` in the upstream schema).
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct PlacementCatalogRow {
    pub state: PlacementState,
}

/// Consumed collaborator: the metadata catalog that stores shard/placement
/// rows.
pub trait PlacementCatalog {
    fn load_group_placement(
        &mut self,
        shard_id: ShardId,
        placement_id: PlacementId,
    ) -> anyhow::Result<PlacementCatalogRow>;

    fn update_placement_state(
        &mut self,
        placement_id: PlacementId,
        new_state: PlacementState,
    ) -> anyhow::Result<()>;
}
