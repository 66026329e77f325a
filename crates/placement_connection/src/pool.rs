//! The connection-pool boundary. The pool itself — opening sockets,
//! health-checking, closing idle connections — is out of scope for this
//! crate; we only consume it.

use crate::types::{
    NodeAddr,
    UserName,
};

/// Opaque handle to a connection the external pool manages. The manager never
/// looks inside; it only compares handles for equality and passes them back
/// to the pool or the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PooledConnectionId(pub u64);

/// Consumed collaborator: opens and describes connections to worker nodes.
///
/// Implementations are expected to be cheap to clone/share (e.g. an `Arc`
/// around a real pool) since the manager calls into this on every cache miss.
pub trait ConnectionPool {
    /// Open (or hand back from an internal pool) a connection to `node` under
    /// `user`. `force_new` mirrors `FORCE_NEW_CONNECTION`.
    fn start_connection(
        &mut self,
        node: &NodeAddr,
        user: &UserName,
        force_new: bool,
    ) -> anyhow::Result<PooledConnectionId>;

    /// True if the pool has claimed this connection exclusively for some
    /// other purpose (e.g. it is mid-handshake), making it ineligible for
    /// reuse regardless of what the manager's own bookkeeping says.
    fn claimed_exclusively(&self, conn: PooledConnectionId) -> bool;

    /// True once the connection's remote transaction is known to have
    /// failed (consumed by [`crate::reaper`] at commit time).
    fn remote_tx_failed(&self, conn: PooledConnectionId) -> bool;
}
