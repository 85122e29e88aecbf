//! The asynchronous storage contract consumed by the DHT engine.
//!
//! Implementations may live in memory or behind a relational database; the
//! engine only depends on three properties: compare-and-swap by sequence
//! number, the immutable/mutable distinction, and ownership expressed by the
//! presence of a private key on the stored record.

use async_trait::async_trait;

use lib_core::{DhtError, Id, PeerInfo, Value};

/// Result alias for storage operations; failures map onto wire error codes.
pub type StorageResult<T> = Result<T, DhtError>;

/// Async storage backend for values and peer announcements.
///
/// Every operation runs off the DHT event loop; the engine awaits the
/// future and answers the originating RPC only after it settles.
#[async_trait]
pub trait DataStorage: Send + Sync {
    /// Look up a value by id.
    async fn get_value(&self, id: &Id) -> StorageResult<Option<Value>>;

    /// Store `value`, enforcing consistency against any existing record.
    ///
    /// `expected_seq` is the caller's compare-and-swap expectation; a
    /// negative value disables the check. Errors use the specific
    /// consistency codes so the RPC layer can answer precisely:
    ///
    /// - [`DhtError::ImmutableSubstitutionFail`] when the stored value is
    ///   immutable and the update is not byte-identical,
    /// - [`DhtError::SequenceNotExpected`] when `expected_seq ≥ 0` and the
    ///   stored sequence differs,
    /// - [`DhtError::SequenceNotMonotonic`] when the update's sequence is
    ///   below the stored one,
    /// - [`DhtError::InvalidValue`] when an unowned update would overwrite
    ///   a locally-owned record.
    async fn put_value(&self, value: Value, expected_seq: i32) -> StorageResult<()>;

    /// Exact lookup of one announcement: the peer `id` as seen through
    /// `node_id`.
    async fn get_peer(&self, id: &Id, node_id: &Id) -> StorageResult<Option<PeerInfo>>;

    /// Store a peer announcement under `(peer_id, node_id)` with the same
    /// monotonicity and ownership rules as values.
    async fn put_peer(&self, peer: PeerInfo) -> StorageResult<()>;

    /// All announcements for peer `id` with `seq ≥ expected_seq`
    /// (`expected_seq < 0` disables the filter), up to `max` entries.
    async fn get_peers(
        &self,
        id: &Id,
        expected_seq: i32,
        max: usize,
    ) -> StorageResult<Vec<PeerInfo>>;

    /// Drop records older than `max_age_ms`; returns how many were removed.
    async fn purge_expired(&self, max_age_ms: u64) -> StorageResult<usize>;
}

/// Counters reported by a storage backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub values: usize,
    pub peers: usize,
}
