//! Heap-backed storage used by default (`in-memory://`).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use lib_core::{DhtError, Id, PeerInfo, Value};

use crate::storage::{DataStorage, StorageResult, StorageStats};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct StoredValue {
    value: Value,
    stored_at: u64,
}

struct StoredPeer {
    peer: PeerInfo,
    stored_at: u64,
}

#[derive(Default)]
struct Tables {
    values: HashMap<Id, StoredValue>,
    // peer_id -> node_id -> announcement
    peers: HashMap<Id, HashMap<Id, StoredPeer>>,
}

/// In-memory [`DataStorage`] implementation.
///
/// A single `RwLock` over both tables keeps every mutation atomic with its
/// consistency check, which is all the CAS contract requires.
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage {
            tables: RwLock::new(Tables::default()),
        }
    }

    pub async fn stats(&self) -> StorageStats {
        let tables = self.tables.read().await;
        StorageStats {
            values: tables.values.len(),
            peers: tables.peers.values().map(HashMap::len).sum(),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Consistency rules shared by value and peer updates.
///
/// Returns an error when the stored record must not be replaced.
fn check_mutable_update(
    stored_seq: i32,
    stored_owned: bool,
    new_seq: i32,
    new_owned: bool,
    expected_seq: i32,
) -> StorageResult<()> {
    if stored_owned && !new_owned {
        return Err(DhtError::InvalidValue(
            "record is owned by this node".into(),
        ));
    }
    if expected_seq >= 0 && stored_seq != expected_seq {
        return Err(DhtError::SequenceNotExpected);
    }
    if new_seq < stored_seq {
        return Err(DhtError::SequenceNotMonotonic);
    }
    Ok(())
}

#[async_trait]
impl DataStorage for MemoryStorage {
    async fn get_value(&self, id: &Id) -> StorageResult<Option<Value>> {
        let tables = self.tables.read().await;
        Ok(tables.values.get(id).map(|s| s.value.clone()))
    }

    async fn put_value(&self, value: Value, expected_seq: i32) -> StorageResult<()> {
        let id = value.id();
        let mut tables = self.tables.write().await;

        if let Some(stored) = tables.values.get(&id) {
            if !stored.value.is_mutable() {
                // Same id means same hash for immutable values, but a
                // mutable value can collide with the slot on purpose.
                if value.is_mutable() || value.data() != stored.value.data() {
                    return Err(DhtError::ImmutableSubstitutionFail);
                }
                // Idempotent re-store refreshes the timestamp below.
            } else {
                if !value.is_mutable() {
                    return Err(DhtError::ImmutableSubstitutionFail);
                }
                check_mutable_update(
                    stored.value.seq(),
                    stored.value.has_private_key(),
                    value.seq(),
                    value.has_private_key(),
                    expected_seq,
                )?;
            }
        }

        debug!(id = %id, seq = value.seq(), "storing value");
        tables.values.insert(
            id,
            StoredValue {
                value,
                stored_at: now_ms(),
            },
        );
        Ok(())
    }

    async fn get_peer(&self, id: &Id, node_id: &Id) -> StorageResult<Option<PeerInfo>> {
        let tables = self.tables.read().await;
        Ok(tables
            .peers
            .get(id)
            .and_then(|m| m.get(node_id))
            .map(|s| s.peer.clone()))
    }

    async fn put_peer(&self, peer: PeerInfo) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let slot = tables.peers.entry(*peer.peer_id()).or_default();

        if let Some(stored) = slot.get(peer.node_id()) {
            check_mutable_update(
                stored.peer.seq(),
                stored.peer.has_private_key(),
                peer.seq(),
                peer.has_private_key(),
                -1,
            )
            .map_err(|e| match e {
                DhtError::InvalidValue(m) => DhtError::InvalidPeer(m),
                other => other,
            })?;
        }

        debug!(peer = %peer.peer_id(), node = %peer.node_id(), seq = peer.seq(), "storing peer");
        slot.insert(
            *peer.node_id(),
            StoredPeer {
                peer,
                stored_at: now_ms(),
            },
        );
        Ok(())
    }

    async fn get_peers(
        &self,
        id: &Id,
        expected_seq: i32,
        max: usize,
    ) -> StorageResult<Vec<PeerInfo>> {
        let tables = self.tables.read().await;
        let Some(slot) = tables.peers.get(id) else {
            return Ok(Vec::new());
        };
        Ok(slot
            .values()
            .filter(|s| expected_seq < 0 || s.peer.seq() >= expected_seq)
            .take(max)
            .map(|s| s.peer.clone())
            .collect())
    }

    async fn purge_expired(&self, max_age_ms: u64) -> StorageResult<usize> {
        let cutoff = now_ms().saturating_sub(max_age_ms);
        let mut tables = self.tables.write().await;
        let before =
            tables.values.len() + tables.peers.values().map(HashMap::len).sum::<usize>();

        tables.values.retain(|_, s| s.stored_at >= cutoff);
        for slot in tables.peers.values_mut() {
            slot.retain(|_, s| s.stored_at >= cutoff);
        }
        tables.peers.retain(|_, slot| !slot.is_empty());

        let after =
            tables.values.len() + tables.peers.values().map(HashMap::len).sum::<usize>();
        Ok(before - after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_core::KeyPair;

    fn immutable(data: &[u8]) -> Value {
        Value::create_immutable(data.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_immutable_round_trip() {
        let storage = MemoryStorage::new();
        let v = immutable(b"hello");
        storage.put_value(v.clone(), -1).await.unwrap();
        let got = storage.get_value(&v.id()).await.unwrap().unwrap();
        assert_eq!(got, v);
    }

    #[tokio::test]
    async fn test_missing_value_is_none() {
        let storage = MemoryStorage::new();
        assert!(storage.get_value(&Id::random()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_immutable_substitution_fails() {
        let storage = MemoryStorage::new();
        let v = immutable(b"fixed");
        storage.put_value(v.clone(), -1).await.unwrap();

        // Re-storing the identical value is idempotent.
        storage.put_value(v.clone(), -1).await.unwrap();

        // A mutable value whose public key collides with the slot must be
        // rejected without touching the stored record.
        let forged = Value::of(Some(v.id()), None, Some([0u8; 24]), 0, Some(vec![0u8; 64]), b"x".to_vec());
        assert_eq!(forged.id(), v.id());
        assert_eq!(
            storage.put_value(forged, -1).await.unwrap_err(),
            DhtError::ImmutableSubstitutionFail
        );
        assert_eq!(storage.get_value(&v.id()).await.unwrap().unwrap(), v);
    }

    #[tokio::test]
    async fn test_sequence_monotonicity() {
        let storage = MemoryStorage::new();
        let kp = KeyPair::generate();
        let v5 = Value::create_signed(&kp, 5, b"v5".to_vec()).unwrap();
        storage.put_value(v5.clone(), -1).await.unwrap();

        let v4 = Value::create_signed(&kp, 4, b"v4".to_vec()).unwrap();
        assert_eq!(
            storage.put_value(v4, -1).await.unwrap_err(),
            DhtError::SequenceNotMonotonic
        );

        // Storage still has seq 5.
        let got = storage.get_value(&v5.id()).await.unwrap().unwrap();
        assert_eq!(got.seq(), 5);

        let v6 = Value::create_signed(&kp, 6, b"v6".to_vec()).unwrap();
        storage.put_value(v6, -1).await.unwrap();
    }

    #[tokio::test]
    async fn test_cas_expectation() {
        let storage = MemoryStorage::new();
        let kp = KeyPair::generate();
        let v1 = Value::create_signed(&kp, 1, b"v1".to_vec()).unwrap();
        storage.put_value(v1, -1).await.unwrap();

        let v2 = Value::create_signed(&kp, 2, b"v2".to_vec()).unwrap();
        assert_eq!(
            storage.put_value(v2.clone(), 0).await.unwrap_err(),
            DhtError::SequenceNotExpected
        );
        storage.put_value(v2, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_owned_value_not_overwritten_by_unowned() {
        let storage = MemoryStorage::new();
        let kp = KeyPair::generate();
        let owned = Value::create_signed(&kp, 3, b"mine".to_vec()).unwrap();
        assert!(owned.has_private_key());
        storage.put_value(owned.clone(), -1).await.unwrap();

        let unowned = Value::of(
            owned.public_key().copied(),
            None,
            owned.nonce().copied(),
            4,
            owned.signature().map(<[u8]>::to_vec),
            b"theirs".to_vec(),
        );
        let err = storage.put_value(unowned, -1).await.unwrap_err();
        assert!(matches!(err, DhtError::InvalidValue(_)));
    }

    #[tokio::test]
    async fn test_peer_round_trip_and_filter() {
        let storage = MemoryStorage::new();
        let kp = KeyPair::generate();
        let node_a = Id::random();
        let node_b = Id::random();
        let p_a = PeerInfo::create(&kp, &node_a, None, 8090, None, 1).unwrap();
        let p_b = PeerInfo::create(&kp, &node_b, None, 8090, None, 5).unwrap();
        storage.put_peer(p_a.clone()).await.unwrap();
        storage.put_peer(p_b.clone()).await.unwrap();

        let got = storage
            .get_peer(p_a.peer_id(), &node_a)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, p_a);

        let all = storage.get_peers(p_a.peer_id(), -1, 16).await.unwrap();
        assert_eq!(all.len(), 2);

        let newer = storage.get_peers(p_a.peer_id(), 3, 16).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].seq(), 5);

        let capped = storage.get_peers(p_a.peer_id(), -1, 1).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn test_peer_monotonicity() {
        let storage = MemoryStorage::new();
        let kp = KeyPair::generate();
        let node = Id::random();
        let newer = PeerInfo::create(&kp, &node, None, 8090, None, 7).unwrap();
        storage.put_peer(newer).await.unwrap();

        let older = PeerInfo::create(&kp, &node, None, 8090, None, 6).unwrap();
        assert_eq!(
            storage.put_peer(older).await.unwrap_err(),
            DhtError::SequenceNotMonotonic
        );
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let storage = MemoryStorage::new();
        storage.put_value(immutable(b"a"), -1).await.unwrap();
        storage.put_value(immutable(b"b"), -1).await.unwrap();

        // Nothing is older than an hour.
        assert_eq!(storage.purge_expired(3_600_000).await.unwrap(), 0);
        // Everything is older than zero milliseconds from now... except
        // entries stored in this same millisecond, so allow either.
        let removed = storage.purge_expired(0).await.unwrap();
        let stats = storage.stats().await;
        assert_eq!(removed + stats.values, 2);
    }
}
