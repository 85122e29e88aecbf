//! Signed peer announcements.
//!
//! A peer record advertises that a service identified by `peer_id` (an
//! ed25519 verifying key) is reachable through DHT node `node_id` on `port`.
//! The record is self-certifying: the signature covers the canonical
//! serialisation of every routable field, so any node can validate an
//! announcement without trusting the node that relayed it.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::crypto::{verify_signature, KeyPair, SIGNATURE_BYTES};
use crate::error::DhtError;
use crate::id::Id;

/// A peer announcement, optionally owned (carrying its private key).
#[derive(Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Service identity; the ed25519 verifying key that signed the record.
    peer_id: Id,
    /// DHT node the service is reachable through.
    node_id: Id,
    /// Original announcer when the record was delegated through another node.
    origin: Option<Id>,
    /// Monotonic version of the announcement.
    seq: i32,
    /// Service port at the node's address.
    port: u16,
    /// Optional alternative endpoint, e.g. a relay URL.
    alternative_url: Option<String>,
    /// Ed25519 signature over [`PeerInfo::signable_bytes`].
    signature: Vec<u8>,
    /// Present only for peers announced by this node.
    #[serde(skip)]
    private_key: Option<KeyPair>,
}

impl PeerInfo {
    /// Create and sign a new peer announcement owned by `keypair`.
    pub fn create(
        keypair: &KeyPair,
        node_id: &Id,
        origin: Option<Id>,
        port: u16,
        alternative_url: Option<String>,
        seq: i32,
    ) -> Result<Self, DhtError> {
        if port == 0 {
            return Err(DhtError::InvalidPeer("port must be non-zero".into()));
        }
        let mut peer = PeerInfo {
            peer_id: keypair.public_id(),
            node_id: *node_id,
            origin,
            seq,
            port,
            alternative_url,
            signature: Vec::new(),
            private_key: Some(keypair.clone()),
        };
        peer.signature = keypair.sign(&peer.signable_bytes());
        Ok(peer)
    }

    /// Rebuild a peer record received from the network (unowned).
    pub fn of(
        peer_id: Id,
        node_id: Id,
        origin: Option<Id>,
        seq: i32,
        port: u16,
        alternative_url: Option<String>,
        signature: Vec<u8>,
    ) -> Self {
        PeerInfo {
            peer_id,
            node_id,
            origin,
            seq,
            port,
            alternative_url,
            signature,
            private_key: None,
        }
    }

    pub fn peer_id(&self) -> &Id {
        &self.peer_id
    }

    pub fn node_id(&self) -> &Id {
        &self.node_id
    }

    pub fn origin(&self) -> Option<&Id> {
        self.origin.as_ref()
    }

    pub fn seq(&self) -> i32 {
        self.seq
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn alternative_url(&self) -> Option<&str> {
        self.alternative_url.as_deref()
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Whether this record was announced through a different node than the
    /// origin (a delegated announcement).
    pub fn is_delegated(&self) -> bool {
        self.origin.is_some()
    }

    /// Whether this node owns the announcement.
    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    pub fn keypair(&self) -> Option<&KeyPair> {
        self.private_key.as_ref()
    }

    /// Canonical byte serialisation covered by the signature:
    /// `node_id || origin? || port_be16 || alt_url? || seq_be32`.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(self.node_id.as_bytes());
        if let Some(origin) = &self.origin {
            buf.extend_from_slice(origin.as_bytes());
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
        if let Some(url) = &self.alternative_url {
            buf.extend_from_slice(url.as_bytes());
        }
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf
    }

    /// Verify structure and signature.
    pub fn is_valid(&self) -> bool {
        if self.port == 0 || self.signature.len() != SIGNATURE_BYTES {
            return false;
        }
        if self.seq < 0 {
            return false;
        }
        verify_signature(&self.peer_id, &self.signable_bytes(), &self.signature)
    }

    /// Re-sign the record for a new sequence number; requires ownership.
    pub fn update(&self, seq: i32) -> Result<PeerInfo, DhtError> {
        let keypair = self
            .private_key
            .as_ref()
            .ok_or_else(|| DhtError::InvalidPeer("peer is not owned by this node".into()))?;
        PeerInfo::create(
            keypair,
            &self.node_id,
            self.origin,
            self.port,
            self.alternative_url.clone(),
            seq,
        )
    }

    /// Service endpoint string for an observed node address.
    pub fn endpoint(&self, node_ip: &IpAddr) -> String {
        format!("{}:{}", node_ip, self.port)
    }
}

impl std::fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerInfo")
            .field("peer_id", &self.peer_id)
            .field("node_id", &self.node_id)
            .field("origin", &self.origin)
            .field("seq", &self.seq)
            .field("port", &self.port)
            .field("alt", &self.alternative_url)
            .field("owned", &self.private_key.is_some())
            .finish()
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
            && self.node_id == other.node_id
            && self.origin == other.origin
            && self.seq == other.seq
            && self.port == other.port
            && self.alternative_url == other.alternative_url
            && self.signature == other.signature
    }
}

impl Eq for PeerInfo {}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned_peer(seq: i32) -> PeerInfo {
        let kp = KeyPair::generate();
        PeerInfo::create(&kp, &Id::random(), None, 8090, None, seq).unwrap()
    }

    #[test]
    fn test_created_peer_is_valid() {
        let peer = owned_peer(0);
        assert!(peer.is_valid());
        assert!(peer.has_private_key());
        assert!(!peer.is_delegated());
    }

    #[test]
    fn test_wire_round_trip_preserves_validity() {
        let peer = owned_peer(3);
        let unowned = PeerInfo::of(
            *peer.peer_id(),
            *peer.node_id(),
            peer.origin().copied(),
            peer.seq(),
            peer.port(),
            peer.alternative_url().map(str::to_owned),
            peer.signature().to_vec(),
        );
        assert!(unowned.is_valid());
        assert!(!unowned.has_private_key());
        assert_eq!(unowned, peer);
    }

    #[test]
    fn test_tampered_record_is_invalid() {
        let peer = owned_peer(1);
        let tampered = PeerInfo::of(
            *peer.peer_id(),
            *peer.node_id(),
            None,
            peer.seq() + 1, // not what was signed
            peer.port(),
            None,
            peer.signature().to_vec(),
        );
        assert!(!tampered.is_valid());
    }

    #[test]
    fn test_delegated_peer_signs_origin() {
        let kp = KeyPair::generate();
        let origin = Id::random();
        let peer =
            PeerInfo::create(&kp, &Id::random(), Some(origin), 9000, None, 0).unwrap();
        assert!(peer.is_valid());
        assert!(peer.is_delegated());

        // Dropping the origin breaks the signature.
        let stripped = PeerInfo::of(
            *peer.peer_id(),
            *peer.node_id(),
            None,
            peer.seq(),
            peer.port(),
            None,
            peer.signature().to_vec(),
        );
        assert!(!stripped.is_valid());
    }

    #[test]
    fn test_update_requires_ownership_and_bumps_seq() {
        let peer = owned_peer(4);
        let next = peer.update(5).unwrap();
        assert_eq!(next.seq(), 5);
        assert!(next.is_valid());

        let unowned = PeerInfo::of(
            *peer.peer_id(),
            *peer.node_id(),
            None,
            peer.seq(),
            peer.port(),
            None,
            peer.signature().to_vec(),
        );
        assert!(unowned.update(6).is_err());
    }

    #[test]
    fn test_zero_port_rejected() {
        let kp = KeyPair::generate();
        assert!(PeerInfo::create(&kp, &Id::random(), None, 0, None, 0).is_err());
    }

    #[test]
    fn test_alternative_url_is_signed() {
        let kp = KeyPair::generate();
        let peer = PeerInfo::create(
            &kp,
            &Id::random(),
            None,
            8090,
            Some("https://relay.example".into()),
            0,
        )
        .unwrap();
        assert!(peer.is_valid());

        let swapped = PeerInfo::of(
            *peer.peer_id(),
            *peer.node_id(),
            None,
            peer.seq(),
            peer.port(),
            Some("https://evil.example".into()),
            peer.signature().to_vec(),
        );
        assert!(!swapped.is_valid());
    }
}
