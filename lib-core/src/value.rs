//! DHT values: immutable blobs, signed mutable records, and encrypted
//! mutable records.
//!
//! An immutable value's id is the SHA-256 of its data, so it cannot be
//! substituted. A mutable value's id is its ed25519 verifying key; updates
//! carry a monotonically increasing sequence number under the same key. An
//! encrypted value additionally names a recipient; sealing and opening the
//! payload happens above the core, the DHT only validates and routes it.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::{verify_signature, KeyPair, SIGNATURE_BYTES};
use crate::error::DhtError;
use crate::id::Id;

/// Length of the nonce carried by mutable values.
pub const NONCE_BYTES: usize = 24;

/// A value stored in or retrieved from the DHT.
#[derive(Clone, Serialize, Deserialize)]
pub struct Value {
    /// Verifying key; present only for mutable values.
    public_key: Option<Id>,
    /// Recipient id; present only for encrypted values.
    recipient: Option<Id>,
    /// Per-record nonce; present only for mutable values.
    nonce: Option<[u8; NONCE_BYTES]>,
    /// Version of a mutable value, `-1` for immutable values.
    seq: i32,
    /// Ed25519 signature; present only for mutable values.
    signature: Option<Vec<u8>>,
    /// The payload. Sealed bytes for encrypted values.
    data: Vec<u8>,
    #[serde(skip)]
    private_key: Option<KeyPair>,
}

impl Value {
    /// An immutable value; its id is the SHA-256 of `data`.
    pub fn create_immutable(data: Vec<u8>) -> Result<Self, DhtError> {
        if data.is_empty() {
            return Err(DhtError::InvalidValue("empty data".into()));
        }
        Ok(Value {
            public_key: None,
            recipient: None,
            nonce: None,
            seq: -1,
            signature: None,
            data,
            private_key: None,
        })
    }

    /// A signed mutable value owned by `keypair`.
    pub fn create_signed(keypair: &KeyPair, seq: i32, data: Vec<u8>) -> Result<Self, DhtError> {
        Self::create_mutable(keypair, None, seq, data)
    }

    /// An encrypted mutable value addressed to `recipient`; `data` must
    /// already be sealed for that recipient.
    pub fn create_encrypted(
        keypair: &KeyPair,
        recipient: Id,
        seq: i32,
        data: Vec<u8>,
    ) -> Result<Self, DhtError> {
        Self::create_mutable(keypair, Some(recipient), seq, data)
    }

    fn create_mutable(
        keypair: &KeyPair,
        recipient: Option<Id>,
        seq: i32,
        data: Vec<u8>,
    ) -> Result<Self, DhtError> {
        if data.is_empty() {
            return Err(DhtError::InvalidValue("empty data".into()));
        }
        if seq < 0 {
            return Err(DhtError::InvalidValue("negative sequence number".into()));
        }
        let mut nonce = [0u8; NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut value = Value {
            public_key: Some(keypair.public_id()),
            recipient,
            nonce: Some(nonce),
            seq,
            signature: None,
            data,
            private_key: Some(keypair.clone()),
        };
        value.signature = Some(keypair.sign(&value.signable_bytes()));
        Ok(value)
    }

    /// Rebuild a value received from the network (unowned).
    #[allow(clippy::too_many_arguments)]
    pub fn of(
        public_key: Option<Id>,
        recipient: Option<Id>,
        nonce: Option<[u8; NONCE_BYTES]>,
        seq: i32,
        signature: Option<Vec<u8>>,
        data: Vec<u8>,
    ) -> Self {
        Value {
            public_key,
            recipient,
            nonce,
            seq,
            signature,
            data,
            private_key: None,
        }
    }

    /// The id this value lives under.
    pub fn id(&self) -> Id {
        match &self.public_key {
            Some(pk) => *pk,
            None => Id::sha256_of(&self.data),
        }
    }

    pub fn public_key(&self) -> Option<&Id> {
        self.public_key.as_ref()
    }

    pub fn recipient(&self) -> Option<&Id> {
        self.recipient.as_ref()
    }

    pub fn nonce(&self) -> Option<&[u8; NONCE_BYTES]> {
        self.nonce.as_ref()
    }

    pub fn seq(&self) -> i32 {
        self.seq
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_mutable(&self) -> bool {
        self.public_key.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.recipient.is_some()
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// Canonical byte serialisation covered by the signature:
    /// `recipient? || nonce || seq_be32 || data`.
    ///
    /// The verifying key itself is the id, so it needs no inclusion.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(NONCE_BYTES + 4 + self.data.len() + 32);
        if let Some(recipient) = &self.recipient {
            buf.extend_from_slice(recipient.as_bytes());
        }
        if let Some(nonce) = &self.nonce {
            buf.extend_from_slice(nonce);
        }
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Structural and cryptographic validation.
    ///
    /// Immutable values are always structurally valid here; whether their id
    /// matches a lookup target is checked by [`Value::validate_id`].
    pub fn is_valid(&self) -> bool {
        if self.data.is_empty() {
            return false;
        }
        if !self.is_mutable() {
            // Stray mutable fields on an immutable value are malformed.
            return self.recipient.is_none()
                && self.nonce.is_none()
                && self.signature.is_none()
                && self.seq < 0;
        }
        let Some(signature) = &self.signature else {
            return false;
        };
        if signature.len() != SIGNATURE_BYTES || self.nonce.is_none() || self.seq < 0 {
            return false;
        }
        let pk = self.public_key.as_ref().expect("mutable value has key");
        verify_signature(pk, &self.signable_bytes(), signature)
    }

    /// Whether this value may legitimately live under `expected`.
    pub fn validate_id(&self, expected: &Id) -> bool {
        self.id() == *expected
    }

    /// Produce the next version of a mutable value; requires ownership.
    pub fn update(&self, data: Vec<u8>) -> Result<Value, DhtError> {
        let keypair = self
            .private_key
            .as_ref()
            .ok_or_else(|| DhtError::InvalidValue("value is not owned by this node".into()))?;
        let seq = self
            .seq
            .checked_add(1)
            .ok_or_else(|| DhtError::InvalidValue("sequence number overflow".into()))?;
        match self.recipient {
            Some(recipient) => Value::create_encrypted(keypair, recipient, seq, data),
            None => Value::create_signed(keypair, seq, data),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("id", &self.id())
            .field("mutable", &self.is_mutable())
            .field("encrypted", &self.is_encrypted())
            .field("seq", &self.seq)
            .field("size", &self.data.len())
            .finish()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
            && self.recipient == other.recipient
            && self.nonce == other.nonce
            && self.seq == other.seq
            && self.signature == other.signature
            && self.data == other.data
    }
}

impl Eq for Value {}
