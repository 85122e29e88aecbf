//! Boson DHT core data model.
//!
//! Identifiers and distance metrics, prefix algebra for the bucket tree,
//! node endpoints, signed peer announcements, DHT values, and the tagged
//! error enum shared by every layer of the node.

pub mod crypto;
pub mod error;
pub mod id;
pub mod node_info;
pub mod peer_info;
pub mod prefix;
pub mod value;

pub use crypto::{verify_signature, KeyPair, SEED_BYTES, SIGNATURE_BYTES};
pub use error::{DhtError, Result};
pub use id::{Id, ID_BITS, ID_BYTES};
pub use node_info::{is_any_unicast, is_global_unicast, NodeInfo};
pub use peer_info::PeerInfo;
pub use prefix::{Prefix, MAX_DEPTH};
pub use value::{Value, NONCE_BYTES};
