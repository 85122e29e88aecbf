//! Wire message model for the six RPC methods.
//!
//! A message is an envelope `(type, method, txid, sender id, version)`
//! around a method-specific body. The CBOR layout lives in [`codec`]; this
//! module is the typed model the rest of the engine works with.

pub mod codec;

use lib_core::{DhtError, Id, NodeInfo, PeerInfo, Value};

/// RPC methods, with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Ping,
    FindNode,
    FindValue,
    StoreValue,
    FindPeer,
    AnnouncePeer,
}

impl Method {
    pub fn code(&self) -> u64 {
        match self {
            Method::Ping => 1,
            Method::FindNode => 2,
            Method::FindValue => 3,
            Method::StoreValue => 4,
            Method::FindPeer => 5,
            Method::AnnouncePeer => 6,
        }
    }

    pub fn from_code(code: u64) -> Result<Self, DhtError> {
        Ok(match code {
            1 => Method::Ping,
            2 => Method::FindNode,
            3 => Method::FindValue,
            4 => Method::StoreValue,
            5 => Method::FindPeer,
            6 => Method::AnnouncePeer,
            other => return Err(DhtError::MethodUnknown(other.to_string())),
        })
    }
}

/// Envelope type: request, response or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Error,
}

impl MessageKind {
    pub fn code(&self) -> u64 {
        match self {
            MessageKind::Request => 1,
            MessageKind::Response => 2,
            MessageKind::Error => 3,
        }
    }
}

/// FIND_NODE request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeRequest {
    pub target: Id,
    pub want4: bool,
    pub want6: bool,
    pub want_token: bool,
}

/// FIND_NODE response body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindNodeResponse {
    pub nodes4: Vec<NodeInfo>,
    pub nodes6: Vec<NodeInfo>,
    pub token: Option<u32>,
}

/// FIND_VALUE request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindValueRequest {
    pub target: Id,
    pub want4: bool,
    pub want6: bool,
    /// Only values with a sequence number at or above this are wanted;
    /// negative disables the filter.
    pub seq: i32,
}

/// FIND_VALUE response body: the value, or closest nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindValueResponse {
    pub value: Option<Value>,
    pub nodes4: Vec<NodeInfo>,
    pub nodes6: Vec<NodeInfo>,
}

/// STORE_VALUE request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreValueRequest {
    pub token: u32,
    /// Compare-and-swap expectation; negative disables the check.
    pub expected_seq: i32,
    pub value: Value,
}

/// FIND_PEER request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindPeerRequest {
    pub target: Id,
    pub want4: bool,
    pub want6: bool,
    pub seq: i32,
    /// Upper bound on returned peer records.
    pub count: u32,
}

/// FIND_PEER response body: peer records, or closest nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindPeerResponse {
    pub peers: Vec<PeerInfo>,
    pub nodes4: Vec<NodeInfo>,
    pub nodes6: Vec<NodeInfo>,
}

/// ANNOUNCE_PEER request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncePeerRequest {
    pub token: u32,
    pub expected_seq: i32,
    pub peer: PeerInfo,
}

/// Error response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub method: Method,
    pub code: i32,
    pub message: String,
}

impl ErrorBody {
    pub fn of(method: Method, error: &DhtError) -> Self {
        ErrorBody {
            method,
            code: error.code(),
            message: error.to_string(),
        }
    }

    pub fn to_error(&self) -> DhtError {
        DhtError::from_code(self.code, self.message.clone())
    }
}

/// Typed message body; the variant determines method and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    PingRequest,
    PingResponse,
    FindNodeRequest(FindNodeRequest),
    FindNodeResponse(FindNodeResponse),
    FindValueRequest(FindValueRequest),
    FindValueResponse(FindValueResponse),
    StoreValueRequest(StoreValueRequest),
    StoreValueResponse,
    FindPeerRequest(FindPeerRequest),
    FindPeerResponse(FindPeerResponse),
    AnnouncePeerRequest(AnnouncePeerRequest),
    AnnouncePeerResponse,
    Error(ErrorBody),
}

impl Body {
    pub fn method(&self) -> Method {
        match self {
            Body::PingRequest | Body::PingResponse => Method::Ping,
            Body::FindNodeRequest(_) | Body::FindNodeResponse(_) => Method::FindNode,
            Body::FindValueRequest(_) | Body::FindValueResponse(_) => Method::FindValue,
            Body::StoreValueRequest(_) | Body::StoreValueResponse => Method::StoreValue,
            Body::FindPeerRequest(_) | Body::FindPeerResponse(_) => Method::FindPeer,
            Body::AnnouncePeerRequest(_) | Body::AnnouncePeerResponse => Method::AnnouncePeer,
            Body::Error(e) => e.method,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Body::PingRequest
            | Body::FindNodeRequest(_)
            | Body::FindValueRequest(_)
            | Body::StoreValueRequest(_)
            | Body::FindPeerRequest(_)
            | Body::AnnouncePeerRequest(_) => MessageKind::Request,
            Body::PingResponse
            | Body::FindNodeResponse(_)
            | Body::FindValueResponse(_)
            | Body::StoreValueResponse
            | Body::FindPeerResponse(_)
            | Body::AnnouncePeerResponse => MessageKind::Response,
            Body::Error(_) => MessageKind::Error,
        }
    }
}

/// A complete wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Transaction id matching responses to calls.
    pub txid: u32,
    /// Sender's node id.
    pub id: Id,
    /// Sender's software version, 4 opaque bytes.
    pub version: Option<[u8; 4]>,
    pub body: Body,
}

impl Message {
    pub fn new(txid: u32, id: Id, body: Body) -> Self {
        Message {
            txid,
            id,
            version: Some(crate::version::VERSION_BYTES),
            body,
        }
    }

    pub fn method(&self) -> Method {
        self.body.method()
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn is_request(&self) -> bool {
        self.kind() == MessageKind::Request
    }

    pub fn is_response(&self) -> bool {
        self.kind() == MessageKind::Response
    }

    pub fn is_error(&self) -> bool {
        self.kind() == MessageKind::Error
    }
}
