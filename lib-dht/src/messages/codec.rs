//! CBOR wire codec for the six RPC methods.
//!
//! The envelope is a CBOR map with text keys:
//!
//! ```text
//! { "y": 1|2|3,                       message type
//!   "q"|"r"|"e": { "m": 1..6,         method code
//!                  "b": { ... } },    method body
//!   "t": txid,
//!   "v": bytes(4),                    optional version
//!   "id": bytes(32) }                 sender id
//! ```
//!
//! Encoding and decoding are written out explicitly against
//! `ciborium::value::Value` - the message grammar is small, the strictness
//! matters (anything unexpected is a protocol error reported to the
//! suspicious-node tracker), and no reflection layer gets to guess.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ciborium::value::{Integer, Value as Cbor};

use lib_core::{DhtError, Id, NodeInfo, PeerInfo, Value, ID_BYTES, NONCE_BYTES};

use super::{
    AnnouncePeerRequest, Body, ErrorBody, FindNodeRequest, FindNodeResponse, FindPeerRequest,
    FindPeerResponse, FindValueRequest, FindValueResponse, Message, MessageKind, Method,
    StoreValueRequest,
};
use crate::constants::{K, MAX_DATAGRAM_SIZE};

/// Encode a message into a datagram.
///
/// Fails with a protocol error if the encoded form would exceed the
/// 1200-byte datagram budget; node lists are truncated to K per family
/// before encoding, so only oversized values or peer records can trip this.
pub fn serialize(message: &Message) -> Result<Vec<u8>, DhtError> {
    let (member, method_map) = encode_body(&message.body);

    let mut envelope = Vec::with_capacity(5);
    envelope.push((text("y"), uint(message.kind().code())));
    envelope.push((text(member), method_map));
    envelope.push((text("t"), uint(message.txid as u64)));
    if let Some(version) = &message.version {
        envelope.push((text("v"), bytes(version.as_slice())));
    }
    envelope.push((text("id"), bytes(message.id.as_bytes())));

    let mut buf = Vec::with_capacity(256);
    ciborium::ser::into_writer(&Cbor::Map(envelope), &mut buf)
        .map_err(|e| DhtError::Protocol(format!("cbor encode: {}", e)))?;
    if buf.len() > MAX_DATAGRAM_SIZE {
        return Err(DhtError::Protocol(format!(
            "datagram would be {} bytes, limit {}",
            buf.len(),
            MAX_DATAGRAM_SIZE
        )));
    }
    Ok(buf)
}

/// Decode a datagram into a message. Strict: unknown types, methods,
/// missing fields or wrong shapes all fail.
pub fn deserialize(datagram: &[u8]) -> Result<Message, DhtError> {
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(DhtError::Protocol("oversized datagram".into()));
    }
    let root: Cbor = ciborium::de::from_reader(datagram)
        .map_err(|e| DhtError::Protocol(format!("cbor decode: {}", e)))?;
    let envelope = as_map(&root, "envelope")?;

    let kind = match require_u64(envelope, "y")? {
        1 => MessageKind::Request,
        2 => MessageKind::Response,
        3 => MessageKind::Error,
        other => return Err(DhtError::Protocol(format!("unknown message type {}", other))),
    };
    let member = match kind {
        MessageKind::Request => "q",
        MessageKind::Response => "r",
        MessageKind::Error => "e",
    };

    let method_map = as_map(require(envelope, member)?, member)?;
    let method = Method::from_code(require_u64(method_map, "m")?)?;
    let body_map = as_map(require(method_map, "b")?, "b")?;
    let body = decode_body(kind, method, body_map)?;

    let txid = require_u64(envelope, "t")?;
    let txid = u32::try_from(txid)
        .map_err(|_| DhtError::Protocol(format!("txid {} out of range", txid)))?;

    let id = decode_id(require(envelope, "id")?)?;

    let version = match get(envelope, "v") {
        Some(v) => {
            let raw = as_bytes(v, "v")?;
            let fixed: [u8; 4] = raw
                .try_into()
                .map_err(|_| DhtError::Protocol("version must be 4 bytes".into()))?;
            Some(fixed)
        }
        None => None,
    };

    Ok(Message {
        txid,
        id,
        version,
        body,
    })
}

// ---------------------------------------------------------------- bodies

fn encode_body(body: &Body) -> (&'static str, Cbor) {
    let (member, fields): (&str, Vec<(Cbor, Cbor)>) = match body {
        Body::PingRequest => ("q", Vec::new()),
        Body::PingResponse => ("r", Vec::new()),
        Body::FindNodeRequest(req) => ("q", encode_find_node_request(req)),
        Body::FindNodeResponse(resp) => ("r", encode_find_node_response(resp)),
        Body::FindValueRequest(req) => ("q", encode_find_value_request(req)),
        Body::FindValueResponse(resp) => ("r", encode_find_value_response(resp)),
        Body::StoreValueRequest(req) => ("q", encode_store_value_request(req)),
        Body::StoreValueResponse => ("r", Vec::new()),
        Body::FindPeerRequest(req) => ("q", encode_find_peer_request(req)),
        Body::FindPeerResponse(resp) => ("r", encode_find_peer_response(resp)),
        Body::AnnouncePeerRequest(req) => ("q", encode_announce_peer_request(req)),
        Body::AnnouncePeerResponse => ("r", Vec::new()),
        Body::Error(err) => (
            "e",
            vec![
                (text("c"), int(err.code as i64)),
                (text("m"), text(&err.message)),
            ],
        ),
    };
    let method_map = Cbor::Map(vec![
        (text("m"), uint(body.method().code())),
        (text("b"), Cbor::Map(fields)),
    ]);
    (member, method_map)
}

fn decode_body(
    kind: MessageKind,
    method: Method,
    body: &[(Cbor, Cbor)],
) -> Result<Body, DhtError> {
    Ok(match (kind, method) {
        (MessageKind::Request, Method::Ping) => Body::PingRequest,
        (MessageKind::Response, Method::Ping) => Body::PingResponse,
        (MessageKind::Request, Method::FindNode) => {
            Body::FindNodeRequest(decode_find_node_request(body)?)
        }
        (MessageKind::Response, Method::FindNode) => {
            Body::FindNodeResponse(decode_find_node_response(body)?)
        }
        (MessageKind::Request, Method::FindValue) => {
            Body::FindValueRequest(decode_find_value_request(body)?)
        }
        (MessageKind::Response, Method::FindValue) => {
            Body::FindValueResponse(decode_find_value_response(body)?)
        }
        (MessageKind::Request, Method::StoreValue) => {
            Body::StoreValueRequest(decode_store_value_request(body)?)
        }
        (MessageKind::Response, Method::StoreValue) => Body::StoreValueResponse,
        (MessageKind::Request, Method::FindPeer) => {
            Body::FindPeerRequest(decode_find_peer_request(body)?)
        }
        (MessageKind::Response, Method::FindPeer) => {
            Body::FindPeerResponse(decode_find_peer_response(body)?)
        }
        (MessageKind::Request, Method::AnnouncePeer) => {
            Body::AnnouncePeerRequest(decode_announce_peer_request(body)?)
        }
        (MessageKind::Response, Method::AnnouncePeer) => Body::AnnouncePeerResponse,
        (MessageKind::Error, method) => Body::Error(ErrorBody {
            method,
            code: require_i64(body, "c")? as i32,
            message: as_text(require(body, "m")?, "m")?.to_string(),
        }),
    })
}

fn encode_find_node_request(req: &FindNodeRequest) -> Vec<(Cbor, Cbor)> {
    vec![
        (text("t"), bytes(req.target.as_bytes())),
        (text("w4"), Cbor::Bool(req.want4)),
        (text("w6"), Cbor::Bool(req.want6)),
        (text("wt"), Cbor::Bool(req.want_token)),
    ]
}

fn decode_find_node_request(body: &[(Cbor, Cbor)]) -> Result<FindNodeRequest, DhtError> {
    Ok(FindNodeRequest {
        target: decode_id(require(body, "t")?)?,
        want4: require_bool(body, "w4")?,
        want6: require_bool(body, "w6")?,
        want_token: require_bool(body, "wt")?,
    })
}

fn encode_find_node_response(resp: &FindNodeResponse) -> Vec<(Cbor, Cbor)> {
    let mut fields = Vec::new();
    push_node_lists(&mut fields, &resp.nodes4, &resp.nodes6);
    if let Some(token) = resp.token {
        fields.push((text("tok"), uint(token as u64)));
    }
    fields
}

fn decode_find_node_response(body: &[(Cbor, Cbor)]) -> Result<FindNodeResponse, DhtError> {
    let token = match get(body, "tok") {
        Some(v) => Some(
            u32::try_from(as_u64(v, "tok")?)
                .map_err(|_| DhtError::Protocol("token out of range".into()))?,
        ),
        None => None,
    };
    let (nodes4, nodes6) = decode_node_lists(body)?;
    Ok(FindNodeResponse {
        nodes4,
        nodes6,
        token,
    })
}

fn encode_find_value_request(req: &FindValueRequest) -> Vec<(Cbor, Cbor)> {
    vec![
        (text("t"), bytes(req.target.as_bytes())),
        (text("w4"), Cbor::Bool(req.want4)),
        (text("w6"), Cbor::Bool(req.want6)),
        (text("seq"), int(req.seq as i64)),
    ]
}

fn decode_find_value_request(body: &[(Cbor, Cbor)]) -> Result<FindValueRequest, DhtError> {
    Ok(FindValueRequest {
        target: decode_id(require(body, "t")?)?,
        want4: require_bool(body, "w4")?,
        want6: require_bool(body, "w6")?,
        seq: require_i64(body, "seq")? as i32,
    })
}

fn encode_find_value_response(resp: &FindValueResponse) -> Vec<(Cbor, Cbor)> {
    let mut fields = Vec::new();
    if let Some(value) = &resp.value {
        fields.push((text("v"), encode_value(value)));
    } else {
        push_node_lists(&mut fields, &resp.nodes4, &resp.nodes6);
    }
    fields
}

fn decode_find_value_response(body: &[(Cbor, Cbor)]) -> Result<FindValueResponse, DhtError> {
    let value = match get(body, "v") {
        Some(v) => Some(decode_value(v)?),
        None => None,
    };
    let (nodes4, nodes6) = decode_node_lists(body)?;
    Ok(FindValueResponse {
        value,
        nodes4,
        nodes6,
    })
}

fn encode_store_value_request(req: &StoreValueRequest) -> Vec<(Cbor, Cbor)> {
    vec![
        (text("tok"), uint(req.token as u64)),
        (text("cas"), int(req.expected_seq as i64)),
        (text("v"), encode_value(&req.value)),
    ]
}

fn decode_store_value_request(body: &[(Cbor, Cbor)]) -> Result<StoreValueRequest, DhtError> {
    Ok(StoreValueRequest {
        token: u32::try_from(require_u64(body, "tok")?)
            .map_err(|_| DhtError::Protocol("token out of range".into()))?,
        expected_seq: require_i64(body, "cas")? as i32,
        value: decode_value(require(body, "v")?)?,
    })
}

fn encode_find_peer_request(req: &FindPeerRequest) -> Vec<(Cbor, Cbor)> {
    vec![
        (text("t"), bytes(req.target.as_bytes())),
        (text("w4"), Cbor::Bool(req.want4)),
        (text("w6"), Cbor::Bool(req.want6)),
        (text("seq"), int(req.seq as i64)),
        (text("cnt"), uint(req.count as u64)),
    ]
}

fn decode_find_peer_request(body: &[(Cbor, Cbor)]) -> Result<FindPeerRequest, DhtError> {
    Ok(FindPeerRequest {
        target: decode_id(require(body, "t")?)?,
        want4: require_bool(body, "w4")?,
        want6: require_bool(body, "w6")?,
        seq: require_i64(body, "seq")? as i32,
        count: require_u64(body, "cnt")? as u32,
    })
}

fn encode_find_peer_response(resp: &FindPeerResponse) -> Vec<(Cbor, Cbor)> {
    let mut fields = Vec::new();
    if let Some(first) = resp.peers.first() {
        // The shared peer id is emitted once; per-record ids are elided.
        fields.push((text("peerId"), bytes(first.peer_id().as_bytes())));
        fields.push((
            text("p"),
            Cbor::Array(resp.peers.iter().map(encode_peer_elided).collect()),
        ));
    } else {
        push_node_lists(&mut fields, &resp.nodes4, &resp.nodes6);
    }
    fields
}

fn decode_find_peer_response(body: &[(Cbor, Cbor)]) -> Result<FindPeerResponse, DhtError> {
    let peers = match get(body, "p") {
        Some(list) => {
            let peer_id = decode_id(require(body, "peerId")?)?;
            as_array(list, "p")?
                .iter()
                .map(|entry| decode_peer_elided(entry, &peer_id))
                .collect::<Result<Vec<_>, _>>()?
        }
        None => Vec::new(),
    };
    let (nodes4, nodes6) = decode_node_lists(body)?;
    Ok(FindPeerResponse {
        peers,
        nodes4,
        nodes6,
    })
}

fn encode_announce_peer_request(req: &AnnouncePeerRequest) -> Vec<(Cbor, Cbor)> {
    vec![
        (text("tok"), uint(req.token as u64)),
        (text("cas"), int(req.expected_seq as i64)),
        (text("p"), encode_peer_full(&req.peer)),
    ]
}

fn decode_announce_peer_request(body: &[(Cbor, Cbor)]) -> Result<AnnouncePeerRequest, DhtError> {
    Ok(AnnouncePeerRequest {
        token: u32::try_from(require_u64(body, "tok")?)
            .map_err(|_| DhtError::Protocol("token out of range".into()))?,
        expected_seq: require_i64(body, "cas")? as i32,
        peer: decode_peer_full(require(body, "p")?)?,
    })
}

// --------------------------------------------------------- nested models

fn push_node_lists(fields: &mut Vec<(Cbor, Cbor)>, nodes4: &[NodeInfo], nodes6: &[NodeInfo]) {
    if !nodes4.is_empty() {
        fields.push((
            text("n4"),
            Cbor::Array(nodes4.iter().take(K).map(encode_node).collect()),
        ));
    }
    if !nodes6.is_empty() {
        fields.push((
            text("n6"),
            Cbor::Array(nodes6.iter().take(K).map(encode_node).collect()),
        ));
    }
}

fn decode_node_lists(
    body: &[(Cbor, Cbor)],
) -> Result<(Vec<NodeInfo>, Vec<NodeInfo>), DhtError> {
    let decode_list = |key: &str| -> Result<Vec<NodeInfo>, DhtError> {
        match get(body, key) {
            Some(list) => as_array(list, key)?.iter().map(decode_node).collect(),
            None => Ok(Vec::new()),
        }
    };
    Ok((decode_list("n4")?, decode_list("n6")?))
}

/// NodeInfo on the wire: `[id, ip-bytes, port]`.
fn encode_node(node: &NodeInfo) -> Cbor {
    let ip = match node.ip() {
        IpAddr::V4(v4) => bytes(&v4.octets()),
        IpAddr::V6(v6) => bytes(&v6.octets()),
    };
    Cbor::Array(vec![bytes(node.id().as_bytes()), ip, uint(node.port() as u64)])
}

fn decode_node(value: &Cbor) -> Result<NodeInfo, DhtError> {
    let parts = as_array(value, "node")?;
    if parts.len() != 3 {
        return Err(DhtError::Protocol("node entry must have 3 elements".into()));
    }
    let id = decode_id(&parts[0])?;
    let ip_bytes = as_bytes(&parts[1], "node ip")?;
    let ip: IpAddr = match ip_bytes.len() {
        4 => Ipv4Addr::from(<[u8; 4]>::try_from(ip_bytes).unwrap()).into(),
        16 => Ipv6Addr::from(<[u8; 16]>::try_from(ip_bytes).unwrap()).into(),
        n => return Err(DhtError::Protocol(format!("bad address length {}", n))),
    };
    let port = as_u64(&parts[2], "node port")?;
    let port =
        u16::try_from(port).map_err(|_| DhtError::Protocol("port out of range".into()))?;
    Ok(NodeInfo::new(id, SocketAddr::new(ip, port)))
}

/// PeerInfo on the wire, full form:
/// `[peer_id, node_id, origin|null, seq, port, alt|null, sig]`.
fn encode_peer_full(peer: &PeerInfo) -> Cbor {
    let mut parts = vec![bytes(peer.peer_id().as_bytes())];
    parts.extend(peer_tail(peer));
    Cbor::Array(parts)
}

/// Elided form used inside FIND_PEER responses: the shared peer id is
/// carried once at the body level.
fn encode_peer_elided(peer: &PeerInfo) -> Cbor {
    Cbor::Array(peer_tail(peer))
}

fn peer_tail(peer: &PeerInfo) -> Vec<Cbor> {
    vec![
        bytes(peer.node_id().as_bytes()),
        match peer.origin() {
            Some(origin) => bytes(origin.as_bytes()),
            None => Cbor::Null,
        },
        int(peer.seq() as i64),
        uint(peer.port() as u64),
        match peer.alternative_url() {
            Some(url) => text(url),
            None => Cbor::Null,
        },
        bytes(peer.signature()),
    ]
}

fn decode_peer_full(value: &Cbor) -> Result<PeerInfo, DhtError> {
    let parts = as_array(value, "peer")?;
    if parts.len() != 7 {
        return Err(DhtError::Protocol("peer entry must have 7 elements".into()));
    }
    let peer_id = decode_id(&parts[0])?;
    decode_peer_tail(&parts[1..], peer_id)
}

fn decode_peer_elided(value: &Cbor, peer_id: &Id) -> Result<PeerInfo, DhtError> {
    let parts = as_array(value, "peer")?;
    if parts.len() != 6 {
        return Err(DhtError::Protocol("peer entry must have 6 elements".into()));
    }
    decode_peer_tail(parts, *peer_id)
}

fn decode_peer_tail(parts: &[Cbor], peer_id: Id) -> Result<PeerInfo, DhtError> {
    let node_id = decode_id(&parts[0])?;
    let origin = match &parts[1] {
        Cbor::Null => None,
        other => Some(decode_id(other)?),
    };
    let seq = as_i64(&parts[2], "peer seq")? as i32;
    let port = as_u64(&parts[3], "peer port")?;
    let port =
        u16::try_from(port).map_err(|_| DhtError::Protocol("port out of range".into()))?;
    let alt = match &parts[4] {
        Cbor::Null => None,
        other => Some(as_text(other, "peer alt")?.to_string()),
    };
    let signature = as_bytes(&parts[5], "peer sig")?.to_vec();
    Ok(PeerInfo::of(peer_id, node_id, origin, seq, port, alt, signature))
}

/// Value on the wire: a map with `pk`/`rec`/`n`/`seq`/`sig` present only on
/// mutable values, `d` always.
fn encode_value(value: &Value) -> Cbor {
    let mut fields = Vec::with_capacity(6);
    if let Some(pk) = value.public_key() {
        fields.push((text("pk"), bytes(pk.as_bytes())));
    }
    if let Some(recipient) = value.recipient() {
        fields.push((text("rec"), bytes(recipient.as_bytes())));
    }
    if let Some(nonce) = value.nonce() {
        fields.push((text("n"), bytes(nonce)));
    }
    if value.seq() >= 0 {
        fields.push((text("seq"), int(value.seq() as i64)));
    }
    if let Some(signature) = value.signature() {
        fields.push((text("sig"), bytes(signature)));
    }
    fields.push((text("d"), bytes(value.data())));
    Cbor::Map(fields)
}

fn decode_value(value: &Cbor) -> Result<Value, DhtError> {
    let map = as_map(value, "value")?;
    let public_key = match get(map, "pk") {
        Some(v) => Some(decode_id(v)?),
        None => None,
    };
    let recipient = match get(map, "rec") {
        Some(v) => Some(decode_id(v)?),
        None => None,
    };
    let nonce = match get(map, "n") {
        Some(v) => {
            let raw = as_bytes(v, "n")?;
            let fixed: [u8; NONCE_BYTES] = raw
                .try_into()
                .map_err(|_| DhtError::Protocol("nonce must be 24 bytes".into()))?;
            Some(fixed)
        }
        None => None,
    };
    let seq = match get(map, "seq") {
        Some(v) => as_i64(v, "seq")? as i32,
        None => -1,
    };
    let signature = match get(map, "sig") {
        Some(v) => Some(as_bytes(v, "sig")?.to_vec()),
        None => None,
    };
    let data = as_bytes(require(map, "d")?, "d")?.to_vec();
    Ok(Value::of(public_key, recipient, nonce, seq, signature, data))
}

// ------------------------------------------------------------- primitives

fn text(s: &str) -> Cbor {
    Cbor::Text(s.to_string())
}

fn bytes(b: &[u8]) -> Cbor {
    Cbor::Bytes(b.to_vec())
}

fn uint(n: u64) -> Cbor {
    Cbor::Integer(Integer::from(n))
}

fn int(n: i64) -> Cbor {
    Cbor::Integer(Integer::from(n))
}

fn get<'a>(map: &'a [(Cbor, Cbor)], key: &str) -> Option<&'a Cbor> {
    map.iter()
        .find(|(k, _)| matches!(k, Cbor::Text(t) if t == key))
        .map(|(_, v)| v)
}

fn require<'a>(map: &'a [(Cbor, Cbor)], key: &str) -> Result<&'a Cbor, DhtError> {
    get(map, key).ok_or_else(|| DhtError::Protocol(format!("missing field '{}'", key)))
}

fn require_u64(map: &[(Cbor, Cbor)], key: &str) -> Result<u64, DhtError> {
    as_u64(require(map, key)?, key)
}

fn require_i64(map: &[(Cbor, Cbor)], key: &str) -> Result<i64, DhtError> {
    as_i64(require(map, key)?, key)
}

fn require_bool(map: &[(Cbor, Cbor)], key: &str) -> Result<bool, DhtError> {
    match require(map, key)? {
        Cbor::Bool(b) => Ok(*b),
        _ => Err(DhtError::Protocol(format!("field '{}' must be bool", key))),
    }
}

fn as_u64(value: &Cbor, what: &str) -> Result<u64, DhtError> {
    match value {
        Cbor::Integer(i) => u64::try_from(i128::from(*i))
            .map_err(|_| DhtError::Protocol(format!("{} must be unsigned", what))),
        _ => Err(DhtError::Protocol(format!("{} must be an integer", what))),
    }
}

fn as_i64(value: &Cbor, what: &str) -> Result<i64, DhtError> {
    match value {
        Cbor::Integer(i) => i64::try_from(i128::from(*i))
            .map_err(|_| DhtError::Protocol(format!("{} out of range", what))),
        _ => Err(DhtError::Protocol(format!("{} must be an integer", what))),
    }
}

fn as_bytes<'a>(value: &'a Cbor, what: &str) -> Result<&'a [u8], DhtError> {
    match value {
        Cbor::Bytes(b) => Ok(b.as_slice()),
        _ => Err(DhtError::Protocol(format!("{} must be a byte string", what))),
    }
}

fn as_text<'a>(value: &'a Cbor, what: &str) -> Result<&'a str, DhtError> {
    match value {
        Cbor::Text(t) => Ok(t.as_str()),
        _ => Err(DhtError::Protocol(format!("{} must be text", what))),
    }
}

fn as_array<'a>(value: &'a Cbor, what: &str) -> Result<&'a [Cbor], DhtError> {
    match value {
        Cbor::Array(a) => Ok(a.as_slice()),
        _ => Err(DhtError::Protocol(format!("{} must be an array", what))),
    }
}

fn as_map<'a>(value: &'a Cbor, what: &str) -> Result<&'a [(Cbor, Cbor)], DhtError> {
    match value {
        Cbor::Map(m) => Ok(m.as_slice()),
        _ => Err(DhtError::Protocol(format!("{} must be a map", what))),
    }
}

fn decode_id(value: &Cbor) -> Result<Id, DhtError> {
    let raw = as_bytes(value, "id")?;
    if raw.len() != ID_BYTES {
        return Err(DhtError::Protocol(format!(
            "id must be {} bytes, got {}",
            ID_BYTES,
            raw.len()
        )));
    }
    Id::of(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_core::KeyPair;

    fn round_trip(message: Message) -> Message {
        let wire = serialize(&message).unwrap();
        assert!(wire.len() <= MAX_DATAGRAM_SIZE);
        let decoded = deserialize(&wire).unwrap();
        assert_eq!(decoded, message);
        decoded
    }

    fn node(ip: &str, port: u16) -> NodeInfo {
        NodeInfo::new(Id::random(), SocketAddr::new(ip.parse().unwrap(), port))
    }

    #[test]
    fn test_ping_round_trip() {
        let message = Message::new(42, Id::random(), Body::PingRequest);
        let decoded = round_trip(message);
        assert_eq!(decoded.method(), Method::Ping);
        assert!(decoded.is_request());

        round_trip(Message::new(42, Id::random(), Body::PingResponse));
    }

    #[test]
    fn test_find_node_round_trip() {
        let request = Message::new(
            7,
            Id::random(),
            Body::FindNodeRequest(FindNodeRequest {
                target: Id::random(),
                want4: true,
                want6: false,
                want_token: true,
            }),
        );
        round_trip(request);

        let response = Message::new(
            7,
            Id::random(),
            Body::FindNodeResponse(FindNodeResponse {
                nodes4: (0..8).map(|i| node("203.0.113.1", 1000 + i)).collect(),
                nodes6: vec![node("2001:db8::1", 2000)],
                token: Some(0xdead_beef),
            }),
        );
        round_trip(response);
    }

    #[test]
    fn test_node_lists_truncate_to_k() {
        let response = Message::new(
            9,
            Id::random(),
            Body::FindNodeResponse(FindNodeResponse {
                nodes4: (0..20).map(|i| node("203.0.113.2", 1000 + i)).collect(),
                nodes6: Vec::new(),
                token: None,
            }),
        );
        let wire = serialize(&response).unwrap();
        assert!(wire.len() <= MAX_DATAGRAM_SIZE);
        let decoded = deserialize(&wire).unwrap();
        match decoded.body {
            Body::FindNodeResponse(resp) => assert_eq!(resp.nodes4.len(), K),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_find_value_round_trip() {
        let request = Message::new(
            11,
            Id::random(),
            Body::FindValueRequest(FindValueRequest {
                target: Id::random(),
                want4: true,
                want6: true,
                seq: -1,
            }),
        );
        round_trip(request);

        // Value branch.
        let kp = KeyPair::generate();
        let value = Value::create_signed(&kp, 3, b"payload".to_vec()).unwrap();
        let with_value = Message::new(
            11,
            Id::random(),
            Body::FindValueResponse(FindValueResponse {
                value: Some(value),
                nodes4: Vec::new(),
                nodes6: Vec::new(),
            }),
        );
        let decoded = round_trip(with_value);
        match decoded.body {
            Body::FindValueResponse(resp) => assert!(resp.value.unwrap().is_valid()),
            other => panic!("unexpected body {:?}", other),
        }

        // Nodes branch.
        let with_nodes = Message::new(
            12,
            Id::random(),
            Body::FindValueResponse(FindValueResponse {
                value: None,
                nodes4: vec![node("203.0.113.3", 1234)],
                nodes6: Vec::new(),
            }),
        );
        round_trip(with_nodes);
    }

    #[test]
    fn test_store_value_round_trip() {
        let value = Value::create_immutable(b"immutable blob".to_vec()).unwrap();
        let request = Message::new(
            13,
            Id::random(),
            Body::StoreValueRequest(StoreValueRequest {
                token: 0x0102_0304,
                expected_seq: -1,
                value,
            }),
        );
        round_trip(request);
        round_trip(Message::new(13, Id::random(), Body::StoreValueResponse));
    }

    #[test]
    fn test_find_peer_round_trip_with_elided_peer_ids() {
        let kp = KeyPair::generate();
        let peers: Vec<PeerInfo> = (0..4)
            .map(|i| PeerInfo::create(&kp, &Id::random(), None, 9000 + i, None, 1).unwrap())
            .collect();

        let response = Message::new(
            15,
            Id::random(),
            Body::FindPeerResponse(FindPeerResponse {
                peers: peers.clone(),
                nodes4: Vec::new(),
                nodes6: Vec::new(),
            }),
        );
        let decoded = round_trip(response);
        match decoded.body {
            Body::FindPeerResponse(resp) => {
                assert_eq!(resp.peers.len(), 4);
                for (decoded, original) in resp.peers.iter().zip(&peers) {
                    assert_eq!(decoded.peer_id(), original.peer_id());
                    assert!(decoded.is_valid(), "signature must survive the round trip");
                }
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_announce_peer_round_trip() {
        let kp = KeyPair::generate();
        let peer = PeerInfo::create(
            &kp,
            &Id::random(),
            Some(Id::random()),
            9000,
            Some("https://relay.example".into()),
            5,
        )
        .unwrap();
        let request = Message::new(
            17,
            Id::random(),
            Body::AnnouncePeerRequest(AnnouncePeerRequest {
                token: 77,
                expected_seq: 4,
                peer: peer.clone(),
            }),
        );
        let decoded = round_trip(request);
        match decoded.body {
            Body::AnnouncePeerRequest(req) => {
                assert_eq!(req.peer, peer);
                assert!(req.peer.is_valid());
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_error_round_trip() {
        let message = Message::new(
            19,
            Id::random(),
            Body::Error(ErrorBody {
                method: Method::StoreValue,
                code: 301,
                message: "invalid token".into(),
            }),
        );
        let decoded = round_trip(message);
        assert!(decoded.is_error());
        match decoded.body {
            Body::Error(err) => {
                assert_eq!(err.to_error(), DhtError::InvalidToken);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_malformed_datagrams_rejected() {
        assert!(deserialize(b"").is_err());
        assert!(deserialize(b"\xff\xff\xff").is_err());
        // Valid CBOR, wrong shape.
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&Cbor::Text("hello".into()), &mut buf).unwrap();
        assert!(deserialize(&buf).is_err());
    }

    #[test]
    fn test_unknown_method_rejected() {
        let envelope = Cbor::Map(vec![
            (text("y"), uint(1)),
            (
                text("q"),
                Cbor::Map(vec![(text("m"), uint(9)), (text("b"), Cbor::Map(vec![]))]),
            ),
            (text("t"), uint(1)),
            (text("id"), bytes(Id::random().as_bytes())),
        ]);
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&envelope, &mut buf).unwrap();
        let err = deserialize(&buf).unwrap_err();
        assert!(matches!(err, DhtError::MethodUnknown(_)));
    }

    #[test]
    fn test_wrong_id_length_rejected() {
        let envelope = Cbor::Map(vec![
            (text("y"), uint(1)),
            (
                text("q"),
                Cbor::Map(vec![(text("m"), uint(1)), (text("b"), Cbor::Map(vec![]))]),
            ),
            (text("t"), uint(1)),
            (text("id"), bytes(&[0u8; 16])),
        ]);
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&envelope, &mut buf).unwrap();
        assert!(deserialize(&buf).is_err());
    }

    #[test]
    fn test_version_field_is_carried() {
        let message = Message::new(1, Id::random(), Body::PingRequest);
        assert_eq!(message.version, Some(crate::version::VERSION_BYTES));
        let decoded = round_trip(message);
        assert_eq!(decoded.version, Some(crate::version::VERSION_BYTES));

        let unversioned = Message {
            txid: 2,
            id: Id::random(),
            version: None,
            body: Body::PingRequest,
        };
        round_trip(unversioned);
    }
}
