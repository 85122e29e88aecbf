//! End-to-end scenarios over loopback UDP in developer mode.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use lib_core::{DhtError, Id, KeyPair, PeerInfo, Value};
use lib_dht::messages::{
    codec, Body, FindNodeRequest, Message, Method, StoreValueRequest,
};
use lib_dht::{BootstrapNode, ConnectionStatus, DhtConfig, Node};

/// Grab a free UDP port on loopback.
async fn free_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

fn test_config(port: u16, data_dir: &std::path::Path, bootstrap: Vec<BootstrapNode>) -> DhtConfig {
    DhtConfig {
        host4: Some("127.0.0.1".to_string()),
        host6: None,
        port,
        private_key: None,
        data_dir: data_dir.to_path_buf(),
        database_uri: "in-memory://".to_string(),
        bootstrap_nodes: bootstrap,
        enable_spam_throttling: true,
        enable_suspicious_node_detector: true,
        enable_metrics: false,
        enable_developer_mode: true,
    }
}

async fn start_node(data_dir: &std::path::Path, bootstrap: Vec<BootstrapNode>) -> Node {
    let port = free_port().await;
    let mut node = Node::new(test_config(port, data_dir, bootstrap)).unwrap();
    node.start().await.unwrap();
    node
}

fn as_bootstrap(node: &Node) -> BootstrapNode {
    let addr = node.addresses()[0];
    BootstrapNode {
        id: node.id().to_hex(),
        host: addr.ip().to_string(),
        port: addr.port(),
    }
}

async fn wait_until<F: FnMut() -> bool>(mut check: F, what: &str) {
    timeout(Duration::from_secs(10), async {
        loop {
            if check() {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test]
async fn test_bootstrap_connects_and_finds_nodes() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let mut seed = start_node(dir_b.path(), Vec::new()).await;
    let mut node = start_node(dir_a.path(), vec![as_bootstrap(&seed)]).await;

    wait_until(
        || node.connection_status() == ConnectionStatus::Connected,
        "bootstrap to connect",
    )
    .await;

    let found = node.find_node(seed.id()).await.unwrap();
    assert!(
        found.iter().any(|n| *n.id() == seed.id()),
        "seed node must be discoverable"
    );

    // The seed learned about us in return.
    wait_until(
        || seed.connection_status() == ConnectionStatus::Connected,
        "seed to learn the new node",
    )
    .await;

    node.stop().await;
    seed.stop().await;
}

#[tokio::test]
async fn test_store_and_find_value_across_nodes() {
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();

    let mut seed = start_node(dirs[0].path(), Vec::new()).await;
    let mut writer = start_node(dirs[1].path(), vec![as_bootstrap(&seed)]).await;
    let mut reader = start_node(dirs[2].path(), vec![as_bootstrap(&seed)]).await;

    wait_until(
        || {
            writer.connection_status() == ConnectionStatus::Connected
                && reader.connection_status() == ConnectionStatus::Connected
        },
        "both nodes to connect",
    )
    .await;

    let value = Value::create_immutable(b"hello overlay".to_vec()).unwrap();
    let value_id = value.id();
    timeout(Duration::from_secs(10), writer.store_value(value.clone(), -1))
        .await
        .expect("store must settle")
        .expect("store must succeed");

    let found = timeout(Duration::from_secs(10), reader.find_value(value_id, -1))
        .await
        .expect("lookup must settle")
        .unwrap();
    assert_eq!(found.expect("value must be found").data(), value.data());

    writer.stop().await;
    reader.stop().await;
    seed.stop().await;
}

#[tokio::test]
async fn test_announce_and_find_peer() {
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();

    let mut seed = start_node(dirs[0].path(), Vec::new()).await;
    let mut announcer = start_node(dirs[1].path(), vec![as_bootstrap(&seed)]).await;
    let mut searcher = start_node(dirs[2].path(), vec![as_bootstrap(&seed)]).await;

    wait_until(
        || {
            announcer.connection_status() == ConnectionStatus::Connected
                && searcher.connection_status() == ConnectionStatus::Connected
        },
        "both nodes to connect",
    )
    .await;

    let service = KeyPair::generate();
    let peer = PeerInfo::create(&service, &announcer.id(), None, 8090, None, 1).unwrap();
    timeout(
        Duration::from_secs(10),
        announcer.announce_peer(peer.clone(), -1),
    )
    .await
    .expect("announce must settle")
    .expect("announce must succeed");

    let found = timeout(
        Duration::from_secs(10),
        searcher.find_peer(*peer.peer_id(), 4, -1),
    )
    .await
    .expect("lookup must settle")
    .unwrap();
    assert!(
        found.iter().any(|p| p.node_id() == peer.node_id()),
        "announced peer must be discoverable"
    );

    announcer.stop().await;
    searcher.stop().await;
    seed.stop().await;
}

/// A bare UDP client speaking the wire protocol directly.
struct WireClient {
    socket: UdpSocket,
    id: Id,
    target: SocketAddr,
}

impl WireClient {
    async fn new(target: SocketAddr) -> Self {
        WireClient {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            id: Id::random(),
            target,
        }
    }

    async fn exchange(&self, txid: u32, body: Body) -> Message {
        let request = Message::new(txid, self.id, body);
        let wire = codec::serialize(&request).unwrap();
        self.socket.send_to(&wire, self.target).await.unwrap();

        // The node may also ping us to verify our unsolicited endpoint;
        // skip anything that is not the answer to this transaction.
        let mut buf = vec![0u8; 2048];
        timeout(Duration::from_secs(5), async {
            loop {
                let (len, _) = self.socket.recv_from(&mut buf).await.unwrap();
                let message = codec::deserialize(&buf[..len]).unwrap();
                if message.txid == txid && !message.is_request() {
                    return message;
                }
            }
        })
        .await
        .expect("node must answer")
    }

    /// Fetch a write token for `target_id` via FIND_NODE.
    async fn write_token(&self, target_id: Id) -> u32 {
        let reply = self
            .exchange(
                7,
                Body::FindNodeRequest(FindNodeRequest {
                    target: target_id,
                    want4: true,
                    want6: false,
                    want_token: true,
                }),
            )
            .await;
        match reply.body {
            Body::FindNodeResponse(resp) => resp.token.expect("token requested"),
            other => panic!("unexpected reply {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_store_value_with_forged_token_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = start_node(dir.path(), Vec::new()).await;
    let client = WireClient::new(node.addresses()[0]).await;

    let value = Value::create_immutable(b"forged".to_vec()).unwrap();
    let reply = client
        .exchange(
            9,
            Body::StoreValueRequest(StoreValueRequest {
                token: 0,
                expected_seq: -1,
                value: value.clone(),
            }),
        )
        .await;

    match reply.body {
        Body::Error(err) => {
            assert_eq!(err.code, 301);
            assert_eq!(err.method, Method::StoreValue);
        }
        other => panic!("expected error, got {:?}", other),
    }
    // Storage untouched.
    assert!(node
        .storage()
        .get_value(&value.id())
        .await
        .unwrap()
        .is_none());

    node.stop().await;
}

#[tokio::test]
async fn test_store_value_sequence_regression_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = start_node(dir.path(), Vec::new()).await;
    let client = WireClient::new(node.addresses()[0]).await;

    // Seed storage with an unowned mutable value at seq 5, as if a remote
    // node had stored it earlier.
    let author = KeyPair::generate();
    let v5 = Value::create_signed(&author, 5, b"v5".to_vec()).unwrap();
    let v5_unowned = Value::of(
        v5.public_key().copied(),
        None,
        v5.nonce().copied(),
        v5.seq(),
        v5.signature().map(<[u8]>::to_vec),
        v5.data().to_vec(),
    );
    node.storage().put_value(v5_unowned, -1).await.unwrap();

    // A genuine token, but a stale sequence number.
    let token = client.write_token(v5.id()).await;
    let v4 = Value::create_signed(&author, 4, b"v4".to_vec()).unwrap();
    let reply = client
        .exchange(
            11,
            Body::StoreValueRequest(StoreValueRequest {
                token,
                expected_seq: -1,
                value: v4,
            }),
        )
        .await;

    match reply.body {
        Body::Error(err) => assert_eq!(err.code, 304),
        other => panic!("expected error, got {:?}", other),
    }

    // Storage still holds seq 5.
    let stored = node.storage().get_value(&v5.id()).await.unwrap().unwrap();
    assert_eq!(stored.seq(), 5);

    node.stop().await;
}

#[tokio::test]
async fn test_routing_table_persists_across_restart() {
    let dir_seed = tempfile::tempdir().unwrap();
    let dir_node = tempfile::tempdir().unwrap();

    let mut seed = start_node(dir_seed.path(), Vec::new()).await;
    let seed_id = seed.id();

    let port = free_port().await;
    let config = test_config(port, dir_node.path(), vec![as_bootstrap(&seed)]);
    let keypair_hex = {
        let kp = KeyPair::generate();
        hex::encode(kp.to_seed())
    };
    let config = DhtConfig {
        private_key: Some(keypair_hex.clone()),
        ..config
    };

    let mut node = Node::new(config.clone()).unwrap();
    node.start().await.unwrap();
    wait_until(
        || node.connection_status() == ConnectionStatus::Connected,
        "node to connect",
    )
    .await;
    node.stop().await;

    // Restart with the same identity and data directory; the seed must be
    // known again without bootstrapping.
    let config = DhtConfig {
        bootstrap_nodes: Vec::new(),
        port: free_port().await,
        ..config
    };
    let mut restarted = Node::new(config).unwrap();
    restarted.start().await.unwrap();

    let found = timeout(Duration::from_secs(5), restarted.find_node(seed_id))
        .await
        .expect("lookup must settle")
        .unwrap();
    assert!(
        found.iter().any(|n| *n.id() == seed_id),
        "persisted routing table must remember the seed"
    );

    restarted.stop().await;
    seed.stop().await;
}

/// Frames above the datagram budget never leave the encoder.
#[test]
fn test_oversized_value_rejected_at_encode() {
    let value = Value::create_immutable(vec![0xab; 4096]).unwrap();
    let message = Message::new(
        1,
        Id::random(),
        Body::StoreValueRequest(StoreValueRequest {
            token: 1,
            expected_seq: -1,
            value,
        }),
    );
    assert!(matches!(
        codec::serialize(&message),
        Err(DhtError::Protocol(_))
    ));
}
