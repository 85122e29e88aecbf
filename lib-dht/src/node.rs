//! Dual-stack node facade.
//!
//! A [`Node`] owns up to two DHT instances (IPv4 and IPv6), each running
//! its own event loop, plus the shared storage backend and blacklist. The
//! async API fans commands out to every instance and merges the results.

use std::cmp::Ordering;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use lib_core::{DhtError, Id, KeyPair, NodeInfo, PeerInfo, Value};
use lib_storage::DataStorage;

use crate::config::DhtConfig;
use crate::constants::K;
use crate::dht::{Command, ConnectionStatus, Dht, DhtHandle, DhtStats};
use crate::security::Blacklist;

struct Instance {
    ipv4: bool,
    handle: DhtHandle,
    join: JoinHandle<()>,
    bound: std::net::SocketAddr,
}

/// A Boson DHT node.
pub struct Node {
    config: Arc<DhtConfig>,
    keypair: KeyPair,
    storage: Arc<dyn DataStorage>,
    blacklist: Arc<Blacklist>,
    instances: Vec<Instance>,
}

impl Node {
    /// Prepare a node from configuration. Fails fast on invalid
    /// configuration; sockets are bound by [`Node::start`].
    pub fn new(config: DhtConfig) -> Result<Self, DhtError> {
        config.validate()?;
        let keypair = config.keypair()?;
        let storage = lib_storage::open(&config.database_uri)?;

        let blacklist = Arc::new(Blacklist::new());
        for name in ["blacklist.json", "blacklist.yaml"] {
            let path = config.data_dir.join(name);
            if let Err(e) = blacklist.load(&path) {
                warn!(error = %e, "blacklist not loaded");
            }
        }

        Ok(Node {
            config: Arc::new(config),
            keypair,
            storage,
            blacklist,
            instances: Vec::new(),
        })
    }

    pub fn id(&self) -> Id {
        self.keypair.public_id()
    }

    pub fn storage(&self) -> Arc<dyn DataStorage> {
        self.storage.clone()
    }

    pub fn blacklist(&self) -> Arc<Blacklist> {
        self.blacklist.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.instances.is_empty()
    }

    /// Bound socket addresses of the running instances.
    pub fn addresses(&self) -> Vec<std::net::SocketAddr> {
        self.instances.iter().map(|i| i.bound).collect()
    }

    /// Bind sockets and spawn one event loop per configured family.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.is_running() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.config.data_dir)?;

        for ipv4 in [true, false] {
            let Some(bind) = self.config.bind_addr(ipv4) else {
                continue;
            };
            let (dht, handle) = Dht::new(
                ipv4,
                bind,
                &self.keypair,
                self.config.clone(),
                self.storage.clone(),
                self.blacklist.clone(),
            )
            .await?;
            let bound = dht.bound_addr();
            let join = tokio::spawn(dht.run());
            self.instances.push(Instance {
                ipv4,
                handle,
                join,
                bound,
            });
        }
        info!(id = %self.id(), instances = self.instances.len(), "node started");
        Ok(())
    }

    /// Stop every instance, waiting for persistence to finish.
    pub async fn stop(&mut self) {
        for instance in self.instances.drain(..) {
            let _ = instance.handle.commands.send(Command::Shutdown).await;
            let _ = instance.join.await;
        }
        info!(id = %self.id(), "node stopped");
    }

    /// Best connectivity across instances.
    pub fn connection_status(&self) -> ConnectionStatus {
        let mut best = ConnectionStatus::Disconnected;
        for instance in &self.instances {
            let status = *instance.handle.status.borrow();
            best = match (best, status) {
                (_, ConnectionStatus::Connected) | (ConnectionStatus::Connected, _) => {
                    ConnectionStatus::Connected
                }
                (_, ConnectionStatus::Connecting) | (ConnectionStatus::Connecting, _) => {
                    ConnectionStatus::Connecting
                }
                _ => ConnectionStatus::Disconnected,
            };
        }
        best
    }

    /// Inject additional bootstrap contacts and re-run the bootstrap
    /// sequence.
    pub async fn bootstrap(&self, nodes: Vec<NodeInfo>) -> Result<(), DhtError> {
        if self.instances.is_empty() {
            return Err(DhtError::Generic("node is not running".into()));
        }
        for instance in &self.instances {
            let subset: Vec<NodeInfo> = nodes
                .iter()
                .filter(|n| n.is_ipv4() == instance.ipv4)
                .cloned()
                .collect();
            if subset.is_empty() {
                continue;
            }
            instance
                .handle
                .commands
                .send(Command::Bootstrap { nodes: subset })
                .await
                .map_err(|_| DhtError::Generic("instance stopped".into()))?;
        }
        Ok(())
    }

    /// Iterative node lookup; returns up to K nodes closest to `target`
    /// across both families.
    pub async fn find_node(&self, target: Id) -> Result<Vec<NodeInfo>, DhtError> {
        let mut receivers = Vec::new();
        for instance in &self.instances {
            let (tx, rx) = oneshot::channel();
            if instance
                .handle
                .commands
                .send(Command::FindNode { target, resp: tx })
                .await
                .is_ok()
            {
                receivers.push(rx);
            }
        }
        let mut merged: Vec<NodeInfo> = Vec::new();
        for rx in receivers {
            if let Ok(nodes) = rx.await {
                for node in nodes {
                    if !merged.iter().any(|n| n == &node) {
                        merged.push(node);
                    }
                }
            }
        }
        merged.sort_by(|a, b| target.three_way_compare(a.id(), b.id()));
        merged.truncate(K);
        Ok(merged)
    }

    /// Find a value by id. Consults local storage and the overlay,
    /// preferring the freshest version.
    pub async fn find_value(
        &self,
        target: Id,
        expected_seq: i32,
    ) -> Result<Option<Value>, DhtError> {
        let local = self.storage.get_value(&target).await?;
        if let Some(value) = &local {
            if !value.is_mutable() {
                return Ok(local);
            }
        }

        let mut receivers = Vec::new();
        for instance in &self.instances {
            let (tx, rx) = oneshot::channel();
            if instance
                .handle
                .commands
                .send(Command::FindValue {
                    target,
                    expected_seq,
                    resp: tx,
                })
                .await
                .is_ok()
            {
                receivers.push(rx);
            }
        }

        let mut best = local;
        for rx in receivers {
            let Ok(Some(found)) = rx.await else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(current) => match found.seq().cmp(&current.seq()) {
                    Ordering::Greater => true,
                    _ => false,
                },
            };
            if better {
                best = Some(found);
            }
        }
        Ok(best)
    }

    /// Store a value locally and on the K closest nodes.
    pub async fn store_value(&self, value: Value, expected_seq: i32) -> Result<(), DhtError> {
        if !value.is_valid() {
            return Err(DhtError::InvalidValue("bad structure or signature".into()));
        }
        self.storage.put_value(value.clone(), expected_seq).await?;

        let mut receivers = Vec::new();
        for instance in &self.instances {
            let (tx, rx) = oneshot::channel();
            if instance
                .handle
                .commands
                .send(Command::StoreValue {
                    value: value.clone(),
                    expected_seq,
                    resp: tx,
                })
                .await
                .is_ok()
            {
                receivers.push(rx);
            }
        }
        collect_announce_results(receivers).await
    }

    /// Find peer announcements for a service id.
    pub async fn find_peer(
        &self,
        target: Id,
        count: u32,
        expected_seq: i32,
    ) -> Result<Vec<PeerInfo>, DhtError> {
        let mut merged = self
            .storage
            .get_peers(&target, expected_seq, count.max(1) as usize)
            .await?;

        let mut receivers = Vec::new();
        for instance in &self.instances {
            let (tx, rx) = oneshot::channel();
            if instance
                .handle
                .commands
                .send(Command::FindPeer {
                    target,
                    count,
                    expected_seq,
                    resp: tx,
                })
                .await
                .is_ok()
            {
                receivers.push(rx);
            }
        }
        for rx in receivers {
            if let Ok(peers) = rx.await {
                for peer in peers {
                    if !merged.iter().any(|p| p.node_id() == peer.node_id()) {
                        merged.push(peer);
                    }
                }
            }
        }
        merged.truncate(count.max(1) as usize);
        Ok(merged)
    }

    /// Announce a peer record locally and on the K closest nodes.
    pub async fn announce_peer(&self, peer: PeerInfo, expected_seq: i32) -> Result<(), DhtError> {
        if !peer.is_valid() {
            return Err(DhtError::InvalidPeer("bad structure or signature".into()));
        }
        self.storage.put_peer(peer.clone()).await?;

        let mut receivers = Vec::new();
        for instance in &self.instances {
            let (tx, rx) = oneshot::channel();
            if instance
                .handle
                .commands
                .send(Command::AnnouncePeer {
                    peer: peer.clone(),
                    expected_seq,
                    resp: tx,
                })
                .await
                .is_ok()
            {
                receivers.push(rx);
            }
        }
        collect_announce_results(receivers).await
    }

    /// Per-instance engine counters.
    pub async fn stats(&self) -> Vec<DhtStats> {
        let mut all = Vec::new();
        for instance in &self.instances {
            let (tx, rx) = oneshot::channel();
            if instance
                .handle
                .commands
                .send(Command::Stats { resp: tx })
                .await
                .is_ok()
            {
                if let Ok(stats) = rx.await {
                    all.push(stats);
                }
            }
        }
        all
    }
}

/// An announce succeeds when any instance managed to place the record.
async fn collect_announce_results(
    receivers: Vec<oneshot::Receiver<Result<(), DhtError>>>,
) -> Result<(), DhtError> {
    if receivers.is_empty() {
        return Err(DhtError::Generic("node is not running".into()));
    }
    let mut first_error = None;
    for rx in receivers {
        match rx.await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => first_error = Some(first_error.unwrap_or(e)),
            Err(_) => {
                first_error =
                    Some(first_error.unwrap_or(DhtError::Generic("announce canceled".into())))
            }
        }
    }
    Err(first_error.unwrap_or_else(|| DhtError::Generic("announce failed".into())))
}
