//! The DHT orchestrator: one cooperative event loop owning the routing
//! table, the RPC server, the task scheduler and the security machinery
//! for a single address family.
//!
//! The loop multiplexes three sources: inbound datagrams, the command
//! channel from the node facade, and the earliest pending deadline
//! (call timeouts, delayed sends, periodic timers). Between awaits the
//! engine state is exclusively owned, so none of it is locked.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use lib_core::{
    is_any_unicast, is_global_unicast, DhtError, Id, KeyPair, NodeInfo, PeerInfo, Value,
};
use lib_storage::DataStorage;

use crate::config::DhtConfig;
use crate::constants::{
    BOOTSTRAP_IF_OLDER_THAN, BOOTSTRAP_MIN_ENTRIES, DHT_UPDATE_INTERVAL, K, MAX_ENTRIES,
    PERSIST_INTERVAL, RANDOM_LOOKUP_INTERVAL, RANDOM_PING_INTERVAL, STORAGE_RECORD_TTL,
    SUSPICIOUS_PURGE_INTERVAL,
};
use crate::messages::{
    Body, ErrorBody, FindNodeResponse, FindPeerResponse, FindValueResponse, Message,
};
use crate::routing::{KBucketEntry, RoutingTable};
use crate::rpc::{CallEvent, CallMatch, RpcCall, RpcServer, RpcStats};
use crate::security::{Blacklist, Observation, SuspiciousNodeTracker, TokenManager};
use crate::task::{
    AnnounceIntent, NodeLookupTask, PeerLookupTask, PingRefreshTask, Priority, TaskCallEvent,
    TaskManager, ValueLookupTask,
};

/// Connectivity of one DHT instance, as observed by the node facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Counters exposed for the metrics log line.
#[derive(Debug, Clone)]
pub struct DhtStats {
    pub entries: usize,
    pub buckets: usize,
    pub running_tasks: usize,
    pub queued_tasks: usize,
    pub rpc: RpcStats,
    pub status: ConnectionStatus,
}

/// Commands accepted by the event loop.
pub enum Command {
    FindNode {
        target: Id,
        resp: oneshot::Sender<Vec<NodeInfo>>,
    },
    FindValue {
        target: Id,
        expected_seq: i32,
        resp: oneshot::Sender<Option<Value>>,
    },
    StoreValue {
        value: Value,
        expected_seq: i32,
        resp: oneshot::Sender<Result<(), DhtError>>,
    },
    FindPeer {
        target: Id,
        count: u32,
        expected_seq: i32,
        resp: oneshot::Sender<Vec<PeerInfo>>,
    },
    AnnouncePeer {
        peer: PeerInfo,
        expected_seq: i32,
        resp: oneshot::Sender<Result<(), DhtError>>,
    },
    Bootstrap {
        nodes: Vec<NodeInfo>,
    },
    Stats {
        resp: oneshot::Sender<DhtStats>,
    },
    Shutdown,
}

/// Handle held by the node facade.
#[derive(Clone)]
pub struct DhtHandle {
    pub commands: mpsc::Sender<Command>,
    pub status: watch::Receiver<ConnectionStatus>,
}

/// Unix time in milliseconds; the routing layer's clock.
pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct PeriodicTimers {
    next_update: Instant,
    next_random_lookup: Instant,
    next_random_ping: Instant,
    next_suspicious_purge: Instant,
    next_persist: Instant,
}

impl PeriodicTimers {
    fn new(now: Instant) -> Self {
        PeriodicTimers {
            next_update: now + DHT_UPDATE_INTERVAL,
            next_random_lookup: now + RANDOM_LOOKUP_INTERVAL,
            next_random_ping: now + RANDOM_PING_INTERVAL,
            next_suspicious_purge: now + SUSPICIOUS_PURGE_INTERVAL,
            next_persist: now + PERSIST_INTERVAL,
        }
    }

    fn next(&self) -> Instant {
        self.next_update
            .min(self.next_random_lookup)
            .min(self.next_random_ping)
            .min(self.next_suspicious_purge)
            .min(self.next_persist)
    }
}

/// One DHT instance bound to one address family.
pub struct Dht {
    ipv4: bool,
    config: Arc<DhtConfig>,
    local_id: Id,
    routing: RoutingTable,
    server: RpcServer,
    tasks: TaskManager,
    tokens: TokenManager,
    suspicious: Option<SuspiciousNodeTracker>,
    blacklist: Arc<Blacklist>,
    storage: Arc<dyn DataStorage>,
    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,
    commands_rx: Option<mpsc::Receiver<Command>>,
    bootstrap_nodes: Vec<NodeInfo>,
    bootstrap_ids: Vec<Id>,
    last_bootstrap: Option<Instant>,
    persist_path: PathBuf,
    timers: PeriodicTimers,
}

impl Dht {
    /// Build an instance: bind the socket, load the persisted routing
    /// table and wire up the command/status channels.
    pub async fn new(
        ipv4: bool,
        bind: SocketAddr,
        keypair: &KeyPair,
        config: Arc<DhtConfig>,
        storage: Arc<dyn DataStorage>,
        blacklist: Arc<Blacklist>,
    ) -> anyhow::Result<(Self, DhtHandle)> {
        let local_id = keypair.public_id();
        let server = RpcServer::bind(bind, local_id, config.enable_spam_throttling).await?;

        let family = if ipv4 { "4" } else { "6" };
        let persist_path = config.data_dir.join(format!("routing{}.cbor", family));
        let routing = RoutingTable::load(&persist_path, local_id, unix_ms());

        let suspicious = config
            .enable_suspicious_node_detector
            .then(SuspiciousNodeTracker::default);
        let bootstrap_nodes = config.bootstrap_contacts(ipv4);
        let bootstrap_ids: Vec<Id> = bootstrap_nodes.iter().map(|n| *n.id()).collect();

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (commands_tx, commands_rx) = mpsc::channel(64);

        info!(
            %bind,
            id = %local_id,
            entries = routing.num_entries(),
            "dht instance ready"
        );

        let dht = Dht {
            ipv4,
            config,
            local_id,
            routing,
            server,
            tasks: TaskManager::new(),
            tokens: TokenManager::new(),
            suspicious,
            blacklist,
            storage,
            status: ConnectionStatus::Disconnected,
            status_tx,
            commands_rx: Some(commands_rx),
            bootstrap_nodes,
            bootstrap_ids,
            last_bootstrap: None,
            persist_path,
            timers: PeriodicTimers::new(Instant::now()),
        };
        Ok((
            dht,
            DhtHandle {
                commands: commands_tx,
                status: status_rx,
            },
        ))
    }

    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.server.bound_addr()
    }

    /// Run the event loop until `Command::Shutdown` or channel closure.
    pub async fn run(mut self) {
        let socket = self.server.socket();
        let mut commands = self.commands_rx.take().expect("run called once");
        let mut buf = vec![0u8; 2048];

        self.start().await;

        loop {
            let wakeup = self.next_wakeup();
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        let datagram = buf[..len].to_vec();
                        self.on_datagram(&datagram, from).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "socket receive failed");
                    }
                },
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.on_command(command).await,
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wakeup)) => {
                    self.on_timer().await;
                }
            }
        }

        self.shutdown().await;
    }

    // ------------------------------------------------------------ startup

    async fn start(&mut self) {
        // Re-verify whatever survived on disk.
        for bucket in self.routing.buckets() {
            if bucket.is_empty() {
                continue;
            }
            let targets: Vec<NodeInfo> =
                bucket.entries().iter().map(|e| e.node().clone()).collect();
            self.tasks
                .add(Box::new(PingRefreshTask::new(targets)), Priority::Low);
        }
        self.bootstrap().await;
        self.dispatch_tasks().await;
    }

    async fn bootstrap(&mut self) {
        self.last_bootstrap = Some(Instant::now());
        if self.status == ConnectionStatus::Disconnected {
            self.set_status(ConnectionStatus::Connecting);
        }

        // Seed the table with a cheap FIND_NODE(random) at every entry
        // point, then converge on our own neighborhood.
        for node in self.bootstrap_nodes.clone() {
            let body = Body::FindNodeRequest(crate::messages::FindNodeRequest {
                target: Id::random(),
                want4: self.ipv4,
                want6: !self.ipv4,
                want_token: false,
            });
            self.send_direct_call(node, body).await;
        }

        let fill_home = NodeLookupTask::new(self.local_id)
            .inject_candidates(self.bootstrap_nodes.clone());
        self.tasks.add(Box::new(fill_home), Priority::Low);
        self.fill_buckets();
    }

    /// Lookup a random id inside every non-full bucket.
    fn fill_buckets(&mut self) {
        let targets: Vec<Id> = self
            .routing
            .buckets()
            .iter()
            .filter(|b| !b.is_empty() && b.len() < MAX_ENTRIES)
            .map(|b| b.prefix().create_random_id())
            .collect();
        for target in targets {
            self.tasks
                .add(Box::new(NodeLookupTask::new(target)), Priority::Low);
        }
    }

    async fn shutdown(&mut self) {
        info!(id = %self.local_id, "dht shutting down");
        self.tasks.cancel_all();
        let abandoned = self.server.drain_calls();
        trace!(calls = abandoned.len(), "abandoned in-flight calls");
        if let Err(e) = self.routing.save(&self.persist_path) {
            warn!(error = %e, "routing table not persisted");
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    // ------------------------------------------------------------- wakeups

    fn next_wakeup(&self) -> Instant {
        let timers = self.timers.next();
        match self.server.next_wakeup() {
            Some(server) => server.min(timers),
            None => timers,
        }
    }

    async fn on_timer(&mut self) {
        let events = self.server.process_due().await;
        self.process_call_events(events).await;

        let now = Instant::now();
        if now >= self.timers.next_update {
            self.timers.next_update = now + DHT_UPDATE_INTERVAL;
            self.on_update_tick().await;
        }
        if now >= self.timers.next_random_lookup {
            self.timers.next_random_lookup = now + RANDOM_LOOKUP_INTERVAL;
            if self.status == ConnectionStatus::Connected {
                self.tasks
                    .add(Box::new(NodeLookupTask::new(Id::random())), Priority::Low);
            }
        }
        if now >= self.timers.next_random_ping {
            self.timers.next_random_ping = now + RANDOM_PING_INTERVAL;
            self.random_ping().await;
        }
        if now >= self.timers.next_suspicious_purge {
            self.timers.next_suspicious_purge = now + SUSPICIOUS_PURGE_INTERVAL;
            if let Some(tracker) = &mut self.suspicious {
                tracker.purge();
            }
        }
        if now >= self.timers.next_persist {
            self.timers.next_persist = now + PERSIST_INTERVAL;
            if let Err(e) = self.routing.save(&self.persist_path) {
                warn!(error = %e, "periodic persistence failed");
            }
            match self.storage.purge_expired(STORAGE_RECORD_TTL.as_millis() as u64).await {
                Ok(0) => {}
                Ok(n) => debug!(records = n, "expired storage records purged"),
                Err(e) => warn!(error = %e, "storage purge failed"),
            }
            if self.config.enable_metrics {
                let stats = self.stats();
                info!(
                    entries = stats.entries,
                    buckets = stats.buckets,
                    tasks = stats.running_tasks,
                    sent = stats.rpc.requests_sent,
                    received = stats.rpc.responses_received,
                    timeouts = stats.rpc.timeouts,
                    "dht metrics"
                );
            }
        }

        self.dispatch_tasks().await;
    }

    async fn on_update_tick(&mut self) {
        let now_ms = unix_ms();
        let mut refresh_prefixes = Vec::new();
        self.routing.maintenance(
            now_ms,
            &self.bootstrap_ids,
            |prefix| refresh_prefixes.push(*prefix),
            |node| trace!(id = %node.id(), "dropped from routing table"),
        );
        for prefix in refresh_prefixes {
            let targets: Vec<NodeInfo> = self
                .routing
                .bucket_of(&prefix.first_id())
                .entries()
                .iter()
                .filter(|e| e.needs_ping(now_ms))
                .map(|e| e.node().clone())
                .collect();
            if !targets.is_empty() {
                self.tasks
                    .add(Box::new(PingRefreshTask::new(targets)), Priority::Low);
            }
        }

        self.server.decay_throttles();

        let stale = self
            .last_bootstrap
            .map(|at| at.elapsed() > BOOTSTRAP_IF_OLDER_THAN)
            .unwrap_or(true);
        if self.routing.num_entries() < BOOTSTRAP_MIN_ENTRIES || stale {
            self.bootstrap().await;
        }
        self.update_connection_status();
    }

    async fn random_ping(&mut self) {
        if self.server.in_flight() > 0 {
            return;
        }
        let Some(node) = self.routing.random_entry().map(|e| e.node().clone()) else {
            return;
        };
        self.send_direct_call(node, Body::PingRequest).await;
    }

    // ----------------------------------------------------------- datagrams

    async fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let host = from.ip().to_string();
        if self.blacklist.is_host_banned(&host) {
            self.server.count_dropped();
            return;
        }
        if let Some(tracker) = &self.suspicious {
            if tracker.is_banned(&host) {
                self.server.count_dropped();
                return;
            }
        }
        if self.server.inbound_saturated(&from) {
            self.server.count_dropped();
            return;
        }

        let message = match crate::messages::codec::deserialize(datagram) {
            Ok(message) => message,
            Err(e) => {
                trace!(%from, error = %e, "malformed datagram");
                if let Some(tracker) = &mut self.suspicious {
                    tracker.observe(from, None, Observation::MalformedMessage);
                }
                self.server.count_dropped();
                return;
            }
        };

        if self.blacklist.is_banned(&message.id, &host) {
            self.server.count_dropped();
            return;
        }

        if message.is_request() {
            self.handle_request(message, from).await;
        } else {
            self.handle_response(message, from).await;
        }
        self.dispatch_tasks().await;
    }

    fn source_acceptable(&self, from: &SocketAddr) -> bool {
        if self.config.enable_developer_mode {
            is_any_unicast(&from.ip())
        } else {
            is_global_unicast(&from.ip())
        }
    }

    // ------------------------------------------------------------ requests

    async fn handle_request(&mut self, message: Message, from: SocketAddr) {
        if !self.source_acceptable(&from) {
            self.server.count_dropped();
            return;
        }

        let method = message.method();
        let reply_body = match self.build_reply(&message, from).await {
            Ok(body) => body,
            Err(error) => {
                debug!(%from, ?method, code = error.code(), "request rejected");
                Body::Error(ErrorBody::of(method, &error))
            }
        };
        let reply = Message::new(message.txid, self.local_id, reply_body);
        self.server.send_message(&reply, from).await;

        self.observe_sender(message.id, from, message.version, false, None)
            .await;
    }

    async fn build_reply(&mut self, message: &Message, from: SocketAddr) -> Result<Body, DhtError> {
        match &message.body {
            Body::PingRequest => Ok(Body::PingResponse),

            Body::FindNodeRequest(request) => {
                let mut response = FindNodeResponse::default();
                self.fill_node_lists(
                    &request.target,
                    request.want4,
                    request.want6,
                    &mut response.nodes4,
                    &mut response.nodes6,
                );
                if request.want_token {
                    response.token = Some(self.tokens.generate_token(
                        &message.id,
                        &from.ip(),
                        from.port(),
                        &request.target,
                    ));
                }
                Ok(Body::FindNodeResponse(response))
            }

            Body::FindValueRequest(request) => {
                let found = self.storage.get_value(&request.target).await?;
                let usable = found.filter(|v| {
                    !v.is_mutable() || request.seq < 0 || v.seq() >= request.seq
                });
                let mut response = FindValueResponse::default();
                match usable {
                    Some(value) => response.value = Some(value),
                    None => self.fill_node_lists(
                        &request.target,
                        request.want4,
                        request.want6,
                        &mut response.nodes4,
                        &mut response.nodes6,
                    ),
                }
                Ok(Body::FindValueResponse(response))
            }

            Body::StoreValueRequest(request) => {
                let value_id = request.value.id();
                if !self.tokens.verify_token(
                    request.token,
                    &message.id,
                    &from.ip(),
                    from.port(),
                    &value_id,
                ) {
                    return Err(DhtError::InvalidToken);
                }
                if !request.value.is_valid() {
                    return Err(DhtError::InvalidValue("bad structure or signature".into()));
                }
                self.storage
                    .put_value(request.value.clone(), request.expected_seq)
                    .await?;
                Ok(Body::StoreValueResponse)
            }

            Body::FindPeerRequest(request) => {
                let limit = request.count.clamp(1, K as u32) as usize;
                let peers = self
                    .storage
                    .get_peers(&request.target, request.seq, limit)
                    .await?;
                let mut response = FindPeerResponse::default();
                if peers.is_empty() {
                    self.fill_node_lists(
                        &request.target,
                        request.want4,
                        request.want6,
                        &mut response.nodes4,
                        &mut response.nodes6,
                    );
                } else {
                    response.peers = peers;
                }
                Ok(Body::FindPeerResponse(response))
            }

            Body::AnnouncePeerRequest(request) => {
                if !self.tokens.verify_token(
                    request.token,
                    &message.id,
                    &from.ip(),
                    from.port(),
                    request.peer.peer_id(),
                ) {
                    return Err(DhtError::InvalidToken);
                }
                if !request.peer.is_valid() {
                    return Err(DhtError::InvalidPeer("bad structure or signature".into()));
                }
                // The announcement must come through the node it names,
                // except for delegated records.
                if request.peer.node_id() != &message.id && !request.peer.is_delegated() {
                    return Err(DhtError::InvalidPeer("announced through foreign node".into()));
                }
                self.storage.put_peer(request.peer.clone()).await?;
                Ok(Body::AnnouncePeerResponse)
            }

            body => Err(DhtError::MethodUnknown(format!("{:?}", body.method()))),
        }
    }

    /// Populate the per-family closest-node lists for a reply. A single
    /// instance only knows its own family; the sibling list stays empty
    /// and the node facade's dual-stack peers fill it from their side.
    fn fill_node_lists(
        &self,
        target: &Id,
        want4: bool,
        want6: bool,
        nodes4: &mut Vec<NodeInfo>,
        nodes6: &mut Vec<NodeInfo>,
    ) {
        let now = unix_ms();
        let closest = self.routing.get_closest_nodes(target, K, now);
        if self.ipv4 && want4 {
            *nodes4 = closest;
        } else if !self.ipv4 && want6 {
            *nodes6 = closest;
        }
    }

    // ----------------------------------------------------------- responses

    async fn handle_response(&mut self, message: Message, from: SocketAddr) {
        let (matched, came_online) = self.server.take_matching_call(from, &message);
        if came_online {
            self.update_connection_status();
        }

        match matched {
            CallMatch::Unmatched | CallMatch::AddressMismatch => {
                self.server.count_dropped();
            }
            CallMatch::IdMismatch(call) => {
                if let Some(tracker) = &mut self.suspicious {
                    tracker.observe(from, Some(message.id), Observation::InconsistentId);
                }
                if let Some(task) = call.task() {
                    let error = ErrorBody {
                        method: call.method(),
                        code: lib_core::error::code::PROTOCOL,
                        message: "sender id mismatch".into(),
                    };
                    self.forward_task_event(TaskCallEvent::Error(task, call, error)).await;
                }
            }
            CallMatch::Matched(call) => {
                if message.is_error() {
                    let error = match &message.body {
                        Body::Error(e) => e.clone(),
                        _ => unreachable!("error kind carries an error body"),
                    };
                    debug!(%from, code = error.code, "peer answered with error");
                    if let Some(task) = call.task() {
                        self.forward_task_event(TaskCallEvent::Error(task, call, error))
                            .await;
                    }
                } else {
                    let rtt = call.rtt_ms();
                    self.observe_sender(message.id, from, message.version, true, rtt)
                        .await;
                    if let Some(task) = call.task() {
                        self.forward_task_event(TaskCallEvent::Response(task, call, message))
                            .await;
                    }
                }
                self.update_connection_status();
            }
        }
    }

    async fn process_call_events(&mut self, events: Vec<CallEvent>) {
        for event in events {
            match event {
                CallEvent::Stalled(txid) => {
                    if let Some(task) = self.server.call_task(txid) {
                        self.forward_task_event(TaskCallEvent::Stalled(task)).await;
                    }
                }
                CallEvent::Timeout(call) => {
                    self.routing.on_timeout(call.target_id(), unix_ms());
                    if let Some(task) = call.task() {
                        self.forward_task_event(TaskCallEvent::Timeout(task, call)).await;
                    }
                }
                CallEvent::ReachabilityChanged(reachable) => {
                    info!(reachable, "socket reachability changed");
                    self.update_connection_status();
                }
            }
        }
    }

    async fn forward_task_event(&mut self, event: TaskCallEvent) {
        let outbound =
            self.tasks
                .handle_event(event, &self.routing, &self.local_id, unix_ms(), self.ipv4);
        self.send_task_requests(outbound).await;
    }

    async fn dispatch_tasks(&mut self) {
        let outbound = self
            .tasks
            .pump(&self.routing, &self.local_id, unix_ms(), self.ipv4);
        self.send_task_requests(outbound).await;
    }

    async fn send_task_requests(&mut self, outbound: Vec<crate::task::OutboundRequest>) {
        let now_ms = unix_ms();
        for request in outbound {
            self.routing.on_request_sent(request.target.id(), now_ms);
            let call = RpcCall::new(request.target, request.body).for_task(request.task);
            self.server.send_call(call).await;
        }
    }

    async fn send_direct_call(&mut self, target: NodeInfo, body: Body) {
        self.routing.on_request_sent(target.id(), unix_ms());
        let call = RpcCall::new(target, body);
        self.server.send_call(call).await;
    }

    // ----------------------------------------------- routing-table policy

    /// Apply the routing-table update policy for a message received from
    /// `(id, from)`. `verified` is true only for validated responses.
    async fn observe_sender(
        &mut self,
        id: Id,
        from: SocketAddr,
        version: Option<[u8; 4]>,
        verified: bool,
        rtt: Option<u64>,
    ) {
        if id == self.local_id {
            return;
        }
        if !self.source_acceptable(&from) {
            return;
        }
        let now_ms = unix_ms();

        let mut flipped_from: Option<Id> = None;
        if let Some(tracker) = &mut self.suspicious {
            let previous = tracker.last_known_id(&from);
            tracker.observe(from, Some(id), Observation::InconsistentId);
            if let Some(previous) = previous {
                if previous != id {
                    flipped_from = Some(previous);
                }
            }
        }
        if let Some(previous) = flipped_from {
            // The address flipped identity: scrub both ids and leave the
            // address under observation.
            warn!(%from, old = %previous, new = %id, "node id changed, scrubbing");
            self.routing.remove(&previous, now_ms);
            self.routing.remove(&id, now_ms);
            self.scrub_bucket_of(&previous);
            return;
        }

        let node = NodeInfo::new(id, from);
        let is_new = self.routing.get_entry(&id, true).is_none();
        let bucket_full = self.routing.bucket_of(&id).is_full();

        let mut entry = if verified {
            KBucketEntry::new_verified(node.clone(), now_ms)
        } else {
            KBucketEntry::new(node.clone(), now_ms)
        };
        entry.set_version(version);
        self.routing.put(entry, now_ms);
        if let Some(rtt) = rtt {
            self.routing.on_responded(&id, rtt, now_ms);
        }

        // A brand-new unverified node in a bucket with room gets pinged so
        // it can earn a real slot.
        if is_new && !verified && !bucket_full {
            self.send_direct_call(node, Body::PingRequest).await;
        }

        self.update_connection_status();
    }

    fn scrub_bucket_of(&mut self, id: &Id) {
        let targets: Vec<NodeInfo> = self
            .routing
            .bucket_of(id)
            .entries()
            .iter()
            .map(|e| e.node().clone())
            .collect();
        if !targets.is_empty() {
            self.tasks
                .add(Box::new(PingRefreshTask::new(targets)), Priority::Low);
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            info!(?status, "connection status");
            self.status = status;
            let _ = self.status_tx.send(status);
        }
    }

    fn update_connection_status(&mut self) {
        let status = if self.routing.num_entries() > 0 {
            ConnectionStatus::Connected
        } else if self.tasks.running_count() > 0 || self.server.in_flight() > 0 {
            ConnectionStatus::Connecting
        } else {
            self.status
        };
        self.set_status(status);
    }

    fn stats(&self) -> DhtStats {
        DhtStats {
            entries: self.routing.num_entries(),
            buckets: self.routing.num_buckets(),
            running_tasks: self.tasks.running_count(),
            queued_tasks: self.tasks.queued_count(),
            rpc: self.server.stats(),
            status: self.status,
        }
    }

    // ------------------------------------------------------------ commands

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::FindNode { target, resp } => {
                let task = NodeLookupTask::new(target).want_target().with_result(resp);
                self.tasks.add(Box::new(task), Priority::High);
            }
            Command::FindValue {
                target,
                expected_seq,
                resp,
            } => {
                let task = ValueLookupTask::new(target, expected_seq).with_result(resp);
                self.tasks.add(Box::new(task), Priority::High);
            }
            Command::StoreValue {
                value,
                expected_seq,
                resp,
            } => {
                let task = NodeLookupTask::new(value.id()).with_announce(AnnounceIntent::Value {
                    value,
                    expected_seq,
                    result: resp,
                });
                self.tasks.add(Box::new(task), Priority::High);
            }
            Command::FindPeer {
                target,
                count,
                expected_seq,
                resp,
            } => {
                let task = PeerLookupTask::new(target, expected_seq, count).with_result(resp);
                self.tasks.add(Box::new(task), Priority::High);
            }
            Command::AnnouncePeer {
                peer,
                expected_seq,
                resp,
            } => {
                let task = NodeLookupTask::new(*peer.peer_id()).with_announce(
                    AnnounceIntent::Peer {
                        peer,
                        expected_seq,
                        result: resp,
                    },
                );
                self.tasks.add(Box::new(task), Priority::High);
            }
            Command::Bootstrap { nodes } => {
                self.bootstrap_nodes.extend(nodes.iter().cloned());
                self.bootstrap_ids.extend(nodes.iter().map(|n| *n.id()));
                self.bootstrap().await;
            }
            Command::Stats { resp } => {
                let _ = resp.send(self.stats());
            }
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
        self.dispatch_tasks().await;
    }
}
