//! Iterative FIND_PEER lookup.

use tokio::sync::oneshot;
use tracing::debug;

use lib_core::{Id, PeerInfo};

use crate::messages::{Body, FindPeerRequest, Message};
use crate::rpc::RpcCall;

use super::lookup::LookupState;
use super::{Task, TaskContext};

/// Finds peer announcements for a service id. The first validated,
/// non-empty batch completes the lookup.
pub struct PeerLookupTask {
    name: String,
    state: LookupState,
    expected_seq: i32,
    count: u32,
    peers: Vec<PeerInfo>,
    result: Option<oneshot::Sender<Vec<PeerInfo>>>,
}

impl PeerLookupTask {
    pub fn new(target: Id, expected_seq: i32, count: u32) -> Self {
        PeerLookupTask {
            name: format!("peer-lookup:{:.8}", target.to_hex()),
            state: LookupState::new(target),
            expected_seq,
            count,
            peers: Vec::new(),
            result: None,
        }
    }

    pub fn with_result(mut self, tx: oneshot::Sender<Vec<PeerInfo>>) -> Self {
        self.result = Some(tx);
        self
    }
}

impl Task for PeerLookupTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> Option<&Id> {
        Some(&self.state.target)
    }

    fn iterate(&mut self, ctx: &mut TaskContext<'_>) {
        self.state.seed(ctx);
        if self.state.is_done() {
            return;
        }
        self.state.iterations += 1;

        let target = self.state.target;
        let seq = self.expected_seq;
        let count = self.count;
        for node in self.state.take_batch(ctx.budget()) {
            ctx.send_call(
                node,
                Body::FindPeerRequest(FindPeerRequest {
                    target,
                    want4: ctx.is_ipv4,
                    want6: !ctx.is_ipv4,
                    seq,
                    count,
                }),
            );
        }
    }

    fn on_response(&mut self, ctx: &mut TaskContext<'_>, call: &RpcCall, message: &Message) {
        let Body::FindPeerResponse(response) = &message.body else {
            return;
        };
        self.state.candidates.on_replied(call.target_id(), None);
        self.state.closest.insert(call.target().clone());

        for peer in &response.peers {
            if peer.peer_id() != &self.state.target || !peer.is_valid() {
                debug!(from = %call.target_id(), "dropping invalid peer record");
                continue;
            }
            if self.peers.iter().any(|p| p.node_id() == peer.node_id()) {
                continue;
            }
            self.peers.push(peer.clone());
        }
        if !self.peers.is_empty() {
            self.state.found = true;
            return;
        }

        let learned = if ctx.is_ipv4 {
            response.nodes4.clone()
        } else {
            response.nodes6.clone()
        };
        self.state.add_learned(ctx, learned);
    }

    fn on_timeout(&mut self, _ctx: &mut TaskContext<'_>, call: &RpcCall) {
        self.state.candidates.on_call_failed(call.target_id());
    }

    fn is_done(&self) -> bool {
        self.state.is_done()
    }

    fn on_finish(&mut self, _canceled: bool) {
        if let Some(tx) = self.result.take() {
            let mut peers = std::mem::take(&mut self.peers);
            peers.truncate(self.count.max(1) as usize);
            let _ = tx.send(peers);
        }
    }
}
