//! Iterative FIND_NODE lookup, optionally collecting write tokens and
//! optionally hunting one exact id.

use tokio::sync::oneshot;
use tracing::debug;

use lib_core::{Id, NodeInfo, PeerInfo, Value};

use crate::messages::{Body, FindNodeRequest, Message};
use crate::rpc::RpcCall;

use super::lookup::LookupState;
use super::peer_announce::PeerAnnounceTask;
use super::value_announce::ValueAnnounceTask;
use super::{Priority, Task, TaskContext};

/// What to do with the closest set once the lookup converges.
pub enum AnnounceIntent {
    Value {
        value: Value,
        expected_seq: i32,
        result: oneshot::Sender<Result<(), lib_core::DhtError>>,
    },
    Peer {
        peer: PeerInfo,
        expected_seq: i32,
        result: oneshot::Sender<Result<(), lib_core::DhtError>>,
    },
}

/// Node lookup task; the backbone of bootstrap, announces and bucket
/// filling.
pub struct NodeLookupTask {
    name: String,
    state: LookupState,
    want_token: bool,
    want_target: bool,
    found_target: Option<NodeInfo>,
    bootstrap_candidates: Vec<NodeInfo>,
    announce: Option<AnnounceIntent>,
    result: Option<oneshot::Sender<Vec<NodeInfo>>>,
    followups: Vec<(Box<dyn Task>, Priority)>,
}

impl NodeLookupTask {
    pub fn new(target: Id) -> Self {
        NodeLookupTask {
            name: format!("node-lookup:{:.8}", target.to_hex()),
            state: LookupState::new(target),
            want_token: false,
            want_target: false,
            found_target: None,
            bootstrap_candidates: Vec::new(),
            announce: None,
            result: None,
            followups: Vec::new(),
        }
    }

    /// Collect write tokens from responses (lookup-for-announce).
    pub fn want_token(mut self) -> Self {
        self.want_token = true;
        self
    }

    /// Stop as soon as the exact target id answers.
    pub fn want_target(mut self) -> Self {
        self.want_target = true;
        self
    }

    /// Seed additional candidates, e.g. configured bootstrap nodes.
    pub fn inject_candidates(mut self, nodes: Vec<NodeInfo>) -> Self {
        self.bootstrap_candidates = nodes;
        self
    }

    /// Deliver the converged closest set through `tx`.
    pub fn with_result(mut self, tx: oneshot::Sender<Vec<NodeInfo>>) -> Self {
        self.result = Some(tx);
        self
    }

    /// Schedule an announce against the closest set on completion.
    pub fn with_announce(mut self, intent: AnnounceIntent) -> Self {
        self.announce = Some(intent);
        self.want_token = true;
        self
    }

    pub fn closest(&self) -> &[NodeInfo] {
        self.state.closest.entries()
    }
}

impl Task for NodeLookupTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> Option<&Id> {
        Some(&self.state.target)
    }

    fn iterate(&mut self, ctx: &mut TaskContext<'_>) {
        self.state.seed(ctx);
        if !self.bootstrap_candidates.is_empty() {
            let injected = std::mem::take(&mut self.bootstrap_candidates);
            self.state.add_learned(ctx, injected);
        }
        if self.state.is_done() {
            return;
        }
        self.state.iterations += 1;

        let target = self.state.target;
        for node in self.state.take_batch(ctx.budget()) {
            ctx.send_call(
                node,
                Body::FindNodeRequest(FindNodeRequest {
                    target,
                    want4: ctx.is_ipv4,
                    want6: !ctx.is_ipv4,
                    want_token: self.want_token,
                }),
            );
        }
    }

    fn on_response(&mut self, ctx: &mut TaskContext<'_>, call: &RpcCall, message: &Message) {
        let Body::FindNodeResponse(response) = &message.body else {
            return;
        };
        self.state
            .candidates
            .on_replied(call.target_id(), response.token);
        self.state.closest.insert(call.target().clone());

        let learned = if ctx.is_ipv4 {
            response.nodes4.clone()
        } else {
            response.nodes6.clone()
        };
        if self.want_target {
            if let Some(hit) = learned.iter().find(|n| n.id() == &self.state.target) {
                debug!(target = %self.state.target, "exact target found");
                self.found_target = Some(hit.clone());
                self.state.found = true;
            }
        }
        self.state.add_learned(ctx, learned);
    }

    fn on_timeout(&mut self, _ctx: &mut TaskContext<'_>, call: &RpcCall) {
        self.state.candidates.on_call_failed(call.target_id());
    }

    fn is_done(&self) -> bool {
        self.state.is_done()
    }

    fn on_finish(&mut self, canceled: bool) {
        let closest: Vec<NodeInfo> = self.state.closest.entries().to_vec();
        if let Some(tx) = self.result.take() {
            let _ = tx.send(closest.clone());
        }
        if canceled {
            // Dropping the announce sender tells the waiter we gave up.
            self.announce = None;
            return;
        }

        if let Some(intent) = self.announce.take() {
            let targets: Vec<(NodeInfo, u32)> = self
                .state
                .candidates
                .with_tokens()
                .filter(|(node, _)| closest.iter().any(|c| c.id() == node.id()))
                .map(|(node, token)| (node.clone(), token))
                .collect();
            if targets.is_empty() {
                let err = lib_core::DhtError::Generic(
                    "no tokened nodes to announce against".into(),
                );
                match intent {
                    AnnounceIntent::Value { result, .. } => {
                        let _ = result.send(Err(err));
                    }
                    AnnounceIntent::Peer { result, .. } => {
                        let _ = result.send(Err(err));
                    }
                }
                return;
            }
            match intent {
                AnnounceIntent::Value {
                    value,
                    expected_seq,
                    result,
                } => {
                    self.followups.push((
                        Box::new(ValueAnnounceTask::new(value, expected_seq, targets, result)),
                        Priority::High,
                    ));
                }
                AnnounceIntent::Peer {
                    peer,
                    expected_seq,
                    result,
                } => {
                    self.followups.push((
                        Box::new(PeerAnnounceTask::new(peer, expected_seq, targets, result)),
                        Priority::High,
                    ));
                }
            }
        }
    }

    fn take_followups(&mut self) -> Vec<(Box<dyn Task>, Priority)> {
        std::mem::take(&mut self.followups)
    }
}
