//! ANNOUNCE_PEER fan-out against a tokened closest set.

use tokio::sync::oneshot;
use tracing::debug;

use lib_core::{DhtError, Id, NodeInfo, PeerInfo};

use crate::constants::K;
use crate::messages::{AnnouncePeerRequest, Body, ErrorBody, Message};
use crate::rpc::RpcCall;

use super::{Task, TaskContext};

/// Announces a peer record at each node of a converged closest set.
/// Tolerates up to ⌊K/2⌋ failures, mirroring the value announce.
pub struct PeerAnnounceTask {
    name: String,
    peer: PeerInfo,
    expected_seq: i32,
    targets: Vec<(NodeInfo, u32)>,
    next_target: usize,
    successes: usize,
    failures: usize,
    first_error: Option<DhtError>,
    result: Option<oneshot::Sender<Result<(), DhtError>>>,
}

impl PeerAnnounceTask {
    pub fn new(
        peer: PeerInfo,
        expected_seq: i32,
        targets: Vec<(NodeInfo, u32)>,
        result: oneshot::Sender<Result<(), DhtError>>,
    ) -> Self {
        PeerAnnounceTask {
            name: format!("peer-announce:{:.8}", peer.peer_id().to_hex()),
            peer,
            expected_seq,
            targets,
            next_target: 0,
            successes: 0,
            failures: 0,
            first_error: None,
            result: Some(result),
        }
    }

    fn resolved(&self) -> usize {
        self.successes + self.failures
    }
}

impl Task for PeerAnnounceTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> Option<&Id> {
        Some(self.peer.peer_id())
    }

    fn iterate(&mut self, ctx: &mut TaskContext<'_>) {
        while self.next_target < self.targets.len() {
            let (node, token) = self.targets[self.next_target].clone();
            let body = Body::AnnouncePeerRequest(AnnouncePeerRequest {
                token,
                expected_seq: self.expected_seq,
                peer: self.peer.clone(),
            });
            if !ctx.send_call(node, body) {
                break;
            }
            self.next_target += 1;
        }
    }

    fn on_response(&mut self, _ctx: &mut TaskContext<'_>, _call: &RpcCall, message: &Message) {
        if matches!(message.body, Body::AnnouncePeerResponse) {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }

    fn on_timeout(&mut self, _ctx: &mut TaskContext<'_>, call: &RpcCall) {
        debug!(node = %call.target_id(), "announce timed out");
        self.failures += 1;
    }

    fn on_error(&mut self, _ctx: &mut TaskContext<'_>, call: &RpcCall, error: &ErrorBody) {
        debug!(node = %call.target_id(), code = error.code, "announce rejected");
        if self.first_error.is_none() {
            self.first_error = Some(error.to_error());
        }
        self.failures += 1;
    }

    fn is_done(&self) -> bool {
        self.next_target >= self.targets.len() && self.resolved() >= self.targets.len()
    }

    fn on_finish(&mut self, canceled: bool) {
        let Some(tx) = self.result.take() else {
            return;
        };
        if canceled {
            return;
        }
        let tolerated = K / 2;
        if self.failures <= tolerated && self.successes > 0 {
            let _ = tx.send(Ok(()));
        } else {
            let err = self
                .first_error
                .take()
                .unwrap_or_else(|| DhtError::Generic("announce failed on too many nodes".into()));
            let _ = tx.send(Err(err));
        }
    }
}
