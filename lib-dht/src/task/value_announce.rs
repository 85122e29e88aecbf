//! STORE_VALUE fan-out against a tokened closest set.

use tokio::sync::oneshot;
use tracing::debug;

use lib_core::{DhtError, Id, NodeInfo, Value};

use crate::constants::K;
use crate::messages::{Body, ErrorBody, Message, StoreValueRequest};
use crate::rpc::RpcCall;

use super::{Task, TaskContext};

/// Stores a value at each node of a converged closest set, using the write
/// tokens the preceding lookup collected. Tolerates up to ⌊K/2⌋ failures.
pub struct ValueAnnounceTask {
    name: String,
    value: Value,
    expected_seq: i32,
    targets: Vec<(NodeInfo, u32)>,
    next_target: usize,
    successes: usize,
    failures: usize,
    /// First specific error seen, reported when the announce fails.
    first_error: Option<DhtError>,
    result: Option<oneshot::Sender<Result<(), DhtError>>>,
}

impl ValueAnnounceTask {
    pub fn new(
        value: Value,
        expected_seq: i32,
        targets: Vec<(NodeInfo, u32)>,
        result: oneshot::Sender<Result<(), DhtError>>,
    ) -> Self {
        ValueAnnounceTask {
            name: format!("value-announce:{:.8}", value.id().to_hex()),
            value,
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

impl Task for ValueAnnounceTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> Option<&Id> {
        None
    }

    fn iterate(&mut self, ctx: &mut TaskContext<'_>) {
        while self.next_target < self.targets.len() {
            let (node, token) = self.targets[self.next_target].clone();
            let body = Body::StoreValueRequest(StoreValueRequest {
                token,
                expected_seq: self.expected_seq,
                value: self.value.clone(),
            });
            if !ctx.send_call(node, body) {
                break;
            }
            self.next_target += 1;
        }
    }

    fn on_response(&mut self, _ctx: &mut TaskContext<'_>, _call: &RpcCall, message: &Message) {
        if matches!(message.body, Body::StoreValueResponse) {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }

    fn on_timeout(&mut self, _ctx: &mut TaskContext<'_>, call: &RpcCall) {
        debug!(node = %call.target_id(), "store timed out");
        self.failures += 1;
    }

    fn on_error(&mut self, _ctx: &mut TaskContext<'_>, call: &RpcCall, error: &ErrorBody) {
        debug!(node = %call.target_id(), code = error.code, "store rejected");
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
            return; // dropping the sender signals cancellation
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
