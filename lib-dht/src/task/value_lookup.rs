//! Iterative FIND_VALUE lookup.

use tokio::sync::oneshot;
use tracing::debug;

use lib_core::{Id, Value};

use crate::messages::{Body, FindValueRequest, Message};
use crate::rpc::RpcCall;

use super::lookup::LookupState;
use super::{Task, TaskContext};

/// Finds a value by id. An immutable hit ends the lookup immediately; for
/// mutable values the lookup keeps converging and returns the highest
/// sequence number observed.
pub struct ValueLookupTask {
    name: String,
    state: LookupState,
    expected_seq: i32,
    best: Option<Value>,
    result: Option<oneshot::Sender<Option<Value>>>,
}

impl ValueLookupTask {
    pub fn new(target: Id, expected_seq: i32) -> Self {
        ValueLookupTask {
            name: format!("value-lookup:{:.8}", target.to_hex()),
            state: LookupState::new(target),
            expected_seq,
            best: None,
            result: None,
        }
    }

    pub fn with_result(mut self, tx: oneshot::Sender<Option<Value>>) -> Self {
        self.result = Some(tx);
        self
    }

    fn accept(&mut self, value: Value) {
        if !value.validate_id(&self.state.target) || !value.is_valid() {
            debug!(target = %self.state.target, "dropping invalid value from response");
            return;
        }
        if self.expected_seq >= 0 && value.is_mutable() && value.seq() < self.expected_seq {
            return;
        }
        if !value.is_mutable() {
            // Immutable values cannot be improved on.
            self.best = Some(value);
            self.state.found = true;
            return;
        }
        let better = match &self.best {
            Some(current) => value.seq() > current.seq(),
            None => true,
        };
        if better {
            self.best = Some(value);
        }
    }
}

impl Task for ValueLookupTask {
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
        for node in self.state.take_batch(ctx.budget()) {
            ctx.send_call(
                node,
                Body::FindValueRequest(FindValueRequest {
                    target,
                    want4: ctx.is_ipv4,
                    want6: !ctx.is_ipv4,
                    seq,
                }),
            );
        }
    }

    fn on_response(&mut self, ctx: &mut TaskContext<'_>, call: &RpcCall, message: &Message) {
        let Body::FindValueResponse(response) = &message.body else {
            return;
        };
        self.state.candidates.on_replied(call.target_id(), None);
        self.state.closest.insert(call.target().clone());

        if let Some(value) = &response.value {
            self.accept(value.clone());
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
            let _ = tx.send(self.best.take());
        }
    }
}
