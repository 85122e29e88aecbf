//! Maintenance pings against a bucket's entries.

use lib_core::{Id, NodeInfo};

use crate::messages::{Body, Message};
use crate::rpc::RpcCall;

use super::{Task, TaskContext};

/// Pings a fixed set of nodes, typically the entries of one bucket that
/// went quiet. Timeouts are handled by the routing-table update path; the
/// task itself only tracks completion.
pub struct PingRefreshTask {
    name: String,
    targets: Vec<NodeInfo>,
    next_target: usize,
    resolved: usize,
}

impl PingRefreshTask {
    pub fn new(targets: Vec<NodeInfo>) -> Self {
        PingRefreshTask {
            name: format!("ping-refresh:{}", targets.len()),
            targets,
            next_target: 0,
            resolved: 0,
        }
    }
}

impl Task for PingRefreshTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> Option<&Id> {
        None
    }

    fn iterate(&mut self, ctx: &mut TaskContext<'_>) {
        while self.next_target < self.targets.len() {
            let node = self.targets[self.next_target].clone();
            if !ctx.send_call(node, Body::PingRequest) {
                break;
            }
            self.next_target += 1;
        }
    }

    fn on_response(&mut self, _ctx: &mut TaskContext<'_>, _call: &RpcCall, _message: &Message) {
        self.resolved += 1;
    }

    fn on_timeout(&mut self, _ctx: &mut TaskContext<'_>, _call: &RpcCall) {
        self.resolved += 1;
    }

    fn is_done(&self) -> bool {
        self.next_target >= self.targets.len() && self.resolved >= self.targets.len()
    }

    fn on_finish(&mut self, _canceled: bool) {}
}
