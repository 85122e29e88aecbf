//! Cooperative task scheduler and the lookup/announce state machines.

pub mod candidate;
pub mod closest_set;
pub mod lookup;
pub mod manager;
pub mod node_lookup;
pub mod peer_announce;
pub mod peer_lookup;
pub mod ping_refresh;
pub mod value_announce;
pub mod value_lookup;

use lib_core::{Id, NodeInfo};

use crate::messages::{Body, ErrorBody, Message};
use crate::routing::RoutingTable;
use crate::rpc::{RpcCall, TaskId};

pub use closest_set::ClosestSet;
pub use manager::{OutboundRequest, TaskManager};
pub use node_lookup::{AnnounceIntent, NodeLookupTask};
pub use peer_announce::PeerAnnounceTask;
pub use peer_lookup::PeerLookupTask;
pub use ping_refresh::PingRefreshTask;
pub use value_announce::ValueAnnounceTask;
pub use value_lookup::ValueLookupTask;

/// Scheduler-visible task lifecycle. Transitions are monotonic;
/// `Completed` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Initial,
    Queued,
    Running,
    Completed,
    Canceled,
}

/// Queue lane for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

/// Everything a task may touch while iterating.
///
/// Requests are collected rather than sent inline; the orchestrator drains
/// them to the RPC server after the iteration returns.
pub struct TaskContext<'a> {
    pub routing: &'a RoutingTable,
    pub local_id: Id,
    /// Unix milliseconds, for routing-table queries.
    pub now: u64,
    /// Whether this DHT instance speaks IPv4 (else IPv6).
    pub is_ipv4: bool,
    budget: usize,
    outbound: Vec<(NodeInfo, Body)>,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        routing: &'a RoutingTable,
        local_id: Id,
        now: u64,
        is_ipv4: bool,
        budget: usize,
    ) -> Self {
        TaskContext {
            routing,
            local_id,
            now,
            is_ipv4,
            budget,
            outbound: Vec::new(),
        }
    }

    /// Remaining requests this iteration may dispatch.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Queue one request to `target`; silently ignored once the budget is
    /// exhausted (iterations are idempotent, the next pass retries).
    pub fn send_call(&mut self, target: NodeInfo, body: Body) -> bool {
        if self.budget == 0 {
            return false;
        }
        self.budget -= 1;
        self.outbound.push((target, body));
        true
    }

    fn take_outbound(&mut self) -> Vec<(NodeInfo, Body)> {
        std::mem::take(&mut self.outbound)
    }
}

/// A cooperative task: lookup, announce or maintenance ping.
///
/// All methods run on the DHT event loop. `iterate` must be idempotent -
/// it is invoked whenever progress is possible and dispatches at most the
/// context budget of new calls. Completion hooks fire exactly once.
pub trait Task: Send {
    /// Short human-readable name for logs.
    fn name(&self) -> &str;

    /// The id this task revolves around, when there is one.
    fn target(&self) -> Option<&Id>;

    /// Dispatch work; called when the task starts and after every event.
    fn iterate(&mut self, ctx: &mut TaskContext<'_>);

    /// A response to one of this task's calls arrived and validated.
    fn on_response(&mut self, ctx: &mut TaskContext<'_>, call: &RpcCall, message: &Message);

    /// A call passed its stall deadline (not terminal).
    fn on_stalled(&mut self, _ctx: &mut TaskContext<'_>, _call: &RpcCall) {}

    /// A call timed out for good.
    fn on_timeout(&mut self, ctx: &mut TaskContext<'_>, call: &RpcCall);

    /// The peer answered with an error message.
    fn on_error(&mut self, ctx: &mut TaskContext<'_>, call: &RpcCall, error: &ErrorBody) {
        // Most tasks treat a remote error like an unreachable peer.
        let _ = error;
        self.on_timeout(ctx, call);
    }

    /// Whether the task has nothing further to dispatch.
    fn is_done(&self) -> bool;

    /// Terminal hook; fires exactly once with `canceled` set accordingly.
    fn on_finish(&mut self, canceled: bool);

    /// Follow-up tasks to enqueue after successful completion.
    fn take_followups(&mut self) -> Vec<(Box<dyn Task>, Priority)> {
        Vec::new()
    }
}

/// Call-completion events routed from the RPC layer into the scheduler.
#[derive(Debug)]
pub enum TaskCallEvent {
    Response(TaskId, RpcCall, Message),
    Stalled(TaskId),
    Timeout(TaskId, RpcCall),
    Error(TaskId, RpcCall, ErrorBody),
}
