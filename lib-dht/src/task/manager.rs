//! The cooperative scheduler owning every lookup and announce task.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use lib_core::Id;

use crate::constants::{
    MAX_ACTIVE_TASKS, MAX_CONCURRENT_TASK_REQUESTS, MAX_CONCURRENT_TASK_REQUESTS_LOW_PRIORITY,
};
use crate::messages::Body;
use crate::routing::RoutingTable;
use crate::rpc::TaskId;

use super::{Priority, Task, TaskCallEvent, TaskContext, TaskState};

/// A request a task wants on the wire, attributed to its owner.
#[derive(Debug)]
pub struct OutboundRequest {
    pub task: TaskId,
    pub target: lib_core::NodeInfo,
    pub body: Body,
}

struct TaskEntry {
    task: Box<dyn Task>,
    state: TaskState,
    priority: Priority,
    in_flight: usize,
}

impl TaskEntry {
    fn budget(&self) -> usize {
        let cap = match self.priority {
            Priority::High => MAX_CONCURRENT_TASK_REQUESTS,
            Priority::Low => MAX_CONCURRENT_TASK_REQUESTS_LOW_PRIORITY,
        };
        cap.saturating_sub(self.in_flight)
    }
}

/// FIFO scheduler with a priority bit and hard concurrency caps.
pub struct TaskManager {
    next_id: TaskId,
    tasks: HashMap<TaskId, TaskEntry>,
    queue_high: VecDeque<TaskId>,
    queue_low: VecDeque<TaskId>,
    running: Vec<TaskId>,
    dirty: VecDeque<TaskId>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        TaskManager {
            next_id: 1,
            tasks: HashMap::new(),
            queue_high: VecDeque::new(),
            queue_low: VecDeque::new(),
            running: Vec::new(),
            dirty: VecDeque::new(),
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue_high.len() + self.queue_low.len()
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Enqueue a task; it starts running once a scheduler slot frees up.
    pub fn add(&mut self, task: Box<dyn Task>, priority: Priority) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        debug!(task = id, name = task.name(), ?priority, "task queued");
        self.tasks.insert(
            id,
            TaskEntry {
                task,
                state: TaskState::Queued,
                priority,
                in_flight: 0,
            },
        );
        match priority {
            Priority::High => self.queue_high.push_back(id),
            Priority::Low => self.queue_low.push_back(id),
        }
        id
    }

    /// Start queued tasks and iterate everything with pending progress.
    /// Returns the requests to put on the wire.
    pub fn pump(
        &mut self,
        routing: &RoutingTable,
        local_id: &Id,
        now: u64,
        is_ipv4: bool,
    ) -> Vec<OutboundRequest> {
        let mut outbound = Vec::new();
        loop {
            while self.running.len() < MAX_ACTIVE_TASKS {
                let Some(id) = self
                    .queue_high
                    .pop_front()
                    .or_else(|| self.queue_low.pop_front())
                else {
                    break;
                };
                if let Some(entry) = self.tasks.get_mut(&id) {
                    entry.state = TaskState::Running;
                    self.running.push(id);
                    self.dirty.push_back(id);
                    trace!(task = id, "task running");
                }
            }

            let Some(id) = self.dirty.pop_front() else {
                break;
            };
            let Some(entry) = self.tasks.get_mut(&id) else {
                continue;
            };
            if entry.state != TaskState::Running {
                continue;
            }

            let mut ctx = TaskContext::new(routing, *local_id, now, is_ipv4, entry.budget());
            entry.task.iterate(&mut ctx);
            let requests = ctx.take_outbound();
            entry.in_flight += requests.len();
            for (target, body) in requests {
                outbound.push(OutboundRequest {
                    task: id,
                    target,
                    body,
                });
            }

            if entry.task.is_done() && entry.in_flight == 0 {
                self.finish(id, false);
            }
        }
        outbound
    }

    /// Route a call event to its owner and pump the scheduler.
    pub fn handle_event(
        &mut self,
        event: TaskCallEvent,
        routing: &RoutingTable,
        local_id: &Id,
        now: u64,
        is_ipv4: bool,
    ) -> Vec<OutboundRequest> {
        match event {
            TaskCallEvent::Response(id, call, message) => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    if !was_decremented_at_stall(&call) {
                        entry.in_flight = entry.in_flight.saturating_sub(1);
                    }
                    let mut ctx = TaskContext::new(routing, *local_id, now, is_ipv4, 0);
                    entry.task.on_response(&mut ctx, &call, &message);
                    self.mark_dirty(id);
                }
            }
            TaskCallEvent::Stalled(id) => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    // Free the concurrency slot; the final deadline still
                    // accounts for the call itself.
                    entry.in_flight = entry.in_flight.saturating_sub(1);
                    self.mark_dirty(id);
                }
            }
            TaskCallEvent::Timeout(id, call) => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    if !was_decremented_at_stall(&call) {
                        entry.in_flight = entry.in_flight.saturating_sub(1);
                    }
                    let mut ctx = TaskContext::new(routing, *local_id, now, is_ipv4, 0);
                    entry.task.on_timeout(&mut ctx, &call);
                    self.mark_dirty(id);
                }
            }
            TaskCallEvent::Error(id, call, error) => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    if !was_decremented_at_stall(&call) {
                        entry.in_flight = entry.in_flight.saturating_sub(1);
                    }
                    let mut ctx = TaskContext::new(routing, *local_id, now, is_ipv4, 0);
                    entry.task.on_error(&mut ctx, &call, &error);
                    self.mark_dirty(id);
                }
            }
        }
        self.pump(routing, local_id, now, is_ipv4)
    }

    fn mark_dirty(&mut self, id: TaskId) {
        if !self.dirty.contains(&id) {
            self.dirty.push_back(id);
        }
    }

    fn finish(&mut self, id: TaskId, canceled: bool) {
        let Some(mut entry) = self.tasks.remove(&id) else {
            return;
        };
        entry.state = if canceled {
            TaskState::Canceled
        } else {
            TaskState::Completed
        };
        debug!(task = id, name = entry.task.name(), canceled, "task finished");
        entry.task.on_finish(canceled);
        self.running.retain(|r| *r != id);
        if !canceled {
            for (task, priority) in entry.task.take_followups() {
                self.add(task, priority);
            }
        }
    }

    /// Cancel one task; idempotent.
    pub fn cancel(&mut self, id: TaskId) {
        if self.tasks.contains_key(&id) {
            self.queue_high.retain(|q| *q != id);
            self.queue_low.retain(|q| *q != id);
            self.finish(id, true);
        }
    }

    /// Cancel everything, queued and running.
    pub fn cancel_all(&mut self) {
        let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for id in ids {
            self.cancel(id);
        }
        self.queue_high.clear();
        self.queue_low.clear();
        self.dirty.clear();
    }
}

/// Whether the scheduler already freed this call's slot when it stalled.
fn was_decremented_at_stall(call: &crate::rpc::RpcCall) -> bool {
    call.was_stalled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Message;
    use crate::rpc::RpcCall;
    use lib_core::NodeInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Minimal task: sends `calls` pings, completes when all are resolved.
    struct PingSome {
        targets: Vec<NodeInfo>,
        dispatched: usize,
        resolved: usize,
        finished: Arc<AtomicUsize>,
    }

    impl PingSome {
        fn new(n: usize, finished: Arc<AtomicUsize>) -> Self {
            let targets = (0..n)
                .map(|i| {
                    NodeInfo::new(
                        Id::random(),
                        format!("203.0.113.{}:4000", i + 1).parse().unwrap(),
                    )
                })
                .collect();
            PingSome {
                targets,
                dispatched: 0,
                resolved: 0,
                finished,
            }
        }
    }

    impl Task for PingSome {
        fn name(&self) -> &str {
            "ping-some"
        }
        fn target(&self) -> Option<&Id> {
            None
        }
        fn iterate(&mut self, ctx: &mut TaskContext<'_>) {
            while self.dispatched < self.targets.len() {
                let target = self.targets[self.dispatched].clone();
                if !ctx.send_call(target, Body::PingRequest) {
                    break;
                }
                self.dispatched += 1;
            }
        }
        fn on_response(&mut self, _ctx: &mut TaskContext<'_>, _call: &RpcCall, _msg: &Message) {
            self.resolved += 1;
        }
        fn on_timeout(&mut self, _ctx: &mut TaskContext<'_>, _call: &RpcCall) {
            self.resolved += 1;
        }
        fn is_done(&self) -> bool {
            self.dispatched == self.targets.len() && self.resolved == self.targets.len()
        }
        fn on_finish(&mut self, _canceled: bool) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn routing() -> RoutingTable {
        RoutingTable::new(Id::random())
    }

    #[test]
    fn test_concurrency_cap_per_priority() {
        let table = routing();
        let local = *table.local_id();
        let mut mgr = TaskManager::new();
        let finished = Arc::new(AtomicUsize::new(0));

        mgr.add(Box::new(PingSome::new(20, finished.clone())), Priority::High);
        let out = mgr.pump(&table, &local, 1_000, true);
        assert_eq!(out.len(), MAX_CONCURRENT_TASK_REQUESTS);

        let mut mgr_low = TaskManager::new();
        mgr_low.add(Box::new(PingSome::new(20, finished.clone())), Priority::Low);
        let out = mgr_low.pump(&table, &local, 1_000, true);
        assert_eq!(out.len(), MAX_CONCURRENT_TASK_REQUESTS_LOW_PRIORITY);
    }

    #[test]
    fn test_task_completes_after_all_calls_resolve() {
        let table = routing();
        let local = *table.local_id();
        let mut mgr = TaskManager::new();
        let finished = Arc::new(AtomicUsize::new(0));

        mgr.add(Box::new(PingSome::new(3, finished.clone())), Priority::High);
        let out = mgr.pump(&table, &local, 1_000, true);
        assert_eq!(out.len(), 3);

        for req in out {
            let mut call = RpcCall::new(req.target.clone(), Body::PingRequest).for_task(req.task);
            call.assign_txid(1);
            call.mark_sent(std::time::Instant::now());
            call.mark_responded(std::time::Instant::now());
            let msg = Message::new(1, *req.target.id(), Body::PingResponse);
            mgr.handle_event(
                TaskCallEvent::Response(req.task, call, msg),
                &table,
                &local,
                1_001,
                true,
            );
        }
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(mgr.is_idle());
    }

    #[test]
    fn test_queue_respects_max_active() {
        let table = routing();
        let local = *table.local_id();
        let mut mgr = TaskManager::new();
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..(MAX_ACTIVE_TASKS + 4) {
            mgr.add(Box::new(PingSome::new(1, finished.clone())), Priority::High);
        }
        let _ = mgr.pump(&table, &local, 1_000, true);
        assert_eq!(mgr.running_count(), MAX_ACTIVE_TASKS);
        assert_eq!(mgr.queued_count(), 4);
    }

    #[test]
    fn test_cancel_all_fires_hooks_once() {
        let table = routing();
        let local = *table.local_id();
        let mut mgr = TaskManager::new();
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            mgr.add(Box::new(PingSome::new(2, finished.clone())), Priority::High);
        }
        let _ = mgr.pump(&table, &local, 1_000, true);
        mgr.cancel_all();
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert!(mgr.is_idle());

        // Idempotent.
        mgr.cancel_all();
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_high_priority_dequeues_first() {
        let table = routing();
        let local = *table.local_id();
        let mut mgr = TaskManager::new();
        let finished = Arc::new(AtomicUsize::new(0));

        // Saturate the scheduler with low tasks, then add one high task.
        for _ in 0..MAX_ACTIVE_TASKS {
            mgr.add(Box::new(PingSome::new(1, finished.clone())), Priority::Low);
        }
        let high = mgr.add(Box::new(PingSome::new(1, finished.clone())), Priority::High);
        let low_extra = mgr.add(Box::new(PingSome::new(1, finished.clone())), Priority::Low);
        let out = mgr.pump(&table, &local, 1_000, true);
        assert!(!out.is_empty());

        // Resolve one low task to free a slot; the high task must start
        // before the extra low one.
        let req = out.into_iter().next().unwrap();
        let mut call = RpcCall::new(req.target.clone(), Body::PingRequest).for_task(req.task);
        call.assign_txid(2);
        call.mark_sent(std::time::Instant::now());
        call.mark_responded(std::time::Instant::now());
        let msg = Message::new(2, *req.target.id(), Body::PingResponse);
        let next_out = mgr.handle_event(
            TaskCallEvent::Response(req.task, call, msg),
            &table,
            &local,
            1_001,
            true,
        );
        assert!(next_out.iter().any(|r| r.task == high));
        assert!(!next_out.iter().any(|r| r.task == low_extra));
    }
}
