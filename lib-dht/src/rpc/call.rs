//! In-flight RPC call state.

use std::net::SocketAddr;
use std::time::Instant;

use lib_core::{Id, NodeInfo};

use crate::messages::{Body, Message};

/// Identifier of the task that owns a call, if any.
pub type TaskId = u64;

/// Lifecycle of an outbound call. `Responded`, `Errored` and `Timeout` are
/// terminal; every call reaches exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Created, possibly waiting in the throttle queue.
    Unsent,
    /// On the wire, stall deadline armed.
    Sent,
    /// Stall deadline passed; the final deadline is still running.
    Stalled,
    Responded,
    Errored,
    Timeout,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Responded | CallState::Errored | CallState::Timeout
        )
    }
}

/// One outbound request and everything needed to match its response.
#[derive(Debug)]
pub struct RpcCall {
    target: NodeInfo,
    request_body: Body,
    txid: u32,
    state: CallState,
    sent_at: Option<Instant>,
    responded_at: Option<Instant>,
    task: Option<TaskId>,
    id_mismatch: bool,
    addr_mismatch: bool,
    stalled: bool,
}

impl RpcCall {
    pub fn new(target: NodeInfo, request_body: Body) -> Self {
        debug_assert!(matches!(
            request_body.kind(),
            crate::messages::MessageKind::Request
        ));
        RpcCall {
            target,
            request_body,
            txid: 0,
            state: CallState::Unsent,
            sent_at: None,
            responded_at: None,
            task: None,
            id_mismatch: false,
            addr_mismatch: false,
            stalled: false,
        }
    }

    pub fn for_task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }

    pub fn target(&self) -> &NodeInfo {
        &self.target
    }

    pub fn target_id(&self) -> &Id {
        self.target.id()
    }

    pub fn target_addr(&self) -> SocketAddr {
        self.target.addr()
    }

    pub fn request_body(&self) -> &Body {
        &self.request_body
    }

    pub fn method(&self) -> crate::messages::Method {
        self.request_body.method()
    }

    pub fn txid(&self) -> u32 {
        self.txid
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    pub fn id_mismatch(&self) -> bool {
        self.id_mismatch
    }

    pub fn addr_mismatch(&self) -> bool {
        self.addr_mismatch
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// Round-trip time once responded.
    pub fn rtt_ms(&self) -> Option<u64> {
        match (self.sent_at, self.responded_at) {
            (Some(sent), Some(responded)) => {
                Some(responded.saturating_duration_since(sent).as_millis() as u64)
            }
            _ => None,
        }
    }

    /// Build the wire message for this call.
    pub fn to_message(&self, sender: Id) -> Message {
        Message::new(self.txid, sender, self.request_body.clone())
    }

    pub(crate) fn assign_txid(&mut self, txid: u32) {
        self.txid = txid;
    }

    pub(crate) fn mark_sent(&mut self, now: Instant) {
        self.sent_at = Some(now);
        self.state = CallState::Sent;
    }

    pub(crate) fn mark_stalled(&mut self) {
        if self.state == CallState::Sent {
            self.state = CallState::Stalled;
            self.stalled = true;
        }
    }

    /// Whether this call ever passed its stall deadline.
    pub fn was_stalled(&self) -> bool {
        self.stalled
    }

    pub(crate) fn mark_responded(&mut self, now: Instant) {
        debug_assert!(!self.state.is_terminal());
        self.responded_at = Some(now);
        self.state = CallState::Responded;
    }

    pub(crate) fn mark_errored(&mut self) {
        debug_assert!(!self.state.is_terminal());
        self.state = CallState::Errored;
    }

    pub(crate) fn mark_timeout(&mut self) {
        debug_assert!(!self.state.is_terminal());
        self.state = CallState::Timeout;
    }

    pub(crate) fn flag_id_mismatch(&mut self) {
        self.id_mismatch = true;
    }

    pub(crate) fn flag_addr_mismatch(&mut self) {
        self.addr_mismatch = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn call() -> RpcCall {
        let addr: SocketAddr = "203.0.113.1:3900".parse().unwrap();
        RpcCall::new(NodeInfo::new(Id::random(), addr), Body::PingRequest)
    }

    #[test]
    fn test_lifecycle_to_response() {
        let mut c = call();
        assert_eq!(c.state(), CallState::Unsent);
        let t0 = Instant::now();
        c.mark_sent(t0);
        assert_eq!(c.state(), CallState::Sent);
        c.mark_responded(t0 + Duration::from_millis(80));
        assert_eq!(c.state(), CallState::Responded);
        assert!(c.state().is_terminal());
        assert_eq!(c.rtt_ms(), Some(80));
    }

    #[test]
    fn test_stall_is_not_terminal() {
        let mut c = call();
        c.mark_sent(Instant::now());
        c.mark_stalled();
        assert_eq!(c.state(), CallState::Stalled);
        assert!(!c.state().is_terminal());
        c.mark_timeout();
        assert!(c.state().is_terminal());
    }

    #[test]
    fn test_task_attribution() {
        let c = call().for_task(7);
        assert_eq!(c.task(), Some(7));
    }
}
