//! UDP RPC server: datagram I/O, in-flight call tracking, adaptive
//! deadlines and throttled sends.
//!
//! The server is owned by a single DHT event loop. Deadlines live in a
//! small heap; the loop asks for the next wakeup instant and calls
//! [`RpcServer::process_due`] when it fires. Nothing here spawns tasks or
//! takes locks.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use lib_core::Id;

use crate::constants::{RPC_CALL_TIMEOUT_MAX, RPC_CALL_TIMEOUT_MIN};
use crate::messages::{codec, Message};
use crate::security::SpamThrottle;

use super::call::{CallState, RpcCall};
use super::timeout_sampler::TimeoutSampler;

/// Consecutive timeouts with no response before we consider ourselves
/// offline.
const UNREACHABLE_AFTER_TIMEOUTS: u32 = 5;

/// Deadline kinds tracked per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DeadlineKind {
    Stall,
    Final,
}

/// Events surfaced to the orchestrator by the deadline machinery.
#[derive(Debug)]
pub enum CallEvent {
    /// The adaptive stall deadline passed; the call may still complete.
    Stalled(u32),
    /// The call is dead; the full call object is handed back.
    Timeout(RpcCall),
    /// Our own reachability flipped.
    ReachabilityChanged(bool),
}

/// Outcome of matching an inbound response to an in-flight call.
#[derive(Debug)]
pub enum CallMatch {
    /// Validated: the call is removed and handed back, response-state set.
    Matched(RpcCall),
    /// txid matched but the sender id did not; the call is terminated and
    /// handed back so the caller can mark the node suspicious.
    IdMismatch(RpcCall),
    /// txid matched but the datagram came from the wrong address; the call
    /// stays armed (the legitimate response may still arrive).
    AddressMismatch,
    /// No such call.
    Unmatched,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RpcStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    pub datagrams_dropped: u64,
}

struct DelayedSend {
    due: Instant,
    txid: u32,
    wire: Vec<u8>,
    addr: SocketAddr,
}

/// The RPC endpoint of one DHT instance.
pub struct RpcServer {
    socket: Arc<UdpSocket>,
    local_id: Id,
    bound_addr: SocketAddr,
    next_txid: u32,
    calls: HashMap<u32, RpcCall>,
    deadlines: BinaryHeap<Reverse<(Instant, u32, DeadlineKind)>>,
    delayed_sends: Vec<DelayedSend>,
    inbound_throttle: SpamThrottle,
    outbound_throttle: SpamThrottle,
    throttling_enabled: bool,
    timeout_sampler: TimeoutSampler,
    reachable: bool,
    consecutive_timeouts: u32,
    stats: RpcStats,
}

impl RpcServer {
    /// Bind the UDP socket. Failure here is fatal for the deployment.
    pub async fn bind(
        bind_addr: SocketAddr,
        local_id: Id,
        throttling_enabled: bool,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let bound_addr = socket.local_addr()?;
        debug!(%bound_addr, "rpc server bound");
        Ok(RpcServer {
            socket: Arc::new(socket),
            local_id,
            bound_addr,
            next_txid: rand::random(),
            calls: HashMap::new(),
            deadlines: BinaryHeap::new(),
            delayed_sends: Vec::new(),
            inbound_throttle: SpamThrottle::default(),
            outbound_throttle: SpamThrottle::default(),
            throttling_enabled,
            timeout_sampler: TimeoutSampler::default(),
            reachable: false,
            consecutive_timeouts: 0,
            stats: RpcStats::default(),
        })
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    pub fn stats(&self) -> RpcStats {
        self.stats
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    pub fn timeout_sampler(&self) -> &TimeoutSampler {
        &self.timeout_sampler
    }

    /// Whether inbound traffic from `addr` is saturated and must be
    /// dropped silently.
    pub fn inbound_saturated(&mut self, addr: &SocketAddr) -> bool {
        if !self.throttling_enabled {
            return false;
        }
        self.inbound_throttle.increment_and_check(addr.ip())
    }

    fn allocate_txid(&mut self) -> u32 {
        loop {
            let txid = self.next_txid;
            self.next_txid = self.next_txid.wrapping_add(1);
            if !self.calls.contains_key(&txid) {
                return txid;
            }
        }
    }

    fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_sampler.stall_timeout()).clamp(
            RPC_CALL_TIMEOUT_MIN,
            RPC_CALL_TIMEOUT_MAX,
        )
    }

    /// Send `call`, or schedule it when the destination is rate-limited.
    /// Returns the assigned txid.
    ///
    /// A call that cannot even be encoded (oversized value) is armed with
    /// an immediate deadline instead of erroring, so its owner observes a
    /// normal timeout.
    pub async fn send_call(&mut self, mut call: RpcCall) -> u32 {
        let txid = self.allocate_txid();
        call.assign_txid(txid);
        let message = call.to_message(self.local_id);
        let addr = call.target_addr();
        let wire = match codec::serialize(&message) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(%addr, error = %e, "request encode failed");
                let now = Instant::now();
                call.mark_sent(now);
                self.deadlines
                    .push(Reverse((now, txid, DeadlineKind::Final)));
                self.calls.insert(txid, call);
                return txid;
            }
        };

        let delay_ms = if self.throttling_enabled {
            self.outbound_throttle.increment_and_estimate_delay(addr.ip())
        } else {
            0
        };

        let now = Instant::now();
        if delay_ms == 0 {
            self.transmit(&mut call, wire, addr, now).await;
        } else {
            trace!(%addr, delay_ms, "outbound throttled, scheduling send");
            self.delayed_sends.push(DelayedSend {
                due: now + Duration::from_millis(delay_ms),
                txid,
                wire,
                addr,
            });
        }
        self.calls.insert(txid, call);
        txid
    }

    /// The owning task of an in-flight call, if any.
    pub fn call_task(&self, txid: u32) -> Option<crate::rpc::TaskId> {
        self.calls.get(&txid).and_then(|c| c.task())
    }

    async fn transmit(&mut self, call: &mut RpcCall, wire: Vec<u8>, addr: SocketAddr, now: Instant) {
        match self.socket.send_to(&wire, addr).await {
            Ok(_) => {
                call.mark_sent(now);
                self.stats.requests_sent += 1;
                let stall = self.stall_timeout();
                let kind = if stall >= RPC_CALL_TIMEOUT_MAX {
                    DeadlineKind::Final
                } else {
                    DeadlineKind::Stall
                };
                self.deadlines
                    .push(Reverse((now + stall, call.txid(), kind)));
            }
            Err(e) => {
                // Transport failure: let the final deadline machinery reap
                // it instead of surfacing an error mid-iteration.
                warn!(%addr, error = %e, "send failed");
                call.mark_sent(now);
                self.deadlines
                    .push(Reverse((now, call.txid(), DeadlineKind::Final)));
            }
        }
    }

    /// Fire-and-forget send for responses and unsolicited messages.
    pub async fn send_message(&mut self, message: &Message, addr: SocketAddr) {
        match codec::serialize(message) {
            Ok(wire) => {
                if let Err(e) = self.socket.send_to(&wire, addr).await {
                    warn!(%addr, error = %e, "response send failed");
                }
            }
            Err(e) => warn!(%addr, error = %e, "response encode failed"),
        }
    }

    /// Earliest instant at which [`RpcServer::process_due`] has work.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let deadline = self.deadlines.peek().map(|Reverse((at, _, _))| *at);
        let send = self.delayed_sends.iter().map(|d| d.due).min();
        match (deadline, send) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run everything that has come due: delayed sends, stall transitions
    /// and final timeouts.
    pub async fn process_due(&mut self) -> Vec<CallEvent> {
        self.process_due_at(Instant::now()).await
    }

    async fn process_due_at(&mut self, now: Instant) -> Vec<CallEvent> {
        let mut events = Vec::new();

        // Delayed sends first, oldest due first.
        let mut i = 0;
        while i < self.delayed_sends.len() {
            if self.delayed_sends[i].due <= now {
                let delayed = self.delayed_sends.swap_remove(i);
                if let Some(mut call) = self.calls.remove(&delayed.txid) {
                    self.transmit(&mut call, delayed.wire, delayed.addr, now).await;
                    self.calls.insert(delayed.txid, call);
                }
            } else {
                i += 1;
            }
        }

        while let Some(Reverse((at, txid, kind))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            match kind {
                DeadlineKind::Stall => {
                    let Some(call) = self.calls.get_mut(&txid) else {
                        continue; // already settled
                    };
                    if call.state() != CallState::Sent {
                        continue;
                    }
                    call.mark_stalled();
                    let final_at = call
                        .sent_at()
                        .map(|sent| sent + RPC_CALL_TIMEOUT_MAX)
                        .unwrap_or(now);
                    self.deadlines
                        .push(Reverse((final_at, txid, DeadlineKind::Final)));
                    events.push(CallEvent::Stalled(txid));
                }
                DeadlineKind::Final => {
                    let Some(mut call) = self.calls.remove(&txid) else {
                        continue;
                    };
                    call.mark_timeout();
                    self.stats.timeouts += 1;
                    self.consecutive_timeouts += 1;
                    if self.reachable && self.consecutive_timeouts >= UNREACHABLE_AFTER_TIMEOUTS
                    {
                        self.reachable = false;
                        events.push(CallEvent::ReachabilityChanged(false));
                    }
                    events.push(CallEvent::Timeout(call));
                }
            }
        }
        events
    }

    /// Match an inbound response or error to its call.
    ///
    /// On success the RTT feeds the timeout sampler and our reachability
    /// refreshes. `reachability_changed` is set when this response brought
    /// us back online.
    pub fn take_matching_call(
        &mut self,
        from: SocketAddr,
        message: &Message,
    ) -> (CallMatch, bool) {
        let txid = message.txid;
        let Some(call) = self.calls.get_mut(&txid) else {
            return (CallMatch::Unmatched, false);
        };
        if call.target_addr() != from {
            call.flag_addr_mismatch();
            debug!(%from, expected = %call.target_addr(), "response address mismatch");
            return (CallMatch::AddressMismatch, false);
        }
        if call.target_id() != &message.id {
            call.flag_id_mismatch();
            let mut call = self.calls.remove(&txid).expect("present");
            call.mark_errored();
            debug!(%from, "response id mismatch");
            return (CallMatch::IdMismatch(call), false);
        }

        let mut call = self.calls.remove(&txid).expect("present");
        let now = Instant::now();
        if message.is_error() {
            call.mark_errored();
        } else {
            call.mark_responded(now);
            if let Some(rtt) = call.rtt_ms() {
                self.timeout_sampler.update(rtt);
            }
        }
        self.stats.responses_received += 1;
        self.consecutive_timeouts = 0;
        let came_online = !self.reachable;
        self.reachable = true;
        (CallMatch::Matched(call), came_online)
    }

    /// Count a dropped inbound datagram.
    pub fn count_dropped(&mut self) {
        self.stats.datagrams_dropped += 1;
    }

    /// Abandon every in-flight call (shutdown path).
    pub fn drain_calls(&mut self) -> Vec<RpcCall> {
        self.deadlines.clear();
        self.delayed_sends.clear();
        let mut calls: Vec<RpcCall> = self.calls.drain().map(|(_, c)| c).collect();
        for call in &mut calls {
            if !call.state().is_terminal() {
                call.mark_timeout();
            }
        }
        calls
    }

    /// Periodic throttle decay, driven by the orchestrator tick.
    pub fn decay_throttles(&mut self) {
        self.inbound_throttle.decay();
        self.outbound_throttle.decay();
    }
}
