//! Per-node bookkeeping inside a k-bucket.

use std::net::SocketAddr;

use lib_core::{Id, NodeInfo};

use crate::constants::{MAX_FAILURES, PING_AFTER_UNSEEN, UNVERIFIED_GRACE};

/// RTT value meaning "never measured".
pub const RTT_UNKNOWN: u64 = u64::MAX;

/// Ceiling an entry's RTT clamps to after a timeout.
pub const RTT_CEILING: u64 = 10_000;

/// One known node: endpoint, reachability and failure history.
///
/// All timestamps are unix milliseconds supplied by the caller, which keeps
/// the lifecycle logic deterministic under test.
#[derive(Debug, Clone)]
pub struct KBucketEntry {
    node: NodeInfo,
    version: Option<[u8; 4]>,
    created_at: u64,
    last_seen: u64,
    last_sent: u64,
    reachable: bool,
    failed_requests: u32,
    rtt: u64,
}

impl KBucketEntry {
    /// A freshly observed, unverified node.
    pub fn new(node: NodeInfo, now: u64) -> Self {
        KBucketEntry {
            node,
            version: None,
            created_at: now,
            last_seen: now,
            last_sent: 0,
            reachable: false,
            failed_requests: 0,
            rtt: RTT_UNKNOWN,
        }
    }

    /// A node we just received a verified response from.
    pub fn new_verified(node: NodeInfo, now: u64) -> Self {
        let mut entry = Self::new(node, now);
        entry.reachable = true;
        entry
    }

    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    pub fn id(&self) -> &Id {
        self.node.id()
    }

    pub fn addr(&self) -> SocketAddr {
        self.node.addr()
    }

    pub fn version(&self) -> Option<[u8; 4]> {
        self.version
    }

    pub fn set_version(&mut self, version: Option<[u8; 4]>) {
        if version.is_some() {
            self.version = version;
        }
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn last_sent(&self) -> u64 {
        self.last_sent
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn failed_requests(&self) -> u32 {
        self.failed_requests
    }

    pub fn rtt(&self) -> u64 {
        self.rtt
    }

    /// A verified response arrived.
    pub fn on_responded(&mut self, now: u64, rtt_ms: u64) {
        self.reachable = true;
        self.last_seen = now;
        self.failed_requests = 0;
        self.rtt = rtt_ms.min(RTT_CEILING);
    }

    /// A request left for this node.
    pub fn on_request_sent(&mut self, now: u64) {
        self.last_sent = now;
    }

    /// A call to this node timed out.
    pub fn on_timeout(&mut self) {
        self.failed_requests = self.failed_requests.saturating_add(1);
        self.rtt = RTT_CEILING;
    }

    /// Record a passive sighting (any message from the node's endpoint).
    pub fn on_seen(&mut self, now: u64) {
        self.last_seen = now;
    }

    /// Whether the entry deserves a verification ping: quiet for a while
    /// and at least one recent failure.
    pub fn needs_ping(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) > PING_AFTER_UNSEEN.as_millis() as u64
            && self.failed_requests >= 1
    }

    /// Whether the entry should give way to a replacement: too many
    /// failures, or never verified past its grace period.
    pub fn needs_replacement(&self, now: u64) -> bool {
        self.failed_requests >= MAX_FAILURES
            || (!self.reachable
                && now.saturating_sub(self.created_at) > UNVERIFIED_GRACE.as_millis() as u64)
    }

    /// Merge a fresh observation of the same node into this entry,
    /// preserving failure counters.
    pub fn merge(&mut self, other: &KBucketEntry) {
        debug_assert_eq!(self.id(), other.id());
        if other.last_seen >= self.last_seen && other.addr() != self.addr() {
            self.node.set_addr(other.addr());
            // A moved endpoint is unverified until it responds.
            self.reachable = other.reachable;
        }
        self.last_seen = self.last_seen.max(other.last_seen);
        self.last_sent = self.last_sent.max(other.last_sent);
        if other.reachable {
            self.reachable = true;
        }
        if other.version.is_some() {
            self.version = other.version;
        }
        if other.rtt != RTT_UNKNOWN {
            self.rtt = other.rtt;
        }
    }

    /// Rebuild an entry from persisted state.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        node: NodeInfo,
        version: Option<[u8; 4]>,
        reachable: bool,
        created_at: u64,
        last_seen: u64,
        last_sent: u64,
        failed_requests: u32,
        rtt: u64,
    ) -> Self {
        KBucketEntry {
            node,
            version,
            created_at,
            last_seen,
            last_sent,
            reachable,
            failed_requests,
            rtt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn entry(now: u64) -> KBucketEntry {
        let addr: SocketAddr = "203.0.113.1:3900".parse().unwrap();
        KBucketEntry::new(NodeInfo::new(Id::random(), addr), now)
    }

    #[test]
    fn test_new_entry_is_unverified() {
        let e = entry(1_000);
        assert!(!e.is_reachable());
        assert_eq!(e.failed_requests(), 0);
        assert_eq!(e.rtt(), RTT_UNKNOWN);
    }

    #[test]
    fn test_response_verifies_and_clears_failures() {
        let mut e = entry(1_000);
        e.on_timeout();
        e.on_timeout();
        assert_eq!(e.failed_requests(), 2);

        e.on_responded(5_000, 120);
        assert!(e.is_reachable());
        assert_eq!(e.failed_requests(), 0);
        assert_eq!(e.rtt(), 120);
        assert_eq!(e.last_seen(), 5_000);
    }

    #[test]
    fn test_timeout_clamps_rtt() {
        let mut e = entry(0);
        e.on_responded(1, 80);
        e.on_timeout();
        assert_eq!(e.rtt(), RTT_CEILING);
        assert_eq!(e.failed_requests(), 1);
    }

    #[test]
    fn test_needs_ping() {
        let mut e = entry(0);
        // Quiet but no failures: no ping needed.
        assert!(!e.needs_ping(60_000));
        e.on_timeout();
        assert!(e.needs_ping(60_000));
        // Recently seen: no ping even with failures.
        e.on_seen(59_000);
        assert!(!e.needs_ping(60_000));
    }

    #[test]
    fn test_needs_replacement_by_failures() {
        let mut e = entry(0);
        e.on_responded(1, 50);
        for _ in 0..MAX_FAILURES {
            assert!(!e.needs_replacement(2));
            e.on_timeout();
        }
        assert!(e.needs_replacement(2));
    }

    #[test]
    fn test_needs_replacement_by_unverified_age() {
        let e = entry(0);
        let grace = UNVERIFIED_GRACE.as_millis() as u64;
        assert!(!e.needs_replacement(grace));
        assert!(e.needs_replacement(grace + 1));

        let mut verified = entry(0);
        verified.on_responded(1, 50);
        assert!(!verified.needs_replacement(grace + 1));
    }

    #[test]
    fn test_merge_updates_endpoint_and_keeps_counters() {
        let mut e = entry(0);
        e.on_timeout();
        let id = *e.id();

        let new_addr: SocketAddr = "203.0.113.2:3901".parse().unwrap();
        let observed = KBucketEntry::new(NodeInfo::new(id, new_addr), 10_000);
        e.merge(&observed);

        assert_eq!(e.addr(), new_addr);
        assert_eq!(e.failed_requests(), 1, "counters survive a merge");
        assert_eq!(e.last_seen(), 10_000);
        assert!(!e.is_reachable(), "moved endpoint must re-verify");
    }
}
