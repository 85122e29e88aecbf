//! Candidate bookkeeping for iterative lookups.

use std::collections::HashSet;
use std::net::SocketAddr;

use lib_core::{Id, NodeInfo};

use crate::constants::MAX_CANDIDATE_PINGS;

/// One node a lookup may still query.
#[derive(Debug)]
pub struct CandidateNode {
    info: NodeInfo,
    sent: bool,
    replied: bool,
    unreachable: bool,
    pinged: u32,
    token: Option<u32>,
}

impl CandidateNode {
    fn new(info: NodeInfo) -> Self {
        CandidateNode {
            info,
            sent: false,
            replied: false,
            unreachable: false,
            pinged: 0,
            token: None,
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn id(&self) -> &Id {
        self.info.id()
    }

    pub fn token(&self) -> Option<u32> {
        self.token
    }

    pub fn has_replied(&self) -> bool {
        self.replied
    }

    /// Queryable: not in flight, not written off.
    pub fn is_eligible(&self) -> bool {
        !self.sent && !self.unreachable && !self.replied
    }
}

/// Distance-ordered candidate queue, deduplicated by id and by address.
///
/// The queue keeps the best unresolved candidates; in-flight entries are
/// never evicted, spare capacity beyond the bound drops the farthest
/// untried node.
#[derive(Debug)]
pub struct CandidateQueue {
    target: Id,
    bound: usize,
    entries: Vec<CandidateNode>,
    seen_ids: HashSet<Id>,
    seen_addrs: HashSet<SocketAddr>,
}

impl CandidateQueue {
    pub fn new(target: Id, bound: usize) -> Self {
        CandidateQueue {
            target,
            bound,
            entries: Vec::new(),
            seen_ids: HashSet::new(),
            seen_addrs: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add newly learned nodes, ignoring anything seen before.
    pub fn add<I>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = NodeInfo>,
    {
        for node in nodes {
            if self.seen_ids.contains(node.id()) || self.seen_addrs.contains(&node.addr()) {
                continue;
            }
            self.seen_ids.insert(*node.id());
            self.seen_addrs.insert(node.addr());
            let pos = self.entries.partition_point(|c| {
                self.target.three_way_compare(c.id(), node.id()) != std::cmp::Ordering::Greater
            });
            self.entries.insert(pos, CandidateNode::new(node));
        }
        self.trim();
    }

    /// Drop the farthest untried candidates beyond the bound.
    fn trim(&mut self) {
        let mut len = self.entries.len();
        while len > self.bound {
            let Some(pos) = self.entries.iter().rposition(|c| c.is_eligible()) else {
                return;
            };
            // Never drop the best eligible candidates, only overflow.
            if pos < self.bound {
                return;
            }
            self.entries.remove(pos);
            len -= 1;
        }
    }

    /// The best candidate that can be queried right now.
    pub fn next_eligible(&mut self) -> Option<&mut CandidateNode> {
        self.entries.iter_mut().find(|c| c.is_eligible())
    }

    pub fn has_eligible(&self) -> bool {
        self.entries.iter().any(|c| c.is_eligible())
    }

    pub fn get(&self, id: &Id) -> Option<&CandidateNode> {
        self.entries.iter().find(|c| c.id() == id)
    }

    fn get_mut(&mut self, id: &Id) -> Option<&mut CandidateNode> {
        self.entries.iter_mut().find(|c| c.id() == id)
    }

    /// Mark a request as dispatched to `id`.
    pub fn mark_sent(&mut self, id: &Id) {
        if let Some(c) = self.get_mut(id) {
            c.sent = true;
            c.pinged += 1;
        }
    }

    /// A response arrived from `id`; optionally remembers its token.
    pub fn on_replied(&mut self, id: &Id, token: Option<u32>) {
        if let Some(c) = self.get_mut(id) {
            c.replied = true;
            if token.is_some() {
                c.token = token;
            }
        }
    }

    /// A call to `id` failed. Allows a bounded number of retries, then
    /// writes the candidate off.
    pub fn on_call_failed(&mut self, id: &Id) {
        if let Some(c) = self.get_mut(id) {
            if c.pinged > MAX_CANDIDATE_PINGS {
                c.unreachable = true;
            } else {
                c.sent = false;
            }
        }
    }

    /// Candidates that replied and hold a write token.
    pub fn with_tokens(&self) -> impl Iterator<Item = (&NodeInfo, u32)> {
        self.entries
            .iter()
            .filter_map(|c| c.token.map(|t| (&c.info, t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(first: u8, port: u16) -> NodeInfo {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        bytes[30] = (port % 251) as u8;
        NodeInfo::new(
            Id::from_bytes(bytes),
            format!("203.0.113.{}:{}", first % 200 + 1, port).parse().unwrap(),
        )
    }

    #[test]
    fn test_dedup_by_id_and_addr() {
        let mut q = CandidateQueue::new(Id::MIN, 8);
        let a = node(1, 4001);
        q.add([a.clone()]);
        q.add([a.clone()]); // same id
        let same_addr = NodeInfo::new(Id::random(), a.addr());
        q.add([same_addr]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_orders_by_distance() {
        let mut q = CandidateQueue::new(Id::MIN, 8);
        q.add([node(9, 4009), node(1, 4001), node(5, 4005)]);
        let best = q.next_eligible().unwrap();
        assert_eq!(best.id().as_bytes()[0], 1);
    }

    #[test]
    fn test_retry_then_write_off() {
        let mut q = CandidateQueue::new(Id::MIN, 8);
        let n = node(2, 4002);
        let id = *n.id();
        q.add([n]);

        for attempt in 0..=MAX_CANDIDATE_PINGS {
            let c = q.next_eligible().expect("retry allowed");
            assert_eq!(c.id(), &id);
            q.mark_sent(&id);
            assert!(!q.has_eligible(), "in flight");
            q.on_call_failed(&id);
            let _ = attempt;
        }
        // pinged exceeded the retry budget: written off.
        assert!(!q.has_eligible());
        assert!(q.next_eligible().is_none());
    }

    #[test]
    fn test_replied_candidates_not_requeried() {
        let mut q = CandidateQueue::new(Id::MIN, 8);
        let n = node(3, 4003);
        let id = *n.id();
        q.add([n]);
        q.mark_sent(&id);
        q.on_replied(&id, Some(42));
        assert!(!q.has_eligible());
        assert_eq!(q.get(&id).unwrap().token(), Some(42));
        assert_eq!(q.with_tokens().count(), 1);
    }

    #[test]
    fn test_bound_drops_farthest_untried() {
        let mut q = CandidateQueue::new(Id::MIN, 4);
        q.add((0..10u8).map(|i| node(i + 1, 4000 + i as u16)));
        assert_eq!(q.len(), 4);
        // The survivors are the closest ones.
        let firsts: Vec<u8> = q.entries.iter().map(|c| c.id().as_bytes()[0]).collect();
        assert_eq!(firsts, vec![1, 2, 3, 4]);
    }
}
