//! Bounded set of the best nodes found so far in a lookup.

use lib_core::{Id, NodeInfo};

/// Up to K nodes ordered by XOR distance to a target, with stability
/// counters that drive lookup termination.
#[derive(Debug)]
pub struct ClosestSet {
    target: Id,
    capacity: usize,
    entries: Vec<NodeInfo>,
    insert_attempts_since_head_modification: usize,
    insert_attempts_since_tail_modification: usize,
}

impl ClosestSet {
    pub fn new(target: Id, capacity: usize) -> Self {
        ClosestSet {
            target,
            capacity,
            entries: Vec::with_capacity(capacity + 1),
            insert_attempts_since_head_modification: 0,
            insert_attempts_since_tail_modification: 0,
        }
    }

    pub fn entries(&self) -> &[NodeInfo] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.iter().any(|n| n.id() == id)
    }

    /// Whether `id` would enter the set if inserted now.
    pub fn would_improve(&self, id: &Id) -> bool {
        if self.contains(id) {
            return false;
        }
        if !self.is_full() {
            return true;
        }
        let tail = self.entries.last().expect("full set has a tail");
        self.target.three_way_compare(id, tail.id()) == std::cmp::Ordering::Less
    }

    /// Record a successfully queried node.
    pub fn insert(&mut self, node: NodeInfo) {
        self.insert_attempts_since_head_modification += 1;
        self.insert_attempts_since_tail_modification += 1;

        if self.contains(node.id()) {
            return;
        }
        let pos = self
            .entries
            .partition_point(|n| self.target.three_way_compare(n.id(), node.id()) != std::cmp::Ordering::Greater);
        if pos >= self.capacity {
            // Farther than the whole set: the tail survives untouched.
            return;
        }
        self.entries.insert(pos, node);
        if pos == 0 {
            self.insert_attempts_since_head_modification = 0;
        }
        if self.entries.len() > self.capacity {
            self.entries.pop();
            self.insert_attempts_since_tail_modification = 0;
        } else {
            // Growing the set rewrites its tail by definition.
            self.insert_attempts_since_tail_modification = 0;
        }
    }

    /// The closest element has survived the last `capacity` attempts.
    pub fn is_head_stable(&self) -> bool {
        !self.entries.is_empty() && self.insert_attempts_since_head_modification >= self.capacity
    }

    /// Head stable and the tail untouched for `capacity` attempts: the
    /// lookup has converged.
    pub fn has_converged(&self) -> bool {
        self.is_head_stable() && self.insert_attempts_since_tail_modification >= self.capacity
    }

    pub fn head(&self) -> Option<&NodeInfo> {
        self.entries.first()
    }

    pub fn tail(&self) -> Option<&NodeInfo> {
        self.entries.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn node_with_first_byte(b: u8) -> NodeInfo {
        let mut bytes = [0u8; 32];
        bytes[0] = b;
        bytes[31] = b.wrapping_mul(7); // make ids distinct but ordered by b
        let addr: SocketAddr = format!("203.0.113.{}:4000", b % 250 + 1).parse().unwrap();
        NodeInfo::new(Id::from_bytes(bytes), addr)
    }

    fn target() -> Id {
        Id::MIN
    }

    #[test]
    fn test_keeps_k_closest_sorted() {
        let mut set = ClosestSet::new(target(), 4);
        for b in [9u8, 3, 7, 1, 8, 2, 6] {
            set.insert(node_with_first_byte(b));
        }
        let firsts: Vec<u8> = set.entries().iter().map(|n| n.id().as_bytes()[0]).collect();
        assert_eq!(firsts, vec![1, 2, 3, 6]);
        assert!(set.is_full());
    }

    #[test]
    fn test_duplicate_insert_counts_as_attempt() {
        let mut set = ClosestSet::new(target(), 4);
        let node = node_with_first_byte(5);
        set.insert(node.clone());
        for _ in 0..4 {
            set.insert(node.clone());
        }
        assert_eq!(set.len(), 1);
        assert!(set.is_head_stable());
    }

    #[test]
    fn test_head_counter_resets_on_new_head() {
        let mut set = ClosestSet::new(target(), 4);
        set.insert(node_with_first_byte(8));
        for _ in 0..4 {
            set.insert(node_with_first_byte(8));
        }
        assert!(set.is_head_stable());

        set.insert(node_with_first_byte(2)); // new head
        assert!(!set.is_head_stable());
    }

    #[test]
    fn test_convergence() {
        let mut set = ClosestSet::new(target(), 4);
        for b in [4u8, 3, 2, 1] {
            set.insert(node_with_first_byte(b));
        }
        assert!(!set.has_converged());
        // Distant nodes do not modify head or tail.
        for b in [50u8, 60, 70, 80] {
            set.insert(node_with_first_byte(b));
        }
        assert!(set.has_converged());
    }

    #[test]
    fn test_would_improve() {
        let mut set = ClosestSet::new(target(), 2);
        set.insert(node_with_first_byte(10));
        assert!(set.would_improve(node_with_first_byte(5).id()));
        set.insert(node_with_first_byte(5));
        assert!(!set.would_improve(node_with_first_byte(20).id()));
        assert!(set.would_improve(node_with_first_byte(1).id()));
        assert!(!set.would_improve(node_with_first_byte(5).id()), "already present");
    }
}
