//! State shared by the three iterative lookup tasks.

use lib_core::{Id, NodeInfo};

use crate::constants::{K, MAX_LOOKUP_ITERATIONS};

use super::candidate::CandidateQueue;
use super::closest_set::ClosestSet;
use super::TaskContext;

/// Candidate bound: lookups keep a little slack beyond the closest-K so a
/// burst of failures cannot strand the iteration.
const CANDIDATE_BOUND: usize = 3 * K;

/// Common iterative-lookup state: target, candidate queue, closest set and
/// the termination counters.
#[derive(Debug)]
pub struct LookupState {
    pub target: Id,
    pub candidates: CandidateQueue,
    pub closest: ClosestSet,
    pub iterations: u32,
    /// Method-specific early completion (value found, peers found).
    pub found: bool,
    seeded: bool,
}

impl LookupState {
    pub fn new(target: Id) -> Self {
        LookupState {
            target,
            candidates: CandidateQueue::new(target, CANDIDATE_BOUND),
            closest: ClosestSet::new(target, K),
            iterations: 0,
            found: false,
            seeded: false,
        }
    }

    /// First-iteration seeding from the local routing table; injected
    /// candidates (e.g. bootstrap nodes) survive alongside.
    pub fn seed(&mut self, ctx: &TaskContext<'_>) {
        if self.seeded {
            return;
        }
        self.seeded = true;
        let seeds = ctx.routing.get_closest_nodes(&self.target, K, ctx.now);
        self.candidates.add(seeds);
    }

    /// Add candidates learned from a response, dropping ourselves.
    pub fn add_learned(&mut self, ctx: &TaskContext<'_>, nodes: impl IntoIterator<Item = NodeInfo>) {
        let local = ctx.local_id;
        self.candidates
            .add(nodes.into_iter().filter(|n| *n.id() != local));
    }

    /// Lookup termination per the convergence rules: explicit hit,
    /// exhausted candidates, converged closest set, or iteration ceiling.
    pub fn is_done(&self) -> bool {
        if self.found {
            return true;
        }
        if self.seeded && !self.candidates.has_eligible() {
            return true;
        }
        if self.closest.has_converged() {
            return true;
        }
        self.iterations >= MAX_LOOKUP_ITERATIONS
    }

    /// Pick the next batch of candidates to query, marking them sent.
    /// Skips anything that can no longer beat the converged set.
    pub fn take_batch(&mut self, budget: usize) -> Vec<NodeInfo> {
        let mut batch = Vec::new();
        while batch.len() < budget {
            let Some(candidate) = self.candidates.next_eligible() else {
                break;
            };
            let info = candidate.info().clone();
            self.candidates.mark_sent(info.id());
            if self.closest.is_full() && !self.closest.would_improve(info.id()) {
                // Converging: don't waste a call on a hopeless candidate.
                continue;
            }
            batch.push(info);
        }
        batch
    }
}
