//! Detection of nodes that change identity or speak garbage.
//!
//! The tracker watches per-address behaviour: an address that keeps
//! re-announcing itself under different ids, or keeps sending undecodable
//! datagrams, accumulates hits. Past the threshold the host is banned for a
//! while but stays observed, so a returning offender is re-banned
//! immediately.
//!
//! The tracker is used from the single DHT event loop; multi-threaded
//! callers must synchronise externally.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use lib_core::Id;

/// Default observation window for accumulating hits.
pub const OBSERVATION_PERIOD: Duration = Duration::from_secs(15 * 60);

/// Hits within the window that trigger a ban.
pub const HIT_THRESHOLD: u32 = 10;

/// How long a promoted host stays banned.
pub const BAN_DURATION: Duration = Duration::from_secs(30 * 60);

/// What a node did to earn an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The address produced a different node id than previously seen.
    InconsistentId,
    /// The address sent a datagram the codec rejected.
    MalformedMessage,
}

#[derive(Debug, Clone)]
struct Observed {
    last_id: Option<Id>,
    last_activity: Instant,
    hits: u32,
    expires_at: Instant,
}

/// Tracks id-instability and protocol abuse per address.
#[derive(Debug)]
pub struct SuspiciousNodeTracker {
    observation_period: Duration,
    hit_threshold: u32,
    ban_duration: Duration,
    observed: HashMap<SocketAddr, Observed>,
    banned: HashMap<String, Instant>,
}

impl Default for SuspiciousNodeTracker {
    fn default() -> Self {
        SuspiciousNodeTracker::new(OBSERVATION_PERIOD, HIT_THRESHOLD, BAN_DURATION)
    }
}

impl SuspiciousNodeTracker {
    pub fn new(observation_period: Duration, hit_threshold: u32, ban_duration: Duration) -> Self {
        SuspiciousNodeTracker {
            observation_period,
            hit_threshold,
            ban_duration,
            observed: HashMap::new(),
            banned: HashMap::new(),
        }
    }

    /// Record an observation about `addr`.
    ///
    /// For [`Observation::InconsistentId`] the hit only counts when the
    /// address previously produced a different id.
    pub fn observe(&mut self, addr: SocketAddr, id: Option<Id>, kind: Observation) {
        self.observe_at(addr, id, kind, Instant::now());
    }

    fn observe_at(&mut self, addr: SocketAddr, id: Option<Id>, kind: Observation, now: Instant) {
        let entry = self.observed.entry(addr).or_insert(Observed {
            last_id: None,
            last_activity: now,
            hits: 0,
            expires_at: now + self.observation_period,
        });

        let counts = match kind {
            Observation::MalformedMessage => true,
            Observation::InconsistentId => match (&entry.last_id, &id) {
                (Some(previous), Some(current)) => previous != current,
                _ => false,
            },
        };
        if counts {
            entry.hits += 1;
            debug!(%addr, hits = entry.hits, ?kind, "suspicious observation");
        }
        if let Some(id) = id {
            entry.last_id = Some(id);
        }
        entry.last_activity = now;
        entry.expires_at = if entry.hits >= self.hit_threshold {
            now + self.ban_duration
        } else {
            now + self.observation_period
        };
    }

    /// The id last seen from `addr`, if any.
    pub fn last_known_id(&self, addr: &SocketAddr) -> Option<Id> {
        self.observed.get(addr).and_then(|o| o.last_id)
    }

    /// Whether traffic claiming `expected_id` from `addr` should be
    /// distrusted: the host is banned, or the address was last seen under a
    /// different id.
    pub fn is_suspicious(&self, addr: &SocketAddr, expected_id: &Id) -> bool {
        self.is_suspicious_at(addr, expected_id, Instant::now())
    }

    fn is_suspicious_at(&self, addr: &SocketAddr, expected_id: &Id, now: Instant) -> bool {
        if self.is_banned_at(&addr.ip().to_string(), now) {
            return true;
        }
        match self.observed.get(addr).and_then(|o| o.last_id.as_ref()) {
            Some(last) => last != expected_id,
            None => false,
        }
    }

    /// Whether `host` is currently banned.
    pub fn is_banned(&self, host: &str) -> bool {
        self.is_banned_at(host, Instant::now())
    }

    fn is_banned_at(&self, host: &str, now: Instant) -> bool {
        self.banned.get(host).is_some_and(|until| *until > now)
    }

    /// Number of addresses under observation.
    pub fn observed_len(&self) -> usize {
        self.observed.len()
    }

    /// Drop expired state and promote over-threshold observations into
    /// bans. Promoted entries remain observed for continued surveillance.
    pub fn purge(&mut self) {
        self.purge_at(Instant::now());
    }

    fn purge_at(&mut self, now: Instant) {
        self.banned.retain(|_, until| *until > now);

        let mut to_ban = Vec::new();
        self.observed.retain(|addr, observed| {
            if observed.expires_at <= now {
                return false;
            }
            if observed.hits >= self.hit_threshold {
                to_ban.push(addr.ip().to_string());
            }
            true
        });
        for host in to_ban {
            info!(%host, "banning suspicious host");
            self.banned.insert(host, now + self.ban_duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_consistent_id_is_not_suspicious() {
        let mut tracker = SuspiciousNodeTracker::default();
        let a = addr("192.0.2.1:1000");
        let id = Id::random();
        for _ in 0..20 {
            tracker.observe(a, Some(id), Observation::InconsistentId);
        }
        assert!(!tracker.is_suspicious(&a, &id));
        tracker.purge();
        assert!(!tracker.is_banned("192.0.2.1"));
    }

    #[test]
    fn test_id_change_flags_address() {
        let mut tracker = SuspiciousNodeTracker::default();
        let a = addr("192.0.2.1:1000");
        let i1 = Id::random();
        let i2 = Id::random();
        tracker.observe(a, Some(i1), Observation::InconsistentId);
        tracker.observe(a, Some(i2), Observation::InconsistentId);

        assert_eq!(tracker.last_known_id(&a), Some(i2));
        // The old identity is now suspicious, the latest one is not banned.
        assert!(tracker.is_suspicious(&a, &i1));
        assert!(!tracker.is_suspicious(&a, &i2));
    }

    #[test]
    fn test_repeated_flapping_promotes_to_ban() {
        let mut tracker = SuspiciousNodeTracker::default();
        let a = addr("192.0.2.1:1000");
        let i1 = Id::random();
        let i2 = Id::random();
        // Alternate identities; every flip counts one hit.
        for _ in 0..6 {
            tracker.observe(a, Some(i1), Observation::InconsistentId);
            tracker.observe(a, Some(i2), Observation::InconsistentId);
        }
        tracker.purge();
        assert!(tracker.is_banned("192.0.2.1"));
        assert!(tracker.is_suspicious(&a, &i2));
        // Continued surveillance: still observed after promotion.
        assert_eq!(tracker.observed_len(), 1);
    }

    #[test]
    fn test_malformed_messages_promote_to_ban() {
        let mut tracker = SuspiciousNodeTracker::default();
        let a = addr("198.51.100.2:4000");
        for _ in 0..HIT_THRESHOLD {
            tracker.observe(a, None, Observation::MalformedMessage);
        }
        tracker.purge();
        assert!(tracker.is_banned("198.51.100.2"));
    }

    #[test]
    fn test_ban_expires() {
        let mut tracker =
            SuspiciousNodeTracker::new(Duration::from_secs(900), 2, Duration::from_secs(60));
        let a = addr("192.0.2.5:1000");
        let now = Instant::now();
        tracker.observe_at(a, None, Observation::MalformedMessage, now);
        tracker.observe_at(a, None, Observation::MalformedMessage, now);
        tracker.purge_at(now);
        assert!(tracker.is_banned_at("192.0.2.5", now));

        // Past the ban duration the host recovers and the observation (whose
        // expiry was extended to the ban horizon) is also dropped.
        let later = now + Duration::from_secs(61);
        tracker.purge_at(later);
        assert!(!tracker.is_banned_at("192.0.2.5", later));
        assert_eq!(tracker.observed_len(), 0);
    }

    #[test]
    fn test_quiet_observation_expires() {
        let mut tracker = SuspiciousNodeTracker::default();
        let a = addr("192.0.2.8:1000");
        let now = Instant::now();
        tracker.observe_at(a, Some(Id::random()), Observation::InconsistentId, now);
        tracker.purge_at(now + OBSERVATION_PERIOD + Duration::from_secs(1));
        assert_eq!(tracker.observed_len(), 0);
    }
}
