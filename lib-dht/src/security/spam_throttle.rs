//! Per-peer datagram rate limiting.
//!
//! Each source or destination IP gets a counter that incoming work
//! increments and a once-per-second decay drains. The decay clock is an
//! atomic advanced by compare-and-swap, so overlapping decay attempts
//! subtract the elapsed budget exactly once.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::constants::{THROTTLE_BURST_CAPACITY, THROTTLE_LIMIT_PER_SECOND};

/// Token-bucket style limiter keyed by IP address.
#[derive(Debug)]
pub struct SpamThrottle {
    limit_per_second: u32,
    burst_capacity: u32,
    counters: HashMap<IpAddr, u32>,
    /// Millisecond reading of the last applied decay, CAS-advanced.
    last_decay: AtomicU64,
    epoch: Instant,
}

impl Default for SpamThrottle {
    fn default() -> Self {
        SpamThrottle::new(THROTTLE_LIMIT_PER_SECOND, THROTTLE_BURST_CAPACITY)
    }
}

impl SpamThrottle {
    /// `burst_capacity` must be at least `limit_per_second`.
    pub fn new(limit_per_second: u32, burst_capacity: u32) -> Self {
        assert!(burst_capacity >= limit_per_second);
        SpamThrottle {
            limit_per_second,
            burst_capacity,
            counters: HashMap::new(),
            last_decay: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Count one event for `ip`; returns true when the peer is saturated.
    pub fn increment_and_check(&mut self, ip: IpAddr) -> bool {
        let now = self.now_ms();
        self.increment_and_check_at(ip, now)
    }

    fn increment_and_check_at(&mut self, ip: IpAddr, now_ms: u64) -> bool {
        self.decay_at(now_ms);
        let counter = self.counters.entry(ip).or_insert(0);
        *counter = (*counter + 1).min(self.burst_capacity);
        *counter >= self.burst_capacity
    }

    /// Count one event and estimate how long the caller should defer work
    /// for `ip`, in milliseconds. Zero below the burst ceiling.
    pub fn increment_and_estimate_delay(&mut self, ip: IpAddr) -> u64 {
        let now = self.now_ms();
        self.increment_and_estimate_delay_at(ip, now)
    }

    fn increment_and_estimate_delay_at(&mut self, ip: IpAddr, now_ms: u64) -> u64 {
        self.decay_at(now_ms);
        let counter = self.counters.entry(ip).or_insert(0);
        let count = counter.saturating_add(1);
        // The stored counter never exceeds the burst ceiling.
        *counter = count.min(self.burst_capacity);
        if count < self.burst_capacity {
            return 0;
        }

        let until_next_decay =
            1000u64.saturating_sub(now_ms.saturating_sub(self.last_decay.load(Ordering::Relaxed)));
        let backlog = (count - self.burst_capacity + 1) as u64;
        until_next_decay + backlog * 1000 / self.limit_per_second as u64
    }

    /// Current counter for `ip`; zero when unknown.
    pub fn counter(&self, ip: &IpAddr) -> u32 {
        self.counters.get(ip).copied().unwrap_or(0)
    }

    /// Forget `ip` entirely.
    pub fn clear(&mut self, ip: &IpAddr) {
        self.counters.remove(ip);
    }

    /// Apply the once-per-second decay; safe to call at any frequency.
    pub fn decay(&mut self) {
        let now = self.now_ms();
        self.decay_at(now);
    }

    fn decay_at(&mut self, now_ms: u64) {
        let last = self.last_decay.load(Ordering::Acquire);
        let elapsed_s = now_ms.saturating_sub(last) / 1000;
        if elapsed_s == 0 {
            return;
        }
        // Advance the clock by whole seconds only; a lost race means some
        // other caller already applied this window.
        let next = last + elapsed_s * 1000;
        if self
            .last_decay
            .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let drain = (elapsed_s as u32).saturating_mul(self.limit_per_second);
        self.counters.retain(|_, counter| {
            *counter = counter.saturating_sub(drain);
            *counter > 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_counter_caps_at_burst_capacity() {
        let mut throttle = SpamThrottle::new(32, 128);
        let peer = ip("192.0.2.7");
        for i in 1..128 {
            assert!(!throttle.increment_and_check(peer), "not yet at {}", i);
        }
        assert!(throttle.increment_and_check(peer));
        assert!(throttle.increment_and_check(peer));
        assert_eq!(throttle.counter(&peer), 128);
    }

    #[test]
    fn test_peers_are_independent() {
        let mut throttle = SpamThrottle::default();
        let a = ip("192.0.2.1");
        let b = ip("192.0.2.2");
        for _ in 0..200 {
            throttle.increment_and_check(a);
        }
        assert!(!throttle.increment_and_check(b));
    }

    #[test]
    fn test_delay_zero_below_cap() {
        let mut throttle = SpamThrottle::new(32, 128);
        let peer = ip("192.0.2.9");
        for _ in 0..127 {
            assert_eq!(throttle.increment_and_estimate_delay(peer), 0);
        }
        let delay = throttle.increment_and_estimate_delay(peer);
        assert!(delay > 0);
        // One saturated slot: at most one decay interval plus one quantum.
        assert!(delay <= 1000 + 1000 / 32 + 1, "delay {}", delay);
    }

    #[test]
    fn test_delay_grows_with_backlog() {
        let mut throttle = SpamThrottle::new(32, 128);
        let peer = ip("192.0.2.10");
        for _ in 0..128 {
            throttle.increment_and_estimate_delay(peer);
        }
        let first = throttle.increment_and_estimate_delay(peer);
        let second = throttle.increment_and_estimate_delay(peer);
        assert!(second >= first);
    }

    #[test]
    fn test_decay_drains_by_limit_per_second() {
        let mut throttle = SpamThrottle::new(32, 128);
        let peer = ip("192.0.2.11");
        for _ in 0..100 {
            throttle.increment_and_check_at(peer, 10);
        }
        assert_eq!(throttle.counter(&peer), 100);

        // One second later the counter dropped by exactly one budget.
        throttle.decay_at(1_010);
        assert_eq!(throttle.counter(&peer), 100 - 32);

        // Decay within the same second is a no-op.
        throttle.decay_at(1_500);
        assert_eq!(throttle.counter(&peer), 100 - 32);

        // Three more seconds drain the rest and drop the entry.
        throttle.decay_at(4_100);
        assert_eq!(throttle.counter(&peer), 0);
    }

    #[test]
    fn test_clear() {
        let mut throttle = SpamThrottle::default();
        let peer = ip("192.0.2.12");
        throttle.increment_and_check(peer);
        assert_eq!(throttle.counter(&peer), 1);
        throttle.clear(&peer);
        assert_eq!(throttle.counter(&peer), 0);
    }
}
