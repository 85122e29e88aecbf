//! Short-lived write-authorization tokens.
//!
//! A node may only store values or announce peers at us after proving it
//! recently spoke to us: lookup responses carry a 4-byte token bound to the
//! caller's identity, endpoint, target id and a rolling timestamp. Tokens
//! are never persisted; restarting the node invalidates everything, which
//! is exactly the point.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::constants::TOKEN_TIMEOUT;
use lib_core::Id;

/// Issues and verifies write tokens for this session.
#[derive(Debug)]
pub struct TokenManager {
    /// 32 random bytes drawn at startup.
    secret: [u8; 32],
    /// Timestamp of the current token window, milliseconds of `epoch`.
    current: AtomicU64,
    /// Timestamp of the previous window; tokens from it still verify.
    previous: AtomicU64,
    epoch: Instant,
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenManager {
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        TokenManager {
            secret,
            current: AtomicU64::new(0),
            previous: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Advance the rolling window when it is older than the token timeout.
    ///
    /// The compare-and-swap guarantees a single advance per window even
    /// with concurrent callers.
    pub fn update_timestamps(&self) {
        self.update_timestamps_at(self.now_ms());
    }

    fn update_timestamps_at(&self, now_ms: u64) {
        let current = self.current.load(Ordering::Acquire);
        if now_ms.saturating_sub(current) < TOKEN_TIMEOUT.as_millis() as u64 {
            return;
        }
        if self
            .current
            .compare_exchange(current, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.previous.store(current, Ordering::Release);
        }
    }

    /// Token authorising `(node_id, ip, port)` to write under `target_id`
    /// during the current window.
    pub fn generate_token(&self, node_id: &Id, ip: &IpAddr, port: u16, target_id: &Id) -> u32 {
        self.update_timestamps();
        self.token_for(node_id, ip, port, target_id, self.current.load(Ordering::Acquire))
    }

    /// Accept tokens minted in the current or the previous window.
    pub fn verify_token(
        &self,
        token: u32,
        node_id: &Id,
        ip: &IpAddr,
        port: u16,
        target_id: &Id,
    ) -> bool {
        self.update_timestamps();
        let current = self.current.load(Ordering::Acquire);
        if token == self.token_for(node_id, ip, port, target_id, current) {
            return true;
        }
        let previous = self.previous.load(Ordering::Acquire);
        token == self.token_for(node_id, ip, port, target_id, previous)
    }

    fn token_for(&self, node_id: &Id, ip: &IpAddr, port: u16, target_id: &Id, ts: u64) -> u32 {
        let mut hasher = Sha256::new();
        hasher.update(node_id.as_bytes());
        match ip {
            IpAddr::V4(v4) => hasher.update(v4.octets()),
            IpAddr::V6(v6) => hasher.update(v6.octets()),
        }
        hasher.update(port.to_be_bytes());
        hasher.update(target_id.as_bytes());
        hasher.update(ts.to_be_bytes());
        hasher.update(self.secret);
        let digest = hasher.finalize();

        // 4-byte window into the digest, offset by its first byte, circular.
        let offset = (digest[0] % 32) as usize;
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = digest[(offset + i) % 32];
        }
        u32::from_be_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (TokenManager, Id, IpAddr, u16, Id) {
        (
            TokenManager::new(),
            Id::random(),
            "203.0.113.5".parse().unwrap(),
            39001,
            Id::random(),
        )
    }

    #[test]
    fn test_fresh_token_verifies() {
        let (mgr, node, ip, port, target) = setup();
        let token = mgr.generate_token(&node, &ip, port, &target);
        assert!(mgr.verify_token(token, &node, &ip, port, &target));
    }

    #[test]
    fn test_token_is_bound_to_every_input() {
        let (mgr, node, ip, port, target) = setup();
        let token = mgr.generate_token(&node, &ip, port, &target);

        assert!(!mgr.verify_token(token, &Id::random(), &ip, port, &target));
        assert!(!mgr.verify_token(token, &node, &"203.0.113.6".parse().unwrap(), port, &target));
        assert!(!mgr.verify_token(token, &node, &ip, port + 1, &target));
        assert!(!mgr.verify_token(token, &node, &ip, port, &Id::random()));
    }

    #[test]
    fn test_zero_token_rejected() {
        let (mgr, node, ip, port, target) = setup();
        // The odds of a genuine zero token are 1 in 2^32; a hardcoded zero
        // from a lazy client must not pass.
        let token = mgr.generate_token(&node, &ip, port, &target);
        if token != 0 {
            assert!(!mgr.verify_token(0, &node, &ip, port, &target));
        }
    }

    #[test]
    fn test_token_survives_one_window_roll() {
        let (mgr, node, ip, port, target) = setup();
        let token = mgr.generate_token(&node, &ip, port, &target);

        // One roll keeps the token valid via the previous window.
        let timeout = TOKEN_TIMEOUT.as_millis() as u64;
        mgr.update_timestamps_at(timeout + 1);
        assert!(mgr.verify_token(token, &node, &ip, port, &target));

        // A second roll expires it.
        mgr.update_timestamps_at(2 * timeout + 2);
        assert!(!mgr.verify_token(token, &node, &ip, port, &target));
    }

    #[test]
    fn test_different_sessions_disagree() {
        let (a, node, ip, port, target) = setup();
        let b = TokenManager::new();
        let token = a.generate_token(&node, &ip, port, &target);
        // Different session secrets, astronomically unlikely to collide.
        assert_ne!(token, b.generate_token(&node, &ip, port, &target));
    }
}
