//! Adversarial-resistance machinery: ban lists, rate limiting, abuse
//! tracking and write-authorization tokens.

pub mod blacklist;
pub mod spam_throttle;
pub mod suspicious;
pub mod token;

pub use blacklist::Blacklist;
pub use spam_throttle::SpamThrottle;
pub use suspicious::{Observation, SuspiciousNodeTracker};
pub use token::TokenManager;
