//! Protocol and engine constants.

use std::time::Duration;

/// Bucket capacity and the width of every closest-set computation.
pub const K: usize = 8;

/// Maximum entries per k-bucket; equals [`K`].
pub const MAX_ENTRIES: usize = K;

/// Failed requests before an entry becomes eligible for eviction.
pub const MAX_FAILURES: u32 = 7;

/// Grace period an unverified entry gets before it counts as bad.
pub const UNVERIFIED_GRACE: Duration = Duration::from_secs(60);

/// An entry unseen for this long with at least one failure wants a ping.
pub const PING_AFTER_UNSEEN: Duration = Duration::from_secs(30);

/// Buckets older than this without a refresh get a ping-refresh task.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Sibling buckets must be quiet this long before they may merge.
pub const BUCKET_MERGE_QUIET: Duration = Duration::from_secs(5 * 60);

/// Non-home buckets may split when their depth is a multiple of this.
pub const SPLIT_EVERY_K_PATH_BITS: i32 = 1;

/// Hard upper bound on an encoded datagram, below common path MTU.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

/// Floor for the adaptive stall timeout.
pub const RPC_CALL_TIMEOUT_MIN: Duration = Duration::from_millis(500);

/// Final deadline for any outstanding call.
pub const RPC_CALL_TIMEOUT_MAX: Duration = Duration::from_millis(10_000);

/// Concurrently running tasks per scheduler.
pub const MAX_ACTIVE_TASKS: usize = 16;

/// In-flight RPCs per task.
pub const MAX_CONCURRENT_TASK_REQUESTS: usize = 10;

/// In-flight RPCs per low-priority task.
pub const MAX_CONCURRENT_TASK_REQUESTS_LOW_PRIORITY: usize = 3;

/// Iteration ceiling for lookup tasks.
pub const MAX_LOOKUP_ITERATIONS: u32 = 16;

/// Candidates a lookup drops after this many unanswered pings.
pub const MAX_CANDIDATE_PINGS: u32 = 2;

/// Write tokens roll over after this long; a token stays verifiable for one
/// extra window.
pub const TOKEN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Inbound/outbound datagram budget per second and peer.
pub const THROTTLE_LIMIT_PER_SECOND: u32 = 32;

/// Burst ceiling for the per-peer datagram budget.
pub const THROTTLE_BURST_CAPACITY: u32 = 128;

/// Orchestrator timer periods.
pub const DHT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);
pub const RANDOM_LOOKUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const RANDOM_PING_INTERVAL: Duration = Duration::from_secs(10);
pub const SUSPICIOUS_PURGE_INTERVAL: Duration = Duration::from_secs(30);
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Re-bootstrap when the table is this small or this stale.
pub const BOOTSTRAP_MIN_ENTRIES: usize = 30;
pub const BOOTSTRAP_IF_OLDER_THAN: Duration = Duration::from_secs(30 * 60);

/// Values and peer records persist this long in storage.
pub const STORAGE_RECORD_TTL: Duration = Duration::from_secs(2 * 60 * 60);
