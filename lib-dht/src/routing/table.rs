//! The routing table: a list of k-buckets disjointly covering the id space.
//!
//! The table starts as one bucket over the whole space and splits under
//! insertion pressure. Buckets on the path to the local id split eagerly;
//! others split only at configured depths. Lookup is a binary search over
//! the ordered prefix list.

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lib_core::{DhtError, Id, NodeInfo, Prefix};

use crate::constants::{MAX_ENTRIES, SPLIT_EVERY_K_PATH_BITS};

use super::bucket::KBucket;
use super::entry::KBucketEntry;

/// Tree-of-buckets routing table keyed by the local node id.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: Id,
    buckets: Vec<KBucket>,
    split_every: i32,
}

impl RoutingTable {
    pub fn new(local_id: Id) -> Self {
        RoutingTable {
            local_id,
            buckets: vec![KBucket::new(Prefix::whole_space())],
            split_every: SPLIT_EVERY_K_PATH_BITS,
        }
    }

    /// Override the non-home split spacing (power users only).
    pub fn with_split_every(mut self, split_every: i32) -> Self {
        assert!(split_every >= 1);
        self.split_every = split_every;
        self
    }

    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn num_entries(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    /// Index of the unique bucket whose prefix covers `id`.
    fn index_of(&self, id: &Id) -> usize {
        let pp = self
            .buckets
            .partition_point(|b| b.prefix().first_id() <= *id);
        debug_assert!(pp >= 1);
        pp - 1
    }

    /// The bucket covering `id`.
    pub fn bucket_of(&self, id: &Id) -> &KBucket {
        &self.buckets[self.index_of(id)]
    }

    fn bucket_of_mut(&mut self, id: &Id) -> &mut KBucket {
        let idx = self.index_of(id);
        &mut self.buckets[idx]
    }

    /// The bucket covering the local id.
    pub fn home_bucket(&self) -> &KBucket {
        self.bucket_of(&self.local_id)
    }

    /// Look up a live entry, optionally searching the replacement cache.
    pub fn get_entry(&self, id: &Id, include_replacements: bool) -> Option<&KBucketEntry> {
        let bucket = self.bucket_of(id);
        bucket.entry(id).or_else(|| {
            if include_replacements {
                bucket.replacement(id)
            } else {
                None
            }
        })
    }

    /// Insert or update an entry, splitting buckets as needed.
    pub fn put(&mut self, entry: KBucketEntry, now: u64) {
        if entry.id() == &self.local_id {
            return;
        }
        loop {
            let idx = self.index_of(entry.id());
            let wants_split = {
                let bucket = &self.buckets[idx];
                !bucket.contains(entry.id())
                    && bucket.is_full()
                    && !bucket.has_bad_entry(now)
                    && self.can_split(bucket)
            };
            if wants_split {
                self.split(idx, now);
                continue;
            }
            self.buckets[idx].put(entry, now);
            return;
        }
    }

    /// Park an unverified node in the covering bucket's replacement cache.
    pub fn put_as_replacement(&mut self, entry: KBucketEntry, now: u64) {
        if entry.id() == &self.local_id {
            return;
        }
        self.bucket_of_mut(entry.id()).put_as_replacement(entry, now);
    }

    /// Force-remove `id` regardless of its state.
    pub fn remove(&mut self, id: &Id, now: u64) -> Option<KBucketEntry> {
        let bucket = self.bucket_of_mut(id);
        let removed = bucket.remove_if_bad(id, true, now);
        bucket.remove_replacement(id).or(removed)
    }

    /// Remove `id` only if it is bad and a verified replacement exists.
    pub fn remove_if_bad(&mut self, id: &Id, now: u64) -> Option<KBucketEntry> {
        self.bucket_of_mut(id).remove_if_bad(id, false, now)
    }

    pub fn on_responded(&mut self, id: &Id, rtt_ms: u64, now: u64) {
        self.bucket_of_mut(id).on_responded(id, rtt_ms, now);
    }

    pub fn on_request_sent(&mut self, id: &Id, now: u64) {
        self.bucket_of_mut(id).on_request_sent(id, now);
    }

    pub fn on_timeout(&mut self, id: &Id, now: u64) {
        self.bucket_of_mut(id).on_timeout(id, now);
    }

    /// The K entries closest to `target` by XOR distance.
    ///
    /// Buckets are walked in order of distance from the target; entries
    /// needing replacement only fill in when nothing better exists.
    pub fn get_closest_nodes(&self, target: &Id, k: usize, now: u64) -> Vec<NodeInfo> {
        let mut order: Vec<usize> = (0..self.buckets.len()).collect();
        order.sort_by(|&a, &b| {
            target.three_way_compare(
                &self.buckets[a].prefix().first_id(),
                &self.buckets[b].prefix().first_id(),
            )
        });

        let mut good: Vec<&KBucketEntry> = Vec::with_capacity(k + MAX_ENTRIES);
        let mut suspect: Vec<&KBucketEntry> = Vec::new();
        for idx in order {
            for entry in self.buckets[idx].entries() {
                if entry.needs_replacement(now) {
                    suspect.push(entry);
                } else {
                    good.push(entry);
                }
            }
            if good.len() >= k {
                break;
            }
        }
        if good.len() < k {
            good.extend(suspect);
        }

        let mut nodes: Vec<NodeInfo> = good.iter().map(|e| e.node().clone()).collect();
        nodes.sort_by(|a, b| target.three_way_compare(a.id(), b.id()));
        nodes.truncate(k);
        nodes
    }

    /// A uniformly random live entry, if any.
    pub fn random_entry(&self) -> Option<&KBucketEntry> {
        let total = self.num_entries();
        if total == 0 {
            return None;
        }
        let mut pick = rand::random::<usize>() % total;
        for bucket in &self.buckets {
            if pick < bucket.len() {
                return Some(&bucket.entries()[pick]);
            }
            pick -= bucket.len();
        }
        None
    }

    /// Periodic housekeeping: cleanup, refresh scheduling, replacement
    /// promotion and sibling merges.
    ///
    /// `on_refresh` receives the prefix of each bucket due a ping-refresh;
    /// `on_drop` receives entries evicted because they no longer belong.
    pub fn maintenance(
        &mut self,
        now: u64,
        bootstrap_ids: &[Id],
        mut on_refresh: impl FnMut(&Prefix),
        mut on_drop: impl FnMut(&NodeInfo),
    ) {
        let local_id = self.local_id;
        for bucket in &mut self.buckets {
            bucket.cleanup(&local_id, bootstrap_ids, now, &mut on_drop);
            if bucket.needs_refresh(now) {
                on_refresh(bucket.prefix());
                bucket.mark_refreshed(now);
            }
            bucket.promote_verified_replacement(now);
        }
        self.merge_pass(now);
    }

    fn can_split(&self, bucket: &KBucket) -> bool {
        let prefix = bucket.prefix();
        if !prefix.is_splittable() {
            return false;
        }
        let home_or_sibling =
            prefix.depth() < 0 || prefix.parent().is_prefix_of(&self.local_id);
        home_or_sibling || prefix.depth() % self.split_every == 0
    }

    fn split(&mut self, idx: usize, now: u64) {
        let mut bucket = self.buckets.remove(idx);
        let prefix = *bucket.prefix();
        debug!(?prefix, "splitting bucket");

        let mut low = KBucket::new(prefix.split_branch(false));
        let mut high = KBucket::new(prefix.split_branch(true));
        let (entries, replacements) = bucket.drain();
        for entry in entries {
            if low.prefix().is_prefix_of(entry.id()) {
                low.put(entry, now);
            } else {
                high.put(entry, now);
            }
        }
        for replacement in replacements {
            if low.prefix().is_prefix_of(replacement.id()) {
                low.put_as_replacement(replacement, now);
            } else {
                high.put_as_replacement(replacement, now);
            }
        }
        self.buckets.insert(idx, high);
        self.buckets.insert(idx, low);
    }

    fn merge_pass(&mut self, now: u64) {
        use crate::constants::BUCKET_MERGE_QUIET;
        let quiet_ms = BUCKET_MERGE_QUIET.as_millis() as u64;

        let mut i = 0;
        while i + 1 < self.buckets.len() {
            let mergeable = {
                let a = &self.buckets[i];
                let b = &self.buckets[i + 1];
                a.prefix().is_sibling_of(b.prefix())
                    && !a.prefix().is_prefix_of(&self.local_id)
                    && !b.prefix().is_prefix_of(&self.local_id)
                    && a.len() + b.len() <= MAX_ENTRIES
                    && now.saturating_sub(a.last_modified()) >= quiet_ms
                    && now.saturating_sub(b.last_modified()) >= quiet_ms
            };
            if !mergeable {
                i += 1;
                continue;
            }

            let mut b = self.buckets.remove(i + 1);
            let mut a = self.buckets.remove(i);
            let parent = a.prefix().parent();
            debug!(?parent, "merging sibling buckets");
            let mut merged = KBucket::new(parent);
            let (entries_a, repl_a) = a.drain();
            let (entries_b, repl_b) = b.drain();
            for entry in entries_a.into_iter().chain(entries_b) {
                merged.put(entry, now);
            }
            for replacement in repl_a.into_iter().chain(repl_b) {
                merged.put_as_replacement(replacement, now);
            }
            self.buckets.insert(i, merged);
            // A merge may enable another one level up.
            i = i.saturating_sub(1);
        }
    }

    // ------------------------------------------------------- persistence

    /// Persist every bucket to `path` as CBOR.
    pub fn save(&self, path: &Path) -> Result<(), DhtError> {
        let saved = SavedTable {
            local_id: self.local_id,
            buckets: self
                .buckets
                .iter()
                .map(|bucket| SavedBucket {
                    prefix: bucket.prefix().first_id(),
                    depth: bucket.prefix().depth(),
                    entries: bucket.entries().iter().map(SavedEntry::of).collect(),
                    replacements: bucket.replacements().iter().map(SavedEntry::of).collect(),
                })
                .collect(),
        };

        let mut buf = Vec::new();
        ciborium::ser::into_writer(&saved, &mut buf)
            .map_err(|e| DhtError::Generic(format!("encoding routing table: {}", e)))?;
        std::fs::write(path, buf)
            .map_err(|e| DhtError::Generic(format!("writing {}: {}", path.display(), e)))?;
        info!(entries = self.num_entries(), path = %path.display(), "routing table saved");
        Ok(())
    }

    /// Best-effort load: a missing or unreadable file yields an empty
    /// table, malformed entries are skipped.
    pub fn load(path: &Path, local_id: Id, now: u64) -> RoutingTable {
        let mut table = RoutingTable::new(local_id);
        let Ok(bytes) = std::fs::read(path) else {
            return table;
        };
        let saved: SavedTable = match ciborium::de::from_reader(bytes.as_slice()) {
            Ok(saved) => saved,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable routing table");
                return table;
            }
        };
        if saved.local_id != local_id {
            warn!("persisted routing table belongs to a different identity, discarding");
            return table;
        }

        let mut restored = 0usize;
        for bucket in saved.buckets {
            for entry in bucket.entries {
                table.put(entry.into_entry(), now);
                restored += 1;
            }
            for replacement in bucket.replacements {
                table.put_as_replacement(replacement.into_entry(), now);
            }
        }
        info!(entries = restored, "routing table loaded");
        table
    }
}

/// Persisted form of a bucket entry.
#[derive(Debug, Serialize, Deserialize)]
struct SavedEntry {
    id: Id,
    host: IpAddr,
    port: u16,
    #[serde(default)]
    version: Option<[u8; 4]>,
    reachable: bool,
    created: u64,
    last_seen: u64,
    last_sent: u64,
    failed_requests: u32,
    rtt: u64,
}

impl SavedEntry {
    fn of(entry: &KBucketEntry) -> Self {
        SavedEntry {
            id: *entry.id(),
            host: entry.addr().ip(),
            port: entry.addr().port(),
            version: entry.version(),
            reachable: entry.is_reachable(),
            created: entry.created_at(),
            last_seen: entry.last_seen(),
            last_sent: entry.last_sent(),
            failed_requests: entry.failed_requests(),
            rtt: entry.rtt(),
        }
    }

    fn into_entry(self) -> KBucketEntry {
        KBucketEntry::restore(
            NodeInfo::new(self.id, (self.host, self.port).into()),
            self.version,
            self.reachable,
            self.created,
            self.last_seen,
            self.last_sent,
            self.failed_requests,
            self.rtt,
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedBucket {
    prefix: Id,
    depth: i32,
    entries: Vec<SavedEntry>,
    #[serde(default)]
    replacements: Vec<SavedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedTable {
    local_id: Id,
    buckets: Vec<SavedBucket>,
}
