//! A single k-bucket: up to K live entries plus a replacement cache.

use lib_core::{Id, NodeInfo, Prefix};
use tracing::debug;

use crate::constants::{BUCKET_REFRESH_INTERVAL, MAX_ENTRIES};

use super::entry::KBucketEntry;

/// Container for at most K nodes sharing an id prefix.
///
/// Invariants: entries and replacements each hold at most K items, no id
/// appears in both lists, entries stay sorted by `created_at`, and every
/// entry's id matches the bucket prefix.
#[derive(Debug)]
pub struct KBucket {
    prefix: Prefix,
    entries: Vec<KBucketEntry>,
    replacements: Vec<KBucketEntry>,
    /// Zero forces refresh eligibility after the next maintenance pass.
    last_refresh: u64,
    last_modified: u64,
}

impl KBucket {
    pub fn new(prefix: Prefix) -> Self {
        KBucket {
            prefix,
            entries: Vec::new(),
            replacements: Vec::new(),
            last_refresh: 0,
            last_modified: 0,
        }
    }

    pub fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    pub fn entries(&self) -> &[KBucketEntry] {
        &self.entries
    }

    pub fn replacements(&self) -> &[KBucketEntry] {
        &self.replacements
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_ENTRIES
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.iter().any(|e| e.id() == id)
    }

    pub fn entry(&self, id: &Id) -> Option<&KBucketEntry> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn replacement(&self, id: &Id) -> Option<&KBucketEntry> {
        self.replacements.iter().find(|e| e.id() == id)
    }

    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }

    /// Whether any live entry is eligible for eviction.
    pub fn has_bad_entry(&self, now: u64) -> bool {
        self.entries.iter().any(|e| e.needs_replacement(now))
    }

    /// Whether any entry wants a verification ping.
    pub fn has_entry_needing_ping(&self, now: u64) -> bool {
        self.entries.iter().any(|e| e.needs_ping(now))
    }

    /// Whether this bucket is due a ping-refresh task.
    pub fn needs_refresh(&self, now: u64) -> bool {
        !self.entries.is_empty()
            && now.saturating_sub(self.last_refresh) > BUCKET_REFRESH_INTERVAL.as_millis() as u64
            && self.has_entry_needing_ping(now)
    }

    pub fn mark_refreshed(&mut self, now: u64) {
        self.last_refresh = now;
    }

    /// Insert or update `entry`.
    ///
    /// Merge when the id is known; append while there is room; evict a bad
    /// entry when there is one; otherwise park the node in the replacement
    /// cache. Any accepted change zeroes `last_refresh` so the bucket
    /// becomes refresh-eligible again.
    pub fn put(&mut self, entry: KBucketEntry, now: u64) {
        debug_assert!(self.prefix.is_prefix_of(entry.id()));

        if let Some(existing) = self.entries.iter_mut().find(|e| e.id() == entry.id()) {
            existing.merge(&entry);
            self.touch(now);
            return;
        }

        if !self.is_full() {
            self.remove_replacement(entry.id());
            self.insert_in_age_order(entry);
            self.touch(now);
            return;
        }

        if let Some(bad_idx) = self.entries.iter().position(|e| e.needs_replacement(now)) {
            let evicted = self.entries.remove(bad_idx);
            debug!(evicted = %evicted.id(), inserted = %entry.id(), "swapping bad entry");
            self.remove_replacement(entry.id());
            self.insert_in_age_order(entry);
            self.touch(now);
            return;
        }

        self.put_as_replacement(entry, now);
    }

    /// Park `entry` in the replacement cache unless it is already a live
    /// entry. The cache is capped at K; the stalest unverified entry makes
    /// way for fresh blood.
    pub fn put_as_replacement(&mut self, entry: KBucketEntry, now: u64) {
        if self.contains(entry.id()) {
            return;
        }
        if let Some(existing) = self.replacements.iter_mut().find(|e| e.id() == entry.id()) {
            existing.merge(&entry);
            return;
        }
        if self.replacements.len() >= MAX_ENTRIES {
            let victim = self
                .replacements
                .iter()
                .position(|e| !e.is_reachable())
                .unwrap_or(0);
            self.replacements.remove(victim);
        }
        self.replacements.push(entry);
        self.last_modified = now;
    }

    /// Remove the live entry `id` when it is bad and a verified stand-in
    /// exists, or unconditionally with `force`. Returns the removed entry.
    pub fn remove_if_bad(&mut self, id: &Id, force: bool, now: u64) -> Option<KBucketEntry> {
        let idx = self.entries.iter().position(|e| e.id() == id)?;
        let has_verified_replacement = self.replacements.iter().any(|e| e.is_reachable());
        let bad = self.entries[idx].needs_replacement(now);
        if force || (bad && has_verified_replacement) {
            let removed = self.entries.remove(idx);
            self.promote_verified_replacement(now);
            self.last_modified = now;
            return Some(removed);
        }
        None
    }

    /// Remove `id` from the replacement cache.
    pub fn remove_replacement(&mut self, id: &Id) -> Option<KBucketEntry> {
        let idx = self.replacements.iter().position(|e| e.id() == id)?;
        Some(self.replacements.remove(idx))
    }

    /// Move a reachable replacement into the live list while there is room.
    pub fn promote_verified_replacement(&mut self, now: u64) {
        while self.entries.len() < MAX_ENTRIES {
            let Some(idx) = self
                .replacements
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_reachable())
                .max_by_key(|(_, e)| e.last_seen())
                .map(|(i, _)| i)
            else {
                return;
            };
            let promoted = self.replacements.remove(idx);
            debug!(id = %promoted.id(), "promoting replacement");
            self.insert_in_age_order(promoted);
            self.last_modified = now;
        }
    }

    /// Record a timeout against `id`; a now-bad entry in a full bucket
    /// gives way to a verified replacement immediately.
    pub fn on_timeout(&mut self, id: &Id, now: u64) {
        let in_entries = if let Some(entry) = self.entries.iter_mut().find(|e| e.id() == id) {
            entry.on_timeout();
            true
        } else {
            false
        };
        if in_entries {
            if self.is_full() {
                self.remove_if_bad(id, false, now);
            }
        } else if let Some(replacement) = self.replacements.iter_mut().find(|e| e.id() == id) {
            replacement.on_timeout();
        }
    }

    pub fn on_responded(&mut self, id: &Id, rtt_ms: u64, now: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id() == id) {
            entry.on_responded(now, rtt_ms);
        } else if let Some(replacement) = self.replacements.iter_mut().find(|e| e.id() == id) {
            replacement.on_responded(now, rtt_ms);
        }
    }

    pub fn on_request_sent(&mut self, id: &Id, now: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id() == id) {
            entry.on_request_sent(now);
        }
    }

    /// Housekeeping pass:
    /// 1. drop any entry carrying the local id,
    /// 2. drop entries that no longer match the prefix, reporting each
    ///    through `on_drop`,
    /// 3. in a full non-home bucket, evict one bootstrap node silently to
    ///    keep the table from ossifying around the well-known entry points.
    pub fn cleanup(
        &mut self,
        local_id: &Id,
        bootstrap_ids: &[Id],
        now: u64,
        on_drop: &mut dyn FnMut(&NodeInfo),
    ) {
        self.entries.retain(|e| e.id() != local_id);
        self.replacements.retain(|e| e.id() != local_id);

        let prefix = self.prefix;
        let mut dropped = Vec::new();
        self.entries.retain(|e| {
            if prefix.is_prefix_of(e.id()) {
                true
            } else {
                dropped.push(e.node().clone());
                false
            }
        });
        self.replacements.retain(|e| prefix.is_prefix_of(e.id()));
        for node in &dropped {
            on_drop(node);
        }

        let is_home = self.prefix.is_prefix_of(local_id);
        if self.is_full() && !is_home {
            if let Some(idx) = self
                .entries
                .iter()
                .position(|e| bootstrap_ids.contains(e.id()))
            {
                let evicted = self.entries.remove(idx);
                debug!(id = %evicted.id(), "evicting bootstrap node from full bucket");
                self.last_modified = now;
            }
        }
        if !dropped.is_empty() {
            self.last_modified = now;
        }
    }

    /// Drain every entry and replacement, e.g. when splitting.
    pub fn drain(&mut self) -> (Vec<KBucketEntry>, Vec<KBucketEntry>) {
        (
            std::mem::take(&mut self.entries),
            std::mem::take(&mut self.replacements),
        )
    }

    fn insert_in_age_order(&mut self, entry: KBucketEntry) {
        let pos = self
            .entries
            .partition_point(|e| e.created_at() <= entry.created_at());
        self.entries.insert(pos, entry);
    }

    fn touch(&mut self, now: u64) {
        self.last_refresh = 0;
        self.last_modified = now;
    }
}
