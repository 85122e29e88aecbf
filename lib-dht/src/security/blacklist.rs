//! Operator-managed ban list for hosts and node ids.
//!
//! Reads happen on the datagram hot path, so the sets live in an immutable
//! snapshot behind an `Arc`; writers build a new snapshot and swap it in.
//! The list persists as JSON or YAML, chosen by file extension.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lib_core::{DhtError, Id};

#[derive(Debug, Default)]
struct Snapshot {
    hosts: HashSet<String>,
    ids: HashSet<Id>,
}

/// Copy-on-write ban list; cheap shared reads, single-writer updates.
#[derive(Debug, Default)]
pub struct Blacklist {
    inner: RwLock<Arc<Snapshot>>,
}

/// On-disk representation; ids serialise as hex strings.
#[derive(Debug, Default, Serialize, Deserialize)]
struct BlacklistFile {
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    ids: Vec<String>,
}

impl Blacklist {
    pub fn new() -> Self {
        Blacklist::default()
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.read().clone()
    }

    fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        let mut guard = self.inner.write();
        let mut next = Snapshot {
            hosts: guard.hosts.clone(),
            ids: guard.ids.clone(),
        };
        f(&mut next);
        *guard = Arc::new(next);
    }

    pub fn ban_host(&self, host: impl Into<String>) {
        let host = host.into();
        info!(%host, "blacklisting host");
        self.update(|s| {
            s.hosts.insert(host);
        });
    }

    pub fn ban_id(&self, id: Id) {
        info!(%id, "blacklisting id");
        self.update(|s| {
            s.ids.insert(id);
        });
    }

    pub fn unban_host(&self, host: &str) {
        self.update(|s| {
            s.hosts.remove(host);
        });
    }

    pub fn unban_id(&self, id: &Id) {
        self.update(|s| {
            s.ids.remove(id);
        });
    }

    pub fn is_host_banned(&self, host: &str) -> bool {
        self.snapshot().hosts.contains(host)
    }

    pub fn is_id_banned(&self, id: &Id) -> bool {
        self.snapshot().ids.contains(id)
    }

    /// Banned when either the id or the host is listed.
    pub fn is_banned(&self, id: &Id, host: &str) -> bool {
        let snapshot = self.snapshot();
        snapshot.ids.contains(id) || snapshot.hosts.contains(host)
    }

    pub fn len(&self) -> usize {
        let snapshot = self.snapshot();
        snapshot.hosts.len() + snapshot.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load entries from `path`, merging into the current list.
    ///
    /// Malformed id strings are skipped with a warning; a missing file is
    /// not an error.
    pub fn load(&self, path: &Path) -> Result<(), DhtError> {
        if !path.exists() {
            return Ok(());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| DhtError::Generic(format!("reading {}: {}", path.display(), e)))?;
        let file: BlacklistFile = if is_yaml(path) {
            serde_yaml::from_str(&text)
                .map_err(|e| DhtError::Generic(format!("parsing {}: {}", path.display(), e)))?
        } else {
            serde_json::from_str(&text)
                .map_err(|e| DhtError::Generic(format!("parsing {}: {}", path.display(), e)))?
        };

        self.update(|s| {
            s.hosts.extend(file.hosts);
            for text in file.ids {
                match text.parse::<Id>() {
                    Ok(id) => {
                        s.ids.insert(id);
                    }
                    Err(_) => warn!(entry = %text, "skipping malformed blacklist id"),
                }
            }
        });
        Ok(())
    }

    /// Persist the current list to `path`.
    pub fn save(&self, path: &Path) -> Result<(), DhtError> {
        let snapshot = self.snapshot();
        let mut file = BlacklistFile {
            hosts: snapshot.hosts.iter().cloned().collect(),
            ids: snapshot.ids.iter().map(Id::to_hex).collect(),
        };
        file.hosts.sort();
        file.ids.sort();

        let text = if is_yaml(path) {
            serde_yaml::to_string(&file)
                .map_err(|e| DhtError::Generic(format!("encoding blacklist: {}", e)))?
        } else {
            serde_json::to_string_pretty(&file)
                .map_err(|e| DhtError::Generic(format!("encoding blacklist: {}", e)))?
        };
        std::fs::write(path, text)
            .map_err(|e| DhtError::Generic(format!("writing {}: {}", path.display(), e)))?;
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
