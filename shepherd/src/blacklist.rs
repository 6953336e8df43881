//! TTL-bounded node blacklist shared by every run.
//!
//! A single JSON document under the state root, mutated read-modify-write
//! under a global lockfile. Expired entries are pruned on every write, and
//! the exclude list handed to submissions is capped at the most recently
//! added nodes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::{self, LockGuard, StateStore, StoreError};

/// One blacklisted node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub reason: String,
    pub added_at: i64,
    pub ttl_sec: i64,
    /// Times this node has been re-blacklisted while already present.
    #[serde(default)]
    pub strikes: u32,
}

impl BlacklistEntry {
    /// An entry expires once its age strictly exceeds its TTL.
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.added_at > self.ttl_sec
    }
}

/// The blacklist document (`blacklist.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Blacklist {
    #[serde(default)]
    pub nodes: BTreeMap<String, BlacklistEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl Blacklist {
    /// Insert or refresh a node. Re-blacklisting a live entry bumps its
    /// strike count and restarts its TTL.
    pub fn insert(&mut self, node: impl Into<String>, reason: impl Into<String>, ttl_sec: i64, now: i64) {
        let node = node.into();
        let strikes = self
            .nodes
            .get(&node)
            .map(|entry| entry.strikes + 1)
            .unwrap_or(0);
        self.nodes.insert(
            node,
            BlacklistEntry {
                reason: reason.into(),
                added_at: now,
                ttl_sec,
                strikes,
            },
        );
    }

    /// Remove a node. Returns whether it was present.
    pub fn remove(&mut self, node: &str) -> bool {
        self.nodes.remove(node).is_some()
    }

    /// Drop every expired entry.
    pub fn prune_expired(&mut self, now: i64) {
        self.nodes.retain(|_, entry| !entry.is_expired(now));
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    /// Nodes to exclude from a submission: live entries only, most recently
    /// added first, capped at `limit`.
    pub fn exclude_list(&self, now: i64, limit: usize) -> Vec<String> {
        let mut live: Vec<(&String, &BlacklistEntry)> = self
            .nodes
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .collect();
        live.sort_by(|a, b| b.1.added_at.cmp(&a.1.added_at).then_with(|| a.0.cmp(b.0)));
        live.into_iter()
            .take(limit)
            .map(|(node, _)| node.clone())
            .collect()
    }
}

/// Persistent handle on the blacklist document plus its global lock.
#[derive(Clone, Debug)]
pub struct BlacklistStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl BlacklistStore {
    pub fn new(store: &StateStore) -> Self {
        Self {
            path: store.blacklist_path(),
            lock_path: store.blacklist_lock_path(),
        }
    }

    /// Lock-free tolerant read; a missing or corrupt document is empty.
    pub fn load(&self) -> Blacklist {
        store::read_json_tolerant(&self.path).unwrap_or_default()
    }

    /// Read-modify-write under the global lock. Expired entries are pruned
    /// before the document goes back to disk.
    pub fn update<R>(
        &self,
        now: i64,
        mutate: impl FnOnce(&mut Blacklist) -> R,
    ) -> Result<R, StoreError> {
        let _guard: LockGuard = loop {
            match store::try_lock(&self.lock_path)? {
                Some(guard) => break guard,
                // Contention on the blacklist is short-lived; spin briefly
                // rather than dropping the mutation.
                None => std::thread::sleep(std::time::Duration::from_millis(10)),
            }
        };
        let mut blacklist = self.load();
        let result = mutate(&mut blacklist);
        blacklist.prune_expired(now);
        blacklist.updated_at = Some(now);
        store::atomic_write_json(&self.path, &blacklist)?;
        debug!(nodes = blacklist.nodes.len(), "blacklist updated");
        Ok(result)
    }

    /// Add a node with the given TTL and reason.
    pub fn add(
        &self,
        node: &str,
        reason: &str,
        ttl_sec: i64,
        now: i64,
    ) -> Result<(), StoreError> {
        self.update(now, |blacklist| blacklist.insert(node, reason, ttl_sec, now))
    }

    /// Remove a node. Returns whether it was present.
    pub fn remove(&self, node: &str, now: i64) -> Result<bool, StoreError> {
        self.update(now, |blacklist| blacklist.remove(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_insert_and_expire() {
        let mut blacklist = Blacklist::default();
        blacklist.insert("node-a", "node_fault", 100, 1000);
        assert!(blacklist.contains("node-a"));
        assert!(!blacklist.nodes["node-a"].is_expired(1100));
        // Age strictly beyond the TTL expires the entry.
        assert!(blacklist.nodes["node-a"].is_expired(1101));
        blacklist.prune_expired(1101);
        assert!(!blacklist.contains("node-a"));
    }

    #[test]
    fn test_reinsert_bumps_strikes() {
        let mut blacklist = Blacklist::default();
        blacklist.insert("node-a", "cuda_failure", 100, 1000);
        blacklist.insert("node-a", "cuda_failure", 100, 1050);
        assert_eq!(blacklist.nodes["node-a"].strikes, 1);
        assert_eq!(blacklist.nodes["node-a"].added_at, 1050);
    }

    #[test]
    fn test_exclude_list_recency_and_cap() {
        let mut blacklist = Blacklist::default();
        blacklist.insert("old", "node_fault", 10_000, 100);
        blacklist.insert("mid", "node_fault", 10_000, 200);
        blacklist.insert("new", "node_fault", 10_000, 300);
        blacklist.insert("expired", "node_fault", 10, 100);

        let excluded = blacklist.exclude_list(400, 2);
        assert_eq!(excluded, vec!["new", "mid"]);
        // No expired entry ever reaches the exclude list.
        let all = blacklist.exclude_list(400, 64);
        assert!(!all.contains(&"expired".to_string()));
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_store_round_trip_prunes_on_write() {
        let tmp = TempDir::new().unwrap();
        let state = StateStore::new(tmp.path());
        let store = BlacklistStore::new(&state);

        store.add("node-a", "node_fault", 10_000, 1000).unwrap();
        store.add("node-b", "trespasser", 10, 1000).unwrap();
        // node-b has expired by the time of this write, so pruning drops it.
        store.add("node-c", "cuda_failure", 10_000, 2000).unwrap();

        let blacklist = store.load();
        assert!(blacklist.contains("node-a"));
        assert!(!blacklist.contains("node-b"));
        assert!(blacklist.contains("node-c"));
    }

    #[test]
    fn test_store_remove() {
        let tmp = TempDir::new().unwrap();
        let state = StateStore::new(tmp.path());
        let store = BlacklistStore::new(&state);
        store.add("node-a", "node_fault", 1000, 0).unwrap();
        assert!(store.remove("node-a", 1).unwrap());
        assert!(!store.remove("node-a", 2).unwrap());
    }
}
