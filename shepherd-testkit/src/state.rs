use std::path::PathBuf;

use chrono::Utc;
use tempfile::TempDir;

use shepherd::store::atomic_write_text;
use shepherd::{RunMeta, RunMode, StateStore};

/// A throwaway state root that lives as long as the test.
pub struct TestState {
    pub store: StateStore,
    _tmp: TempDir,
}

impl TestState {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("temp state root");
        let store = StateStore::new(tmp.path());
        store.ensure_layout().expect("state layout");
        Self { store, _tmp: tmp }
    }

    /// A run record with test-friendly policy: no backoff delay, short
    /// grace, retries per the caller.
    pub fn quick_meta(&self, run_id: &str, run_mode: RunMode) -> RunMeta {
        let mut meta = RunMeta::new(
            run_id,
            run_mode,
            PathBuf::from("/tmp/job.sh"),
            Utc::now().timestamp(),
        );
        meta.policy.backoff_base_sec = 0;
        meta.policy.heartbeat_grace_sec = 90;
        meta
    }

    pub fn write_meta(&self, meta: &RunMeta) {
        self.store.write_meta(meta).expect("write meta");
    }

    pub fn read_meta(&self, run_id: &str) -> RunMeta {
        self.store.read_meta(run_id).expect("meta present")
    }

    /// Write a heartbeat with the given epoch value.
    pub fn write_heartbeat(&self, run_id: &str, epoch: i64) {
        atomic_write_text(&self.store.heartbeat_path(run_id), &format!("{epoch}\n"))
            .expect("write heartbeat");
    }

    /// Write a heartbeat dated now.
    pub fn beat_now(&self, run_id: &str) {
        self.write_heartbeat(run_id, Utc::now().timestamp());
    }
}

impl Default for TestState {
    fn default() -> Self {
        Self::new()
    }
}
