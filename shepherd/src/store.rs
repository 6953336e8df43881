//! Shared-filesystem state store.
//!
//! Layout under the state root (a persisted, compatibility-critical contract):
//!
//! ```text
//! <state_root>/
//!   runs/<run_id>/
//!     meta.json          control.json       heartbeat
//!     progress.json?     failure.json?      final.json?
//!     ended.json?        badnode_events.log
//!   blacklist.json
//!   locks/<run_id>.lock
//!   daemon.pid
//! ```
//!
//! Every write goes through temp + fsync + rename so readers never observe a
//! partial file. JSON that fails to parse is quarantined with a
//! `.corrupt.<nanos>` suffix and reported as missing; the supervisor never
//! crashes on a malformed file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::config::RunMeta;
use crate::run::{ControlSignals, EndedMarker, FailureRecord, Progress};

pub const META_FILENAME: &str = "meta.json";
pub const CONTROL_FILENAME: &str = "control.json";
pub const HEARTBEAT_FILENAME: &str = "heartbeat";
pub const PROGRESS_FILENAME: &str = "progress.json";
pub const FAILURE_FILENAME: &str = "failure.json";
pub const FINAL_FILENAME: &str = "final.json";
pub const ENDED_FILENAME: &str = "ended.json";
pub const BADNODE_EVENTS_FILENAME: &str = "badnode_events.log";
pub const BLACKLIST_FILENAME: &str = "blacklist.json";
pub const DAEMON_PID_FILENAME: &str = "daemon.pid";

/// Errors from state-store writes and layout operations.
///
/// Reads are tolerant by design and do not produce errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid run id: {0:?}")]
    InvalidRunId(String),
    #[error("run already exists: {0}")]
    RunExists(String),
    #[error("another daemon is already running (pid {0})")]
    DaemonRunning(u32),
}

fn io_err(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Atomically replace `path` with `text`: write `name.tmp.<pid>.<nanos>`,
/// fsync, rename over the target, then fsync the directory best-effort.
pub fn atomic_write_text(path: &Path, text: &str) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let tmp = parent.join(format!(
        "{file_name}.tmp.{}.{}",
        std::process::id(),
        now_nanos()
    ));
    let result = (|| {
        let mut handle = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        handle
            .write_all(text.as_bytes())
            .map_err(|e| io_err(&tmp, e))?;
        handle.sync_all().map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Atomically replace `path` with the JSON encoding of `value`, newline
/// terminated.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let mut body = serde_json::to_string(value).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    body.push('\n');
    atomic_write_text(path, &body)
}

/// Rename a malformed file aside so the evidence survives, then report it
/// as missing.
fn quarantine(path: &Path, why: &str) {
    let aside = PathBuf::from(format!("{}.corrupt.{}", path.display(), now_nanos()));
    match fs::rename(path, &aside) {
        Ok(()) => warn!(path = %path.display(), aside = %aside.display(), why, "quarantined corrupt state file"),
        Err(error) => warn!(path = %path.display(), %error, why, "failed to quarantine corrupt state file"),
    }
}

/// Load a JSON document, treating absence and corruption both as `None`.
pub fn read_json_tolerant<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return None,
        Err(error) => {
            warn!(path = %path.display(), %error, "unreadable state file");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(error) => {
            quarantine(path, "json parse failure");
            warn!(path = %path.display(), %error, "malformed state file treated as missing");
            None
        }
    }
}

/// Load a text file, treating absence and unreadability as `None`.
pub fn read_text_tolerant(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(error) if error.kind() == io::ErrorKind::NotFound => None,
        Err(error) => {
            warn!(path = %path.display(), %error, "unreadable state file");
            None
        }
    }
}

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if another
/// process holds it.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: flock is a standard POSIX call; fd is a valid descriptor
        // owned by `file` for the duration of the call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

/// Advisory lock held for the duration of one tick's mutations on a run
/// (or for one blacklist read-modify-write). Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: unlocking a descriptor we still own; errors are moot
            // because closing the fd releases the lock anyway.
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// Non-blocking acquisition of the lockfile at `path`. `None` = contended.
pub fn try_lock(path: &Path) -> Result<Option<LockGuard>, StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_err(path, e))?;
    match try_flock_exclusive(&file) {
        Ok(true) => Ok(Some(LockGuard { file })),
        Ok(false) => Ok(None),
        Err(source) => Err(io_err(path, source)),
    }
}

/// Handle on the state root with typed accessors for every per-run file.
#[derive(Clone, Debug)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open a store rooted at `root`. No filesystem access happens here.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open the store at `$SHEPHERD_STATE_DIR` (or `~/.shepherd`).
    pub fn from_env() -> Self {
        Self::new(crate::config::default_state_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn blacklist_path(&self) -> PathBuf {
        self.root.join(BLACKLIST_FILENAME)
    }

    /// Lockfile serializing blacklist read-modify-write cycles. Lives next
    /// to the document, not under `locks/`, so it cannot collide with a run
    /// id.
    pub fn blacklist_lock_path(&self) -> PathBuf {
        self.root.join(format!("{BLACKLIST_FILENAME}.lock"))
    }

    pub fn daemon_pid_path(&self) -> PathBuf {
        self.root.join(DAEMON_PID_FILENAME)
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    pub fn run_file(&self, run_id: &str, name: &str) -> PathBuf {
        self.run_dir(run_id).join(name)
    }

    /// Create the `runs/` and `locks/` directories.
    pub fn ensure_layout(&self) -> Result<(), StoreError> {
        for dir in [self.runs_dir(), self.locks_dir()] {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        Ok(())
    }

    /// All run ids present on disk, sorted.
    pub fn list_runs(&self) -> Vec<String> {
        let runs_dir = self.runs_dir();
        let entries = match fs::read_dir(&runs_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut runs: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        runs.sort();
        runs
    }

    /// Acquire the per-run lock, non-blocking. `None` means another ticker
    /// holds it; skip the run until the next tick.
    pub fn try_lock_run(&self, run_id: &str) -> Result<Option<LockGuard>, StoreError> {
        try_lock(&self.locks_dir().join(format!("{run_id}.lock")))
    }

    pub fn read_meta(&self, run_id: &str) -> Option<RunMeta> {
        read_json_tolerant(&self.run_file(run_id, META_FILENAME))
    }

    pub fn write_meta(&self, meta: &RunMeta) -> Result<(), StoreError> {
        atomic_write_json(&self.run_file(&meta.run_id, META_FILENAME), meta)
    }

    /// Missing or corrupt control files read as all-clear defaults.
    pub fn read_control(&self, run_id: &str) -> ControlSignals {
        read_json_tolerant(&self.run_file(run_id, CONTROL_FILENAME)).unwrap_or_default()
    }

    pub fn write_control(&self, run_id: &str, control: &ControlSignals) -> Result<(), StoreError> {
        atomic_write_json(&self.run_file(run_id, CONTROL_FILENAME), control)
    }

    pub fn read_ended(&self, run_id: &str) -> Option<EndedMarker> {
        read_json_tolerant(&self.run_file(run_id, ENDED_FILENAME))
    }

    pub fn write_ended(&self, run_id: &str, marker: &EndedMarker) -> Result<(), StoreError> {
        atomic_write_json(&self.run_file(run_id, ENDED_FILENAME), marker)
    }

    pub fn read_failure(&self, run_id: &str) -> Option<FailureRecord> {
        read_json_tolerant(&self.run_file(run_id, FAILURE_FILENAME))
    }

    pub fn write_failure(&self, run_id: &str, record: &FailureRecord) -> Result<(), StoreError> {
        atomic_write_json(&self.run_file(run_id, FAILURE_FILENAME), record)
    }

    /// The final marker is presence-keyed; its body stays empty.
    pub fn has_final(&self, run_id: &str) -> bool {
        self.run_file(run_id, FINAL_FILENAME).exists()
    }

    pub fn write_final(&self, run_id: &str) -> Result<(), StoreError> {
        atomic_write_json(
            &self.run_file(run_id, FINAL_FILENAME),
            &serde_json::json!({}),
        )
    }

    pub fn read_progress(&self, run_id: &str) -> Option<Progress> {
        read_json_tolerant(&self.run_file(run_id, PROGRESS_FILENAME))
    }

    pub fn heartbeat_path(&self, run_id: &str) -> PathBuf {
        self.run_file(run_id, HEARTBEAT_FILENAME)
    }

    pub fn read_heartbeat(&self, run_id: &str) -> Option<i64> {
        read_text_tolerant(&self.heartbeat_path(run_id))
            .and_then(|text| crate::heartbeat::parse_heartbeat(&text))
    }

    /// Append one line to the run's bad-node event log (rewritten atomically
    /// so readers never see a torn line).
    pub fn append_badnode_event(&self, run_id: &str, line: &str) -> Result<(), StoreError> {
        let path = self.run_file(run_id, BADNODE_EVENTS_FILENAME);
        let mut log = read_text_tolerant(&path).unwrap_or_default();
        log.push_str(line);
        if !line.ends_with('\n') {
            log.push('\n');
        }
        atomic_write_text(&path, &log)
    }

    /// Remove the terminal markers so a restarted run starts clean. The
    /// heartbeat stays: a stale one is shielded by the startup grace anyway.
    pub fn clear_terminal(&self, run_id: &str) -> Result<(), StoreError> {
        for name in [ENDED_FILENAME, FINAL_FILENAME, FAILURE_FILENAME] {
            let path = self.run_file(run_id, name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(io_err(&path, source)),
            }
        }
        Ok(())
    }

    /// Claim the daemon pid file, refusing if a live daemon already holds it.
    /// A pid file pointing at a dead process is removed as stale.
    pub fn claim_daemon_pid(&self) -> Result<(), StoreError> {
        let path = self.daemon_pid_path();
        if let Some(text) = read_text_tolerant(&path) {
            if let Ok(pid) = text.trim().parse::<i32>() {
                // SAFETY: kill with signal 0 only probes for existence.
                let alive = unsafe { libc::kill(pid, 0) } == 0;
                if alive && pid as u32 != std::process::id() {
                    return Err(StoreError::DaemonRunning(pid as u32));
                }
            }
            let _ = fs::remove_file(&path);
        }
        atomic_write_text(&path, &format!("{}\n", std::process::id()))
    }

    pub fn release_daemon_pid(&self) {
        let _ = fs::remove_file(self.daemon_pid_path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{EndedReason, RunMode};
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        store.ensure_layout().unwrap();
        (tmp, store)
    }

    #[test]
    fn test_meta_round_trip_is_bit_exact() {
        let (_tmp, store) = store();
        let meta = RunMeta::new("run-1", RunMode::RunOnce, PathBuf::from("/tmp/job.sh"), 7);
        store.write_meta(&meta).unwrap();
        let loaded = store.read_meta("run-1").unwrap();
        assert_eq!(
            serde_json::to_string(&meta).unwrap(),
            serde_json::to_string(&loaded).unwrap()
        );
    }

    #[test]
    fn test_corrupt_meta_is_quarantined() {
        let (_tmp, store) = store();
        let path = store.run_file("run-2", META_FILENAME);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{invalid-json").unwrap();

        assert!(store.read_meta("run-2").is_none());
        // The original file was moved aside, not deleted.
        assert!(!path.exists());
        let aside: Vec<_> = fs::read_dir(store.run_dir("run-2"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt."))
            .collect();
        assert_eq!(aside.len(), 1);
    }

    #[test]
    fn test_missing_control_reads_as_default() {
        let (_tmp, store) = store();
        let control = store.read_control("nope");
        assert!(!control.paused);
        assert!(!control.stop_requested);
    }

    #[test]
    fn test_ended_marker_round_trip() {
        let (_tmp, store) = store();
        let marker = EndedMarker {
            reason: EndedReason::Success,
            at: 99,
            run_mode: RunMode::RunOnce,
        };
        store.write_ended("run-3", &marker).unwrap();
        let loaded = store.read_ended("run-3").unwrap();
        assert_eq!(loaded.reason, EndedReason::Success);
        assert_eq!(loaded.at, 99);
    }

    #[test]
    fn test_run_lock_excludes_second_holder() {
        let (_tmp, store) = store();
        let guard = store.try_lock_run("run-4").unwrap();
        assert!(guard.is_some());
        // Same process, same fd family: a second open with flock must fail
        // to acquire while the first guard is alive.
        let second = store.try_lock_run("run-4").unwrap();
        assert!(second.is_none());
        drop(guard);
        let third = store.try_lock_run("run-4").unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn test_heartbeat_read() {
        let (_tmp, store) = store();
        atomic_write_text(&store.heartbeat_path("run-5"), "1234\n").unwrap();
        assert_eq!(store.read_heartbeat("run-5"), Some(1234));
        assert_eq!(store.read_heartbeat("run-6"), None);
    }

    #[test]
    fn test_clear_terminal_removes_markers() {
        let (_tmp, store) = store();
        store.write_final("run-7").unwrap();
        store
            .write_ended(
                "run-7",
                &EndedMarker {
                    reason: EndedReason::StoppedManual,
                    at: 1,
                    run_mode: RunMode::RunOnce,
                },
            )
            .unwrap();
        store.clear_terminal("run-7").unwrap();
        assert!(!store.has_final("run-7"));
        assert!(store.read_ended("run-7").is_none());
        // Clearing an already-clean run is a no-op.
        store.clear_terminal("run-7").unwrap();
    }

    #[test]
    fn test_list_runs_sorted() {
        let (_tmp, store) = store();
        for id in ["zeta", "alpha", "mid"] {
            fs::create_dir_all(store.run_dir(id)).unwrap();
        }
        assert_eq!(store.list_runs(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_badnode_log_appends() {
        let (_tmp, store) = store();
        store.append_badnode_event("run-8", "1 node=a exit=42").unwrap();
        store.append_badnode_event("run-8", "2 node=b exit=44").unwrap();
        let log = read_text_tolerant(&store.run_file("run-8", BADNODE_EVENTS_FILENAME)).unwrap();
        assert_eq!(log.lines().count(), 2);
    }
}
