//! Control surface for external CLIs and TUIs.
//!
//! Every operation here talks to the supervisor through the filesystem:
//! control signals land in `control.json` atomically, run creation writes
//! `meta.json`, and reports are pure reads over on-disk state plus a
//! scheduler snapshot.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blacklist::BlacklistStore;
use crate::config::RunMeta;
use crate::slurm::SchedulerSnapshot;
use crate::status::{compute_status, RunStatus, StatusInputs};
use crate::store::{StateStore, StoreError};

/// Operations deliverable through `control.json`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOp {
    Pause,
    Unpause,
    Stop,
    /// Cancels the current allocation and clears the run's counters via a
    /// fresh restart token the supervisor consumes exactly once.
    Restart,
}

/// Per-run summary for listings.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub run_mode: crate::run::RunMode,
    pub status: RunStatus,
    pub phase: crate::run::RunPhase,
    pub job_id: Option<String>,
    pub partition: Option<String>,
    pub node: Option<String>,
    pub submission_count: u32,
    pub consecutive_failures: u32,
    /// Seconds since the last heartbeat, when one exists.
    pub heartbeat_age: Option<i64>,
}

/// Validate a run id: non-empty and safe as a single path component.
pub fn validate_run_id(run_id: &str) -> bool {
    !run_id.is_empty()
        && run_id.len() <= 128
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !run_id.starts_with('.')
}

/// Create a run by writing its `meta.json`. Fails if the id is unsafe or
/// the run already exists.
pub fn create_run(store: &StateStore, meta: &RunMeta) -> Result<(), StoreError> {
    if !validate_run_id(&meta.run_id) {
        return Err(StoreError::InvalidRunId(meta.run_id.clone()));
    }
    if store.read_meta(&meta.run_id).is_some() {
        return Err(StoreError::RunExists(meta.run_id.clone()));
    }
    store.ensure_layout()?;
    store.write_meta(meta)
}

/// Deliver a control operation by rewriting `control.json` atomically.
///
/// Restart also clears the pause/stop flags so the restarted run is not
/// immediately re-stopped by a stale signal.
pub fn submit_control(
    store: &StateStore,
    run_id: &str,
    op: ControlOp,
) -> Result<crate::run::ControlSignals, StoreError> {
    let mut control = store.read_control(run_id);
    match op {
        ControlOp::Pause => control.paused = true,
        ControlOp::Unpause => control.paused = false,
        ControlOp::Stop => control.stop_requested = true,
        ControlOp::Restart => {
            control.paused = false;
            control.stop_requested = false;
            control.requested_restart_token = Some(Uuid::now_v7().to_string());
        }
    }
    store.write_control(run_id, &control)?;
    Ok(control)
}

/// Summarize one run against the given scheduler snapshot.
pub fn get_status(
    store: &StateStore,
    snapshot: &SchedulerSnapshot,
    run_id: &str,
    now: i64,
) -> Option<RunSummary> {
    let meta = store.read_meta(run_id)?;
    let control = store.read_control(run_id);
    let ended = store.read_ended(run_id);
    let heartbeat = store.read_heartbeat(run_id);
    let progress = store.read_progress(run_id);
    let slurm_state = meta
        .runtime
        .job_id
        .as_ref()
        .map(|job_id| snapshot.observe(job_id).state);

    let status = compute_status(&StatusInputs {
        meta: &meta,
        control: &control,
        ended: ended.as_ref(),
        heartbeat,
        progress: progress.as_ref(),
        slurm_state,
        now,
    });

    Some(RunSummary {
        run_id: meta.run_id.clone(),
        run_mode: meta.run_mode,
        status,
        phase: meta.runtime.phase,
        job_id: meta.runtime.job_id.clone(),
        partition: meta.runtime.partition.clone(),
        node: meta.runtime.last_node.clone(),
        submission_count: meta.runtime.submission_count,
        consecutive_failures: meta.runtime.consecutive_failures,
        heartbeat_age: heartbeat.map(|beat| now - beat),
    })
}

/// Summarize every run on disk.
pub fn list_runs(store: &StateStore, snapshot: &SchedulerSnapshot, now: i64) -> Vec<RunSummary> {
    store
        .list_runs()
        .iter()
        .filter_map(|run_id| get_status(store, snapshot, run_id, now))
        .collect()
}

/// Collect the job ids a status query needs to batch into one snapshot.
pub fn live_job_ids(store: &StateStore) -> Vec<String> {
    store
        .list_runs()
        .iter()
        .filter_map(|run_id| store.read_meta(run_id))
        .filter_map(|meta| meta.runtime.job_id)
        .collect()
}

/// Manually blacklist a node.
pub fn blacklist_add(
    blacklist: &BlacklistStore,
    node: &str,
    ttl_sec: i64,
    reason: &str,
    now: i64,
) -> Result<(), StoreError> {
    blacklist.add(node, reason, ttl_sec, now)
}

/// Manually remove a node from the blacklist.
pub fn blacklist_remove(
    blacklist: &BlacklistStore,
    node: &str,
    now: i64,
) -> Result<bool, StoreError> {
    blacklist.remove(node, now)
}
