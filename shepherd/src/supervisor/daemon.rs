//! The supervisor daemon: one long-lived process, one tick loop.
//!
//! Each tick takes a single batched scheduler snapshot, then advances every
//! run under its lock with a bounded worker pool. All decisions come from
//! [`machine::evaluate`]; this module owns the side effects: scheduler
//! calls, meta mutations, blacklist updates, terminal markers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backoff;
use crate::blacklist::BlacklistStore;
use crate::config::{RunMeta, SupervisorConfig};
use crate::run::{ControlSignals, EndedMarker, EndedReason, FailureKind, PendingOutcome, RunPhase};
use crate::shutdown::StopSignal;
use crate::slurm::{
    classify_submit_stderr, CallOutcome, JobState, SchedulerSnapshot, SlurmClient, SubmitRequest,
};
use crate::store::{StateStore, StoreError};
use crate::supervisor::machine::{self, Decision, FailureCause, TickInputs};

/// Errors that terminate the daemon. Per-run trouble never lands here; it
/// is quarantined and the loop continues.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one tick did, for logging and tests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TickReport {
    pub runs: usize,
    pub submitted: usize,
    pub cancelled: usize,
    pub ended: usize,
    pub failures_recorded: usize,
    /// Runs skipped because another holder owned their lock.
    pub skipped_locked: usize,
    /// Runs skipped because the scheduler query failed this tick.
    pub skipped_no_snapshot: usize,
}

/// Which way a partition failure moved the failover cursor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PartitionStep {
    Stay,
    Advanced,
    Wrapped,
}

/// The supervisor: one state machine per run, driven by a tick loop.
pub struct Supervisor<C: SlurmClient> {
    store: StateStore,
    blacklist: BlacklistStore,
    slurm: Arc<C>,
    config: SupervisorConfig,
    stop: StopSignal,
}

impl<C: SlurmClient + 'static> Supervisor<C> {
    pub fn new(store: StateStore, slurm: Arc<C>, config: SupervisorConfig) -> Self {
        let blacklist = BlacklistStore::new(&store);
        Self {
            store,
            blacklist,
            slurm,
            config,
            stop: StopSignal::new(),
        }
    }

    /// The stop signal the daemon loop watches; signal handlers request a
    /// stop through a clone of it.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn blacklist(&self) -> &BlacklistStore {
        &self.blacklist
    }

    /// Run the daemon loop until a stop is requested. Holds the daemon pid
    /// file for the duration; refuses to start next to a live daemon.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        self.store.ensure_layout()?;
        self.store.claim_daemon_pid()?;
        info!(root = %self.store.root().display(), "supervisor started");
        let result = self.run_loop().await;
        self.store.release_daemon_pid();
        info!(cause = ?self.stop.cause(), "supervisor stopped");
        result
    }

    async fn run_loop(&self) -> Result<(), SupervisorError> {
        let interval = Duration::from_secs(self.config.tick_interval_secs.max(1));
        loop {
            if self.stop.is_stopped() {
                return Ok(());
            }
            match self.tick().await {
                Ok(report) => debug!(?report, "tick complete"),
                Err(error) => {
                    // Disk-level trouble writing state is not recoverable
                    // from inside the loop; partial state on disk stays
                    // valid for the next daemon.
                    error!(%error, "fatal supervisor error");
                    return Err(error);
                }
            }
            tokio::select! {
                _ = self.stop.stopped() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One tick: snapshot the scheduler once, then advance each run.
    pub async fn tick(&self) -> Result<TickReport, SupervisorError> {
        let now = Utc::now().timestamp();
        let run_ids = self.store.list_runs();

        // Gather the job ids to batch into a single query.
        let mut job_ids = Vec::new();
        for run_id in &run_ids {
            if let Some(meta) = self.store.read_meta(run_id) {
                if let Some(job_id) = meta.runtime.job_id {
                    job_ids.push(job_id);
                }
            }
        }
        let snapshot = self.take_snapshot(&job_ids).await;

        let report = Arc::new(Mutex::new(TickReport {
            runs: run_ids.len(),
            ..Default::default()
        }));
        let first_error: Arc<Mutex<Option<SupervisorError>>> = Arc::new(Mutex::new(None));

        futures::stream::iter(run_ids)
            .for_each_concurrent(self.config.worker_limit, |run_id| {
                let snapshot = snapshot.clone();
                let report = Arc::clone(&report);
                let first_error = Arc::clone(&first_error);
                async move {
                    match self
                        .process_run(&run_id, snapshot.as_ref(), now, &report)
                        .await
                    {
                        Ok(()) => {}
                        Err(error) => {
                            warn!(%run_id, %error, "run processing failed");
                            let mut slot = first_error.lock().unwrap_or_else(|e| e.into_inner());
                            if slot.is_none() {
                                *slot = Some(error);
                            }
                        }
                    }
                }
            })
            .await;

        let error = first_error.lock().unwrap_or_else(|e| e.into_inner()).take();
        match error {
            Some(error) => Err(error),
            None => Ok(*report.lock().unwrap_or_else(|e| e.into_inner())),
        }
    }

    /// Build the tick's scheduler view: one `squeue` over all live ids, one
    /// `sacct` over the ids `squeue` no longer reports. `None` means the
    /// scheduler was unreachable and runs with live jobs sit this tick out.
    async fn take_snapshot(&self, job_ids: &[String]) -> Option<SchedulerSnapshot> {
        if job_ids.is_empty() {
            return Some(SchedulerSnapshot::new());
        }
        let mut snapshot = match self.slurm.query(job_ids).await {
            CallOutcome::Ok(snapshot) => snapshot,
            CallOutcome::Timeout => {
                warn!("squeue timed out; skipping decisions for live runs");
                return None;
            }
            CallOutcome::Transient(stderr) => {
                warn!(stderr = %stderr.trim(), "squeue failed; skipping decisions for live runs");
                return None;
            }
            CallOutcome::Fatal(error) => {
                error!(%error, "squeue unavailable");
                return None;
            }
        };
        let missing: Vec<String> = job_ids
            .iter()
            .filter(|id| !snapshot.contains(id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            match self.slurm.query_finished(&missing).await {
                CallOutcome::Ok(finished) => {
                    for job in finished {
                        snapshot.insert(job.job_id.clone(), job.observation);
                    }
                }
                // Ids that stay unresolved read as UNKNOWN; the bounded
                // lookup window decides when to give up on them.
                outcome => {
                    debug!(?missing, ok = outcome.is_ok(), "sacct lookup incomplete");
                }
            }
        }
        Some(snapshot)
    }

    async fn process_run(
        &self,
        run_id: &str,
        snapshot: Option<&SchedulerSnapshot>,
        now: i64,
        report: &Mutex<TickReport>,
    ) -> Result<(), SupervisorError> {
        let Some(_guard) = self.store.try_lock_run(run_id)? else {
            bump(report, |r| r.skipped_locked += 1);
            return Ok(());
        };

        let Some(mut meta) = self.store.read_meta(run_id) else {
            // Missing or quarantined meta: nothing to supervise.
            return Ok(());
        };
        let before = meta.clone();

        let control = self.store.read_control(run_id);
        let effective = meta.with_overrides(&control);

        // Transient scheduler trouble: no decisions for runs with a live
        // job; runs without one are unaffected.
        let snapshot = match (meta.runtime.job_id.is_some(), snapshot) {
            (true, None) => {
                bump(report, |r| r.skipped_no_snapshot += 1);
                return Ok(());
            }
            (_, snapshot) => snapshot,
        };

        let observation = meta
            .runtime
            .job_id
            .as_ref()
            .zip(snapshot)
            .map(|(job_id, snapshot)| snapshot.observe(job_id));

        // Track how long the job id has been unresolvable before deciding.
        let streak = match observation.as_ref().map(|o| o.state) {
            Some(JobState::Unknown) => meta.runtime.unknown_streak + 1,
            _ => 0,
        };
        meta.runtime.unknown_streak = streak;

        // Keep the node/partition linkage current while the job is placed.
        if let Some(obs) = &observation {
            if obs.state == JobState::Running {
                if let Some(node) = &obs.node {
                    meta.runtime.last_node = Some(node.clone());
                }
                if let Some(partition) = &obs.partition {
                    meta.runtime.partition = Some(partition.clone());
                }
            }
        }

        let mut effective = effective;
        effective.runtime = meta.runtime.clone();

        let heartbeat = self.store.read_heartbeat(run_id);
        let progress = self.store.read_progress(run_id);
        let has_final = self.store.has_final(run_id);
        let has_ended = self.store.read_ended(run_id).is_some();

        let decision = machine::evaluate(&TickInputs {
            now,
            meta: &effective,
            observation: observation.as_ref(),
            heartbeat,
            progress: progress.as_ref(),
            has_final,
            has_ended,
            control: &control,
        });
        debug!(%run_id, ?decision, "evaluated");

        self.execute(run_id, &mut meta, &effective, &control, decision, now, report)
            .await?;
        // An idle tick leaves the run's record untouched on disk.
        if meta != before {
            self.store.write_meta(&meta)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        run_id: &str,
        meta: &mut RunMeta,
        effective: &RunMeta,
        control: &ControlSignals,
        decision: Decision,
        now: i64,
        report: &Mutex<TickReport>,
    ) -> Result<(), SupervisorError> {
        match decision {
            Decision::Hold | Decision::AwaitCancel => {}

            Decision::Queued => {
                meta.runtime.phase = RunPhase::Queued;
            }

            Decision::Running { fresh_heartbeat } => {
                self.note_running(meta, effective, fresh_heartbeat, now);
            }

            Decision::Submit => {
                self.submit_run(run_id, meta, effective, now, report).await;
            }

            Decision::Complete => {
                self.finalize(run_id, meta, EndedReason::Success, now, report)?;
            }

            Decision::Exhausted => {
                info!(%run_id, submissions = meta.runtime.submission_count, "retry budget exhausted");
                self.finalize(run_id, meta, EndedReason::MaxRetries, now, report)?;
            }

            Decision::Expire { cancel } => {
                if let Some(job_id) = cancel {
                    self.cancel_job(run_id, &job_id, report).await;
                }
                info!(%run_id, "keep-alive window expired");
                self.finalize(run_id, meta, EndedReason::WindowExpired, now, report)?;
            }

            Decision::StopFinalize => {
                self.finalize(run_id, meta, EndedReason::StoppedManual, now, report)?;
            }

            Decision::StopCancel { job_id } => {
                self.cancel_job(run_id, &job_id, report).await;
                meta.runtime.phase = RunPhase::Cancelling;
                meta.runtime.pending = Some(PendingOutcome::Stopped);
            }

            Decision::PauseCancel { job_id } => {
                self.cancel_job(run_id, &job_id, report).await;
                meta.runtime.phase = RunPhase::Cancelling;
                meta.runtime.pending = Some(PendingOutcome::Paused);
            }

            Decision::Stall { job_id, kind } => {
                warn!(%run_id, %job_id, ?kind, "stall detected; cancelling allocation");
                self.cancel_job(run_id, &job_id, report).await;
                // Soft failure: counted for backoff, never blacklisted.
                self.note_failure_counters(meta, effective, now);
                meta.runtime.phase = RunPhase::Cancelling;
                meta.runtime.pending = Some(PendingOutcome::Stall(kind));
                bump(report, |r| r.failures_recorded += 1);
            }

            Decision::Fail(cause) => {
                self.record_failure(run_id, meta, effective, cause, now)?;
                bump(report, |r| r.failures_recorded += 1);
            }

            Decision::Restart { cancel } => {
                if let Some(token) = &control.requested_restart_token {
                    meta.runtime.consumed_restart_token = Some(token.clone());
                }
                match cancel {
                    Some(job_id) => {
                        info!(%run_id, %job_id, "restart requested; cancelling allocation");
                        self.cancel_job(run_id, &job_id, report).await;
                        meta.runtime.phase = RunPhase::Cancelling;
                        meta.runtime.pending = Some(PendingOutcome::Restart);
                    }
                    None => {
                        info!(%run_id, "restart requested");
                        self.apply_restart(run_id, meta)?;
                    }
                }
            }

            Decision::CancelConfirmed(outcome) => match outcome {
                PendingOutcome::Stopped => {
                    self.finalize(run_id, meta, EndedReason::StoppedManual, now, report)?;
                }
                PendingOutcome::Paused | PendingOutcome::Stall(_) => {
                    meta.runtime.job_id = None;
                    meta.runtime.phase = RunPhase::Backoff;
                    meta.runtime.pending = None;
                    meta.runtime.unknown_streak = 0;
                }
                PendingOutcome::Restart => {
                    self.apply_restart(run_id, meta)?;
                }
            },
        }
        Ok(())
    }

    /// Write the terminal marker and freeze the run.
    fn finalize(
        &self,
        run_id: &str,
        meta: &mut RunMeta,
        reason: EndedReason,
        now: i64,
        report: &Mutex<TickReport>,
    ) -> Result<(), SupervisorError> {
        self.store.write_ended(
            run_id,
            &EndedMarker {
                reason,
                at: now,
                run_mode: meta.run_mode,
            },
        )?;
        meta.runtime.job_id = None;
        meta.runtime.phase = RunPhase::Terminal;
        meta.runtime.pending = None;
        meta.runtime.next_submit_at = None;
        info!(%run_id, reason = %reason, "run ended");
        bump(report, |r| r.ended += 1);
        Ok(())
    }

    async fn cancel_job(&self, run_id: &str, job_id: &str, report: &Mutex<TickReport>) {
        match self.slurm.cancel(job_id).await {
            CallOutcome::Ok(()) => {
                bump(report, |r| r.cancelled += 1);
            }
            // The cancel is retried implicitly: the job stays live in the
            // snapshot and the machine keeps the run in CANCELLING.
            outcome => {
                warn!(%run_id, %job_id, outcome = outcome_kind(&outcome), "scancel did not succeed");
            }
        }
    }

    /// Running-state bookkeeping: phase, node linkage, and the healthy
    /// uptime that eventually resets the failure streak.
    fn note_running(&self, meta: &mut RunMeta, effective: &RunMeta, fresh_heartbeat: bool, now: i64) {
        meta.runtime.phase = RunPhase::Running;
        if fresh_heartbeat {
            let since = *meta.runtime.healthy_since.get_or_insert(now);
            if meta.runtime.consecutive_failures > 0
                && now - since >= effective.policy.healthy_uptime_reset_sec
            {
                debug!(run_id = %meta.run_id, "healthy uptime reached; failure streak reset");
                meta.runtime.consecutive_failures = 0;
            }
        } else {
            meta.runtime.healthy_since = None;
        }
    }

    /// Classified failure: consume the wrapper's report, maybe blacklist,
    /// schedule the next attempt with exponential backoff.
    fn record_failure(
        &self,
        run_id: &str,
        meta: &mut RunMeta,
        effective: &RunMeta,
        cause: FailureCause,
        now: i64,
    ) -> Result<(), SupervisorError> {
        // Stall and lost-job failures carry no node evidence; a leftover
        // failure.json from an earlier attempt must not blacklist anything.
        let use_wrapper_report = !matches!(cause, FailureCause::Lost);
        if use_wrapper_report {
            if let Some(failure) = self.store.read_failure(run_id) {
                let already_seen = meta.runtime.last_failure_ts == Some(failure.timestamp);
                if !already_seen {
                    meta.runtime.last_failure_ts = Some(failure.timestamp);
                    if effective.policy.blacklist_enabled && failure.kind.blames_node() {
                        if let Some(node) = &failure.node {
                            let ttl = match failure.kind {
                                FailureKind::Trespasser => effective.policy.trespasser_ttl_sec,
                                _ => effective.policy.blacklist_ttl_sec,
                            };
                            self.blacklist
                                .add(node, failure.kind.as_str(), ttl, now)?;
                            self.store.append_badnode_event(
                                run_id,
                                &format!(
                                    "{} node={} exit={} kind={}",
                                    failure.timestamp, node, failure.exit_code, failure.kind
                                ),
                            )?;
                            warn!(%run_id, %node, kind = %failure.kind, ttl, "node blacklisted");
                        }
                    }
                }
            }
        }

        warn!(%run_id, ?cause, failures = meta.runtime.consecutive_failures + 1, "attempt failed");
        self.note_failure_counters(meta, effective, now);
        meta.runtime.job_id = None;
        meta.runtime.phase = RunPhase::Backoff;
        meta.runtime.pending = None;
        meta.runtime.unknown_streak = 0;
        Ok(())
    }

    /// Shared failure arithmetic: streak, per-partition count, failover
    /// cursor, and the jittered backoff deadline.
    fn note_failure_counters(&self, meta: &mut RunMeta, effective: &RunMeta, now: i64) {
        meta.runtime.consecutive_failures += 1;
        meta.runtime.healthy_since = None;
        let failed_partition = meta.runtime.partition.clone();
        self.note_partition_failure(meta, effective, failed_partition.as_deref());
        let delay = backoff::jittered_delay(
            meta.runtime.consecutive_failures,
            effective.policy.backoff_base_sec,
            effective.policy.backoff_max_sec,
        );
        meta.runtime.next_submit_at = Some(now + delay);
    }

    /// Count a failure against a partition and move the failover cursor
    /// when the per-partition budget is spent.
    fn note_partition_failure(
        &self,
        meta: &mut RunMeta,
        effective: &RunMeta,
        partition: Option<&str>,
    ) -> PartitionStep {
        let Some(partition) = partition else {
            return PartitionStep::Stay;
        };
        let count = meta
            .runtime
            .partition_failure_counts
            .entry(partition.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let count = *count;

        let Some(fallback) = &effective.partition_fallback else {
            return PartitionStep::Stay;
        };
        if fallback.partitions.is_empty() || count < fallback.retry_per_partition {
            return PartitionStep::Stay;
        }
        let next = meta.runtime.partition_index + 1;
        if next < fallback.partitions.len() {
            meta.runtime.partition_index = next;
            meta.runtime
                .partition_failure_counts
                .insert(fallback.partitions[next].clone(), 0);
            info!(run_id = %meta.run_id, partition = %fallback.partitions[next], "failing over to next partition");
            PartitionStep::Advanced
        } else {
            meta.runtime.partition_index = 0;
            meta.runtime.partition_failure_counts.clear();
            info!(run_id = %meta.run_id, "partition list exhausted; wrapping to preferred");
            PartitionStep::Wrapped
        }
    }

    /// Pick the partition for a submission, honoring the periodic reset to
    /// the preferred one.
    fn choose_partition(&self, meta: &mut RunMeta, effective: &RunMeta, now: i64) -> Option<String> {
        let partitions = effective.partition_list();
        if partitions.is_empty() {
            return None;
        }
        let mut index = meta.runtime.partition_index.min(partitions.len() - 1);
        if let Some(fallback) = &effective.partition_fallback {
            if index > 0 {
                if let Some(last) = meta.runtime.preferred_last_tried_at {
                    if now - last >= fallback.reset_to_preferred_sec {
                        index = 0;
                        meta.runtime.partition_failure_counts.clear();
                        info!(run_id = %meta.run_id, "retrying preferred partition");
                    }
                }
            }
        }
        if index == 0 {
            meta.runtime.preferred_last_tried_at = Some(now);
        }
        meta.runtime.partition_index = index;
        Some(partitions[index].to_string())
    }

    /// Submit one allocation. A submit rejected for partition capacity
    /// advances the failover cursor and retries immediately on the next
    /// partition within the same tick; anything else schedules backoff.
    async fn submit_run(
        &self,
        run_id: &str,
        meta: &mut RunMeta,
        effective: &RunMeta,
        now: i64,
        report: &Mutex<TickReport>,
    ) {
        let partition_budget = effective.partition_list().len().max(1);
        for _ in 0..partition_budget {
            let partition = self.choose_partition(meta, effective, now);
            let exclude = self
                .blacklist
                .load()
                .exclude_list(now, effective.policy.blacklist_limit);

            let mut args = effective.sbatch_args.clone();
            if let Some(gpus) = effective.gpus {
                if !args.iter().any(|arg| arg.starts_with("--gres")) {
                    args.push(format!("--gres=gpu:{gpus}"));
                }
            }
            let request = SubmitRequest {
                script: effective.script.clone(),
                args,
                partition: partition.clone(),
                exclude,
            };

            match self.slurm.submit(&request).await {
                CallOutcome::Ok(job_id) => {
                    info!(%run_id, %job_id, partition = partition.as_deref().unwrap_or("-"), "submitted");
                    meta.runtime.job_id = Some(job_id);
                    meta.runtime.partition = partition;
                    meta.runtime.phase = RunPhase::SubmitPending;
                    meta.runtime.submission_count += 1;
                    meta.runtime.last_submit_at = Some(now);
                    meta.runtime.run_started_at.get_or_insert(now);
                    meta.runtime.next_submit_at = None;
                    meta.runtime.unknown_streak = 0;
                    meta.runtime.healthy_since = None;
                    meta.runtime.pending = None;
                    bump(report, |r| r.submitted += 1);
                    return;
                }
                CallOutcome::Timeout => {
                    warn!(%run_id, "sbatch timed out");
                    if self.note_submit_failure(meta, effective, partition.as_deref(), now)
                        == PartitionStep::Advanced
                    {
                        continue;
                    }
                    return;
                }
                CallOutcome::Transient(stderr) => {
                    let reason = classify_submit_stderr(&stderr);
                    warn!(%run_id, reason, stderr = %stderr.trim(), "sbatch rejected");
                    if self.note_submit_failure(meta, effective, partition.as_deref(), now)
                        == PartitionStep::Advanced
                    {
                        continue;
                    }
                    return;
                }
                CallOutcome::Fatal(error) => {
                    error!(%run_id, %error, "sbatch unavailable");
                    self.note_failure_counters(meta, effective, now);
                    meta.runtime.phase = RunPhase::Backoff;
                    return;
                }
            }
        }
    }

    /// A rejected submit counts like a failure of the targeted partition.
    /// Returns whether the failover cursor advanced (retry now) or not
    /// (backoff applies).
    fn note_submit_failure(
        &self,
        meta: &mut RunMeta,
        effective: &RunMeta,
        partition: Option<&str>,
        now: i64,
    ) -> PartitionStep {
        let step = self.note_partition_failure(meta, effective, partition);
        if step != PartitionStep::Advanced {
            meta.runtime.consecutive_failures += 1;
            let delay = backoff::jittered_delay(
                meta.runtime.consecutive_failures,
                effective.policy.backoff_base_sec,
                effective.policy.backoff_max_sec,
            );
            meta.runtime.next_submit_at = Some(now + delay);
            meta.runtime.phase = RunPhase::Backoff;
        }
        step
    }

    /// Clear terminal markers and counters so the next tick submits a
    /// fresh first attempt.
    fn apply_restart(&self, run_id: &str, meta: &mut RunMeta) -> Result<(), SupervisorError> {
        self.store.clear_terminal(run_id)?;
        meta.runtime.job_id = None;
        meta.runtime.partition = None;
        meta.runtime.phase = RunPhase::Init;
        meta.runtime.submission_count = 0;
        meta.runtime.consecutive_failures = 0;
        meta.runtime.partition_failure_counts.clear();
        meta.runtime.partition_index = 0;
        meta.runtime.next_submit_at = None;
        meta.runtime.run_started_at = None;
        meta.runtime.unknown_streak = 0;
        meta.runtime.pending = None;
        meta.runtime.healthy_since = None;
        meta.runtime.last_failure_ts = None;
        Ok(())
    }
}

fn bump(report: &Mutex<TickReport>, f: impl FnOnce(&mut TickReport)) {
    let mut guard = report.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard);
}

fn outcome_kind<T>(outcome: &CallOutcome<T>) -> &'static str {
    match outcome {
        CallOutcome::Ok(_) => "ok",
        CallOutcome::Timeout => "timeout",
        CallOutcome::Transient(_) => "transient",
        CallOutcome::Fatal(_) => "fatal",
    }
}
