//! Status normalization.
//!
//! A pure function over on-disk state plus the batched scheduler snapshot,
//! producing exactly one status from a fixed closed set. The CLI and TUI are
//! pure consumers of this model.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::config::RunMeta;
use crate::heartbeat;
use crate::run::{ControlSignals, EndedMarker, EndedReason, Progress, RunPhase};
use crate::slurm::JobState;

/// The closed status set, declared highest priority first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    StoppedManual,
    CompletedSuccess,
    EndedExpired,
    CrashLoop,
    Unresponsive,
    Restarting,
    RunningDegraded,
    HealthyRunning,
    Pending,
    ErrorUnknown,
}

impl RunStatus {
    /// Get the string representation of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::StoppedManual => "stopped_manual",
            RunStatus::CompletedSuccess => "completed_success",
            RunStatus::EndedExpired => "ended_expired",
            RunStatus::CrashLoop => "crash_loop",
            RunStatus::Unresponsive => "unresponsive",
            RunStatus::Restarting => "restarting",
            RunStatus::RunningDegraded => "running_degraded",
            RunStatus::HealthyRunning => "healthy_running",
            RunStatus::Pending => "pending",
            RunStatus::ErrorUnknown => "error_unknown",
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to status normalization, all read-only.
#[derive(Debug)]
pub struct StatusInputs<'a> {
    pub meta: &'a RunMeta,
    pub control: &'a ControlSignals,
    pub ended: Option<&'a EndedMarker>,
    pub heartbeat: Option<i64>,
    pub progress: Option<&'a Progress>,
    pub slurm_state: Option<JobState>,
    pub now: i64,
}

/// Normalize a run's observable state into one status.
pub fn compute_status(inputs: &StatusInputs<'_>) -> RunStatus {
    // A terminal marker fixes the status by its reason.
    if let Some(ended) = inputs.ended {
        return match ended.reason {
            EndedReason::Success => RunStatus::CompletedSuccess,
            EndedReason::StoppedManual => RunStatus::StoppedManual,
            EndedReason::WindowExpired => RunStatus::EndedExpired,
            EndedReason::MaxRetries => RunStatus::CrashLoop,
            EndedReason::FatalError => RunStatus::ErrorUnknown,
        };
    }

    let runtime = &inputs.meta.runtime;
    let policy = &inputs.meta.policy;

    if runtime.consecutive_failures >= 3 && runtime.phase == RunPhase::Backoff {
        return RunStatus::CrashLoop;
    }

    if inputs.slurm_state == Some(JobState::Running) {
        // The startup grace shields a heartbeat the wrapper has not written
        // yet; a shielded heartbeat counts as fresh.
        let shielded = heartbeat::within_startup_grace(
            runtime.last_submit_at,
            policy.heartbeat_grace_sec,
            inputs.now,
        );
        let stale =
            heartbeat::is_stale(inputs.heartbeat, policy.heartbeat_grace_sec, inputs.now)
                && !shielded;
        if stale {
            return RunStatus::Unresponsive;
        }
        let progress_stale = inputs
            .progress
            .map(|p| p.is_stale(policy.progress_stall_sec, inputs.now))
            .unwrap_or(false);
        if inputs.control.paused || progress_stale {
            return RunStatus::RunningDegraded;
        }
        return RunStatus::HealthyRunning;
    }

    if matches!(runtime.phase, RunPhase::Backoff | RunPhase::Cancelling) {
        return RunStatus::Restarting;
    }

    if inputs.slurm_state == Some(JobState::Pending)
        || matches!(
            runtime.phase,
            RunPhase::Init | RunPhase::SubmitPending | RunPhase::Queued
        )
    {
        return RunStatus::Pending;
    }

    RunStatus::ErrorUnknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunMode;
    use std::path::PathBuf;

    fn meta() -> RunMeta {
        RunMeta::new("r", RunMode::RunOnce, PathBuf::from("/j.sh"), 0)
    }

    fn inputs<'a>(meta: &'a RunMeta, control: &'a ControlSignals) -> StatusInputs<'a> {
        StatusInputs {
            meta,
            control,
            ended: None,
            heartbeat: None,
            progress: None,
            slurm_state: None,
            now: 1000,
        }
    }

    #[test]
    fn test_ended_reason_fixes_status() {
        let meta = meta();
        let control = ControlSignals::default();
        let cases = [
            (EndedReason::Success, RunStatus::CompletedSuccess),
            (EndedReason::StoppedManual, RunStatus::StoppedManual),
            (EndedReason::WindowExpired, RunStatus::EndedExpired),
            (EndedReason::MaxRetries, RunStatus::CrashLoop),
            (EndedReason::FatalError, RunStatus::ErrorUnknown),
        ];
        for (reason, expected) in cases {
            let marker = EndedMarker {
                reason,
                at: 1,
                run_mode: RunMode::RunOnce,
            };
            let mut i = inputs(&meta, &control);
            i.ended = Some(&marker);
            assert_eq!(compute_status(&i), expected);
        }
    }

    #[test]
    fn test_running_fresh_heartbeat_is_healthy() {
        let mut meta = meta();
        meta.runtime.last_submit_at = Some(0);
        let control = ControlSignals::default();
        let mut i = inputs(&meta, &control);
        i.slurm_state = Some(JobState::Running);
        i.heartbeat = Some(990);
        assert_eq!(compute_status(&i), RunStatus::HealthyRunning);
    }

    #[test]
    fn test_running_stale_heartbeat_is_unresponsive() {
        let mut meta = meta();
        meta.runtime.last_submit_at = Some(0);
        let control = ControlSignals::default();
        let mut i = inputs(&meta, &control);
        i.slurm_state = Some(JobState::Running);
        i.heartbeat = Some(100);
        assert_eq!(compute_status(&i), RunStatus::Unresponsive);
    }

    #[test]
    fn test_startup_grace_shields_missing_heartbeat() {
        let mut meta = meta();
        meta.runtime.last_submit_at = Some(950);
        let control = ControlSignals::default();
        let mut i = inputs(&meta, &control);
        i.slurm_state = Some(JobState::Running);
        assert_eq!(compute_status(&i), RunStatus::HealthyRunning);
    }

    #[test]
    fn test_paused_running_is_degraded() {
        let mut meta = meta();
        meta.runtime.last_submit_at = Some(0);
        let control = ControlSignals {
            paused: true,
            ..Default::default()
        };
        let mut i = inputs(&meta, &control);
        i.slurm_state = Some(JobState::Running);
        i.heartbeat = Some(990);
        assert_eq!(compute_status(&i), RunStatus::RunningDegraded);
    }

    #[test]
    fn test_progress_stale_heartbeat_fresh_is_degraded() {
        let mut meta = meta();
        meta.runtime.last_submit_at = Some(0);
        meta.policy.progress_stall_sec = 100;
        let control = ControlSignals::default();
        let progress = Progress {
            epoch: 100,
            step: None,
            note: None,
        };
        let mut i = inputs(&meta, &control);
        i.slurm_state = Some(JobState::Running);
        i.heartbeat = Some(990);
        i.progress = Some(&progress);
        assert_eq!(compute_status(&i), RunStatus::RunningDegraded);
    }

    #[test]
    fn test_crash_loop_needs_backoff_phase() {
        let mut meta = meta();
        meta.runtime.consecutive_failures = 3;
        meta.runtime.phase = RunPhase::Backoff;
        let control = ControlSignals::default();
        assert_eq!(compute_status(&inputs(&meta, &control)), RunStatus::CrashLoop);

        meta.runtime.consecutive_failures = 2;
        assert_eq!(
            compute_status(&inputs(&meta, &control)),
            RunStatus::Restarting
        );
    }

    #[test]
    fn test_pending_and_unknown() {
        let meta_init = meta();
        let control = ControlSignals::default();
        assert_eq!(compute_status(&inputs(&meta_init, &control)), RunStatus::Pending);

        let mut meta_lost = meta();
        meta_lost.runtime.phase = RunPhase::Running;
        let mut i = inputs(&meta_lost, &control);
        i.slurm_state = Some(JobState::Unknown);
        assert_eq!(compute_status(&i), RunStatus::ErrorUnknown);
    }
}
