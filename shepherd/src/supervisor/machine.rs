//! The per-run decision function.
//!
//! `evaluate` is a pure function from one tick's inputs to a [`Decision`];
//! the daemon executes the decision's side effects under the run lock. The
//! guards run in a fixed priority order, first match wins, so a tick with
//! unchanged inputs always reproduces the same decision.

use crate::config::RunMeta;
use crate::heartbeat;
use crate::run::{ControlSignals, PendingOutcome, Progress, RunMode, RunPhase, StallKind};
use crate::slurm::{JobObservation, JobState};

/// Everything a single run's step looks at, all read-only.
#[derive(Debug)]
pub struct TickInputs<'a> {
    pub now: i64,
    /// Run record with any `control.json` overrides already merged.
    pub meta: &'a RunMeta,
    /// Snapshot entry for the run's job id; `None` when no job is linked.
    pub observation: Option<&'a JobObservation>,
    pub heartbeat: Option<i64>,
    pub progress: Option<&'a Progress>,
    pub has_final: bool,
    pub has_ended: bool,
    pub control: &'a ControlSignals,
}

/// Why an attempt is classified as failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureCause {
    /// The scheduler reported a terminal non-success state.
    SchedulerReported(JobState),
    /// COMPLETED, but success conditions were not met (run-once without the
    /// final marker, or any clean exit in indefinite mode).
    CompletedWithoutSuccess,
    /// The job id stayed UNKNOWN past the bounded lookup window.
    Lost,
}

/// The action the daemon must take for a run this tick.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    /// Nothing to do.
    Hold,
    /// Consume a fresh restart token: cancel the live job if any, otherwise
    /// clear terminal state and counters for a fresh first submission.
    Restart { cancel: Option<String> },
    /// Stop requested with a live allocation: cancel and await confirmation.
    StopCancel { job_id: String },
    /// Stop requested with no live allocation: finalize immediately.
    StopFinalize,
    /// Paused with a live allocation: cancel it without counting a failure.
    PauseCancel { job_id: String },
    /// Keep-alive window closed: cancel any live job and finalize.
    Expire { cancel: Option<String> },
    /// Retry budget exhausted (`run_once`): finalize.
    Exhausted,
    /// True success: wrapper exit 0 plus the final marker.
    Complete,
    /// Classified failure: backoff, maybe blacklist, resubmit later.
    Fail(FailureCause),
    /// Heartbeat or progress stall on a running job: cancel, count a soft
    /// failure, never blacklist.
    Stall { job_id: String, kind: StallKind },
    /// A cancel is in flight and the scheduler still reports the job.
    AwaitCancel,
    /// The scheduler confirmed the cancel; apply the recorded outcome.
    CancelConfirmed(PendingOutcome),
    /// The allocation is running; bookkeeping only.
    Running { fresh_heartbeat: bool },
    /// The allocation is waiting in the queue; bookkeeping only.
    Queued,
    /// No allocation and the backoff has elapsed: submit one.
    Submit,
}

/// Whether the scheduler is done with (or has lost track of) the linked job.
fn job_gone(
    observation: Option<&JobObservation>,
    unknown_streak: u32,
    unknown_grace_ticks: u32,
) -> bool {
    match observation.map(|o| o.state) {
        None => true,
        Some(state) if state.is_terminal() => true,
        Some(JobState::Unknown) => unknown_streak >= unknown_grace_ticks,
        Some(_) => false,
    }
}

/// Advance one run by one step against the tick's snapshot.
pub fn evaluate(inputs: &TickInputs<'_>) -> Decision {
    let meta = inputs.meta;
    let rt = &meta.runtime;
    let policy = &meta.policy;

    // A fresh restart token outranks everything, the terminal marker
    // included: that is the one sanctioned way back out of TERMINAL.
    if let Some(token) = &inputs.control.requested_restart_token {
        if rt.consumed_restart_token.as_deref() != Some(token.as_str()) {
            let cancel = match (&rt.job_id, inputs.observation) {
                (Some(job_id), Some(obs)) if !obs.state.is_terminal() => Some(job_id.clone()),
                _ => None,
            };
            return Decision::Restart { cancel };
        }
    }

    // ended.json is terminal: no further transitions.
    if inputs.has_ended || rt.phase == RunPhase::Terminal {
        return Decision::Hold;
    }

    let gone = job_gone(
        inputs.observation,
        rt.unknown_streak,
        policy.unknown_grace_ticks,
    );
    let live = rt.job_id.is_some() && !gone;

    // 1. Stop always wins over lifecycle handling.
    if inputs.control.stop_requested {
        if live {
            if rt.phase == RunPhase::Cancelling {
                return Decision::AwaitCancel;
            }
            return Decision::StopCancel {
                job_id: rt.job_id.clone().unwrap_or_default(),
            };
        }
        return Decision::StopFinalize;
    }

    // 2. Pause cancels any queued/running allocation and then holds.
    if inputs.control.paused {
        if live {
            if rt.phase == RunPhase::Cancelling {
                return Decision::AwaitCancel;
            }
            return Decision::PauseCancel {
                job_id: rt.job_id.clone().unwrap_or_default(),
            };
        }
        if rt.phase == RunPhase::Cancelling {
            return Decision::CancelConfirmed(rt.pending.unwrap_or(PendingOutcome::Paused));
        }
        return Decision::Hold;
    }

    // 3. Keep-alive window (indefinite only), anchored at the first submit.
    if meta.run_mode == RunMode::Indefinite {
        if let (Some(keep_alive), Some(started)) = (policy.keep_alive_sec, rt.run_started_at) {
            if inputs.now - started >= keep_alive {
                let cancel = live.then(|| rt.job_id.clone().unwrap_or_default());
                return Decision::Expire { cancel };
            }
        }
    }

    // An in-flight cancel resolves before any new classification.
    if rt.phase == RunPhase::Cancelling {
        if gone {
            return Decision::CancelConfirmed(
                rt.pending
                    .unwrap_or(PendingOutcome::Stall(StallKind::Heartbeat)),
            );
        }
        return Decision::AwaitCancel;
    }

    // 4. Retry budget, checked between attempts only: a terminal observation
    // still gets classified first so the last attempt's success counts.
    let classifiable = matches!(inputs.observation.map(|o| o.state), Some(s) if s.is_terminal());
    if meta.run_mode == RunMode::RunOnce
        && !live
        && !classifiable
        && rt.submission_count > policy.max_retries
    {
        return Decision::Exhausted;
    }

    // 5.–9. Classify the scheduler observation.
    if rt.job_id.is_some() {
        if let Some(observation) = inputs.observation {
            match observation.state {
                JobState::Completed => {
                    if meta.run_mode == RunMode::RunOnce && inputs.has_final {
                        return Decision::Complete;
                    }
                    return Decision::Fail(FailureCause::CompletedWithoutSuccess);
                }
                JobState::Failed
                | JobState::Cancelled
                | JobState::Timeout
                | JobState::Preempted => {
                    return Decision::Fail(FailureCause::SchedulerReported(observation.state));
                }
                JobState::Running => {
                    let shielded = heartbeat::within_startup_grace(
                        rt.last_submit_at,
                        policy.heartbeat_grace_sec,
                        inputs.now,
                    );
                    let heartbeat_stale = heartbeat::is_stale(
                        inputs.heartbeat,
                        policy.heartbeat_grace_sec,
                        inputs.now,
                    );
                    if !shielded {
                        if heartbeat_stale {
                            return Decision::Stall {
                                job_id: rt.job_id.clone().unwrap_or_default(),
                                kind: StallKind::Heartbeat,
                            };
                        }
                        if let Some(progress) = inputs.progress {
                            if progress.is_stale(policy.progress_stall_sec, inputs.now) {
                                return Decision::Stall {
                                    job_id: rt.job_id.clone().unwrap_or_default(),
                                    kind: StallKind::Progress,
                                };
                            }
                        }
                    }
                    return Decision::Running {
                        fresh_heartbeat: !heartbeat_stale,
                    };
                }
                JobState::Pending => return Decision::Queued,
                JobState::Unknown => {
                    if rt.unknown_streak >= policy.unknown_grace_ticks {
                        return Decision::Fail(FailureCause::Lost);
                    }
                    return Decision::Hold;
                }
            }
        }
    }

    // 10. No allocation: submit once the backoff (if any) has elapsed.
    let ready = rt
        .next_submit_at
        .map(|at| inputs.now >= at)
        .unwrap_or(true);
    if ready {
        return Decision::Submit;
    }
    Decision::Hold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunMode;
    use std::path::PathBuf;

    fn meta(mode: RunMode) -> RunMeta {
        let mut meta = RunMeta::new("r", mode, PathBuf::from("/j.sh"), 0);
        meta.policy.heartbeat_grace_sec = 90;
        meta
    }

    fn observation(state: JobState) -> JobObservation {
        JobObservation {
            state,
            node: Some("node01".into()),
            partition: Some("gpu".into()),
            reason: None,
            exit_code: None,
        }
    }

    struct Fixture {
        meta: RunMeta,
        control: ControlSignals,
        observation: Option<JobObservation>,
        heartbeat: Option<i64>,
        progress: Option<Progress>,
        has_final: bool,
        has_ended: bool,
        now: i64,
    }

    impl Fixture {
        fn new(mode: RunMode) -> Self {
            Self {
                meta: meta(mode),
                control: ControlSignals::default(),
                observation: None,
                heartbeat: None,
                progress: None,
                has_final: false,
                has_ended: false,
                now: 1000,
            }
        }

        fn with_job(mut self, state: JobState) -> Self {
            self.meta.runtime.job_id = Some("77".into());
            self.meta.runtime.last_submit_at = Some(0);
            self.observation = Some(observation(state));
            self
        }

        fn evaluate(&self) -> Decision {
            evaluate(&TickInputs {
                now: self.now,
                meta: &self.meta,
                observation: self.observation.as_ref(),
                heartbeat: self.heartbeat,
                progress: self.progress.as_ref(),
                has_final: self.has_final,
                has_ended: self.has_ended,
                control: &self.control,
            })
        }
    }

    #[test]
    fn test_fresh_run_submits() {
        let fixture = Fixture::new(RunMode::RunOnce);
        assert_eq!(fixture.evaluate(), Decision::Submit);
    }

    #[test]
    fn test_backoff_holds_until_elapsed() {
        let mut fixture = Fixture::new(RunMode::RunOnce);
        fixture.meta.runtime.phase = RunPhase::Backoff;
        fixture.meta.runtime.submission_count = 1;
        fixture.meta.runtime.next_submit_at = Some(2000);
        assert_eq!(fixture.evaluate(), Decision::Hold);
        fixture.now = 2000;
        assert_eq!(fixture.evaluate(), Decision::Submit);
    }

    #[test]
    fn test_terminal_marker_freezes_run() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Running);
        fixture.has_ended = true;
        assert_eq!(fixture.evaluate(), Decision::Hold);
    }

    #[test]
    fn test_stop_with_live_job_cancels() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Running);
        fixture.control.stop_requested = true;
        assert_eq!(
            fixture.evaluate(),
            Decision::StopCancel {
                job_id: "77".into()
            }
        );
    }

    #[test]
    fn test_stop_without_job_finalizes() {
        let mut fixture = Fixture::new(RunMode::RunOnce);
        fixture.control.stop_requested = true;
        assert_eq!(fixture.evaluate(), Decision::StopFinalize);
    }

    #[test]
    fn test_stop_confirmed_after_cancel() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Cancelled);
        fixture.control.stop_requested = true;
        fixture.meta.runtime.phase = RunPhase::Cancelling;
        fixture.meta.runtime.pending = Some(PendingOutcome::Stopped);
        // The scheduler confirmed the job is gone: finalize.
        assert_eq!(fixture.evaluate(), Decision::StopFinalize);
    }

    #[test]
    fn test_pause_cancels_queued_job_without_failure() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Pending);
        fixture.control.paused = true;
        assert_eq!(
            fixture.evaluate(),
            Decision::PauseCancel {
                job_id: "77".into()
            }
        );
    }

    #[test]
    fn test_paused_idle_run_does_not_submit() {
        let mut fixture = Fixture::new(RunMode::RunOnce);
        fixture.control.paused = true;
        assert_eq!(fixture.evaluate(), Decision::Hold);
        fixture.control.paused = false;
        assert_eq!(fixture.evaluate(), Decision::Submit);
    }

    #[test]
    fn test_restart_token_consumed_once() {
        let mut fixture = Fixture::new(RunMode::RunOnce);
        fixture.has_ended = true;
        fixture.control.requested_restart_token = Some("tok-1".into());
        assert_eq!(fixture.evaluate(), Decision::Restart { cancel: None });
        // Once consumed, the same token is stale and the run stays terminal.
        fixture.meta.runtime.consumed_restart_token = Some("tok-1".into());
        assert_eq!(fixture.evaluate(), Decision::Hold);
    }

    #[test]
    fn test_restart_cancels_live_job() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Running);
        fixture.control.requested_restart_token = Some("tok-2".into());
        assert_eq!(
            fixture.evaluate(),
            Decision::Restart {
                cancel: Some("77".into())
            }
        );
    }

    #[test]
    fn test_keep_alive_expiry_cancels_live_job() {
        let mut fixture = Fixture::new(RunMode::Indefinite).with_job(JobState::Running);
        fixture.meta.policy.keep_alive_sec = Some(3600);
        fixture.meta.runtime.run_started_at = Some(0);
        fixture.now = 3599;
        fixture.heartbeat = Some(3590);
        assert!(matches!(fixture.evaluate(), Decision::Running { .. }));
        fixture.now = 3600;
        assert_eq!(
            fixture.evaluate(),
            Decision::Expire {
                cancel: Some("77".into())
            }
        );
    }

    #[test]
    fn test_keep_alive_zero_expires_immediately_after_start() {
        let mut fixture = Fixture::new(RunMode::Indefinite).with_job(JobState::Running);
        fixture.meta.policy.keep_alive_sec = Some(0);
        fixture.meta.runtime.run_started_at = Some(1000);
        fixture.now = 1000;
        assert!(matches!(fixture.evaluate(), Decision::Expire { .. }));
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let mut fixture = Fixture::new(RunMode::RunOnce);
        fixture.meta.policy.max_retries = 0;
        fixture.meta.runtime.submission_count = 1;
        fixture.meta.runtime.phase = RunPhase::Backoff;
        assert_eq!(fixture.evaluate(), Decision::Exhausted);
    }

    #[test]
    fn test_retry_budget_not_checked_while_running() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Running);
        fixture.meta.policy.max_retries = 0;
        fixture.meta.runtime.submission_count = 1;
        fixture.heartbeat = Some(990);
        assert!(matches!(fixture.evaluate(), Decision::Running { .. }));
    }

    #[test]
    fn test_completed_with_final_is_success() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Completed);
        fixture.has_final = true;
        assert_eq!(fixture.evaluate(), Decision::Complete);
    }

    #[test]
    fn test_completed_without_final_is_failure() {
        let fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Completed);
        assert_eq!(
            fixture.evaluate(),
            Decision::Fail(FailureCause::CompletedWithoutSuccess)
        );
    }

    #[test]
    fn test_indefinite_clean_exit_is_failure() {
        let mut fixture = Fixture::new(RunMode::Indefinite).with_job(JobState::Completed);
        // Even a stray final marker does not make an indefinite run succeed.
        fixture.has_final = true;
        assert_eq!(
            fixture.evaluate(),
            Decision::Fail(FailureCause::CompletedWithoutSuccess)
        );
    }

    #[test]
    fn test_scheduler_terminal_states_are_failures() {
        for state in [
            JobState::Failed,
            JobState::Cancelled,
            JobState::Timeout,
            JobState::Preempted,
        ] {
            let fixture = Fixture::new(RunMode::RunOnce).with_job(state);
            assert_eq!(
                fixture.evaluate(),
                Decision::Fail(FailureCause::SchedulerReported(state)),
                "state {state:?}"
            );
        }
    }

    #[test]
    fn test_running_with_fresh_heartbeat() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Running);
        fixture.heartbeat = Some(980);
        assert_eq!(
            fixture.evaluate(),
            Decision::Running {
                fresh_heartbeat: true
            }
        );
    }

    #[test]
    fn test_heartbeat_age_equal_to_grace_is_not_stale() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Running);
        fixture.heartbeat = Some(fixture.now - fixture.meta.policy.heartbeat_grace_sec);
        assert_eq!(
            fixture.evaluate(),
            Decision::Running {
                fresh_heartbeat: true
            }
        );
    }

    #[test]
    fn test_stale_heartbeat_stalls() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Running);
        fixture.heartbeat = Some(100);
        assert_eq!(
            fixture.evaluate(),
            Decision::Stall {
                job_id: "77".into(),
                kind: StallKind::Heartbeat
            }
        );
    }

    #[test]
    fn test_startup_grace_shields_stale_heartbeat() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Running);
        fixture.meta.runtime.last_submit_at = Some(950);
        fixture.heartbeat = Some(100);
        assert!(matches!(fixture.evaluate(), Decision::Running { .. }));
    }

    #[test]
    fn test_progress_stall_cancels() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Running);
        fixture.meta.policy.progress_stall_sec = 60;
        fixture.heartbeat = Some(990);
        fixture.progress = Some(Progress {
            epoch: 100,
            step: None,
            note: None,
        });
        assert_eq!(
            fixture.evaluate(),
            Decision::Stall {
                job_id: "77".into(),
                kind: StallKind::Progress
            }
        );
    }

    #[test]
    fn test_absent_progress_is_ignored() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Running);
        fixture.meta.policy.progress_stall_sec = 60;
        fixture.heartbeat = Some(990);
        assert!(matches!(fixture.evaluate(), Decision::Running { .. }));
    }

    #[test]
    fn test_pending_job_is_queued() {
        let fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Pending);
        assert_eq!(fixture.evaluate(), Decision::Queued);
    }

    #[test]
    fn test_unknown_within_window_holds() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Unknown);
        fixture.meta.runtime.unknown_streak = 3;
        assert_eq!(fixture.evaluate(), Decision::Hold);
    }

    #[test]
    fn test_unknown_past_window_is_lost() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Unknown);
        fixture.meta.runtime.unknown_streak = fixture.meta.policy.unknown_grace_ticks;
        assert_eq!(fixture.evaluate(), Decision::Fail(FailureCause::Lost));
    }

    #[test]
    fn test_cancelling_awaits_then_confirms() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Running);
        fixture.meta.runtime.phase = RunPhase::Cancelling;
        fixture.meta.runtime.pending = Some(PendingOutcome::Stall(StallKind::Heartbeat));
        assert_eq!(fixture.evaluate(), Decision::AwaitCancel);

        fixture.observation = Some(observation(JobState::Cancelled));
        assert_eq!(
            fixture.evaluate(),
            Decision::CancelConfirmed(PendingOutcome::Stall(StallKind::Heartbeat))
        );
    }

    #[test]
    fn test_idempotent_decision_for_unchanged_inputs() {
        let mut fixture = Fixture::new(RunMode::RunOnce).with_job(JobState::Running);
        fixture.heartbeat = Some(990);
        let first = fixture.evaluate();
        let second = fixture.evaluate();
        assert_eq!(first, second);
    }
}
