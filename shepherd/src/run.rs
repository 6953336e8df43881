use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Wrapper exit code for a node hardware or configuration fault.
pub const EXIT_NODE_FAULT: i32 = 42;
/// Wrapper exit code for foreign processes occupying the allocation's GPUs.
pub const EXIT_TRESPASSER: i32 = 43;
/// Wrapper exit code for a failed CUDA smoke test.
pub const EXIT_CUDA_FAILURE: i32 = 44;
/// Wrapper exit code for a workload that exited nonzero.
pub const EXIT_WORKLOAD_FAILURE: i32 = 50;

/// How a run is supervised once its workload finishes.
///
/// `RunOnce` runs terminate on the first true success (exit 0 plus the final
/// marker) or after `max_retries` failed attempts. `Indefinite` runs are
/// resubmitted after every exit until their keep-alive window closes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    RunOnce,
    Indefinite,
}

impl RunMode {
    /// Get the string representation of this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::RunOnce => "run_once",
            RunMode::Indefinite => "indefinite",
        }
    }
}

impl Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run_once" => Ok(RunMode::RunOnce),
            "indefinite" => Ok(RunMode::Indefinite),
            other => Err(format!("unknown run mode: {other}")),
        }
    }
}

/// Supervisor-side lifecycle phase of a run.
///
/// Persisted in `meta.json` so the daemon can resume mid-lifecycle after a
/// restart and so status normalization can distinguish backoff from queueing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Created, never submitted.
    #[default]
    Init,
    /// Submission issued this tick; job id not yet confirmed.
    SubmitPending,
    /// Allocation is waiting in the scheduler queue.
    Queued,
    /// Allocation is running on a node.
    Running,
    /// A cancel was issued; waiting for the scheduler to confirm.
    Cancelling,
    /// Waiting out a restart delay (or a pause).
    Backoff,
    /// `ended.json` written; no further transitions.
    Terminal,
}

/// Classified cause of a failed attempt, as reported by the wrapper.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NodeFault,
    Trespasser,
    CudaFailure,
    WorkloadFailure,
    Unknown,
}

impl FailureKind {
    /// Classify a wrapper exit code. Unrecognized nonzero codes are treated
    /// as workload failures.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            EXIT_NODE_FAULT => FailureKind::NodeFault,
            EXIT_TRESPASSER => FailureKind::Trespasser,
            EXIT_CUDA_FAILURE => FailureKind::CudaFailure,
            _ => FailureKind::WorkloadFailure,
        }
    }

    /// Whether this kind is evidence against the node itself and therefore
    /// drives a blacklist insertion.
    pub fn blames_node(&self) -> bool {
        matches!(
            self,
            FailureKind::NodeFault | FailureKind::Trespasser | FailureKind::CudaFailure
        )
    }

    /// Get the string representation of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NodeFault => "node_fault",
            FailureKind::Trespasser => "trespasser",
            FailureKind::CudaFailure => "cuda_failure",
            FailureKind::WorkloadFailure => "workload_failure",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record written by the wrapper on any nonzero exit (`failure.json`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureRecord {
    pub exit_code: i32,
    pub kind: FailureKind,
    pub node: Option<String>,
    pub job_id: Option<String>,
    pub timestamp: i64,
    pub detail: Option<String>,
}

/// Why a run reached its terminal state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndedReason {
    Success,
    MaxRetries,
    WindowExpired,
    StoppedManual,
    FatalError,
}

impl EndedReason {
    /// Get the string representation of this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndedReason::Success => "success",
            EndedReason::MaxRetries => "max_retries",
            EndedReason::WindowExpired => "window_expired",
            EndedReason::StoppedManual => "stopped_manual",
            EndedReason::FatalError => "fatal_error",
        }
    }
}

impl Display for EndedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal record written exactly once by the supervisor (`ended.json`).
///
/// Its presence forbids any further state transition for the run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndedMarker {
    pub reason: EndedReason,
    pub at: i64,
    pub run_mode: RunMode,
}

/// User- or TUI-written control signals (`control.json`), supervisor-read.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControlSignals {
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub stop_requested: bool,
    /// Monotonic restart request token. A token different from the last one
    /// the supervisor consumed triggers a restart; an equal token is stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_restart_token: Option<String>,
    /// Whitelisted policy overrides merged over `meta.json` at decision time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_overrides: Option<crate::config::PolicyOverrides>,
}

/// Optional workload progress report (`progress.json`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Progress {
    pub epoch: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Progress {
    /// A progress report is stale once its age strictly exceeds the stall
    /// window. A window of zero disables the check entirely.
    pub fn is_stale(&self, stall_sec: i64, now: i64) -> bool {
        stall_sec > 0 && now - self.epoch > stall_sec
    }
}

/// What a stall was detected from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallKind {
    Heartbeat,
    Progress,
}

/// Outcome to apply once an in-flight cancel is confirmed by the scheduler.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOutcome {
    /// Stop requested: finalize with `stopped_manual`.
    Stopped,
    /// Paused with a live job: hold in backoff, no failure counted.
    Paused,
    /// Heartbeat or progress stall: resume via backoff (already counted).
    Stall(StallKind),
    /// Restart token consumed: clear terminal state and resubmit.
    Restart,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_classification() {
        assert_eq!(FailureKind::from_exit_code(42), FailureKind::NodeFault);
        assert_eq!(FailureKind::from_exit_code(43), FailureKind::Trespasser);
        assert_eq!(FailureKind::from_exit_code(44), FailureKind::CudaFailure);
        assert_eq!(FailureKind::from_exit_code(50), FailureKind::WorkloadFailure);
        // Anything else nonzero collapses to a workload failure.
        assert_eq!(FailureKind::from_exit_code(1), FailureKind::WorkloadFailure);
        assert_eq!(FailureKind::from_exit_code(137), FailureKind::WorkloadFailure);
    }

    #[test]
    fn test_blames_node() {
        assert!(FailureKind::NodeFault.blames_node());
        assert!(FailureKind::Trespasser.blames_node());
        assert!(FailureKind::CudaFailure.blames_node());
        assert!(!FailureKind::WorkloadFailure.blames_node());
        assert!(!FailureKind::Unknown.blames_node());
    }

    #[test]
    fn test_progress_staleness() {
        let progress = Progress {
            epoch: 100,
            step: Some(7),
            note: None,
        };
        assert!(progress.is_stale(50, 200));
        // Age exactly equal to the window is not stale.
        assert!(!progress.is_stale(100, 200));
        // Zero disables the check.
        assert!(!progress.is_stale(0, 10_000));
    }

    #[test]
    fn test_run_mode_round_trip() {
        for mode in [RunMode::RunOnce, RunMode::Indefinite] {
            assert_eq!(mode.as_str().parse::<RunMode>().unwrap(), mode);
        }
        assert!("forever".parse::<RunMode>().is_err());
    }
}
