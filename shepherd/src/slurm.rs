//! Batch-scheduler CLI adapter.
//!
//! Everything the supervisor knows about Slurm flows through the
//! [`SlurmClient`] trait: one batched `squeue` per tick for live jobs, one
//! batched `sacct` for ids that fell out of the queue, `sbatch` to submit
//! and `scancel` to cancel. Every call carries a hard wall-clock timeout and
//! returns an explicit [`CallOutcome`] instead of unwinding, so no failure
//! path depends on error propagation through the tick loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Normalized scheduler state for one job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Preempted,
    Unknown,
}

impl JobState {
    /// Map a raw Slurm state string onto the normalized set.
    pub fn from_slurm(raw: &str) -> Self {
        // sacct renders cancellations as "CANCELLED by <uid>".
        let token = raw.split_whitespace().next().unwrap_or("");
        match token.to_ascii_uppercase().as_str() {
            "PENDING" | "CONFIGURING" => JobState::Pending,
            "RUNNING" | "COMPLETING" => JobState::Running,
            "COMPLETED" => JobState::Completed,
            "FAILED" | "NODE_FAIL" | "BOOT_FAIL" | "OUT_OF_MEMORY" => JobState::Failed,
            "TIMEOUT" => JobState::Timeout,
            "PREEMPTED" => JobState::Preempted,
            s if s.starts_with("CANCELLED") => JobState::Cancelled,
            _ => JobState::Unknown,
        }
    }

    /// Whether the scheduler may still run this job.
    pub fn is_live(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }

    /// Whether the scheduler is done with this job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Failed
                | JobState::Cancelled
                | JobState::Timeout
                | JobState::Preempted
        )
    }
}

/// One job's view inside a scheduler snapshot.
#[derive(Clone, Debug)]
pub struct JobObservation {
    pub state: JobState,
    pub node: Option<String>,
    pub partition: Option<String>,
    pub reason: Option<String>,
    /// Wrapper exit code, available from `sacct` for finished jobs.
    pub exit_code: Option<i32>,
}

impl JobObservation {
    pub fn unknown() -> Self {
        Self {
            state: JobState::Unknown,
            node: None,
            partition: None,
            reason: None,
            exit_code: None,
        }
    }
}

/// A single consistent scheduler view taken once per tick and shared by all
/// run workers; decisions within a tick never re-query.
#[derive(Clone, Debug, Default)]
pub struct SchedulerSnapshot {
    jobs: HashMap<String, JobObservation>,
}

impl SchedulerSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job_id: impl Into<String>, observation: JobObservation) {
        self.jobs.insert(job_id.into(), observation);
    }

    /// Look up a job; ids the scheduler did not report read as UNKNOWN.
    pub fn observe(&self, job_id: &str) -> JobObservation {
        self.jobs
            .get(job_id)
            .cloned()
            .unwrap_or_else(JobObservation::unknown)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Explicit result of one external scheduler call.
#[derive(Clone, Debug)]
pub enum CallOutcome<T> {
    Ok(T),
    /// The call exceeded its wall-clock budget and was killed.
    Timeout,
    /// The call failed in a way worth retrying next tick (nonzero exit,
    /// congested controller). Carries the stderr for diagnosis.
    Transient(String),
    /// The call cannot ever succeed as issued (missing binary).
    Fatal(String),
}

impl<T> CallOutcome<T> {
    /// The success value, if any.
    pub fn into_ok(self) -> Option<T> {
        match self {
            CallOutcome::Ok(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Ok(_))
    }
}

/// A single submission attempt.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub script: PathBuf,
    pub args: Vec<String>,
    pub partition: Option<String>,
    pub exclude: Vec<String>,
}

impl SubmitRequest {
    /// Render the full `sbatch` argument vector.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(partition) = &self.partition {
            args.retain(|arg| !arg.starts_with("--partition"));
            args.push(format!("--partition={partition}"));
        }
        if !self.exclude.is_empty() {
            args.push(format!("--exclude={}", self.exclude.join(",")));
        }
        args.push(self.script.to_string_lossy().into_owned());
        args
    }
}

/// A finished job row from `sacct`.
#[derive(Clone, Debug)]
pub struct FinishedJob {
    pub job_id: String,
    pub observation: JobObservation,
}

/// The seam between the supervisor and the scheduler.
///
/// The daemon runs against [`SlurmCli`]; tests run the identical supervisor
/// against the testkit fake.
#[async_trait]
pub trait SlurmClient: Send + Sync {
    /// Submit an allocation; returns the scheduler job id.
    async fn submit(&self, request: &SubmitRequest) -> CallOutcome<String>;

    /// Batched live query (`squeue`) over the given job ids.
    async fn query(&self, job_ids: &[String]) -> CallOutcome<SchedulerSnapshot>;

    /// Batched finished-job query (`sacct`) for ids missing from `squeue`.
    async fn query_finished(&self, job_ids: &[String]) -> CallOutcome<Vec<FinishedJob>>;

    /// Cancel a job (`scancel`). Cancelling an already-gone job succeeds.
    async fn cancel(&self, job_id: &str) -> CallOutcome<()>;
}

/// Stderr fragments that identify a partition-capacity submission failure.
const PARTITION_FAILURE_PATTERNS: &[&str] = &[
    "invalid partition name",
    "requested partition configuration not available",
    "unable to allocate resources",
    "qosmaxjobsperuserlimit",
    "partitiondown",
    "partitionnodelimit",
    "partitiontimelimit",
    "reqnodenotavail",
    "qosmaxgresperuser",
    "qosmaxcpuperuserlimit",
];

/// Extract a canonical reason from `sbatch` failure stderr.
pub fn classify_submit_stderr(stderr: &str) -> &'static str {
    let lowered = stderr.to_ascii_lowercase();
    for pattern in PARTITION_FAILURE_PATTERNS {
        if lowered.contains(pattern) {
            return pattern;
        }
    }
    "unknown"
}

/// Parse `Submitted batch job <N>` from sbatch stdout.
pub fn parse_submit_stdout(stdout: &str) -> Option<String> {
    stdout
        .split_whitespace()
        .find(|token| token.chars().all(|c| c.is_ascii_digit()) && !token.is_empty())
        .map(str::to_string)
}

/// Parse one `squeue --noheader -o "%i|%T|%R|%P|%N"` line.
fn parse_squeue_line(line: &str) -> Option<(String, JobObservation)> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() != 5 {
        return None;
    }
    let node = parts[4].trim();
    Some((
        parts[0].trim().to_string(),
        JobObservation {
            state: JobState::from_slurm(parts[1]),
            node: (!node.is_empty()).then(|| node.to_string()),
            partition: Some(parts[3].trim().to_string()),
            reason: Some(parts[2].trim().to_string()),
            exit_code: None,
        },
    ))
}

/// Parse one `sacct -P -n -o JobID,State,ExitCode,NodeList` line, skipping
/// step rows (`<id>.batch`, `<id>.extern`).
fn parse_sacct_line(line: &str) -> Option<FinishedJob> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() < 4 {
        return None;
    }
    let job_id = parts[0].trim();
    if job_id.is_empty() || job_id.contains('.') {
        return None;
    }
    // ExitCode renders as "<exit>:<signal>".
    let exit_code = parts[2]
        .split(':')
        .next()
        .and_then(|code| code.trim().parse::<i32>().ok());
    let node = parts[3].trim();
    Some(FinishedJob {
        job_id: job_id.to_string(),
        observation: JobObservation {
            state: JobState::from_slurm(parts[1]),
            node: (!node.is_empty() && node != "None assigned").then(|| node.to_string()),
            partition: None,
            reason: None,
            exit_code,
        },
    })
}

/// Scheduler CLI client shelling out to `sbatch`/`squeue`/`sacct`/`scancel`.
#[derive(Clone, Debug)]
pub struct SlurmCli {
    timeout: Duration,
}

struct CliOutput {
    status: i32,
    stdout: String,
    stderr: String,
}

impl SlurmCli {
    /// Create a client with the given per-call wall-clock timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, program: &str, args: &[String]) -> CallOutcome<CliOutput> {
        debug!(%program, ?args, "scheduler cli call");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return CallOutcome::Fatal(format!("{program} not found on PATH"));
            }
            Err(error) => return CallOutcome::Transient(format!("spawn {program}: {error}")),
        };
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            // Dropping the future kills the child via kill_on_drop.
            Err(_) => {
                warn!(%program, "scheduler cli call timed out");
                return CallOutcome::Timeout;
            }
            Ok(Err(error)) => return CallOutcome::Transient(format!("wait {program}: {error}")),
            Ok(Ok(output)) => output,
        };
        let result = CliOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        CallOutcome::Ok(result)
    }
}

impl Default for SlurmCli {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl SlurmClient for SlurmCli {
    async fn submit(&self, request: &SubmitRequest) -> CallOutcome<String> {
        let args = request.to_args();
        match self.run("sbatch", &args).await {
            CallOutcome::Ok(output) if output.status == 0 => {
                match parse_submit_stdout(&output.stdout) {
                    Some(job_id) => CallOutcome::Ok(job_id),
                    None => CallOutcome::Transient(format!(
                        "sbatch succeeded but no job id in: {}",
                        output.stdout.trim()
                    )),
                }
            }
            CallOutcome::Ok(output) => CallOutcome::Transient(output.stderr),
            CallOutcome::Timeout => CallOutcome::Timeout,
            CallOutcome::Transient(err) => CallOutcome::Transient(err),
            CallOutcome::Fatal(err) => CallOutcome::Fatal(err),
        }
    }

    async fn query(&self, job_ids: &[String]) -> CallOutcome<SchedulerSnapshot> {
        if job_ids.is_empty() {
            return CallOutcome::Ok(SchedulerSnapshot::new());
        }
        let args = vec![
            "--noheader".to_string(),
            "-o".to_string(),
            "%i|%T|%R|%P|%N".to_string(),
            format!("--jobs={}", job_ids.join(",")),
        ];
        match self.run("squeue", &args).await {
            CallOutcome::Ok(output) if output.status == 0 => {
                let mut snapshot = SchedulerSnapshot::new();
                for line in output.stdout.lines() {
                    if let Some((job_id, observation)) = parse_squeue_line(line) {
                        snapshot.insert(job_id, observation);
                    }
                }
                CallOutcome::Ok(snapshot)
            }
            CallOutcome::Ok(output) => CallOutcome::Transient(output.stderr),
            CallOutcome::Timeout => CallOutcome::Timeout,
            CallOutcome::Transient(err) => CallOutcome::Transient(err),
            CallOutcome::Fatal(err) => CallOutcome::Fatal(err),
        }
    }

    async fn query_finished(&self, job_ids: &[String]) -> CallOutcome<Vec<FinishedJob>> {
        if job_ids.is_empty() {
            return CallOutcome::Ok(Vec::new());
        }
        let args = vec![
            "-P".to_string(),
            "-n".to_string(),
            "-o".to_string(),
            "JobID,State,ExitCode,NodeList".to_string(),
            "-j".to_string(),
            job_ids.join(","),
        ];
        match self.run("sacct", &args).await {
            CallOutcome::Ok(output) if output.status == 0 => {
                let finished = output.stdout.lines().filter_map(parse_sacct_line).collect();
                CallOutcome::Ok(finished)
            }
            CallOutcome::Ok(output) => CallOutcome::Transient(output.stderr),
            CallOutcome::Timeout => CallOutcome::Timeout,
            CallOutcome::Transient(err) => CallOutcome::Transient(err),
            CallOutcome::Fatal(err) => CallOutcome::Fatal(err),
        }
    }

    async fn cancel(&self, job_id: &str) -> CallOutcome<()> {
        match self.run("scancel", &[job_id.to_string()]).await {
            CallOutcome::Ok(output) if output.status == 0 => CallOutcome::Ok(()),
            CallOutcome::Ok(output) => CallOutcome::Transient(output.stderr),
            CallOutcome::Timeout => CallOutcome::Timeout,
            CallOutcome::Transient(err) => CallOutcome::Transient(err),
            CallOutcome::Fatal(err) => CallOutcome::Fatal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(JobState::from_slurm("PENDING"), JobState::Pending);
        assert_eq!(JobState::from_slurm("CONFIGURING"), JobState::Pending);
        assert_eq!(JobState::from_slurm("RUNNING"), JobState::Running);
        assert_eq!(JobState::from_slurm("COMPLETING"), JobState::Running);
        assert_eq!(JobState::from_slurm("COMPLETED"), JobState::Completed);
        assert_eq!(JobState::from_slurm("FAILED"), JobState::Failed);
        assert_eq!(JobState::from_slurm("NODE_FAIL"), JobState::Failed);
        assert_eq!(JobState::from_slurm("BOOT_FAIL"), JobState::Failed);
        assert_eq!(JobState::from_slurm("TIMEOUT"), JobState::Timeout);
        assert_eq!(JobState::from_slurm("PREEMPTED"), JobState::Preempted);
        assert_eq!(JobState::from_slurm("CANCELLED"), JobState::Cancelled);
        assert_eq!(JobState::from_slurm("CANCELLED by 1000"), JobState::Cancelled);
        assert_eq!(JobState::from_slurm("REQUEUED"), JobState::Unknown);
        assert_eq!(JobState::from_slurm(""), JobState::Unknown);
    }

    #[test]
    fn test_parse_submit_stdout() {
        assert_eq!(
            parse_submit_stdout("Submitted batch job 12345\n"),
            Some("12345".to_string())
        );
        assert_eq!(parse_submit_stdout("sbatch: error"), None);
    }

    #[test]
    fn test_parse_squeue_line() {
        let (job_id, obs) = parse_squeue_line("123|RUNNING|None|gpu_a100|node017").unwrap();
        assert_eq!(job_id, "123");
        assert_eq!(obs.state, JobState::Running);
        assert_eq!(obs.node.as_deref(), Some("node017"));
        assert_eq!(obs.partition.as_deref(), Some("gpu_a100"));
        assert!(parse_squeue_line("garbage").is_none());
    }

    #[test]
    fn test_parse_sacct_line() {
        let finished = parse_sacct_line("123|FAILED|42:0|node017").unwrap();
        assert_eq!(finished.job_id, "123");
        assert_eq!(finished.observation.state, JobState::Failed);
        assert_eq!(finished.observation.exit_code, Some(42));
        assert_eq!(finished.observation.node.as_deref(), Some("node017"));
        // Step rows are skipped.
        assert!(parse_sacct_line("123.batch|FAILED|42:0|node017").is_none());
        assert!(parse_sacct_line("123.extern|COMPLETED|0:0|node017").is_none());
    }

    #[test]
    fn test_submit_args_rendering() {
        let request = SubmitRequest {
            script: PathBuf::from("/home/u/train.sh"),
            args: vec!["--partition=stale".into(), "--time=1:00:00".into()],
            partition: Some("gpu_a100".into()),
            exclude: vec!["node01".into(), "node02".into()],
        };
        let args = request.to_args();
        // The chosen partition replaces any stale one from the template.
        assert!(!args.contains(&"--partition=stale".to_string()));
        assert!(args.contains(&"--partition=gpu_a100".to_string()));
        assert!(args.contains(&"--exclude=node01,node02".to_string()));
        assert_eq!(args.last().unwrap(), "/home/u/train.sh");
    }

    #[test]
    fn test_classify_submit_stderr() {
        assert_eq!(
            classify_submit_stderr("sbatch: error: invalid partition name specified"),
            "invalid partition name"
        );
        assert_eq!(
            classify_submit_stderr("sbatch: error: PartitionDown"),
            "partitiondown"
        );
        assert_eq!(classify_submit_stderr("something else"), "unknown");
    }

    #[test]
    fn test_snapshot_unknown_default() {
        let snapshot = SchedulerSnapshot::new();
        assert_eq!(snapshot.observe("404").state, JobState::Unknown);
    }
}
