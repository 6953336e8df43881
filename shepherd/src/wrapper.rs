//! Compute-side wrapper: the process launched inside each allocation.
//!
//! Sequence: preflight probes (node faults fail fast, before the workload
//! ever starts), then a heartbeat task next to the workload subprocess,
//! then terminal markers. The exit code is the contract the supervisor keys
//! restart and blacklist decisions off: 42 node fault, 43 trespasser,
//! 44 CUDA failure, 50 workload failure.

use std::env;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::run::{
    FailureKind, FailureRecord, RunMode, EXIT_CUDA_FAILURE, EXIT_NODE_FAULT, EXIT_TRESPASSER,
    EXIT_WORKLOAD_FAILURE,
};
use crate::shutdown::{StopCause, StopSignal};
use crate::store::{self, StateStore};

/// Expected GPU device count; mismatch fails the count probe.
pub const ENV_EXPECTED_GPU_COUNT: &str = "SHEPHERD_EXPECTED_GPU_COUNT";
/// Expected MIG instance count; mismatch fails the count probe.
pub const ENV_EXPECTED_MIG_COUNT: &str = "SHEPHERD_EXPECTED_MIG_COUNT";
/// Set to `1` to enable the trespasser probe.
pub const ENV_TRESPASSER_CHECK: &str = "SHEPHERD_TRESPASSER_CHECK";
/// Command line (run through `sh -c`) for the CUDA smoke test; exit 2 from
/// it means a real CUDA failure. Unset skips the probe.
pub const ENV_CUDA_SMOKE_CMD: &str = "SHEPHERD_CUDA_SMOKE_CMD";
/// Set to `1` to skip the CUDA smoke test.
pub const ENV_SKIP_CUDA_SMOKE: &str = "SHEPHERD_SKIP_CUDA_SMOKE";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SMOKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Wrapper invocation parameters (the CLI contract consumed by batch
/// scripts).
#[derive(Clone, Debug)]
pub struct WrapperOptions {
    pub run_id: String,
    pub run_mode: RunMode,
    pub state_root: PathBuf,
    pub heartbeat_interval: Duration,
    /// Skip all preflight probes (CPU-only smoke runs and tests).
    pub skip_preflight: bool,
}

/// A preflight probe verdict that must terminate the wrapper.
#[derive(Debug, Error)]
#[error("{reason}: {detail}")]
struct ProbeFailure {
    exit_code: i32,
    kind: FailureKind,
    reason: &'static str,
    detail: String,
}

impl ProbeFailure {
    fn node_fault(reason: &'static str, detail: impl Into<String>) -> Self {
        Self {
            exit_code: EXIT_NODE_FAULT,
            kind: FailureKind::NodeFault,
            reason,
            detail: detail.into(),
        }
    }
}

/// The node this wrapper is running on.
fn node_name() -> String {
    if let Ok(node) = env::var("SLURMD_NODENAME") {
        if !node.is_empty() {
            return node;
        }
    }
    let mut buf = [0u8; 256];
    // SAFETY: gethostname writes a NUL-terminated name into the buffer we
    // own; the length argument keeps it in bounds.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        "unknown".to_string()
    }
}

struct ProbeOutput {
    status: i32,
    stdout: String,
    stderr: String,
}

async fn run_probe_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<ProbeOutput, ProbeFailure> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| ProbeFailure::node_fault("probe_spawn_failed", error.to_string()))?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ProbeFailure::node_fault("probe_timeout", program.to_string()))?
        .map_err(|error| ProbeFailure::node_fault("probe_wait_failed", error.to_string()))?;
    Ok(ProbeOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Enumerate visible GPUs; zero devices or an enumeration error is a node
/// fault. Returns the listing for the count probe.
async fn probe_gpu_visibility() -> Result<String, ProbeFailure> {
    let output = run_probe_command("nvidia-smi", &["-L"], PROBE_TIMEOUT).await?;
    if output.status != 0 {
        return Err(ProbeFailure::node_fault("gpu_visibility_failed", output.stderr));
    }
    if output.stdout.lines().filter(|l| !l.trim().is_empty()).count() == 0 {
        return Err(ProbeFailure::node_fault("gpu_visibility_empty", output.stdout));
    }
    Ok(output.stdout)
}

/// MIG/container sanity: compare the visible device counts against what the
/// environment says this allocation should have.
fn probe_expected_counts(listing: &str) -> Result<(), ProbeFailure> {
    if let Ok(expected) = env::var(ENV_EXPECTED_GPU_COUNT) {
        if let Ok(expected) = expected.parse::<usize>() {
            let count = listing
                .lines()
                .filter(|line| line.trim_start().starts_with("GPU "))
                .count();
            if count != expected {
                return Err(ProbeFailure::node_fault(
                    "gpu_count_mismatch",
                    format!("expected {expected}, visible {count}"),
                ));
            }
        }
    }
    if let Ok(expected) = env::var(ENV_EXPECTED_MIG_COUNT) {
        if let Ok(expected) = expected.parse::<usize>() {
            let count = listing.lines().filter(|line| line.contains("MIG")).count();
            if count != expected {
                return Err(ProbeFailure::node_fault(
                    "mig_count_mismatch",
                    format!("expected {expected}, visible {count}"),
                ));
            }
        }
    }
    Ok(())
}

/// CUDA smoke test, delegated to a configured probe command so the wrapper
/// stays free of vendor runtime bindings. Exit 2 from the probe means a
/// real CUDA failure; anything else passes.
async fn probe_cuda_smoke() -> Result<(), ProbeFailure> {
    if env::var(ENV_SKIP_CUDA_SMOKE).as_deref() == Ok("1") {
        return Ok(());
    }
    let Ok(cmd) = env::var(ENV_CUDA_SMOKE_CMD) else {
        info!("no CUDA smoke command configured; skipping probe");
        return Ok(());
    };
    let output = match run_probe_command("sh", &["-c", &cmd], SMOKE_TIMEOUT).await {
        Ok(output) => output,
        Err(failure) => {
            return Err(ProbeFailure {
                exit_code: EXIT_CUDA_FAILURE,
                kind: FailureKind::CudaFailure,
                reason: "cuda_smoke_failed",
                detail: failure.detail,
            });
        }
    };
    if output.status == 2 {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout
        } else {
            output.stderr
        };
        return Err(ProbeFailure {
            exit_code: EXIT_CUDA_FAILURE,
            kind: FailureKind::CudaFailure,
            reason: "cuda_smoke_failed",
            detail: detail.trim().to_string(),
        });
    }
    Ok(())
}

/// Best-effort trespasser check: foreign user PIDs on the GPUs mean the
/// allocation is unusable, but we never touch the processes themselves.
async fn probe_trespassers() -> Result<(), ProbeFailure> {
    if env::var(ENV_TRESPASSER_CHECK).as_deref() != Ok("1") {
        return Ok(());
    }
    let output = match run_probe_command(
        "nvidia-smi",
        &["--query-compute-apps=pid,process_name", "--format=csv,noheader"],
        PROBE_TIMEOUT,
    )
    .await
    {
        Ok(output) if output.status == 0 => output,
        // Best effort: an unqueryable GPU is the visibility probe's problem.
        _ => return Ok(()),
    };
    let current_user = env::var("USER").unwrap_or_default();
    for line in output.stdout.lines() {
        let pid = line.split(',').next().unwrap_or("").trim();
        if pid.is_empty() || !pid.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let ps = match run_probe_command("ps", &["-o", "user=", "-p", pid], PROBE_TIMEOUT).await {
            Ok(ps) if ps.status == 0 => ps,
            _ => continue,
        };
        let owner = ps.stdout.trim();
        if !owner.is_empty() && !current_user.is_empty() && owner != current_user {
            return Err(ProbeFailure {
                exit_code: EXIT_TRESPASSER,
                kind: FailureKind::Trespasser,
                reason: "foreign_gpu_process",
                detail: line.trim().to_string(),
            });
        }
    }
    Ok(())
}

fn write_failure(
    store: &StateStore,
    run_id: &str,
    exit_code: i32,
    kind: FailureKind,
    detail: Option<String>,
) {
    let record = FailureRecord {
        exit_code,
        kind,
        node: Some(node_name()),
        job_id: env::var("SLURM_JOB_ID").ok(),
        timestamp: Utc::now().timestamp(),
        detail,
    };
    if let Err(error) = store.write_failure(run_id, &record) {
        warn!(%error, "failed to write failure record");
    }
}

/// Forward a signal to the workload subprocess.
fn forward_signal(pid: Option<u32>, sig: libc::c_int) {
    if let Some(pid) = pid {
        // SAFETY: signalling a child we spawned and still own.
        unsafe {
            libc::kill(pid as libc::pid_t, sig);
        }
    }
}

/// Run the wrapper: probes, heartbeat, workload, markers. Returns the
/// wrapper's exit code per the contract.
pub async fn run_wrapper(options: WrapperOptions, workload: Vec<String>) -> i32 {
    let store = StateStore::new(&options.state_root);
    let run_id = options.run_id.clone();

    if workload.is_empty() {
        warn!("no workload command given");
        return EXIT_WORKLOAD_FAILURE;
    }

    if !options.skip_preflight {
        let preflight = async {
            let listing = probe_gpu_visibility().await?;
            probe_expected_counts(&listing)?;
            probe_cuda_smoke().await?;
            probe_trespassers().await
        };
        if let Err(failure) = preflight.await {
            warn!(reason = failure.reason, detail = %failure.detail, "preflight probe failed");
            write_failure(
                &store,
                &run_id,
                failure.exit_code,
                failure.kind,
                Some(format!("{}: {}", failure.reason, failure.detail)),
            );
            return failure.exit_code;
        }
        info!("preflight probes passed");
    }

    // Heartbeat task: single writer of the heartbeat file, stopped promptly
    // on workload exit.
    let stop = StopSignal::new();
    let heartbeat_path = store.heartbeat_path(&run_id);
    let heartbeat_stop = stop.clone();
    let interval = options.heartbeat_interval;
    let heartbeat_task = tokio::spawn(async move {
        loop {
            let beat = format!("{}\n", Utc::now().timestamp());
            if let Err(error) = store::atomic_write_text(&heartbeat_path, &beat) {
                warn!(%error, "heartbeat write failed");
            }
            tokio::select! {
                _ = heartbeat_stop.stopped() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    });

    let mut command = Command::new(&workload[0]);
    command.args(&workload[1..]);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            stop.request(StopCause::Finished);
            let _ = heartbeat_task.await;
            write_failure(
                &store,
                &run_id,
                EXIT_WORKLOAD_FAILURE,
                FailureKind::WorkloadFailure,
                Some(format!("spawn failed: {error}")),
            );
            return EXIT_WORKLOAD_FAILURE;
        }
    };
    let child_pid = child.id();
    info!(pid = child_pid, command = %workload.join(" "), "workload started");

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    let mut terminated_by: Option<&'static str> = None;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = async { match sigterm.as_mut() { Some(s) => { s.recv().await; } None => std::future::pending().await } } => {
                warn!("SIGTERM received; forwarding to workload");
                terminated_by = Some("SIGTERM");
                forward_signal(child_pid, libc::SIGTERM);
            }
            _ = async { match sigint.as_mut() { Some(s) => { s.recv().await; } None => std::future::pending().await } } => {
                warn!("SIGINT received; forwarding to workload");
                terminated_by = Some("SIGINT");
                forward_signal(child_pid, libc::SIGINT);
            }
        }
    };

    stop.request(StopCause::Finished);
    let _ = tokio::time::timeout(Duration::from_secs(5), heartbeat_task).await;

    let exit_code = match &status {
        Ok(status) => status.code(),
        Err(error) => {
            warn!(%error, "failed to collect workload status");
            None
        }
    };

    if let Some(signal_name) = terminated_by {
        write_failure(
            &store,
            &run_id,
            EXIT_WORKLOAD_FAILURE,
            FailureKind::WorkloadFailure,
            Some(format!("terminated: {signal_name}")),
        );
        return EXIT_WORKLOAD_FAILURE;
    }

    match exit_code {
        Some(0) => {
            if options.run_mode == RunMode::RunOnce {
                if let Err(error) = store.write_final(&run_id) {
                    warn!(%error, "failed to write final marker");
                    return EXIT_WORKLOAD_FAILURE;
                }
            }
            info!("workload finished cleanly");
            0
        }
        code => {
            let detail = match code {
                Some(code) => format!("workload exit code {code}"),
                None => "workload killed by signal".to_string(),
            };
            write_failure(
                &store,
                &run_id,
                EXIT_WORKLOAD_FAILURE,
                FailureKind::WorkloadFailure,
                Some(detail),
            );
            EXIT_WORKLOAD_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(root: &std::path::Path, mode: RunMode) -> WrapperOptions {
        WrapperOptions {
            run_id: "wrap-test".to_string(),
            run_mode: mode,
            state_root: root.to_path_buf(),
            heartbeat_interval: Duration::from_millis(50),
            skip_preflight: true,
        }
    }

    #[test]
    fn test_node_name_not_empty() {
        assert!(!node_name().is_empty());
    }

    #[tokio::test]
    async fn test_clean_exit_writes_final_marker_for_run_once() {
        let tmp = TempDir::new().unwrap();
        let code = run_wrapper(
            options(tmp.path(), RunMode::RunOnce),
            vec!["true".to_string()],
        )
        .await;
        assert_eq!(code, 0);
        let store = StateStore::new(tmp.path());
        assert!(store.has_final("wrap-test"));
        assert!(store.read_heartbeat("wrap-test").is_some());
    }

    #[tokio::test]
    async fn test_clean_exit_indefinite_writes_no_final_marker() {
        let tmp = TempDir::new().unwrap();
        let code = run_wrapper(
            options(tmp.path(), RunMode::Indefinite),
            vec!["true".to_string()],
        )
        .await;
        assert_eq!(code, 0);
        assert!(!StateStore::new(tmp.path()).has_final("wrap-test"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_writes_failure_record() {
        let tmp = TempDir::new().unwrap();
        let code = run_wrapper(
            options(tmp.path(), RunMode::RunOnce),
            vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()],
        )
        .await;
        assert_eq!(code, EXIT_WORKLOAD_FAILURE);
        let store = StateStore::new(tmp.path());
        let failure = store.read_failure("wrap-test").unwrap();
        assert_eq!(failure.kind, FailureKind::WorkloadFailure);
        assert_eq!(failure.exit_code, EXIT_WORKLOAD_FAILURE);
        assert!(failure.detail.unwrap().contains('7'));
        assert!(!store.has_final("wrap-test"));
    }

    #[tokio::test]
    async fn test_missing_workload_is_a_workload_failure() {
        let tmp = TempDir::new().unwrap();
        let code = run_wrapper(options(tmp.path(), RunMode::RunOnce), vec![]).await;
        assert_eq!(code, EXIT_WORKLOAD_FAILURE);
    }

    #[test]
    fn test_expected_count_probe() {
        let listing = "GPU 0: NVIDIA A100 (UUID: x)\nGPU 1: NVIDIA A100 (UUID: y)\n";
        std::env::set_var(ENV_EXPECTED_GPU_COUNT, "2");
        assert!(probe_expected_counts(listing).is_ok());
        std::env::set_var(ENV_EXPECTED_GPU_COUNT, "4");
        let failure = probe_expected_counts(listing).unwrap_err();
        assert_eq!(failure.exit_code, EXIT_NODE_FAULT);
        std::env::remove_var(ENV_EXPECTED_GPU_COUNT);
    }
}
