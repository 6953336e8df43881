//! Shepherd - user-space supervision for GPU workloads on shared Slurm clusters.
//!
//! A login-node daemon that keeps checkpoint/resume-capable workloads making
//! progress despite noisy infrastructure: faulty GPUs, preemption, hung jobs,
//! foreign processes, congested queues. No administrative privileges are
//! needed; everything runs over the scheduler's CLI and a shared filesystem.
//!
//! # Core Concepts
//!
//! - **Run**: One supervised workload, identified by a stable `run_id` and
//!   described by [`RunMeta`] (`meta.json`). A run owns at most one
//!   scheduler allocation at any time.
//!
//! - **Supervisor**: The [`Supervisor`] ticks every few seconds: one batched
//!   scheduler snapshot, then one [`evaluate`] step per run under its lock.
//!   Failures back off exponentially, node faults feed the [`Blacklist`],
//!   and partition failover walks an ordered preference list.
//!
//! - **Wrapper**: [`run_wrapper`] executes inside the allocation: preflight
//!   probes, a heartbeat file next to the workload subprocess, and failure/
//!   final markers. Its exit code (42/43/44/50) tells the supervisor what
//!   happened.
//!
//! - **State store**: The [`StateStore`] is the only channel between the
//!   three processes: atomic temp+fsync+rename writes, tolerant reads with
//!   corruption quarantine, and advisory per-run locks.
//!
//! - **Status**: [`compute_status`] is a pure function from on-disk state
//!   plus a scheduler snapshot to one of ten normalized statuses; the CLI
//!   and any TUI are pure consumers of it.
//!
//! # Quick Start
//!
//! ```ignore
//! use shepherd::{StateStore, Supervisor, SupervisorConfig, SlurmCli};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = StateStore::from_env();
//!     let slurm = Arc::new(SlurmCli::default());
//!     let supervisor = Supervisor::new(store, slurm, SupervisorConfig::default());
//!     supervisor.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The design is deliberately poll-based: the batch scheduler exposes no
//! event stream, so a tick loop over a single consistent snapshot is the
//! invariant that keeps the core simple. Scheduler queries are batched into
//! at most one `squeue`/`sacct` pair per tick; every external call carries a
//! hard timeout and returns an explicit [`CallOutcome`] so no failure path
//! depends on unwinding.

/// Exponential restart backoff with jitter.
pub mod backoff;

/// TTL-bounded node blacklist behind a global file lock.
pub mod blacklist;

/// Run records, policies, and supervisor configuration.
pub mod config;

/// Heartbeat parsing and staleness predicates.
pub mod heartbeat;

/// Run lifecycle types: modes, phases, markers, control signals.
pub mod run;

/// Cooperative stop signalling with recorded causes.
pub mod shutdown;

/// Scheduler CLI adapter and the [`SlurmClient`] seam.
pub mod slurm;

/// Normalized status computation.
pub mod status;

/// Shared-filesystem state store: layout, atomic writes, locks.
pub mod store;

/// The supervisor: decision machine, daemon loop, control surface.
pub mod supervisor;

/// Tracing bootstrap for the binaries.
pub mod telemetry;

/// The compute-side wrapper.
pub mod wrapper;

pub use backoff::{compute_delay, jittered_delay};
pub use blacklist::{Blacklist, BlacklistEntry, BlacklistStore};
pub use config::{
    default_state_root, PartitionFallback, PolicyOverrides, RunLink, RunMeta, RunPolicy,
    SupervisorConfig, STATE_DIR_ENV,
};
pub use run::{
    ControlSignals, EndedMarker, EndedReason, FailureKind, FailureRecord, PendingOutcome,
    Progress, RunMode, RunPhase, StallKind, EXIT_CUDA_FAILURE, EXIT_NODE_FAULT, EXIT_TRESPASSER,
    EXIT_WORKLOAD_FAILURE,
};
pub use shutdown::{StopCause, StopSignal};
pub use slurm::{
    CallOutcome, FinishedJob, JobObservation, JobState, SchedulerSnapshot, SlurmCli, SlurmClient,
    SubmitRequest,
};
pub use status::{compute_status, RunStatus, StatusInputs};
pub use store::{StateStore, StoreError};
pub use supervisor::{
    create_run, evaluate, get_status, list_runs, submit_control, ControlOp, Decision,
    FailureCause, RunSummary, Supervisor, SupervisorError, TickInputs, TickReport,
};
pub use telemetry::init_tracing;
pub use wrapper::{run_wrapper, WrapperOptions};
