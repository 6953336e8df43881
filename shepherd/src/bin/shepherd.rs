use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};

use shepherd::supervisor::{
    blacklist_add, blacklist_remove, create_run, get_status, list_runs, live_job_ids,
    submit_control, ControlOp,
};
use shepherd::{
    init_tracing, BlacklistStore, PartitionFallback, RunMeta, RunMode, SlurmCli, SlurmClient,
    StateStore, StopCause, Supervisor, SupervisorConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Supervise GPU workloads on a shared Slurm cluster")]
#[command(propagate_version = true)]
struct Cli {
    /// State root (defaults to $SHEPHERD_STATE_DIR or ~/.shepherd).
    #[arg(long = "state-dir", value_name = "DIR", global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervisor daemon.
    Daemon(DaemonArgs),
    /// Register a new run.
    New(NewArgs),
    /// List runs with their normalized status.
    List,
    /// Show one run's status.
    Status { run_id: String },
    /// Deliver a control operation: pause, unpause, stop, restart.
    Control { run_id: String, op: String },
    /// Inspect or edit the node blacklist.
    #[command(subcommand)]
    Blacklist(BlacklistCommand),
}

#[derive(Args, Debug)]
struct DaemonArgs {
    /// Tick period in seconds.
    #[arg(long = "tick", default_value_t = 5)]
    tick: u64,
    /// Bounded per-tick worker pool size.
    #[arg(long = "workers", default_value_t = 8)]
    workers: usize,
    /// Scheduler CLI timeout in seconds.
    #[arg(long = "cli-timeout", default_value_t = 15)]
    cli_timeout: u64,
}

#[derive(Args, Debug)]
struct NewArgs {
    #[arg(long = "run-id")]
    run_id: String,
    /// Batch script submitted for every attempt.
    #[arg(long = "script")]
    script: PathBuf,
    /// run_once or indefinite.
    #[arg(long = "mode", default_value = "run_once")]
    mode: String,
    #[arg(long = "max-retries")]
    max_retries: Option<u32>,
    /// Supervision window for indefinite runs, in seconds.
    #[arg(long = "keep-alive")]
    keep_alive: Option<i64>,
    /// Partition preference, repeatable; first is preferred.
    #[arg(long = "partition")]
    partitions: Vec<String>,
    /// Failures tolerated per partition before failing over.
    #[arg(long = "retry-per-partition")]
    retry_per_partition: Option<u32>,
    /// Seconds before the preferred partition is retried.
    #[arg(long = "reset-to-preferred")]
    reset_to_preferred: Option<i64>,
    #[arg(long = "gpus")]
    gpus: Option<u32>,
    /// Extra sbatch argument, repeatable.
    #[arg(long = "sbatch-arg")]
    sbatch_args: Vec<String>,
    #[arg(long = "heartbeat-interval")]
    heartbeat_interval: Option<i64>,
    #[arg(long = "heartbeat-grace")]
    heartbeat_grace: Option<i64>,
    #[arg(long = "progress-stall")]
    progress_stall: Option<i64>,
    #[arg(long = "backoff-base")]
    backoff_base: Option<i64>,
    #[arg(long = "backoff-max")]
    backoff_max: Option<i64>,
    #[arg(long = "blacklist-ttl")]
    blacklist_ttl: Option<i64>,
}

#[derive(Subcommand, Debug)]
enum BlacklistCommand {
    /// Show live blacklist entries.
    Show,
    /// Add a node.
    Add {
        node: String,
        #[arg(long = "ttl", default_value_t = 21_600)]
        ttl: i64,
        #[arg(long = "reason", default_value = "manual")]
        reason: String,
    },
    /// Remove a node.
    Remove { node: String },
}

fn open_store(cli: &Cli) -> StateStore {
    match &cli.state_dir {
        Some(dir) => StateStore::new(dir.clone()),
        None => StateStore::from_env(),
    }
}

async fn snapshot_for(store: &StateStore, slurm: &SlurmCli) -> shepherd::SchedulerSnapshot {
    let job_ids = live_job_ids(store);
    slurm.query(&job_ids).await.into_ok().unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let store = open_store(&cli);

    match &cli.command {
        Commands::Daemon(args) => {
            let config = SupervisorConfig::default()
                .with_tick_interval(args.tick)
                .with_worker_limit(args.workers)
                .with_cli_timeout(args.cli_timeout);
            let slurm = Arc::new(SlurmCli::new(Duration::from_secs(args.cli_timeout)));
            let supervisor = Supervisor::new(store, slurm, config);
            let stop = supervisor.stop_signal();
            tokio::spawn(async move {
                let mut sigterm = signal(SignalKind::terminate()).ok();
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => stop.request(StopCause::Interrupt),
                    _ = async {
                        match sigterm.as_mut() {
                            Some(stream) => { stream.recv().await; }
                            None => std::future::pending().await,
                        }
                    } => stop.request(StopCause::Terminate),
                }
            });
            supervisor.run().await?;
        }

        Commands::New(args) => {
            let mode: RunMode = args
                .mode
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let mut meta = RunMeta::new(
                args.run_id.clone(),
                mode,
                args.script.clone(),
                Utc::now().timestamp(),
            );
            meta.sbatch_args = args.sbatch_args.clone();
            meta.gpus = args.gpus;
            if args.partitions.len() > 1
                || args.retry_per_partition.is_some()
                || args.reset_to_preferred.is_some()
            {
                let mut fallback = PartitionFallback::new(args.partitions.clone());
                if let Some(v) = args.retry_per_partition {
                    fallback.retry_per_partition = v;
                }
                if let Some(v) = args.reset_to_preferred {
                    fallback.reset_to_preferred_sec = v;
                }
                meta.partition_fallback = Some(fallback);
            } else {
                meta.partitions = args.partitions.clone();
            }
            if let Some(v) = args.max_retries {
                meta.policy.max_retries = v;
            }
            meta.policy.keep_alive_sec = args.keep_alive;
            if let Some(v) = args.heartbeat_interval {
                meta.policy.heartbeat_interval_sec = v;
            }
            if let Some(v) = args.heartbeat_grace {
                meta.policy.heartbeat_grace_sec = v;
            }
            if let Some(v) = args.progress_stall {
                meta.policy.progress_stall_sec = v;
            }
            if let Some(v) = args.backoff_base {
                meta.policy.backoff_base_sec = v;
            }
            if let Some(v) = args.backoff_max {
                meta.policy.backoff_max_sec = v;
            }
            if let Some(v) = args.blacklist_ttl {
                meta.policy.blacklist_ttl_sec = v;
            }
            create_run(&store, &meta).context("failed to create run")?;
            println!("created run {}", meta.run_id);
        }

        Commands::List => {
            let slurm = SlurmCli::default();
            let snapshot = snapshot_for(&store, &slurm).await;
            let now = Utc::now().timestamp();
            for summary in list_runs(&store, &snapshot, now) {
                println!(
                    "{:<24} {:<12} {:<18} job={} sub={} fail={}",
                    summary.run_id,
                    summary.run_mode,
                    summary.status,
                    summary.job_id.as_deref().unwrap_or("-"),
                    summary.submission_count,
                    summary.consecutive_failures,
                );
            }
        }

        Commands::Status { run_id } => {
            let slurm = SlurmCli::default();
            let snapshot = snapshot_for(&store, &slurm).await;
            let now = Utc::now().timestamp();
            match get_status(&store, &snapshot, run_id, now) {
                Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                None => bail!("unknown run: {run_id}"),
            }
        }

        Commands::Control { run_id, op } => {
            let op = match op.as_str() {
                "pause" => ControlOp::Pause,
                "unpause" => ControlOp::Unpause,
                "stop" => ControlOp::Stop,
                "restart" => ControlOp::Restart,
                other => bail!("unknown control op: {other}"),
            };
            submit_control(&store, run_id, op).context("failed to write control signal")?;
            println!("{op:?} delivered to {run_id}");
        }

        Commands::Blacklist(cmd) => {
            let blacklist = BlacklistStore::new(&store);
            let now = Utc::now().timestamp();
            match cmd {
                BlacklistCommand::Show => {
                    let mut doc = blacklist.load();
                    doc.prune_expired(now);
                    for (node, entry) in &doc.nodes {
                        println!(
                            "{:<20} reason={} strikes={} expires_in={}s",
                            node,
                            entry.reason,
                            entry.strikes,
                            entry.added_at + entry.ttl_sec - now,
                        );
                    }
                }
                BlacklistCommand::Add { node, ttl, reason } => {
                    blacklist_add(&blacklist, node, *ttl, reason, now)?;
                    println!("blacklisted {node} for {ttl}s");
                }
                BlacklistCommand::Remove { node } => {
                    if blacklist_remove(&blacklist, node, now)? {
                        println!("removed {node}");
                    } else {
                        println!("{node} was not blacklisted");
                    }
                }
            }
        }
    }
    Ok(())
}
