use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use shepherd::{default_state_root, init_tracing, run_wrapper, RunMode, WrapperOptions};

/// Compute-side wrapper: probes the node, heartbeats, runs the workload.
///
/// Usage inside a batch script:
///   shepherd-wrapper --run-id ID --run-mode run_once -- <workload...>
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[arg(long = "run-id")]
    run_id: String,

    /// run_once or indefinite.
    #[arg(long = "run-mode", default_value = "run_once")]
    run_mode: String,

    /// State root (defaults to $SHEPHERD_STATE_DIR or ~/.shepherd).
    #[arg(long = "state-dir")]
    state_dir: Option<PathBuf>,

    /// Heartbeat write cadence in seconds.
    #[arg(long = "heartbeat-interval", default_value_t = 30)]
    heartbeat_interval: u64,

    /// Skip preflight probes (CPU-only smoke runs).
    #[arg(long = "skip-preflight")]
    skip_preflight: bool,

    /// The workload command, after `--`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let run_mode: RunMode = match cli.run_mode.parse() {
        Ok(mode) => mode,
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(2);
        }
    };

    let mut command = cli.command;
    if command.first().map(String::as_str) == Some("--") {
        command.remove(0);
    }

    let options = WrapperOptions {
        run_id: cli.run_id,
        run_mode,
        state_root: cli.state_dir.unwrap_or_else(default_state_root),
        heartbeat_interval: Duration::from_secs(cli.heartbeat_interval.max(1)),
        skip_preflight: cli.skip_preflight,
    };
    let code = run_wrapper(options, command).await;
    std::process::exit(code);
}
