use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::run::{ControlSignals, PendingOutcome, RunMode, RunPhase};

/// Environment variable overriding the state root.
pub const STATE_DIR_ENV: &str = "SHEPHERD_STATE_DIR";

const DEFAULT_STATE_DIR: &str = ".shepherd";

/// Resolve the state root: `$SHEPHERD_STATE_DIR` if set, else `~/.shepherd`.
pub fn default_state_root() -> PathBuf {
    if let Some(dir) = env::var_os(STATE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    let home = env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
    home.join(DEFAULT_STATE_DIR)
}

/// Per-run restart, stall, and blacklist policy.
///
/// All thresholds are wall-clock seconds. Stored inside `meta.json` and
/// subject to whitelisted overrides from `control.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunPolicy {
    /// Maximum failed attempts after the initial one (`run_once` only).
    pub max_retries: u32,
    /// Supervision window for `indefinite` runs, from the first submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_sec: Option<i64>,
    /// Cadence at which the wrapper rewrites the heartbeat file.
    pub heartbeat_interval_sec: i64,
    /// Heartbeat age beyond which a running job counts as hung. Also the
    /// startup window during which a missing heartbeat is tolerated.
    pub heartbeat_grace_sec: i64,
    /// Progress age beyond which a running job counts as stalled (0 = off).
    pub progress_stall_sec: i64,
    /// Base delay for the exponential restart backoff.
    pub backoff_base_sec: i64,
    /// Upper bound on the restart backoff.
    pub backoff_max_sec: i64,
    /// Whether node-blaming failures feed the blacklist.
    pub blacklist_enabled: bool,
    /// Blacklist TTL for hardware and CUDA faults.
    pub blacklist_ttl_sec: i64,
    /// Blacklist TTL for trespasser sightings (short: the foreign process
    /// is usually gone well before any hardware would be fixed).
    pub trespasser_ttl_sec: i64,
    /// Cap on the `--exclude` list passed to submissions.
    pub blacklist_limit: usize,
    /// Healthy-running uptime required before `consecutive_failures` resets
    /// (0 = the first fresh heartbeat resets immediately).
    pub healthy_uptime_reset_sec: i64,
    /// Consecutive UNKNOWN observations after which a job is presumed lost.
    pub unknown_grace_ticks: u32,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            keep_alive_sec: None,
            heartbeat_interval_sec: 30,
            heartbeat_grace_sec: 90,
            progress_stall_sec: 0,
            backoff_base_sec: 10,
            backoff_max_sec: 300,
            blacklist_enabled: true,
            blacklist_ttl_sec: 21_600,
            trespasser_ttl_sec: 900,
            blacklist_limit: 64,
            healthy_uptime_reset_sec: 0,
            unknown_grace_ticks: 10,
        }
    }
}

/// Ordered partition failover policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionFallback {
    /// Partitions in preference order; the first is the preferred one.
    pub partitions: Vec<String>,
    /// Failures tolerated on a partition before advancing to the next.
    pub retry_per_partition: u32,
    /// Seconds after which failure counters reset and the preferred
    /// partition is retried regardless of the current position.
    pub reset_to_preferred_sec: i64,
}

impl PartitionFallback {
    /// Create a fallback policy over the given partitions with defaults.
    pub fn new(partitions: Vec<String>) -> Self {
        Self {
            partitions,
            retry_per_partition: 2,
            reset_to_preferred_sec: 3600,
        }
    }
}

/// Whitelisted policy overrides carried in `control.json`.
///
/// Only fields listed here can be changed without rewriting `meta.json`;
/// they apply at decision time and are never written back.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_sec: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_sec: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_grace_sec: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_stall_sec: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_base_sec: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_max_sec: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blacklist_ttl_sec: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blacklist_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbatch_args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_fallback: Option<PartitionFallback>,
}

/// Scheduler linkage and counters mutated by the supervisor under the run
/// lock. Lives in `meta.json` next to the static template and policy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunLink {
    /// Current scheduler job id, if an allocation is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Partition the current/last allocation was submitted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default)]
    pub phase: RunPhase,
    #[serde(default)]
    pub submission_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_submit_at: Option<i64>,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Failures per partition since the last counter reset.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partition_failure_counts: BTreeMap<String, u32>,
    /// Index into the fallback partition list.
    #[serde(default)]
    pub partition_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_last_tried_at: Option<i64>,
    /// Wall clock of the first submission; anchors the keep-alive window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_started_at: Option<i64>,
    /// Earliest wall clock at which the next submission may happen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_submit_at: Option<i64>,
    /// Consecutive ticks the current job id resolved to UNKNOWN.
    #[serde(default)]
    pub unknown_streak: u32,
    /// Outcome to apply once an in-flight cancel is confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingOutcome>,
    /// Timestamp of the last failure record already acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_ts: Option<i64>,
    /// Last restart token consumed; an equal token in `control.json` is stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_restart_token: Option<String>,
    /// Wall clock of the first fresh heartbeat of the current attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy_since: Option<i64>,
    /// Node the current/last allocation landed on, as observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node: Option<String>,
}

/// Everything the supervisor knows about a run (`meta.json`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub run_mode: RunMode,
    pub created_at: i64,
    /// Batch script submitted for every attempt.
    pub script: PathBuf,
    /// Extra arguments appended to each `sbatch` invocation.
    #[serde(default)]
    pub sbatch_args: Vec<String>,
    /// GPUs per allocation; auto-injects `--gres=gpu:N` unless already set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,
    /// Ordered partition preference used when no fallback policy is set.
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_fallback: Option<PartitionFallback>,
    #[serde(default)]
    pub policy: RunPolicy,
    #[serde(default)]
    pub runtime: RunLink,
}

impl RunMeta {
    /// Create a new run record with default policy.
    pub fn new(run_id: impl Into<String>, run_mode: RunMode, script: PathBuf, now: i64) -> Self {
        Self {
            run_id: run_id.into(),
            run_mode,
            created_at: now,
            script,
            sbatch_args: Vec::new(),
            gpus: None,
            partitions: Vec::new(),
            partition_fallback: None,
            policy: RunPolicy::default(),
            runtime: RunLink::default(),
        }
    }

    /// The ordered partition list in effect: the fallback policy's if one is
    /// configured, else the template list.
    pub fn partition_list(&self) -> &[String] {
        match &self.partition_fallback {
            Some(fallback) => &fallback.partitions,
            None => &self.partitions,
        }
    }

    /// Return a copy with `control.json` overrides merged in. The merged
    /// view drives decisions only and is never persisted.
    pub fn with_overrides(&self, control: &ControlSignals) -> RunMeta {
        let Some(overrides) = &control.config_overrides else {
            return self.clone();
        };
        let mut merged = self.clone();
        if let Some(v) = overrides.max_retries {
            merged.policy.max_retries = v;
        }
        if let Some(v) = overrides.keep_alive_sec {
            merged.policy.keep_alive_sec = Some(v);
        }
        if let Some(v) = overrides.heartbeat_interval_sec {
            merged.policy.heartbeat_interval_sec = v;
        }
        if let Some(v) = overrides.heartbeat_grace_sec {
            merged.policy.heartbeat_grace_sec = v;
        }
        if let Some(v) = overrides.progress_stall_sec {
            merged.policy.progress_stall_sec = v;
        }
        if let Some(v) = overrides.backoff_base_sec {
            merged.policy.backoff_base_sec = v;
        }
        if let Some(v) = overrides.backoff_max_sec {
            merged.policy.backoff_max_sec = v;
        }
        if let Some(v) = overrides.blacklist_ttl_sec {
            merged.policy.blacklist_ttl_sec = v;
        }
        if let Some(v) = overrides.blacklist_limit {
            merged.policy.blacklist_limit = v;
        }
        if let Some(v) = &overrides.sbatch_args {
            merged.sbatch_args = v.clone();
        }
        if let Some(v) = &overrides.partition_fallback {
            merged.partition_fallback = Some(v.clone());
        }
        merged
    }
}

/// Configuration for the supervisor daemon loop.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Target tick period in seconds.
    pub tick_interval_secs: u64,
    /// Bounded per-tick run worker pool size.
    pub worker_limit: usize,
    /// Hard wall-clock timeout on every scheduler CLI call, in seconds.
    pub cli_timeout_secs: u64,
}

impl SupervisorConfig {
    /// Set the tick period.
    pub fn with_tick_interval(mut self, secs: u64) -> Self {
        self.tick_interval_secs = secs;
        self
    }

    /// Set the worker pool bound.
    pub fn with_worker_limit(mut self, limit: usize) -> Self {
        self.worker_limit = limit.max(1);
        self
    }

    /// Set the scheduler CLI timeout.
    pub fn with_cli_timeout(mut self, secs: u64) -> Self {
        self.cli_timeout_secs = secs;
        self
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            worker_limit: 8,
            cli_timeout_secs: 15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_merge_whitelisted_fields() {
        let meta = RunMeta::new("r1", RunMode::RunOnce, PathBuf::from("/tmp/job.sh"), 100);
        let control = ControlSignals {
            config_overrides: Some(PolicyOverrides {
                heartbeat_grace_sec: Some(33),
                max_retries: Some(9),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = meta.with_overrides(&control);
        assert_eq!(merged.policy.heartbeat_grace_sec, 33);
        assert_eq!(merged.policy.max_retries, 9);
        // Untouched fields keep their meta.json values.
        assert_eq!(merged.policy.backoff_base_sec, meta.policy.backoff_base_sec);
        // The source record is not mutated.
        assert_eq!(meta.policy.max_retries, 3);
    }

    #[test]
    fn test_partition_list_prefers_fallback() {
        let mut meta = RunMeta::new("r1", RunMode::RunOnce, PathBuf::from("/tmp/job.sh"), 0);
        meta.partitions = vec!["plain".into()];
        assert_eq!(meta.partition_list(), ["plain".to_string()]);
        meta.partition_fallback = Some(PartitionFallback::new(vec!["a".into(), "b".into()]));
        assert_eq!(meta.partition_list().len(), 2);
    }

    #[test]
    fn test_meta_round_trip() {
        let mut meta = RunMeta::new("r1", RunMode::Indefinite, PathBuf::from("/x.sh"), 42);
        meta.runtime.job_id = Some("1234".into());
        meta.runtime.submission_count = 2;
        let json = serde_json::to_string(&meta).unwrap();
        let back: RunMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, "r1");
        assert_eq!(back.runtime.job_id.as_deref(), Some("1234"));
        assert_eq!(back.runtime.submission_count, 2);
    }
}
