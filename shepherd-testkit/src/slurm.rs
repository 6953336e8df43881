use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use shepherd::{
    CallOutcome, FinishedJob, JobObservation, JobState, SchedulerSnapshot, SlurmClient,
    SubmitRequest,
};

/// One recorded submission, including everything the supervisor put on the
/// sbatch command line.
#[derive(Clone, Debug)]
pub struct SubmitRecord {
    pub job_id: Option<String>,
    pub script: PathBuf,
    pub args: Vec<String>,
    pub partition: Option<String>,
    pub exclude: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    next_job_id: u64,
    jobs: HashMap<String, JobObservation>,
    submits: Vec<SubmitRecord>,
    cancels: Vec<String>,
    queued_submit_failures: VecDeque<String>,
    query_calls: u64,
    finished_calls: u64,
    submit_calls: u64,
    cancel_calls: u64,
}

/// Scripted in-memory scheduler.
///
/// New submissions come up PENDING; tests move them with [`set_running`],
/// [`finish`], or [`forget`]. Live jobs show up in `query` (squeue),
/// finished ones in `query_finished` (sacct), mirroring the real split.
///
/// [`set_running`]: FakeSlurmClient::set_running
/// [`finish`]: FakeSlurmClient::finish
/// [`forget`]: FakeSlurmClient::forget
#[derive(Clone, Default)]
pub struct FakeSlurmClient {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeSlurmClient {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.inner.lock().next_job_id = 1000;
        fake
    }

    /// Move a job to RUNNING on the given node.
    pub fn set_running(&self, job_id: &str, node: &str) {
        let mut state = self.inner.lock();
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.state = JobState::Running;
            job.node = Some(node.to_string());
        }
    }

    /// Move a job to a terminal state with the given wrapper exit code.
    pub fn finish(&self, job_id: &str, state: JobState, exit_code: i32, node: &str) {
        let mut inner = self.inner.lock();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.state = state;
            job.exit_code = Some(exit_code);
            job.node = Some(node.to_string());
        }
    }

    /// Drop all record of a job: it reads as UNKNOWN from then on.
    pub fn forget(&self, job_id: &str) {
        self.inner.lock().jobs.remove(job_id);
    }

    /// Queue a stderr payload for the next submit to fail with.
    pub fn queue_submit_failure(&self, stderr: &str) {
        self.inner
            .lock()
            .queued_submit_failures
            .push_back(stderr.to_string());
    }

    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.inner.lock().submits.clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.inner.lock().cancels.clone()
    }

    pub fn last_job_id(&self) -> Option<String> {
        self.inner
            .lock()
            .submits
            .iter()
            .rev()
            .find_map(|record| record.job_id.clone())
    }

    pub fn query_count(&self) -> u64 {
        self.inner.lock().query_calls
    }

    pub fn submit_count(&self) -> u64 {
        self.inner.lock().submit_calls
    }

    pub fn cancel_count(&self) -> u64 {
        self.inner.lock().cancel_calls
    }

    pub fn assert_submit_count_eq(&self, expected: usize) {
        let actual = self.inner.lock().submits.len();
        assert_eq!(actual, expected, "expected {expected} submits, got {actual}");
    }
}

#[async_trait]
impl SlurmClient for FakeSlurmClient {
    async fn submit(&self, request: &SubmitRequest) -> CallOutcome<String> {
        let mut state = self.inner.lock();
        state.submit_calls += 1;
        if let Some(stderr) = state.queued_submit_failures.pop_front() {
            state.submits.push(SubmitRecord {
                job_id: None,
                script: request.script.clone(),
                args: request.args.clone(),
                partition: request.partition.clone(),
                exclude: request.exclude.clone(),
            });
            return CallOutcome::Transient(stderr);
        }
        state.next_job_id += 1;
        let job_id = state.next_job_id.to_string();
        state.jobs.insert(
            job_id.clone(),
            JobObservation {
                state: JobState::Pending,
                node: None,
                partition: request.partition.clone(),
                reason: None,
                exit_code: None,
            },
        );
        state.submits.push(SubmitRecord {
            job_id: Some(job_id.clone()),
            script: request.script.clone(),
            args: request.args.clone(),
            partition: request.partition.clone(),
            exclude: request.exclude.clone(),
        });
        CallOutcome::Ok(job_id)
    }

    async fn query(&self, job_ids: &[String]) -> CallOutcome<SchedulerSnapshot> {
        let mut state = self.inner.lock();
        state.query_calls += 1;
        let mut snapshot = SchedulerSnapshot::new();
        for job_id in job_ids {
            if let Some(job) = state.jobs.get(job_id) {
                if job.state.is_live() {
                    snapshot.insert(job_id.clone(), job.clone());
                }
            }
        }
        CallOutcome::Ok(snapshot)
    }

    async fn query_finished(&self, job_ids: &[String]) -> CallOutcome<Vec<FinishedJob>> {
        let mut state = self.inner.lock();
        state.finished_calls += 1;
        let finished = job_ids
            .iter()
            .filter_map(|job_id| {
                state.jobs.get(job_id).and_then(|job| {
                    job.state.is_terminal().then(|| FinishedJob {
                        job_id: job_id.clone(),
                        observation: job.clone(),
                    })
                })
            })
            .collect();
        CallOutcome::Ok(finished)
    }

    async fn cancel(&self, job_id: &str) -> CallOutcome<()> {
        let mut state = self.inner.lock();
        state.cancel_calls += 1;
        state.cancels.push(job_id.to_string());
        if let Some(job) = state.jobs.get_mut(job_id) {
            if job.state.is_live() {
                job.state = JobState::Cancelled;
            }
        }
        CallOutcome::Ok(())
    }
}
