//! In-memory fakes and state helpers for shepherd tests.
//!
//! [`FakeSlurmClient`] stands in for the scheduler CLI: tests script job
//! state transitions and assert on recorded submit/cancel calls, while the
//! supervisor under test runs unchanged. [`TestState`] provides a throwaway
//! state root with fast-policy run records.

pub mod slurm;
pub mod state;

pub use slurm::{FakeSlurmClient, SubmitRecord};
pub use state::TestState;
