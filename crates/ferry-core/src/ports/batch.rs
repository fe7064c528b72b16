//! BatchSystem port - the compute step between the two staging stages.

use crate::domain::Job;
use crate::error::FerryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatus {
    Running,
    Done { exit_code: i32 },
    /// The batch system lost or rejected the job.
    Failed(String),
}

pub trait BatchSystem: Send + Sync {
    /// Start the job's executable; returns the batch-side id.
    fn submit(&self, job: &Job) -> Result<String, FerryError>;

    /// Ask the batch system to stop the job. Completion is observed by `poll`.
    fn cancel(&self, job: &Job) -> Result<(), FerryError>;

    fn poll(&self, job: &Job) -> Result<BatchStatus, FerryError>;
}
