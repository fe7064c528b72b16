//! Status - ジョブ状態の集計
//!
//! Read-only views over the job records, used by the `status` command and by
//! the service's per-pass summary line.

use serde::{Deserialize, Serialize};

use crate::domain::{Job, JobId, JobState};
use crate::error::FerryError;
use crate::ports::JobStore;

/// Number of jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub accepted: usize,
    pub preparing: usize,
    pub submitting: usize,
    pub in_batch_system: usize,
    pub canceling: usize,
    pub finishing: usize,
    pub finished: usize,
    pub deleted: usize,
    /// Jobs held back by a limit, whatever their state.
    pub pending: usize,
    /// Jobs carrying a failure.
    pub failed: usize,
}

impl JobCounts {
    /// Counts over the jobs a state machine holds in memory.
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            counts.bump(job.state);
            counts.pending += usize::from(job.pending);
            counts.failed += usize::from(job.is_failed());
        }
        counts
    }

    /// Counts over persisted records.
    pub fn from_statuses(statuses: &[JobStatus]) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.bump(status.state);
            counts.failed += usize::from(status.failure.is_some());
        }
        counts
    }

    fn bump(&mut self, state: JobState) {
        let slot = match state {
            JobState::Accepted => &mut self.accepted,
            JobState::Preparing => &mut self.preparing,
            JobState::Submitting => &mut self.submitting,
            JobState::InBatchSystem => &mut self.in_batch_system,
            JobState::Canceling => &mut self.canceling,
            JobState::Finishing => &mut self.finishing,
            JobState::Finished => &mut self.finished,
            JobState::Deleted => &mut self.deleted,
            JobState::Undefined => return,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.accepted
            + self.preparing
            + self.submitting
            + self.in_batch_system
            + self.canceling
            + self.finishing
            + self.finished
            + self.deleted
    }
}

/// One job as seen in the control directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Full report printed by `ferry status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub counts: JobCounts,
    pub jobs: Vec<JobStatus>,
}

impl StatusReport {
    /// Read every job that has a state. Jobs whose records can't be read
    /// are skipped with a warning.
    pub fn collect(store: &dyn JobStore) -> Result<Self, FerryError> {
        let mut jobs = Vec::new();
        for id in store.list_jobs()? {
            match job_status(store, &id) {
                Ok(status) => jobs.push(status),
                Err(FerryError::JobNotFound(_)) => {}
                Err(e) => tracing::warn!(job_id = %id, error = %e, "skipping unreadable job"),
            }
        }
        Ok(Self {
            counts: JobCounts::from_statuses(&jobs),
            jobs,
        })
    }
}

/// State and failure text of one job.
pub fn job_status(store: &dyn JobStore, id: &JobId) -> Result<JobStatus, FerryError> {
    let state = store
        .read_state(id)?
        .ok_or_else(|| FerryError::JobNotFound(id.clone()))?;
    let failure = store
        .read_failed(id)?
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());
    Ok(JobStatus {
        id: id.clone(),
        state,
        failure,
    })
}
