//! Job records: description, local snapshot and in-memory job.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StageError;
use super::files::FileEntry;
use super::ids::JobId;
use super::state::JobState;

/// Share key used when the configured owner attribute is missing.
pub const DEFAULT_SHARE: &str = "_default";

/// Owner of a job: local account plus credential identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
    /// Distinguished name of the credential.
    pub identity: String,
    /// Virtual organisation from the credential, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vo: Option<String>,
}

fn default_priority() -> u8 {
    50
}

/// What the submitting side writes into the control directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    pub owner: Owner,
    pub session_dir: PathBuf,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Earliest time the job may start staging.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Default credential for transfers.
    #[serde(default)]
    pub credential: Option<PathBuf>,
    #[serde(default)]
    pub inputs: Vec<FileEntry>,
    #[serde(default)]
    pub outputs: Vec<FileEntry>,
}

/// Local snapshot of a job, persisted when the job is accepted and updated
/// as it moves on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLocal {
    pub owner: Owner,
    pub transfer_share: String,
    pub priority: u8,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub credential: Option<PathBuf>,
    pub session_dir: PathBuf,

    /// State the job failed in, needed to rerun it.
    #[serde(default)]
    pub failed_state: Option<JobState>,
    #[serde(default)]
    pub reruns_left: u32,
    /// User-uploadable input files still expected.
    #[serde(default)]
    pub uploads: u32,
    /// Identifier handed out by the batch system.
    #[serde(default)]
    pub batch_id: Option<String>,
    /// Retention deadline once the job is FINISHED / DELETED.
    #[serde(default)]
    pub cleanup_time: Option<DateTime<Utc>>,
}

impl JobLocal {
    pub fn from_description(desc: &JobDescription, transfer_share: String, reruns: u32) -> Self {
        Self {
            owner: desc.owner.clone(),
            transfer_share,
            priority: desc.priority,
            executable: desc.executable.clone().filter(|e| !e.trim().is_empty()),
            start_time: desc.start_time,
            credential: desc.credential.clone(),
            session_dir: desc.session_dir.clone(),
            failed_state: None,
            reruns_left: reruns,
            uploads: desc.inputs.iter().filter(|f| !f.is_remote()).count() as u32,
            batch_id: None,
            cleanup_time: None,
        }
    }
}

/// A job under management.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    /// Waiting for a free slot; not counted by concurrency limits.
    pub pending: bool,
    pub local: Option<JobLocal>,

    pub retries_left: u32,
    pub next_retry: Option<DateTime<Utc>>,

    /// When the current stage was entered.
    pub stage_started: Option<DateTime<Utc>>,
    /// The current staging stage was handed to the Generator.
    pub staging_submitted: bool,
    /// CANCELING already asked the batch system.
    pub cancel_sent: bool,

    /// Every failure message ever recorded, oldest first.
    pub failures: Vec<String>,
    /// Failure of the current stage, consumed by the state handler.
    pub stage_error: Option<StageError>,

    pub keep_until: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            state: JobState::Undefined,
            pending: false,
            local: None,
            retries_left: 0,
            next_retry: None,
            stage_started: None,
            staging_submitted: false,
            cancel_sent: false,
            failures: Vec::new(),
            stage_error: None,
            keep_until: None,
        }
    }

    pub fn record_failure(&mut self, error: StageError) {
        self.failures.push(error.message.clone());
        self.stage_error = Some(error);
    }

    pub fn take_stage_error(&mut self) -> Option<StageError> {
        self.stage_error.take()
    }

    pub fn is_failed(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failure_text(&self) -> String {
        self.failures.join("\n")
    }

    pub fn transfer_share(&self) -> &str {
        self.local
            .as_ref()
            .map(|l| l.transfer_share.as_str())
            .unwrap_or(DEFAULT_SHARE)
    }

    pub fn owner_identity(&self) -> &str {
        self.local
            .as_ref()
            .map(|l| l.owner.identity.as_str())
            .unwrap_or_default()
    }

    pub fn priority(&self) -> u8 {
        self.local.as_ref().map(|l| l.priority).unwrap_or(50)
    }

    pub fn has_executable(&self) -> bool {
        self.local
            .as_ref()
            .is_some_and(|l| l.executable.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> JobDescription {
        serde_json::from_str(
            r#"{
                "owner": {"uid": 1000, "gid": 1000, "identity": "/O=Grid/CN=Alice"},
                "session_dir": "/sessions/j1",
                "executable": "  ",
                "inputs": [
                    {"lfn": "/in1", "locator": "gsiftp://se/in1"},
                    {"lfn": "/user.dat"}
                ]
            }"#,
        )
        .expect("deserialize")
    }

    #[test]
    fn description_defaults() {
        let desc = description();
        assert_eq!(desc.priority, 50);
        assert!(desc.outputs.is_empty());
        assert!(desc.start_time.is_none());
    }

    #[test]
    fn local_from_description_counts_user_uploads() {
        let local = JobLocal::from_description(&description(), "vo1".to_string(), 5);
        assert_eq!(local.uploads, 1);
        assert_eq!(local.reruns_left, 5);
        assert_eq!(local.transfer_share, "vo1");
        // blank executable means "no executable step"
        assert!(local.executable.is_none());
    }

    #[test]
    fn record_failure_accumulates() {
        let mut job = Job::new(JobId::new("j1"));
        assert!(!job.is_failed());
        job.record_failure(StageError::retryable("first"));
        job.record_failure(StageError::fatal("second"));
        assert_eq!(job.failure_text(), "first\nsecond");
        assert_eq!(job.take_stage_error().map(|e| e.retryable), Some(false));
        assert!(job.stage_error.is_none());
        assert!(job.is_failed());
    }

    #[test]
    fn job_without_local_uses_default_share() {
        let job = Job::new(JobId::new("j1"));
        assert_eq!(job.transfer_share(), DEFAULT_SHARE);
        assert!(!job.has_executable());
    }
}
