//! JobStore port - ジョブ記録の永続化
//!
//! Everything the state machine and the Generator know about a job outside of
//! memory lives here, keyed by job id. The store is the source of truth after
//! a restart.

use crate::domain::{FileEntry, FileList, JobDescription, JobId, JobLocal, JobState};
use crate::error::FerryError;

/// Requests placed by users (or the CLI) and consumed by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    Cancel,
    Rerun,
    Clean,
}

impl Request {
    pub fn suffix(self) -> &'static str {
        match self {
            Request::Cancel => "cancel",
            Request::Rerun => "rerun",
            Request::Clean => "clean",
        }
    }
}

pub trait JobStore: Send + Sync {
    /// Ids of every job with a description or a state record.
    fn list_jobs(&self) -> Result<Vec<JobId>, FerryError>;

    fn write_description(&self, id: &JobId, desc: &JobDescription) -> Result<(), FerryError>;
    fn read_description(&self, id: &JobId) -> Result<JobDescription, FerryError>;

    /// `None` when no state was ever written.
    fn read_state(&self, id: &JobId) -> Result<Option<JobState>, FerryError>;
    fn write_state(&self, id: &JobId, state: JobState) -> Result<(), FerryError>;

    fn read_local(&self, id: &JobId) -> Result<Option<JobLocal>, FerryError>;
    fn write_local(&self, id: &JobId, local: &JobLocal) -> Result<(), FerryError>;

    /// A missing list reads as empty.
    fn read_list(&self, id: &JobId, list: FileList) -> Result<Vec<FileEntry>, FerryError>;
    fn write_list(&self, id: &JobId, list: FileList, entries: &[FileEntry])
    -> Result<(), FerryError>;

    fn read_failed(&self, id: &JobId) -> Result<Option<String>, FerryError>;
    fn write_failed(&self, id: &JobId, text: &str) -> Result<(), FerryError>;
    fn clear_failed(&self, id: &JobId) -> Result<(), FerryError>;

    fn place_request(&self, id: &JobId, request: Request) -> Result<(), FerryError>;
    fn has_request(&self, id: &JobId, request: Request) -> Result<bool, FerryError>;
    /// Remove the marker; true if it was there.
    fn take_request(&self, id: &JobId, request: Request) -> Result<bool, FerryError>;

    fn append_statistics(&self, id: &JobId, line: &str) -> Result<(), FerryError>;

    /// Drop every record of the job except the state and the failure
    /// marker.
    fn purge_to_trace(&self, id: &JobId) -> Result<(), FerryError>;
    /// Drop every record of the job.
    fn purge(&self, id: &JobId) -> Result<(), FerryError>;
}
