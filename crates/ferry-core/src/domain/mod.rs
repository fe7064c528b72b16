//! Domain model (ids, states, file lists, transfer requests, jobs).

pub mod dtr;
pub mod errors;
pub mod files;
pub mod ids;
pub mod job;
pub mod state;

pub use dtr::{Direction, DtrStatus, TransferRequest};
pub use errors::{DtrError, ErrorKind, StageError};
pub use files::{FileEntry, FileList, Locator, LocatorError};
pub use ids::{DtrId, JobId};
pub use job::{DEFAULT_SHARE, Job, JobDescription, JobLocal, Owner};
pub use state::JobState;
