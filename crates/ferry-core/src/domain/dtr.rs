//! Data transfer requests (DTRs).
//!
//! One DTR copies one file between the job's session directory and a remote
//! locator. The Generator creates it, the transfer scheduler owns its
//! execution state, and it comes back to the Generator exactly once in a
//! terminal status.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DtrError;
use super::ids::{DtrId, JobId};
use super::job::Owner;

/// Staging direction. Also used as the DTR sub-share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }

    fn stats_tag(self) -> &'static str {
        match self {
            Direction::Download => "inputfile",
            Direction::Upload => "outputfile",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DtrStatus {
    Queued,
    Transferring,
    Cancelled,
    Done,
    Failed,
}

impl DtrStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DtrStatus::Cancelled | DtrStatus::Done | DtrStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: DtrId,
    pub job_id: JobId,

    pub source: String,
    pub destination: String,

    /// Session directory of the owning job; exactly one of source and
    /// destination lies inside it.
    pub session_dir: PathBuf,

    pub status: DtrStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DtrError>,

    pub transfer_share: String,
    pub priority: u8,
    pub tries_left: u32,
    pub cache_eligible: bool,
    pub force_overwrite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<PathBuf>,
    pub owner: Owner,

    /// File entry this DTR was built from.
    pub lfn: String,
    /// Side list the entry was expanded from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    #[serde(default)]
    pub bytes: Option<u64>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cache_hit: bool,
}

impl TransferRequest {
    /// Strip a `file://` prefix; any other locator is returned unchanged.
    pub fn local_path(locator: &str) -> &str {
        locator.strip_prefix("file://").unwrap_or(locator)
    }

    fn is_in_session(&self, locator: &str) -> bool {
        let path = Self::local_path(locator);
        path.starts_with('/') && Path::new(path).starts_with(&self.session_dir)
    }

    /// Direction, derived from which side is local.
    pub fn direction(&self) -> Direction {
        if self.is_in_session(&self.destination) {
            Direction::Download
        } else {
            Direction::Upload
        }
    }

    pub fn sub_share(&self) -> &'static str {
        self.direction().as_str()
    }

    /// The remote side of the transfer.
    pub fn remote(&self) -> &str {
        match self.direction() {
            Direction::Download => &self.source,
            Direction::Upload => &self.destination,
        }
    }

    /// The session-directory side of the transfer, as a path.
    pub fn local(&self) -> &Path {
        match self.direction() {
            Direction::Download => Path::new(Self::local_path(&self.destination)),
            Direction::Upload => Path::new(Self::local_path(&self.source)),
        }
    }

    /// One statistics line:
    /// `inputfile:url=...,size=...,starttime=...,endtime=...,fromcache=yes|no`.
    pub fn statistics_line(&self) -> String {
        let ts = |t: Option<DateTime<Utc>>| {
            t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default()
        };
        format!(
            "{}:url={},size={},starttime={},endtime={},fromcache={}",
            self.direction().stats_tag(),
            self.remote(),
            self.bytes.unwrap_or(0),
            ts(self.started),
            ts(self.finished),
            if self.cache_hit { "yes" } else { "no" },
        )
    }
}
