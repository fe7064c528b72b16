//! State - ジョブの状態
//!
//! # 状態遷移
//! - UNDEFINED → ACCEPTED → PREPARING → SUBMITTING → IN_BATCH_SYSTEM → FINISHING → FINISHED → DELETED
//! - IN_BATCH_SYSTEM → CANCELING → FINISHING（キャンセル）
//! - PREPARING → FINISHING（実行ステップなし）
//! - FINISHED → ACCEPTED / PREPARING / IN_BATCH_SYSTEM / FINISHING（rerun）

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Undefined,
    Accepted,
    Preparing,
    Submitting,
    InBatchSystem,
    Canceling,
    Finishing,
    Finished,
    Deleted,
}

impl JobState {
    pub const ALL: [JobState; 9] = [
        JobState::Undefined,
        JobState::Accepted,
        JobState::Preparing,
        JobState::Submitting,
        JobState::InBatchSystem,
        JobState::Canceling,
        JobState::Finishing,
        JobState::Finished,
        JobState::Deleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Undefined => "UNDEFINED",
            JobState::Accepted => "ACCEPTED",
            JobState::Preparing => "PREPARING",
            JobState::Submitting => "SUBMITTING",
            JobState::InBatchSystem => "IN_BATCH_SYSTEM",
            JobState::Canceling => "CANCELING",
            JobState::Finishing => "FINISHING",
            JobState::Finished => "FINISHED",
            JobState::Deleted => "DELETED",
        }
    }

    /// Position in `ALL`, used by per-state counters.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Staging states, where the Generator owns the job's transfers.
    pub fn is_staging(self) -> bool {
        matches!(self, JobState::Preparing | JobState::Finishing)
    }

    /// States that occupy a batch-system slot.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            JobState::Submitting | JobState::InBatchSystem | JobState::Canceling
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Deleted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::accepted("ACCEPTED", JobState::Accepted)]
    #[case::batch("IN_BATCH_SYSTEM", JobState::InBatchSystem)]
    #[case::lowercase("finishing", JobState::Finishing)]
    #[case::trailing_newline("DELETED\n", JobState::Deleted)]
    fn parses_state_names(#[case] text: &str, #[case] expected: JobState) {
        assert_eq!(text.parse::<JobState>().unwrap(), expected);
    }

    #[test]
    fn unknown_state_is_an_error() {
        assert!("RUNNING".parse::<JobState>().is_err());
    }

    #[test]
    fn index_matches_position_in_all() {
        for (i, state) in JobState::ALL.iter().enumerate() {
            assert_eq!(state.index(), i);
        }
    }

    #[test]
    fn serializes_as_screaming_snake_case() {
        let s = serde_json::to_string(&JobState::InBatchSystem).unwrap();
        assert_eq!(s, "\"IN_BATCH_SYSTEM\"");
    }
}
