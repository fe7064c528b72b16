//! HookRunner port - 状態遷移時の外部フック

use serde::{Deserialize, Serialize};

use crate::domain::{Job, JobState};

/// What the state machine does with a hook outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookAction {
    /// Fail the job's current stage.
    Fail,
    /// Carry on.
    Pass,
    /// Carry on, but log the outcome.
    Log,
}

impl HookAction {
    pub fn pass() -> Self {
        HookAction::Pass
    }

    pub fn fail() -> Self {
        HookAction::Fail
    }
}

pub trait HookRunner: Send + Sync {
    /// Run the hook registered for `state`, if any. No hook means `Pass`.
    fn run_hook(&self, state: JobState, job: &Job) -> HookAction;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl HookRunner for NoHooks {
    fn run_hook(&self, _state: JobState, _job: &Job) -> HookAction {
        HookAction::Pass
    }
}
