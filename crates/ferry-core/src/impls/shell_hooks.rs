//! ShellHooks - 状態遷移時に設定されたシェルコマンドを実行する
//!
//! The state machine calls hooks from its pass, which the service runs on a
//! blocking thread. Each hook is driven to completion on the runtime the
//! runner was created on.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::runtime::Handle;

use crate::config::HookConfig;
use crate::domain::{Job, JobId, JobState};
use crate::error::FerryError;
use crate::ports::{HookAction, HookRunner};

/// How a hook command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

pub struct ShellHooks {
    hooks: HashMap<JobState, HookConfig>,
    runtime: Handle,
}

impl ShellHooks {
    /// Has to be called from inside a tokio runtime; hooks run on it.
    pub fn new(hooks: &[HookConfig]) -> Result<Self, FerryError> {
        let runtime = Handle::try_current()
            .map_err(|e| FerryError::Other(format!("hook runner needs a tokio runtime: {e}")))?;
        Ok(Self {
            hooks: hooks.iter().map(|h| (h.state, h.clone())).collect(),
            runtime,
        })
    }

    async fn run(
        hook: &HookConfig,
        job_id: &JobId,
        session_dir: Option<&Path>,
        state: JobState,
    ) -> Outcome {
        let command = hook
            .command
            .replace("%I", job_id.as_str())
            .replace("%S", state.as_str());
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = session_dir {
            cmd.current_dir(dir);
        }
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(job_id = %job_id, %command, error = %e, "can't start hook");
                return Outcome::Failure;
            }
        };

        let limit = Duration::from_secs(hook.timeout_secs);
        match tokio::time::timeout(limit, child.wait()).await {
            Ok(Ok(status)) if status.success() => Outcome::Success,
            Ok(Ok(status)) => {
                tracing::info!(job_id = %job_id, %command, code = ?status.code(), "hook failed");
                Outcome::Failure
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job_id, %command, error = %e, "can't wait for hook");
                Outcome::Failure
            }
            Err(_) => {
                tracing::warn!(job_id = %job_id, %command, timeout_secs = hook.timeout_secs, "hook timed out");
                if let Err(e) = child.kill().await {
                    tracing::debug!(job_id = %job_id, error = %e, "can't kill hook");
                }
                Outcome::Timeout
            }
        }
    }
}

impl HookRunner for ShellHooks {
    fn run_hook(&self, state: JobState, job: &Job) -> HookAction {
        let Some(hook) = self.hooks.get(&state) else {
            return HookAction::Pass;
        };
        let session_dir = job.local.as_ref().map(|l| l.session_dir.as_path());
        let outcome = self
            .runtime
            .block_on(Self::run(hook, &job.id, session_dir, state));
        match outcome {
            Outcome::Success => hook.on_success,
            Outcome::Failure => hook.on_failure,
            Outcome::Timeout => hook.on_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use rstest::rstest;

    fn hook(state: JobState, command: &str) -> HookConfig {
        HookConfig {
            state,
            command: command.to_string(),
            timeout_secs: 5,
            on_success: HookAction::Pass,
            on_failure: HookAction::Fail,
            on_timeout: HookAction::Log,
        }
    }

    /// Run the hook the way the service does, off the runtime's workers.
    async fn run_blocking(hooks: ShellHooks, state: JobState, id: &str) -> HookAction {
        let hooks = Arc::new(hooks);
        let job = Job::new(JobId::new(id));
        tokio::task::spawn_blocking(move || hooks.run_hook(state, &job))
            .await
            .unwrap()
    }

    #[rstest]
    #[case::success("true", HookAction::Pass)]
    #[case::failure("exit 1", HookAction::Fail)]
    #[case::missing_command("/nonexistent/hook", HookAction::Fail)]
    #[tokio::test(flavor = "multi_thread")]
    async fn outcome_maps_to_configured_action(
        #[case] command: &str,
        #[case] expected: HookAction,
    ) {
        let hooks = ShellHooks::new(&[hook(JobState::Finished, command)]).unwrap();
        assert_eq!(
            run_blocking(hooks, JobState::Finished, "j1").await,
            expected
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn state_without_hook_passes() {
        let hooks = ShellHooks::new(&[hook(JobState::Finished, "exit 1")]).unwrap();
        assert_eq!(
            run_blocking(hooks, JobState::Accepted, "j1").await,
            HookAction::Pass
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn placeholders_are_substituted() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("seen");
        let command = format!("echo %I %S > {}", out.display());
        let hooks = ShellHooks::new(&[hook(JobState::Preparing, &command)]).unwrap();

        assert_eq!(
            run_blocking(hooks, JobState::Preparing, "job-42").await,
            HookAction::Pass
        );
        assert_eq!(
            std::fs::read_to_string(out).unwrap(),
            "job-42 PREPARING\n"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_hook_times_out() {
        let mut slow = hook(JobState::Finishing, "sleep 10");
        slow.timeout_secs = 0;
        let hooks = ShellHooks::new(&[slow]).unwrap();

        let started = Instant::now();
        assert_eq!(
            run_blocking(hooks, JobState::Finishing, "j1").await,
            HookAction::Log
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn needs_a_runtime() {
        assert!(matches!(ShellHooks::new(&[]), Err(FerryError::Other(_))));
    }
}
