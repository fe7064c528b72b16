//! JobStateMachine - ジョブの状態遷移を駆動する
//!
//! Jobs live in an arena keyed by id. One [`JobStateMachine::run_pass`]
//! walks every job, then walks the jobs left pending a second time with
//! fresh counters and quotas. Jobs leave the arena only after a walk is over.
//!
//! # 状態遷移
//! - UNDEFINED → ACCEPTED → PREPARING → SUBMITTING → IN_BATCH_SYSTEM → FINISHING → FINISHED → DELETED
//! - PREPARING → FINISHING（実行ファイルなし）
//! - IN_BATCH_SYSTEM → CANCELING → FINISHING（ユーザーキャンセル）
//! - PREPARING → ACCEPTED / FINISHING → IN_BATCH_SYSTEM（リトライ）
//! - FINISHED → ACCEPTED / PREPARING / IN_BATCH_SYSTEM / FINISHING（rerun）
//!
//! Any handler error is recorded on the job and funnelled into FINISHING
//! (or FINISHED) through [`JobStateMachine::route_failure`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Duration;

use crate::config::Config;
use crate::domain::{Direction, FileList, Job, JobId, JobLocal, JobState, StageError};
use crate::error::FerryError;
use crate::ports::{
    BatchStatus, BatchSystem, CacheReleaser, Clock, HookAction, HookRunner, JobStore, NoCache,
    NoHooks, Request,
};

use super::counters::SchedulerCounters;
use super::generator::{Generator, UploadStatus};
use super::retry::RetryPolicy;
use super::shares::{ShareQuotas, TransferShareAccountant};

pub const CANCELLED_BY_USER: &str = "cancelled by user request";
const UPLOAD_TIMEOUT: &str = "User file upload timed out";

/// Retention periods are clamped to a century.
const MAX_SECS: u64 = 100 * 365 * 24 * 3600;

fn secs(n: u64) -> Duration {
    Duration::seconds(n.min(MAX_SECS) as i64)
}

fn record_error(e: FerryError) -> StageError {
    StageError::fatal(format!("Failed to update job records: {e}"))
}

/// What happens to a job after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Keep,
    Drop,
}

type Handled = Result<Disposition, StageError>;

pub struct JobStateMachine {
    config: Arc<Config>,
    store: Arc<dyn JobStore>,
    generator: Arc<Generator>,
    batch: Arc<dyn BatchSystem>,
    cache: Arc<dyn CacheReleaser>,
    hooks: Arc<dyn HookRunner>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    accountant: TransferShareAccountant,

    jobs: BTreeMap<JobId, Job>,
    /// Jobs whose records can't be read. Not picked up again.
    ignored: HashSet<JobId>,
    counters: SchedulerCounters,
    quotas: ShareQuotas,
}

impl JobStateMachine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn JobStore>,
        generator: Arc<Generator>,
        batch: Arc<dyn BatchSystem>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config.staging),
            accountant: TransferShareAccountant::from_config(&config.limits, &config.shares),
            config,
            store,
            generator,
            batch,
            cache: Arc::new(NoCache),
            hooks: Arc::new(NoHooks),
            clock,
            jobs: BTreeMap::new(),
            ignored: HashSet::new(),
            counters: SchedulerCounters::default(),
            quotas: ShareQuotas::unlimited(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheReleaser>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn HookRunner>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn counters(&self) -> &SchedulerCounters {
        &self.counters
    }

    /// Pick up jobs that appeared in the store. Returns how many are new.
    pub fn scan(&mut self) -> Result<usize, FerryError> {
        let mut added = 0;
        for id in self.store.list_jobs()? {
            if self.jobs.contains_key(&id) || self.ignored.contains(&id) {
                continue;
            }
            tracing::debug!(job_id = %id, "job discovered");
            self.jobs.insert(id.clone(), Job::new(id));
            added += 1;
        }
        Ok(added)
    }

    /// One scheduling pass over every job, then over the ones left pending.
    pub fn run_pass(&mut self) {
        self.refresh_quotas();
        let ids: Vec<JobId> = self.jobs.keys().cloned().collect();
        self.process_all(&ids);

        // the first walk moved jobs between share buckets
        self.refresh_quotas();
        let pending: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| j.pending)
            .map(|j| j.id.clone())
            .collect();
        self.process_all(&pending);
    }

    fn refresh_quotas(&mut self) {
        self.counters = SchedulerCounters::recount(self.jobs.values(), self.clock.now());
        self.quotas = self.accountant.compute(&self.counters);
    }

    fn process_all(&mut self, ids: &[JobId]) {
        let mut removals = Vec::new();
        for id in ids {
            let Some(mut job) = self.jobs.remove(id) else {
                continue;
            };
            if self.process(&mut job) == Disposition::Drop {
                removals.push(id.clone());
            }
            self.jobs.insert(id.clone(), job);
        }
        for id in removals {
            if let Some(job) = self.jobs.remove(&id) {
                self.counters.remove(&job);
            }
        }
    }

    fn process(&mut self, job: &mut Job) -> Disposition {
        if self.check_cancel(job) {
            return Disposition::Keep;
        }
        let handled = match job.state {
            JobState::Undefined => self.on_undefined(job),
            JobState::Accepted => self.on_accepted(job),
            JobState::Preparing => self.on_preparing(job),
            JobState::Submitting => self.on_submitting(job),
            JobState::InBatchSystem => self.on_in_batch_system(job),
            JobState::Canceling => self.on_canceling(job),
            JobState::Finishing => self.on_finishing(job),
            JobState::Finished => Ok(self.on_finished(job)),
            JobState::Deleted => Ok(self.on_deleted(job)),
        };
        match handled {
            Ok(disposition) => disposition,
            Err(error) => {
                tracing::warn!(job_id = %job.id, state = %job.state, error = %error.message, "job failed");
                job.failures.push(error.message);
                self.route_failure(job);
                Disposition::Keep
            }
        }
    }

    // --- cancellation -----------------------------------------------------

    /// True if the job was cancelled during this call.
    fn check_cancel(&mut self, job: &mut Job) -> bool {
        if matches!(
            job.state,
            JobState::Undefined
                | JobState::Canceling
                | JobState::Finishing
                | JobState::Finished
                | JobState::Deleted
        ) {
            return false;
        }
        if !self.take_request(job, Request::Cancel) {
            return false;
        }
        tracing::info!(job_id = %job.id, state = %job.state, "cancellation requested");
        self.generator.cancel_job(&job.id);
        job.failures.push(CANCELLED_BY_USER.to_string());

        let target = match job.state {
            JobState::InBatchSystem => JobState::Canceling,
            JobState::Accepted | JobState::Preparing | JobState::Submitting => JobState::Finishing,
            _ => JobState::Finished,
        };
        job.retries_left = 0;
        let result = self.mark_failed(job).and_then(|()| match target {
            JobState::Finished => self.finish(job),
            other => self.move_to(job, other),
        });
        if let Err(e) = result {
            self.give_up(job, e);
        }
        true
    }

    // --- state handlers ---------------------------------------------------

    fn on_undefined(&mut self, job: &mut Job) -> Handled {
        let max_jobs = self.config.limits.max_jobs;
        if max_jobs != 0 && self.counters.held() >= max_jobs {
            self.set_pending(job, true);
            return Ok(Disposition::Keep);
        }

        let state = match self.store.read_state(&job.id) {
            Ok(Some(JobState::Undefined)) | Ok(None) => {
                tracing::debug!(job_id = %job.id, "job has no state yet");
                return Ok(Disposition::Drop);
            }
            Ok(Some(state)) => state,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "can't read job state, ignoring job");
                self.ignored.insert(job.id.clone());
                return Ok(Disposition::Drop);
            }
        };
        if state == JobState::Accepted {
            self.accept(job)
        } else {
            self.recover(job, state)
        }
    }

    /// Freshly submitted job: snapshot its local description.
    fn accept(&mut self, job: &mut Job) -> Handled {
        let local = match self.store.read_local(&job.id).map_err(record_error)? {
            Some(local) => local,
            None => {
                let desc = self.store.read_description(&job.id).map_err(|e| {
                    StageError::fatal(format!("Failed reading job description: {e}"))
                })?;
                let share = self.config.shares.share_for(&desc.owner);
                let local =
                    JobLocal::from_description(&desc, share, self.config.retention.max_reruns);
                self.store
                    .write_local(&job.id, &local)
                    .map_err(record_error)?;
                local
            }
        };
        tracing::info!(
            job_id = %job.id,
            share = %local.transfer_share,
            priority = local.priority,
            "job accepted"
        );
        job.local = Some(local);
        self.move_to(job, JobState::Accepted)?;
        Ok(Disposition::Keep)
    }

    /// Job found further along, after a restart.
    fn recover(&mut self, job: &mut Job, state: JobState) -> Handled {
        let local = self.store.read_local(&job.id).unwrap_or_else(|e| {
            tracing::warn!(job_id = %job.id, error = %e, "can't read job local description");
            None
        });
        match self.store.read_failed(&job.id) {
            Ok(Some(text)) => {
                job.failures = text
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .collect();
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(job_id = %job.id, error = %e, "can't read failure marker"),
        }
        job.keep_until = local.as_ref().and_then(|l| l.cleanup_time);
        job.local = local;

        self.counters.remove(job);
        job.state = state;
        job.pending = false;
        job.stage_started = Some(self.clock.now());
        job.staging_submitted = false;
        if state.is_staging() {
            job.retries_left = self.retry.max_retries();
        }
        self.counters.add(job);
        tracing::info!(job_id = %job.id, state = %state, "job recovered");

        if job.local.is_none() && !state.is_terminal() {
            return Err(StageError::fatal("Job local description is missing"));
        }
        if state.is_staging() {
            self.start_staging(job);
        }
        Ok(Disposition::Keep)
    }

    fn on_accepted(&mut self, job: &mut Job) -> Handled {
        let now = self.clock.now();
        if let Some(start) = job.local.as_ref().and_then(|l| l.start_time)
            && now < start
        {
            return Ok(Disposition::Keep);
        }
        if job.next_retry.is_some_and(|t| now < t) {
            return Ok(Disposition::Keep);
        }
        if !self.admits(job, Direction::Download) {
            self.set_pending(job, true);
            return Ok(Disposition::Keep);
        }
        self.move_to(job, JobState::Preparing)?;
        job.next_retry = None;
        self.start_staging(job);
        Ok(Disposition::Keep)
    }

    fn on_preparing(&mut self, job: &mut Job) -> Handled {
        if !self.start_staging(job) || !self.generator.query_job_finished(job) {
            return Ok(Disposition::Keep);
        }
        if let Some(error) = job.take_stage_error() {
            return self.stage_failed(job, error, JobState::Accepted);
        }

        if job.local.as_ref().is_some_and(|l| l.uploads > 0) {
            match self.generator.check_user_uploadable_files(job) {
                UploadStatus::Ok => {}
                UploadStatus::StillWaiting => {
                    let timeout = secs(self.config.staging.user_upload_timeout_secs);
                    if job
                        .stage_started
                        .is_some_and(|t| self.clock.now() >= t + timeout)
                    {
                        return Err(StageError::fatal(UPLOAD_TIMEOUT));
                    }
                    return Ok(Disposition::Keep);
                }
                UploadStatus::Failed(msg) => return Err(StageError::fatal(msg)),
            }
        }

        if !job.has_executable() {
            job.retries_left = 0;
            self.move_to(job, JobState::Finishing)?;
            self.start_staging(job);
            return Ok(Disposition::Keep);
        }
        let max_running = self.config.limits.max_jobs_running;
        if max_running != 0 && self.counters.running() >= max_running {
            self.set_pending(job, true);
            return Ok(Disposition::Keep);
        }
        job.retries_left = 0;
        self.move_to(job, JobState::Submitting)?;
        Ok(Disposition::Keep)
    }

    fn on_submitting(&mut self, job: &mut Job) -> Handled {
        let batch_id = self.batch.submit(job).map_err(|e| {
            StageError::fatal(format!("Job submission to batch system failed: {e}"))
        })?;
        tracing::info!(job_id = %job.id, batch_id = %batch_id, "submitted to batch system");
        if let Some(local) = job.local.as_mut() {
            local.batch_id = Some(batch_id);
            self.store
                .write_local(&job.id, local)
                .map_err(record_error)?;
        }
        self.move_to(job, JobState::InBatchSystem)?;
        Ok(Disposition::Keep)
    }

    fn on_in_batch_system(&mut self, job: &mut Job) -> Handled {
        if job.next_retry.is_some_and(|t| self.clock.now() < t) {
            return Ok(Disposition::Keep);
        }
        // pending jobs already finished in the batch system
        if !job.pending {
            match self.poll_batch(job)? {
                BatchStatus::Running => return Ok(Disposition::Keep),
                BatchStatus::Done { exit_code: 0 } => {}
                BatchStatus::Done { exit_code } => {
                    return Err(StageError::fatal(format!(
                        "Job finished with exit code {exit_code}"
                    )));
                }
                BatchStatus::Failed(msg) => {
                    return Err(StageError::fatal(format!(
                        "Job failed in batch system: {msg}"
                    )));
                }
            }
        }
        if !self.admits(job, Direction::Upload) {
            self.set_pending(job, true);
            return Ok(Disposition::Keep);
        }
        self.move_to(job, JobState::Finishing)?;
        job.next_retry = None;
        self.start_staging(job);
        Ok(Disposition::Keep)
    }

    fn on_canceling(&mut self, job: &mut Job) -> Handled {
        if !job.cancel_sent {
            self.batch.cancel(job).map_err(|e| {
                StageError::fatal(format!("Failed to cancel job in batch system: {e}"))
            })?;
            job.cancel_sent = true;
        }
        if self.poll_batch(job)? == BatchStatus::Running {
            return Ok(Disposition::Keep);
        }
        self.move_to(job, JobState::Finishing)?;
        self.start_staging(job);
        Ok(Disposition::Keep)
    }

    fn on_finishing(&mut self, job: &mut Job) -> Handled {
        if job.next_retry.is_some_and(|t| self.clock.now() < t) {
            return Ok(Disposition::Keep);
        }
        if !self.start_staging(job) || !self.generator.query_job_finished(job) {
            return Ok(Disposition::Keep);
        }
        if let Some(error) = job.take_stage_error() {
            if job.local.as_ref().is_some_and(|l| l.failed_state.is_some()) {
                // already failed once, no second round of uploads
                self.route_failure(job);
                return Ok(Disposition::Keep);
            }
            let retry_state = if job.has_executable() {
                JobState::InBatchSystem
            } else {
                JobState::Finishing
            };
            return self.stage_failed(job, error, retry_state);
        }
        job.next_retry = None;
        self.finish(job)?;
        Ok(Disposition::Keep)
    }

    fn on_finished(&mut self, job: &mut Job) -> Disposition {
        if self.take_request(job, Request::Clean) {
            return self.purge(job);
        }
        if self.take_request(job, Request::Rerun) {
            match self.rerun(job) {
                Ok(()) => return Disposition::Keep,
                Err(reason) => {
                    tracing::warn!(job_id = %job.id, reason = %reason, "rerun refused");
                }
            }
        }

        let now = self.clock.now();
        let keep_finished = secs(self.config.retention.keep_finished_secs);
        let keep_until = *job.keep_until.get_or_insert_with(|| now + keep_finished);
        if now < keep_until {
            return Disposition::Keep;
        }
        if self.config.retention.purge_finished {
            return self.purge(job);
        }
        if let Err(e) = self.store.purge_to_trace(&job.id) {
            tracing::warn!(job_id = %job.id, error = %e, "can't remove job records");
            return Disposition::Keep;
        }
        job.local = None;
        if let Err(e) = self.move_to(job, JobState::Deleted) {
            tracing::warn!(job_id = %job.id, error = %e.message, "moving to DELETED");
        }
        job.keep_until = Some(now + secs(self.config.retention.keep_deleted_secs));
        Disposition::Keep
    }

    fn on_deleted(&mut self, job: &mut Job) -> Disposition {
        if self.take_request(job, Request::Clean) {
            return self.purge(job);
        }
        let now = self.clock.now();
        let keep_deleted = secs(self.config.retention.keep_deleted_secs);
        let keep_until = *job.keep_until.get_or_insert_with(|| now + keep_deleted);
        if now < keep_until {
            return Disposition::Keep;
        }
        self.purge(job)
    }

    // --- retries and failures ---------------------------------------------

    /// A staging stage came back with `error`. Retry through `retry_state`
    /// after a back-off, or route the failure once the budget is spent.
    fn stage_failed(&mut self, job: &mut Job, error: StageError, retry_state: JobState) -> Handled {
        let left = job.retries_left.saturating_sub(1);
        job.retries_left = left;
        if !error.retryable || left == 0 {
            tracing::warn!(
                job_id = %job.id,
                error = %error.message,
                retryable = error.retryable,
                "staging failed"
            );
            self.route_failure(job);
            return Ok(Disposition::Keep);
        }

        let next = self.clock.now() + self.retry.backoff(left);
        tracing::warn!(
            job_id = %job.id,
            error = %error.message,
            retries_left = left,
            next_retry = %next,
            "staging failed, will retry"
        );
        // a retried stage does not fail the job
        job.failures.pop();
        job.next_retry = Some(next);
        self.move_to(job, retry_state)?;
        Ok(Disposition::Keep)
    }

    /// Persist the failure, then send the job on to FINISHING (or FINISHED
    /// when it is already there).
    fn route_failure(&mut self, job: &mut Job) {
        let result = self.mark_failed(job).and_then(|()| {
            if matches!(
                job.state,
                JobState::Finishing | JobState::Finished | JobState::Deleted
            ) {
                self.finish(job)
            } else {
                job.retries_left = 0;
                let moved = self.move_to(job, JobState::Finishing);
                job.next_retry = None;
                moved
            }
        });
        if let Err(e) = result {
            self.give_up(job, e);
        }
    }

    fn mark_failed(&mut self, job: &mut Job) -> Result<(), StageError> {
        let id = job.id.clone();
        self.store
            .write_failed(&id, &job.failure_text())
            .map_err(record_error)?;

        // only preserved and user-downloadable outputs survive a failure
        let mut outputs = self
            .store
            .read_list(&id, FileList::Output)
            .map_err(record_error)?;
        outputs.retain(|e| e.preserve || !e.is_remote());
        self.store
            .write_list(&id, FileList::Output, &outputs)
            .map_err(record_error)?;

        if let Some(local) = job.local.as_mut() {
            local.failed_state.get_or_insert(job.state);
            local.uploads = 0;
            self.store.write_local(&id, local).map_err(record_error)?;
        }
        Ok(())
    }

    /// Failure handling itself failed: force FINISHED, once.
    fn give_up(&mut self, job: &mut Job, error: StageError) {
        tracing::error!(
            job_id = %job.id,
            error = %error.message,
            "failure handling failed, forcing FINISHED"
        );
        job.failures.push(error.message);
        if let Err(e) = self.store.write_state(&job.id, JobState::Finished) {
            tracing::error!(job_id = %job.id, error = %e, "can't record FINISHED");
        }
        if let Err(e) = self.store.write_failed(&job.id, &job.failure_text()) {
            tracing::error!(job_id = %job.id, error = %e, "can't record failure");
        }
        self.counters.remove(job);
        job.state = JobState::Finished;
        job.pending = false;
        job.keep_until =
            Some(self.clock.now() + secs(self.config.retention.keep_finished_secs));
        self.counters.add(job);
    }

    fn finish(&mut self, job: &mut Job) -> Result<(), StageError> {
        if let Some(local) = &job.local
            && let Err(e) = self.cache.release(&job.id, &local.owner)
        {
            tracing::warn!(job_id = %job.id, error = %e, "can't release cache");
        }
        self.move_to(job, JobState::Finished)?;

        let keep_until = self.clock.now() + secs(self.config.retention.keep_finished_secs);
        job.keep_until = Some(keep_until);
        if let Some(local) = job.local.as_mut() {
            local.cleanup_time = Some(keep_until);
            if let Err(e) = self.store.write_local(&job.id, local) {
                tracing::warn!(job_id = %job.id, error = %e, "can't record cleanup time");
            }
        }
        if job.is_failed() {
            tracing::info!(job_id = %job.id, failure = %job.failure_text(), "job finished with failure");
        } else {
            tracing::info!(job_id = %job.id, "job finished");
        }
        Ok(())
    }

    /// Loop a failed FINISHED job back to where it failed.
    fn rerun(&mut self, job: &mut Job) -> Result<(), String> {
        let Some(mut local) = job.local.clone() else {
            return Err("job records are gone".to_string());
        };
        let Some(failed_state) = local.failed_state.filter(|_| job.is_failed()) else {
            return Err("job did not fail".to_string());
        };
        if local.reruns_left == 0 {
            return Err("no reruns left".to_string());
        }
        let target = match failed_state {
            JobState::Accepted | JobState::Preparing => JobState::Accepted,
            JobState::Submitting | JobState::InBatchSystem | JobState::Canceling => {
                JobState::Preparing
            }
            JobState::Finishing if job.has_executable() => JobState::InBatchSystem,
            JobState::Finishing => JobState::Finishing,
            other => return Err(format!("can't rerun a job that failed in {other}")),
        };

        let id = job.id.clone();
        let desc = self
            .store
            .read_description(&id)
            .map_err(|e| e.to_string())?;
        if matches!(target, JobState::Accepted | JobState::Preparing) {
            self.store
                .write_list(&id, FileList::Input, &desc.inputs)
                .and_then(|()| self.store.write_list(&id, FileList::Output, &desc.outputs))
                .and_then(|()| self.store.write_list(&id, FileList::Uploaded, &[]))
                .map_err(|e| e.to_string())?;
            local.uploads = desc.inputs.iter().filter(|e| !e.is_remote()).count() as u32;
        } else {
            let uploaded = self
                .store
                .read_list(&id, FileList::Uploaded)
                .map_err(|e| e.to_string())?;
            let done: HashSet<&str> = uploaded.iter().map(|e| e.key()).collect();
            let outputs: Vec<_> = desc
                .outputs
                .iter()
                .filter(|e| !e.is_remote() || !done.contains(e.key()))
                .cloned()
                .collect();
            self.store
                .write_list(&id, FileList::Output, &outputs)
                .map_err(|e| e.to_string())?;
            local.uploads = 0;
        }

        local.failed_state = None;
        local.reruns_left -= 1;
        local.cleanup_time = None;
        self.store
            .write_local(&id, &local)
            .and_then(|()| self.store.clear_failed(&id))
            .map_err(|e| e.to_string())?;

        tracing::info!(job_id = %id, target = %target, reruns_left = local.reruns_left, "rerunning job");
        job.local = Some(local);
        job.failures.clear();
        job.stage_error = None;
        job.keep_until = None;
        job.next_retry = None;
        job.retries_left = 0;
        if let Err(e) = self.move_to(job, target) {
            job.failures.push(e.message);
            self.route_failure(job);
        }
        Ok(())
    }

    // --- helpers ----------------------------------------------------------

    fn move_to(&mut self, job: &mut Job, state: JobState) -> Result<(), StageError> {
        self.store
            .write_state(&job.id, state)
            .map_err(record_error)?;
        let from = job.state;
        self.counters.remove(job);
        job.state = state;
        job.pending = false;
        job.stage_started = Some(self.clock.now());
        job.staging_submitted = false;
        job.cancel_sent = false;
        if state.is_staging() && job.retries_left == 0 {
            job.retries_left = self.retry.max_retries();
        }
        self.counters.add(job);
        tracing::info!(job_id = %job.id, from = %from, to = %state, "state changed");
        self.run_hook(job)
    }

    fn run_hook(&self, job: &Job) -> Result<(), StageError> {
        match self.hooks.run_hook(job.state, job) {
            HookAction::Pass => Ok(()),
            HookAction::Log => {
                tracing::info!(job_id = %job.id, state = %job.state, "hook failed, ignored");
                Ok(())
            }
            HookAction::Fail => Err(StageError::fatal(format!(
                "Plugin at state {} failed",
                job.state
            ))),
        }
    }

    fn set_pending(&mut self, job: &mut Job, pending: bool) {
        if job.pending != pending {
            self.counters.remove(job);
            job.pending = pending;
            self.counters.add(job);
        }
    }

    /// Processing gates of one staging direction: per-owner cap, global cap
    /// with emergency headroom, share quota.
    fn admits(&self, job: &Job, direction: Direction) -> bool {
        let limits = &self.config.limits;
        let counters = &self.counters;
        if limits.max_processing_per_owner != 0
            && counters.owner_processing(job.owner_identity()) >= limits.max_processing_per_owner
        {
            return false;
        }
        if limits.max_processing != 0 {
            let (this, other) = match direction {
                Direction::Download => (
                    counters.in_state(JobState::Preparing),
                    counters.in_state(JobState::Finishing),
                ),
                Direction::Upload => (
                    counters.in_state(JobState::Finishing),
                    counters.in_state(JobState::Preparing),
                ),
            };
            let normal = counters.processing() < limits.max_processing;
            let emergency =
                other >= limits.max_processing && this < limits.max_processing_emergency;
            if !normal && !emergency {
                return false;
            }
        }
        let share = job.transfer_share();
        let (limit, current) = match direction {
            Direction::Download => (
                self.quotas.preparing_limit(share),
                counters.preparing_in_share(share),
            ),
            Direction::Upload => (
                self.quotas.finishing_limit(share),
                counters.finishing_in_share(share),
            ),
        };
        limit.is_none_or(|l| current < l)
    }

    /// Hand the job to the Generator for its current stage, once whatever
    /// is left of the previous stage has drained. False while waiting.
    fn start_staging(&mut self, job: &mut Job) -> bool {
        if job.staging_submitted {
            return true;
        }
        if !self.generator.query_job_finished(job) {
            return false;
        }
        // an interrupted stage's outcome is already in the failure list
        job.stage_error = None;
        if !self.generator.receive_job(job) {
            return false;
        }
        job.staging_submitted = true;
        true
    }

    fn poll_batch(&self, job: &Job) -> Result<BatchStatus, StageError> {
        self.batch
            .poll(job)
            .map_err(|e| StageError::fatal(format!("Batch system query failed: {e}")))
    }

    fn take_request(&self, job: &Job, request: Request) -> bool {
        match self.store.take_request(&job.id, request) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(job_id = %job.id, request = request.suffix(), error = %e, "can't read request");
                false
            }
        }
    }

    fn purge(&self, job: &Job) -> Disposition {
        match self.store.purge(&job.id) {
            Ok(()) => {
                tracing::info!(job_id = %job.id, "job removed");
                Disposition::Drop
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "can't remove job");
                Disposition::Keep
            }
        }
    }
}

#[cfg(test)]
mod tests;
