//! Generator - ジョブのファイルリストから DTR を生成し、完了を集計する
//!
//! The state machine hands a job over when it enters PREPARING (download)
//! or FINISHING (upload). The Generator turns the job's file list into
//! transfer requests, submits them and, once the last one is back, records
//! the outcome of the stage. The state machine polls
//! [`Generator::query_job_finished`] to pick that outcome up.
//!
//! # ロック
//! - 受信キュー（jobs / cancellations / DTR completions）はそれぞれ別の Mutex
//! - active / finished / books も別々の Mutex
//! - 順序: jobs_received → active（処理側のみネスト）、finished と active はネストしない
//!
//! A job id stays in `active` for the whole time its stage is being worked
//! on. `finished` is written before the `active` entry goes away, so a
//! concurrent query never sees the job as neither active nor finished.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::domain::files::{read_list, write_list};
use crate::domain::{
    Direction, DtrError, DtrId, DtrStatus, FileEntry, FileList, Job, JobId, JobLocal, JobState,
    Locator, StageError, TransferRequest,
};
use crate::error::FerryError;
use crate::ports::{DtrReceiver, DtrSink, JobStore, TransferScheduler};

pub const CONFIG_ERROR: &str = "Internal configuration error in data staging";
pub const CANCELLED: &str = "Data staging was cancelled";
const STAGING_FAILED: &str = "Failed in data staging";

const CHUNK_SIZE: usize = 256 * 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn staging_failure(detail: impl std::fmt::Display) -> StageError {
    StageError::fatal(format!("{STAGING_FAILED}: {detail}"))
}

/// Result of checking user-uploadable input files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    Ok,
    StillWaiting,
    Failed(String),
}

struct QueuedJob {
    job: Job,
    direction: Direction,
}

/// Per-job bookkeeping of the stage in progress.
#[derive(Debug)]
struct StageBook {
    direction: Direction,
    session_dir: PathBuf,
    errors: Vec<DtrError>,
    /// Siblings were already asked to stop.
    cancel_sent: bool,
    user_cancelled: bool,
    /// Download destinations not (yet) completed.
    partial: HashSet<PathBuf>,
    /// Upload sources that made it.
    uploaded: Vec<PathBuf>,
    /// User-downloadable outputs, never deleted.
    keep: HashSet<PathBuf>,
    /// Dynamic output side lists.
    side_lists: Vec<PathBuf>,
}

impl StageBook {
    fn new(direction: Direction, session_dir: PathBuf) -> Self {
        Self {
            direction,
            session_dir,
            errors: Vec::new(),
            cancel_sent: false,
            user_cancelled: false,
            partial: HashSet::new(),
            uploaded: Vec::new(),
            keep: HashSet::new(),
            side_lists: Vec::new(),
        }
    }

    fn outcome(&self) -> Option<StageError> {
        if !self.errors.is_empty() {
            let detail = self
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            let retryable = self.errors.iter().all(|e| e.kind.is_retryable());
            return Some(StageError {
                message: format!("{STAGING_FAILED}: {detail}"),
                retryable,
            });
        }
        self.user_cancelled.then(|| StageError::fatal(CANCELLED))
    }
}

pub struct Generator {
    config: Arc<Config>,
    store: Arc<dyn JobStore>,
    scheduler: Arc<dyn TransferScheduler>,
    sink: DtrSink,

    jobs_received: Mutex<Vec<QueuedJob>>,
    cancelled: Mutex<Vec<JobId>>,
    completions: Mutex<DtrReceiver>,

    active: Mutex<HashMap<JobId, HashSet<DtrId>>>,
    books: Mutex<HashMap<JobId, StageBook>>,
    finished: Mutex<HashMap<JobId, Option<StageError>>>,

    /// Destinations that were mid-transfer when the previous run died.
    recovered: Mutex<HashSet<String>>,
    wake: Arc<Notify>,
}

impl Generator {
    /// `sink` and `completions` are the two ends of the channel the
    /// scheduler posts finished DTRs on.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn JobStore>,
        scheduler: Arc<dyn TransferScheduler>,
        sink: DtrSink,
        completions: DtrReceiver,
    ) -> Self {
        let recovered = match &config.transfer.dump_file {
            Some(path) => read_recovery_dump(path),
            None => HashSet::new(),
        };
        if !recovered.is_empty() {
            tracing::info!(
                count = recovered.len(),
                "transfers interrupted by previous shutdown will overwrite their destination"
            );
        }
        Self {
            config,
            store,
            scheduler,
            sink,
            jobs_received: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            completions: Mutex::new(completions),
            active: Mutex::new(HashMap::new()),
            books: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            recovered: Mutex::new(recovered),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Notified whenever a job's stage completes.
    pub fn wake(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Queue a job for staging. The direction follows from the job's state
    /// (PREPARING downloads, FINISHING uploads). Returns false if the job
    /// can't be taken.
    pub fn receive_job(&self, job: &Job) -> bool {
        let direction = match job.state {
            JobState::Preparing => Direction::Download,
            JobState::Finishing => Direction::Upload,
            other => {
                tracing::error!(job_id = %job.id, state = %other, "job is not in a staging state");
                return false;
            }
        };
        let mut queue = lock(&self.jobs_received);
        if queue.iter().any(|q| q.job.id == job.id) || lock(&self.active).contains_key(&job.id) {
            tracing::warn!(job_id = %job.id, "job is already being staged");
            return false;
        }
        tracing::debug!(job_id = %job.id, %direction, "job received");
        queue.push(QueuedJob {
            job: job.clone(),
            direction,
        });
        true
    }

    /// Called by the scheduler side with a DTR in a terminal status.
    pub fn receive_dtr(&self, dtr: TransferRequest) {
        self.sink.post(dtr);
    }

    /// Request cancellation of everything the job has in flight. Returns
    /// immediately; the outcome shows up through `query_job_finished`.
    pub fn cancel_job(&self, job_id: &JobId) {
        lock(&self.cancelled).push(job_id.clone());
    }

    /// False while the job waits in the queue or has DTRs in flight.
    /// Otherwise true, and the stage failure (if any) is attached to the job
    /// the first time only.
    pub fn query_job_finished(&self, job: &mut Job) -> bool {
        if lock(&self.jobs_received).iter().any(|q| q.job.id == job.id) {
            return false;
        }
        if lock(&self.active).contains_key(&job.id) {
            return false;
        }
        if let Some(Some(error)) = lock(&self.finished).remove(&job.id) {
            job.record_failure(error);
        }
        true
    }

    /// Check user-managed input files in the session directory. Satisfied
    /// entries are removed from the input list and `JobLocal::uploads`
    /// tracks how many are still expected.
    pub fn check_user_uploadable_files(&self, job: &mut Job) -> UploadStatus {
        let Some(local) = job.local.as_mut() else {
            return UploadStatus::Failed(CONFIG_ERROR.to_string());
        };
        let inputs = match self.store.read_list(&job.id, FileList::Input) {
            Ok(inputs) => inputs,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "can't read input list");
                return UploadStatus::Failed("Error reading list of input files".to_string());
            }
        };

        let mut remaining = Vec::with_capacity(inputs.len());
        let mut waiting = false;
        let mut failures = Vec::new();
        for entry in inputs {
            if entry.is_remote() {
                remaining.push(entry);
                continue;
            }
            match check_user_file(&local.session_dir, &entry) {
                UploadStatus::Ok => {
                    tracing::info!(job_id = %job.id, lfn = %entry.lfn, "user uploaded file");
                }
                UploadStatus::StillWaiting => {
                    waiting = true;
                    remaining.push(entry);
                }
                UploadStatus::Failed(msg) => {
                    failures.push(msg);
                    remaining.push(entry);
                }
            }
        }

        let uploads = remaining.iter().filter(|e| !e.is_remote()).count() as u32;
        if uploads != local.uploads {
            local.uploads = uploads;
            if let Err(e) = self.store.write_list(&job.id, FileList::Input, &remaining) {
                tracing::error!(job_id = %job.id, error = %e, "can't rewrite input list");
                return UploadStatus::Failed("Error writing list of input files".to_string());
            }
        }

        if !failures.is_empty() {
            UploadStatus::Failed(failures.join("; "))
        } else if waiting {
            UploadStatus::StillWaiting
        } else {
            UploadStatus::Ok
        }
    }

    /// One worker iteration: cancellations, then completions, then received
    /// jobs (highest priority first, time boxed).
    pub fn process_events(&self) {
        self.process_cancellations();
        self.process_completions();
        self.process_received_jobs();
    }

    fn process_cancellations(&self) {
        let ids = std::mem::take(&mut *lock(&self.cancelled));
        for id in ids {
            {
                let mut queue = lock(&self.jobs_received);
                if let Some(pos) = queue.iter().position(|q| q.job.id == id) {
                    queue.remove(pos);
                    lock(&self.finished).insert(id.clone(), Some(StageError::fatal(CANCELLED)));
                    drop(queue);
                    tracing::info!(job_id = %id, "queued job cancelled before staging");
                    self.wake.notify_one();
                    continue;
                }
            }
            let known = match lock(&self.books).get_mut(&id) {
                Some(book) => {
                    book.user_cancelled = true;
                    book.cancel_sent = true;
                    true
                }
                None => false,
            };
            if known {
                tracing::info!(job_id = %id, "cancelling transfers");
                self.scheduler.cancel(&id);
            }
        }
    }

    fn process_completions(&self) {
        let mut dtrs = Vec::new();
        {
            let mut rx = lock(&self.completions);
            while let Ok(dtr) = rx.try_recv() {
                dtrs.push(dtr);
            }
        }
        for dtr in dtrs {
            self.process_dtr(dtr);
        }
    }

    fn process_received_jobs(&self) {
        let started = Instant::now();
        let budget = self.config.staging.job_batch();
        while let Some(queued) = self.next_received_job() {
            self.process_job(queued);
            if started.elapsed() >= budget {
                break;
            }
        }
    }

    /// Pop the highest-priority job and mark it active in one step.
    fn next_received_job(&self) -> Option<QueuedJob> {
        let mut queue = lock(&self.jobs_received);
        let pos = queue
            .iter()
            .enumerate()
            .max_by_key(|(i, q)| (q.job.priority(), Reverse(*i)))
            .map(|(i, _)| i)?;
        let queued = queue.remove(pos);
        lock(&self.active).insert(queued.job.id.clone(), HashSet::new());
        Some(queued)
    }

    fn process_job(&self, queued: QueuedJob) {
        let QueuedJob { job, direction } = queued;
        let Some(local) = job.local.as_ref() else {
            tracing::error!(job_id = %job.id, "job has no local description");
            self.finish_stage(&job.id, Some(StageError::fatal(CONFIG_ERROR)));
            return;
        };
        if !self.config.knows_owner(&local.owner) {
            tracing::error!(job_id = %job.id, uid = local.owner.uid, "job owner is not configured");
            self.finish_stage(&job.id, Some(StageError::fatal(CONFIG_ERROR)));
            return;
        }

        let mut book = StageBook::new(direction, local.session_dir.clone());
        let built = match direction {
            Direction::Download => self.build_downloads(&job.id, local, &mut book),
            Direction::Upload => self.build_uploads(&job.id, local, &mut book),
        };
        let dtrs = match built {
            Ok(dtrs) => dtrs,
            Err(error) => {
                tracing::warn!(job_id = %job.id, error = %error.message, "staging rejected");
                self.finish_stage(&job.id, Some(error));
                return;
            }
        };
        if dtrs.is_empty() {
            tracing::info!(job_id = %job.id, %direction, "nothing to transfer");
            self.finish_stage(&job.id, None);
            return;
        }

        tracing::info!(job_id = %job.id, %direction, count = dtrs.len(), "submitting transfers");
        lock(&self.books).insert(job.id.clone(), book);
        for dtr in dtrs {
            let id = dtr.id;
            lock(&self.active)
                .entry(job.id.clone())
                .or_default()
                .insert(id);
            if let Err(e) = self.scheduler.submit(dtr) {
                tracing::error!(job_id = %job.id, dtr_id = %id, error = %e, "transfer rejected");
                if let Some(set) = lock(&self.active).get_mut(&job.id) {
                    set.remove(&id);
                }
                let stop = match lock(&self.books).get_mut(&job.id) {
                    Some(book) => {
                        book.errors.push(DtrError::permanent(e.to_string()));
                        book.direction == Direction::Download
                    }
                    None => false,
                };
                if stop {
                    self.cancel_siblings(&job.id);
                    break;
                }
            }
        }
        if lock(&self.active).get(&job.id).is_some_and(|s| s.is_empty()) {
            self.finalize(&job.id);
        }
    }

    fn build_downloads(
        &self,
        job_id: &JobId,
        local: &JobLocal,
        book: &mut StageBook,
    ) -> Result<Vec<TransferRequest>, StageError> {
        let inputs = self
            .store
            .read_list(job_id, FileList::Input)
            .map_err(|e| list_error("input", e))?;
        let outputs = self
            .store
            .read_list(job_id, FileList::Output)
            .map_err(|e| list_error("output", e))?;

        let mut seen = HashSet::new();
        for entry in &inputs {
            if !seen.insert(entry.key()) {
                return Err(staging_failure(format!(
                    "duplicate file in list of input files: {}",
                    entry.lfn
                )));
            }
        }
        let downloadable: HashSet<&str> = outputs
            .iter()
            .filter(|o| !o.is_remote())
            .map(|o| o.key())
            .collect();

        let mut dtrs = Vec::new();
        for entry in inputs.iter().filter(|e| e.is_remote()) {
            if downloadable.contains(entry.key()) && !entry.allow_overwrite {
                return Err(staging_failure(format!(
                    "input file {} would overwrite a user-downloadable output",
                    entry.lfn
                )));
            }
            let locator = parse_locator(entry)?;
            let path = session_path(entry, &book.session_dir)?;

            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(job_id = %job_id, path = %path.display(), "removed stale file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(staging_failure(format!(
                        "can't clean {}: {e}",
                        path.display()
                    )));
                }
            }

            let destination = path.to_string_lossy().into_owned();
            let force = self.take_recovered(&destination);
            let mut dtr = self.new_dtr(job_id, local, entry, locator.to_string(), destination);
            dtr.cache_eligible = locator.option("cache") != Some("no");
            dtr.force_overwrite = force;
            book.partial.insert(path);
            dtrs.push(dtr);
        }
        Ok(dtrs)
    }

    fn build_uploads(
        &self,
        job_id: &JobId,
        local: &JobLocal,
        book: &mut StageBook,
    ) -> Result<Vec<TransferRequest>, StageError> {
        let listed = self
            .store
            .read_list(job_id, FileList::Output)
            .map_err(|e| list_error("output", e))?;

        let mut outputs = Vec::new();
        for entry in listed {
            if entry.dynamic {
                let side = session_path(&entry, &book.session_dir)?;
                outputs.extend(read_side_list(&side, &entry.lfn)?);
                book.side_lists.push(side);
                continue;
            }
            if !entry.is_remote() {
                book.keep.insert(session_path(&entry, &book.session_dir)?);
            }
            outputs.push(entry);
        }

        // group by remote identity before anything is created
        let strict = self.config.staging.strict_option_order;
        let mut parsed = Vec::new();
        let mut by_identity: HashMap<String, Vec<usize>> = HashMap::new();
        for entry in outputs.iter().filter(|e| e.is_remote()) {
            let locator = parse_locator(entry)?;
            by_identity
                .entry(locator.identity(strict))
                .or_default()
                .push(parsed.len());
            parsed.push((entry, locator));
        }
        let mut replicated = HashSet::new();
        for indices in by_identity.values().filter(|v| v.len() > 1) {
            let first = parsed[indices[0]].0;
            if let Some(&other) = indices.iter().find(|&&i| parsed[i].0.key() != first.key()) {
                return Err(staging_failure(format!(
                    "duplicate destination {} for files {} and {}",
                    parsed[indices[0]].1,
                    first.lfn,
                    parsed[other].0.lfn
                )));
            }
            replicated.extend(indices.iter().copied());
        }

        let mut dtrs = Vec::with_capacity(parsed.len());
        for (i, (entry, locator)) in parsed.into_iter().enumerate() {
            let source = session_path(entry, &book.session_dir)?;
            let mut force = replicated.contains(&i);
            let mut destination = locator;
            if self.take_recovered(&destination.to_string()) {
                destination = destination.with_option("overwrite", "yes");
                force = true;
            }
            let mut dtr = self.new_dtr(
                job_id,
                local,
                entry,
                source.to_string_lossy().into_owned(),
                destination.to_string(),
            );
            dtr.force_overwrite = force;
            dtrs.push(dtr);
        }
        Ok(dtrs)
    }

    fn new_dtr(
        &self,
        job_id: &JobId,
        local: &JobLocal,
        entry: &FileEntry,
        source: String,
        destination: String,
    ) -> TransferRequest {
        TransferRequest {
            id: DtrId::generate(),
            job_id: job_id.clone(),
            source,
            destination,
            session_dir: local.session_dir.clone(),
            status: DtrStatus::Queued,
            error: None,
            transfer_share: local.transfer_share.clone(),
            priority: local.priority,
            tries_left: self.config.staging.transfer_tries,
            cache_eligible: false,
            force_overwrite: false,
            credential: entry.credential.clone().or_else(|| local.credential.clone()),
            owner: local.owner.clone(),
            lfn: entry.lfn.clone(),
            origin: entry.origin.clone(),
            bytes: None,
            started: None,
            finished: None,
            cache_hit: false,
        }
    }

    fn take_recovered(&self, destination: &str) -> bool {
        lock(&self.recovered).remove(destination)
    }

    fn process_dtr(&self, dtr: TransferRequest) {
        let job_id = dtr.job_id.clone();
        let remaining = {
            let mut active = lock(&self.active);
            match active.get_mut(&job_id) {
                Some(set) if set.contains(&dtr.id) => {
                    set.remove(&dtr.id);
                    Some(set.len())
                }
                _ => None,
            }
        };
        let Some(remaining) = remaining else {
            tracing::warn!(job_id = %job_id, dtr_id = %dtr.id, "DTR does not belong to an active stage");
            return;
        };
        let direction = dtr.direction();

        match dtr.status {
            DtrStatus::Done => {
                tracing::info!(job_id = %job_id, dtr_id = %dtr.id, %direction, remote = %dtr.remote(), "transfer done");
                self.on_transfer_done(&dtr);
            }
            DtrStatus::Failed => {
                let error = dtr
                    .error
                    .clone()
                    .unwrap_or_else(|| DtrError::permanent("unknown error"));
                tracing::warn!(job_id = %job_id, dtr_id = %dtr.id, %direction, error = %error.message, "transfer failed");
                let message = format!("{} {}: {}", direction_verb(direction), dtr.remote(), error.message);
                let fail_fast = match lock(&self.books).get_mut(&job_id) {
                    Some(book) => {
                        book.errors.push(DtrError {
                            kind: error.kind,
                            message,
                        });
                        let first = direction == Direction::Download && !book.cancel_sent;
                        if first {
                            book.cancel_sent = true;
                        }
                        first
                    }
                    None => false,
                };
                if fail_fast && remaining > 0 {
                    tracing::info!(job_id = %job_id, "input failed, cancelling remaining downloads");
                    self.scheduler.cancel(&job_id);
                }
            }
            DtrStatus::Cancelled => {
                tracing::info!(job_id = %job_id, dtr_id = %dtr.id, "transfer cancelled");
                if let Some(book) = lock(&self.books).get_mut(&job_id)
                    && !book.cancel_sent
                {
                    // stopped from the scheduler side (shutdown)
                    book.errors.push(DtrError::transient(format!(
                        "transfer of {} was cancelled",
                        dtr.remote()
                    )));
                }
            }
            DtrStatus::Queued | DtrStatus::Transferring => {
                tracing::error!(job_id = %job_id, dtr_id = %dtr.id, status = ?dtr.status, "DTR came back unfinished");
                if let Some(book) = lock(&self.books).get_mut(&job_id) {
                    book.errors.push(DtrError::transient(format!(
                        "transfer of {} did not finish",
                        dtr.remote()
                    )));
                }
            }
        }

        if remaining == 0 {
            self.finalize(&job_id);
        }
    }

    fn on_transfer_done(&self, dtr: &TransferRequest) {
        let job_id = &dtr.job_id;
        let direction = dtr.direction();
        if let Some(book) = lock(&self.books).get_mut(job_id) {
            match direction {
                Direction::Download => {
                    book.partial.remove(dtr.local());
                }
                Direction::Upload => book.uploaded.push(dtr.local().to_path_buf()),
            }
        }

        if let Err(e) = self.drop_list_entry(dtr) {
            tracing::warn!(job_id = %job_id, lfn = %dtr.lfn, error = %e, "can't update file list");
        }
        if direction == Direction::Upload
            && let Err(e) = self.record_uploaded(dtr)
        {
            tracing::warn!(job_id = %job_id, lfn = %dtr.lfn, error = %e, "can't record uploaded file");
        }
        if let Err(e) = self.store.append_statistics(job_id, &dtr.statistics_line()) {
            tracing::debug!(job_id = %job_id, error = %e, "statistics not written");
        }
    }

    /// Remove the completed entry so a rerun does not stage it again.
    fn drop_list_entry(&self, dtr: &TransferRequest) -> Result<(), FerryError> {
        let remote = dtr.remote();
        let matches = |e: &FileEntry| {
            e.key() == dtr.lfn.trim_start_matches('/') && same_remote(e, remote)
        };
        if let Some(origin) = &dtr.origin {
            let side = dtr.session_dir.join(origin.trim_start_matches('/'));
            let mut entries = read_list(&side)?;
            if let Some(pos) = entries.iter().position(|e| matches(e)) {
                entries.remove(pos);
                write_list(&side, &entries)?;
            }
            return Ok(());
        }
        let list = match dtr.direction() {
            Direction::Download => FileList::Input,
            Direction::Upload => FileList::Output,
        };
        let mut entries = self.store.read_list(&dtr.job_id, list)?;
        if let Some(pos) = entries.iter().position(|e| matches(e)) {
            entries.remove(pos);
            self.store.write_list(&dtr.job_id, list, &entries)?;
        }
        Ok(())
    }

    fn record_uploaded(&self, dtr: &TransferRequest) -> Result<(), FerryError> {
        let mut done = self.store.read_list(&dtr.job_id, FileList::Uploaded)?;
        done.push(FileEntry::remote(dtr.lfn.clone(), dtr.destination.clone()));
        self.store.write_list(&dtr.job_id, FileList::Uploaded, &done)
    }

    fn cancel_siblings(&self, job_id: &JobId) {
        if let Some(book) = lock(&self.books).get_mut(job_id) {
            book.cancel_sent = true;
        }
        self.scheduler.cancel(job_id);
    }

    /// Last DTR of the stage is back: clean up and publish the outcome.
    fn finalize(&self, job_id: &JobId) {
        let Some(book) = lock(&self.books).remove(job_id) else {
            self.finish_stage(job_id, None);
            return;
        };
        let outcome = book.outcome();
        match book.direction {
            Direction::Download => {
                for path in &book.partial {
                    remove_quietly(job_id, path);
                }
            }
            Direction::Upload => {
                for path in book.uploaded.iter().filter(|p| !book.keep.contains(*p)) {
                    remove_quietly(job_id, path);
                }
                // side lists are needed to resume a failed upload
                if outcome.is_none() {
                    for path in &book.side_lists {
                        remove_quietly(job_id, path);
                    }
                }
            }
        }
        self.finish_stage(job_id, outcome);
    }

    fn finish_stage(&self, job_id: &JobId, outcome: Option<StageError>) {
        match &outcome {
            Some(error) => {
                tracing::warn!(job_id = %job_id, error = %error.message, retryable = error.retryable, "staging finished with failure")
            }
            None => tracing::info!(job_id = %job_id, "staging finished"),
        }
        lock(&self.finished).insert(job_id.clone(), outcome);
        lock(&self.active).remove(job_id);
        self.wake.notify_one();
    }

    /// Jobs queued or staging right now.
    pub fn staging_count(&self) -> usize {
        lock(&self.jobs_received).len() + lock(&self.active).len()
    }

    /// Worker-side shutdown: stop the scheduler, then account for every
    /// DTR it posted while draining.
    async fn drain(&self) {
        self.process_cancellations();
        self.scheduler.shutdown().await;
        self.process_completions();
    }
}

fn direction_verb(direction: Direction) -> &'static str {
    match direction {
        Direction::Download => "failed to download",
        Direction::Upload => "failed to upload",
    }
}

fn list_error(which: &str, e: FerryError) -> StageError {
    tracing::error!(error = %e, "can't read list of {which} files");
    StageError::fatal(format!("{CONFIG_ERROR}: can't read list of {which} files"))
}

fn parse_locator(entry: &FileEntry) -> Result<Locator, StageError> {
    match entry.parsed_locator() {
        Some(Ok(locator)) => Ok(locator),
        Some(Err(e)) => Err(staging_failure(format!("invalid locator for {}: {e}", entry.lfn))),
        None => Err(staging_failure(format!("no locator for {}", entry.lfn))),
    }
}

fn session_path(entry: &FileEntry, session_dir: &Path) -> Result<PathBuf, StageError> {
    entry
        .session_path(session_dir)
        .ok_or_else(|| staging_failure(format!("invalid file name {}", entry.lfn)))
}

fn read_side_list(path: &Path, lfn: &str) -> Result<Vec<FileEntry>, StageError> {
    match read_list(path) {
        Ok(entries) => Ok(entries
            .into_iter()
            .map(|mut e| {
                e.origin = Some(lfn.to_string());
                e
            })
            .collect()),
        Err(e) if e.is_not_found() => {
            tracing::warn!(path = %path.display(), "dynamic output list missing, treating as empty");
            Ok(Vec::new())
        }
        Err(e) => Err(staging_failure(format!(
            "can't read dynamic output list {lfn}: {e}"
        ))),
    }
}

fn same_remote(entry: &FileEntry, remote: &str) -> bool {
    match (entry.parsed_locator(), Locator::parse(remote)) {
        (Some(Ok(a)), Ok(b)) => a.base() == b.base(),
        _ => false,
    }
}

fn remove_quietly(job_id: &JobId, path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(job_id = %job_id, path = %path.display(), "removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(job_id = %job_id, path = %path.display(), error = %e, "can't remove"),
    }
}

/// Destinations of `TRANSFERRING` lines of a DTR dump
/// (`<id> <STATE> <priority> <share> <destination>`).
fn read_recovery_dump(path: &Path) -> HashSet<String> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return HashSet::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "can't read DTR dump");
            return HashSet::new();
        }
    };
    parse_recovery_dump(&text)
}

fn parse_recovery_dump(text: &str) -> HashSet<String> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.splitn(5, ' ').collect();
            match fields.as_slice() {
                [_, "TRANSFERRING", _, _, destination] => Some(destination.trim().to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Check one user-managed file: present, regular, right size, right
/// checksum. A file smaller than announced is taken as still uploading.
fn check_user_file(session_dir: &Path, entry: &FileEntry) -> UploadStatus {
    let Some(path) = entry.session_path(session_dir) else {
        return UploadStatus::Failed(format!("invalid file name {}", entry.lfn));
    };
    let meta = match fs::symlink_metadata(&path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return UploadStatus::StillWaiting,
        Err(e) => return UploadStatus::Failed(format!("can't access {}: {e}", entry.lfn)),
    };
    if !meta.is_file() {
        return UploadStatus::Failed(format!("{} is not a regular file", entry.lfn));
    }
    if let Some(size) = entry.size {
        if meta.len() < size {
            return UploadStatus::StillWaiting;
        }
        if meta.len() > size {
            return UploadStatus::Failed(format!(
                "{} has size {} instead of {size}",
                entry.lfn,
                meta.len()
            ));
        }
    }
    let Some(expected) = entry.checksum.as_deref() else {
        return UploadStatus::Ok;
    };
    let expected = match expected.split_once(':') {
        Some((algo, hex)) if algo.eq_ignore_ascii_case("blake3") => hex,
        Some((algo, _)) => {
            return UploadStatus::Failed(format!(
                "unsupported checksum type {algo} for {}",
                entry.lfn
            ));
        }
        None => expected,
    };
    match hash_file(&path) {
        Ok(actual) if actual.eq_ignore_ascii_case(expected.trim()) => UploadStatus::Ok,
        Ok(_) => UploadStatus::Failed(format!("checksum mismatch for {}", entry.lfn)),
        Err(e) => UploadStatus::Failed(format!("can't read {}: {e}", entry.lfn)),
    }
}

/// blake3 of a file, read in 256KB chunks.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Background worker handle.
/// - `request_shutdown()` でループを止める
/// - `shutdown_and_join()` で scheduler の drain まで待てる
pub struct GeneratorHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl GeneratorHandle {
    pub fn spawn(generator: Arc<Generator>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(generator_loop(generator, shutdown_rx));
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "generator worker panicked");
        }
    }
}

async fn generator_loop(generator: Arc<Generator>, mut shutdown_rx: watch::Receiver<bool>) {
    let poll = generator.config.staging.poll_interval();
    tracing::info!("generator started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let g = Arc::clone(&generator);
        // file-list I/O is blocking
        if let Err(e) = tokio::task::spawn_blocking(move || g.process_events()).await {
            tracing::error!(error = %e, "generator iteration panicked");
        }
        tokio::select! {
            _ = shutdown_rx.changed() => continue,
            _ = tokio::time::sleep(poll) => {}
        }
    }
    tracing::info!("generator shutting down, draining transfers");
    generator.drain().await;
    tracing::info!("generator stopped");
}
