//! Test doubles and fixtures shared by the unit tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::app::generator::Generator;
use crate::config::Config;
use crate::domain::{
    DtrError, DtrStatus, FileEntry, FileList, Job, JobDescription, JobId, JobLocal, JobState,
    Owner, TransferRequest,
};
use crate::error::FerryError;
use crate::impls::FsJobStore;
use crate::ports::{
    BatchStatus, BatchSystem, DtrSink, FixedClock, JobStore, TransferScheduler,
    completion_channel,
};

/// Scheduler that only records what it is asked to do. Tests finish DTRs
/// by hand with [`MockScheduler::finish`].
pub struct MockScheduler {
    sink: DtrSink,
    in_flight: Mutex<Vec<TransferRequest>>,
    pub submitted: Mutex<Vec<TransferRequest>>,
    pub cancelled: Mutex<Vec<JobId>>,
    /// Submissions of these lfns are rejected.
    pub reject: Mutex<Vec<String>>,
}

impl MockScheduler {
    pub fn new(sink: DtrSink) -> Self {
        Self {
            sink,
            in_flight: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            reject: Mutex::new(Vec::new()),
        }
    }

    pub fn submitted(&self) -> Vec<TransferRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Post the in-flight DTR for `lfn` back with `status`.
    pub fn finish(&self, lfn: &str, status: DtrStatus, error: Option<DtrError>) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let pos = in_flight
            .iter()
            .position(|d| d.lfn == lfn)
            .unwrap_or_else(|| panic!("no DTR in flight for {lfn}"));
        let mut dtr = in_flight.remove(pos);
        dtr.status = status;
        dtr.error = error;
        dtr.bytes = Some(3);
        dtr.started = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        dtr.finished = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap());
        self.sink.post(dtr);
    }

    /// Post every in-flight DTR of the job back as cancelled.
    pub fn cancel_in_flight(&self, job_id: &JobId) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let (gone, kept): (Vec<_>, Vec<_>) =
            in_flight.drain(..).partition(|d| &d.job_id == job_id);
        *in_flight = kept;
        for mut dtr in gone {
            dtr.status = DtrStatus::Cancelled;
            self.sink.post(dtr);
        }
    }
}

#[async_trait]
impl TransferScheduler for MockScheduler {
    fn submit(&self, dtr: TransferRequest) -> Result<(), FerryError> {
        if self.reject.lock().unwrap().contains(&dtr.lfn) {
            return Err(FerryError::Scheduler(format!("rejected {}", dtr.lfn)));
        }
        self.submitted.lock().unwrap().push(dtr.clone());
        self.in_flight.lock().unwrap().push(dtr);
        Ok(())
    }

    fn cancel(&self, job_id: &JobId) {
        self.cancelled.lock().unwrap().push(job_id.clone());
    }

    async fn shutdown(&self) {
        let ids: Vec<JobId> = self
            .in_flight
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.job_id.clone())
            .collect();
        for id in ids {
            self.cancel_in_flight(&id);
        }
    }
}

#[derive(Default)]
pub struct MockBatch {
    pub submitted: Mutex<Vec<JobId>>,
    pub cancelled: Mutex<Vec<JobId>>,
    pub status: Mutex<HashMap<JobId, BatchStatus>>,
    pub fail_submit: Mutex<bool>,
}

impl MockBatch {
    pub fn set_status(&self, id: &str, status: BatchStatus) {
        self.status.lock().unwrap().insert(JobId::new(id), status);
    }
}

impl BatchSystem for MockBatch {
    fn submit(&self, job: &Job) -> Result<String, FerryError> {
        if *self.fail_submit.lock().unwrap() {
            return Err(FerryError::Batch("queue is closed".to_string()));
        }
        self.submitted.lock().unwrap().push(job.id.clone());
        Ok(format!("batch-{}", job.id))
    }

    fn cancel(&self, job: &Job) -> Result<(), FerryError> {
        self.cancelled.lock().unwrap().push(job.id.clone());
        self.status
            .lock()
            .unwrap()
            .insert(job.id.clone(), BatchStatus::Done { exit_code: 143 });
        Ok(())
    }

    fn poll(&self, job: &Job) -> Result<BatchStatus, FerryError> {
        Ok(self
            .status
            .lock()
            .unwrap()
            .get(&job.id)
            .cloned()
            .unwrap_or(BatchStatus::Running))
    }
}

/// Control directory, session directories and a store in a temp dir.
pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<FsJobStore>,
    pub config: Config,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.control_dir = dir.path().join("control");
        config.staging.retry_seed = Some(7);
        let store = Arc::new(FsJobStore::open(&config.control_dir).unwrap());
        Self { dir, store, config }
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        let dir = self.dir.path().join("sessions").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn owner() -> Owner {
        Owner {
            uid: 1000,
            gid: 1000,
            identity: "/O=Grid/CN=Test User".to_string(),
            vo: Some("testvo".to_string()),
        }
    }

    pub fn description(
        &self,
        id: &str,
        inputs: Vec<FileEntry>,
        outputs: Vec<FileEntry>,
    ) -> JobDescription {
        JobDescription {
            owner: Self::owner(),
            session_dir: self.session_dir(id),
            executable: Some("/bin/true".to_string()),
            priority: 50,
            start_time: None,
            credential: None,
            inputs,
            outputs,
        }
    }

    /// Persist a submitted job (description + lists, no state yet).
    pub fn submit(&self, id: &str, desc: &JobDescription) -> JobId {
        let id = JobId::new(id);
        self.store.write_description(&id, desc).unwrap();
        self.store
            .write_list(&id, FileList::Input, &desc.inputs)
            .unwrap();
        self.store
            .write_list(&id, FileList::Output, &desc.outputs)
            .unwrap();
        id
    }

    /// An in-memory job in `state`, with its records persisted.
    pub fn job(
        &self,
        id: &str,
        state: JobState,
        inputs: Vec<FileEntry>,
        outputs: Vec<FileEntry>,
    ) -> Job {
        let desc = self.description(id, inputs, outputs);
        let job_id = self.submit(id, &desc);
        let local = JobLocal::from_description(&desc, "_default".to_string(), 5);
        self.store.write_local(&job_id, &local).unwrap();
        self.store.write_state(&job_id, state).unwrap();
        let mut job = Job::new(job_id);
        job.state = state;
        job.local = Some(local);
        job
    }

    pub fn generator(&self) -> (Arc<Generator>, Arc<MockScheduler>) {
        let (sink, rx) = completion_channel();
        let scheduler = Arc::new(MockScheduler::new(sink.clone()));
        let generator = Generator::new(
            Arc::new(self.config.clone()),
            self.store.clone(),
            scheduler.clone(),
            sink,
            rx,
        );
        (Arc::new(generator), scheduler)
    }

    pub fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ))
    }

    pub fn list(&self, id: &JobId, list: FileList) -> Vec<FileEntry> {
        self.store.read_list(id, list).unwrap()
    }
}
