use std::sync::Mutex;

use super::*;
use crate::app::generator::CANCELLED;
use crate::config::ShareType;
use crate::domain::{DtrError, DtrStatus, FileEntry, Owner};
use crate::ports::FixedClock;
use crate::testing::{Fixture, MockBatch, MockScheduler};

#[derive(Default)]
struct RecordingCache {
    released: Mutex<Vec<JobId>>,
}

impl CacheReleaser for RecordingCache {
    fn release(&self, job_id: &JobId, _owner: &Owner) -> Result<(), FerryError> {
        self.released.lock().unwrap().push(job_id.clone());
        Ok(())
    }
}

/// Fails the hook of one state.
struct FailAt(JobState);

impl HookRunner for FailAt {
    fn run_hook(&self, state: JobState, _job: &Job) -> HookAction {
        if state == self.0 {
            HookAction::Fail
        } else {
            HookAction::Pass
        }
    }
}

struct Harness {
    fx: Fixture,
    generator: Arc<Generator>,
    scheduler: Arc<MockScheduler>,
    batch: Arc<MockBatch>,
    clock: Arc<FixedClock>,
    cache: Arc<RecordingCache>,
    sm: JobStateMachine,
}

impl Harness {
    fn new(fx: Fixture) -> Self {
        let (generator, scheduler) = fx.generator();
        let batch = Arc::new(MockBatch::default());
        let clock = Fixture::clock();
        let cache = Arc::new(RecordingCache::default());
        let sm = JobStateMachine::new(
            Arc::new(fx.config.clone()),
            fx.store.clone(),
            generator.clone(),
            batch.clone(),
            clock.clone(),
        )
        .with_cache(cache.clone());
        Self {
            fx,
            generator,
            scheduler,
            batch,
            clock,
            cache,
            sm,
        }
    }

    fn with_hooks(mut self, hooks: Arc<dyn HookRunner>) -> Self {
        self.sm = self.sm.with_hooks(hooks);
        self
    }

    /// A freshly submitted job, state ACCEPTED on disk.
    fn submit(&self, id: &str, inputs: Vec<FileEntry>, outputs: Vec<FileEntry>, exe: bool) {
        let mut desc = self.fx.description(id, inputs, outputs);
        if !exe {
            desc.executable = None;
        }
        let id = self.fx.submit(id, &desc);
        self.fx.store.write_state(&id, JobState::Accepted).unwrap();
    }

    /// A one-input job of `owner`, state ACCEPTED on disk.
    fn submit_owned(&self, id: &str, owner: Owner) {
        let mut desc = self.fx.description(id, vec![remote("/in")], vec![]);
        desc.owner = owner;
        let id = self.fx.submit(id, &desc);
        self.fx.store.write_state(&id, JobState::Accepted).unwrap();
    }

    /// PREPARING jobs per transfer share.
    fn preparing_per_share(&self) -> BTreeMap<String, u32> {
        let mut per_share = BTreeMap::new();
        for job in self.sm.jobs().filter(|j| j.state == JobState::Preparing) {
            *per_share
                .entry(job.transfer_share().to_string())
                .or_default() += 1;
        }
        per_share
    }

    fn tick(&mut self) {
        self.sm.scan().unwrap();
        self.sm.run_pass();
    }

    fn stage(&self) {
        self.generator.process_events();
    }

    fn job(&self, id: &str) -> &Job {
        self.sm.job(&JobId::new(id)).unwrap()
    }

    fn job_mut(&mut self, id: &str) -> &mut Job {
        self.sm.jobs.get_mut(&JobId::new(id)).unwrap()
    }

    fn state(&self, id: &str) -> JobState {
        self.job(id).state
    }

    fn stored_state(&self, id: &str) -> Option<JobState> {
        self.fx.store.read_state(&JobId::new(id)).unwrap()
    }

    fn request(&self, id: &str, request: Request) {
        self.fx
            .store
            .place_request(&JobId::new(id), request)
            .unwrap();
    }
}

fn remote(lfn: &str) -> FileEntry {
    FileEntry::remote(lfn, format!("gsiftp://se.example.org{lfn}"))
}

/// Drive a one-input job to PREPARING with its DTR submitted.
fn preparing(h: &mut Harness, id: &str, retries_left: u32) {
    h.submit(id, vec![remote("/in")], vec![], true);
    h.tick();
    h.tick();
    assert_eq!(h.state(id), JobState::Preparing);
    h.job_mut(id).retries_left = retries_left;
    h.stage();
    assert_eq!(h.scheduler.in_flight(), 1);
}

#[test]
fn scenario_a_job_runs_through_every_stage() {
    let mut h = Harness::new(Fixture::new());
    h.submit("j1", vec![remote("/a"), remote("/b")], vec![], true);

    h.tick();
    assert_eq!(h.state("j1"), JobState::Accepted);
    h.tick();
    assert_eq!(h.state("j1"), JobState::Preparing);
    assert_eq!(h.generator.staging_count(), 1);

    h.stage();
    assert_eq!(h.scheduler.submitted().len(), 2);
    h.tick();
    assert_eq!(h.state("j1"), JobState::Preparing, "DTRs still active");

    h.scheduler.finish("/a", DtrStatus::Done, None);
    h.scheduler.finish("/b", DtrStatus::Done, None);
    h.stage();
    h.tick();
    assert_eq!(h.state("j1"), JobState::Submitting);

    h.tick();
    assert_eq!(h.state("j1"), JobState::InBatchSystem);
    assert_eq!(*h.batch.submitted.lock().unwrap(), vec![JobId::new("j1")]);
    assert_eq!(
        h.job("j1").local.as_ref().unwrap().batch_id.as_deref(),
        Some("batch-j1")
    );

    h.tick();
    assert_eq!(h.state("j1"), JobState::InBatchSystem, "still running");
    h.batch.set_status("j1", BatchStatus::Done { exit_code: 0 });
    h.tick();
    assert_eq!(h.state("j1"), JobState::Finishing);

    h.stage();
    h.tick();
    assert_eq!(h.state("j1"), JobState::Finished);
    assert!(!h.job("j1").is_failed());
    assert_eq!(h.stored_state("j1"), Some(JobState::Finished));
    assert_eq!(*h.cache.released.lock().unwrap(), vec![JobId::new("j1")]);
    assert!(h.job("j1").keep_until.is_some());
}

#[test]
fn scenario_b_exhausted_retries_route_to_finished() {
    let mut h = Harness::new(Fixture::new());
    preparing(&mut h, "j2", 1);
    h.scheduler
        .finish("/in", DtrStatus::Failed, Some(DtrError::transient("timeout")));
    h.stage();

    let mut seen = Vec::new();
    for _ in 0..4 {
        h.tick();
        h.stage();
        seen.push(h.state("j2"));
    }
    assert_eq!(seen[0], JobState::Finishing);
    assert_eq!(h.state("j2"), JobState::Finished);
    assert!(!seen.contains(&JobState::Accepted));

    let job = h.job("j2");
    assert!(job.failure_text().starts_with("Failed in data staging"));
    assert_eq!(
        job.local.as_ref().unwrap().failed_state,
        Some(JobState::Preparing)
    );
    let marker = h.fx.store.read_failed(&job.id).unwrap().unwrap();
    assert!(marker.contains("timeout"));
}

#[test]
fn scenario_c_retry_waits_for_back_off() {
    let mut h = Harness::new(Fixture::new());
    preparing(&mut h, "j3", 3);
    h.scheduler
        .finish("/in", DtrStatus::Failed, Some(DtrError::transient("timeout")));
    h.stage();

    h.tick();
    let job = h.job("j3");
    assert_eq!(job.state, JobState::Accepted);
    assert_eq!(job.retries_left, 2);
    assert!(job.next_retry.unwrap() > h.clock.now());
    assert!(!job.is_failed(), "a retried stage is not a failure");

    h.tick();
    assert_eq!(h.state("j3"), JobState::Accepted, "slots are free but back-off runs");

    h.clock.advance(chrono::Duration::hours(1));
    h.tick();
    assert_eq!(h.state("j3"), JobState::Preparing);
    assert_eq!(h.job("j3").retries_left, 2);
}

#[test]
fn scenario_d_cancel_in_batch_system() {
    let mut h = Harness::new(Fixture::new());
    h.fx.job("j4", JobState::InBatchSystem, vec![], vec![]);
    h.tick();
    assert_eq!(h.state("j4"), JobState::InBatchSystem);

    h.request("j4", Request::Cancel);
    h.tick();
    assert_eq!(h.state("j4"), JobState::Canceling);
    assert_eq!(h.job("j4").failures, vec![CANCELLED_BY_USER.to_string()]);
    assert!(h.scheduler.submitted().is_empty());

    h.tick();
    assert_eq!(*h.batch.cancelled.lock().unwrap(), vec![JobId::new("j4")]);
    assert_eq!(h.state("j4"), JobState::Finishing);

    h.stage();
    h.tick();
    assert_eq!(h.state("j4"), JobState::Finished);
    assert!(h.job("j4").is_failed());
}

#[test]
fn cancelled_download_drains_before_upload_starts() {
    let mut h = Harness::new(Fixture::new());
    preparing(&mut h, "j1", 10);

    h.request("j1", Request::Cancel);
    h.tick();
    assert_eq!(h.state("j1"), JobState::Finishing);
    h.stage();
    assert_eq!(*h.scheduler.cancelled.lock().unwrap(), vec![JobId::new("j1")]);

    h.tick();
    assert!(!h.job("j1").staging_submitted, "download still draining");

    h.scheduler.cancel_in_flight(&JobId::new("j1"));
    h.stage();
    h.tick();
    assert!(h.job("j1").staging_submitted);
    h.stage();
    h.tick();
    assert_eq!(h.state("j1"), JobState::Finished);
    let failures = &h.job("j1").failures;
    assert!(failures.contains(&CANCELLED_BY_USER.to_string()));
    assert!(failures.contains(&CANCELLED.to_string()));
}

#[test]
fn job_without_executable_skips_the_batch_system() {
    let mut h = Harness::new(Fixture::new());
    h.submit("j1", vec![], vec![], false);
    h.tick();
    h.tick();
    h.stage();
    h.tick();
    assert_eq!(h.state("j1"), JobState::Finishing);
    h.stage();
    h.tick();
    assert_eq!(h.state("j1"), JobState::Finished);
    assert!(h.batch.submitted.lock().unwrap().is_empty());
}

#[test]
fn missing_user_file_times_out() {
    let mut h = Harness::new(Fixture::new());
    h.submit("j1", vec![FileEntry::local("/user.dat")], vec![], true);
    h.tick();
    h.tick();
    h.stage();
    h.tick();
    assert_eq!(h.state("j1"), JobState::Preparing, "still waiting for the user");

    h.clock.advance(chrono::Duration::seconds(601));
    h.tick();
    assert_eq!(h.state("j1"), JobState::Finishing);
    assert!(h.job("j1").failure_text().contains(UPLOAD_TIMEOUT));
}

#[rstest::rstest]
#[case::oversized(Some(2), None, "has size 5 instead of 2")]
#[case::checksum_mismatch(None, Some("blake3:00ff"), "checksum mismatch")]
#[case::unsupported_checksum(None, Some("md5:abcd"), "unsupported checksum type md5")]
fn bad_user_file_fails_preparing(
    #[case] size: Option<u64>,
    #[case] checksum: Option<&str>,
    #[case] reason: &str,
) {
    let mut h = Harness::new(Fixture::new());
    let mut entry = FileEntry::local("/user.dat");
    entry.size = size;
    entry.checksum = checksum.map(str::to_string);
    h.submit("j1", vec![entry], vec![], true);
    std::fs::write(h.fx.session_dir("j1").join("user.dat"), b"hello").unwrap();
    h.tick();
    h.tick();
    h.stage();
    h.tick();

    assert_eq!(h.state("j1"), JobState::Finishing);
    assert!(
        h.job("j1").failure_text().contains(reason),
        "{}",
        h.job("j1").failure_text()
    );
    assert!(h.batch.submitted.lock().unwrap().is_empty());
}

#[test]
fn processing_limit_keeps_jobs_pending() {
    let mut fx = Fixture::new();
    fx.config.limits.max_processing = 1;
    fx.config.limits.max_processing_emergency = 0;
    let mut h = Harness::new(fx);
    h.submit("a", vec![remote("/in")], vec![], true);
    h.submit("b", vec![remote("/in")], vec![], true);
    h.tick();
    h.tick();

    assert_eq!(h.state("a"), JobState::Preparing);
    assert_eq!(h.state("b"), JobState::Accepted);
    assert!(h.job("b").pending);
    assert_eq!(h.sm.counters().processing(), 1);
}

#[test]
fn emergency_slot_lets_uploads_through() {
    let mut fx = Fixture::new();
    fx.config.limits.max_processing = 1;
    fx.config.limits.max_processing_emergency = 1;
    let mut h = Harness::new(fx);
    h.submit("a", vec![remote("/in")], vec![], true);
    h.fx.job("b", JobState::InBatchSystem, vec![], vec![]);
    h.batch.set_status("b", BatchStatus::Done { exit_code: 0 });
    h.tick();
    h.tick();

    assert_eq!(h.state("a"), JobState::Preparing);
    assert_eq!(h.state("b"), JobState::Finishing, "preparing holds every slot");
}

#[test]
fn job_cap_keeps_extra_jobs_undefined() {
    let mut fx = Fixture::new();
    fx.config.limits.max_jobs = 1;
    let mut h = Harness::new(fx);
    h.submit("a", vec![], vec![], true);
    h.submit("b", vec![], vec![], true);
    h.tick();
    assert_eq!(h.state("a"), JobState::Accepted);
    assert_eq!(h.state("b"), JobState::Undefined);
    assert!(h.job("b").pending);
}

#[test]
fn job_cap_counts_jobs_waiting_at_the_staging_gate() {
    let mut fx = Fixture::new();
    fx.config.limits.max_jobs = 2;
    fx.config.limits.max_processing = 1;
    let mut h = Harness::new(fx);
    for id in ["j1", "j2", "j3", "j4", "j5"] {
        h.submit(id, vec![remote("/in")], vec![], true);
    }
    for _ in 0..4 {
        h.tick();
    }

    assert_eq!(h.state("j1"), JobState::Preparing);
    assert_eq!(h.state("j2"), JobState::Accepted);
    assert!(h.job("j2").pending, "held by the staging limit");
    let admitted = h
        .sm
        .jobs()
        .filter(|j| j.state != JobState::Undefined)
        .count();
    assert_eq!(admitted, 2);
    assert_eq!(h.sm.counters().held(), 2);
}

#[test]
fn shares_split_the_staging_slots_from_the_first_admission() {
    let mut fx = Fixture::new();
    fx.config.limits.max_processing = 10;
    fx.config.shares.share_type = ShareType::Vo;
    fx.config.shares.max_per_share = 10;
    let mut h = Harness::new(fx);
    for vo in ["a", "b", "c"] {
        for i in 0..10 {
            let owner = Owner {
                vo: Some(vo.to_string()),
                ..Fixture::owner()
            };
            h.submit_owned(&format!("{vo}{i}"), owner);
        }
    }
    h.tick();
    h.tick();

    let expected: BTreeMap<String, u32> =
        ["a", "b", "c"].iter().map(|s| (s.to_string(), 3)).collect();
    assert_eq!(h.preparing_per_share(), expected);

    // the slots stay split while the jobs keep staging
    h.tick();
    assert_eq!(h.preparing_per_share(), expected);
}

#[test]
fn owner_limit_caps_staging_per_owner() {
    let mut fx = Fixture::new();
    fx.config.limits.max_processing_per_owner = 2;
    let mut h = Harness::new(fx);
    let bob = Owner {
        identity: "/O=Grid/CN=Bob".to_string(),
        ..Fixture::owner()
    };
    for id in ["a1", "a2", "a3"] {
        h.submit_owned(id, Fixture::owner());
    }
    h.submit_owned("b1", bob);
    h.tick();
    h.tick();

    assert_eq!(h.state("a1"), JobState::Preparing);
    assert_eq!(h.state("a2"), JobState::Preparing);
    assert_eq!(h.state("a3"), JobState::Accepted);
    assert!(h.job("a3").pending);
    assert_eq!(h.state("b1"), JobState::Preparing, "other owners are not held");
    assert_eq!(h.sm.counters().owner_processing(&Fixture::owner().identity), 2);
}

#[test]
fn job_without_state_is_dropped_until_it_has_one() {
    let mut h = Harness::new(Fixture::new());
    let desc = h.fx.description("j1", vec![], vec![]);
    let id = h.fx.submit("j1", &desc);
    h.tick();
    assert!(h.sm.job(&id).is_none());

    h.fx.store.write_state(&id, JobState::Accepted).unwrap();
    h.tick();
    assert_eq!(h.state("j1"), JobState::Accepted);
}

#[test]
fn unreadable_state_is_ignored_for_good() {
    let mut h = Harness::new(Fixture::new());
    std::fs::write(
        h.fx.config.control_dir.join("job.j1.status"),
        "SOMETHING\n",
    )
    .unwrap();
    h.tick();
    h.tick();
    assert!(h.sm.job(&JobId::new("j1")).is_none());
    assert!(h.sm.ignored.contains(&JobId::new("j1")));
}

#[test]
fn staging_job_is_resubmitted_after_restart() {
    let mut h = Harness::new(Fixture::new());
    h.fx.job("j1", JobState::Preparing, vec![remote("/in")], vec![]);
    h.tick();
    assert_eq!(h.state("j1"), JobState::Preparing);
    assert!(h.job("j1").staging_submitted);
    h.stage();
    assert_eq!(h.scheduler.submitted().len(), 1);
}

#[test]
fn failed_batch_job_keeps_only_preserved_outputs() {
    let mut h = Harness::new(Fixture::new());
    let mut kept = FileEntry::remote("/o2", "srm://se/o2");
    kept.preserve = true;
    h.fx.job(
        "j1",
        JobState::InBatchSystem,
        vec![],
        vec![
            FileEntry::remote("/o1", "srm://se/o1"),
            kept.clone(),
            FileEntry::local("/log"),
        ],
    );
    h.tick();
    h.batch.set_status("j1", BatchStatus::Done { exit_code: 1 });
    h.tick();

    assert_eq!(h.state("j1"), JobState::Finishing);
    assert!(h.job("j1").failure_text().contains("exit code 1"));
    let outputs = h.fx.list(&JobId::new("j1"), FileList::Output);
    assert_eq!(outputs, vec![kept, FileEntry::local("/log")]);
    assert_eq!(h.job("j1").local.as_ref().unwrap().uploads, 0);
}

#[test]
fn failing_hook_fails_the_stage() {
    let mut h =
        Harness::new(Fixture::new()).with_hooks(Arc::new(FailAt(JobState::Submitting)));
    h.submit("j1", vec![], vec![], true);
    h.tick();
    h.tick();
    h.stage();
    h.tick();
    assert_eq!(h.state("j1"), JobState::Finishing);
    assert!(
        h.job("j1")
            .failure_text()
            .contains("Plugin at state SUBMITTING failed")
    );
}

#[test]
fn failing_hook_at_finished_is_forced_through() {
    let mut h = Harness::new(Fixture::new()).with_hooks(Arc::new(FailAt(JobState::Finished)));
    h.submit("j1", vec![], vec![], false);
    for _ in 0..3 {
        h.tick();
        h.stage();
    }
    h.tick();
    assert_eq!(h.state("j1"), JobState::Finished);
    assert_eq!(h.stored_state("j1"), Some(JobState::Finished));
    assert!(h.job("j1").is_failed());
}

#[test]
fn upload_failure_retries_through_batch_state() {
    let mut h = Harness::new(Fixture::new());
    h.fx.job(
        "j1",
        JobState::Finishing,
        vec![],
        vec![FileEntry::remote("/out", "srm://se/out")],
    );
    h.batch.set_status("j1", BatchStatus::Done { exit_code: 0 });
    h.tick();
    h.stage();
    h.scheduler
        .finish("/out", DtrStatus::Failed, Some(DtrError::transient("busy")));
    h.stage();
    h.tick();

    assert_eq!(h.state("j1"), JobState::InBatchSystem);
    assert_eq!(h.job("j1").retries_left, 9);
    h.tick();
    assert_eq!(h.state("j1"), JobState::InBatchSystem, "back-off");

    h.clock.advance(chrono::Duration::hours(1));
    h.tick();
    assert_eq!(h.state("j1"), JobState::Finishing);
    assert_eq!(h.job("j1").retries_left, 9);
}

#[test]
fn rerun_after_download_failure_restarts_from_accepted() {
    let mut h = Harness::new(Fixture::new());
    preparing(&mut h, "j1", 10);
    h.scheduler
        .finish("/in", DtrStatus::Failed, Some(DtrError::permanent("no such file")));
    h.stage();
    for _ in 0..3 {
        h.tick();
        h.stage();
    }
    assert_eq!(h.state("j1"), JobState::Finished);
    assert!(h.job("j1").is_failed());

    h.request("j1", Request::Rerun);
    h.tick();
    let job = h.job("j1");
    assert_eq!(job.state, JobState::Accepted);
    assert!(!job.is_failed());
    assert_eq!(job.local.as_ref().unwrap().reruns_left, 4);
    assert_eq!(job.local.as_ref().unwrap().failed_state, None);
    assert_eq!(h.fx.store.read_failed(&job.id).unwrap(), None);
    assert_eq!(h.fx.list(&job.id, FileList::Input), vec![remote("/in")]);
}

#[test]
fn rerun_after_upload_failure_skips_uploaded_files() {
    let mut h = Harness::new(Fixture::new());
    h.fx.job(
        "j1",
        JobState::Finishing,
        vec![],
        vec![
            FileEntry::remote("/out1", "srm://se/out1"),
            FileEntry::remote("/out2", "srm://se/out2"),
        ],
    );
    h.tick();
    h.stage();
    h.scheduler.finish("/out1", DtrStatus::Done, None);
    h.scheduler
        .finish("/out2", DtrStatus::Failed, Some(DtrError::permanent("denied")));
    h.stage();
    h.tick();
    assert_eq!(h.state("j1"), JobState::Finished);

    h.request("j1", Request::Rerun);
    h.tick();
    assert_eq!(h.state("j1"), JobState::InBatchSystem);
    let outputs = h.fx.list(&JobId::new("j1"), FileList::Output);
    assert_eq!(outputs, vec![FileEntry::remote("/out2", "srm://se/out2")]);
}

#[test]
fn rerun_of_successful_job_is_refused() {
    let mut h = Harness::new(Fixture::new());
    h.submit("j1", vec![], vec![], false);
    for _ in 0..4 {
        h.tick();
        h.stage();
    }
    assert_eq!(h.state("j1"), JobState::Finished);
    h.request("j1", Request::Rerun);
    h.tick();
    assert_eq!(h.state("j1"), JobState::Finished);
    assert!(
        !h.fx
            .store
            .has_request(&JobId::new("j1"), Request::Rerun)
            .unwrap()
    );
}

#[test]
fn finished_job_ages_into_deleted_then_disappears() {
    let mut h = Harness::new(Fixture::new());
    h.fx.job("j1", JobState::Finished, vec![], vec![]);
    h.tick();
    h.tick();

    h.clock.advance(chrono::Duration::days(7) + chrono::Duration::seconds(1));
    h.tick();
    let id = JobId::new("j1");
    assert_eq!(h.state("j1"), JobState::Deleted);
    assert_eq!(h.stored_state("j1"), Some(JobState::Deleted));
    assert!(h.fx.store.read_description(&id).is_err());

    h.clock.advance(chrono::Duration::days(30) + chrono::Duration::seconds(1));
    h.tick();
    assert!(h.sm.job(&id).is_none());
    assert!(h.fx.store.list_jobs().unwrap().is_empty());
}

#[test]
fn purge_finished_skips_the_trace() {
    let mut fx = Fixture::new();
    fx.config.retention.purge_finished = true;
    fx.config.retention.keep_finished_secs = 0;
    let mut h = Harness::new(fx);
    h.fx.job("j1", JobState::Finished, vec![], vec![]);
    h.tick();
    h.tick();
    assert!(h.sm.job(&JobId::new("j1")).is_none());
}

#[test]
fn clean_request_removes_finished_job() {
    let mut h = Harness::new(Fixture::new());
    h.fx.job("j1", JobState::Finished, vec![], vec![]);
    h.tick();
    h.request("j1", Request::Clean);
    h.tick();
    assert!(h.sm.job(&JobId::new("j1")).is_none());
    assert!(h.fx.store.list_jobs().unwrap().is_empty());
}
