//! Per-pass job counters.
//!
//! Rebuilt from the job arena at the start of a pass (and again before the
//! pending pass), then updated in place by the handlers as jobs move.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::domain::{Job, JobState};

/// Jobs of one share in one staging direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareLoad {
    /// Jobs staging right now.
    pub active: u32,
    /// Active jobs plus jobs due to enter this direction.
    pub demand: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerCounters {
    /// Non-pending jobs per state, indexed by `JobState::index`.
    per_state: [u32; 9],
    /// Every job past UNDEFINED, pending or not.
    held: u32,
    /// Staging jobs per owner identity.
    per_owner: HashMap<String, u32>,
    preparing: HashMap<String, ShareLoad>,
    finishing: HashMap<String, ShareLoad>,
    /// Reference time for start times and retry back-offs. `None` treats
    /// every job as due.
    now: Option<DateTime<Utc>>,
}

impl SchedulerCounters {
    pub fn recount<'a>(jobs: impl IntoIterator<Item = &'a Job>, now: DateTime<Utc>) -> Self {
        let mut counters = Self {
            now: Some(now),
            ..Self::default()
        };
        for job in jobs {
            counters.add(job);
        }
        counters
    }

    /// Account for `job` in its current state.
    pub fn add(&mut self, job: &Job) {
        self.apply(job, 1);
    }

    /// Stop accounting for `job` in its current state.
    pub fn remove(&mut self, job: &Job) {
        self.apply(job, -1);
    }

    fn apply(&mut self, job: &Job, delta: i32) {
        fn bump(v: &mut u32, delta: i32) {
            *v = v.saturating_add_signed(delta);
        }
        if !job.pending {
            bump(&mut self.per_state[job.state.index()], delta);
        }
        if job.state != JobState::Undefined {
            bump(&mut self.held, delta);
        }

        let share = job.transfer_share().to_string();
        let (loads, active) = match job.state {
            JobState::Preparing if !job.pending => (&mut self.preparing, true),
            JobState::Finishing if !job.pending => (&mut self.finishing, true),
            // about to ask for a slot in a staging direction
            JobState::Accepted if job.pending || self.accepted_due(job) => {
                (&mut self.preparing, false)
            }
            JobState::InBatchSystem if job.pending || self.upload_due(job) => {
                (&mut self.finishing, false)
            }
            _ => return,
        };
        let load = loads.entry(share).or_default();
        bump(&mut load.demand, delta);
        if active {
            bump(&mut load.active, delta);
            bump(
                self.per_owner
                    .entry(job.owner_identity().to_string())
                    .or_default(),
                delta,
            );
        }
    }

    /// Start time and back-off both passed.
    fn accepted_due(&self, job: &Job) -> bool {
        let Some(now) = self.now else {
            return true;
        };
        let started = job
            .local
            .as_ref()
            .and_then(|l| l.start_time)
            .is_none_or(|t| t <= now);
        started && job.next_retry.is_none_or(|t| t <= now)
    }

    /// The batch part is over and a retried upload is due. Jobs still in
    /// the batch system are not known to be done until they are polled.
    fn upload_due(&self, job: &Job) -> bool {
        job.next_retry
            .is_some_and(|t| self.now.is_none_or(|now| t <= now))
    }

    pub fn in_state(&self, state: JobState) -> u32 {
        self.per_state[state.index()]
    }

    /// PREPARING + FINISHING.
    pub fn processing(&self) -> u32 {
        self.in_state(JobState::Preparing) + self.in_state(JobState::Finishing)
    }

    pub fn running(&self) -> u32 {
        JobState::ALL
            .iter()
            .filter(|s| s.is_running())
            .map(|s| self.in_state(*s))
            .sum()
    }

    /// Non-pending jobs held in memory.
    pub fn total(&self) -> u32 {
        self.per_state.iter().sum()
    }

    /// Jobs admitted past UNDEFINED, including the ones held at a gate.
    pub fn held(&self) -> u32 {
        self.held
    }

    pub fn owner_processing(&self, identity: &str) -> u32 {
        self.per_owner.get(identity).copied().unwrap_or(0)
    }

    pub fn preparing_in_share(&self, share: &str) -> u32 {
        self.preparing.get(share).map(|l| l.active).unwrap_or(0)
    }

    pub fn finishing_in_share(&self, share: &str) -> u32 {
        self.finishing.get(share).map(|l| l.active).unwrap_or(0)
    }

    /// Shares with PREPARING demand.
    pub fn preparing_demand(&self) -> impl Iterator<Item = (&str, u32)> {
        Self::demand(&self.preparing)
    }

    /// Shares with FINISHING demand.
    pub fn finishing_demand(&self) -> impl Iterator<Item = (&str, u32)> {
        Self::demand(&self.finishing)
    }

    fn demand(loads: &HashMap<String, ShareLoad>) -> impl Iterator<Item = (&str, u32)> {
        loads
            .iter()
            .filter(|(_, l)| l.demand > 0)
            .map(|(k, l)| (k.as_str(), l.demand))
    }
}
