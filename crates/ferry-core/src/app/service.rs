//! Service - スケジューリングループ
//!
//! One pass of the state machine per wake-up. The loop wakes when the
//! Generator reports a finished stage, when the wake-up period runs out, or
//! when shutdown is requested. A pass does synchronous record I/O and runs
//! hooks, so it runs on a blocking thread.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::generator::{Generator, GeneratorHandle};
use super::state_machine::JobStateMachine;
use super::status::JobCounts;

pub struct Service {
    machine: JobStateMachine,
    generator: Arc<Generator>,
    wakeup_period: Duration,
}

impl Service {
    pub(crate) fn new(
        machine: JobStateMachine,
        generator: Arc<Generator>,
        wakeup_period: Duration,
    ) -> Self {
        Self {
            machine,
            generator,
            wakeup_period,
        }
    }

    pub fn machine(&self) -> &JobStateMachine {
        &self.machine
    }

    /// Scan the control directory and run one pass.
    pub fn tick(&mut self) {
        match self.machine.scan() {
            Ok(0) => {}
            Ok(n) => tracing::info!(new_jobs = n, "picked up jobs"),
            Err(e) => tracing::error!(error = %e, "can't scan control directory"),
        }
        self.machine.run_pass();
        let counts = JobCounts::from_jobs(self.machine.jobs());
        tracing::debug!(
            accepted = counts.accepted,
            preparing = counts.preparing,
            running = counts.submitting + counts.in_batch_system + counts.canceling,
            finishing = counts.finishing,
            finished = counts.finished,
            pending = counts.pending,
            staging = self.generator.staging_count(),
            "pass done"
        );
    }

    /// Run until `shutdown` turns true, then stop the Generator worker,
    /// which drains the transfer scheduler before it returns.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let worker = GeneratorHandle::spawn(Arc::clone(&self.generator));
        let wake = self.generator.wake();
        let period = self.wakeup_period;
        tracing::info!(wakeup_secs = period.as_secs(), "service started");

        let mut service = self;
        loop {
            if *shutdown.borrow() {
                break;
            }
            service = match tokio::task::spawn_blocking(move || {
                service.tick();
                service
            })
            .await
            {
                Ok(service) => service,
                Err(e) => {
                    tracing::error!(error = %e, "scheduling pass panicked, stopping");
                    break;
                }
            };
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = wake.notified() => {}
                _ = tokio::time::sleep(period) => {}
            }
        }

        tracing::info!("service shutting down");
        worker.shutdown_and_join().await;
        tracing::info!("service stopped");
    }
}
