//! ServiceBuilder - サービスの構築とワイヤリング
//!
//! # 設計
//! - 起動時検証（Fail-fast）: 設定の検証と必須コンポーネントの有無を build() でチェック
//! - completion チャネルは builder が作り、送信側を [`ServiceBuilder::sink`] で渡す

use std::sync::Arc;

use super::generator::Generator;
use super::service::Service;
use super::state_machine::JobStateMachine;
use crate::config::Config;
use crate::error::FerryError;
use crate::ports::{
    BatchSystem, CacheReleaser, Clock, DtrReceiver, DtrSink, HookRunner, JobStore, NoCache,
    NoHooks, SystemClock, TransferScheduler, completion_channel,
};

/// Wires the Generator, the state machine and their ports into a [`Service`].
///
/// # 使用例
/// ```ignore
/// let builder = ServiceBuilder::new(config);
/// let transfers = Arc::new(LocalTransferScheduler::new(config.transfer.clone(), builder.sink())?);
/// let service = builder
///     .store(store)
///     .scheduler(transfers)
///     .batch(batch)
///     .build()?;
/// ```
pub struct ServiceBuilder {
    config: Config,
    sink: DtrSink,
    completions: DtrReceiver,
    store: Option<Arc<dyn JobStore>>,
    scheduler: Option<Arc<dyn TransferScheduler>>,
    batch: Option<Arc<dyn BatchSystem>>,
    cache: Arc<dyn CacheReleaser>,
    hooks: Arc<dyn HookRunner>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] FerryError),
    #[error("no {0} configured")]
    Missing(&'static str),
}

impl ServiceBuilder {
    pub fn new(config: Config) -> Self {
        let (sink, completions) = completion_channel();
        Self {
            config,
            sink,
            completions,
            store: None,
            scheduler: None,
            batch: None,
            cache: Arc::new(NoCache),
            hooks: Arc::new(NoHooks),
            clock: Arc::new(SystemClock),
        }
    }

    /// Where the transfer scheduler posts finished DTRs.
    pub fn sink(&self) -> DtrSink {
        self.sink.clone()
    }

    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn TransferScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn batch(mut self, batch: Arc<dyn BatchSystem>) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheReleaser>) -> Self {
        self.cache = cache;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn HookRunner>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Service, BuildError> {
        self.config.validate()?;
        let store = self.store.ok_or(BuildError::Missing("job store"))?;
        let scheduler = self.scheduler.ok_or(BuildError::Missing("transfer scheduler"))?;
        let batch = self.batch.ok_or(BuildError::Missing("batch system"))?;

        let wakeup_period = self.config.staging.wakeup_period();
        let config = Arc::new(self.config);
        let generator = Arc::new(Generator::new(
            Arc::clone(&config),
            Arc::clone(&store),
            scheduler,
            self.sink,
            self.completions,
        ));
        let machine = JobStateMachine::new(config, store, Arc::clone(&generator), batch, self.clock)
            .with_cache(self.cache)
            .with_hooks(self.hooks);
        Ok(Service::new(machine, generator, wakeup_period))
    }
}
