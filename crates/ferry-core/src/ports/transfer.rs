//! TransferScheduler port - 転送エンジンとの境界
//!
//! The scheduler executes DTRs with its own concurrency and hands every DTR
//! back exactly once, in a terminal status, through a [`DtrSink`].
//!
//! # 設計
//! - completion はコールバックではなくチャネルで返す
//! - Generator 側の受信キューと同じチャネルを共有する

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{JobId, TransferRequest};
use crate::error::FerryError;

#[async_trait]
pub trait TransferScheduler: Send + Sync {
    /// Accept a DTR. An `Err` means the DTR will never be posted back.
    fn submit(&self, dtr: TransferRequest) -> Result<(), FerryError>;

    /// Ask for every DTR of the job to stop. Returns immediately; the DTRs
    /// come back later, usually with status `Cancelled`.
    fn cancel(&self, job_id: &JobId);

    /// Cancel everything and wait until every accepted DTR has been posted.
    async fn shutdown(&self);
}

/// Sending side of the completion channel.
#[derive(Debug, Clone)]
pub struct DtrSink {
    tx: mpsc::UnboundedSender<TransferRequest>,
}

impl DtrSink {
    pub fn post(&self, dtr: TransferRequest) {
        if let Err(e) = self.tx.send(dtr) {
            tracing::warn!(dtr_id = %e.0.id, "completion channel closed, dropping DTR");
        }
    }
}

pub type DtrReceiver = mpsc::UnboundedReceiver<TransferRequest>;

/// Create the completion channel shared by the scheduler and the Generator.
pub fn completion_channel() -> (DtrSink, DtrReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DtrSink { tx }, rx)
}
