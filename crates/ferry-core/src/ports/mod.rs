//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（ジョブ記録、転送エンジン、バッチシステム、
//! キャッシュ、フック）へのインターフェースを提供し、実装の詳細を隠蔽します。

pub mod batch;
pub mod cache;
pub mod clock;
pub mod hooks;
pub mod job_store;
pub mod transfer;

pub use self::batch::{BatchStatus, BatchSystem};
pub use self::cache::{CacheReleaser, NoCache};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::hooks::{HookAction, HookRunner, NoHooks};
pub use self::job_store::{JobStore, Request};
pub use self::transfer::{DtrReceiver, DtrSink, TransferScheduler, completion_channel};
