//! App - アプリケーション層
//!
//! ports を組み合わせてステージングサービスを実装します。
//!
//! # 主要コンポーネント
//! - **Generator**: ファイルリスト → DTR、完了の集計
//! - **JobStateMachine**: ジョブの状態遷移とリミット
//! - **Service / ServiceBuilder**: ワイヤリングとスケジューリングループ
//! - **status**: 読み取り専用の集計

pub mod builder;
pub mod counters;
pub mod generator;
pub mod retry;
pub mod service;
pub mod shares;
pub mod state_machine;
pub mod status;

pub use self::builder::{BuildError, ServiceBuilder};
pub use self::generator::{Generator, GeneratorHandle, UploadStatus};
pub use self::service::Service;
pub use self::state_machine::JobStateMachine;
pub use self::status::{JobCounts, JobStatus, StatusReport};
