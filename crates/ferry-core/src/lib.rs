//! ferry-core
//!
//! Data-staging service for batch jobs: input files are downloaded into a
//! job's session directory before the job runs, and its outputs are uploaded
//! afterwards.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, file lists, DTR, job, errors）
//! - **ports**: 抽象化レイヤー（JobStore, TransferScheduler, BatchSystem, CacheReleaser, HookRunner, Clock）
//! - **app**: アプリケーションロジック（Generator, JobStateMachine, Service）
//! - **impls**: ports の実装（ファイルシステム、ローカル転送、fork 実行、シェルフック）
//! - **config** / **error**: 設定とエラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::FerryError;
