//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **FsJobStore**: コントロールディレクトリ上のジョブ記録
//! - **LocalTransferScheduler**: file:// ロケータ間のコピー（キャッシュ付き）
//! - **ForkBatch**: セッションディレクトリでの直接実行
//! - **ShellHooks**: 状態遷移時のシェルコマンド

pub mod fork_batch;
pub mod fs_store;
pub mod local_transfer;
pub mod shell_hooks;

pub use self::fork_batch::ForkBatch;
pub use self::fs_store::FsJobStore;
pub use self::local_transfer::LocalTransferScheduler;
pub use self::shell_hooks::ShellHooks;
