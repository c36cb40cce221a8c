//! FleetVisor Engine
//!
//! 管理プロセスのライフサイクルを担うオーケストレーションエンジン。
//!
//! - [`Runner`]: 状態遷移とコンテナ操作の唯一の実行者
//! - [`Monitor`]: 異常終了の検出とクラッシュポリシーの適用
//! - [`Scheduler`]: プロセスごとの定期再起動
//!
//! 3つの起点（手動コマンド・クラッシュ復旧・スケジュール）はすべて
//! [`Registry`] が持つプロセス名ごとの排他区間を通って Runner に到達します。

pub mod clock;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod reconcile;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod store;

pub use clock::*;
pub use engine::*;
pub use error::*;
pub use monitor::{ExitEvent, Monitor};
pub use notify::*;
pub use reconcile::ReconcileReport;
pub use registry::Registry;
pub use runner::{RestartReason, Runner, StopOutcome};
pub use scheduler::Scheduler;
pub use status::*;
pub use store::*;
