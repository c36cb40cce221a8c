//! FleetVisor Core
//!
//! 管理対象プロセス（コンテナ）のデータモデル、状態遷移、
//! 設定ファイル（KDL）のパーサーを提供します。

pub mod duration;
pub mod envfile;
pub mod error;
pub mod model;
pub mod parser;

pub use duration::*;
pub use envfile::*;
pub use error::*;
pub use model::*;
pub use parser::*;
