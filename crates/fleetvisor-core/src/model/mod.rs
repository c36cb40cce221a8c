//! モデル定義
//!
//! FleetVisorで使用されるデータモデルを定義します。
//! 各モデルは機能ごとにモジュールに分離されています。

mod definition;
mod policy;
mod process;
mod schedule;
mod settings;

// Re-exports
pub use definition::*;
pub use policy::*;
pub use process::*;
pub use schedule::*;
pub use settings::*;
