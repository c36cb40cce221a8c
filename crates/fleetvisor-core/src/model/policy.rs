//! 再起動ポリシー

use crate::duration::duration_secs;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// クラッシュ時の再起動ポリシー
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// 異常終了時に自動再起動するか
    pub auto_restart: bool,
    /// ウィンドウ内で即時再起動する最大回数（超えるとバックオフ）
    pub max_crash_restarts_per_window: u32,
    /// クラッシュを数えるウィンドウの長さ
    #[serde(with = "duration_secs")]
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_restart: true,
            max_crash_restarts_per_window: 3,
            window: Duration::from_secs(600),
        }
    }
}
