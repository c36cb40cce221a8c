//! コンテナ終了の待機
//!
//! 停止処理での「猶予期間内に終了したか」の確認と、
//! ポーリング方式の終了検出を提供します。

use crate::backend::ContainerBackend;
use crate::error::{ContainerError, Result};
use fleetvisor_core::ContainerHandle;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// 停止確認の最初のポーリング間隔
const INITIAL_POLL: Duration = Duration::from_millis(100);
/// 停止確認のポーリング間隔の上限
const MAX_POLL: Duration = Duration::from_secs(1);

/// コンテナが `timeout` 以内に終了するのを待つ
///
/// # Returns
/// * `Ok(true)` - 終了した（またはコンテナが既に存在しない）
/// * `Ok(false)` - タイムアウトしてもまだ動いている
pub async fn wait_until_stopped(
    backend: &dyn ContainerBackend,
    handle: &ContainerHandle,
    timeout: Duration,
) -> Result<bool> {
    // 表現できないほど長い猶予は期限なしとして扱う
    let deadline = Instant::now().checked_add(timeout);
    let mut delay = INITIAL_POLL;

    loop {
        match backend.inspect(handle).await {
            Ok(inspect) if !inspect.running => return Ok(true),
            Ok(_) => {}
            Err(ContainerError::ContainerNotFound { .. }) => return Ok(true),
            Err(e) => return Err(e),
        }

        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                delay.min(deadline - now)
            }
            None => delay,
        };

        sleep(wait).await;
        delay = (delay * 2).min(MAX_POLL);
    }
}

/// `interval` ごとに inspect し、コンテナの終了を検出する
///
/// 一時的な inspect 失敗は無視して次の周期で再確認する。
/// コンテナが消えていた場合は終了コード不明として扱う。
pub async fn poll_until_exit(
    backend: &dyn ContainerBackend,
    handle: &ContainerHandle,
    interval: Duration,
) -> Option<i64> {
    loop {
        sleep(interval).await;

        match backend.inspect(handle).await {
            Ok(inspect) if !inspect.running => return inspect.exit_code,
            Ok(_) => {}
            Err(ContainerError::ContainerNotFound { .. }) => return None,
            Err(e) => {
                tracing::debug!(container = %handle, error = %e, "liveness poll failed; retrying");
            }
        }
    }
}
