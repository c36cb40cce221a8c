//! エンジン設定

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// コンテナ終了の検出方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitDetection {
    /// バックエンドの終了通知を待つ（デフォルト）
    #[default]
    Events,
    /// 一定間隔で inspect してポーリング
    Poll,
}

impl ExitDetection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "events" | "event" => Some(Self::Events),
            "poll" | "polling" => Some(Self::Poll),
            _ => None,
        }
    }
}

/// 起動時に見つかった管理外コンテナの扱い
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcilePolicy {
    /// 記録と一致する実行中コンテナを引き継ぐ（デフォルト）
    #[default]
    Adopt,
    /// 見つかったコンテナはすべて強制停止
    ForceStop,
}

impl ReconcilePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "adopt" => Some(Self::Adopt),
            "force-stop" | "force_stop" => Some(Self::ForceStop),
            _ => None,
        }
    }
}

/// クラッシュループ時の遅延設定（Exponential Backoff）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffSettings {
    /// 初回の遅延
    pub base: Duration,
    /// 遅延の上限
    pub max: Duration,
    /// Exponential倍率
    pub multiplier: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            max: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffSettings {
    /// n 回目（1始まり）のバックオフ遅延
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay.min(self.max.as_secs_f64())).unwrap_or(self.max)
    }
}

/// エンジン全体の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub exit_detection: ExitDetection,
    /// ポーリング方式での inspect 間隔
    pub poll_interval: Duration,
    /// 停止要求から強制終了までの猶予
    pub grace_period: Duration,
    pub reconcile: ReconcilePolicy,
    pub backoff: BackoffSettings,
    /// 外部コマンドが同名の操作完了を待つ上限（None なら無制限に待つ）
    pub lock_timeout: Option<Duration>,
    /// 状態ファイルのパス（None なら設定ディレクトリ）
    pub state_file: Option<PathBuf>,
    /// コンテナ名・ラベルの接頭辞
    pub container_prefix: String,
    /// イメージが無い場合に自動で pull するか
    pub pull_missing_images: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            exit_detection: ExitDetection::default(),
            poll_interval: Duration::from_secs(5),
            grace_period: Duration::from_secs(10),
            reconcile: ReconcilePolicy::default(),
            backoff: BackoffSettings::default(),
            lock_timeout: None,
            state_file: None,
            container_prefix: "fleetvisor".to_string(),
            pull_missing_images: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_calculation() {
        let backoff = BackoffSettings {
            base: Duration::from_secs(10),
            max: Duration::from_secs(100),
            multiplier: 2.0,
        };

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(40));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(80));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(100)); // capped at max
        assert_eq!(backoff.delay_for_attempt(500), Duration::from_secs(100));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(ExitDetection::parse("poll"), Some(ExitDetection::Poll));
        assert_eq!(ExitDetection::parse("Events"), Some(ExitDetection::Events));
        assert_eq!(ExitDetection::parse("inotify"), None);

        assert_eq!(
            ReconcilePolicy::parse("force-stop"),
            Some(ReconcilePolicy::ForceStop)
        );
        assert_eq!(ReconcilePolicy::parse("adopt"), Some(ReconcilePolicy::Adopt));
        assert_eq!(ReconcilePolicy::parse("ignore"), None);
    }

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(5));
        assert_eq!(settings.grace_period, Duration::from_secs(10));
        assert!(settings.lock_timeout.is_none());
        assert_eq!(settings.container_prefix, "fleetvisor");
    }
}
