//! プロセス定義

use super::policy::RestartPolicy;
use super::schedule::Schedule;
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// コンテナへの不透明な参照（Docker ではコンテナID）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    /// 表示用の短縮ID（先頭12文字）
    pub fn short_id(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}

/// プロセス状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// 停止済み（初期状態）
    Stopped,
    /// 起動中
    Starting,
    /// 実行中
    Running,
    /// 停止中
    Stopping,
    /// 異常終了（再起動判断待ち）
    Crashed,
    /// 遅延再起動待ち
    Backoff,
}

impl ProcessState {
    /// 状態遷移表
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
                | (Stopping, Crashed)
                | (Crashed, Starting)
                | (Crashed, Backoff)
                | (Crashed, Stopped)
                | (Backoff, Starting)
                | (Backoff, Stopped)
        )
    }

    /// コンテナハンドルを保持しうる状態か
    pub fn holds_container(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Crashed => write!(f, "crashed"),
            ProcessState::Backoff => write!(f, "backoff"),
        }
    }
}

/// ProcessRecord - 管理対象プロセス1つ分の状態
///
/// 名前で一意に識別されます。`state` と `container_handle` は
/// [`ProcessRecord::transition`] / [`ProcessRecord::attach_container`] を
/// 経由してのみ変更できます。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// プロセス名（不変）
    name: String,
    /// コンテナ作成に使うイメージ
    pub image_ref: String,
    /// コンテナに渡す環境変数
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// プロセス状態
    state: ProcessState,
    /// 実行中コンテナ（永続化しない）
    #[serde(skip)]
    container_handle: Option<ContainerHandle>,
    /// 再起動ポリシー
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// 現在のウィンドウ内でのクラッシュ再起動回数
    #[serde(default)]
    pub crash_count: u32,
    /// 現在のクラッシュウィンドウの開始時刻
    #[serde(default)]
    pub window_started_at: Option<DateTime<Utc>>,
    /// 連続バックオフ回数（遅延計算用）
    #[serde(default)]
    pub backoff_attempts: u32,
    /// スケジュール再起動設定
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// 最後に状態が変化した時刻
    last_transition_at: DateTime<Utc>,
    /// 最後に観測した終了コード
    #[serde(default)]
    pub last_exit_code: Option<i64>,
}

impl ProcessRecord {
    /// Stopped 状態で新規作成
    pub fn new(name: impl Into<String>, image_ref: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            image_ref: image_ref.into(),
            env: HashMap::new(),
            state: ProcessState::Stopped,
            container_handle: None,
            restart_policy: RestartPolicy::default(),
            crash_count: 0,
            window_started_at: None,
            backoff_attempts: 0,
            schedule: None,
            last_transition_at: now,
            last_exit_code: None,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn container_handle(&self) -> Option<&ContainerHandle> {
        self.container_handle.as_ref()
    }

    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.last_transition_at
    }

    /// 状態遷移を実行
    ///
    /// コンテナを保持しない状態へ遷移した場合、ハンドルは破棄されます。
    /// 呼び出し側は事前にコンテナを片付けておく必要があります。
    pub fn transition(&mut self, to: ProcessState, at: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                name: self.name.clone(),
                from: self.state,
                to,
            });
        }

        tracing::debug!(process = %self.name, from = %self.state, to = %to, "state transition");
        self.state = to;
        self.last_transition_at = at;
        if !to.holds_container() {
            self.container_handle = None;
        }
        Ok(())
    }

    /// コンテナハンドルを設定
    ///
    /// 既に別のハンドルを保持している場合は拒否します（同一名で
    /// 重複したコンテナを持たない）。
    pub fn attach_container(&mut self, handle: ContainerHandle) -> Result<()> {
        if !self.state.holds_container() {
            return Err(CoreError::InvalidConfig(format!(
                "プロセス '{}' は {} 状態のためコンテナを保持できません",
                self.name, self.state
            )));
        }
        match &self.container_handle {
            Some(existing) if existing != &handle => {
                return Err(CoreError::InvalidConfig(format!(
                    "プロセス '{}' は既にコンテナ {} を保持しています",
                    self.name, existing
                )));
            }
            _ => {}
        }
        self.container_handle = Some(handle);
        Ok(())
    }

    /// クラッシュウィンドウが経過していればカウンタをリセット
    ///
    /// リセットした場合は true を返します。
    pub fn expire_crash_window(&mut self, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.restart_policy.window)
            .unwrap_or(chrono::Duration::MAX);
        match self.window_started_at {
            Some(started) if now.signed_duration_since(started) > window => {
                self.crash_count = 0;
                self.window_started_at = None;
                self.backoff_attempts = 0;
                true
            }
            _ => false,
        }
    }

    /// クラッシュ再起動を1回記録
    pub fn record_crash_restart(&mut self, now: DateTime<Utc>) {
        if self.window_started_at.is_none() {
            self.window_started_at = Some(now);
        }
        self.crash_count += 1;
    }

    /// 手動操作によるクラッシュ統計のリセット
    pub fn reset_crash_accounting(&mut self) {
        self.crash_count = 0;
        self.window_started_at = None;
        self.backoff_attempts = 0;
    }
}
