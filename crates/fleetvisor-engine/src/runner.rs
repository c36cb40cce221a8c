//! Runner - プロセスのライフサイクルを実行する唯一の主体
//!
//! 状態遷移とコンテナハンドルの付け替えはすべてこのモジュールを通ります。
//! `*_locked` 系のメソッドは呼び出し側が対象プロセスの排他区間
//! （[`EntryGuard`]）を保持していることを前提とします。

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::monitor::{self, ExitEvent};
use crate::notify::{LifecycleEvent, NotificationSink};
use crate::registry::{Entry, EntryGuard, Registry};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use fleetvisor_container::{ContainerBackend, ContainerError, ContainerSpec, wait_until_stopped};
use fleetvisor_core::{ContainerHandle, EngineSettings, ProcessRecord, ProcessState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// 再起動の理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartReason {
    /// 手動操作（クラッシュ統計をリセット）
    Manual,
    /// クラッシュからの復旧（クラッシュ回数を加算）
    Crash,
    /// スケジュール再起動（クラッシュ統計に触れない）
    Scheduled,
    /// イメージ更新に伴う再デプロイ（クラッシュ統計に触れない）
    Redeploy,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::Manual => write!(f, "manual"),
            RestartReason::Crash => write!(f, "crash"),
            RestartReason::Scheduled => write!(f, "scheduled"),
            RestartReason::Redeploy => write!(f, "redeploy"),
        }
    }
}

/// stop の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// 停止処理を行った
    Stopped,
    /// 既に停止していた（何もしていない）
    AlreadyStopped,
}

pub struct Runner {
    registry: Arc<Registry>,
    backend: Arc<dyn ContainerBackend>,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
}

impl Runner {
    pub fn new(
        registry: Arc<Registry>,
        backend: Arc<dyn ContainerBackend>,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
        exit_tx: mpsc::UnboundedSender<ExitEvent>,
    ) -> Self {
        Self {
            registry,
            backend,
            store,
            sink,
            clock,
            settings,
            exit_tx,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn ContainerBackend> {
        &self.backend
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn notify(&self, event: LifecycleEvent) {
        self.sink.notify(&event);
    }

    /// 外部から終了を通知する（バックエンドのイベント購読など）
    pub fn report_exit(&self, event: ExitEvent) {
        if self.exit_tx.send(event).is_err() {
            tracing::debug!("monitor is not running; exit event dropped");
        }
    }

    /// レコードを保存（失敗はログに残すだけ）
    pub(crate) async fn persist(&self, entry: &Entry) {
        if let Err(e) = self.store.save_record(&entry.record).await {
            tracing::error!(process = %entry.name(), error = %e, "failed to persist process record");
        }
    }

    /// 外部コマンド用の排他区間（lock-timeout を適用）
    pub async fn lock(&self, name: &str) -> Result<EntryGuard> {
        self.registry.lock(name, self.settings.lock_timeout).await
    }

    pub(crate) fn transition(&self, entry: &mut Entry, to: ProcessState) -> Result<()> {
        entry.record.transition(to, self.now())?;
        Ok(())
    }

    // ========================================================================
    // 外部コマンド
    // ========================================================================

    /// プロセスを起動（Stopped / Crashed からのみ）
    pub async fn start(&self, name: &str) -> Result<()> {
        let mut entry = self.lock(name).await?;
        self.start_locked(&mut entry).await
    }

    /// プロセスを停止（停止済みなら何もしない）
    pub async fn stop(&self, name: &str) -> Result<StopOutcome> {
        let mut entry = self.lock(name).await?;
        self.stop_locked(&mut entry).await
    }

    /// 停止してから起動し直す
    pub async fn restart(&self, name: &str, reason: RestartReason) -> Result<()> {
        let mut entry = self.lock(name).await?;
        self.restart_locked(&mut entry, reason).await
    }

    /// 強制停止してからレコードを削除
    pub async fn remove(&self, name: &str) -> Result<ProcessRecord> {
        let mut entry = self.lock(name).await?;
        self.remove_locked(&mut entry).await
    }

    /// イメージを差し替えて再デプロイ
    ///
    /// 実行中なら再起動し true を返す。それ以外はイメージの更新だけ行い、
    /// 次回の起動から反映される。
    /// 再起動に失敗した場合はクラッシュとしてポリシーに引き渡す。
    pub async fn redeploy(self: &Arc<Self>, name: &str, image_ref: Option<String>) -> Result<bool> {
        let mut entry = self.lock(name).await?;
        if let Some(image_ref) = image_ref {
            tracing::info!(process = %name, image = %image_ref, "image updated");
            entry.record.image_ref = image_ref;
        }

        match entry.record.state() {
            ProcessState::Running | ProcessState::Starting => {
                self.notify(LifecycleEvent::RestartScheduled {
                    name: name.to_string(),
                    reason: RestartReason::Redeploy,
                });
                if let Err(e) = self
                    .restart_locked(&mut entry, RestartReason::Redeploy)
                    .await
                {
                    if entry.record.state() == ProcessState::Crashed {
                        monitor::apply_crash_policy(self, &mut entry).await;
                    }
                    return Err(e);
                }
                Ok(true)
            }
            _ => {
                self.persist(&entry).await;
                Ok(false)
            }
        }
    }

    // ========================================================================
    // 排他区間内の操作
    // ========================================================================

    /// 手動起動
    pub(crate) async fn start_locked(&self, entry: &mut Entry) -> Result<()> {
        match entry.record.state() {
            ProcessState::Stopped | ProcessState::Crashed => {}
            state @ (ProcessState::Starting | ProcessState::Running) => {
                return Err(EngineError::AlreadyRunning {
                    name: entry.name().to_string(),
                    state,
                });
            }
            state => {
                return Err(EngineError::InvalidTransition {
                    name: entry.name().to_string(),
                    from: state,
                    to: ProcessState::Starting,
                });
            }
        }

        entry.record.reset_crash_accounting();
        self.launch(entry).await
    }

    /// コンテナを作成して起動する
    ///
    /// Stopped / Crashed / Backoff から呼ばれる。失敗時は Crashed に遷移して
    /// エラーを返す（再試行は呼び出し側の判断）。
    pub(crate) async fn launch(&self, entry: &mut Entry) -> Result<()> {
        let name = entry.name().to_string();
        entry.cancel_backoff();
        self.transition(entry, ProcessState::Starting)?;

        let spec = ContainerSpec::from_record(&entry.record);
        let handle = match self.backend.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail_start(entry, None, e).await),
        };

        if let Err(e) = entry.record.attach_container(handle.clone()) {
            self.destroy_container(&name, &handle).await;
            return Err(e.into());
        }

        if let Err(e) = self.backend.start(&handle).await {
            return Err(self.fail_start(entry, Some(handle), e).await);
        }

        self.transition(entry, ProcessState::Running)?;
        self.spawn_watcher(entry, handle.clone());
        self.persist(entry).await;

        self.notify(LifecycleEvent::Started {
            name,
            container: handle.short_id().to_string(),
        });
        Ok(())
    }

    async fn fail_start(
        &self,
        entry: &mut Entry,
        handle: Option<ContainerHandle>,
        err: ContainerError,
    ) -> EngineError {
        let name = entry.name().to_string();
        tracing::warn!(
            process = %name,
            error = %err,
            fatal = err.is_fatal(),
            "failed to start container"
        );

        if let Some(handle) = handle {
            self.destroy_container(&name, &handle).await;
        }
        if let Err(e) = self.transition(entry, ProcessState::Crashed) {
            tracing::error!(process = %name, error = %e, "unexpected state after failed start");
        }
        entry.record.last_exit_code = None;
        self.persist(entry).await;

        self.notify(LifecycleEvent::Crashed {
            name: name.clone(),
            exit_code: None,
        });
        EngineError::backend(&name, err)
    }

    /// 停止処理
    pub(crate) async fn stop_locked(&self, entry: &mut Entry) -> Result<StopOutcome> {
        let name = entry.name().to_string();

        match entry.record.state() {
            ProcessState::Stopped => {
                tracing::debug!(process = %name, "already stopped");
                return Ok(StopOutcome::AlreadyStopped);
            }
            ProcessState::Backoff | ProcessState::Crashed => {
                // 保留中の遅延再起動を取り消す
                entry.cancel_backoff();
                self.transition(entry, ProcessState::Stopped)?;
            }
            ProcessState::Starting | ProcessState::Running => {
                self.transition(entry, ProcessState::Stopping)?;
                self.persist(entry).await;
                self.teardown(entry).await?;
                self.transition(entry, ProcessState::Stopped)?;
            }
            ProcessState::Stopping => {
                // 前回の停止が途中で失敗している
                tracing::info!(process = %name, "resuming interrupted stop");
                self.teardown(entry).await?;
                self.transition(entry, ProcessState::Stopped)?;
            }
        }

        self.persist(entry).await;
        self.notify(LifecycleEvent::Stopped { name });
        Ok(StopOutcome::Stopped)
    }

    /// 猶予付きで停止し、必要なら強制終了してからコンテナを削除
    ///
    /// 失敗した場合はハンドルを保持したまま Stopping に留まる。
    async fn teardown(&self, entry: &mut Entry) -> Result<()> {
        let name = entry.name().to_string();
        entry.cancel_watcher();

        let Some(handle) = entry.record.container_handle().cloned() else {
            return Ok(());
        };

        let grace = self.settings.grace_period;
        let deadline = Instant::now().checked_add(grace);

        if let Err(e) = self.backend.signal_stop(&handle, grace).await {
            tracing::warn!(process = %name, error = %e, "graceful stop failed; forcing");
        }

        let remaining = deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(grace);
        let exited = match wait_until_stopped(self.backend.as_ref(), &handle, remaining).await {
            Ok(exited) => exited,
            Err(e) => {
                tracing::warn!(process = %name, error = %e, "could not confirm container exit");
                false
            }
        };

        if !exited {
            tracing::warn!(
                process = %name,
                grace_secs = grace.as_secs(),
                "container did not exit within grace period; killing"
            );
            self.backend
                .force_kill(&handle)
                .await
                .map_err(|e| EngineError::backend(&name, e))?;
        }

        self.backend
            .remove(&handle)
            .await
            .map_err(|e| EngineError::backend(&name, e))?;
        tracing::debug!(process = %name, container = %handle, "container removed");
        Ok(())
    }

    /// 停止と起動を1つの排他区間で行う
    pub(crate) async fn restart_locked(&self, entry: &mut Entry, reason: RestartReason) -> Result<()> {
        let now = self.now();
        tracing::info!(process = %entry.name(), reason = %reason, "restarting");

        match reason {
            RestartReason::Manual => entry.record.reset_crash_accounting(),
            RestartReason::Crash => entry.record.record_crash_restart(now),
            RestartReason::Scheduled | RestartReason::Redeploy => {}
        }

        if matches!(
            entry.record.state(),
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        ) && let Err(e) = self.stop_locked(entry).await
        {
            if reason != RestartReason::Manual && entry.record.state() == ProcessState::Stopping {
                self.abandon_teardown(entry).await;
            }
            return Err(e);
        }

        self.launch(entry).await
    }

    /// 停止に失敗したまま Stopping に残ったプロセスを Crashed に落とす
    ///
    /// 自動再起動の途中で使う。コンテナはベストエフォートで片付け、
    /// 以後はクラッシュポリシーに委ねる。
    pub(crate) async fn abandon_teardown(&self, entry: &mut Entry) {
        let name = entry.name().to_string();
        if let Some(handle) = entry.record.container_handle().cloned() {
            self.destroy_container(&name, &handle).await;
        }
        if let Err(e) = self.transition(entry, ProcessState::Crashed) {
            tracing::error!(process = %name, error = %e, "cannot abandon interrupted stop");
            return;
        }
        entry.record.last_exit_code = None;
        self.persist(entry).await;

        tracing::warn!(process = %name, "stop failed during automatic restart; treating as crash");
        self.notify(LifecycleEvent::Crashed {
            name,
            exit_code: None,
        });
    }

    /// 停止できなかった場合は削除しない
    pub(crate) async fn remove_locked(&self, entry: &mut Entry) -> Result<ProcessRecord> {
        let name = entry.name().to_string();
        self.stop_locked(entry).await?;
        self.registry.detach(entry);

        if let Err(e) = self.store.remove_record(&name).await {
            tracing::error!(process = %name, error = %e, "failed to delete persisted record");
        }
        tracing::info!(process = %name, "process removed");
        Ok(entry.record.clone())
    }

    /// 予期しない終了を記録して Crashed にする
    pub(crate) async fn mark_crashed(&self, entry: &mut Entry, exit_code: Option<i64>) {
        let name = entry.name().to_string();
        entry.cancel_watcher();

        if let Some(handle) = entry.record.container_handle().cloned() {
            // 終了済みコンテナの片付け（失敗しても次の create で同名が除去される）
            if let Err(e) = self.backend.remove(&handle).await {
                tracing::debug!(process = %name, error = %e, "failed to remove exited container");
            }
        }

        if let Err(e) = self.transition(entry, ProcessState::Crashed) {
            tracing::error!(process = %name, error = %e, "cannot mark process as crashed");
            return;
        }
        entry.record.last_exit_code = exit_code;
        self.persist(entry).await;

        self.notify(LifecycleEvent::Crashed { name, exit_code });
    }

    /// 起動時に見つかった実行中コンテナを引き継ぐ
    ///
    /// Stopped / Crashed / Backoff の記録は Starting を経由して Running にする。
    pub(crate) async fn adopt(&self, entry: &mut Entry, handle: ContainerHandle) -> Result<()> {
        match entry.record.state() {
            ProcessState::Running => {}
            ProcessState::Starting => self.transition(entry, ProcessState::Running)?,
            _ => {
                entry.cancel_backoff();
                self.transition(entry, ProcessState::Starting)?;
                self.transition(entry, ProcessState::Running)?;
            }
        }
        entry.record.attach_container(handle.clone())?;
        self.spawn_watcher(entry, handle.clone());
        self.persist(entry).await;

        tracing::info!(process = %entry.name(), container = %handle, "adopted running container");
        self.notify(LifecycleEvent::Started {
            name: entry.name().to_string(),
            container: handle.short_id().to_string(),
        });
        Ok(())
    }

    /// コンテナを即座に止めて削除する（ベストエフォート）
    pub(crate) async fn destroy_container(&self, name: &str, handle: &ContainerHandle) {
        if let Err(e) = self.backend.force_kill(handle).await {
            tracing::warn!(process = %name, container = %handle, error = %e, "force kill failed");
        }
        if let Err(e) = self.backend.remove(handle).await {
            tracing::warn!(process = %name, container = %handle, error = %e, "container removal failed");
        }
    }

    fn spawn_watcher(&self, entry: &mut Entry, handle: ContainerHandle) {
        entry.cancel_watcher();
        entry.watcher = Some(monitor::spawn_watcher(
            self.backend.clone(),
            entry.name().to_string(),
            handle,
            self.settings.exit_detection,
            self.settings.poll_interval,
            self.exit_tx.clone(),
        ));
    }
}
