//! Engine - 外部から使うための窓口
//!
//! Runner / Monitor / Scheduler を組み立て、バックグラウンドの
//! 監視ループとスケジュールループを起動します。

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::monitor::{ExitEvent, Monitor};
use crate::notify::NotificationSink;
use crate::reconcile::{self, ReconcileReport};
use crate::registry::Registry;
use crate::runner::{RestartReason, Runner, StopOutcome};
use crate::scheduler::Scheduler;
use crate::status::ProcessStatus;
use crate::store::StateStore;
use bytes::Bytes;
use fleetvisor_container::{ContainerBackend, OutputOptions};
use fleetvisor_core::{EngineSettings, Interval, ProcessDefinition, Schedule};
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 設定ファイルとの同期結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// 新しく登録したプロセス
    pub added: Vec<String>,
    /// 設定を反映した既存プロセス
    pub updated: Vec<String>,
    /// 登録済みだが設定ファイルに無いプロセス（そのまま残す）
    pub unmanaged: Vec<String>,
}

pub struct Engine {
    runner: Arc<Runner>,
    scheduler: Arc<Scheduler>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// エンジンを組み立ててループを起動する（tokio ランタイム内で呼ぶこと）
    pub fn new(
        settings: EngineSettings,
        backend: Arc<dyn ContainerBackend>,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let runner = Arc::new(Runner::new(
            Arc::new(Registry::new()),
            backend,
            store,
            sink,
            clock,
            settings,
            exit_tx,
        ));
        let scheduler = Arc::new(Scheduler::new(runner.clone()));

        let tasks = vec![
            tokio::spawn(Monitor::new(runner.clone(), exit_rx).run()),
            tokio::spawn(scheduler.clone().run()),
        ];

        Self {
            runner,
            scheduler,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn settings(&self) -> &EngineSettings {
        self.runner.settings()
    }

    /// 永続化されたレコードを読み込み、実際のコンテナと突き合わせる
    pub async fn recover(&self) -> Result<ReconcileReport> {
        let records = self.runner.store().load().await?;
        tracing::info!(records = records.len(), "recovering persisted processes");

        for record in records {
            let name = record.name().to_string();
            if let Err(e) = self.runner.registry().insert(record) {
                tracing::warn!(process = %name, error = %e, "persisted record skipped");
            }
        }

        reconcile::reconcile(&self.runner, &self.scheduler).await
    }

    /// プロセスを登録（Stopped で作成）
    pub async fn add(&self, definition: &ProcessDefinition) -> Result<()> {
        let now = self.runner.now();
        let mut record = definition.to_record(now);
        record.schedule = definition
            .schedule
            .map(|interval| Schedule::new(interval, now));

        let slot = self.runner.registry().insert(record)?;
        let entry = slot.lock().await;
        self.runner.persist(&entry).await;
        if let Some(schedule) = &entry.record.schedule {
            self.scheduler.upsert(&definition.name, schedule.next_fire_at);
        }

        tracing::info!(process = %definition.name, image = %definition.image_ref, "process added");
        Ok(())
    }

    /// 設定ファイルの定義を反映
    ///
    /// 既存プロセスは image / env / restart ポリシーだけを更新し、状態には
    /// 触れない（実行中なら次回の起動から反映）。スケジュールは定義側の
    /// 間隔が変わった場合のみ張り直す。
    pub async fn sync_definitions(&self, definitions: &[ProcessDefinition]) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        for definition in definitions {
            let name = &definition.name;
            if !self.runner.registry().contains(name) {
                self.add(definition).await?;
                report.added.push(name.clone());
                continue;
            }

            let mut entry = self.runner.registry().lock(name, None).await?;
            definition.apply_to(&mut entry.record);

            let current = entry.record.schedule.as_ref().map(|s| s.interval);
            if let Some(interval) = definition.schedule
                && current != Some(interval)
            {
                let schedule = Schedule::new(interval, self.runner.now());
                self.scheduler.upsert(name, schedule.next_fire_at);
                entry.record.schedule = Some(schedule);
                tracing::info!(process = %name, interval = %interval, "schedule updated from config");
            }

            self.runner.persist(&entry).await;
            report.updated.push(name.clone());
        }

        report.unmanaged = self
            .runner
            .registry()
            .names()
            .into_iter()
            .filter(|name| !definitions.iter().any(|d| &d.name == name))
            .collect();
        for name in &report.unmanaged {
            tracing::debug!(process = %name, "process not in config; left as is");
        }

        Ok(report)
    }

    /// 強制停止してから登録を削除
    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut entry = self.runner.lock(name).await?;
        self.runner.remove_locked(&mut entry).await?;
        self.scheduler.remove(name);
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.runner.start(name).await
    }

    pub async fn stop(&self, name: &str) -> Result<StopOutcome> {
        self.runner.stop(name).await
    }

    /// 手動再起動（クラッシュ統計をリセット）
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.runner.restart(name, RestartReason::Manual).await
    }

    /// 再デプロイ要求（イメージ差し替え + 実行中なら再起動）
    pub async fn redeploy(&self, name: &str, image_ref: Option<String>) -> Result<bool> {
        self.runner.redeploy(name, image_ref).await
    }

    /// スケジュールを設定（既存のものは位相ごと置き換える）
    pub async fn schedule(&self, name: &str, interval: Interval) -> Result<Schedule> {
        let mut entry = self.runner.lock(name).await?;
        let schedule = Schedule::new(interval, self.runner.now());
        entry.record.schedule = Some(schedule.clone());
        self.runner.persist(&entry).await;
        self.scheduler.upsert(name, schedule.next_fire_at);

        tracing::info!(
            process = %name,
            interval = %interval,
            next_fire_at = %schedule.next_fire_at,
            "schedule set"
        );
        Ok(schedule)
    }

    /// スケジュールを解除（状態には触れない）
    ///
    /// 解除した場合は true、元々無ければ false。
    pub async fn unschedule(&self, name: &str) -> Result<bool> {
        let mut entry = self.runner.lock(name).await?;
        if entry.record.schedule.take().is_none() {
            return Ok(false);
        }
        self.scheduler.remove(name);
        self.runner.persist(&entry).await;

        tracing::info!(process = %name, "schedule cleared");
        Ok(true)
    }

    pub async fn status(&self, name: &str) -> Result<ProcessStatus> {
        let entry = self.runner.lock(name).await?;
        Ok(ProcessStatus::from_record(&entry.record, self.runner.now()))
    }

    /// 全プロセスの状態（名前順）
    pub async fn status_all(&self) -> Vec<ProcessStatus> {
        let mut statuses = Vec::new();
        for name in self.runner.registry().names() {
            if let Ok(entry) = self.runner.registry().lock(&name, None).await {
                statuses.push(ProcessStatus::from_record(&entry.record, self.runner.now()));
            }
        }
        statuses
    }

    /// 実行中コンテナの出力
    pub async fn logs(
        &self,
        name: &str,
        options: &OutputOptions,
    ) -> Result<BoxStream<'static, fleetvisor_container::Result<Bytes>>> {
        let handle = {
            let entry = self.runner.lock(name).await?;
            match entry.record.container_handle() {
                Some(handle) => handle.clone(),
                None => {
                    return Err(EngineError::NotRunning {
                        name: name.to_string(),
                        state: entry.record.state(),
                    });
                }
            }
        };
        Ok(self.runner.backend().stream_output(&handle, options))
    }

    /// 外部で検出した終了を通知する
    pub fn report_exit(&self, event: ExitEvent) {
        self.runner.report_exit(event);
    }

    fn abort_loops(&self) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// ループを止める
    ///
    /// `stop_processes` が true なら全プロセスを停止する。false の場合は
    /// コンテナを動かしたまま監視だけを外し、次回の `recover` で引き継ぐ。
    pub async fn shutdown(&self, stop_processes: bool) {
        self.abort_loops();

        for name in self.runner.registry().names() {
            let Ok(mut entry) = self.runner.registry().lock(&name, None).await else {
                continue;
            };
            if stop_processes {
                if let Err(e) = self.runner.stop_locked(&mut entry).await {
                    tracing::error!(process = %name, error = %e, "failed to stop process during shutdown");
                }
            }
            entry.cancel_tasks();
        }
        tracing::info!(stop_processes, "engine shut down");
    }
}

/// ドロップ時はループと、操作中でないプロセスの監視・遅延再起動を止める
///
/// コンテナ自体は停止しない。操作中だったプロセスのタスクは残り得るので、
/// 確実に止めるには先に `shutdown` を呼ぶこと。
impl Drop for Engine {
    fn drop(&mut self) {
        self.abort_loops();
        let cancelled = self.runner.registry().cancel_idle_tasks();
        tracing::debug!(cancelled, "engine dropped");
    }
}
