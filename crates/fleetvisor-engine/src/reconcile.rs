//! 起動時の突き合わせ
//!
//! 永続化されたレコードとバックエンド上の実際のコンテナを比較し、
//! 食い違いを解消します。
//!
//! - 記録に無いプロセスのコンテナ（孤児）は強制停止して削除
//! - 終了済みのコンテナは削除
//! - 実行中コンテナは Adopt なら引き継ぎ、ForceStop なら停止する
//!   （Stopped / Crashed / Backoff の記録でも同様。Stopping は常に停止）
//! - 実体が無い Running/Starting は Crashed としてクラッシュポリシーへ
//! - Backoff は残り時間でタイマーを張り直す
//! - スケジュールは永続化された間隔と最終発火時刻から再計算

use crate::error::{EngineError, Result};
use crate::monitor;
use crate::registry::Entry;
use crate::runner::Runner;
use crate::scheduler::Scheduler;
use fleetvisor_container::ManagedContainer;
use fleetvisor_core::{ProcessState, ReconcilePolicy};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// 突き合わせの結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// 実行中コンテナを引き継いだプロセス
    pub adopted: Vec<String>,
    /// 実体が見つからず Crashed にしたプロセス
    pub crashed: Vec<String>,
    /// 強制停止したコンテナ（短縮ID）
    pub force_stopped: Vec<String>,
    /// 削除した終了済みコンテナの数
    pub cleaned: usize,
    /// 遅延再起動タイマーを張り直したプロセス
    pub backoff_rearmed: Vec<String>,
    /// キューに載せたスケジュールの数
    pub schedules: usize,
}

pub(crate) async fn reconcile(runner: &Arc<Runner>, scheduler: &Scheduler) -> Result<ReconcileReport> {
    let containers = runner
        .backend()
        .list_managed()
        .await
        .map_err(|e| EngineError::backend("*", e))?;

    let mut by_process: HashMap<String, Vec<ManagedContainer>> = HashMap::new();
    for container in containers {
        by_process
            .entry(container.process.clone())
            .or_default()
            .push(container);
    }

    let mut report = ReconcileReport::default();

    for name in runner.registry().names() {
        let Ok(mut entry) = runner.registry().lock(&name, None).await else {
            continue;
        };
        let containers = by_process.remove(&name).unwrap_or_default();
        reconcile_entry(runner, scheduler, &mut entry, containers, &mut report).await;
    }

    // 残ったものは記録に無いプロセスのコンテナ
    for (process, containers) in by_process {
        for container in containers {
            tracing::warn!(
                process = %process,
                container = %container.handle,
                running = container.running,
                "orphaned container found; removing"
            );
            runner.destroy_container(&process, &container.handle).await;
            if container.running {
                report.force_stopped.push(container.handle.short_id().to_string());
            } else {
                report.cleaned += 1;
            }
        }
    }

    tracing::info!(
        adopted = report.adopted.len(),
        crashed = report.crashed.len(),
        force_stopped = report.force_stopped.len(),
        cleaned = report.cleaned,
        backoff_rearmed = report.backoff_rearmed.len(),
        schedules = report.schedules,
        "reconciliation complete"
    );
    Ok(report)
}

async fn reconcile_entry(
    runner: &Arc<Runner>,
    scheduler: &Scheduler,
    entry: &mut Entry,
    containers: Vec<ManagedContainer>,
    report: &mut ReconcileReport,
) {
    let name = entry.name().to_string();
    let state = entry.record.state();

    let (running, exited): (Vec<_>, Vec<_>) = containers.into_iter().partition(|c| c.running);
    for container in exited {
        if let Err(e) = runner.backend().remove(&container.handle).await {
            tracing::debug!(process = %name, container = %container.handle, error = %e, "failed to remove exited container");
        }
        report.cleaned += 1;
    }

    if let Some(schedule) = entry.record.schedule.as_mut() {
        schedule.recompute();
        scheduler.upsert(&name, schedule.next_fire_at);
        report.schedules += 1;
    }

    // 停止途中のプロセスのコンテナは引き継がない
    let adopt =
        state != ProcessState::Stopping && runner.settings().reconcile == ReconcilePolicy::Adopt;

    let mut running = running.into_iter();
    let mut adopted = false;
    if adopt
        && let Some(container) = running.next()
    {
        match runner.adopt(entry, container.handle.clone()).await {
            Ok(()) => {
                adopted = true;
                report.adopted.push(name.clone());
            }
            Err(e) => {
                tracing::warn!(process = %name, error = %e, "could not adopt container");
                runner.destroy_container(&name, &container.handle).await;
                report.force_stopped.push(container.handle.short_id().to_string());
            }
        }
    }
    for container in running {
        tracing::warn!(process = %name, container = %container.handle, "unexpected running container; force-stopping");
        runner.destroy_container(&name, &container.handle).await;
        report.force_stopped.push(container.handle.short_id().to_string());
    }

    match state {
        _ if adopted => {}
        ProcessState::Starting | ProcessState::Running => {
            tracing::warn!(process = %name, state = %state, "recorded container is gone");
            runner.mark_crashed(entry, None).await;
            report.crashed.push(name.clone());
            monitor::apply_crash_policy(runner, entry).await;
        }
        ProcessState::Stopping => {
            if let Err(e) = runner.transition(entry, ProcessState::Stopped) {
                tracing::error!(process = %name, error = %e, "cannot finish interrupted stop");
            }
        }
        ProcessState::Backoff => {
            let attempt = entry.record.backoff_attempts.max(1);
            let delay = runner.settings().backoff.delay_for_attempt(attempt);
            let elapsed = (runner.now() - entry.record.last_transition_at())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let remaining = delay.saturating_sub(elapsed);

            tracing::info!(process = %name, remaining_secs = remaining.as_secs(), "re-arming backoff timer");
            monitor::arm_backoff(runner, entry, remaining);
            report.backoff_rearmed.push(name.clone());
        }
        _ => {}
    }

    runner.persist(entry).await;
}
