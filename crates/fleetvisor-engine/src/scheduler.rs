//! Scheduler - プロセスごとの定期再起動
//!
//! 次回発火時刻の昇順に並んだキューを1つのタスクが監視し、期限が来た
//! プロセスごとに発火タスクを起動します。発火はそのプロセスの排他区間の
//! 中で「記録上の next_fire_at と一致するか」を確認してから行うため、
//! 間隔の変更や解除と競合した古い発火は無害に捨てられます。
//!
//! ロック順序: プロセスの排他区間 → キュー。逆順に取ることはありません。

use crate::monitor;
use crate::notify::LifecycleEvent;
use crate::runner::{RestartReason, Runner};
use chrono::{DateTime, Utc};
use fleetvisor_core::ProcessState;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct ScheduleQueue {
    queue: BTreeSet<(DateTime<Utc>, String)>,
    by_name: HashMap<String, DateTime<Utc>>,
}

impl ScheduleQueue {
    fn upsert(&mut self, name: &str, at: DateTime<Utc>) {
        if let Some(prev) = self.by_name.insert(name.to_string(), at) {
            self.queue.remove(&(prev, name.to_string()));
        }
        self.queue.insert((at, name.to_string()));
    }

    fn remove(&mut self, name: &str) {
        if let Some(prev) = self.by_name.remove(name) {
            self.queue.remove(&(prev, name.to_string()));
        }
    }

    fn peek(&self) -> Option<DateTime<Utc>> {
        self.queue.first().map(|(at, _)| *at)
    }

    fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(String, DateTime<Utc>)> {
        let mut due = Vec::new();
        while let Some((at, _)) = self.queue.first() {
            if *at > now {
                break;
            }
            if let Some((at, name)) = self.queue.pop_first() {
                self.by_name.remove(&name);
                due.push((name, at));
            }
        }
        due
    }
}

pub struct Scheduler {
    runner: Arc<Runner>,
    queue: Mutex<ScheduleQueue>,
    wake: Notify,
}

impl Scheduler {
    pub fn new(runner: Arc<Runner>) -> Self {
        Self {
            runner,
            queue: Mutex::new(ScheduleQueue::default()),
            wake: Notify::new(),
        }
    }

    fn queue(&self) -> MutexGuard<'_, ScheduleQueue> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 次回発火時刻を登録（既存の予定は置き換える）
    pub fn upsert(&self, name: &str, at: DateTime<Utc>) {
        self.queue().upsert(name, at);
        self.wake.notify_one();
    }

    /// 予定を取り消す
    pub fn remove(&self, name: &str) {
        self.queue().remove(name);
        self.wake.notify_one();
    }

    /// キュー上の予定（プロセス名, 発火時刻）を時刻順に返す
    pub fn pending(&self) -> Vec<(String, DateTime<Utc>)> {
        self.queue()
            .queue
            .iter()
            .map(|(at, name)| (name.clone(), *at))
            .collect()
    }

    /// 発火ループ
    pub async fn run(self: Arc<Self>) {
        tracing::debug!("scheduler started");
        loop {
            let next = self.queue().peek();
            let Some(next) = next else {
                self.wake.notified().await;
                continue;
            };

            let now = self.runner.now();
            if next > now {
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.wake.notified() => {}
                }
                continue;
            }

            let due = self.queue().pop_due(now);
            for (name, fired_at) in due {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler.fire(&name, fired_at).await;
                });
            }
        }
    }

    /// 1回分の発火
    async fn fire(&self, name: &str, fired_at: DateTime<Utc>) {
        let runner = &self.runner;
        let Ok(mut entry) = runner.registry().lock(name, None).await else {
            tracing::debug!(process = %name, "scheduled fire for removed process dropped");
            return;
        };

        let Some(schedule) = entry.record.schedule.clone() else {
            tracing::debug!(process = %name, "schedule cleared; fire dropped");
            return;
        };
        if schedule.next_fire_at != fired_at {
            // 間隔が変わった後の古い発火
            self.upsert(name, schedule.next_fire_at);
            return;
        }

        let now = runner.now();
        if let Some(schedule) = entry.record.schedule.as_mut() {
            schedule.advance(fired_at, now);
        }

        if entry.record.state() == ProcessState::Running {
            runner.notify(LifecycleEvent::RestartScheduled {
                name: name.to_string(),
                reason: RestartReason::Scheduled,
            });
            if let Err(e) = runner
                .restart_locked(&mut entry, RestartReason::Scheduled)
                .await
            {
                tracing::warn!(process = %name, error = %e, "scheduled restart failed");
                if entry.record.state() == ProcessState::Crashed {
                    monitor::apply_crash_policy(runner, &mut entry).await;
                }
            }
        } else {
            tracing::info!(
                process = %name,
                state = %entry.record.state(),
                "process not running; scheduled restart skipped"
            );
        }

        runner.persist(&entry).await;
        if let Some(schedule) = &entry.record.schedule {
            tracing::debug!(process = %name, next_fire_at = %schedule.next_fire_at, "next scheduled restart");
            self.upsert(name, schedule.next_fire_at);
        }
    }
}
