//! Monitor - 異常終了の検出とクラッシュポリシー
//!
//! 各 Running プロセスには終了監視タスク（watcher）が1つ付きます。
//! watcher はコンテナの終了を検出すると [`ExitEvent`] を Monitor に送り、
//! Monitor は対象プロセスの排他区間の中でハンドルを照合してから
//! クラッシュとして処理します。照合に失敗したイベント（停止や再起動で
//! 既に置き換わったコンテナの終了）は破棄されます。

use crate::registry::Entry;
use crate::notify::LifecycleEvent;
use crate::runner::{RestartReason, Runner};
use fleetvisor_container::{ContainerBackend, poll_until_exit};
use fleetvisor_core::{ContainerHandle, ExitDetection, ProcessState};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// コンテナの終了通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub name: String,
    pub handle: ContainerHandle,
    pub exit_code: Option<i64>,
}

/// 終了監視タスクを起動
pub(crate) fn spawn_watcher(
    backend: Arc<dyn ContainerBackend>,
    name: String,
    handle: ContainerHandle,
    detection: ExitDetection,
    poll_interval: Duration,
    exits: mpsc::UnboundedSender<ExitEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let exit_code = match detection {
            ExitDetection::Events => match backend.wait_exit(&handle).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!(
                        process = %name,
                        error = %e,
                        "exit notification unavailable; falling back to polling"
                    );
                    poll_until_exit(backend.as_ref(), &handle, poll_interval).await
                }
            },
            ExitDetection::Poll => poll_until_exit(backend.as_ref(), &handle, poll_interval).await,
        };

        tracing::debug!(process = %name, container = %handle, exit_code = ?exit_code, "container exited");
        let _ = exits.send(ExitEvent {
            name,
            handle,
            exit_code,
        });
    })
}

pub struct Monitor {
    runner: Arc<Runner>,
    events: mpsc::UnboundedReceiver<ExitEvent>,
}

impl Monitor {
    pub fn new(runner: Arc<Runner>, events: mpsc::UnboundedReceiver<ExitEvent>) -> Self {
        Self { runner, events }
    }

    /// 終了イベントを処理し続ける
    ///
    /// プロセスごとの処理は別タスクで行い、あるプロセスの再起動が
    /// 他のプロセスの検出を遅らせないようにする。
    pub async fn run(mut self) {
        tracing::debug!("monitor started");
        while let Some(event) = self.events.recv().await {
            let runner = self.runner.clone();
            tokio::spawn(async move {
                handle_exit(&runner, event).await;
            });
        }
        tracing::debug!("monitor stopped");
    }
}

/// 終了イベント1件を処理
pub(crate) async fn handle_exit(runner: &Arc<Runner>, event: ExitEvent) {
    let mut entry = match runner.registry().lock(&event.name, None).await {
        Ok(entry) => entry,
        Err(_) => {
            tracing::debug!(process = %event.name, "exit event for unknown process discarded");
            return;
        }
    };

    match entry.record.state() {
        ProcessState::Backoff => {
            // 既に遅延再起動が予約済み。記録だけしてタイマーは増やさない
            entry.record.last_exit_code = event.exit_code;
            runner.persist(&entry).await;
            runner.notify(LifecycleEvent::Crashed {
                name: event.name.clone(),
                exit_code: event.exit_code,
            });
            tracing::info!(process = %event.name, "exit recorded while in backoff; restart remains pending");
            return;
        }
        ProcessState::Running if entry.record.container_handle() == Some(&event.handle) => {}
        state => {
            tracing::debug!(
                process = %event.name,
                state = %state,
                container = %event.handle,
                "superseded exit event discarded"
            );
            return;
        }
    }

    tracing::warn!(
        process = %event.name,
        exit_code = ?event.exit_code,
        "container exited unexpectedly"
    );
    runner.mark_crashed(&mut entry, event.exit_code).await;
    apply_crash_policy(runner, &mut entry).await;
}

/// Crashed のプロセスにクラッシュポリシーを適用
///
/// ウィンドウ内の再起動回数が上限未満なら即座に再起動し、
/// 上限に達していれば Backoff に入る。起動自体が失敗した場合も
/// 1回のクラッシュとして数え直す。
pub(crate) async fn apply_crash_policy(runner: &Arc<Runner>, entry: &mut Entry) {
    while entry.record.state() == ProcessState::Crashed {
        let name = entry.name().to_string();
        if entry.record.expire_crash_window(runner.now()) {
            tracing::debug!(process = %name, "crash window elapsed; counters reset");
        }

        let policy = entry.record.restart_policy.clone();
        if !policy.auto_restart {
            tracing::info!(process = %name, "auto restart disabled; leaving process crashed");
            runner.persist(entry).await;
            return;
        }

        if entry.record.crash_count >= policy.max_crash_restarts_per_window {
            enter_backoff(runner, entry).await;
            return;
        }

        runner.notify(LifecycleEvent::RestartScheduled {
            name: name.clone(),
            reason: RestartReason::Crash,
        });
        if let Err(e) = runner.restart_locked(entry, RestartReason::Crash).await {
            tracing::warn!(process = %name, error = %e, "crash restart failed");
        }
    }
}

/// Backoff に入り、遅延再起動タイマーを仕掛ける
async fn enter_backoff(runner: &Arc<Runner>, entry: &mut Entry) {
    let name = entry.name().to_string();
    entry.record.backoff_attempts += 1;
    let attempt = entry.record.backoff_attempts;
    let delay = runner.settings().backoff.delay_for_attempt(attempt);

    if let Err(e) = runner.transition(entry, ProcessState::Backoff) {
        tracing::error!(process = %name, error = %e, "cannot enter backoff");
        return;
    }
    arm_backoff(runner, entry, delay);
    runner.persist(entry).await;

    runner.notify(LifecycleEvent::BackoffEntered {
        name,
        attempt,
        delay,
    });
}

/// 遅延再起動タイマーを（張り直して）起動
pub(crate) fn arm_backoff(runner: &Arc<Runner>, entry: &mut Entry, delay: Duration) {
    entry.cancel_backoff();
    let epoch = entry.backoff_epoch;
    entry.backoff_timer = Some(tokio::spawn(backoff_timer(
        runner.clone(),
        entry.name().to_string(),
        epoch,
        delay,
    )));
}

fn backoff_timer(
    runner: Arc<Runner>,
    name: String,
    epoch: u64,
    delay: Duration,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        tokio::time::sleep(delay).await;

        let Ok(mut entry) = runner.registry().lock(&name, None).await else {
            return;
        };
        if entry.backoff_epoch != epoch || entry.record.state() != ProcessState::Backoff {
            tracing::debug!(process = %name, "stale backoff timer ignored");
            return;
        }
        // 自分自身のハンドル。abort せずに外すだけ
        entry.backoff_timer = None;

        tracing::info!(process = %name, "backoff elapsed; restarting");
        runner.notify(LifecycleEvent::RestartScheduled {
            name: name.clone(),
            reason: RestartReason::Crash,
        });
        if let Err(e) = runner.launch(&mut entry).await {
            tracing::warn!(process = %name, error = %e, "restart after backoff failed");
            apply_crash_policy(&runner, &mut entry).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::notify::ChannelSink;
    use crate::registry::Registry;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use fleetvisor_container::FakeBackend;
    use fleetvisor_core::{EngineSettings, ProcessRecord, RestartPolicy};

    struct Harness {
        runner: Arc<Runner>,
        backend: FakeBackend,
        events: mpsc::UnboundedReceiver<LifecycleEvent>,
        exits: mpsc::UnboundedReceiver<ExitEvent>,
    }

    fn harness(policy: RestartPolicy) -> Harness {
        let backend = FakeBackend::new();
        let (sink, events) = ChannelSink::new();
        let (exit_tx, exits) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::new());
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        registry
            .insert(ProcessRecord::new("mybot", "mybot:latest", now).with_restart_policy(policy))
            .unwrap();

        let runner = Arc::new(Runner::new(
            registry,
            Arc::new(backend.clone()),
            Arc::new(MemoryStore::new()),
            Arc::new(sink),
            Arc::new(TokioClock::starting_at(now)),
            EngineSettings::default(),
            exit_tx,
        ));
        Harness {
            runner,
            backend,
            events,
            exits,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_is_detected_and_restarted() {
        let mut h = harness(RestartPolicy::default());
        h.runner.start("mybot").await.unwrap();
        drain(&mut h.events);

        assert!(h.backend.crash("mybot", 1));
        let exit = h.exits.recv().await.unwrap();
        assert_eq!(exit.exit_code, Some(1));
        handle_exit(&h.runner, exit).await;

        let entry = h.runner.registry().lock("mybot", None).await.unwrap();
        assert_eq!(entry.record.state(), ProcessState::Running);
        assert_eq!(entry.record.crash_count, 1);
        assert_eq!(entry.record.last_exit_code, Some(1));

        let events = drain(&mut h.events);
        assert!(matches!(events[0], LifecycleEvent::Crashed { exit_code: Some(1), .. }));
        assert!(matches!(
            events[1],
            LifecycleEvent::RestartScheduled {
                reason: RestartReason::Crash,
                ..
            }
        ));
        assert!(matches!(events[2], LifecycleEvent::Started { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_exit_is_discarded() {
        let h = harness(RestartPolicy::default());
        h.runner.start("mybot").await.unwrap();
        let old = h
            .runner
            .registry()
            .lock("mybot", None)
            .await
            .unwrap()
            .record
            .container_handle()
            .cloned()
            .unwrap();

        h.runner
            .restart("mybot", RestartReason::Manual)
            .await
            .unwrap();

        handle_exit(
            &h.runner,
            ExitEvent {
                name: "mybot".to_string(),
                handle: old,
                exit_code: Some(0),
            },
        )
        .await;

        let entry = h.runner.registry().lock("mybot", None).await.unwrap();
        assert_eq!(entry.record.state(), ProcessState::Running);
        assert_eq!(entry.record.crash_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_restart_disabled_stays_crashed() {
        let mut h = harness(RestartPolicy {
            auto_restart: false,
            ..Default::default()
        });
        h.runner.start("mybot").await.unwrap();

        h.backend.crash("mybot", 2);
        let exit = h.exits.recv().await.unwrap();
        handle_exit(&h.runner, exit).await;

        let entry = h.runner.registry().lock("mybot", None).await.unwrap();
        assert_eq!(entry.record.state(), ProcessState::Crashed);
        assert_eq!(h.backend.counters().creates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_reached_enters_backoff() {
        let mut h = harness(RestartPolicy {
            max_crash_restarts_per_window: 1,
            ..Default::default()
        });
        h.runner.start("mybot").await.unwrap();

        for _ in 0..2 {
            h.backend.crash("mybot", 1);
            let exit = h.exits.recv().await.unwrap();
            handle_exit(&h.runner, exit).await;
        }

        let entry = h.runner.registry().lock("mybot", None).await.unwrap();
        assert_eq!(entry.record.state(), ProcessState::Backoff);
        assert_eq!(entry.record.backoff_attempts, 1);
        assert!(entry.has_pending_backoff());
        assert!(
            drain(&mut h.events)
                .iter()
                .any(|e| matches!(e, LifecycleEvent::BackoffEntered { attempt: 1, .. }))
        );
    }
}
