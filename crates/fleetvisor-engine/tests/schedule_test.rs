mod common;

use common::{TestEngine, definition, t0};
use fleetvisor_container::{ContainerError, FakeBackend};
use fleetvisor_core::{EngineSettings, Interval, ProcessState};
use fleetvisor_engine::{LifecycleEvent, MemoryStore, RestartReason};
use std::sync::Arc;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

fn hours(h: f64) -> chrono::Duration {
    chrono::Duration::seconds((h * 3600.0) as i64)
}

#[tokio::test(start_paused = true)]
async fn test_schedule_has_no_drift_over_a_day() {
    // 再起動1回に数秒かかるバックエンド
    let backend = FakeBackend::new().with_latency(Duration::from_secs(3));
    let mut t = TestEngine::with_parts(
        EngineSettings::default(),
        Arc::new(MemoryStore::new()),
        backend,
        t0(),
    );
    t.engine.add(&definition("mybot")).await.unwrap();
    t.engine.start("mybot").await.unwrap();

    let schedule = t
        .engine
        .schedule("mybot", Interval::parse("2h").unwrap())
        .await
        .unwrap();
    let origin = schedule.created_at;
    assert_eq!(schedule.next_fire_at, origin + hours(2.0));

    let mut fire_times = vec![schedule.next_fire_at];
    for k in 1..=12 {
        tokio::time::sleep(2 * HOUR).await;
        let expected = origin + hours(2.0) * (k + 1);
        let status = t
            .wait_status("mybot", |s| {
                s.schedule.as_ref().map(|sc| sc.next_fire_at) == Some(expected)
            })
            .await;
        fire_times.push(status.schedule.unwrap().next_fire_at);
    }

    for pair in fire_times.windows(2) {
        assert_eq!(pair[1] - pair[0], hours(2.0));
    }
    t.wait_status("mybot", |s| s.state == ProcessState::Running)
        .await;
    assert_eq!(t.backend.counters().creates, 13);

    let scheduled = t
        .drain_events()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                LifecycleEvent::RestartScheduled {
                    reason: RestartReason::Scheduled,
                    ..
                }
            )
        })
        .count();
    assert_eq!(scheduled, 12);
    assert_eq!(t.engine.status("mybot").await.unwrap().crash_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_schedule_survives_engine_restart() {
    let store = Arc::new(MemoryStore::new());
    let backend = FakeBackend::new();

    let first = TestEngine::with_parts(EngineSettings::default(), store.clone(), backend.clone(), t0());
    first.engine.add(&definition("mybot")).await.unwrap();
    first.engine.start("mybot").await.unwrap();
    first
        .engine
        .schedule("mybot", Interval::parse("2.5h").unwrap())
        .await
        .unwrap();

    tokio::time::sleep(HOUR).await;
    first.engine.shutdown(false).await;
    drop(first);

    // 1時間後にエンジンを起動し直す
    let second = TestEngine::with_parts(
        EngineSettings::default(),
        store,
        backend.clone(),
        t0() + hours(1.0),
    );
    let report = second.engine.recover().await.unwrap();
    assert_eq!(report.adopted, vec!["mybot".to_string()]);
    assert_eq!(report.schedules, 1);

    let status = second.engine.status("mybot").await.unwrap();
    let schedule = status.schedule.unwrap();
    assert_eq!(schedule.next_fire_at, t0() + hours(2.5));
    assert_eq!(schedule.remaining_secs, 90 * 60);
    assert_eq!(backend.counters().creates, 1);

    // 残り 1.5 時間で発火する
    tokio::time::sleep(HOUR).await;
    assert_eq!(backend.counters().creates, 1);

    tokio::time::sleep(Duration::from_secs(31 * 60)).await;
    second
        .wait_status("mybot", |s| {
            s.state == ProcessState::Running
                && s.schedule.as_ref().map(|sc| sc.next_fire_at) == Some(t0() + hours(5.0))
        })
        .await;
    assert_eq!(backend.counters().creates, 2);
}

#[tokio::test(start_paused = true)]
async fn test_fire_on_stopped_process_is_consumed() {
    let t = TestEngine::new();
    t.engine.add(&definition("mybot")).await.unwrap();
    t.engine
        .schedule("mybot", Interval::parse("1h").unwrap())
        .await
        .unwrap();

    tokio::time::sleep(HOUR + Duration::from_secs(1)).await;
    let status = t
        .wait_status("mybot", |s| {
            s.schedule.as_ref().and_then(|sc| sc.last_fire_at).is_some()
        })
        .await;
    assert_eq!(status.state, ProcessState::Stopped);
    assert_eq!(
        status.schedule.unwrap().next_fire_at,
        t0() + hours(2.0)
    );
    assert_eq!(t.backend.counters().creates, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unschedule_stops_firing() {
    let t = TestEngine::new();
    t.engine.add(&definition("mybot")).await.unwrap();
    t.engine.start("mybot").await.unwrap();
    t.engine
        .schedule("mybot", Interval::parse("1h").unwrap())
        .await
        .unwrap();

    assert!(t.engine.unschedule("mybot").await.unwrap());
    assert!(!t.engine.unschedule("mybot").await.unwrap());

    tokio::time::sleep(3 * HOUR).await;
    let status = t.engine.status("mybot").await.unwrap();
    assert!(status.schedule.is_none());
    assert_eq!(status.state, ProcessState::Running);
    assert_eq!(t.backend.counters().creates, 1);
    assert!(t.engine.scheduler().pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reschedule_replaces_phase() {
    let t = TestEngine::new();
    t.engine.add(&definition("mybot")).await.unwrap();
    t.engine.start("mybot").await.unwrap();
    t.engine
        .schedule("mybot", Interval::parse("1h").unwrap())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30 * 60)).await;
    let schedule = t
        .engine
        .schedule("mybot", Interval::parse("2h").unwrap())
        .await
        .unwrap();
    assert_eq!(schedule.next_fire_at, t0() + hours(2.5));

    // 旧スケジュールの時刻（1h）では発火しない
    tokio::time::sleep(HOUR).await;
    assert_eq!(t.backend.counters().creates, 1);

    tokio::time::sleep(HOUR + Duration::from_secs(1)).await;
    t.wait_status("mybot", |s| s.state == ProcessState::Running)
        .await;
    assert_eq!(t.backend.counters().creates, 2);
    assert_eq!(
        t.engine.scheduler().pending(),
        vec![("mybot".to_string(), t0() + hours(4.5))]
    );
}

#[tokio::test(start_paused = true)]
async fn test_schedule_from_definition() {
    let t = TestEngine::new();
    let mut def = definition("mybot");
    def.schedule = Some(Interval::parse("30m").unwrap());
    t.engine.add(&def).await.unwrap();

    let status = t.engine.status("mybot").await.unwrap();
    assert_eq!(
        status.schedule.unwrap().next_fire_at,
        t0() + chrono::Duration::minutes(30)
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_teardown_during_scheduled_restart_recovers() {
    let mut t = TestEngine::new();
    t.engine.add(&definition("mybot")).await.unwrap();
    t.engine.start("mybot").await.unwrap();
    t.engine
        .schedule("mybot", Interval::parse("1h").unwrap())
        .await
        .unwrap();

    // 古いコンテナの削除が一度だけ失敗する
    t.backend
        .fail_next_remove(ContainerError::BackendUnavailable("connection reset".into()));

    tokio::time::sleep(HOUR + Duration::from_secs(1)).await;
    let status = t
        .wait_status("mybot", |s| s.state == ProcessState::Running && s.crash_count == 1)
        .await;
    assert!(status.container.is_some());
    assert_eq!(t.backend.counters().creates, 2);
    assert_eq!(t.backend.live_count("mybot"), 1);
    assert_eq!(t.backend.container_count("mybot"), 1);

    let events = t.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        LifecycleEvent::Crashed {
            exit_code: None,
            ..
        }
    )));

    // 以後のスケジュールも通常どおり発火する
    tokio::time::sleep(HOUR).await;
    t.wait_status("mybot", |s| s.state == ProcessState::Running)
        .await;
    assert_eq!(t.backend.counters().creates, 3);
}
