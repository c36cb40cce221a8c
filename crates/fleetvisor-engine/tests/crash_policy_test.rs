mod common;

use common::{TestEngine, count_backoffs, definition_with_policy, eventually};
use fleetvisor_container::ContainerError;
use fleetvisor_core::{BackoffSettings, ContainerHandle, EngineSettings, ProcessState};
use fleetvisor_engine::{ExitEvent, LifecycleEvent, RestartReason};
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

#[tokio::test(start_paused = true)]
async fn test_fourth_crash_in_window_enters_backoff() {
    let mut t = TestEngine::new();
    t.engine
        .add(&definition_with_policy("mybot", 3, 10 * MINUTE))
        .await
        .unwrap();
    t.engine.start("mybot").await.unwrap();

    for restarts in 1..=3 {
        assert!(t.backend.crash("mybot", 1));
        let backend = t.backend.clone();
        eventually("crash restart", move || backend.counters().creates == restarts + 1).await;
        t.wait_status("mybot", |s| s.state == ProcessState::Running)
            .await;
    }

    assert!(t.backend.crash("mybot", 1));
    let status = t
        .wait_status("mybot", |s| s.state == ProcessState::Backoff)
        .await;
    assert_eq!(status.crash_count, 3);
    assert_eq!(status.backoff_attempts, 1);
    assert_eq!(t.backend.counters().creates, 4);

    let events = t.drain_events();
    let crash_restarts = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                LifecycleEvent::RestartScheduled {
                    reason: RestartReason::Crash,
                    ..
                }
            )
        })
        .count();
    assert_eq!(crash_restarts, 3);
    assert_eq!(count_backoffs(&events), 1);

    // 既定のバックオフ（10秒）経過後に再起動される
    let status = t
        .wait_status("mybot", |s| s.state == ProcessState::Running)
        .await;
    assert_eq!(status.backoff_attempts, 1);
    assert_eq!(t.backend.counters().creates, 5);
}

#[tokio::test(start_paused = true)]
async fn test_mybot_crash_scenario() {
    let mut t = TestEngine::with_settings(EngineSettings {
        backoff: BackoffSettings {
            base: 5 * MINUTE,
            max: 30 * MINUTE,
            multiplier: 2.0,
        },
        ..Default::default()
    });
    t.engine
        .add(&definition_with_policy("mybot", 2, 10 * MINUTE))
        .await
        .unwrap();
    t.engine.start("mybot").await.unwrap();

    // t=0: 1回目の再起動
    assert!(t.backend.crash("mybot", 1));
    let backend = t.backend.clone();
    eventually("restart after t=0", move || backend.counters().creates == 2).await;

    // t=3: 2回目の再起動
    tokio::time::sleep(3 * MINUTE).await;
    assert!(t.backend.crash("mybot", 1));
    let backend = t.backend.clone();
    eventually("restart after t=3", move || backend.counters().creates == 3).await;

    // t=6: ウィンドウ内3回目 → Backoff
    tokio::time::sleep(3 * MINUTE).await;
    assert!(t.backend.crash("mybot", 1));
    let status = t
        .wait_status("mybot", |s| s.state == ProcessState::Backoff)
        .await;
    assert_eq!(status.crash_count, 2);

    // t=9: Backoff 中の終了は記録されるがタイマーは増えない
    tokio::time::sleep(3 * MINUTE).await;
    t.engine.report_exit(ExitEvent {
        name: "mybot".to_string(),
        handle: ContainerHandle::new("late-exit"),
        exit_code: Some(9),
    });
    let status = t
        .wait_status("mybot", |s| s.last_exit_code == Some(9))
        .await;
    assert_eq!(status.state, ProcessState::Backoff);
    assert_eq!(status.backoff_attempts, 1);

    let events = t.drain_events();
    assert_eq!(count_backoffs(&events), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        LifecycleEvent::Crashed {
            exit_code: Some(9),
            ..
        }
    )));

    // t≈11: 5分のバックオフ後に1回だけ再起動
    tokio::time::sleep(3 * MINUTE).await;
    t.wait_status("mybot", |s| s.state == ProcessState::Running)
        .await;
    tokio::time::sleep(10 * MINUTE).await;
    assert_eq!(t.backend.counters().creates, 4);
    assert_eq!(t.backend.live_count("mybot"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_window_expiry_resets_count() {
    let t = TestEngine::new();
    t.engine
        .add(&definition_with_policy("mybot", 1, 10 * MINUTE))
        .await
        .unwrap();
    t.engine.start("mybot").await.unwrap();

    assert!(t.backend.crash("mybot", 1));
    t.wait_status("mybot", |s| s.state == ProcessState::Running && s.crash_count == 1)
        .await;

    tokio::time::sleep(11 * MINUTE).await;
    assert!(t.backend.crash("mybot", 1));
    let backend = t.backend.clone();
    eventually("restart after window", move || backend.counters().creates == 3).await;

    let status = t
        .wait_status("mybot", |s| s.state == ProcessState::Running)
        .await;
    assert_eq!(status.crash_count, 1);
    assert_eq!(status.backoff_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_auto_restart_disabled() {
    let t = TestEngine::new();
    let mut def = definition_with_policy("mybot", 3, 10 * MINUTE);
    def.restart_policy.auto_restart = false;
    t.engine.add(&def).await.unwrap();
    t.engine.start("mybot").await.unwrap();

    assert!(t.backend.crash("mybot", 3));
    let status = t
        .wait_status("mybot", |s| s.state == ProcessState::Crashed)
        .await;
    assert_eq!(status.last_exit_code, Some(3));

    tokio::time::sleep(MINUTE).await;
    assert_eq!(t.backend.counters().creates, 1);

    // 手動 start で復帰し、統計もリセットされる
    t.engine.start("mybot").await.unwrap();
    let status = t.engine.status("mybot").await.unwrap();
    assert_eq!(status.state, ProcessState::Running);
    assert_eq!(status.crash_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_manual_start_failure_is_not_retried() {
    let t = TestEngine::new();
    t.engine
        .add(&definition_with_policy("mybot", 3, 10 * MINUTE))
        .await
        .unwrap();
    t.backend.fail_image(
        "mybot:latest",
        ContainerError::ImageNotFound {
            image: "mybot:latest".to_string(),
        },
    );

    let err = t.engine.start("mybot").await.unwrap_err();
    assert!(err.is_fatal());

    tokio::time::sleep(MINUTE).await;
    let status = t.engine.status("mybot").await.unwrap();
    assert_eq!(status.state, ProcessState::Crashed);
    assert_eq!(t.backend.counters().creates, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_during_crash_restart_is_retried() {
    let t = TestEngine::new();
    t.engine
        .add(&definition_with_policy("mybot", 3, 10 * MINUTE))
        .await
        .unwrap();
    t.engine.start("mybot").await.unwrap();

    t.backend.fail_next_create(ContainerError::BackendUnavailable(
        "connection refused".to_string(),
    ));
    assert!(t.backend.crash("mybot", 1));

    let status = t
        .wait_status("mybot", |s| s.state == ProcessState::Running && s.crash_count == 2)
        .await;
    assert_eq!(status.backoff_attempts, 0);
    assert_eq!(t.backend.counters().creates, 3);
    assert_eq!(t.backend.live_count("mybot"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_detection() {
    let t = TestEngine::with_settings(EngineSettings {
        exit_detection: fleetvisor_core::ExitDetection::Poll,
        poll_interval: Duration::from_secs(5),
        ..Default::default()
    });
    t.engine
        .add(&definition_with_policy("mybot", 3, 10 * MINUTE))
        .await
        .unwrap();
    t.engine.start("mybot").await.unwrap();

    assert!(t.backend.crash("mybot", 42));
    let status = t
        .wait_status("mybot", |s| s.crash_count == 1 && s.state == ProcessState::Running)
        .await;
    assert_eq!(status.last_exit_code, Some(42));
}
