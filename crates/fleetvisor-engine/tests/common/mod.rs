#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use fleetvisor_container::FakeBackend;
use fleetvisor_core::{EngineSettings, ProcessDefinition, RestartPolicy};
use fleetvisor_engine::{
    ChannelSink, Engine, LifecycleEvent, MemoryStore, ProcessStatus, TokioClock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct TestEngine {
    pub engine: Engine,
    pub backend: FakeBackend,
    pub store: Arc<MemoryStore>,
    pub events: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::with_parts(settings, Arc::new(MemoryStore::new()), FakeBackend::new(), t0())
    }

    /// 現在の tokio 時刻を `wall_now` とみなしてエンジンを作る
    pub fn with_parts(
        settings: EngineSettings,
        store: Arc<MemoryStore>,
        backend: FakeBackend,
        wall_now: DateTime<Utc>,
    ) -> Self {
        let (sink, events) = ChannelSink::new();
        let engine = Engine::new(
            settings,
            Arc::new(backend.clone()),
            store.clone(),
            Arc::new(sink),
            Arc::new(TokioClock::starting_at(wall_now)),
        );
        Self {
            engine,
            backend,
            store,
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<LifecycleEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// 条件を満たすまで状態を確認し続ける（仮想時間で最大 20 秒）
    pub async fn wait_status(&self, name: &str, cond: impl Fn(&ProcessStatus) -> bool) -> ProcessStatus {
        let mut last = None;
        for _ in 0..2000 {
            if let Ok(status) = self.engine.status(name).await {
                if cond(&status) {
                    return status;
                }
                last = Some(status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status of '{}' never matched; last: {:?}", name, last);
    }
}

/// 条件を満たすまで待つ（仮想時間で最大 20 秒）
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never met: {}", what);
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

pub fn definition(name: &str) -> ProcessDefinition {
    ProcessDefinition::new(name, format!("{}:latest", name))
}

pub fn definition_with_policy(name: &str, max_crashes: u32, window: Duration) -> ProcessDefinition {
    ProcessDefinition {
        restart_policy: RestartPolicy {
            auto_restart: true,
            max_crash_restarts_per_window: max_crashes,
            window,
        },
        ..definition(name)
    }
}

pub fn count_backoffs(events: &[LifecycleEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, LifecycleEvent::BackoffEntered { .. }))
        .count()
}
