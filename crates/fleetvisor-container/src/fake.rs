//! テスト用のインメモリバックエンド
//!
//! 実際のコンテナは作らず、状態遷移と呼び出し回数だけを記録します。
//! クラッシュの注入、作成失敗の注入、停止シグナルを無視するコンテナなど、
//! エンジンのテストに必要な振る舞いを再現できます。

use crate::backend::{
    ContainerBackend, ContainerInspect, ContainerSpec, ManagedContainer, OutputOptions,
};
use crate::error::{ContainerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use fleetvisor_core::ContainerHandle;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

/// 呼び出し回数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeCounters {
    pub creates: usize,
    pub starts: usize,
    pub stop_signals: usize,
    pub kills: usize,
    pub removes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FakeStatus {
    Created,
    Running,
    Exited(Option<i64>),
}

struct FakeContainer {
    process: String,
    image_ref: String,
    env: HashMap<String, String>,
    status: watch::Sender<FakeStatus>,
}

impl FakeContainer {
    fn current(&self) -> FakeStatus {
        *self.status.borrow()
    }

    fn is_running(&self) -> bool {
        self.current() == FakeStatus::Running
    }
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    create_failures: VecDeque<ContainerError>,
    remove_failures: VecDeque<ContainerError>,
    image_failures: HashMap<String, ContainerError>,
    ignore_stop: HashSet<String>,
    output: HashMap<String, Vec<Bytes>>,
    latency: Duration,
    counters: FakeCounters,
    stop_signals_by_process: HashMap<String, usize>,
    max_live: HashMap<String, usize>,
}

impl FakeState {
    fn live_count(&self, process: &str) -> usize {
        self.containers
            .values()
            .filter(|c| c.process == process && c.is_running())
            .count()
    }

    fn container(&self, handle: &ContainerHandle) -> Result<&FakeContainer> {
        self.containers
            .get(handle.id())
            .ok_or_else(|| ContainerError::ContainerNotFound {
                container: handle.id().to_string(),
            })
    }
}

/// インメモリの ContainerBackend 実装
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// create / start / signal_stop に人工的な遅延を入れる
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// 実行中のコンテナを異常終了させる
    ///
    /// 対象が無ければ false を返す。
    pub fn crash(&self, process: &str, exit_code: i64) -> bool {
        let state = self.lock();
        let Some(container) = state
            .containers
            .values()
            .find(|c| c.process == process && c.is_running())
        else {
            return false;
        };
        container.status.send_replace(FakeStatus::Exited(Some(exit_code)));
        true
    }

    /// 次の create を失敗させる（複数回呼ぶと順に消費される）
    pub fn fail_next_create(&self, err: ContainerError) {
        self.lock().create_failures.push_back(err);
    }

    /// 次の remove を失敗させる（コンテナは残る）
    pub fn fail_next_remove(&self, err: ContainerError) {
        self.lock().remove_failures.push_back(err);
    }

    /// 指定イメージの create を常に失敗させる
    pub fn fail_image(&self, image: &str, err: ContainerError) {
        self.lock().image_failures.insert(image.to_string(), err);
    }

    pub fn clear_image_failure(&self, image: &str) {
        self.lock().image_failures.remove(image);
    }

    /// このプロセスのコンテナは停止シグナルを無視する（強制終了が必要になる）
    pub fn ignore_stop_signal(&self, process: &str) {
        self.lock().ignore_stop.insert(process.to_string());
    }

    /// stream_output が返す出力を設定
    pub fn set_output(&self, process: &str, lines: &[&str]) {
        let lines = lines
            .iter()
            .map(|line| Bytes::from(format!("{}\n", line)))
            .collect();
        self.lock().output.insert(process.to_string(), lines);
    }

    /// エンジン外で作られたコンテナ（前回実行の残り）を登録
    pub fn insert_external(&self, process: &str, image_ref: &str, running: bool) -> ContainerHandle {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("external{:08}", state.next_id);
        let status = if running {
            FakeStatus::Running
        } else {
            FakeStatus::Exited(Some(0))
        };
        let (tx, _rx) = watch::channel(status);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                process: process.to_string(),
                image_ref: image_ref.to_string(),
                env: HashMap::new(),
                status: tx,
            },
        );
        ContainerHandle::new(id)
    }

    pub fn counters(&self) -> FakeCounters {
        self.lock().counters
    }

    /// プロセスに対して発行された停止シグナルの回数
    pub fn stop_signals(&self, process: &str) -> usize {
        self.lock()
            .stop_signals_by_process
            .get(process)
            .copied()
            .unwrap_or(0)
    }

    /// 実行中のコンテナ数
    pub fn live_count(&self, process: &str) -> usize {
        self.lock().live_count(process)
    }

    /// 削除されていないコンテナ数
    pub fn container_count(&self, process: &str) -> usize {
        self.lock()
            .containers
            .values()
            .filter(|c| c.process == process)
            .count()
    }

    /// これまでに同時に実行されていたコンテナ数の最大値
    pub fn max_live(&self, process: &str) -> usize {
        self.lock().max_live.get(process).copied().unwrap_or(0)
    }

    /// 実行中コンテナのイメージと環境変数
    pub fn running_spec(&self, process: &str) -> Option<(String, HashMap<String, String>)> {
        self.lock()
            .containers
            .values()
            .find(|c| c.process == process && c.is_running())
            .map(|c| (c.image_ref.clone(), c.env.clone()))
    }

    pub fn exists(&self, handle: &ContainerHandle) -> bool {
        self.lock().containers.contains_key(handle.id())
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.simulate_latency().await;

        let mut state = self.lock();
        state.counters.creates += 1;

        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        if let Some(err) = state.image_failures.get(&spec.image_ref) {
            return Err(err.clone());
        }

        state.next_id += 1;
        let id = format!("fake{:012x}", state.next_id);
        let (tx, _rx) = watch::channel(FakeStatus::Created);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                process: spec.process.clone(),
                image_ref: spec.image_ref.clone(),
                env: spec.env.clone(),
                status: tx,
            },
        );

        Ok(ContainerHandle::new(id))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.simulate_latency().await;

        let mut state = self.lock();
        state.counters.starts += 1;

        let container = state.container(handle)?;
        if container.current() == FakeStatus::Running {
            return Ok(());
        }
        container.status.send_replace(FakeStatus::Running);

        let process = container.process.clone();
        let live = state.live_count(&process);
        let max = state.max_live.entry(process).or_insert(0);
        *max = (*max).max(live);
        Ok(())
    }

    async fn signal_stop(&self, handle: &ContainerHandle, _grace_period: Duration) -> Result<()> {
        self.simulate_latency().await;

        let mut state = self.lock();
        state.counters.stop_signals += 1;

        let Some(container) = state.containers.get(handle.id()) else {
            return Ok(());
        };
        let process = container.process.clone();
        if container.is_running() && !state.ignore_stop.contains(&process) {
            container.status.send_replace(FakeStatus::Exited(Some(0)));
        }
        *state.stop_signals_by_process.entry(process).or_insert(0) += 1;
        Ok(())
    }

    async fn force_kill(&self, handle: &ContainerHandle) -> Result<()> {
        let mut state = self.lock();
        state.counters.kills += 1;

        if let Some(container) = state.containers.get(handle.id())
            && container.is_running()
        {
            container.status.send_replace(FakeStatus::Exited(Some(137)));
        }
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        let mut state = self.lock();
        state.counters.removes += 1;
        if let Some(err) = state.remove_failures.pop_front() {
            return Err(err);
        }
        // 実行中でも強制削除（docker rm -f 相当）
        state.containers.remove(handle.id());
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerInspect> {
        let state = self.lock();
        let container = state.container(handle)?;
        Ok(match container.current() {
            FakeStatus::Running => ContainerInspect::running(),
            FakeStatus::Created => ContainerInspect::exited(None),
            FakeStatus::Exited(code) => ContainerInspect::exited(code),
        })
    }

    async fn wait_exit(&self, handle: &ContainerHandle) -> Result<Option<i64>> {
        let mut rx = {
            let state = self.lock();
            match state.containers.get(handle.id()) {
                Some(container) => container.status.subscribe(),
                None => return Ok(None),
            }
        };

        match rx.wait_for(|status| matches!(status, FakeStatus::Exited(_))).await {
            Ok(status) => match *status {
                FakeStatus::Exited(code) => Ok(code),
                _ => Ok(None),
            },
            // 削除された
            Err(_) => Ok(None),
        }
    }

    fn stream_output(
        &self,
        handle: &ContainerHandle,
        options: &OutputOptions,
    ) -> BoxStream<'static, Result<Bytes>> {
        let (lines, rx) = {
            let state = self.lock();
            match state.containers.get(handle.id()) {
                Some(container) => (
                    state.output.get(&container.process).cloned().unwrap_or_default(),
                    container.status.subscribe(),
                ),
                None => {
                    let err = ContainerError::ContainerNotFound {
                        container: handle.id().to_string(),
                    };
                    return stream::once(async move { Err(err) }).boxed();
                }
            }
        };

        let skip = options
            .tail
            .map(|tail| lines.len().saturating_sub(tail))
            .unwrap_or(0);
        let lines = stream::iter(lines.into_iter().skip(skip).map(Ok));
        if !options.follow {
            return lines.boxed();
        }

        let until_exit = stream::once(async move {
            let mut rx = rx;
            let _ = rx
                .wait_for(|status| matches!(status, FakeStatus::Exited(_)))
                .await;
        })
        .filter_map(|_| async { None::<Result<Bytes>> });

        lines.chain(until_exit).boxed()
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        let state = self.lock();
        Ok(state
            .containers
            .iter()
            .map(|(id, container)| ManagedContainer {
                handle: ContainerHandle::new(id.clone()),
                process: container.process.clone(),
                running: container.is_running(),
            })
            .collect())
    }
}
