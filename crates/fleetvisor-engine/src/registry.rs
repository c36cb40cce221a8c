//! プロセスレジストリ
//!
//! 名前 → エントリの対応表。エントリはプロセスごとの非同期 Mutex で守られ、
//! Runner / Monitor / Scheduler のすべての変更はこの排他区間の中で行われます。
//! バックエンド呼び出しの間も保持し続けるため、同名への操作は
//! 到着順（FIFO）に直列化されます。

use crate::error::{EngineError, Result};
use fleetvisor_core::ProcessRecord;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// レジストリ内の1プロセス分の状態
#[derive(Debug)]
pub struct Entry {
    pub record: ProcessRecord,
    /// Running 中の終了監視タスク
    pub(crate) watcher: Option<JoinHandle<()>>,
    /// Backoff 中の遅延再起動タイマー
    pub(crate) backoff_timer: Option<JoinHandle<()>>,
    /// タイマーの世代。取り消すたびに進める
    pub(crate) backoff_epoch: u64,
    /// remove 済み（待っていた呼び出しは NotFound になる）
    pub(crate) removed: bool,
}

impl Entry {
    fn new(record: ProcessRecord) -> Self {
        Self {
            record,
            watcher: None,
            backoff_timer: None,
            backoff_epoch: 0,
            removed: false,
        }
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    /// 終了監視タスクを止める
    pub(crate) fn cancel_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }

    /// 遅延再起動タイマーを取り消す
    ///
    /// 既に発火して排他区間を待っているタイマーも、世代が変わるため何もしない。
    pub(crate) fn cancel_backoff(&mut self) {
        self.backoff_epoch += 1;
        if let Some(timer) = self.backoff_timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn has_pending_backoff(&self) -> bool {
        self.backoff_timer.is_some()
    }

    /// すべてのバックグラウンドタスクを止める
    pub(crate) fn cancel_tasks(&mut self) {
        self.cancel_watcher();
        self.cancel_backoff();
    }
}

pub type EntryGuard = OwnedMutexGuard<Entry>;

/// プロセス名 → エントリ
#[derive(Debug, Default)]
pub struct Registry {
    slots: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Mutex<Entry>>>> {
        self.slots.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Mutex<Entry>>>> {
        self.slots.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 新しいレコードを登録
    pub fn insert(&self, record: ProcessRecord) -> Result<Arc<Mutex<Entry>>> {
        let mut slots = self.write();
        let name = record.name().to_string();
        if slots.contains_key(&name) {
            return Err(EngineError::AlreadyExists(name));
        }
        let slot = Arc::new(Mutex::new(Entry::new(record)));
        slots.insert(name, slot.clone());
        Ok(slot)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// 排他区間に入る
    ///
    /// `timeout` が None なら空くまで待つ。指定があれば、その時間内に
    /// 入れなければ `Busy` を返す。待っている間に remove された場合は `NotFound`。
    pub async fn lock(&self, name: &str, timeout: Option<Duration>) -> Result<EntryGuard> {
        let slot = self
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;

        let guard = match timeout {
            None => slot.lock_owned().await,
            Some(limit) => tokio::time::timeout(limit, slot.lock_owned())
                .await
                .map_err(|_| EngineError::Busy {
                    name: name.to_string(),
                })?,
        };

        if guard.removed {
            return Err(EngineError::NotFound(name.to_string()));
        }
        Ok(guard)
    }

    /// 排他区間を待たずに、空いているエントリのタスクをすべて止める
    ///
    /// 操作中のエントリは飛ばす。件数は止めたエントリ数。
    pub(crate) fn cancel_idle_tasks(&self) -> usize {
        let slots: Vec<_> = self.read().values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| slot.try_lock().ok())
            .map(|mut entry| entry.cancel_tasks())
            .count()
    }

    /// エントリを表から外す（排他区間の中から呼ぶ）
    pub(crate) fn detach(&self, entry: &mut Entry) {
        entry.removed = true;
        entry.cancel_tasks();
        self.write().remove(entry.name());
    }
}
