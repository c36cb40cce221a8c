//! ProcessRecord の永続化
//!
//! 状態ファイル（JSON）にプロセスごとのレコードを保存します。
//! 書き込みはレコード単位で行うため、呼び出し側は対象プロセスの
//! 排他区間を1つ保持しているだけで済みます。

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetvisor_core::ProcessRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

const STATE_VERSION: u32 = 1;

/// レコードの保存先
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 保存済みの全レコードを読み込む
    async fn load(&self) -> Result<Vec<ProcessRecord>>;

    /// 1件保存（同名があれば上書き）
    async fn save_record(&self, record: &ProcessRecord) -> Result<()>;

    /// 1件削除
    async fn remove_record(&self, name: &str) -> Result<()>;
}

/// 状態ファイルの内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// State file version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Records indexed by process name
    pub processes: BTreeMap<String, ProcessRecord>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            processes: BTreeMap::new(),
        }
    }
}

/// JSON ファイルによる StateStore
///
/// 保存のたびに既存ファイルを `.backup` に退避してから書き込みます。
pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<Option<StateFile>>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// ファイルから読み込む（キャッシュを使わない）
    pub async fn read_file(&self) -> Result<StateFile> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "state file not found; starting empty");
            return Ok(StateFile::default());
        }

        let content = fs::read_to_string(&self.path).await?;
        let state: StateFile = serde_json::from_str(&content)?;

        if state.version > STATE_VERSION {
            return Err(EngineError::Store(format!(
                "状態ファイルのバージョン {} はサポートされているバージョン {} より新しいです",
                state.version, STATE_VERSION
            )));
        }

        tracing::debug!(
            path = %self.path.display(),
            processes = state.processes.len(),
            "loaded state file"
        );
        Ok(state)
    }

    async fn write_file(&self, state: &StateFile) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
            && !dir.exists()
        {
            fs::create_dir_all(dir).await?;
        }

        let temp = self.temp_path();
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&temp, content).await?;

        if self.path.exists() {
            fs::copy(&self.path, self.backup_path()).await?;
        }
        fs::rename(&temp, &self.path).await?;

        tracing::debug!(processes = state.processes.len(), "saved state file");
        Ok(())
    }

    async fn update(&self, apply: impl FnOnce(&mut StateFile) + Send) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.read_file().await?);
        }
        let Some(state) = cache.as_mut() else {
            return Ok(());
        };

        apply(state);
        state.updated_at = Utc::now();
        self.write_file(state).await
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<ProcessRecord>> {
        let state = self.read_file().await?;
        let records = state.processes.values().cloned().collect();
        *self.cache.lock().await = Some(state);
        Ok(records)
    }

    async fn save_record(&self, record: &ProcessRecord) -> Result<()> {
        let record = record.clone();
        self.update(move |state| {
            state.processes.insert(record.name().to_string(), record);
        })
        .await
    }

    async fn remove_record(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.update(move |state| {
            state.processes.remove(&name);
        })
        .await
    }
}

/// メモリ上の StateStore（永続化しない構成とテスト用）
#[derive(Default)]
pub struct MemoryStore {
    records: std::sync::Mutex<BTreeMap<String, ProcessRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 事前にレコードを入れた状態で作る
    pub fn with_records(records: impl IntoIterator<Item = ProcessRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.lock();
            for record in records {
                map.insert(record.name().to_string(), record);
            }
        }
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ProcessRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<ProcessRecord> {
        self.lock().get(name).cloned()
    }

    pub fn snapshot(&self) -> Vec<ProcessRecord> {
        self.lock().values().cloned().collect()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Vec<ProcessRecord>> {
        Ok(self.snapshot())
    }

    async fn save_record(&self, record: &ProcessRecord) -> Result<()> {
        self.lock()
            .insert(record.name().to_string(), record.clone());
        Ok(())
    }

    async fn remove_record(&self, name: &str) -> Result<()> {
        self.lock().remove(name);
        Ok(())
    }
}
