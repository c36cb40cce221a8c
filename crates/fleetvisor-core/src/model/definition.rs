//! 設定ファイル上のプロセス定義

use super::policy::RestartPolicy;
use super::process::ProcessRecord;
use super::settings::EngineSettings;
use crate::duration::Interval;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// プロセス定義（設定ファイルの `process` ノード）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub name: String,
    pub image_ref: String,
    /// 明示的な環境変数（env-file より優先）
    pub env: HashMap<String, String>,
    /// 読み込み元の env ファイル
    pub env_file: Option<PathBuf>,
    pub restart_policy: RestartPolicy,
    pub schedule: Option<Interval>,
}

impl ProcessDefinition {
    pub fn new(name: impl Into<String>, image_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image_ref: image_ref.into(),
            env: HashMap::new(),
            env_file: None,
            restart_policy: RestartPolicy::default(),
            schedule: None,
        }
    }

    /// 新しい ProcessRecord（Stopped）を生成
    pub fn to_record(&self, now: DateTime<Utc>) -> ProcessRecord {
        ProcessRecord::new(&self.name, &self.image_ref, now)
            .with_env(self.env.clone())
            .with_restart_policy(self.restart_policy.clone())
    }

    /// 既存レコードに設定値を反映（状態には触れない）
    pub fn apply_to(&self, record: &mut ProcessRecord) {
        record.image_ref = self.image_ref.clone();
        record.env = self.env.clone();
        record.restart_policy = self.restart_policy.clone();
    }
}

/// 設定ファイル全体
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    pub engine: EngineSettings,
    pub processes: Vec<ProcessDefinition>,
}

impl FleetConfig {
    pub fn process(&self, name: &str) -> Option<&ProcessDefinition> {
        self.processes.iter().find(|p| p.name == name)
    }
}
