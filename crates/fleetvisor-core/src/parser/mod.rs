//! fleetvisor.kdl パーサー
//!
//! KDL構文をパースして FleetConfig 構造体を生成する。

mod engine;
mod process;


use crate::envfile::load_env_file;
use crate::error::{CoreError, Result};
use crate::model::FleetConfig;
use kdl::{KdlDocument, KdlNode, KdlValue};
use std::collections::HashSet;
use std::path::Path;

pub use engine::parse_engine;
pub use process::parse_process;

/// 設定ファイルを読み込み、env-file も解決した FleetConfig を返す
pub fn parse_config_file(path: &Path) -> Result<FleetConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CoreError::IoError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut config = parse_config(&content)?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    resolve_env_files(&mut config, base_dir)?;

    tracing::debug!(
        path = %path.display(),
        processes = config.processes.len(),
        "loaded config"
    );
    Ok(config)
}

/// KDL文字列を FleetConfig にパース
pub fn parse_config(content: &str) -> Result<FleetConfig> {
    let doc: KdlDocument = content.parse()?;

    let mut config = FleetConfig::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "engine" => {
                config.engine = parse_engine(node)?;
            }
            "process" => {
                let definition = parse_process(node)?;
                if !seen.insert(definition.name.clone()) {
                    return Err(CoreError::DuplicateProcess(definition.name));
                }
                config.processes.push(definition);
            }
            other => {
                tracing::warn!(node = other, "unknown top-level node; ignoring");
            }
        }
    }

    Ok(config)
}

/// env-file を読み込み、明示的な env とマージする（明示的な値が優先）
pub fn resolve_env_files(config: &mut FleetConfig, base_dir: &Path) -> Result<()> {
    for definition in &mut config.processes {
        let Some(env_file) = &definition.env_file else {
            continue;
        };
        let path = if env_file.is_relative() {
            base_dir.join(env_file)
        } else {
            env_file.clone()
        };

        let mut merged = load_env_file(&path)?;
        merged.extend(definition.env.drain());
        definition.env = merged;
    }
    Ok(())
}

/// プロセス名として使える文字列か（コンテナ名に埋め込むため）
pub fn is_valid_process_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// ============================================================================
// ノード操作ヘルパー
// ============================================================================

/// 最初の引数を文字列として取得
pub(crate) fn first_string(node: &KdlNode) -> Option<&str> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
}

/// プロパティ値を取得
pub(crate) fn property<'a>(node: &'a KdlNode, key: &str) -> Option<&'a KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_some_and(|n| n.value() == key))
        .map(|e| e.value())
}

/// 必須の文字列引数を取得
pub(crate) fn required_string(node: &KdlNode, context: &str) -> Result<String> {
    first_string(node).map(|s| s.to_string()).ok_or_else(|| {
        CoreError::InvalidConfig(format!(
            "{} の {} には文字列の値が必要です",
            context,
            node.name().value()
        ))
    })
}
