//! ProcessRecord から Docker API パラメータへの変換

// Bollard 0.19 の非推奨APIを一時的に使用
#![allow(deprecated)]

use crate::backend::ContainerSpec;
use bollard::container::{Config, CreateContainerOptions};
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use fleetvisor_core::ProcessRecord;
use std::collections::HashMap;

impl ContainerSpec {
    /// レコードの image_ref / env からコンテナ作成情報を作る
    pub fn from_record(record: &ProcessRecord) -> Self {
        Self {
            process: record.name().to_string(),
            image_ref: record.image_ref.clone(),
            env: record.env.clone(),
        }
    }
}

/// 管理対象であることを示すラベルキー
pub fn managed_label(prefix: &str) -> String {
    format!("{}.managed", prefix)
}

/// プロセス名を記録するラベルキー
pub fn process_label(prefix: &str) -> String {
    format!("{}.process", prefix)
}

/// コンテナ名を生成
///
/// プロセスごとに固定名にすることで、同名コンテナが二重に作られないことを
/// ランタイム側でも保証する。
pub fn container_name(prefix: &str, process: &str) -> String {
    format!("{}-{}", prefix, process)
}

/// イメージ名とタグを分離
/// 例: "redis:7-alpine" -> ("redis", "7-alpine")
///     "postgres" -> ("postgres", "latest")
///     "localhost:5000/app" -> ("localhost:5000/app", "latest")
pub fn parse_image_tag(image: &str) -> (&str, &str) {
    let last_segment_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_segment_start..].rfind(':') {
        Some(pos) => {
            let split = last_segment_start + pos;
            (&image[..split], &image[split + 1..])
        }
        None => (image, "latest"),
    }
}

/// ContainerSpec を Docker のコンテナ設定に変換
pub fn spec_to_container_config(
    spec: &ContainerSpec,
    prefix: &str,
) -> (Config<String>, CreateContainerOptions<String>) {
    // 環境変数の設定（順序を安定させる）
    let mut env: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.sort();

    let mut labels = HashMap::new();
    labels.insert(managed_label(prefix), "true".to_string());
    labels.insert(process_label(prefix), spec.process.clone());
    labels.insert("com.docker.compose.project".to_string(), prefix.to_string());
    labels.insert(
        "com.docker.compose.service".to_string(),
        spec.process.clone(),
    );

    // 再起動はエンジンが行うので、Docker 側の自動再起動は無効にする
    let host_config = Some(HostConfig {
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            maximum_retry_count: None,
        }),
        ..Default::default()
    });

    let config = Config {
        image: Some(spec.image_ref.clone()),
        env: Some(env),
        labels: Some(labels),
        host_config,
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: container_name(prefix, &spec.process),
        platform: None,
    };

    (config, options)
}
