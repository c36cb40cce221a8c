use crate::utils;
use colored::Colorize;
use fleetvisor_container::{ContainerBackend, DockerBackend, OutputOptions};
use fleetvisor_engine::JsonFileStore;
use futures_util::stream::StreamExt;
use std::path::Path;

pub async fn handle(
    config_path: &Path,
    name: &str,
    lines: usize,
    follow: bool,
) -> anyhow::Result<()> {
    let config = utils::load_config(config_path)?;
    let state_path = utils::state_file(&config, config_path)?;
    let state = JsonFileStore::new(&state_path).read_file().await?;

    let record = state
        .processes
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("プロセス '{}' の記録がありません", name))?;
    let handle = record.container_handle().cloned().ok_or_else(|| {
        anyhow::anyhow!(
            "プロセス '{}' は実行されていません（状態: {}）\n\nヒント:\n  • fleetvisor status で状態を確認してください",
            name,
            record.state()
        )
    })?;

    let backend = DockerBackend::connect(
        config.engine.container_prefix.clone(),
        config.engine.pull_missing_images,
    )
    .await?;

    println!(
        "{}",
        format!("=== {} のログ ({}) ===", name, handle).bold().cyan()
    );

    let prefix = format!("[{}]", name).cyan();
    let options = OutputOptions {
        tail: Some(lines),
        follow,
    };
    let mut output = backend.stream_output(&handle, &options);
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                for line in text.lines() {
                    if !line.is_empty() {
                        println!("{} {}", prefix, line);
                    }
                }
            }
            Err(e) => {
                eprintln!("{} {}", "ログ取得エラー:".red(), e);
                break;
            }
        }
    }

    Ok(())
}
