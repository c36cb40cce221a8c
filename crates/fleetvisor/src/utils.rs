use anyhow::Context;
use colored::Colorize;
use fleetvisor_core::FleetConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// tracing の初期化
///
/// `RUST_LOG` が無ければ info。`log_file` 指定時はファイルへ追記する。
pub fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("ログファイルを開けません: {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_writer(file)
                .with_env_filter(filter)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
    }
    Ok(())
}

/// 使用する設定ファイルを決める
pub fn locate_config(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(path) if path.exists() => Ok(path.to_path_buf()),
        Some(path) => Err(anyhow::anyhow!(
            "設定ファイルが見つかりません: {}",
            path.display()
        )),
        None => Ok(fleetvisor_config::find_config_file()?),
    }
}

/// 設定ファイルを読み込む
pub fn load_config(path: &Path) -> anyhow::Result<FleetConfig> {
    let config = fleetvisor_core::parse_config_file(path)?;
    Ok(config)
}

pub fn print_config_path(path: &Path) {
    println!(
        "{} {}",
        "設定ファイル:".dimmed(),
        path.display().to_string().cyan()
    );
}

/// 状態ファイルのパス
pub fn state_file(config: &FleetConfig, config_path: &Path) -> anyhow::Result<PathBuf> {
    Ok(fleetvisor_config::resolve_state_file(
        config.engine.state_file.as_deref(),
        config_path,
    )?)
}

/// 状態ごとの色付け
pub fn paint_state(state: fleetvisor_core::ProcessState) -> colored::ColoredString {
    use fleetvisor_core::ProcessState;

    let text = state.to_string();
    match state {
        ProcessState::Running => text.green(),
        ProcessState::Starting | ProcessState::Stopping => text.cyan(),
        ProcessState::Stopped => text.dimmed(),
        ProcessState::Crashed => text.red().bold(),
        ProcessState::Backoff => text.yellow(),
    }
}
