use crate::utils;
use colored::Colorize;
use fleetvisor_container::DockerBackend;
use fleetvisor_core::ProcessState;
use fleetvisor_engine::{Engine, JsonFileStore, SystemClock, TracingSink};
use std::path::Path;
use std::sync::Arc;

pub async fn handle(config_path: &Path, no_start: bool, stop_on_exit: bool) -> anyhow::Result<()> {
    utils::print_config_path(config_path);
    let config = utils::load_config(config_path)?;
    let state_path = utils::state_file(&config, config_path)?;
    let settings = config.engine.clone();

    println!("{}", "Docker に接続中...".blue());
    let backend = DockerBackend::connect(
        settings.container_prefix.clone(),
        settings.pull_missing_images,
    )
    .await
    .map_err(|e| {
        anyhow::anyhow!(
            "Docker に接続できません: {}\n\nヒント:\n  • Docker デーモンが起動しているか確認してください",
            e
        )
    })?;

    tracing::info!(state_file = %state_path.display(), "using state file");
    let engine = Engine::new(
        settings,
        Arc::new(backend),
        Arc::new(JsonFileStore::new(&state_path)),
        Arc::new(TracingSink),
        Arc::new(SystemClock),
    );

    let report = engine.recover().await?;
    if !report.adopted.is_empty() {
        println!(
            "{} {}",
            "✓ 引き継ぎ:".green(),
            report.adopted.join(", ").cyan()
        );
    }
    if !report.crashed.is_empty() {
        println!(
            "{} {}",
            "⚠ コンテナが見つからないプロセス:".yellow(),
            report.crashed.join(", ")
        );
    }
    if !report.force_stopped.is_empty() {
        println!(
            "{} {}個",
            "⚠ 管理外のコンテナを停止:".yellow(),
            report.force_stopped.len()
        );
    }

    let sync = engine.sync_definitions(&config.processes).await?;
    for name in &sync.unmanaged {
        println!(
            "{} {} は設定ファイルにありません（状態は保持されます）",
            "⚠".yellow(),
            name.cyan()
        );
    }

    if !no_start {
        for definition in &config.processes {
            let state = engine.status(&definition.name).await?.state;
            if state != ProcessState::Stopped {
                continue;
            }
            match engine.start(&definition.name).await {
                Ok(()) => println!("  {} {}", "✓".green(), definition.name.cyan()),
                Err(e) => eprintln!("  {} {}: {}", "✗".red(), definition.name.cyan(), e),
            }
        }
    }

    println!();
    println!(
        "{} {}個のプロセスを監視中（Ctrl-C で終了）",
        "▶".green().bold(),
        config.processes.len()
    );

    tokio::signal::ctrl_c().await?;
    println!();
    if stop_on_exit {
        println!("{}", "全プロセスを停止中...".blue());
    }
    engine.shutdown(stop_on_exit).await;
    println!("{}", "✓ 終了しました".green());

    Ok(())
}
