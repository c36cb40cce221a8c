use crate::utils;
use colored::Colorize;
use fleetvisor_core::FleetConfig;
use std::path::Path;

pub fn handle(config_path: &Path) -> anyhow::Result<()> {
    println!("{}", "設定を検証中...".blue());
    utils::print_config_path(config_path);

    let config = match utils::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("{}", "✗ 設定ファイルにエラーがあります".red().bold());
            return Err(e);
        }
    };

    println!("{}", "✓ 設定ファイルは正常です！".green().bold());
    println!();
    print_summary(&config);
    Ok(())
}

fn print_summary(config: &FleetConfig) {
    let engine = &config.engine;
    println!("サマリー:");
    println!(
        "  エンジン: exit-detection={:?}, grace={}s, poll={}s, reconcile={:?}",
        engine.exit_detection,
        engine.grace_period.as_secs(),
        engine.poll_interval.as_secs(),
        engine.reconcile
    );
    println!(
        "  バックオフ: {}s → 最大 {}s (x{})",
        engine.backoff.base.as_secs(),
        engine.backoff.max.as_secs(),
        engine.backoff.multiplier
    );

    println!("  プロセス: {}個", config.processes.len());
    for process in &config.processes {
        let policy = &process.restart_policy;
        let restart = if policy.auto_restart {
            format!(
                "auto, {}回/{}s",
                policy.max_crash_restarts_per_window,
                policy.window.as_secs()
            )
        } else {
            "manual".to_string()
        };
        let schedule = process
            .schedule
            .map(|interval| format!(", every {}", interval))
            .unwrap_or_default();

        println!(
            "    - {} ({}) [{}{}]",
            process.name.cyan(),
            process.image_ref,
            restart,
            schedule
        );
    }
}
