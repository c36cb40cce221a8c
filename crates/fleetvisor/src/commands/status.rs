use crate::utils;
use chrono::Utc;
use colored::Colorize;
use fleetvisor_engine::{JsonFileStore, ProcessStatus, describe_next_fire, describe_uptime};
use std::path::Path;

pub async fn handle(config_path: &Path, name: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = utils::load_config(config_path)?;
    let state_path = utils::state_file(&config, config_path)?;
    let state = JsonFileStore::new(&state_path).read_file().await?;

    let now = Utc::now();
    let statuses: Vec<ProcessStatus> = match name {
        Some(name) => {
            let record = state.processes.get(name).ok_or_else(|| {
                anyhow::anyhow!(
                    "プロセス '{}' の記録がありません\n\nヒント:\n  • fleetvisor run で一度起動してください",
                    name
                )
            })?;
            vec![ProcessStatus::from_record(record, now)]
        }
        None => state
            .processes
            .values()
            .map(|record| ProcessStatus::from_record(record, now))
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("{}", "記録されたプロセスはありません".dimmed());
        return Ok(());
    }

    println!(
        "{} {}",
        "状態ファイル:".dimmed(),
        state_path.display().to_string().cyan()
    );
    println!(
        "{}",
        format!(
            "{:<20} {:<10} {:<14} {:<8} {:<8} {:<10} {}",
            "NAME", "STATE", "CONTAINER", "UPTIME", "CRASHES", "EXIT", "SCHEDULE"
        )
        .bold()
    );
    for status in &statuses {
        let container = status.container.as_deref().unwrap_or("-");
        let exit = status
            .last_exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string());
        let uptime = status
            .uptime_secs
            .map(describe_uptime)
            .unwrap_or_else(|| "-".to_string());
        let schedule = match &status.schedule {
            Some(schedule) => format!(
                "every {} (next {})",
                schedule.interval,
                describe_next_fire(schedule.next_fire_at, now)
            ),
            None => "-".to_string(),
        };

        println!(
            "{:<20} {:<10} {:<14} {:<8} {:<8} {:<10} {}",
            status.name.cyan(),
            utils::paint_state(status.state),
            container,
            uptime,
            status.crash_count,
            exit,
            schedule
        );
    }

    Ok(())
}
