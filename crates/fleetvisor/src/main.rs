mod commands;
mod utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fleetvisor")]
#[command(about = "コンテナ化された常駐プロセスを見守る。落ちたら起こし、決まった時間に入れ替える。", long_about = None)]
struct Cli {
    /// 設定ファイルのパス（省略時は自動検出、FLEETVISOR_CONFIG 環境変数）
    #[arg(short, long, global = true, env = "FLEETVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// ログをファイルに出力（ANSI カラーなし）
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 設定を読み込み、Ctrl-C まで全プロセスを監視
    Run {
        /// 停止中のプロセスを自動起動しない
        #[arg(long)]
        no_start: bool,
        /// 終了時に全プロセスを停止する（デフォルトは動かしたまま監視だけ外す）
        #[arg(long)]
        stop_on_exit: bool,
    },
    /// 保存された状態を表示
    Status {
        /// プロセス名（省略時は全プロセス）
        name: Option<String>,
        /// JSON で出力
        #[arg(long)]
        json: bool,
    },
    /// 実行中コンテナの出力を表示
    Logs {
        /// プロセス名
        name: String,
        /// 最新N行
        #[arg(short = 'n', long, default_value = "100")]
        lines: usize,
        /// リアルタイム追従
        #[arg(short, long)]
        follow: bool,
    },
    /// 設定を検証
    Validate,
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    utils::init_tracing(cli.log_file.as_deref())?;

    if matches!(cli.command, Commands::Version) {
        println!("fleetvisor {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config_path = utils::locate_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            no_start,
            stop_on_exit,
        } => {
            commands::run::handle(&config_path, no_start, stop_on_exit).await?;
        }
        Commands::Status { name, json } => {
            commands::status::handle(&config_path, name.as_deref(), json).await?;
        }
        Commands::Logs {
            name,
            lines,
            follow,
        } => {
            commands::logs::handle(&config_path, &name, lines, follow).await?;
        }
        Commands::Validate => {
            commands::validate::handle(&config_path)?;
        }
        Commands::Version => {
            unreachable!("Version is handled before config loading");
        }
    }

    Ok(())
}
