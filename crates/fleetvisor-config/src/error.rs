use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("ユーザー設定ディレクトリを特定できません（HOME が設定されているか確認してください）")]
    ConfigDirNotFound,

    #[error(
        "FLEETVISOR_CONFIG で指定された設定ファイルがありません: {}\n\nヒント:\n  • パスを確認するか、環境変数を外してプロジェクトの設定を使ってください",
        path.display()
    )]
    ExplicitConfigMissing { path: PathBuf },

    #[error(
        "設定ファイルが見つかりません。確認した場所:\n{searched}\n\nヒント:\n  • fleetvisor.kdl を作成するか、--config / FLEETVISOR_CONFIG で指定してください"
    )]
    ConfigFileNotFound { searched: String },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
