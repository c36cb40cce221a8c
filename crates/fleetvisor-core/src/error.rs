use crate::model::ProcessState;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("KDLパースエラー: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO エラー: {path}\n理由: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("無効な設定: {0}")]
    InvalidConfig(String),

    #[error("無効な期間指定 '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    #[error(
        "スケジュール間隔 '{input}' が短すぎます（最小: {min_secs}秒）\n\nヒント:\n  • 30m, 2h, 2.5h, 1d のように指定してください"
    )]
    IntervalTooShort { input: String, min_secs: u64 },

    #[error(
        "スケジュール間隔 '{input}' が長すぎます（最大: {max_secs}秒）\n\nヒント:\n  • 365d 以下で指定してください"
    )]
    IntervalTooLong { input: String, max_secs: u64 },

    #[error("プロセス '{name}' の状態遷移 {from} → {to} は許可されていません")]
    InvalidTransition {
        name: String,
        from: ProcessState,
        to: ProcessState,
    },

    #[error("プロセス '{0}' が重複して定義されています")]
    DuplicateProcess(String),

    #[error("プロセス '{0}' に image が指定されていません")]
    MissingImage(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
