use fleetvisor_container::ContainerError;
use fleetvisor_core::{CoreError, ProcessState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("プロセス '{0}' が見つかりません")]
    NotFound(String),

    #[error("プロセス '{0}' は既に登録されています")]
    AlreadyExists(String),

    #[error("プロセス '{name}' は既に起動しています（状態: {state}）")]
    AlreadyRunning { name: String, state: ProcessState },

    #[error(
        "プロセス '{name}' は別の操作を実行中です\n\nヒント:\n  • しばらく待ってから再実行してください\n  • engine の lock-timeout を延ばすこともできます"
    )]
    Busy { name: String },

    #[error(
        "プロセス '{name}' はコンテナを持っていません（状態: {state}）\n\nヒント:\n  • fleetvisor status で状態を確認してください"
    )]
    NotRunning { name: String, state: ProcessState },

    #[error("プロセス '{name}' の状態遷移 {from} → {to} は許可されていません")]
    InvalidTransition {
        name: String,
        from: ProcessState,
        to: ProcessState,
    },

    #[error("プロセス '{name}' のコンテナ操作に失敗しました: {source}")]
    Backend {
        name: String,
        #[source]
        source: ContainerError,
    },

    #[error("無効なスケジュール: {0}")]
    InvalidSchedule(String),

    #[error("状態ファイルエラー: {0}")]
    Store(String),

    #[error("{0}")]
    Core(CoreError),
}

impl EngineError {
    pub(crate) fn backend(name: &str, source: ContainerError) -> Self {
        EngineError::Backend {
            name: name.to_string(),
            source,
        }
    }

    /// 時間をおけば回復しうるエラーか（バックエンドの一時的な不調）
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Busy { .. })
            || matches!(self, EngineError::Backend { source, .. } if source.is_transient())
    }

    /// その起動試行にとって致命的なエラーか
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Backend { source, .. } if source.is_fatal())
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidTransition { name, from, to } => {
                EngineError::InvalidTransition { name, from, to }
            }
            CoreError::IntervalTooShort { .. }
            | CoreError::IntervalTooLong { .. }
            | CoreError::InvalidDuration { .. } => {
                EngineError::InvalidSchedule(err.to_string())
            }
            other => EngineError::Core(other),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
