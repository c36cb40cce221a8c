use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContainerError {
    #[error(
        "コンテナランタイムに接続できません: {0}\n\nヒント:\n  • Dockerが起動しているか確認してください\n  • DOCKER_HOST の設定を確認してください"
    )]
    BackendUnavailable(String),

    #[error(
        "イメージ '{image}' が見つかりません\n\nヒント:\n  • イメージ名とタグを確認してください\n  • docker pull {image} でイメージをダウンロードしてください"
    )]
    ImageNotFound { image: String },

    #[error("リソースが不足しています: {0}")]
    ResourceExhausted(String),

    #[error("コンテナ '{container}' が見つかりません")]
    ContainerNotFound { container: String },

    #[error("コンテナ '{container}' は既に存在します")]
    Conflict { container: String },

    #[error("Docker APIエラー: {0}")]
    DockerApiError(String),
}

impl ContainerError {
    /// 時間をおけば回復しうるエラーか
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ContainerError::BackendUnavailable(_) | ContainerError::DockerApiError(_)
        )
    }

    /// その起動試行にとって致命的なエラーか（自動リトライしても成功しない）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ContainerError::ImageNotFound { .. } | ContainerError::ResourceExhausted(_)
        )
    }
}

fn is_resource_exhaustion(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("no space left")
        || message.contains("cannot allocate memory")
        || message.contains("out of memory")
        || message.contains("too many open files")
        || message.contains("resource temporarily unavailable")
}

impl From<bollard::errors::Error> for ContainerError {
    fn from(err: bollard::errors::Error) -> Self {
        match &err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => {
                if message.contains("No such image") {
                    ContainerError::ImageNotFound {
                        image: message.clone(),
                    }
                } else {
                    ContainerError::ContainerNotFound {
                        container: message.clone(),
                    }
                }
            }
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => ContainerError::Conflict {
                container: message.clone(),
            },
            bollard::errors::Error::DockerResponseServerError { message, .. }
                if is_resource_exhaustion(message) =>
            {
                ContainerError::ResourceExhausted(message.clone())
            }
            _ => {
                // 接続エラーの可能性をチェック
                let err_str = err.to_string();
                if err_str.contains("Connection refused")
                    || err_str.contains("No such file or directory")
                    || err_str.contains("error trying to connect")
                {
                    ContainerError::BackendUnavailable(err_str)
                } else if is_resource_exhaustion(&err_str) {
                    ContainerError::ResourceExhausted(err_str)
                } else {
                    ContainerError::DockerApiError(err_str)
                }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ContainerError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status_code: u16, message: &str) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_classify_not_found() {
        let err: ContainerError = server_error(404, "No such image: mybot:latest").into();
        assert!(matches!(err, ContainerError::ImageNotFound { .. }));
        assert!(err.is_fatal());

        let err: ContainerError = server_error(404, "No such container: abc").into();
        assert!(matches!(err, ContainerError::ContainerNotFound { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_classify_conflict() {
        let err: ContainerError = server_error(409, "name already in use").into();
        assert!(matches!(err, ContainerError::Conflict { .. }));
    }

    #[test]
    fn test_classify_resource_exhausted() {
        let err: ContainerError = server_error(500, "write /var/lib: no space left on device").into();
        assert!(matches!(err, ContainerError::ResourceExhausted(_)));
        assert!(err.is_fatal());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_errors() {
        assert!(ContainerError::BackendUnavailable("down".into()).is_transient());
        assert!(!ContainerError::ImageNotFound { image: "x".into() }.is_transient());
    }
}
