use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error(
        "Dockerに接続できません: {0}\n\nヒント:\n  • Dockerが起動しているか確認してください\n  • OrbStackまたはDocker Desktopがインストールされているか確認してください"
    )]
    DockerConnectionFailed(String),

    #[error(
        "イメージ '{image}' が見つかりません\n\nヒント:\n  • イメージ名とタグを確認してください\n  • docker pull {image} でイメージをダウンロードしてください"
    )]
    ImageNotFound { image: String },

    #[error("イメージ '{image}' はコンテナで使用中です: {}", .containers.join(", "))]
    ImageInUse {
        image: String,
        containers: Vec<String>,
    },

    #[error("イメージ '{image}' を削除できません: {message}")]
    ImageConflict { image: String, message: String },

    #[error("{}コマンドが失敗しました{}: {message}",
        .container.as_ref().map(|c| format!("コンテナ '{}' の", c)).unwrap_or_default(),
        .exit_code.map(|c| format!(" (exit {})", c)).unwrap_or_default())]
    CommandFailed {
        /// 調査用に残したコンテナ
        container: Option<String>,
        message: String,
        exit_code: Option<i64>,
    },

    #[error("レジストリ認証に失敗しました: {registry}\n理由: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("イメージ '{image}' の転送に失敗しました: {message}")]
    TransferFailed { image: String, message: String },

    #[error("Docker APIエラー: {0}")]
    DockerApiError(String),
}

impl From<bollard::errors::Error> for ContainerError {
    fn from(err: bollard::errors::Error) -> Self {
        match &err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => {
                // 404 はイメージ未検出として扱う（呼び出し側で名前を補う）
                ContainerError::ImageNotFound {
                    image: message.clone(),
                }
            }
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => ContainerError::ImageConflict {
                image: String::new(),
                message: message.clone(),
            },
            _ => {
                // 接続エラーの可能性をチェック
                let err_str = err.to_string();
                if err_str.contains("Connection refused")
                    || err_str.contains("No such file or directory")
                {
                    ContainerError::DockerConnectionFailed(err_str)
                } else {
                    ContainerError::DockerApiError(err_str)
                }
            }
        }
    }
}

impl ContainerError {
    /// 404 由来のエラーか
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::ImageNotFound { .. })
    }

    /// 調査用に残したコンテナID
    pub fn introspect_container(&self) -> Option<&str> {
        match self {
            ContainerError::CommandFailed { container, .. } => container.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ContainerError>;
