use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "マニフェストが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: layerflow.local.kdl, .layerflow.local.kdl, layerflow.kdl, .layerflow.kdl\n\
        - ./.layerflow/ ディレクトリ\n\
        または LAYERFLOW_CONFIG_PATH 環境変数で直接指定できます"
    )]
    ManifestNotFound,

    #[error("設定ファイルの読み込みに失敗しました: {path}\n理由: {message}")]
    InvalidSettings { path: PathBuf, message: String },

    #[error("環境変数 {name} の値が不正です: {value}")]
    InvalidEnv { name: String, value: String },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
