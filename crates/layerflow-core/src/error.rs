use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("KDLパースエラー: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO エラー: {path}\n理由: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("無効な設定: {0}")]
    InvalidConfig(String),

    #[error("ターゲット '{0}' が重複しています")]
    DuplicateTarget(String),

    #[error("ターゲット '{0}' に from が指定されていません")]
    MissingFrom(String),

    #[error("ターゲット '{target}' にビルダーが複数指定されています (shell/chef/ansible のいずれか1つ)")]
    MultipleBuilders { target: String },

    #[error("ターゲット '{target}' の git '{repo}' には branch/tag/commit のいずれか1つだけを指定してください")]
    ConflictingGitPin { target: String, repo: String },

    #[error("ターゲット '{target}' が未定義のアーティファクト '{artifact}' を import しています")]
    UnknownArtifact { target: String, artifact: String },

    #[error(
        "ターゲット '{target}' の import '{artifact}' に配置位置がありません\nヒント: before=\"install\" のように before/after を指定してください"
    )]
    MissingAnchor { target: String, artifact: String },

    #[error("ターゲット '{target}' のアーティファクト配置先 '{to}' が衝突しています: {detail}")]
    ArtifactConflict {
        target: String,
        to: String,
        detail: String,
    },

    #[error("ターゲット '{target}' のビルダーに必要なファイルがありません: {path}")]
    MissingBuilderFile { target: String, path: PathBuf },

    #[error("循環依存が検出されました: {0}")]
    CircularDependency(String),
}

pub type Result<T> = std::result::Result<T, ManifestError>;
