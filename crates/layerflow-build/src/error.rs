use layerflow_container::ContainerError;
use layerflow_core::{ManifestError, StageName};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("マニフェストエラー: {0}")]
    Config(#[from] ManifestError),

    #[error("シグネチャの入力を取得できません: {0}")]
    SignatureInputUnavailable(String),

    #[error("ロック '{name}' の取得がタイムアウトしました ({}秒)", .timeout.as_secs())]
    CacheLockTimeout { name: String, timeout: Duration },

    #[error("{0}")]
    RuntimeCommandFailed(#[from] ContainerError),

    #[error("アーティファクトの依存が循環しています: {0}")]
    CyclicArtifactDependency(String),

    #[error("レジストリ '{repo}' に接続できません: {message}")]
    RegistryUnavailable { repo: String, message: String },

    #[error("イメージ '{0}' はまだビルドされていません")]
    ImageNotExist(String),

    #[error("イメージ '{0}' のタグは既に外されています")]
    ImageAlreadyUntagged(String),

    #[error("ターゲット '{target}' のステージ '{stage}' で失敗しました: {source}")]
    StageFailed {
        target: String,
        stage: StageName,
        #[source]
        source: Box<BuildError>,
    },

    #[error("git コマンドが失敗しました ({command}): {message}")]
    GitCommandFailed { command: String, message: String },

    #[error("無効なイメージ名です: {0}")]
    InvalidName(String),

    #[error("ターゲット '{0}' がマニフェストにありません")]
    UnknownTarget(String),

    #[error("GC で {0} 件のエラーが発生しました")]
    GcFailed(usize),

    #[error("ファイルエラー: {path}\n理由: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::File {
            path: path.into(),
            source,
        }
    }

    /// ステージ失敗として包む（既に包まれていればそのまま）
    pub fn in_stage(self, target: &str, stage: StageName) -> Self {
        match self {
            BuildError::StageFailed { .. } => self,
            other => BuildError::StageFailed {
                target: target.to_string(),
                stage,
                source: Box::new(other),
            },
        }
    }

    /// 一時的な失敗か（再実行で回復しうる）
    pub fn is_recoverable(&self) -> bool {
        match self {
            BuildError::CacheLockTimeout { .. } | BuildError::RegistryUnavailable { .. } => true,
            BuildError::StageFailed { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// 最も内側のエラー
    pub fn root_cause(&self) -> &BuildError {
        match self {
            BuildError::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::StageFailed {
                target,
                stage,
                source,
            } => {
                format!(
                    "ターゲット '{}' のステージ '{}' で失敗しました\n\n{}",
                    target,
                    stage,
                    source.user_message()
                )
            }
            BuildError::SignatureInputUnavailable(detail) => {
                format!(
                    "シグネチャの入力を取得できません: {}\n\
                     \n\
                     解決方法:\n\
                     1. git リポジトリの参照（branch/tag/commit）を確認してください\n\
                     2. 履歴から消えたコミットを参照するキャッシュは次のコマンドで削除できます:\n\
                        layerflow gc --git-commits",
                    detail
                )
            }
            BuildError::CacheLockTimeout { name, timeout } => {
                format!(
                    "ロック '{}' を {}秒以内に取得できませんでした\n\
                     \n\
                     別の layerflow プロセスが同じリソースを使用中です。\n\
                     終了を待ってから再実行するか、LAYERFLOW_LOCK_TIMEOUT を延ばしてください。",
                    name,
                    timeout.as_secs()
                )
            }
            BuildError::RuntimeCommandFailed(err) => match err.introspect_container() {
                Some(container) => format!(
                    "{}\n\
                     \n\
                     失敗したコンテナを残しました。調査するには:\n\
                        docker commit {} layerflow-introspect && docker run -it --rm layerflow-introspect sh",
                    err, container
                ),
                None => format!(
                    "{}\n\
                     \n\
                     --introspect-error を付けると失敗したコンテナを残せます。",
                    err
                ),
            },
            BuildError::CyclicArtifactDependency(path) => {
                format!(
                    "アーティファクトの依存が循環しています: {}\n\
                     \n\
                     layerflow.kdl の import を確認してください。",
                    path
                )
            }
            BuildError::RegistryUnavailable { repo, message } => {
                format!(
                    "レジストリ '{}' に接続できません: {}\n\
                     \n\
                     docker login でログインしているか確認してください。",
                    repo, message
                )
            }
            _ => format!("{}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_stage_wraps_once() {
        let err = BuildError::ImageNotExist("shop-stages:abc".into())
            .in_stage("backend", StageName::Install)
            .in_stage("backend", StageName::Setup);

        match &err {
            BuildError::StageFailed { target, stage, .. } => {
                assert_eq!(target, "backend");
                assert_eq!(*stage, StageName::Install);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(err.root_cause(), BuildError::ImageNotExist(_)));
        assert!(err.user_message().contains("install"));
    }

    #[test]
    fn test_recoverable() {
        let timeout = BuildError::CacheLockTimeout {
            name: "shop.images".into(),
            timeout: Duration::from_secs(3),
        };
        assert!(timeout.is_recoverable());
        assert!(
            timeout
                .in_stage("app", StageName::From)
                .is_recoverable()
        );
        assert!(!BuildError::CyclicArtifactDependency("a -> a".into()).is_recoverable());
    }

    #[test]
    fn test_signature_hint() {
        let err = BuildError::SignatureInputUnavailable("commit abc".into());
        assert!(err.user_message().contains("layerflow gc --git-commits"));
    }
}
