//! ユーザー設定
//!
//! `<config_dir>/layerflow/settings.yaml` から読み込み、環境変数で上書きします。

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// パッチをコミットIDで代用するサイズの既定値
pub const DEFAULT_LARGE_PATCH_THRESHOLD: u64 = 50 * 1024 * 1024;

const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 一時ファイル、クックブック、リモートリポジトリのミラーを置くディレクトリ
    pub build_dir: PathBuf,
    /// ロック取得のタイムアウト（秒）
    pub lock_timeout_secs: u64,
    /// これを超える差分はコミットIDでシグネチャを計算する
    pub large_patch_threshold: u64,
    /// ターゲットを並列にビルドする
    pub parallel: bool,
    /// 失敗したビルドコンテナを残す
    pub introspect_error: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            build_dir: default_build_dir(),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            large_patch_threshold: DEFAULT_LARGE_PATCH_THRESHOLD,
            parallel: false,
            introspect_error: false,
        }
    }
}

fn default_build_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("layerflow")
}

impl Settings {
    /// 既定の場所から読み込み（ファイルがなければ既定値）
    pub fn load() -> Result<Self> {
        Self::load_from(&crate::get_config_dir()?.join("settings.yaml"))
    }

    /// 指定パスから読み込み、環境変数を適用
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = if path.exists() {
            debug!(path = %path.display(), "Loading settings");
            let content = std::fs::read_to_string(path)?;
            if content.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::InvalidSettings {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?
            }
        } else {
            Self::default()
        };
        settings.with_env()
    }

    /// 環境変数による上書き
    ///
    /// - `LAYERFLOW_BUILD_DIR`
    /// - `LAYERFLOW_LOCK_TIMEOUT`（秒）
    /// - `LAYERFLOW_LARGE_PATCH_THRESHOLD`（バイト）
    /// - `LAYERFLOW_PARALLEL`（true/false/1/0）
    pub fn with_env(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("LAYERFLOW_BUILD_DIR") {
            self.build_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse::<u64>("LAYERFLOW_LOCK_TIMEOUT")? {
            self.lock_timeout_secs = secs;
        }
        if let Some(threshold) = env_parse::<u64>("LAYERFLOW_LARGE_PATCH_THRESHOLD")? {
            self.large_patch_threshold = threshold;
        }
        if let Ok(value) = std::env::var("LAYERFLOW_PARALLEL") {
            self.parallel = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        name: "LAYERFLOW_PARALLEL".to_string(),
                        value,
                    });
                }
            };
        }
        Ok(self)
    }

    /// プロジェクトごとのビルドディレクトリ
    pub fn project_build_dir(&self, project: &str) -> PathBuf {
        self.build_dir.join(project)
    }

    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lock_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
