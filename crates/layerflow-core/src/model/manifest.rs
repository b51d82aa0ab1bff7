//! マニフェスト全体

use super::target::TargetConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// `layerflow.kdl` 1ファイル分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub project: String,
    /// マニフェストのあるディレクトリ
    pub root: PathBuf,
    /// 宣言順のイメージ
    pub images: Vec<TargetConfig>,
    pub artifacts: BTreeMap<String, TargetConfig>,
}

impl Manifest {
    pub fn new(project: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            root: root.into(),
            images: Vec::new(),
            artifacts: BTreeMap::new(),
        }
    }

    /// 名前でイメージを検索（None は無名イメージ）
    pub fn image(&self, name: Option<&str>) -> Option<&TargetConfig> {
        self.images.iter().find(|image| image.name.as_deref() == name)
    }

    pub fn artifact(&self, name: &str) -> Option<&TargetConfig> {
        self.artifacts.get(name)
    }

    /// イメージ、アーティファクトの順に名前で検索
    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.image(Some(name)).or_else(|| self.artifact(name))
    }

    /// 名前のフィルタに合うイメージ（空なら全て）
    pub fn select_images(&self, names: &[String]) -> Vec<&TargetConfig> {
        if names.is_empty() {
            return self.images.iter().collect();
        }
        self.images
            .iter()
            .filter(|image| {
                image
                    .name
                    .as_ref()
                    .is_some_and(|name| names.iter().any(|n| n == name))
            })
            .collect()
    }
}
