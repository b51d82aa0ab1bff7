//! アーティファクトの import 定義

use super::stage::StageName;
use serde::{Deserialize, Serialize};

/// import の配置位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactAnchor {
    BeforeInstall,
    AfterInstall,
    BeforeSetup,
    AfterSetup,
}

impl ArtifactAnchor {
    pub const ALL: [ArtifactAnchor; 4] = [
        ArtifactAnchor::BeforeInstall,
        ArtifactAnchor::AfterInstall,
        ArtifactAnchor::BeforeSetup,
        ArtifactAnchor::AfterSetup,
    ];

    /// `before="install"` / `after="setup"` 形式から変換
    pub fn parse(position: &str, stage: &str) -> Option<Self> {
        match (position, stage) {
            ("before", "install") => Some(ArtifactAnchor::BeforeInstall),
            ("after", "install") => Some(ArtifactAnchor::AfterInstall),
            ("before", "setup") => Some(ArtifactAnchor::BeforeSetup),
            ("after", "setup") => Some(ArtifactAnchor::AfterSetup),
            _ => None,
        }
    }

    /// この位置に対応するアーティファクトステージ
    pub fn stage(self) -> StageName {
        match self {
            ArtifactAnchor::BeforeInstall => StageName::BeforeInstallArtifact,
            ArtifactAnchor::AfterInstall => StageName::AfterInstallArtifact,
            ArtifactAnchor::BeforeSetup => StageName::BeforeSetupArtifact,
            ArtifactAnchor::AfterSetup => StageName::AfterSetupArtifact,
        }
    }
}

/// 他のアーティファクトからファイルを取り込む設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactImport {
    pub artifact: String,
    pub add: String,
    pub to: String,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub anchor: ArtifactAnchor,
}

impl ArtifactImport {
    pub fn new(artifact: impl Into<String>, add: impl Into<String>, anchor: ArtifactAnchor) -> Self {
        let add = add.into();
        Self {
            artifact: artifact.into(),
            to: add.clone(),
            add,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            owner: None,
            group: None,
            anchor,
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }
}
