//! ステージ名
//!
//! 1ターゲットのビルドパイプラインは常に同じ16個のステージで構成されます。
//! 中身のないステージも位置を占め、直前のシグネチャをそのまま引き継ぎます。

use crate::error::ManifestError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// パイプライン上のステージ位置
///
/// 宣言順がそのままビルド順になります。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    From,
    BeforeInstall,
    BeforeInstallArtifact,
    GitArchive,
    PreInstallPatch,
    Install,
    PostInstallPatch,
    AfterInstallArtifact,
    BeforeSetup,
    BeforeSetupArtifact,
    PreSetupPatch,
    Setup,
    PostSetupPatch,
    AfterSetupArtifact,
    LatestPatch,
    DockerInstructions,
}

impl StageName {
    pub const ALL: [StageName; 16] = [
        StageName::From,
        StageName::BeforeInstall,
        StageName::BeforeInstallArtifact,
        StageName::GitArchive,
        StageName::PreInstallPatch,
        StageName::Install,
        StageName::PostInstallPatch,
        StageName::AfterInstallArtifact,
        StageName::BeforeSetup,
        StageName::BeforeSetupArtifact,
        StageName::PreSetupPatch,
        StageName::Setup,
        StageName::PostSetupPatch,
        StageName::AfterSetupArtifact,
        StageName::LatestPatch,
        StageName::DockerInstructions,
    ];

    /// ビルダーがコマンドを実行するステージ
    pub const BUILDER_STAGES: [StageName; 4] = [
        StageName::BeforeInstall,
        StageName::Install,
        StageName::BeforeSetup,
        StageName::Setup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::From => "from",
            StageName::BeforeInstall => "before_install",
            StageName::BeforeInstallArtifact => "before_install_artifact",
            StageName::GitArchive => "git_archive",
            StageName::PreInstallPatch => "pre_install_patch",
            StageName::Install => "install",
            StageName::PostInstallPatch => "post_install_patch",
            StageName::AfterInstallArtifact => "after_install_artifact",
            StageName::BeforeSetup => "before_setup",
            StageName::BeforeSetupArtifact => "before_setup_artifact",
            StageName::PreSetupPatch => "pre_setup_patch",
            StageName::Setup => "setup",
            StageName::PostSetupPatch => "post_setup_patch",
            StageName::AfterSetupArtifact => "after_setup_artifact",
            StageName::LatestPatch => "latest_patch",
            StageName::DockerInstructions => "docker_instructions",
        }
    }

    /// チェーン内の位置
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_builder_stage(self) -> bool {
        Self::BUILDER_STAGES.contains(&self)
    }

    /// git の stage_dependencies で指定できるステージか
    pub fn accepts_git_dependencies(self) -> bool {
        matches!(
            self,
            StageName::Install | StageName::BeforeSetup | StageName::Setup
        )
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| ManifestError::InvalidConfig(format!("unknown stage: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_matches_index() {
        for (idx, stage) in StageName::ALL.iter().enumerate() {
            assert_eq!(stage.index(), idx);
        }
        assert!(StageName::From < StageName::DockerInstructions);
    }

    #[test]
    fn test_stage_name_round_trip() {
        for stage in StageName::ALL {
            assert_eq!(stage.as_str().parse::<StageName>().unwrap(), stage);
        }
        assert!("build_artifact".parse::<StageName>().is_err());
    }
}
