//! ステージのログ出力とグループ分け
//!
//! ターゲットとアーティファクトで出力の詳しさだけを切り替えます。

use layerflow_core::StageName;

/// ステージ1つの出来事
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent<'a> {
    /// 既存イメージを使用
    Cached { signature: &'a str },
    Building { signature: &'a str },
    Built { signature: &'a str, image_id: &'a str },
    /// 中身がなく直前のシグネチャを引き継ぐ
    Empty,
    /// より後ろのステージが既にあるので確認不要
    Skipped,
}

pub trait LoggingPolicy: Send + Sync {
    fn group_started(&self, target: &str, group: &str);

    fn stage_event(&self, target: &str, stage: StageName, event: StageEvent<'_>);
}

/// イメージ用（info）
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetLogging;

/// アーティファクト用（debug）
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactLogging;

fn short(signature: &str) -> &str {
    &signature[..signature.len().min(12)]
}

impl LoggingPolicy for TargetLogging {
    fn group_started(&self, target: &str, group: &str) {
        tracing::info!(target_name = target, "{} group", group);
    }

    fn stage_event(&self, target: &str, stage: StageName, event: StageEvent<'_>) {
        match event {
            StageEvent::Cached { signature } => {
                tracing::info!(target_name = target, %stage, signature = short(signature), "Using cache")
            }
            StageEvent::Building { signature } => {
                tracing::info!(target_name = target, %stage, signature = short(signature), "Building stage")
            }
            StageEvent::Built {
                signature,
                image_id,
            } => tracing::info!(
                target_name = target,
                %stage,
                signature = short(signature),
                image_id,
                "Stage built"
            ),
            StageEvent::Empty => tracing::debug!(target_name = target, %stage, "Stage is empty"),
            StageEvent::Skipped => tracing::debug!(target_name = target, %stage, "Stage skipped"),
        }
    }
}

impl LoggingPolicy for ArtifactLogging {
    fn group_started(&self, target: &str, group: &str) {
        tracing::debug!(artifact = target, "{} group", group);
    }

    fn stage_event(&self, target: &str, stage: StageName, event: StageEvent<'_>) {
        match event {
            StageEvent::Built { image_id, .. } => {
                tracing::debug!(artifact = target, %stage, image_id, "Artifact stage built")
            }
            StageEvent::Empty | StageEvent::Skipped => {
                tracing::trace!(artifact = target, %stage, ?event, "Artifact stage")
            }
            _ => tracing::debug!(artifact = target, %stage, ?event, "Artifact stage"),
        }
    }
}

/// ステージのグループ分け
pub trait GroupingPolicy: Send + Sync {
    fn group_of(&self, stage: StageName) -> &'static str;
}

/// Foundation / Install / Setup / Final の4グループ
#[derive(Debug, Clone, Copy, Default)]
pub struct StageGrouping;

impl GroupingPolicy for StageGrouping {
    fn group_of(&self, stage: StageName) -> &'static str {
        match stage {
            StageName::From | StageName::BeforeInstall | StageName::BeforeInstallArtifact => {
                "Foundation"
            }
            StageName::GitArchive
            | StageName::PreInstallPatch
            | StageName::Install
            | StageName::PostInstallPatch
            | StageName::AfterInstallArtifact => "Install",
            StageName::BeforeSetup
            | StageName::BeforeSetupArtifact
            | StageName::PreSetupPatch
            | StageName::Setup
            | StageName::PostSetupPatch
            | StageName::AfterSetupArtifact => "Setup",
            StageName::LatestPatch | StageName::DockerInstructions => "Final",
        }
    }
}
