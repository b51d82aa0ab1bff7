//! ターゲット1つ分のステージ列
//!
//! ステージは宣言順の `Vec` に持ち、前後のステージは添字で参照します。

use crate::BUILD_CACHE_VERSION;
use crate::hasher::{HashInput, hashsum};
use crate::labels;
use crate::stage::{Stage, own_checksum_inputs};
use layerflow_core::StageName;

#[derive(Debug)]
pub struct BuildStageChain {
    project: String,
    target: String,
    stages: Vec<Stage>,
}

impl BuildStageChain {
    pub fn new(project: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            target: target.into(),
            stages: Vec::with_capacity(StageName::ALL.len()),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// 次の位置にステージを追加して添字を返す
    pub fn push(&mut self, stage: Stage) -> usize {
        debug_assert_eq!(
            stage.name().index(),
            self.stages.len(),
            "stages must be pushed in pipeline order"
        );
        self.stages.push(stage);
        self.stages.len() - 1
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.stages.len() == StageName::ALL.len()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn get(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn stage(&self, name: StageName) -> Option<&Stage> {
        self.stages.get(name.index())
    }

    pub fn previous(&self, index: usize) -> Option<usize> {
        index.checked_sub(1).filter(|i| *i < self.stages.len())
    }

    pub fn next(&self, index: usize) -> Option<usize> {
        let next = index + 1;
        (next < self.stages.len()).then_some(next)
    }

    /// ステージのシグネチャ（初回のみ計算）
    ///
    /// 空のステージは直前のシグネチャを返します。
    pub fn signature(&self, index: usize) -> &str {
        let stage = &self.stages[index];
        stage.signature.get_or_init(|| {
            let own = own_checksum_inputs(stage.kind());
            match (self.previous(index), own) {
                (Some(previous), None) => self.signature(previous).to_string(),
                (previous, own) => {
                    let mut inputs: Vec<HashInput> = Vec::new();
                    if let Some(previous) = previous {
                        inputs.push(self.signature(previous).into());
                    }
                    inputs.push(BUILD_CACHE_VERSION.into());
                    inputs.extend(own.unwrap_or_default());
                    hashsum(inputs)
                }
            }
        })
    }

    pub fn stage_signature(&self, name: StageName) -> Option<&str> {
        (name.index() < self.stages.len()).then(|| self.signature(name.index()))
    }

    /// 最後のステージのシグネチャ
    pub fn final_signature(&self) -> &str {
        match self.stages.len() {
            0 => "",
            n => self.signature(n - 1),
        }
    }

    /// ステージのイメージ名（空のステージは直前と同じ名前）
    pub fn image_name(&self, index: usize) -> String {
        labels::stage_image_name(&self.project, self.signature(index))
    }

    pub fn stage_image_name(&self, name: StageName) -> Option<String> {
        (name.index() < self.stages.len()).then(|| self.image_name(name.index()))
    }

    /// 中身のある最後のステージ
    pub fn last_non_empty(&self) -> Option<usize> {
        (0..self.stages.len())
            .rev()
            .find(|i| !self.stages[*i].is_empty())
    }

    /// 中身のあるステージの添字（後ろから）
    pub fn non_empty_rev(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.stages.len())
            .rev()
            .filter(|i| !self.stages[*i].is_empty())
    }

    /// グループの先頭ステージか
    pub fn begins_group(&self, index: usize) -> bool {
        match self.previous(index) {
            None => true,
            Some(previous) => self.stages[previous].group() != self.stages[index].group(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{StageGrouping, TargetLogging};
    use crate::stage::{BuilderInputs, BuilderStage, StageKind, StagePolicies};
    use layerflow_core::DockerDirectives;
    use std::sync::Arc;

    fn policies() -> StagePolicies {
        StagePolicies {
            logging: Arc::new(TargetLogging),
            grouping: Arc::new(StageGrouping),
        }
    }

    fn kind_for(stage: StageName, install: &str) -> StageKind {
        match stage {
            StageName::From => StageKind::From {
                image: "base:1.0".into(),
                cache_version: None,
            },
            StageName::Install => StageKind::Builder(BuilderStage {
                inputs: BuilderInputs::Shell {
                    commands: vec![install.to_string()],
                    cache_version: None,
                },
                dependency_checksum: None,
            }),
            s if s.is_builder_stage() => StageKind::Builder(BuilderStage {
                inputs: BuilderInputs::Shell {
                    commands: Vec::new(),
                    cache_version: None,
                },
                dependency_checksum: None,
            }),
            StageName::GitArchive => StageKind::GitArchive(Vec::new()),
            StageName::DockerInstructions => StageKind::DockerInstructions(DockerDirectives::default()),
            StageName::BeforeInstallArtifact
            | StageName::AfterInstallArtifact
            | StageName::BeforeSetupArtifact
            | StageName::AfterSetupArtifact => StageKind::Artifacts(Vec::new()),
            _ => StageKind::GitPatch(Vec::new()),
        }
    }

    fn chain(install: &str) -> BuildStageChain {
        let mut chain = BuildStageChain::new("shop", "app");
        for stage in StageName::ALL {
            chain.push(Stage::new(stage, kind_for(stage, install), policies()));
        }
        chain
    }

    #[test]
    fn test_empty_stages_pass_signature_through() {
        let chain = chain("echo hi");
        assert!(chain.is_complete());

        let from = chain.signature(0).to_string();
        assert_eq!(chain.stage_signature(StageName::BeforeInstall), Some(from.as_str()));
        assert_eq!(chain.stage_signature(StageName::PreInstallPatch), Some(from.as_str()));

        let install = chain.stage_signature(StageName::Install).unwrap().to_string();
        assert_ne!(install, from);
        assert_eq!(chain.final_signature(), install);
        assert_eq!(chain.last_non_empty(), Some(StageName::Install.index()));
        assert_eq!(
            chain.non_empty_rev().collect::<Vec<_>>(),
            vec![StageName::Install.index(), 0]
        );
    }

    #[test]
    fn test_signature_is_deterministic_and_chained() {
        let a = chain("echo hi");
        let b = chain("echo hi");
        let c = chain("echo bye");

        for stage in StageName::ALL {
            assert_eq!(a.stage_signature(stage), b.stage_signature(stage));
        }
        assert_eq!(a.signature(0), c.signature(0));
        assert_ne!(a.final_signature(), c.final_signature());

        let expected = hashsum([a.signature(0), BUILD_CACHE_VERSION, "echo hi"]);
        assert_eq!(a.stage_signature(StageName::Install), Some(expected.as_str()));
        assert_eq!(
            a.signature(0),
            hashsum([BUILD_CACHE_VERSION, "base:1.0"])
        );
    }

    #[test]
    fn test_image_names_and_neighbours() {
        let chain = chain("echo hi");
        assert_eq!(
            chain.image_name(0),
            format!("shop-stages:{}", chain.signature(0))
        );
        assert_eq!(chain.previous(0), None);
        assert_eq!(chain.next(15), None);
        assert_eq!(chain.next(3), Some(4));
        assert!(chain.begins_group(0));
        assert!(chain.begins_group(StageName::GitArchive.index()));
        assert!(!chain.begins_group(StageName::Install.index()));
    }
}
