//! ステージの種類とシグネチャ入力
//!
//! ステージごとの入力は [`own_checksum_inputs`] の1か所で決まります。
//! `None` を返すステージは空で、直前のシグネチャをそのまま引き継ぎます。

use crate::git_artifact::{GitArtifact, PatchContribution};
use crate::hash_inputs;
use crate::hasher::{HashInput, hashsum};
use crate::planner::TargetPlan;
use crate::policy::{GroupingPolicy, LoggingPolicy, StageEvent};
use crate::recipe::{AnsiblePlaybook, ChefRecipe};
use crate::vcs::ResolvedRepo;
use layerflow_core::{AnsibleTask, ArtifactImport, DockerDirectives, StageName};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// ビルダーの種類ごとの入力
#[derive(Debug, Clone)]
pub enum BuilderInputs {
    Shell {
        commands: Vec<String>,
        cache_version: Option<String>,
    },
    Chef {
        recipe: Arc<ChefRecipe>,
        attributes: serde_json::Map<String, serde_json::Value>,
        runlist: Vec<String>,
    },
    Ansible {
        playbook: Arc<AnsiblePlaybook>,
        tasks: Vec<AnsibleTask>,
        /// タスクごとの YAML
        dumps: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct BuilderStage {
    pub inputs: BuilderInputs,
    /// `dependencies` で宣言したファイルのチェックサム
    pub dependency_checksum: Option<String>,
}

impl BuilderStage {
    pub fn is_empty(&self) -> bool {
        match &self.inputs {
            BuilderInputs::Shell { commands, .. } => commands.is_empty(),
            BuilderInputs::Chef { runlist, .. } => runlist.is_empty(),
            BuilderInputs::Ansible { tasks, .. } => tasks.is_empty(),
        }
    }
}

/// import 1つ分
#[derive(Debug, Clone)]
pub struct ArtifactExport {
    pub import: ArtifactImport,
    pub sub_build: Arc<TargetPlan>,
}

impl ArtifactExport {
    /// サブビルドの最終シグネチャとエクスポート設定のハッシュ
    pub fn checksum(&self) -> String {
        let import = &self.import;
        hashsum(hash_inputs![
            self.sub_build.signature(),
            import.add.as_str(),
            import.to.as_str(),
            import.include_paths.as_slice(),
            import.exclude_paths.as_slice(),
            import.owner.clone(),
            import.group.clone(),
        ])
    }
}

/// アーカイブ対象の git アーティファクト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitArchiveInput {
    pub artifact: GitArtifact,
    pub repo: ResolvedRepo,
}

/// ステージの種類と固有データ
#[derive(Debug, Clone)]
pub enum StageKind {
    From {
        image: String,
        cache_version: Option<String>,
    },
    Builder(BuilderStage),
    Artifacts(Vec<ArtifactExport>),
    GitArchive(Vec<GitArchiveInput>),
    GitPatch(Vec<PatchContribution>),
    DockerInstructions(DockerDirectives),
}

impl StageKind {
    pub fn is_empty(&self) -> bool {
        own_checksum_inputs(self).is_none()
    }
}

/// ステージ固有のシグネチャ入力（空なら `None`）
pub fn own_checksum_inputs(kind: &StageKind) -> Option<Vec<HashInput>> {
    match kind {
        StageKind::From {
            image,
            cache_version,
        } => Some(hash_inputs![image, cache_version.clone()]),
        StageKind::Builder(stage) if stage.is_empty() => None,
        StageKind::Builder(stage) => {
            let mut inputs = match &stage.inputs {
                BuilderInputs::Shell {
                    commands,
                    cache_version,
                } => hash_inputs![commands.as_slice(), cache_version.clone()],
                BuilderInputs::Chef {
                    recipe,
                    attributes,
                    runlist,
                } => hash_inputs![
                    recipe.checksum(),
                    serde_json::Value::Object(attributes.clone()).to_string(),
                    runlist.as_slice(),
                ],
                BuilderInputs::Ansible {
                    playbook, dumps, ..
                } => hash_inputs![playbook.checksum(), dumps.as_slice()],
            };
            inputs.push(stage.dependency_checksum.clone().into());
            Some(inputs)
        }
        StageKind::Artifacts(exports) if exports.is_empty() => None,
        StageKind::Artifacts(exports) => Some(
            exports
                .iter()
                .map(|export| HashInput::from(export.checksum()))
                .collect(),
        ),
        StageKind::GitArchive(archives) if archives.is_empty() => None,
        StageKind::GitArchive(archives) => Some(
            archives
                .iter()
                .flat_map(|a| hash_inputs![a.artifact.id(), a.artifact.paramshash()])
                .collect(),
        ),
        StageKind::GitPatch(patches) if patches.is_empty() => None,
        StageKind::GitPatch(patches) => Some(
            patches
                .iter()
                .flat_map(|p| hash_inputs![p.artifact.id(), p.checksum.as_str()])
                .collect(),
        ),
        StageKind::DockerInstructions(directives) if directives.is_empty() => None,
        StageKind::DockerInstructions(directives) => {
            Some(hash_inputs![directives.instruction_lines()])
        }
    }
}

/// ステージが使うログとグループの方針
#[derive(Clone)]
pub struct StagePolicies {
    pub logging: Arc<dyn LoggingPolicy>,
    pub grouping: Arc<dyn GroupingPolicy>,
}

/// パイプライン上の1ステージ
pub struct Stage {
    name: StageName,
    kind: StageKind,
    pub(crate) signature: OnceLock<String>,
    policies: StagePolicies,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("signature", &self.signature.get())
            .finish()
    }
}

impl Stage {
    pub fn new(name: StageName, kind: StageKind, policies: StagePolicies) -> Self {
        Self {
            name,
            kind,
            signature: OnceLock::new(),
            policies,
        }
    }

    pub fn name(&self) -> StageName {
        self.name
    }

    pub fn kind(&self) -> &StageKind {
        &self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_empty()
    }

    pub fn group(&self) -> &'static str {
        self.policies.grouping.group_of(self.name)
    }

    pub fn log(&self, target: &str, event: StageEvent<'_>) {
        self.policies.logging.stage_event(target, self.name, event);
    }

    pub fn log_group(&self, target: &str) {
        self.policies.logging.group_started(target, self.group());
    }
}
