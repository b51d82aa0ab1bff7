//! ターゲットのステージ計画
//!
//! マニフェストのターゲット設定から16ステージのチェーンを組み立てます。
//! import するアーティファクトは先に計画し、同じアーティファクトは1回だけ計画します。

use crate::chain::BuildStageChain;
use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::fingerprint::SourceTreeFingerprint;
use crate::git_artifact::{GitArtifact, PatchContribution};
use crate::labels;
use crate::policy::{ArtifactLogging, StageGrouping, TargetLogging};
use crate::recipe::{AnsiblePlaybook, ChefRecipe, task_dumps};
use crate::stage::{
    ArtifactExport, BuilderInputs, BuilderStage, GitArchiveInput, Stage, StageKind, StagePolicies,
};
use crate::vcs::ResolvedRepo;
use layerflow_core::{BuilderConfig, ManifestError, StageName, TargetConfig, validate_target};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// 計画済みのターゲット
#[derive(Debug)]
pub struct TargetPlan {
    pub config: TargetConfig,
    pub chain: BuildStageChain,
    /// import するアーティファクトの計画（名前順）
    pub artifacts: BTreeMap<String, Arc<TargetPlan>>,
}

impl TargetPlan {
    pub fn name(&self) -> &str {
        self.config.display_name()
    }

    /// 最終ステージのシグネチャ
    pub fn signature(&self) -> &str {
        self.chain.final_signature()
    }

    /// 最終ステージのイメージ名
    pub fn final_image_name(&self) -> String {
        labels::stage_image_name(self.chain.project(), self.signature())
    }
}

/// 解決済みの git ブロック
struct ResolvedGit {
    artifact: GitArtifact,
    repo: ResolvedRepo,
}

enum PreparedBuilder {
    None,
    Chef(Arc<ChefRecipe>),
    Ansible(Arc<AnsiblePlaybook>),
}

type PlanFuture<'a> = Pin<Box<dyn Future<Output = Result<Arc<TargetPlan>>> + Send + 'a>>;

pub struct TargetPlanner<'a> {
    ctx: &'a BuildContext,
    plans: Mutex<HashMap<String, Arc<TargetPlan>>>,
}

impl<'a> TargetPlanner<'a> {
    pub fn new(ctx: &'a BuildContext) -> Self {
        Self {
            ctx,
            plans: Mutex::new(HashMap::new()),
        }
    }

    /// 名前でイメージ（なければアーティファクト）を計画
    pub async fn plan_named(&self, name: Option<&str>) -> Result<Arc<TargetPlan>> {
        let manifest = self.ctx.manifest();
        let config = match name {
            Some(name) => manifest.target(name),
            None => manifest.image(None),
        }
        .ok_or_else(|| BuildError::UnknownTarget(name.unwrap_or("-").to_string()))?;
        self.plan(config).await
    }

    pub async fn plan(&self, config: &TargetConfig) -> Result<Arc<TargetPlan>> {
        self.plan_with_stack(config, Vec::new()).await
    }

    fn plan_with_stack<'b>(&'b self, config: &'b TargetConfig, stack: Vec<String>) -> PlanFuture<'b>
    where
        'a: 'b,
    {
        Box::pin(async move {
            let name = config.display_name().to_string();
            if stack.contains(&name) {
                let mut chain = stack.clone();
                chain.push(name);
                return Err(BuildError::CyclicArtifactDependency(chain.join(" -> ")));
            }

            let key = memo_key(config);
            if let Some(plan) = self.plans.lock().await.get(&key) {
                return Ok(plan.clone());
            }

            let manifest = self.ctx.manifest();
            validate_target(manifest, config).map_err(|e| match e {
                ManifestError::CircularDependency(chain) => {
                    BuildError::CyclicArtifactDependency(chain)
                }
                other => BuildError::Config(other),
            })?;

            let mut artifacts = BTreeMap::new();
            let mut sub_stack = stack.clone();
            sub_stack.push(name.clone());
            for import in &config.imports {
                if artifacts.contains_key(&import.artifact) {
                    continue;
                }
                let artifact = manifest
                    .artifact(&import.artifact)
                    .ok_or_else(|| BuildError::UnknownTarget(import.artifact.clone()))?;
                let plan = self.plan_with_stack(artifact, sub_stack.clone()).await?;
                artifacts.insert(import.artifact.clone(), plan);
            }

            let chain = self.build_chain(config, &artifacts).await?;
            let plan = Arc::new(TargetPlan {
                config: config.clone(),
                chain,
                artifacts,
            });
            tracing::debug!(
                target_name = %name,
                signature = plan.signature(),
                "Planned target"
            );

            Ok(self
                .plans
                .lock()
                .await
                .entry(key)
                .or_insert(plan)
                .clone())
        })
    }

    async fn build_chain(
        &self,
        config: &TargetConfig,
        artifacts: &BTreeMap<String, Arc<TargetPlan>>,
    ) -> Result<BuildStageChain> {
        let ctx = self.ctx;
        let name = config.display_name();
        let policies = StagePolicies {
            logging: if config.is_artifact() {
                Arc::new(ArtifactLogging)
            } else {
                Arc::new(TargetLogging)
            },
            grouping: Arc::new(StageGrouping),
        };

        let builder = prepare_builder(ctx, config)?;

        let mut git = Vec::with_capacity(config.git.len());
        for git_config in &config.git {
            let repo = ctx
                .git()
                .resolve(git_config)
                .await
                .map_err(|e| e.in_stage(name, StageName::GitArchive))?;
            git.push(ResolvedGit {
                artifact: GitArtifact::new(git_config.clone()),
                repo,
            });
        }

        let mut chain = BuildStageChain::new(&ctx.manifest().project, name);
        // git ごとの適用済みコミット
        let mut applied: Vec<String> = git.iter().map(|g| g.repo.commit.clone()).collect();

        for stage in StageName::ALL {
            let kind = match stage {
                StageName::From => StageKind::From {
                    image: config.from.clone(),
                    cache_version: config.from_cache_version.clone(),
                },
                StageName::BeforeInstall
                | StageName::Install
                | StageName::BeforeSetup
                | StageName::Setup => StageKind::Builder(
                    builder_stage(ctx, config, &builder, stage)
                        .map_err(|e| e.in_stage(name, stage))?,
                ),
                StageName::BeforeInstallArtifact
                | StageName::AfterInstallArtifact
                | StageName::BeforeSetupArtifact
                | StageName::AfterSetupArtifact => StageKind::Artifacts(
                    config
                        .imports
                        .iter()
                        .filter(|import| import.anchor.stage() == stage)
                        .filter_map(|import| {
                            artifacts.get(&import.artifact).map(|sub_build| ArtifactExport {
                                import: import.clone(),
                                sub_build: sub_build.clone(),
                            })
                        })
                        .collect(),
                ),
                StageName::GitArchive => StageKind::GitArchive(
                    git.iter()
                        .map(|g| GitArchiveInput {
                            artifact: g.artifact.clone(),
                            repo: g.repo.clone(),
                        })
                        .collect(),
                ),
                StageName::PreInstallPatch
                | StageName::PostInstallPatch
                | StageName::PreSetupPatch
                | StageName::PostSetupPatch
                | StageName::LatestPatch => StageKind::GitPatch(
                    self.patches_for(stage, &git, &applied)
                        .await
                        .map_err(|e| e.in_stage(name, stage))?,
                ),
                StageName::DockerInstructions => StageKind::DockerInstructions(config.docker.clone()),
            };

            let touched: Vec<String> = match &kind {
                StageKind::GitArchive(_) => git.iter().map(|g| g.artifact.id().to_string()).collect(),
                StageKind::GitPatch(patches) => {
                    patches.iter().map(|p| p.artifact.id().to_string()).collect()
                }
                _ => Vec::new(),
            };
            let index = chain.push(Stage::new(stage, kind, policies.clone()));

            if !touched.is_empty() {
                self.advance_applied(&chain, index, &git, &touched, &mut applied)
                    .await
                    .map_err(|e| e.in_stage(name, stage))?;
            }
        }

        Ok(chain)
    }

    async fn patches_for(
        &self,
        stage: StageName,
        git: &[ResolvedGit],
        applied: &[String],
    ) -> Result<Vec<PatchContribution>> {
        let vcs = self.ctx.git().vcs();
        let threshold = self.ctx.settings().large_patch_threshold;
        let mut patches = Vec::new();
        for (g, from) in git.iter().zip(applied) {
            if let Some(patch) = g
                .artifact
                .patch_for(vcs.as_ref(), &g.repo, stage, from, threshold)
                .await?
            {
                patches.push(patch);
            }
        }
        Ok(patches)
    }

    /// git を扱ったステージの後の適用済みコミットを更新する
    ///
    /// イメージが既にあればそのラベルのコミット（以前のビルドで適用したもの）、
    /// なければこれから現在のコミットでビルドされます。
    async fn advance_applied(
        &self,
        chain: &BuildStageChain,
        index: usize,
        git: &[ResolvedGit],
        touched: &[String],
        applied: &mut [String],
    ) -> Result<()> {
        let existing = self
            .ctx
            .images()
            .resolve(&chain.image_name(index))
            .await?
            .into_option();
        for (g, commit) in git.iter().zip(applied.iter_mut()) {
            if !touched.iter().any(|id| id == g.artifact.id()) {
                continue;
            }
            *commit = existing
                .as_ref()
                .and_then(|image| image.label(&g.artifact.commit_label()))
                .unwrap_or(g.repo.commit.as_str())
                .to_string();
        }
        Ok(())
    }
}

fn memo_key(config: &TargetConfig) -> String {
    format!("{:?}/{}", config.kind, config.display_name())
}

fn prepare_builder(ctx: &BuildContext, config: &TargetConfig) -> Result<PreparedBuilder> {
    let root = &ctx.manifest().root;
    let name = config.display_name();
    Ok(match &config.builder {
        BuilderConfig::Chef(chef) => {
            PreparedBuilder::Chef(Arc::new(ChefRecipe::load(root, name, chef)?))
        }
        BuilderConfig::Ansible(ansible) => {
            PreparedBuilder::Ansible(Arc::new(AnsiblePlaybook::load(root, name, ansible)?))
        }
        BuilderConfig::Shell(_) | BuilderConfig::None => PreparedBuilder::None,
    })
}

fn builder_stage(
    ctx: &BuildContext,
    config: &TargetConfig,
    prepared: &PreparedBuilder,
    stage: StageName,
) -> Result<BuilderStage> {
    let inputs = match (&config.builder, prepared) {
        (BuilderConfig::Chef(chef), PreparedBuilder::Chef(recipe)) => BuilderInputs::Chef {
            recipe: recipe.clone(),
            attributes: ChefRecipe::stage_attributes(chef, stage),
            runlist: recipe.runlist(stage),
        },
        (BuilderConfig::Ansible(ansible), PreparedBuilder::Ansible(playbook)) => {
            let tasks = ansible.tasks(stage).to_vec();
            BuilderInputs::Ansible {
                playbook: playbook.clone(),
                dumps: task_dumps(&tasks)?,
                tasks,
            }
        }
        (BuilderConfig::Shell(shell), _) => {
            let stage = shell.stage(stage).cloned().unwrap_or_default();
            BuilderInputs::Shell {
                commands: stage.commands,
                cache_version: stage.cache_version,
            }
        }
        _ => BuilderInputs::Shell {
            commands: Vec::new(),
            cache_version: None,
        },
    };

    let globs = config.dependency_globs(stage);
    let dependency_checksum = if globs.is_empty() {
        None
    } else {
        SourceTreeFingerprint::new(&ctx.manifest().root).checksum(globs)?
    };

    Ok(BuilderStage {
        inputs,
        dependency_checksum,
    })
}
