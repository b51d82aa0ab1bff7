//! ステージチェーンのビルド
//!
//! 既にタグ付けされている最も後ろのステージを探し、それより後ろの
//! 中身のあるステージだけを順にビルドしてタグ付けします。

use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::lock::LockMode;
use crate::planner::TargetPlan;
use crate::policy::StageEvent;
use crate::runner::StageRunner;
use crate::stage::StageKind;
use layerflow_core::StageName;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::Mutex;

/// ターゲット1つのビルド結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub target: String,
    pub signature: String,
    pub image_name: String,
    /// 今回ビルドしたステージ
    pub built: Vec<StageName>,
    /// 既存イメージを使ったステージ
    pub cached: Vec<StageName>,
}

impl BuildSummary {
    pub fn is_cached(&self) -> bool {
        self.built.is_empty()
    }
}

type BuildFuture<'a> = Pin<Box<dyn Future<Output = Result<BuildSummary>> + Send + 'a>>;

pub struct ChainBuilder<'a> {
    ctx: &'a BuildContext,
    runner: StageRunner<'a>,
    /// ビルド済みの最終シグネチャ
    done: Mutex<HashMap<String, BuildSummary>>,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(ctx: &'a BuildContext) -> Self {
        Self {
            ctx,
            runner: StageRunner::new(ctx),
            done: Mutex::new(HashMap::new()),
        }
    }

    /// import するアーティファクトを先にビルドしてからチェーンをビルド
    pub fn build_plan<'b>(&'b self, plan: &'b TargetPlan) -> BuildFuture<'b>
    where
        'a: 'b,
    {
        Box::pin(async move {
            if let Some(summary) = self.done.lock().await.get(plan.signature()) {
                return Ok(BuildSummary {
                    target: plan.name().to_string(),
                    built: Vec::new(),
                    cached: [summary.cached.as_slice(), summary.built.as_slice()].concat(),
                    ..summary.clone()
                });
            }

            for sub_build in plan.artifacts.values() {
                self.build_plan(sub_build).await?;
            }

            let summary = self.build_chain(plan).await?;
            self.done
                .lock()
                .await
                .insert(plan.signature().to_string(), summary.clone());
            Ok(summary)
        })
    }

    async fn build_chain(&self, plan: &TargetPlan) -> Result<BuildSummary> {
        let chain = &plan.chain;
        let target = plan.name();
        let images = self.ctx.images();

        let mut resume = None;
        for index in chain.non_empty_rev() {
            if images.exists(&chain.image_name(index)).await? {
                resume = Some(index);
                break;
            }
        }

        let mut summary = BuildSummary {
            target: target.to_string(),
            signature: plan.signature().to_string(),
            image_name: plan.final_image_name(),
            built: Vec::new(),
            cached: Vec::new(),
        };

        for (index, stage) in chain.stages().iter().enumerate() {
            if chain.begins_group(index) {
                stage.log_group(target);
            }
            if stage.is_empty() {
                stage.log(target, StageEvent::Empty);
                continue;
            }
            let signature = chain.signature(index);

            match resume {
                Some(resume) if index < resume => {
                    stage.log(target, StageEvent::Skipped);
                    summary.cached.push(stage.name());
                }
                Some(resume) if index == resume => {
                    stage.log(target, StageEvent::Cached { signature });
                    summary.cached.push(stage.name());
                }
                _ => {
                    let built = self
                        .build_stage(plan, index)
                        .await
                        .map_err(|e| e.in_stage(target, stage.name()))?;
                    if built {
                        summary.built.push(stage.name());
                    } else {
                        summary.cached.push(stage.name());
                    }
                }
            }
        }

        tracing::debug!(
            target_name = target,
            built = summary.built.len(),
            cached = summary.cached.len(),
            "Chain finished"
        );
        Ok(summary)
    }

    /// ステージをビルドしてタグ付け（他のビルドが先に作っていれば false）
    async fn build_stage(&self, plan: &TargetPlan, index: usize) -> Result<bool> {
        let ctx = self.ctx;
        let chain = &plan.chain;
        let target = plan.name();
        let signature = chain.signature(index);
        let name = chain.image_name(index);
        let Some(stage) = chain.get(index) else {
            return Ok(false);
        };

        let _guard = ctx
            .locks()
            .acquire(&format!("{}.image.{}", ctx.project(), signature), LockMode::Exclusive)
            .await?;
        if ctx.images().refresh(&name).await?.is_hit() {
            stage.log(target, StageEvent::Cached { signature });
            return Ok(false);
        }

        stage.log(target, StageEvent::Building { signature });
        let id = match stage.kind() {
            StageKind::From { image, .. } => ctx.images().ensure_pulled(image).await?.id,
            _ => {
                let previous = chain
                    .previous(index)
                    .ok_or_else(|| BuildError::ImageNotExist(name.clone()))?;
                let from = ctx.images().metadata(&chain.image_name(previous)).await?;
                self.runner.run(plan, index, &from.id).await?
            }
        };

        ctx.images().tag_built(&id, &name).await?;
        stage.log(
            target,
            StageEvent::Built {
                signature,
                image_id: &id,
            },
        );
        Ok(true)
    }
}
