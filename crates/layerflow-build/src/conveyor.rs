//! 複数ターゲットのビルド
//!
//! 指定されたターゲットを計画してビルドします。失敗はターゲットごとに
//! 閉じ込められ、他のターゲットのビルドは続行されます。

use crate::builder::{BuildSummary, ChainBuilder};
use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::lock::LockMode;
use crate::planner::{TargetPlan, TargetPlanner};
use crate::target::TargetBuild;
use futures_util::future::join_all;
use layerflow_core::TargetConfig;
use std::sync::Arc;

/// ターゲット1つの結果
#[derive(Debug)]
pub struct TargetOutcome {
    pub target: String,
    pub result: Result<BuildSummary>,
}

impl TargetOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct Conveyor {
    ctx: BuildContext,
}

impl Conveyor {
    pub fn new(ctx: BuildContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &BuildContext {
        &self.ctx
    }

    /// 名前を解決（空ならすべてのイメージ）
    fn select(&self, names: &[String]) -> Result<Vec<&TargetConfig>> {
        let manifest = self.ctx.manifest();
        if names.is_empty() {
            return Ok(manifest.select_images(names));
        }
        names
            .iter()
            .map(|name| {
                manifest
                    .target(name)
                    .ok_or_else(|| BuildError::UnknownTarget(name.clone()))
            })
            .collect()
    }

    #[tracing::instrument(skip(self), fields(project = %self.ctx.project()))]
    pub async fn plan(&self, names: &[String]) -> Result<Vec<Arc<TargetPlan>>> {
        let planner = TargetPlanner::new(&self.ctx);
        let mut plans = Vec::new();
        for config in self.select(names)? {
            plans.push(planner.plan(config).await?);
        }
        Ok(plans)
    }

    /// ターゲットをビルド
    ///
    /// 未知のターゲット名はビルド前にエラーになります。それ以外の失敗は
    /// [`TargetOutcome`] に入ります。
    #[tracing::instrument(skip(self), fields(project = %self.ctx.project()))]
    pub async fn build(&self, names: &[String]) -> Result<Vec<TargetOutcome>> {
        let configs = self.select(names)?;
        let _guard = self
            .ctx
            .locks()
            .acquire(&self.ctx.images_lock_name(), LockMode::Shared)
            .await?;

        let planner = TargetPlanner::new(&self.ctx);
        let builder = ChainBuilder::new(&self.ctx);

        let outcomes = if self.ctx.options().parallel {
            let planner = &planner;
            let builder = &builder;
            join_all(configs.into_iter().map(|config| async move {
                TargetOutcome {
                    target: config.display_name().to_string(),
                    result: build_target(planner, builder, config).await,
                }
            }))
            .await
        } else {
            let mut outcomes = Vec::new();
            for config in configs {
                outcomes.push(TargetOutcome {
                    target: config.display_name().to_string(),
                    result: build_target(&planner, &builder, config).await,
                });
            }
            outcomes
        };

        for outcome in &outcomes {
            if let Err(e) = &outcome.result {
                tracing::error!(target_name = %outcome.target, "Build failed: {}", e);
            }
        }
        Ok(outcomes)
    }

    /// ターゲット1つの操作を取得
    pub async fn target(&self, name: Option<&str>) -> Result<TargetBuild<'_>> {
        let plan = TargetPlanner::new(&self.ctx).plan_named(name).await?;
        Ok(TargetBuild::new(&self.ctx, plan))
    }
}

async fn build_target(
    planner: &TargetPlanner<'_>,
    builder: &ChainBuilder<'_>,
    config: &TargetConfig,
) -> Result<BuildSummary> {
    let plan = planner.plan(config).await?;
    builder.build_plan(&plan).await
}
