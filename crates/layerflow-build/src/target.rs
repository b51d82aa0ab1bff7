//! ターゲット単位の操作
//!
//! ビルド、シグネチャやステージイメージ名の参照、明示的なタグ付けを行います。

use crate::builder::{BuildSummary, ChainBuilder};
use crate::cache::ImageMetadata;
use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::naming::validate_reference;
use crate::planner::TargetPlan;
use layerflow_core::StageName;
use std::sync::Arc;

/// ステージ1つの状態
#[derive(Debug, Clone, PartialEq)]
pub struct StageStatus {
    pub name: StageName,
    pub signature: String,
    pub image_name: String,
    pub empty: bool,
    /// ローカルのイメージ（なければ `None`）
    pub image: Option<ImageMetadata>,
}

pub struct TargetBuild<'a> {
    ctx: &'a BuildContext,
    plan: Arc<TargetPlan>,
}

impl<'a> TargetBuild<'a> {
    pub fn new(ctx: &'a BuildContext, plan: Arc<TargetPlan>) -> Self {
        Self { ctx, plan }
    }

    pub fn name(&self) -> &str {
        self.plan.name()
    }

    pub fn plan(&self) -> &Arc<TargetPlan> {
        &self.plan
    }

    pub async fn build(&self) -> Result<BuildSummary> {
        ChainBuilder::new(self.ctx).build_plan(&self.plan).await
    }

    /// 最終シグネチャ
    pub fn signature(&self) -> &str {
        self.plan.signature()
    }

    pub fn stage_signature(&self, stage: StageName) -> Option<&str> {
        self.plan.chain.stage_signature(stage)
    }

    pub fn stage_image_name(&self, stage: StageName) -> Option<String> {
        self.plan.chain.stage_image_name(stage)
    }

    pub fn final_image_name(&self) -> String {
        self.plan.final_image_name()
    }

    /// ステージのイメージ（ビルドされていなければ [`BuildError::ImageNotExist`]）
    pub async fn stage_image(&self, stage: StageName) -> Result<ImageMetadata> {
        let name = self
            .stage_image_name(stage)
            .ok_or_else(|| BuildError::ImageNotExist(stage.to_string()))?;
        self.ctx.images().metadata(&name).await
    }

    /// 全ステージの状態
    pub async fn stages(&self) -> Result<Vec<StageStatus>> {
        let chain = &self.plan.chain;
        let mut statuses = Vec::with_capacity(chain.len());
        for (index, stage) in chain.stages().iter().enumerate() {
            let image_name = chain.image_name(index);
            let image = if stage.is_empty() {
                None
            } else {
                self.ctx.images().resolve(&image_name).await?.into_option()
            };
            statuses.push(StageStatus {
                name: stage.name(),
                signature: chain.signature(index).to_string(),
                image_name,
                empty: stage.is_empty(),
                image,
            });
        }
        Ok(statuses)
    }

    /// 最終イメージに名前を付ける
    pub async fn tag(&self, name: &str) -> Result<ImageMetadata> {
        validate_reference(name)?;
        let metadata = self.ctx.images().tag(&self.final_image_name(), name).await?;
        tracing::info!(target_name = self.name(), tag = name, "Tagged image");
        Ok(metadata)
    }
}
