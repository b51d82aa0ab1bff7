//! ビルド後のイメージ操作
//!
//! エクスポート、インポート、ステージのインポート、ローカルの GC と
//! レジストリ上のステージタグの掃除を行います。

use crate::BUILD_CACHE_VERSION;
use crate::cache::ImageMetadata;
use crate::context::BuildContext;
use crate::error::{BuildError, Result};
use crate::git_artifact::GitArtifact;
use crate::labels::{self, CACHE_VERSION_LABEL, PROJECT_LABEL, STAGE_TAG_PREFIX};
use crate::lock::LockMode;
use crate::naming::{format_export_name, validate_reference};
use crate::planner::{TargetPlan, TargetPlanner};
use crate::registry::Registry;
use layerflow_container::{
    ContainerError, ContainerFilter, ImageFilter, ImageSummary, split_reference,
};
use layerflow_core::StageName;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

/// GC の対象
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcPolicy {
    /// 残ったビルドコンテナを消す
    pub flush_containers: bool,
    pub dangling: bool,
    /// キャッシュバージョンが古いイメージ
    pub cache_version: bool,
    /// どのターゲットイメージからもたどれないステージ
    pub orphan_stages: bool,
    /// 記録したコミットがリポジトリにないステージ（と子孫）
    pub git_commits: bool,
    /// このリポジトリのタグもルートとして扱う
    pub registry_repo: Option<String>,
    pub dry_run: bool,
    /// エラーがあれば [`BuildError::GcFailed`]
    pub strict: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// 削除した（dry run では削除する）イメージやタグ
    pub removed: Vec<String>,
    pub removed_containers: Vec<String>,
    /// (対象, 理由)
    pub skipped: Vec<(String, String)>,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

impl GcReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn finish(self, strict: bool) -> Result<Self> {
        if strict && !self.errors.is_empty() {
            return Err(BuildError::GcFailed(self.errors.len()));
        }
        Ok(self)
    }
}

/// 親子関係をたどるためのイメージ一覧
struct ImageGraph {
    images: HashMap<String, ImageSummary>,
    children: HashMap<String, Vec<String>>,
}

impl ImageGraph {
    fn new(list: Vec<ImageSummary>) -> Self {
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for image in &list {
            if let Some(parent) = &image.parent_id {
                children.entry(parent.clone()).or_default().push(image.id.clone());
            }
        }
        Self {
            images: list.into_iter().map(|i| (i.id.clone(), i)).collect(),
            children,
        }
    }

    /// 自身を含む祖先（壊れた親情報でも止まる）
    fn ancestors(&self, id: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut current = Some(id.to_string());
        let mut out = Vec::new();
        while let Some(image) = current {
            if !visited.insert(image.clone()) {
                break;
            }
            current = self.images.get(&image).and_then(|i| i.parent_id.clone());
            out.push(image);
        }
        out
    }

    fn descendants(&self, id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut queue = vec![id.to_string()];
        while let Some(image) = queue.pop() {
            for child in self.children.get(&image).into_iter().flatten() {
                if out.insert(child.clone()) {
                    queue.push(child.clone());
                }
            }
        }
        out
    }

    fn depth(&self, id: &str) -> usize {
        self.ancestors(id).len()
    }
}

pub struct ImageLifecycleManager<'a> {
    ctx: &'a BuildContext,
}

impl<'a> ImageLifecycleManager<'a> {
    pub fn new(ctx: &'a BuildContext) -> Self {
        Self { ctx }
    }

    /// 名前を付けて push し、ローカルの名前を外す（push が失敗しても外す）
    async fn push_as(&self, source: &str, name: &str) -> Result<()> {
        let images = self.ctx.images();
        images.tag(source, name).await?;
        tracing::info!(image = name, "Pushing image");
        let pushed = images.push(name).await;
        let untagged = images.untag(name).await;
        pushed?;
        untagged
    }

    /// 最終イメージをタグごとにエクスポート
    ///
    /// `with_stages` の場合は中身のある各ステージも `<repo>:dimgstage-<signature>` で push します。
    pub async fn export(
        &self,
        plan: &TargetPlan,
        repo: &str,
        tags: &[String],
        format: Option<&str>,
        with_stages: bool,
    ) -> Result<Vec<String>> {
        let source = plan.final_image_name();
        self.ctx.images().metadata(&source).await?;

        let mut exported = Vec::new();
        for tag in tags {
            let name = format_export_name(format, repo, plan.config.name.as_deref(), tag)?;
            self.push_as(&source, &name).await?;
            exported.push(name);
        }

        if with_stages {
            let chain = &plan.chain;
            let mut seen = HashSet::new();
            for index in chain.non_empty_rev() {
                let signature = chain.signature(index);
                if !seen.insert(signature) {
                    continue;
                }
                let local = chain.image_name(index);
                if !self.ctx.images().exists(&local).await? {
                    continue;
                }
                let name = labels::stage_tag_name(repo, signature);
                self.push_as(&local, &name).await?;
                exported.push(name);
            }
        }
        Ok(exported)
    }

    /// `source` を pull して `target` として付け替える
    pub async fn import(&self, source: &str, target: &str) -> Result<ImageMetadata> {
        validate_reference(target)?;
        let images = self.ctx.images();
        images.pull(source).await?;
        let metadata = images.tag(source, target).await?;
        if source != target {
            images.untag(source).await?;
        }
        tracing::info!(source, target, "Imported image");
        Ok(metadata)
    }

    /// レジストリのステージイメージを取り込む
    ///
    /// 後ろのステージから順に試し、`all` でなければ最初に取り込めた時点で止めます。
    pub async fn import_stages(&self, plan: &TargetPlan, repo: &str, all: bool) -> Result<Vec<StageName>> {
        let chain = &plan.chain;
        let images = self.ctx.images();
        let mut imported = Vec::new();
        let mut seen = HashSet::new();

        for index in chain.non_empty_rev() {
            let signature = chain.signature(index);
            if !seen.insert(signature) {
                continue;
            }
            let Some(stage) = chain.get(index) else {
                continue;
            };
            let local = chain.image_name(index);
            if images.exists(&local).await? {
                if all {
                    continue;
                }
                break;
            }

            let remote = labels::stage_tag_name(repo, signature);
            match images.pull(&remote).await {
                Ok(_) => {
                    images.tag(&remote, &local).await?;
                    images.untag(&remote).await?;
                    tracing::info!(target_name = plan.name(), stage = %stage.name(), "Imported stage");
                    imported.push(stage.name());
                    if !all {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(image = %remote, "Stage not imported: {}", e);
                }
            }
        }
        Ok(imported)
    }

    /// ローカルイメージの GC
    pub async fn gc(&self, policy: &GcPolicy, registry: Option<&dyn Registry>) -> Result<GcReport> {
        let ctx = self.ctx;
        let project = ctx.project();
        let _guard = ctx
            .locks()
            .acquire(&ctx.images_lock_name(), LockMode::Exclusive)
            .await?;
        let runtime = ctx.runtime();
        let mut report = GcReport {
            dry_run: policy.dry_run,
            ..Default::default()
        };

        if policy.flush_containers {
            let filter = ContainerFilter {
                name_prefix: Some(labels::build_container_prefix(project)),
                ..Default::default()
            };
            for container in runtime.containers(&filter).await? {
                if !policy.dry_run
                    && let Err(e) = runtime.remove_container(&container.id).await
                {
                    report.errors.push(format!("container {}: {}", container.id, e));
                    continue;
                }
                report.removed_containers.push(container.id);
            }
        }

        let graph = ImageGraph::new(runtime.list_images(&ImageFilter::default()).await?);
        let stages_repo = labels::stages_repository(project);
        let project_images: Vec<&ImageSummary> = graph
            .images
            .values()
            .filter(|image| {
                image.labels.get(PROJECT_LABEL).is_some_and(|p| p == project)
                    || image
                        .tags
                        .iter()
                        .any(|t| split_reference(t).0 == stages_repo)
            })
            .collect();

        let mut candidates: BTreeSet<String> = BTreeSet::new();

        if policy.dangling {
            candidates.extend(
                project_images
                    .iter()
                    .filter(|image| image.is_dangling() && !graph.children.contains_key(&image.id))
                    .map(|image| image.id.clone()),
            );
        }

        if policy.cache_version {
            candidates.extend(
                project_images
                    .iter()
                    .filter(|image| {
                        image
                            .labels
                            .get(CACHE_VERSION_LABEL)
                            .is_some_and(|v| v != BUILD_CACHE_VERSION)
                    })
                    .map(|image| image.id.clone()),
            );
        }

        if policy.git_commits {
            let repos = self.git_repositories();
            for image in &project_images {
                for (label, commit) in &image.labels {
                    let Some(artifact_id) = labels::parse_git_commit_label(label) else {
                        continue;
                    };
                    let Some(path) = repos.get(artifact_id) else {
                        continue;
                    };
                    match ctx.git().vcs().commit_exists(path, commit).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::debug!(image = %image.id, commit = %commit, "Recorded commit is gone");
                            candidates.insert(image.id.clone());
                            candidates.extend(graph.descendants(&image.id));
                        }
                        Err(e) => report.errors.push(format!("{}: {}", image.id, e)),
                    }
                }
            }
        }

        if policy.orphan_stages {
            match self.orphan_roots(&project_images, &stages_repo, policy, registry).await {
                Ok(roots) => {
                    let kept = keep_set(&graph, roots);
                    candidates.extend(
                        project_images
                            .iter()
                            .filter(|image| {
                                image.tags.iter().any(|t| split_reference(t).0 == stages_repo)
                            })
                            .filter(|image| !kept.contains(&image.id))
                            .map(|image| image.id.clone()),
                    );
                }
                Err(e) => {
                    tracing::warn!("Skipping orphan sweep: {}", e);
                    report.errors.push(e.to_string());
                }
            }
        }

        let mut in_use = HashSet::new();
        for container in runtime.containers(&ContainerFilter::default()).await? {
            in_use.extend(graph.ancestors(&container.image_id));
        }

        let mut ordered: Vec<String> = candidates.into_iter().collect();
        ordered.sort_by_key(|id| std::cmp::Reverse(graph.depth(id)));
        for id in ordered {
            if in_use.contains(&id) {
                report.skipped.push((id, "in use".to_string()));
                continue;
            }
            if policy.dry_run {
                report.removed.push(id);
                continue;
            }
            match ctx.images().remove(&id, true).await {
                Ok(()) => report.removed.push(id),
                Err(BuildError::RuntimeCommandFailed(ContainerError::ImageInUse { .. })) => {
                    report.skipped.push((id, "in use".to_string()));
                }
                Err(e) => report.errors.push(format!("{}: {}", id, e)),
            }
        }

        tracing::info!(
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            dry_run = policy.dry_run,
            "GC finished"
        );
        report.finish(policy.strict)
    }

    /// アーティファクトID -> リポジトリのパス
    fn git_repositories(&self) -> HashMap<String, PathBuf> {
        let manifest = self.ctx.manifest();
        manifest
            .images
            .iter()
            .chain(manifest.artifacts.values())
            .flat_map(|target| target.git.iter())
            .map(|config| {
                (
                    GitArtifact::new(config.clone()).id().to_string(),
                    self.ctx.git().repo_path(config),
                )
            })
            .collect()
    }

    /// 現在のマニフェストでビルド済みのターゲットとアーティファクト
    async fn current_target_ids(&self) -> Result<Vec<String>> {
        let planner = TargetPlanner::new(self.ctx);
        let mut ids = Vec::new();
        for config in &self.ctx.manifest().images {
            let plan = planner.plan(config).await?;
            for plan in std::iter::once(&plan).chain(plan.artifacts.values()) {
                if let Some(image) = self
                    .ctx
                    .images()
                    .resolve(&plan.final_image_name())
                    .await?
                    .into_option()
                {
                    ids.push(image.id);
                }
            }
        }
        Ok(ids)
    }

    /// ルート: ステージ名前空間の外でタグ付けされたイメージ、
    /// 現在のマニフェストの最終イメージとレジストリのタグ
    async fn orphan_roots(
        &self,
        project_images: &[&ImageSummary],
        stages_repo: &str,
        policy: &GcPolicy,
        registry: Option<&dyn Registry>,
    ) -> Result<Vec<String>> {
        let mut roots: Vec<String> = project_images
            .iter()
            .filter(|image| image.tags.iter().any(|t| split_reference(t).0 != stages_repo))
            .map(|image| image.id.clone())
            .collect();
        roots.extend(self.current_target_ids().await?);

        if let (Some(repo), Some(registry)) = (&policy.registry_repo, registry) {
            for tag in registry.list_tags(repo).await? {
                if tag.starts_with(STAGE_TAG_PREFIX) {
                    continue;
                }
                if let Some(id) = registry.image_id(repo, &tag).await? {
                    roots.push(id);
                }
            }
        }
        Ok(roots)
    }

    /// レジストリ上のステージタグを掃除
    ///
    /// `target_repos` はターゲットイメージを置いているリポジトリ。
    /// すべて一覧できた場合だけ孤立したステージを消します。
    pub async fn cleanup_repo(
        &self,
        repo: &str,
        target_repos: &[String],
        registry: &dyn Registry,
        dry_run: bool,
    ) -> Result<GcReport> {
        let mut report = GcReport {
            dry_run,
            ..Default::default()
        };

        let stage_tags: Vec<String> = registry
            .list_tags(repo)
            .await?
            .into_iter()
            .filter(|t| t.starts_with(STAGE_TAG_PREFIX))
            .collect();

        // タグ -> (ID, 親ID, アーティファクトID)
        let mut stages: BTreeMap<String, (Option<String>, Option<String>, Vec<String>)> =
            BTreeMap::new();
        let mut stale = Vec::new();
        for tag in &stage_tags {
            let labels = match registry.image_labels(repo, tag).await {
                Ok(labels) => labels,
                Err(e) => {
                    report.errors.push(format!("{}:{}: {}", repo, tag, e));
                    continue;
                }
            };
            if labels
                .get(CACHE_VERSION_LABEL)
                .is_none_or(|v| v != BUILD_CACHE_VERSION)
            {
                stale.push(tag.clone());
                continue;
            }
            let artifacts = labels
                .iter()
                .filter(|(k, _)| labels::is_artifacts_label(k))
                .flat_map(|(_, v)| v.split(',').filter(|s| !s.is_empty()).map(str::to_string))
                .collect();
            let id = registry.image_id(repo, tag).await;
            let parent = registry.image_parent_id(repo, tag).await;
            match (id, parent) {
                (Ok(id), Ok(parent)) => {
                    stages.insert(tag.clone(), (id, parent, artifacts));
                }
                (Err(e), _) | (_, Err(e)) => report.errors.push(format!("{}:{}: {}", repo, tag, e)),
            }
        }

        for tag in stale {
            self.delete_remote(registry, repo, &tag, dry_run, &mut report).await;
        }

        let mut roots = Vec::new();
        let mut complete = report.errors.is_empty();
        for target_repo in target_repos {
            match self.target_ids(registry, target_repo).await {
                Ok(ids) => roots.extend(ids),
                Err(e) => {
                    tracing::warn!(repo = %target_repo, "Skipping target repository: {}", e);
                    report.errors.push(e.to_string());
                    complete = false;
                }
            }
        }

        if complete {
            let parents: HashMap<&str, (Option<&str>, &[String])> = stages
                .values()
                .filter_map(|(id, parent, artifacts)| {
                    id.as_deref()
                        .map(|id| (id, (parent.as_deref(), artifacts.as_slice())))
                })
                .collect();

            let mut kept: HashSet<String> = HashSet::new();
            let mut queue = roots;
            while let Some(id) = queue.pop() {
                if !kept.insert(id.clone()) {
                    continue;
                }
                if let Some((parent, artifacts)) = parents.get(id.as_str()) {
                    queue.extend(parent.map(str::to_string));
                    queue.extend(artifacts.iter().cloned());
                }
            }

            for (tag, (id, _, _)) in &stages {
                if id.as_ref().is_none_or(|id| !kept.contains(id)) {
                    self.delete_remote(registry, repo, tag, dry_run, &mut report).await;
                }
            }
        } else {
            tracing::warn!(repo, "Not all target repositories were listed; orphan stages kept");
        }

        Ok(report)
    }

    async fn target_ids(&self, registry: &dyn Registry, repo: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for tag in registry.list_tags(repo).await? {
            if tag.starts_with(STAGE_TAG_PREFIX) {
                continue;
            }
            if let Some(id) = registry.image_id(repo, &tag).await? {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn delete_remote(
        &self,
        registry: &dyn Registry,
        repo: &str,
        tag: &str,
        dry_run: bool,
        report: &mut GcReport,
    ) {
        let name = format!("{}:{}", repo, tag);
        if dry_run {
            report.removed.push(name);
            return;
        }
        match registry.delete(repo, tag).await {
            Ok(()) => report.removed.push(name),
            Err(e) => report.errors.push(format!("{}: {}", name, e)),
        }
    }
}

/// ルートとその祖先、アーティファクトラベルで参照されるイメージ（とその祖先）
fn keep_set(graph: &ImageGraph, roots: Vec<String>) -> HashSet<String> {
    let mut kept = HashSet::new();
    let mut queue = roots;
    while let Some(root) = queue.pop() {
        for id in graph.ancestors(&root) {
            if !kept.insert(id.clone()) {
                continue;
            }
            if let Some(image) = graph.images.get(&id) {
                for (key, value) in &image.labels {
                    if labels::is_artifacts_label(key) {
                        queue.extend(value.split(',').filter(|s| !s.is_empty()).map(str::to_string));
                    }
                }
            }
        }
    }
    kept
}

/// エクスポート先のリポジトリ（名前付きは `<repo>/<name>`）
pub fn target_repositories(repo: &str, names: &[Option<String>]) -> Vec<String> {
    let repo = repo.trim_end_matches('/');
    names
        .iter()
        .map(|name| match name {
            Some(name) => format!("{}/{}", repo, name),
            None => repo.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, parent: Option<&str>) -> ImageSummary {
        ImageSummary {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_graph_walk_is_cycle_safe() {
        // 壊れた親情報（a -> b -> a）
        let graph = ImageGraph::new(vec![summary("a", Some("b")), summary("b", Some("a"))]);
        assert_eq!(graph.ancestors("a"), vec!["a", "b"]);
        assert_eq!(graph.depth("b"), 2);
    }

    #[test]
    fn test_descendants() {
        let graph = ImageGraph::new(vec![
            summary("root", None),
            summary("a", Some("root")),
            summary("b", Some("a")),
            summary("c", Some("root")),
        ]);
        let descendants: Vec<_> = graph.descendants("a").into_iter().collect();
        assert_eq!(descendants, vec!["b"]);
        assert_eq!(graph.descendants("root").len(), 3);
    }

    #[test]
    fn test_keep_set_follows_artifact_labels() {
        let mut image = summary("app", Some("base"));
        image.labels.insert(
            labels::artifacts_label(StageName::BeforeSetupArtifact),
            "artifact".to_string(),
        );
        let graph = ImageGraph::new(vec![
            summary("base", None),
            image,
            summary("artifact", Some("artifact-base")),
            summary("artifact-base", None),
            summary("orphan", Some("base")),
        ]);
        let kept = keep_set(&graph, vec!["app".to_string()]);
        assert!(kept.contains("base"));
        assert!(kept.contains("artifact-base"));
        assert!(!kept.contains("orphan"));
    }

    #[test]
    fn test_target_repositories() {
        assert_eq!(
            target_repositories("r.example.com/shop/", &[Some("backend".into()), None]),
            vec!["r.example.com/shop/backend", "r.example.com/shop"]
        );
    }

    #[test]
    fn test_strict_report() {
        let report = GcReport {
            errors: vec!["x".into()],
            ..Default::default()
        };
        assert!(matches!(report.clone().finish(true), Err(BuildError::GcFailed(1))));
        assert!(report.finish(false).is_ok());
    }
}
