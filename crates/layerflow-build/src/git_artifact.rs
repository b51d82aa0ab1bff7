//! git アーティファクト
//!
//! アーカイブ（初回の全体コピー）とパッチ（以降の差分）のシグネチャ入力と
//! コンテナ内で実行するコマンドを扱います。

use crate::error::{BuildError, Result};
use crate::hash_inputs;
use crate::hasher::{hashsum, sha256_hex};
use crate::labels;
use crate::vcs::{PatchSet, PathFilter, ResolvedRepo, VersionControl};
use layerflow_core::{GitArtifactConfig, GitRepoRef, StageName};

/// コンテナ内の一時ディレクトリ
pub const CONTAINER_TMP_DIR: &str = "/.layerflow/tmp";

/// パッチステージが見る stage_dependencies のステージ
pub fn dependency_stage(patch_stage: StageName) -> Option<StageName> {
    match patch_stage {
        StageName::PreInstallPatch => Some(StageName::Install),
        StageName::PostInstallPatch => Some(StageName::BeforeSetup),
        StageName::PreSetupPatch => Some(StageName::Setup),
        _ => None,
    }
}

/// 1つの git ブロック
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitArtifact {
    config: GitArtifactConfig,
    id: String,
}

/// パッチステージ1つへの寄与
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchContribution {
    pub artifact: GitArtifact,
    pub repo: ResolvedRepo,
    pub from: String,
    pub to: String,
    pub checksum: String,
}

impl GitArtifact {
    pub fn new(config: GitArtifactConfig) -> Self {
        let location = match &config.repo {
            GitRepoRef::Local => "local".to_string(),
            GitRepoRef::Remote { url, .. } => url.clone(),
        };
        let digest = hashsum([location.as_str(), config.add.as_str(), config.to.as_str()]);
        let name: String = config
            .repo_name()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let id = format!("{}_{}", name, &digest[..8]);
        Self { config, id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &GitArtifactConfig {
        &self.config
    }

    /// エクスポート設定のハッシュ
    pub fn paramshash(&self) -> String {
        let c = &self.config;
        hashsum(hash_inputs![
            c.cwd(),
            c.include_paths.as_slice(),
            c.exclude_paths.as_slice(),
            c.owner.clone(),
            c.group.clone(),
            c.to.as_str(),
        ])
    }

    pub fn commit_label(&self) -> String {
        labels::git_commit_label(&self.id)
    }

    pub fn export_filter(&self) -> PathFilter {
        PathFilter {
            cwd: self.config.cwd().to_string(),
            include: self.config.include_paths.clone(),
            exclude: self.config.exclude_paths.clone(),
        }
    }

    /// stage_dependencies のフィルタ（指定がなければ `None`）
    pub fn stage_filter(&self, stage: StageName) -> Option<PathFilter> {
        let globs = self.config.dependencies_for(stage);
        if globs.is_empty() {
            return None;
        }
        Some(PathFilter {
            cwd: self.config.cwd().to_string(),
            include: globs.to_vec(),
            exclude: self.config.exclude_paths.clone(),
        })
    }

    /// パッチステージ1つへの寄与
    ///
    /// `from` はこのステージより前のイメージに適用済みのコミットです。
    ///
    /// - pre_install / post_install / pre_setup: 依存 glob に差分があるときだけ。
    ///   チェックサムは現在のコミットでの依存ファイルの内容
    /// - post_setup: 差分がしきい値を超えるときだけ（チェックサムはコミットID）
    /// - latest: 残りの差分
    pub async fn patch_for(
        &self,
        vcs: &dyn VersionControl,
        repo: &ResolvedRepo,
        stage: StageName,
        from: &str,
        threshold: u64,
    ) -> Result<Option<PatchContribution>> {
        let current = repo.commit.as_str();
        if from == current {
            return Ok(None);
        }
        self.ensure_commit(vcs, repo, from).await?;

        if let Some(dependency) = dependency_stage(stage) {
            let Some(filter) = self.stage_filter(dependency) else {
                return Ok(None);
            };
            if vcs.diff(&repo.path, from, current, &filter).await?.is_empty() {
                return Ok(None);
            }
            let checksum = vcs.tree_checksum(&repo.path, current, &filter).await?;
            return Ok(Some(self.contribution(repo, from, checksum)));
        }

        let full = vcs
            .diff(&repo.path, from, current, &self.export_filter())
            .await?;
        let contribution = match stage {
            StageName::PostSetupPatch if exceeds_threshold(&full, threshold) => {
                Some(self.contribution(repo, from, current.to_string()))
            }
            StageName::LatestPatch if !full.is_empty() => Some(self.contribution(
                repo,
                from,
                patch_checksum(&full, current, threshold),
            )),
            _ => None,
        };
        if let Some(contribution) = &contribution {
            tracing::debug!(
                artifact = %self.id,
                %stage,
                from,
                to = current,
                bytes = full.size(),
                checksum = %contribution.checksum,
                "Planned git patch"
            );
        }
        Ok(contribution)
    }

    async fn ensure_commit(
        &self,
        vcs: &dyn VersionControl,
        repo: &ResolvedRepo,
        commit: &str,
    ) -> Result<()> {
        if vcs.commit_exists(&repo.path, commit).await? {
            return Ok(());
        }
        Err(BuildError::SignatureInputUnavailable(format!(
            "commit {} recorded for git '{}' no longer exists in {}",
            commit,
            self.config.repo_name(),
            repo.path.display()
        )))
    }

    fn contribution(&self, repo: &ResolvedRepo, from: &str, checksum: String) -> PatchContribution {
        PatchContribution {
            artifact: self.clone(),
            repo: repo.clone(),
            from: from.to_string(),
            to: repo.commit.clone(),
            checksum,
        }
    }

    /// アーカイブ（tar.gz）をコンテナ内で展開するコマンド
    pub fn archive_commands(&self, archive_file: &str) -> Vec<String> {
        let to = &self.config.to;
        let mut commands = vec![
            format!("mkdir -p {}", to),
            format!("tar -xzf {}/{} -C {}", CONTAINER_TMP_DIR, archive_file, to),
        ];
        commands.extend(self.chown_command());
        commands
    }

    /// パッチ（gzip）をコンテナ内で適用するコマンド
    pub fn patch_commands(&self, patch_file: &str) -> Vec<String> {
        let directory = self.config.to.trim_start_matches('/');
        let mut commands = vec![format!(
            "cd / && zcat {}/{} | git apply --whitespace=nowarn --directory={} --unsafe-paths",
            CONTAINER_TMP_DIR, patch_file, directory
        )];
        commands.extend(self.chown_command());
        commands
    }

    fn chown_command(&self) -> Option<String> {
        chown_command(
            self.config.owner.as_deref(),
            self.config.group.as_deref(),
            &self.config.to,
        )
    }
}

/// `chown -R owner:group <path>`（どちらも未指定なら `None`）
pub(crate) fn chown_command(owner: Option<&str>, group: Option<&str>, path: &str) -> Option<String> {
    match (owner, group) {
        (None, None) => None,
        (owner, group) => Some(format!(
            "chown -R {}:{} {}",
            owner.unwrap_or_default(),
            group.unwrap_or_default(),
            path
        )),
    }
}

/// 差分がしきい値を超えるか（ちょうどしきい値は超えない）
pub fn exceeds_threshold(patch: &PatchSet, threshold: u64) -> bool {
    patch.size() > threshold
}

/// パッチのチェックサム
///
/// しきい値を超える差分は内容をハッシュせず、コミットIDを使います。
pub fn patch_checksum(patch: &PatchSet, commit: &str, threshold: u64) -> String {
    if exceeds_threshold(patch, threshold) {
        commit.to_string()
    } else {
        sha256_hex(&patch.diff)
    }
}
