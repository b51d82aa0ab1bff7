//! バージョン管理の読み取り層
//!
//! [`VersionControl`] はコミットの解決・差分・アーカイブだけを扱います。
//! 実装は `git` コマンドを呼ぶ [`GitCli`] です。

use crate::error::{BuildError, Result};
use crate::hasher::hashsum;
use crate::lock::{LockManager, LockMode};
use async_trait::async_trait;
use layerflow_core::{GitArtifactConfig, GitPin, GitRepoRef};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;

/// リポジトリ内の対象パス
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathFilter {
    /// リポジトリ内の基準ディレクトリ（空ならルート）
    pub cwd: String,
    /// cwd からの glob（空なら全体）
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl PathFilter {
    /// `git` のパススペック（リポジトリルート基準）
    pub fn pathspecs(&self) -> Vec<String> {
        let mut specs = Vec::new();
        if self.include.is_empty() {
            specs.push(format!(":(glob){}", self.join("**")));
        } else {
            for include in &self.include {
                specs.push(format!(":(glob){}", self.join(include)));
                specs.push(format!(":(glob){}", self.join(&format!("{}/**", include))));
            }
        }
        for exclude in &self.exclude {
            specs.push(format!(":(glob,exclude){}", self.join(exclude)));
            specs.push(format!(":(glob,exclude){}", self.join(&format!("{}/**", exclude))));
        }
        specs
    }

    /// `git archive <commit>:<cwd>` 用（cwd 基準）
    pub fn relative_pathspecs(&self) -> Vec<String> {
        Self {
            cwd: String::new(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
        }
        .pathspecs()
    }

    fn join(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if self.cwd.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.cwd, path)
        }
    }
}

/// 2コミット間の差分
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    pub from: String,
    pub to: String,
    /// 変更されたパス（リポジトリルート基準）
    pub paths: Vec<String>,
    /// `git diff --binary` の出力
    pub diff: Vec<u8>,
}

impl PatchSet {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.diff.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.diff.len() as u64
    }
}

/// バージョン管理の操作
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// pin（なければ HEAD）をコミットIDに解決
    async fn resolve_ref(&self, repo: &Path, pin: Option<&GitPin>) -> Result<String>;

    async fn diff(&self, repo: &Path, from: &str, to: &str, filter: &PathFilter)
    -> Result<PatchSet>;

    /// リモートのミラーを作成・更新
    async fn fetch(&self, repo: &Path, url: &str) -> Result<()>;

    async fn commit_exists(&self, repo: &Path, commit: &str) -> Result<bool>;

    /// cwd 配下を tar で取り出す（パスは cwd 基準）
    async fn archive(&self, repo: &Path, commit: &str, filter: &PathFilter) -> Result<Vec<u8>>;

    /// コミット時点でフィルタに一致するファイルの内容のチェックサム
    ///
    /// パスと内容だけで決まり、コミットIDやコミット日時には依存しません。
    async fn tree_checksum(
        &self,
        repo: &Path,
        commit: &str,
        filter: &PathFilter,
    ) -> Result<String>;
}

/// 空のツリー（SHA-1 リポジトリ）
const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// `git` コマンドによる実装
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    async fn git(&self, repo: Option<&Path>, args: &[String]) -> Result<Vec<u8>> {
        let mut command = Command::new("git");
        if let Some(repo) = repo {
            command.arg("-C").arg(repo);
        }
        command.args(args);
        tracing::trace!(?args, "Running git");

        let output = command
            .output()
            .await
            .map_err(|e| BuildError::GitCommandFailed {
                command: format!("git {}", args.join(" ")),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(BuildError::GitCommandFailed {
                command: format!("git {}", args.join(" ")),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[async_trait]
impl VersionControl for GitCli {
    async fn resolve_ref(&self, repo: &Path, pin: Option<&GitPin>) -> Result<String> {
        let revision = pin.map(GitPin::revision).unwrap_or_else(|| "HEAD".to_string());
        let output = self
            .git(
                Some(repo),
                &args(["rev-parse", "--verify", &format!("{}^{{commit}}", revision)]),
            )
            .await
            .map_err(|e| {
                BuildError::SignatureInputUnavailable(format!(
                    "{} in {}: {}",
                    revision,
                    repo.display(),
                    e
                ))
            })?;
        Ok(String::from_utf8_lossy(&output).trim().to_string())
    }

    async fn diff(
        &self,
        repo: &Path,
        from: &str,
        to: &str,
        filter: &PathFilter,
    ) -> Result<PatchSet> {
        let mut names = args(["diff", "--name-only", from, to, "--"]);
        names.extend(filter.pathspecs());
        let names = self.git(Some(repo), &names).await?;
        let paths: Vec<String> = String::from_utf8_lossy(&names)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        if paths.is_empty() {
            return Ok(PatchSet {
                from: from.to_string(),
                to: to.to_string(),
                ..Default::default()
            });
        }

        let mut diff_args = args(["diff", "--binary", "--full-index", from, to]);
        if !filter.cwd.is_empty() {
            diff_args.push(format!("--relative={}", filter.cwd));
        }
        diff_args.push("--".to_string());
        diff_args.extend(filter.pathspecs());
        let diff = self.git(Some(repo), &diff_args).await?;

        Ok(PatchSet {
            from: from.to_string(),
            to: to.to_string(),
            paths,
            diff,
        })
    }

    async fn fetch(&self, repo: &Path, url: &str) -> Result<()> {
        if repo.join("HEAD").exists() {
            tracing::debug!(url, "Fetching remote git repository");
            self.git(Some(repo), &args(["fetch", "--prune", "--tags", "origin"]))
                .await?;
        } else {
            tracing::info!(url, "Cloning remote git repository");
            if let Some(parent) = repo.parent() {
                std::fs::create_dir_all(parent).map_err(|e| BuildError::file(parent, e))?;
            }
            let target = repo.to_string_lossy().to_string();
            self.git(None, &args(["clone", "--mirror", "--quiet", url, &target]))
                .await?;
        }
        Ok(())
    }

    async fn commit_exists(&self, repo: &Path, commit: &str) -> Result<bool> {
        match self
            .git(
                Some(repo),
                &args(["cat-file", "-e", &format!("{}^{{commit}}", commit)]),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(BuildError::GitCommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn archive(&self, repo: &Path, commit: &str, filter: &PathFilter) -> Result<Vec<u8>> {
        let tree = if filter.cwd.is_empty() {
            commit.to_string()
        } else {
            format!("{}:{}", commit, filter.cwd)
        };
        let mut archive_args = args(["archive", "--format=tar", &tree, "--"]);
        archive_args.extend(filter.relative_pathspecs());
        self.git(Some(repo), &archive_args).await
    }

    async fn tree_checksum(
        &self,
        repo: &Path,
        commit: &str,
        filter: &PathFilter,
    ) -> Result<String> {
        // 空ツリーとの差分にはパス・モード・blob ID が並ぶ
        let mut raw = args(["diff", "--raw", "--no-renames", "--full-index", EMPTY_TREE, commit, "--"]);
        raw.extend(filter.pathspecs());
        let output = self.git(Some(repo), &raw).await?;

        let mut entries: Vec<String> = String::from_utf8_lossy(&output)
            .lines()
            .filter_map(|line| {
                let (meta, path) = line.split_once('\t')?;
                let fields: Vec<&str> = meta.split_whitespace().collect();
                // :000000 <mode> <zero> <blob> A
                Some(format!("{} {} {}", path, fields.get(1)?, fields.get(3)?))
            })
            .collect();
        entries.sort();
        Ok(hashsum(entries))
    }
}

/// 解決済みのリポジトリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRepo {
    /// git コマンドを実行するディレクトリ
    pub path: PathBuf,
    pub commit: String,
}

/// ビルド1回分のコミット解決
///
/// 同じリポジトリと pin は1回だけ解決し、以降は同じコミットを返します。
pub struct GitCommitResolver {
    vcs: Arc<dyn VersionControl>,
    project: String,
    project_root: PathBuf,
    mirror_dir: PathBuf,
    locks: LockManager,
    resolved: Mutex<HashMap<String, ResolvedRepo>>,
}

impl GitCommitResolver {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        project: &str,
        project_root: &Path,
        build_dir: &Path,
        locks: LockManager,
    ) -> Self {
        Self {
            vcs,
            project: project.to_string(),
            project_root: project_root.to_path_buf(),
            mirror_dir: build_dir.join("remote_git_repo"),
            locks,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn vcs(&self) -> &Arc<dyn VersionControl> {
        &self.vcs
    }

    /// リポジトリのローカルパス（解決はしない）
    pub fn repo_path(&self, config: &GitArtifactConfig) -> PathBuf {
        match &config.repo {
            GitRepoRef::Local => self.project_root.clone(),
            GitRepoRef::Remote { url, .. } => {
                let hash = hashsum([url.as_str()]);
                self.mirror_dir
                    .join(format!("{}-{}", config.repo_name(), &hash[..12]))
            }
        }
    }

    /// コミットを解決（リモートは初回に fetch）
    pub async fn resolve(&self, config: &GitArtifactConfig) -> Result<ResolvedRepo> {
        let key = match &config.repo {
            GitRepoRef::Local => "local".to_string(),
            GitRepoRef::Remote { url, pin } => format!("{}#{:?}", url, pin),
        };

        let mut resolved = self.resolved.lock().await;
        if let Some(repo) = resolved.get(&key) {
            return Ok(repo.clone());
        }

        let path = self.repo_path(config);
        let commit = match &config.repo {
            GitRepoRef::Local => self.vcs.resolve_ref(&path, None).await?,
            GitRepoRef::Remote { url, pin } => {
                let lock = format!("{}.remote_git_repo.{}", self.project, config.repo_name());
                self.locks
                    .with_lock(&lock, LockMode::Exclusive, async {
                        self.vcs.fetch(&path, url).await.map_err(|e| {
                            BuildError::SignatureInputUnavailable(format!(
                                "failed to fetch {}: {}",
                                url, e
                            ))
                        })
                    })
                    .await?;
                self.vcs.resolve_ref(&path, pin.as_ref()).await?
            }
        };
        tracing::debug!(repo = %config.repo_name(), %commit, "Resolved git commit");

        let repo = ResolvedRepo { path, commit };
        resolved.insert(key, repo.clone());
        Ok(repo)
    }
}
