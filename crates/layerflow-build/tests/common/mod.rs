//! 統合テスト用の共通ヘルパー

#![allow(dead_code)]

use async_trait::async_trait;
use layerflow_build::error::Result;
use layerflow_build::vcs::{PatchSet, PathFilter, VersionControl};
use layerflow_build::{BuildContext, BuildError, hashsum};
use layerflow_config::Settings;
use layerflow_container::InMemoryRuntime;
use layerflow_core::{GitPin, Manifest, ShellConfig, ShellStage, StageName, TargetConfig, BuilderConfig};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct FakeState {
    head: String,
    commits: HashSet<String>,
    diffs: HashMap<(String, String), Vec<u8>>,
    trees: HashMap<String, BTreeMap<String, String>>,
}

/// コミットと差分を手で与えるバージョン管理
///
/// [`FakeVcs::commit`] で登録したコミット同士の差分はファイル内容から作り、
/// フィルタも効きます。[`FakeVcs::set_diff`] の差分はフィルタに関係なく返します。
#[derive(Default)]
pub struct FakeVcs {
    state: Mutex<FakeState>,
}

impl FakeVcs {
    pub fn new(head: &str) -> Self {
        let vcs = Self::default();
        vcs.set_head(head);
        vcs
    }

    pub fn set_head(&self, commit: &str) {
        let mut state = self.state.lock().unwrap();
        state.head = commit.to_string();
        state.commits.insert(commit.to_string());
    }

    /// ファイル一式のコミットを作って HEAD にする
    pub fn commit(&self, commit: &str, files: &[(&str, &str)]) {
        let tree = files
            .iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect();
        self.state
            .lock()
            .unwrap()
            .trees
            .insert(commit.to_string(), tree);
        self.set_head(commit);
    }

    pub fn set_diff(&self, from: &str, to: &str, diff: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .diffs
            .insert((from.to_string(), to.to_string()), diff.to_vec());
    }

    /// 履歴の書き換えなどでコミットが消えた状態にする
    pub fn forget(&self, commit: &str) {
        self.state.lock().unwrap().commits.remove(commit);
    }
}

fn matches_any(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|pattern| {
        let pattern = pattern.trim_matches('/');
        path == pattern
            || path.starts_with(&format!("{}/", pattern))
            || glob::Pattern::new(pattern).is_ok_and(|p| p.matches(path))
    })
}

fn filter_matches(filter: &PathFilter, path: &str) -> bool {
    let relative = if filter.cwd.is_empty() {
        path
    } else {
        match path.strip_prefix(&format!("{}/", filter.cwd)) {
            Some(relative) => relative,
            None => return false,
        }
    };
    (filter.include.is_empty() || matches_any(&filter.include, relative))
        && !matches_any(&filter.exclude, relative)
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn resolve_ref(&self, _repo: &Path, _pin: Option<&GitPin>) -> Result<String> {
        Ok(self.state.lock().unwrap().head.clone())
    }

    async fn diff(&self, _repo: &Path, from: &str, to: &str, filter: &PathFilter) -> Result<PatchSet> {
        let state = self.state.lock().unwrap();
        if let Some(diff) = state.diffs.get(&(from.to_string(), to.to_string())) {
            return Ok(PatchSet {
                from: from.to_string(),
                to: to.to_string(),
                paths: vec!["app.rb".to_string()],
                diff: diff.clone(),
            });
        }

        let empty = BTreeMap::new();
        let old = state.trees.get(from).unwrap_or(&empty);
        let new = state.trees.get(to).unwrap_or(&empty);
        let mut paths: Vec<String> = old
            .keys()
            .chain(new.keys())
            .filter(|path| old.get(*path) != new.get(*path))
            .filter(|path| filter_matches(filter, path))
            .cloned()
            .collect();
        paths.sort();
        paths.dedup();

        let mut diff = Vec::new();
        for path in &paths {
            diff.extend(
                format!(
                    "{}: {} -> {}\n",
                    path,
                    old.get(path).map(String::as_str).unwrap_or("-"),
                    new.get(path).map(String::as_str).unwrap_or("-")
                )
                .into_bytes(),
            );
        }
        Ok(PatchSet {
            from: from.to_string(),
            to: to.to_string(),
            paths,
            diff,
        })
    }

    async fn fetch(&self, _repo: &Path, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn commit_exists(&self, _repo: &Path, commit: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().commits.contains(commit))
    }

    async fn archive(&self, _repo: &Path, commit: &str, _filter: &PathFilter) -> Result<Vec<u8>> {
        if !self.state.lock().unwrap().commits.contains(commit) {
            return Err(BuildError::GitCommandFailed {
                command: format!("git archive {}", commit),
                message: "unknown revision".to_string(),
            });
        }
        Ok(format!("archive of {}", commit).into_bytes())
    }

    async fn tree_checksum(&self, _repo: &Path, commit: &str, filter: &PathFilter) -> Result<String> {
        let state = self.state.lock().unwrap();
        let entries: Vec<String> = state
            .trees
            .get(commit)
            .into_iter()
            .flatten()
            .filter(|(path, _)| filter_matches(filter, path))
            .map(|(path, content)| format!("{}={}", path, content))
            .collect();
        Ok(hashsum(entries))
    }
}

/// テスト1つ分の環境
pub struct Fixture {
    pub dir: TempDir,
    pub runtime: Arc<InMemoryRuntime>,
    pub vcs: Arc<FakeVcs>,
    pub settings: Settings,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            build_dir: dir.path().join("build"),
            lock_timeout_secs: 5,
            ..Default::default()
        };
        Self {
            dir,
            runtime: Arc::new(InMemoryRuntime::new()),
            vcs: Arc::new(FakeVcs::new("c0ffee0000000000000000000000000000000001")),
            settings,
        }
    }

    pub fn manifest(&self) -> Manifest {
        Manifest::new("shop", self.dir.path())
    }

    pub fn context(&self, manifest: Manifest) -> BuildContext {
        BuildContext::with_vcs(
            manifest,
            self.settings.clone(),
            self.runtime.clone(),
            self.vcs.clone(),
        )
    }
}

/// shell ビルダーのイメージ
pub fn shell_image(name: Option<&str>, stages: &[(StageName, &str)]) -> TargetConfig {
    let mut target = TargetConfig::image(name, "alpine:3.20");
    target.builder = BuilderConfig::Shell(shell(stages));
    target
}

pub fn shell(stages: &[(StageName, &str)]) -> ShellConfig {
    let mut config = ShellConfig::default();
    for (stage, command) in stages {
        config
            .stages
            .entry(*stage)
            .or_insert_with(ShellStage::default)
            .commands
            .push(command.to_string());
    }
    config
}
