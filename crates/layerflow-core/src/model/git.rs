//! git アーティファクト定義

use super::stage::StageName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// リポジトリ参照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitRepoRef {
    /// プロジェクト自身のリポジトリ
    Local,
    Remote { url: String, pin: Option<GitPin> },
}

/// リモートリポジトリの固定方法（いずれか1つ）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitPin {
    Branch(String),
    Tag(String),
    Commit(String),
}

impl GitPin {
    /// `git rev-parse` に渡すリビジョン
    pub fn revision(&self) -> String {
        match self {
            GitPin::Branch(branch) => format!("refs/heads/{}", branch),
            GitPin::Tag(tag) => format!("refs/tags/{}", tag),
            GitPin::Commit(commit) => commit.clone(),
        }
    }
}

/// git ブロック1つ分のエクスポート設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitArtifactConfig {
    pub repo: GitRepoRef,
    /// リポジトリ内のパス（cwd）
    pub add: String,
    /// イメージ内の配置先
    pub to: String,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// ステージごとのシグネチャに効くパス
    pub stage_dependencies: BTreeMap<StageName, Vec<String>>,
}

impl GitArtifactConfig {
    pub fn local(to: impl Into<String>) -> Self {
        Self {
            repo: GitRepoRef::Local,
            add: "/".to_string(),
            to: to.into(),
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            owner: None,
            group: None,
            stage_dependencies: BTreeMap::new(),
        }
    }

    pub fn remote(url: impl Into<String>, pin: Option<GitPin>, to: impl Into<String>) -> Self {
        Self {
            repo: GitRepoRef::Remote {
                url: url.into(),
                pin,
            },
            ..Self::local(to)
        }
    }

    /// リポジトリ名
    ///
    /// # Examples
    /// - local -> `own`
    /// - `https://github.com/org/lib.git` -> `lib`
    pub fn repo_name(&self) -> String {
        match &self.repo {
            GitRepoRef::Local => "own".to_string(),
            GitRepoRef::Remote { url, .. } => {
                let last = url
                    .trim_end_matches('/')
                    .rsplit(['/', ':'])
                    .next()
                    .unwrap_or(url);
                last.trim_end_matches(".git").to_string()
            }
        }
    }

    /// `add` を先頭・末尾のスラッシュなしで返す（ルートは空文字）
    pub fn cwd(&self) -> &str {
        self.add.trim_matches('/')
    }

    pub fn dependencies_for(&self, stage: StageName) -> &[String] {
        self.stage_dependencies
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
