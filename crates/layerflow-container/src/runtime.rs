//! コンテナランタイムの抽象
//!
//! ステージのビルド・タグ付け・削除はすべてこのトレイト経由で行います。

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use layerflow_core::DockerDirectives;
use std::collections::{BTreeMap, HashMap};

/// コンテナランタイムのトレイト
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `from` からコンテナを作成してコマンドを実行し、結果をコミットする
    ///
    /// 戻り値は新しいイメージID。
    async fn build(&self, from: &str, instructions: &Instructions) -> Result<String>;

    /// コマンドを実行するだけでコミットしない（アーティファクトの取り出し用）
    async fn run(&self, image: &str, instructions: &Instructions) -> Result<()>;

    async fn tag(&self, id: &str, name: &str) -> Result<()>;

    async fn untag(&self, name: &str) -> Result<()>;

    async fn push(&self, name: &str) -> Result<()>;

    async fn pull(&self, name: &str) -> Result<()>;

    /// イメージが存在しなければ `None`
    async fn inspect(&self, id_or_name: &str) -> Result<Option<ImageInspection>>;

    async fn list_images(&self, filter: &ImageFilter) -> Result<Vec<ImageSummary>>;

    /// 使用中の場合は [`crate::ContainerError::ImageInUse`]
    async fn remove(&self, id_or_name: &str, force: bool) -> Result<()>;

    async fn containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>>;

    async fn remove_container(&self, id: &str) -> Result<()>;
}

/// 1回のビルド/実行の指示
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instructions {
    /// ビルドコンテナ名
    pub name: Option<String>,
    /// `sh -ec` で順に実行するコマンド
    pub commands: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// `host:container[:ro]`
    pub binds: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// コミット時に適用するイメージ設定
    pub changes: DockerDirectives,
    /// 失敗時にコンテナを残す
    pub keep_on_error: bool,
}

impl Instructions {
    /// 実行するスクリプト（コマンドがなければ `true`）
    pub fn script(&self) -> String {
        if self.commands.is_empty() {
            "true".to_string()
        } else {
            self.commands.join("\n")
        }
    }
}

/// `inspect` の結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageInspection {
    pub id: String,
    pub tags: Vec<String>,
    pub parent_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub size: i64,
    pub labels: HashMap<String, String>,
}

/// `list_images` の1件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageSummary {
    pub id: String,
    pub tags: Vec<String>,
    pub parent_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub size: i64,
    pub labels: HashMap<String, String>,
}

impl ImageSummary {
    pub fn is_dangling(&self) -> bool {
        self.tags.is_empty() || self.tags.iter().all(|t| t == "<none>:<none>")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageFilter {
    /// リポジトリ名（タグなし）
    pub reference: Option<String>,
    /// `key` または `key=value`
    pub labels: Vec<String>,
    pub dangling: Option<bool>,
}

impl ImageFilter {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            labels: vec![label.into()],
            ..Default::default()
        }
    }

    pub fn reference(repository: impl Into<String>) -> Self {
        Self {
            reference: Some(repository.into()),
            ..Default::default()
        }
    }

    /// Docker API のフィルタ形式
    pub fn to_filters(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        if let Some(reference) = &self.reference {
            filters.insert("reference".to_string(), vec![reference.clone()]);
        }
        if !self.labels.is_empty() {
            filters.insert("label".to_string(), self.labels.clone());
        }
        if let Some(dangling) = self.dangling {
            filters.insert("dangling".to_string(), vec![dangling.to_string()]);
        }
        filters
    }

    /// ラベル条件に一致するか
    pub fn matches_labels(&self, labels: &HashMap<String, String>) -> bool {
        self.labels.iter().all(|cond| match cond.split_once('=') {
            Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
            None => labels.contains_key(cond),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    /// 先頭の `/` を除いた名前
    pub names: Vec<String>,
    pub image_id: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerFilter {
    pub name_prefix: Option<String>,
    /// このイメージ（または子孫）から作られたコンテナ
    pub ancestor: Option<String>,
}

/// `repo:tag` を分割（タグなしは `latest`）
///
/// # Examples
/// - `redis:7-alpine` -> (`redis`, `7-alpine`)
/// - `localhost:5000/app` -> (`localhost:5000/app`, `latest`)
pub fn split_reference(name: &str) -> (&str, &str) {
    match name.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (name, "latest"),
    }
}
