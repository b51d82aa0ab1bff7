//! ビルダー定義
//!
//! 1ターゲットにつきビルダーは最大1種類です。

use super::stage::StageName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// ビルダーの種類とその設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BuilderConfig {
    #[default]
    None,
    Shell(ShellConfig),
    Chef(ChefConfig),
    Ansible(AnsibleConfig),
}

impl BuilderConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            BuilderConfig::None => "none",
            BuilderConfig::Shell(_) => "shell",
            BuilderConfig::Chef(_) => "chef",
            BuilderConfig::Ansible(_) => "ansible",
        }
    }
}

/// shell ビルダー
///
/// KDL形式：
/// ```kdl
/// shell {
///     install "bundle install" cache_version="1"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShellConfig {
    pub stages: BTreeMap<StageName, ShellStage>,
}

impl ShellConfig {
    pub fn stage(&self, stage: StageName) -> Option<&ShellStage> {
        self.stages.get(&stage)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShellStage {
    pub commands: Vec<String>,
    pub cache_version: Option<String>,
}

/// chef ビルダー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChefConfig {
    /// ルートクックブック（Berksfile を含むディレクトリ）
    pub cookbook_dir: PathBuf,
    /// 有効化するレシピ
    pub recipes: Vec<String>,
    /// 追加のクックブック依存
    pub cookbooks: Vec<CookbookDependency>,
    /// 全ステージ共通の属性
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// ステージ固有の属性
    pub stage_attributes: BTreeMap<StageName, serde_json::Map<String, serde_json::Value>>,
}

impl Default for ChefConfig {
    fn default() -> Self {
        Self {
            cookbook_dir: PathBuf::from(".layerflow_chef"),
            recipes: Vec::new(),
            cookbooks: Vec::new(),
            attributes: serde_json::Map::new(),
            stage_attributes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookbookDependency {
    pub name: String,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

/// ansible ビルダー
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnsibleConfig {
    /// ロールやファイルを置くディレクトリ
    pub dir: Option<PathBuf>,
    pub stages: BTreeMap<StageName, Vec<AnsibleTask>>,
}

impl AnsibleConfig {
    pub fn tasks(&self, stage: StageName) -> &[AnsibleTask] {
        self.stages.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// `task "apt" name="curl" state="present"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnsibleTask {
    pub module: String,
    pub args: BTreeMap<String, String>,
    /// モジュールへの自由形式引数 (`task "shell" "echo hi"`)
    pub free_form: Option<String>,
}
