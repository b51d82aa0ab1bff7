//! ビルドターゲット定義

use super::builder::BuilderConfig;
use super::docker::DockerDirectives;
use super::git::GitArtifactConfig;
use super::import::{ArtifactAnchor, ArtifactImport};
use super::stage::StageName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Image,
    Artifact,
}

/// `image` または `artifact` ブロック1つ分
///
/// パース・検証後は変更しません。派生が必要な場合は
/// [`TargetConfig::derive`] で新しい値を作ります。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// None はプロジェクト唯一の無名イメージ
    pub name: Option<String>,
    pub kind: TargetKind,
    pub from: String,
    pub from_cache_version: Option<String>,
    pub builder: BuilderConfig,
    pub git: Vec<GitArtifactConfig>,
    pub imports: Vec<ArtifactImport>,
    pub docker: DockerDirectives,
    /// ビルダーステージごとの依存ファイル（プロジェクトルートからの glob）
    pub dependencies: BTreeMap<StageName, Vec<String>>,
}

/// 派生ターゲットで上書きする値
#[derive(Debug, Clone, Default)]
pub struct TargetOverride {
    pub name: Option<String>,
    pub kind: Option<TargetKind>,
    pub from: Option<String>,
    pub from_cache_version: Option<String>,
    pub builder: Option<BuilderConfig>,
    pub git: Option<Vec<GitArtifactConfig>>,
    pub imports: Option<Vec<ArtifactImport>>,
    pub docker: Option<DockerDirectives>,
    pub dependencies: Option<BTreeMap<StageName, Vec<String>>>,
}

impl TargetConfig {
    pub fn image(name: Option<&str>, from: impl Into<String>) -> Self {
        Self {
            name: name.map(str::to_string),
            kind: TargetKind::Image,
            from: from.into(),
            from_cache_version: None,
            builder: BuilderConfig::None,
            git: Vec::new(),
            imports: Vec::new(),
            docker: DockerDirectives::default(),
            dependencies: BTreeMap::new(),
        }
    }

    pub fn artifact(name: &str, from: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Artifact,
            ..Self::image(Some(name), from)
        }
    }

    /// 表示用の名前（無名イメージは `-`）
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("-")
    }

    pub fn is_artifact(&self) -> bool {
        self.kind == TargetKind::Artifact
    }

    /// 元の値を変更せずに、上書きを適用した新しいターゲットを作る
    pub fn derive(&self, overrides: TargetOverride) -> Self {
        Self {
            name: overrides.name.or_else(|| self.name.clone()),
            kind: overrides.kind.unwrap_or(self.kind),
            from: overrides.from.unwrap_or_else(|| self.from.clone()),
            from_cache_version: overrides
                .from_cache_version
                .or_else(|| self.from_cache_version.clone()),
            builder: overrides.builder.unwrap_or_else(|| self.builder.clone()),
            git: overrides.git.unwrap_or_else(|| self.git.clone()),
            imports: overrides.imports.unwrap_or_else(|| self.imports.clone()),
            docker: overrides.docker.unwrap_or_else(|| self.docker.clone()),
            dependencies: overrides
                .dependencies
                .unwrap_or_else(|| self.dependencies.clone()),
        }
    }

    /// 指定位置の import を宣言順で返す
    pub fn imports_at(&self, anchor: ArtifactAnchor) -> impl Iterator<Item = &ArtifactImport> {
        self.imports.iter().filter(move |import| import.anchor == anchor)
    }

    pub fn dependency_globs(&self, stage: StageName) -> &[String] {
        self.dependencies
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_keeps_original() {
        let mut parent = TargetConfig::image(Some("app"), "ruby:3.3");
        parent.from_cache_version = Some("2".into());

        let child = parent.derive(TargetOverride {
            name: Some("assets".into()),
            kind: Some(TargetKind::Artifact),
            ..Default::default()
        });

        assert_eq!(child.name.as_deref(), Some("assets"));
        assert_eq!(child.from, "ruby:3.3");
        assert_eq!(child.from_cache_version.as_deref(), Some("2"));
        assert!(child.is_artifact());
        assert_eq!(parent.name.as_deref(), Some("app"));
        assert!(!parent.is_artifact());
    }

    #[test]
    fn test_imports_at_keeps_declaration_order() {
        let mut target = TargetConfig::image(None, "alpine");
        target
            .imports
            .push(ArtifactImport::new("b", "/b", ArtifactAnchor::BeforeSetup));
        target
            .imports
            .push(ArtifactImport::new("x", "/x", ArtifactAnchor::AfterInstall));
        target
            .imports
            .push(ArtifactImport::new("a", "/a", ArtifactAnchor::BeforeSetup));

        let names: Vec<_> = target
            .imports_at(ArtifactAnchor::BeforeSetup)
            .map(|i| i.artifact.as_str())
            .collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(target.display_name(), "-");
    }
}
