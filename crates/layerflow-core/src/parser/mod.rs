//! KDLパーサー
//!
//! layerflow の KDL 設定ファイルをパースします。
//! 各ノードタイプのパース処理はモジュールに分離されています。

mod builder;
mod docker;
mod git;
mod import;
mod target;

use target::{parse_image, parse_top_level_artifact};

use crate::error::{ManifestError, Result};
use crate::model::Manifest;
use kdl::{KdlDocument, KdlNode, KdlValue};
use std::fs;
use std::path::{Path, PathBuf};

/// KDLファイルをパースしてManifestを生成
///
/// プロジェクト名の既定値はマニフェストのあるディレクトリ名です。
pub fn parse_kdl_file<P: AsRef<Path>>(path: P) -> Result<Manifest> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| ManifestError::IoError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let root = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = root
        .canonicalize()
        .ok()
        .as_deref()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();
    parse_kdl_string(&content, name, root)
}

/// KDL文字列をパース
pub fn parse_kdl_string(content: &str, default_project: String, root: PathBuf) -> Result<Manifest> {
    let doc: KdlDocument = content.parse()?;
    let mut manifest = Manifest::new(normalize_project_name(&default_project), root);

    for node in doc.nodes() {
        match node.name().value() {
            "project" => {
                if let Some(project) = first_string(node) {
                    manifest.project = project.to_string();
                }
            }
            "image" => {
                let (image, nested) = parse_image(node)?;
                if manifest.images.iter().any(|i| i.name == image.name) {
                    return Err(ManifestError::DuplicateTarget(
                        image.display_name().to_string(),
                    ));
                }
                manifest.images.push(image);
                for artifact in nested {
                    insert_artifact(&mut manifest, artifact)?;
                }
            }
            "artifact" => {
                let artifact = parse_top_level_artifact(node)?;
                insert_artifact(&mut manifest, artifact)?;
            }
            _ => {
                // 不明なノードはスキップ
            }
        }
    }

    validate_names(&manifest)?;
    Ok(manifest)
}

fn insert_artifact(manifest: &mut Manifest, artifact: crate::model::TargetConfig) -> Result<()> {
    let name = artifact.display_name().to_string();
    if manifest.artifacts.contains_key(&name) || manifest.image(Some(&name)).is_some() {
        return Err(ManifestError::DuplicateTarget(name));
    }
    manifest.artifacts.insert(name, artifact);
    Ok(())
}

fn validate_names(manifest: &Manifest) -> Result<()> {
    if !is_valid_name(&manifest.project) {
        return Err(ManifestError::InvalidConfig(format!(
            "project name '{}' must match [a-z0-9][a-z0-9._-]*",
            manifest.project
        )));
    }
    for target in manifest.images.iter().chain(manifest.artifacts.values()) {
        if let Some(name) = &target.name
            && !is_valid_name(name)
        {
            return Err(ManifestError::InvalidConfig(format!(
                "target name '{}' must match [a-z0-9][a-z0-9._-]*",
                name
            )));
        }
        if let Some(name) = &target.name
            && manifest.image(Some(name)).is_some()
            && manifest.artifact(name).is_some()
        {
            return Err(ManifestError::DuplicateTarget(name.clone()));
        }
    }
    Ok(())
}

/// Docker のリポジトリ名として使える名前か
pub(crate) fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

fn normalize_project_name(name: &str) -> String {
    let normalized: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = normalized.trim_start_matches(['.', '_', '-']);
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 最初の位置引数（文字列）
pub(crate) fn first_string(node: &KdlNode) -> Option<&str> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
}

/// 全ての位置引数（文字列）
pub(crate) fn string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string().map(str::to_string))
        .collect()
}

/// 名前付きプロパティ
pub(crate) fn property<'a>(node: &'a KdlNode, key: &str) -> Option<&'a KdlValue> {
    node.entries()
        .iter()
        .rev()
        .find(|e| e.name().is_some_and(|n| n.value() == key))
        .map(|e| e.value())
}

pub(crate) fn string_property(node: &KdlNode, key: &str) -> Option<String> {
    property(node, key).and_then(|v| v.as_string()).map(str::to_string)
}

/// 全ての名前付きプロパティ（文字列化）
pub(crate) fn string_properties(node: &KdlNode) -> Vec<(String, String)> {
    node.entries()
        .iter()
        .filter_map(|e| {
            let key = e.name()?.value().to_string();
            Some((key, value_to_string(e.value())))
        })
        .collect()
}

pub(crate) fn value_to_string(value: &KdlValue) -> String {
    if let Some(s) = value.as_string() {
        s.to_string()
    } else if let Some(i) = value.as_integer() {
        i.to_string()
    } else if let Some(b) = value.as_bool() {
        b.to_string()
    } else if let Some(f) = value.as_float() {
        f.to_string()
    } else {
        String::new()
    }
}
