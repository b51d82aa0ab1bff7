//! マニフェストの検証
//!
//! 検証はターゲット単位で行い、1つのターゲットのエラーが他のターゲットの
//! ビルドを止めないようにします。

use crate::error::{ManifestError, Result};
use crate::model::{Manifest, TargetConfig};
use std::collections::HashSet;

/// 全ターゲットを検証（最初のエラーで終了）
pub fn validate_manifest(manifest: &Manifest) -> Result<()> {
    for target in manifest.images.iter().chain(manifest.artifacts.values()) {
        validate_target(manifest, target)?;
    }
    Ok(())
}

/// 1ターゲットを検証
pub fn validate_target(manifest: &Manifest, target: &TargetConfig) -> Result<()> {
    for import in &target.imports {
        if manifest.artifact(&import.artifact).is_none() {
            return Err(ManifestError::UnknownArtifact {
                target: target.display_name().to_string(),
                artifact: import.artifact.clone(),
            });
        }
    }

    validate_destinations(target)?;

    let mut stack = Vec::new();
    let mut done = HashSet::new();
    check_cycles(manifest, target, &mut stack, &mut done)
}

fn check_cycles<'a>(
    manifest: &'a Manifest,
    target: &'a TargetConfig,
    stack: &mut Vec<&'a str>,
    done: &mut HashSet<&'a str>,
) -> Result<()> {
    let name = target.display_name();
    if stack.contains(&name) {
        let mut chain: Vec<&str> = stack.clone();
        chain.push(name);
        return Err(ManifestError::CircularDependency(chain.join(" -> ")));
    }
    if done.contains(name) {
        return Ok(());
    }

    stack.push(name);
    for import in &target.imports {
        if let Some(artifact) = manifest.artifact(&import.artifact) {
            check_cycles(manifest, artifact, stack, done)?;
        }
    }
    stack.pop();
    done.insert(name);
    Ok(())
}

/// 配置先ごとに正規化したパス集合
#[derive(Debug, Clone)]
struct Destination {
    label: String,
    to: String,
    include_paths: Vec<String>,
    exclude_paths: Vec<String>,
}

impl Destination {
    fn new(label: String, to: &str, include: &[String], exclude: &[String]) -> Self {
        let formatted = normalize_path(to);
        let (root, rest) = match formatted.split_once('/') {
            Some((root, rest)) => (root.to_string(), rest.to_string()),
            None => (formatted.clone(), String::new()),
        };
        let join = |path: &String| {
            if rest.is_empty() {
                normalize_path(path)
            } else {
                normalize_path(&format!("{}/{}", rest, path))
            }
        };

        let include_paths = if include.is_empty() && !rest.is_empty() {
            vec![rest.clone()]
        } else {
            include.iter().map(join).collect()
        };
        let exclude_paths = exclude.iter().map(join).collect();

        Self {
            label,
            to: root,
            include_paths,
            exclude_paths,
        }
    }

    /// `path` またはその親ディレクトリが除外されているか
    fn excludes(&self, path: &str) -> bool {
        let mut current = path.to_string();
        loop {
            if self.exclude_paths.contains(&current) {
                return true;
            }
            match current.rsplit_once('/') {
                Some((parent, _)) => current = parent.to_string(),
                None => return false,
            }
        }
    }
}

/// git と import の配置先が重ならないか検証
fn validate_destinations(target: &TargetConfig) -> Result<()> {
    let mut destinations: Vec<Destination> = target
        .git
        .iter()
        .map(|git| {
            Destination::new(
                format!("git {}", git.repo_name()),
                &git.to,
                &git.include_paths,
                &git.exclude_paths,
            )
        })
        .chain(target.imports.iter().map(|import| {
            Destination::new(
                format!("import {}", import.artifact),
                &import.to,
                &import.include_paths,
                &import.exclude_paths,
            )
        }))
        .collect();

    while !destinations.is_empty() {
        let verifiable = destinations.remove(0);
        for other in destinations.iter().filter(|d| d.to == verifiable.to) {
            check_pair(target, &verifiable, other)?;
            check_pair(target, other, &verifiable)?;
        }
    }
    Ok(())
}

fn check_pair(target: &TargetConfig, verifiable: &Destination, other: &Destination) -> Result<()> {
    let conflict = |detail: String| ManifestError::ArtifactConflict {
        target: target.display_name().to_string(),
        to: format!("/{}", verifiable.to),
        detail,
    };

    for path in &verifiable.include_paths {
        for candidate in other.include_paths.iter().filter(|p| within(path, p)) {
            if !verifiable.excludes(candidate) {
                return Err(conflict(format!(
                    "{} と {} が '{}' を共有しています",
                    verifiable.label, other.label, candidate
                )));
            }
        }
    }

    if verifiable.include_paths.is_empty() {
        if other.include_paths.is_empty() || verifiable.exclude_paths.is_empty() {
            return Err(conflict(format!(
                "{} と {} が同じ配置先全体に書き込みます",
                verifiable.label, other.label
            )));
        }
        for candidate in &other.include_paths {
            if !verifiable.excludes(candidate) {
                return Err(conflict(format!(
                    "{} が {} の '{}' を除外していません",
                    verifiable.label, other.label, candidate
                )));
            }
        }
    }

    Ok(())
}

/// `path` が `dir` 自身かその配下か（パス要素単位で比較）
fn within(dir: &str, path: &str) -> bool {
    dir.is_empty()
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// 先頭スラッシュなしの正規化パス（`/app/./x/../y/` → `app/y`）
fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}
