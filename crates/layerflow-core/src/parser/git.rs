//! git ノードのパース

use super::{first_string, string_args, string_property};
use crate::error::{ManifestError, Result};
use crate::model::{GitArtifactConfig, GitPin, StageName};
use kdl::KdlNode;

/// git ノードをパース
///
/// KDL形式：
/// ```kdl
/// git "https://example.com/org/lib.git" branch="main" {
///     add "/src" to="/opt/lib" owner="app"
///     include "lib"
///     stage_dependencies { install "Gemfile.lock" }
/// }
/// ```
pub fn parse_git(node: &KdlNode, target: &str) -> Result<GitArtifactConfig> {
    let mut git = match first_string(node) {
        Some(url) => {
            let pins: Vec<GitPin> = [
                string_property(node, "branch").map(GitPin::Branch),
                string_property(node, "tag").map(GitPin::Tag),
                string_property(node, "commit").map(GitPin::Commit),
            ]
            .into_iter()
            .flatten()
            .collect();
            if pins.len() > 1 {
                return Err(ManifestError::ConflictingGitPin {
                    target: target.to_string(),
                    repo: url.to_string(),
                });
            }
            GitArtifactConfig::remote(url, pins.into_iter().next(), "")
        }
        None => GitArtifactConfig::local(""),
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "add" => {
                    if let Some(add) = first_string(child) {
                        git.add = add.to_string();
                    }
                    if let Some(to) = string_property(child, "to") {
                        git.to = to;
                    }
                    if let Some(owner) = string_property(child, "owner") {
                        git.owner = Some(owner);
                    }
                    if let Some(group) = string_property(child, "group") {
                        git.group = Some(group);
                    }
                }
                "to" => {
                    if let Some(to) = first_string(child) {
                        git.to = to.to_string();
                    }
                }
                "owner" => git.owner = first_string(child).map(str::to_string),
                "group" => git.group = first_string(child).map(str::to_string),
                "include" => git.include_paths.extend(string_args(child)),
                "exclude" => git.exclude_paths.extend(string_args(child)),
                "stage_dependencies" => {
                    if let Some(stages) = child.children() {
                        for stage_node in stages.nodes() {
                            let stage: StageName = stage_node.name().value().parse()?;
                            if !stage.accepts_git_dependencies() {
                                return Err(ManifestError::InvalidConfig(format!(
                                    "git stage_dependencies: '{}' is not one of install, before_setup, setup",
                                    stage
                                )));
                            }
                            git.stage_dependencies
                                .entry(stage)
                                .or_default()
                                .extend(string_args(stage_node));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    if !git.to.starts_with('/') {
        return Err(ManifestError::InvalidConfig(format!(
            "git '{}' in '{}' requires an absolute `to` path",
            git.repo_name(),
            target
        )));
    }
    if !git.add.starts_with('/') {
        git.add = format!("/{}", git.add);
    }

    Ok(git)
}
