//! image / artifact ノードのパース

use super::builder::{parse_ansible, parse_chef, parse_shell};
use super::docker::parse_docker;
use super::git::parse_git;
use super::import::parse_import;
use super::{first_string, string_args, string_property};
use crate::error::{ManifestError, Result};
use crate::model::{
    BuilderConfig, DockerDirectives, StageName, TargetConfig, TargetKind, TargetOverride,
};
use kdl::KdlNode;
use std::collections::BTreeMap;

/// image ノードをパース
///
/// ブロック内で宣言されたアーティファクトも一緒に返します。
pub fn parse_image(node: &KdlNode) -> Result<(TargetConfig, Vec<TargetConfig>)> {
    let name = first_string(node).map(str::to_string);
    let label = name.clone().unwrap_or_else(|| "-".to_string());
    let body = parse_body(node, &label, true)?;

    let from = body
        .overrides
        .from
        .clone()
        .ok_or_else(|| ManifestError::MissingFrom(label.clone()))?;
    let image = TargetConfig::image(name.as_deref(), from).derive(body.overrides);

    let mut nested = Vec::with_capacity(body.nested_artifacts.len());
    for artifact_node in &body.nested_artifacts {
        nested.push(parse_nested_artifact(artifact_node, &image)?);
    }

    Ok((image, nested))
}

/// トップレベルの artifact ノードをパース
pub fn parse_top_level_artifact(node: &KdlNode) -> Result<TargetConfig> {
    let name = artifact_name(node)?;
    let body = parse_body(node, &name, false)?;
    let from = body
        .overrides
        .from
        .clone()
        .ok_or_else(|| ManifestError::MissingFrom(name.clone()))?;
    Ok(TargetConfig::artifact(&name, from).derive(body.overrides))
}

/// image ブロック内の artifact をパース
///
/// from を省略した場合は親イメージの from / cache_version を引き継ぎます。
fn parse_nested_artifact(node: &KdlNode, parent: &TargetConfig) -> Result<TargetConfig> {
    let name = artifact_name(node)?;
    let body = parse_body(node, &name, false)?;
    let overrides = body.overrides;

    Ok(parent.derive(TargetOverride {
        name: Some(name),
        kind: Some(TargetKind::Artifact),
        builder: Some(overrides.builder.unwrap_or_default()),
        git: Some(overrides.git.unwrap_or_default()),
        imports: Some(overrides.imports.unwrap_or_default()),
        docker: Some(overrides.docker.unwrap_or_default()),
        dependencies: Some(overrides.dependencies.unwrap_or_default()),
        from: overrides.from,
        from_cache_version: overrides.from_cache_version,
    }))
}

fn artifact_name(node: &KdlNode) -> Result<String> {
    first_string(node)
        .map(str::to_string)
        .ok_or_else(|| ManifestError::InvalidConfig("artifact requires a name".to_string()))
}

struct TargetBody<'a> {
    overrides: TargetOverride,
    nested_artifacts: Vec<&'a KdlNode>,
}

fn parse_body<'a>(node: &'a KdlNode, target: &str, allow_nested: bool) -> Result<TargetBody<'a>> {
    let mut overrides = TargetOverride::default();
    let mut nested_artifacts = Vec::new();
    let mut git = Vec::new();
    let mut imports = Vec::new();
    let mut docker = DockerDirectives::default();
    let mut dependencies: BTreeMap<StageName, Vec<String>> = BTreeMap::new();
    let mut builder: Option<BuilderConfig> = None;

    let Some(children) = node.children() else {
        return Ok(TargetBody {
            overrides,
            nested_artifacts,
        });
    };

    for child in children.nodes() {
        match child.name().value() {
            "from" => {
                overrides.from = first_string(child).map(str::to_string);
                overrides.from_cache_version = string_property(child, "cache_version");
            }
            "shell" | "chef" | "ansible" => {
                if builder.is_some() {
                    return Err(ManifestError::MultipleBuilders {
                        target: target.to_string(),
                    });
                }
                builder = Some(match child.name().value() {
                    "shell" => BuilderConfig::Shell(parse_shell(child)?),
                    "chef" => BuilderConfig::Chef(parse_chef(child)?),
                    _ => BuilderConfig::Ansible(parse_ansible(child)?),
                });
            }
            "git" => git.push(parse_git(child, target)?),
            "import" => imports.push(parse_import(child, target)?),
            "docker" => parse_docker(child, &mut docker),
            "dependencies" => {
                if let Some(stages) = child.children() {
                    for stage_node in stages.nodes() {
                        let stage: StageName = stage_node.name().value().parse()?;
                        if !stage.is_builder_stage() {
                            return Err(ManifestError::InvalidConfig(format!(
                                "dependencies: '{}' is not a builder stage",
                                stage
                            )));
                        }
                        dependencies
                            .entry(stage)
                            .or_default()
                            .extend(string_args(stage_node));
                    }
                }
            }
            "artifact" if allow_nested => nested_artifacts.push(child),
            "artifact" => {
                return Err(ManifestError::InvalidConfig(format!(
                    "artifact '{}' cannot declare nested artifacts",
                    target
                )));
            }
            _ => {}
        }
    }

    overrides.builder = builder;
    overrides.git = Some(git);
    overrides.imports = Some(imports);
    overrides.docker = Some(docker);
    overrides.dependencies = Some(dependencies);

    Ok(TargetBody {
        overrides,
        nested_artifacts,
    })
}
