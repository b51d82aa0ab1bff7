//! shell / chef / ansible ノードのパース

use super::{first_string, property, string_args, string_properties, string_property};
use crate::error::{ManifestError, Result};
use crate::model::{
    AnsibleConfig, AnsibleTask, ChefConfig, CookbookDependency, ShellConfig, StageName,
};
use kdl::{KdlNode, KdlValue};
use std::path::PathBuf;

fn builder_stage(node: &KdlNode, builder: &str) -> Result<StageName> {
    let stage: StageName = node.name().value().parse()?;
    if !stage.is_builder_stage() {
        return Err(ManifestError::InvalidConfig(format!(
            "{}: '{}' is not a builder stage",
            builder, stage
        )));
    }
    Ok(stage)
}

/// shell ノードをパース
pub fn parse_shell(node: &KdlNode) -> Result<ShellConfig> {
    let mut shell = ShellConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let stage = builder_stage(child, "shell")?;
            let entry = shell.stages.entry(stage).or_default();
            entry.commands.extend(string_args(child));
            if let Some(version) = string_property(child, "cache_version") {
                entry.cache_version = Some(version);
            }
        }
    }

    Ok(shell)
}

/// chef ノードをパース
pub fn parse_chef(node: &KdlNode) -> Result<ChefConfig> {
    let mut chef = ChefConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "cookbook_dir" => {
                    if let Some(dir) = first_string(child) {
                        chef.cookbook_dir = PathBuf::from(dir);
                    }
                }
                "recipe" => chef.recipes.extend(string_args(child)),
                "cookbook" => {
                    let name = first_string(child).ok_or_else(|| {
                        ManifestError::InvalidConfig("chef cookbook requires a name".to_string())
                    })?;
                    chef.cookbooks.push(CookbookDependency {
                        name: name.to_string(),
                        path: string_property(child, "path").map(PathBuf::from),
                        version: string_property(child, "version"),
                    });
                }
                "attributes" => chef.attributes = node_to_json_map(child),
                other => {
                    if let Some(stage_name) = other.strip_suffix("_attributes") {
                        let stage: StageName = stage_name.parse()?;
                        if !stage.is_builder_stage() {
                            return Err(ManifestError::InvalidConfig(format!(
                                "chef: '{}' is not a builder stage",
                                stage
                            )));
                        }
                        chef.stage_attributes
                            .insert(stage, node_to_json_map(child));
                    }
                }
            }
        }
    }

    Ok(chef)
}

/// ansible ノードをパース
pub fn parse_ansible(node: &KdlNode) -> Result<AnsibleConfig> {
    let mut ansible = AnsibleConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "dir" {
                ansible.dir = first_string(child).map(PathBuf::from);
                continue;
            }

            let stage = builder_stage(child, "ansible")?;
            let tasks = ansible.stages.entry(stage).or_default();
            if let Some(task_nodes) = child.children() {
                for task_node in task_nodes.nodes() {
                    if task_node.name().value() != "task" {
                        continue;
                    }
                    let args = string_args(task_node);
                    let module = args.first().cloned().ok_or_else(|| {
                        ManifestError::InvalidConfig("ansible task requires a module".to_string())
                    })?;
                    tasks.push(AnsibleTask {
                        module,
                        free_form: args.get(1).cloned(),
                        args: string_properties(task_node).into_iter().collect(),
                    });
                }
            }
        }
    }

    Ok(ansible)
}

/// 子ノードをJSONオブジェクトに変換
///
/// - 子ノードを持つノード → オブジェクト
/// - 引数1つ → 値、複数 → 配列
fn node_to_json_map(node: &KdlNode) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            let value = if child.children().is_some() {
                serde_json::Value::Object(node_to_json_map(child))
            } else {
                let values: Vec<_> = child
                    .entries()
                    .iter()
                    .filter(|e| e.name().is_none())
                    .map(|e| kdl_value_to_json(e.value()))
                    .collect();
                match values.len() {
                    0 => property(child, "value")
                        .map(kdl_value_to_json)
                        .unwrap_or(serde_json::Value::Null),
                    1 => values.into_iter().next().unwrap_or(serde_json::Value::Null),
                    _ => serde_json::Value::Array(values),
                }
            };
            map.insert(key, value);
        }
    }
    map
}

fn kdl_value_to_json(value: &KdlValue) -> serde_json::Value {
    if let Some(s) = value.as_string() {
        serde_json::Value::String(s.to_string())
    } else if let Some(i) = value.as_integer() {
        i64::try_from(i)
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::String(i.to_string()))
    } else if let Some(b) = value.as_bool() {
        serde_json::Value::Bool(b)
    } else if let Some(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    } else {
        serde_json::Value::Null
    }
}
