//! docker ノードのパース

use super::{first_string, string_args, string_properties};
use crate::model::DockerDirectives;
use kdl::KdlNode;

/// docker ノードをパース
pub fn parse_docker(node: &KdlNode, docker: &mut DockerDirectives) {
    let Some(children) = node.children() else {
        return;
    };

    for child in children.nodes() {
        match child.name().value() {
            "expose" => docker.expose.extend(string_args(child)),
            // env と environment 両方をサポート
            "env" | "environment" => {
                docker.env.extend(string_properties(child));
                if let Some(envs) = child.children() {
                    for env_node in envs.nodes() {
                        let value = first_string(env_node).unwrap_or("").to_string();
                        docker
                            .env
                            .insert(env_node.name().value().to_string(), value);
                    }
                }
            }
            "label" | "labels" => {
                docker.labels.extend(string_properties(child));
                if let Some(labels) = child.children() {
                    for label_node in labels.nodes() {
                        let value = first_string(label_node).unwrap_or("").to_string();
                        docker
                            .labels
                            .insert(label_node.name().value().to_string(), value);
                    }
                }
            }
            "entrypoint" => docker.entrypoint = Some(string_args(child)),
            "cmd" => docker.cmd = Some(string_args(child)),
            "user" => docker.user = first_string(child).map(str::to_string),
            "workdir" => docker.workdir = first_string(child).map(str::to_string),
            "volume" | "volumes" => docker.volumes.extend(string_args(child)),
            _ => {}
        }
    }
}
