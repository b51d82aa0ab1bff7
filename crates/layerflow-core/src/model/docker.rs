//! 最終イメージのディレクティブ

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `docker { ... }` ブロック
///
/// KDL形式：
/// ```kdl
/// docker {
///     expose "3000/tcp"
///     env RAILS_ENV="production"
///     workdir "/app"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerDirectives {
    pub expose: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub volumes: Vec<String>,
}

impl DockerDirectives {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Dockerfile 風の1行表現（シグネチャ入力とログ用、順序固定）
    pub fn instruction_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for port in &self.expose {
            lines.push(format!("EXPOSE {}", port));
        }
        for (key, value) in &self.env {
            lines.push(format!("ENV {}={}", key, value));
        }
        for (key, value) in &self.labels {
            lines.push(format!("LABEL {}={}", key, value));
        }
        if let Some(entrypoint) = &self.entrypoint {
            lines.push(format!("ENTRYPOINT {:?}", entrypoint));
        }
        if let Some(cmd) = &self.cmd {
            lines.push(format!("CMD {:?}", cmd));
        }
        if let Some(user) = &self.user {
            lines.push(format!("USER {}", user));
        }
        if let Some(workdir) = &self.workdir {
            lines.push(format!("WORKDIR {}", workdir));
        }
        for volume in &self.volumes {
            lines.push(format!("VOLUME {}", volume));
        }
        lines
    }
}
