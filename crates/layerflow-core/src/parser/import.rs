//! import ノードのパース

use super::{first_string, string_args, string_property};
use crate::error::{ManifestError, Result};
use crate::model::{ArtifactAnchor, ArtifactImport};
use kdl::KdlNode;

/// import ノードをパース
///
/// `import "assets" before="setup" { add "/build" to="/app/public" }`
pub fn parse_import(node: &KdlNode, target: &str) -> Result<ArtifactImport> {
    let artifact = first_string(node)
        .ok_or_else(|| ManifestError::InvalidConfig("import requires an artifact name".to_string()))?
        .to_string();

    let anchor = match (string_property(node, "before"), string_property(node, "after")) {
        (Some(stage), None) => ArtifactAnchor::parse("before", &stage),
        (None, Some(stage)) => ArtifactAnchor::parse("after", &stage),
        _ => None,
    }
    .ok_or_else(|| ManifestError::MissingAnchor {
        target: target.to_string(),
        artifact: artifact.clone(),
    })?;

    let mut import = ArtifactImport::new(artifact, "/", anchor);
    let mut to: Option<String> = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "add" => {
                    if let Some(add) = first_string(child) {
                        import.add = add.to_string();
                    }
                    if let Some(dest) = string_property(child, "to") {
                        to = Some(dest);
                    }
                }
                "to" => to = first_string(child).map(str::to_string),
                "include" => import.include_paths.extend(string_args(child)),
                "exclude" => import.exclude_paths.extend(string_args(child)),
                "owner" => import.owner = first_string(child).map(str::to_string),
                "group" => import.group = first_string(child).map(str::to_string),
                _ => {}
            }
        }
    }

    import.to = to.unwrap_or_else(|| import.add.clone());
    if !import.add.starts_with('/') || !import.to.starts_with('/') {
        return Err(ManifestError::InvalidConfig(format!(
            "import '{}' in '{}' requires absolute add/to paths",
            import.artifact, target
        )));
    }

    Ok(import)
}
