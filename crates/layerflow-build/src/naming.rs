//! エクスポート名とタグの検証

use crate::error::{BuildError, Result};
use layerflow_container::split_reference;

/// `%{repo}/%{dimg_name}:%{tag}`（名前付きイメージ）
pub const NAMED_EXPORT_FORMAT: &str = "%{repo}/%{dimg_name}:%{tag}";
/// `%{repo}:%{tag}`（無名イメージ）
pub const UNNAMED_EXPORT_FORMAT: &str = "%{repo}:%{tag}";

/// タグの検証
///
/// Docker タグの制約:
/// - 128文字以下
/// - 英数字、ピリオド、ハイフン、アンダースコアのみ
/// - 先頭はピリオドまたはハイフンではない
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(BuildError::InvalidName("(empty tag)".to_string()));
    }
    if tag.len() > 128 {
        return Err(BuildError::InvalidName(format!(
            "tag too long ({} characters, max 128)",
            tag.len()
        )));
    }
    if tag.starts_with('.') || tag.starts_with('-') {
        return Err(BuildError::InvalidName(tag.to_string()));
    }
    if let Some(c) = tag
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '-' | '_'))
    {
        return Err(BuildError::InvalidName(format!(
            "invalid character '{}' in tag: {}",
            c, tag
        )));
    }
    Ok(())
}

/// `repo[:tag]` の検証（リポジトリは小文字のパス要素）
pub fn validate_reference(reference: &str) -> Result<()> {
    let (repo, tag) = split_reference(reference);
    if repo.is_empty() {
        return Err(BuildError::InvalidName(reference.to_string()));
    }
    let path = match repo.split_once('/') {
        // 先頭要素がホスト名（`.` か `:` を含む、または localhost）
        Some((host, rest)) if host.contains(['.', ':']) || host == "localhost" => rest,
        _ => repo,
    };
    let valid_component = |component: &str| {
        !component.is_empty()
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
            && component.starts_with(|c: char| c.is_ascii_alphanumeric())
    };
    if !path.split('/').all(valid_component) {
        return Err(BuildError::InvalidName(format!(
            "invalid repository name: {}",
            repo
        )));
    }
    validate_tag(tag)
}

/// エクスポート名を組み立てる
///
/// `format` を省略すると名前付きイメージは [`NAMED_EXPORT_FORMAT`]、
/// 無名イメージは [`UNNAMED_EXPORT_FORMAT`] を使います。
pub fn format_export_name(
    format: Option<&str>,
    repo: &str,
    dimg_name: Option<&str>,
    tag: &str,
) -> Result<String> {
    validate_tag(tag)?;
    let format = format.unwrap_or(match dimg_name {
        Some(_) => NAMED_EXPORT_FORMAT,
        None => UNNAMED_EXPORT_FORMAT,
    });
    if format.contains("%{dimg_name}") && dimg_name.is_none() {
        return Err(BuildError::InvalidName(format!(
            "format '{}' requires a named image",
            format
        )));
    }
    let name = format
        .replace("%{repo}", repo.trim_end_matches('/'))
        .replace("%{dimg_name}", dimg_name.unwrap_or_default())
        .replace("%{tag}", tag);
    validate_reference(&name)?;
    Ok(name)
}
