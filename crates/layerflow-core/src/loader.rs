//! マニフェストローダー
//!
//! ファイル読み込み、パース、検証を統合

use crate::error::Result;
use crate::model::Manifest;
use crate::parser::parse_kdl_file;
use crate::validation::validate_manifest;
use std::path::Path;
use tracing::{debug, info, instrument};

/// マニフェストを読み込んで検証
///
/// 検証エラーは最初の1件だけを返します。ターゲット単位で続行したい場合は
/// [`load_manifest_unchecked`] と [`crate::validate_target`] を使います。
#[instrument(skip(path), fields(path = %path.as_ref().display()))]
pub fn load_manifest<P: AsRef<Path>>(path: P) -> Result<Manifest> {
    let manifest = load_manifest_unchecked(path)?;
    debug!("Validating manifest");
    validate_manifest(&manifest)?;
    Ok(manifest)
}

/// マニフェストを読み込む（検証なし）
#[instrument(skip(path), fields(path = %path.as_ref().display()))]
pub fn load_manifest_unchecked<P: AsRef<Path>>(path: P) -> Result<Manifest> {
    debug!("Parsing KDL");
    let manifest = parse_kdl_file(path)?;
    info!(
        project = %manifest.project,
        images = manifest.images.len(),
        artifacts = manifest.artifacts.len(),
        "Manifest loaded"
    );
    Ok(manifest)
}
