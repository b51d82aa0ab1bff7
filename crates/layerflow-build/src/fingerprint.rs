//! ファイルツリーのフィンガープリント
//!
//! glob に一致するファイルの相対パスと内容からチェックサムを作ります。
//! 列挙順に依存しないよう必ずソートし、絶対パスは含めません。

use crate::error::{BuildError, Result};
use crate::hasher::{hashsum, sha256_hex};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// ルートディレクトリ配下のファイル集合
#[derive(Debug, Clone)]
pub struct SourceTreeFingerprint {
    root: PathBuf,
}

impl SourceTreeFingerprint {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// パターンに一致するファイル（ルートからの相対パス、ソート済み）
    ///
    /// ディレクトリに一致した場合はその配下のファイルすべてを含めます。
    pub fn matching_files(&self, patterns: &[String]) -> Result<Vec<PathBuf>> {
        let escaped_root = glob::Pattern::escape(&self.root.to_string_lossy());
        let mut files = BTreeSet::new();

        for pattern in patterns {
            let full = format!("{}/{}", escaped_root, pattern.trim_start_matches('/'));
            let entries = glob::glob(&full).map_err(|e| {
                BuildError::SignatureInputUnavailable(format!(
                    "invalid glob pattern '{}': {}",
                    pattern, e
                ))
            })?;

            for entry in entries {
                let path = entry.map_err(|e| {
                    let path = e.path().to_path_buf();
                    BuildError::file(path, std::io::Error::from(e))
                })?;
                if path.is_dir() {
                    collect_dir(&path, &mut files)?;
                } else if path.is_file() {
                    files.insert(path);
                }
            }
        }

        files
            .into_iter()
            .map(|path| {
                path.strip_prefix(&self.root)
                    .map(Path::to_path_buf)
                    .map_err(|_| {
                        BuildError::SignatureInputUnavailable(format!(
                            "{} is outside of {}",
                            path.display(),
                            self.root.display()
                        ))
                    })
            })
            .collect()
    }

    /// 一致したファイルのチェックサム（1つもなければ `None`）
    pub fn checksum(&self, patterns: &[String]) -> Result<Option<String>> {
        let files = self.matching_files(patterns)?;
        if files.is_empty() {
            return Ok(None);
        }
        files_checksum(&self.root, "", &files).map(Some)
    }
}

/// 相対パスと内容のハッシュを並べたチェックサム
///
/// `prefix` は相対パスの前に付ける名前（クックブック名など）。
pub fn files_checksum(root: &Path, prefix: &str, files: &[PathBuf]) -> Result<String> {
    let mut sorted: Vec<&PathBuf> = files.iter().collect();
    sorted.sort_by_key(|p| normalized(p));

    let mut inputs = Vec::with_capacity(sorted.len() * 2);
    for rel in sorted {
        let path = root.join(rel);
        let content = std::fs::read(&path).map_err(|e| BuildError::file(&path, e))?;
        let name = if prefix.is_empty() {
            normalized(rel)
        } else {
            format!("{}/{}", prefix, normalized(rel))
        };
        inputs.push(name);
        inputs.push(sha256_hex(&content));
    }
    Ok(hashsum(inputs))
}

/// ディレクトリ配下のファイルを再帰的に集める（`.git` は除く）
pub(crate) fn collect_dir(dir: &Path, out: &mut BTreeSet<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| BuildError::file(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| BuildError::file(dir, e))?.path();
        if path.is_dir() {
            if path.file_name().and_then(|s| s.to_str()) == Some(".git") {
                continue;
            }
            collect_dir(&path, out)?;
        } else if path.is_file() {
            out.insert(path);
        }
    }
    Ok(())
}

fn normalized(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
