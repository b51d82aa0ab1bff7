//! layerflow の設定
//!
//! マニフェストの発見とユーザー設定 (`settings.yaml`) の読み込みを行います。

pub mod error;
pub mod settings;

pub use error::*;
pub use settings::{DEFAULT_LARGE_PATCH_THRESHOLD, Settings};

use std::path::PathBuf;

/// マニフェストの候補ファイル名（優先順）
pub const MANIFEST_CANDIDATES: [&str; 4] = [
    "layerflow.local.kdl",
    ".layerflow.local.kdl",
    "layerflow.kdl",
    ".layerflow.kdl",
];

/// layerflow の設定ディレクトリ（`<config_dir>/layerflow`、作成はしない）
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("layerflow"))
}

/// プロジェクトのマニフェストを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 LAYERFLOW_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: layerflow.local.kdl, .layerflow.local.kdl, layerflow.kdl, .layerflow.kdl
/// 3. ./.layerflow/ ディレクトリ内: 同様の順序
pub fn find_manifest_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var("LAYERFLOW_CONFIG_PATH") {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;

    for filename in &MANIFEST_CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let layerflow_dir = current_dir.join(".layerflow");
    if layerflow_dir.is_dir() {
        for filename in &MANIFEST_CANDIDATES {
            let path = layerflow_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    Err(ConfigError::ManifestNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn in_dir<T>(dir: &std::path::Path, f: impl FnOnce() -> T) -> T {
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir).unwrap();
        let result = f();
        std::env::set_current_dir(original_dir).unwrap();
        result
    }

    #[test]
    #[serial]
    fn test_get_config_dir() {
        let home = tempfile::tempdir().unwrap();
        temp_env::with_var("XDG_CONFIG_HOME", Some(home.path()), || {
            let config_dir = get_config_dir().unwrap();
            assert_eq!(config_dir, home.path().join("layerflow"));
        });
    }

    #[test]
    #[serial]
    fn test_find_manifest_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("layerflow.kdl"), "// test").unwrap();

        let result = temp_env::with_var_unset("LAYERFLOW_CONFIG_PATH", || {
            in_dir(temp_dir.path(), find_manifest_file)
        });
        assert!(result.unwrap().ends_with("layerflow.kdl"));
    }

    #[test]
    #[serial]
    fn test_find_manifest_local_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("layerflow.kdl"), "// shared").unwrap();
        fs::write(temp_dir.path().join(".layerflow.local.kdl"), "// local").unwrap();

        let result = temp_env::with_var_unset("LAYERFLOW_CONFIG_PATH", || {
            in_dir(temp_dir.path(), find_manifest_file)
        });

        // .layerflow.local.kdl が優先される
        assert!(result.unwrap().ends_with(".layerflow.local.kdl"));
    }

    #[test]
    #[serial]
    fn test_find_manifest_in_layerflow_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().join(".layerflow");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("layerflow.kdl"), "// nested").unwrap();

        let result = temp_env::with_var_unset("LAYERFLOW_CONFIG_PATH", || {
            in_dir(temp_dir.path(), find_manifest_file)
        });
        assert!(result.unwrap().ends_with(".layerflow/layerflow.kdl"));
    }

    #[test]
    #[serial]
    fn test_find_manifest_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.kdl");
        fs::write(&config_path, "// custom").unwrap();

        let result = temp_env::with_var("LAYERFLOW_CONFIG_PATH", Some(&config_path), || {
            find_manifest_file()
        });
        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    #[serial]
    fn test_find_manifest_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();

        let result = temp_env::with_var_unset("LAYERFLOW_CONFIG_PATH", || {
            in_dir(temp_dir.path(), find_manifest_file)
        });
        assert!(matches!(result, Err(ConfigError::ManifestNotFound)));
    }
}
