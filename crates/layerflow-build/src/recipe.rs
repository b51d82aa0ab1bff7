//! chef クックブックと ansible プレイブック
//!
//! ローカル依存を含むファイル群のチェックサムと、コンテナに渡すための
//! 実体化（チェックサムごとに1回）を扱います。

use crate::error::{BuildError, Result};
use crate::fingerprint::{SourceTreeFingerprint, files_checksum};
use crate::hasher::hashsum;
use crate::lock::{LockManager, LockMode};
use layerflow_core::{AnsibleConfig, AnsibleTask, ChefConfig, ManifestError, StageName};
use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// チェックサム計算の版（形式を変えたら上げる）
const RECIPE_CACHE_VERSION: &str = "1";

pub const COOKBOOK_PATTERNS: [&str; 6] = [
    "attributes/**/*",
    "recipes/**/*",
    "files/**/*",
    "templates/**/*",
    "metadata.json",
    "metadata.rb",
];

pub const PLAYBOOK_PATTERNS: [&str; 5] = [
    "roles/**/*",
    "tasks/**/*",
    "files/**/*",
    "templates/**/*",
    "vars/**/*",
];

const COMPLETE_MARKER: &str = ".created_at";

static BERKS_COOKBOOK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*cookbook\s+['"]([^'"]+)['"](.*)$"#).expect("valid regex")
});
static BERKS_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:path:|:path\s*=>)\s*['"]([^'"]+)['"]"#).expect("valid regex")
});
static BERKS_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*,\s*['"]([^'"]+)['"]"#).expect("valid regex"));
static METADATA_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^\s*name\s+['"]([^'"]+)['"]"#).expect("valid regex"));

/// ローカルにあるクックブック（またはロール）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSource {
    pub name: String,
    pub path: PathBuf,
    /// 宣言されたままのパス（チェックサム用）
    pub declared: String,
}

/// Berksfile の1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerksEntry {
    pub name: String,
    pub path: Option<String>,
    pub version: Option<String>,
}

/// Berksfile から `cookbook` 行を取り出す
pub fn parse_berksfile(content: &str) -> Vec<BerksEntry> {
    BERKS_COOKBOOK
        .captures_iter(content)
        .map(|caps| {
            let rest = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            BerksEntry {
                name: caps[1].to_string(),
                path: BERKS_PATH.captures(rest).map(|c| c[1].to_string()),
                version: BERKS_VERSION.captures(rest).map(|c| c[1].to_string()),
            }
        })
        .collect()
}

/// クックブックの名前（metadata.rb / metadata.json、なければディレクトリ名）
fn cookbook_name(path: &Path) -> String {
    if let Ok(content) = std::fs::read_to_string(path.join("metadata.rb"))
        && let Some(caps) = METADATA_NAME.captures(&content)
    {
        return caps[1].to_string();
    }
    if let Ok(content) = std::fs::read_to_string(path.join("metadata.json"))
        && let Ok(json) = serde_json::from_str::<serde_json::Value>(&content)
        && let Some(name) = json.get("name").and_then(|n| n.as_str())
    {
        return name.to_string();
    }
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "cookbook".to_string())
}

fn patterns(list: &[&str]) -> Vec<String> {
    list.iter().map(|p| p.to_string()).collect()
}

/// 各ソースのファイルを相対パスでハッシュしたリスト
fn sources_checksum(sources: &[LocalSource], pattern_list: &[&str]) -> Result<Vec<String>> {
    let patterns = patterns(pattern_list);
    let mut sorted: Vec<&LocalSource> = sources.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    sorted
        .into_iter()
        .map(|source| {
            let files = SourceTreeFingerprint::new(&source.path).matching_files(&patterns)?;
            files_checksum(&source.path, &source.name, &files)
        })
        .collect()
}

/// チェックサムごとのディレクトリに実体化する
async fn materialize(
    sources: &[LocalSource],
    pattern_list: &[&str],
    dest: &Path,
    lock_name: &str,
    locks: &LockManager,
) -> Result<PathBuf> {
    let _guard = locks.acquire(lock_name, LockMode::Exclusive).await?;
    if dest.join(COMPLETE_MARKER).exists() {
        return Ok(dest.to_path_buf());
    }
    if dest.exists() {
        std::fs::remove_dir_all(dest).map_err(|e| BuildError::file(dest, e))?;
    }

    let patterns = patterns(pattern_list);
    for source in sources {
        let files = SourceTreeFingerprint::new(&source.path).matching_files(&patterns)?;
        for rel in files {
            let from = source.path.join(&rel);
            let to = dest.join(&source.name).join(&rel);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(|e| BuildError::file(parent, e))?;
            }
            std::fs::copy(&from, &to).map_err(|e| BuildError::file(&from, e))?;
        }
    }
    std::fs::create_dir_all(dest).map_err(|e| BuildError::file(dest, e))?;
    let marker = dest.join(COMPLETE_MARKER);
    std::fs::write(&marker, chrono::Utc::now().to_rfc3339())
        .map_err(|e| BuildError::file(&marker, e))?;
    tracing::debug!(path = %dest.display(), "Materialized recipe sources");
    Ok(dest.to_path_buf())
}

/// chef ビルダーのクックブック群
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChefRecipe {
    root: LocalSource,
    dependencies: Vec<LocalSource>,
    /// パスなしの依存（名前とバージョンのみ）
    remote: Vec<BerksEntry>,
    recipes: Vec<String>,
    checksum: String,
}

impl ChefRecipe {
    /// クックブックを読み込む（Berksfile がなければ [`ManifestError::MissingBuilderFile`]）
    pub fn load(manifest_root: &Path, target: &str, config: &ChefConfig) -> Result<Self> {
        let root_path = manifest_root.join(&config.cookbook_dir);
        let berksfile = root_path.join("Berksfile");
        if !berksfile.is_file() {
            return Err(ManifestError::MissingBuilderFile {
                target: target.to_string(),
                path: berksfile,
            }
            .into());
        }

        let root = LocalSource {
            name: cookbook_name(&root_path),
            declared: config.cookbook_dir.to_string_lossy().to_string(),
            path: root_path.clone(),
        };

        let mut dependencies = Vec::new();
        let mut remote = Vec::new();
        let mut visited = BTreeSet::new();
        visited.insert(canonical_cookbook(&root, &root_path)?);

        for cookbook in &config.cookbooks {
            match &cookbook.path {
                Some(path) => {
                    let source = LocalSource {
                        name: cookbook.name.clone(),
                        path: manifest_root.join(path),
                        declared: path.to_string_lossy().to_string(),
                    };
                    collect_local(source, &mut visited, &mut dependencies, &mut remote)?;
                }
                None => remote.push(BerksEntry {
                    name: cookbook.name.clone(),
                    path: None,
                    version: cookbook.version.clone(),
                }),
            }
        }
        walk_berksfile(&root_path, &mut visited, &mut dependencies, &mut remote)?;

        let mut recipe = Self {
            root,
            dependencies,
            remote,
            recipes: config.recipes.clone(),
            checksum: String::new(),
        };
        recipe.checksum = recipe.compute_checksum()?;
        Ok(recipe)
    }

    fn compute_checksum(&self) -> Result<String> {
        let sources: Vec<LocalSource> = self.cookbooks().cloned().collect();
        let files = sources_checksum(&sources, &COOKBOOK_PATTERNS)?;

        let mut dump: Vec<String> = self
            .dependencies
            .iter()
            .map(|d| format!("{} path={}", d.name, d.declared))
            .chain(self.remote.iter().map(|d| {
                format!(
                    "{} version={}",
                    d.name,
                    d.version.as_deref().unwrap_or("*")
                )
            }))
            .collect();
        dump.sort();

        Ok(hashsum([
            vec![RECIPE_CACHE_VERSION.to_string(), self.root.name.clone()],
            files,
            dump,
        ]))
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// ルートを先頭にしたローカルクックブック
    pub fn cookbooks(&self) -> impl Iterator<Item = &LocalSource> {
        std::iter::once(&self.root).chain(self.dependencies.iter())
    }

    /// ステージの runlist（`<cookbook>::<stage>/<recipe>`）
    pub fn runlist(&self, stage: StageName) -> Vec<String> {
        let mut runlist = Vec::new();
        for cookbook in self.cookbooks() {
            for recipe in &self.recipes {
                let entry = cookbook
                    .path
                    .join("recipes")
                    .join(stage.as_str())
                    .join(format!("{}.rb", recipe));
                if entry.is_file() {
                    runlist.push(format!("{}::{}/{}", cookbook.name, stage, recipe));
                }
            }
        }
        runlist
    }

    /// 共通属性にステージ固有の属性を重ねたもの
    pub fn stage_attributes(
        config: &ChefConfig,
        stage: StageName,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut attributes = config.attributes.clone();
        if let Some(overrides) = config.stage_attributes.get(&stage) {
            for (key, value) in overrides {
                attributes.insert(key.clone(), value.clone());
            }
        }
        attributes
    }

    pub async fn materialize(&self, build_dir: &Path, project: &str, locks: &LockManager) -> Result<PathBuf> {
        let sources: Vec<LocalSource> = self.cookbooks().cloned().collect();
        materialize(
            &sources,
            &COOKBOOK_PATTERNS,
            &build_dir.join("cookbooks").join(&self.checksum),
            &format!("{}.cookbooks.{}", project, self.checksum),
            locks,
        )
        .await
    }
}

fn collect_local(
    source: LocalSource,
    visited: &mut BTreeSet<PathBuf>,
    dependencies: &mut Vec<LocalSource>,
    remote: &mut Vec<BerksEntry>,
) -> Result<()> {
    // `../a/../b` のような表記違いでも同じクックブックとして扱う
    if !visited.insert(canonical_cookbook(&source, &source.path)?) {
        return Ok(());
    }
    if !source.path.is_dir() {
        return Err(cookbook_not_found(&source));
    }
    let path = source.path.clone();
    dependencies.push(source);
    walk_berksfile(&path, visited, dependencies, remote)
}

fn canonical_cookbook(source: &LocalSource, path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).map_err(|_| cookbook_not_found(source))
}

fn cookbook_not_found(source: &LocalSource) -> BuildError {
    BuildError::SignatureInputUnavailable(format!(
        "local cookbook '{}' not found at {}",
        source.name,
        source.path.display()
    ))
}

/// Berksfile の `path:` 依存をたどる
fn walk_berksfile(
    cookbook: &Path,
    visited: &mut BTreeSet<PathBuf>,
    dependencies: &mut Vec<LocalSource>,
    remote: &mut Vec<BerksEntry>,
) -> Result<()> {
    let berksfile = cookbook.join("Berksfile");
    let Ok(content) = std::fs::read_to_string(&berksfile) else {
        return Ok(());
    };
    for entry in parse_berksfile(&content) {
        match &entry.path {
            Some(path) => {
                let source = LocalSource {
                    name: entry.name.clone(),
                    path: cookbook.join(path),
                    declared: path.clone(),
                };
                collect_local(source, visited, dependencies, remote)?;
            }
            None => {
                if !remote.contains(&entry) {
                    remote.push(entry);
                }
            }
        }
    }
    Ok(())
}

/// ansible ビルダーのプレイブック素材
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnsiblePlaybook {
    dir: Option<LocalSource>,
    roles: Vec<LocalSource>,
    requirements: Vec<String>,
    checksum: Option<String>,
}

impl AnsiblePlaybook {
    /// `dir` が宣言されていて存在しなければ [`ManifestError::MissingBuilderFile`]
    pub fn load(manifest_root: &Path, target: &str, config: &AnsibleConfig) -> Result<Self> {
        let Some(dir) = &config.dir else {
            return Ok(Self {
                dir: None,
                roles: Vec::new(),
                requirements: Vec::new(),
                checksum: None,
            });
        };

        let path = manifest_root.join(dir);
        if !path.is_dir() {
            return Err(ManifestError::MissingBuilderFile {
                target: target.to_string(),
                path,
            }
            .into());
        }
        let root = LocalSource {
            name: "playbook".to_string(),
            declared: dir.to_string_lossy().to_string(),
            path: path.clone(),
        };

        let (roles, requirements) = read_requirements(&path)?;
        let mut playbook = Self {
            dir: Some(root),
            roles,
            requirements,
            checksum: None,
        };
        playbook.checksum = Some(playbook.compute_checksum()?);
        Ok(playbook)
    }

    fn compute_checksum(&self) -> Result<String> {
        let sources: Vec<LocalSource> = self.sources().cloned().collect();
        let files = sources_checksum(&sources, &PLAYBOOK_PATTERNS)?;
        let mut requirements = self.requirements.clone();
        requirements.sort();
        Ok(hashsum([
            vec![RECIPE_CACHE_VERSION.to_string()],
            files,
            requirements,
        ]))
    }

    fn sources(&self) -> impl Iterator<Item = &LocalSource> {
        self.dir.iter().chain(self.roles.iter())
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn has_material(&self) -> bool {
        self.dir.is_some()
    }

    pub async fn materialize(
        &self,
        build_dir: &Path,
        project: &str,
        locks: &LockManager,
    ) -> Result<Option<PathBuf>> {
        let Some(checksum) = &self.checksum else {
            return Ok(None);
        };
        let sources: Vec<LocalSource> = self.sources().cloned().collect();
        materialize(
            &sources,
            &PLAYBOOK_PATTERNS,
            &build_dir.join("playbooks").join(checksum),
            &format!("{}.cookbooks.{}", project, checksum),
            locks,
        )
        .await
        .map(Some)
    }
}

/// requirements.yml のローカルロールと依存一覧
fn read_requirements(dir: &Path) -> Result<(Vec<LocalSource>, Vec<String>)> {
    let path = dir.join("requirements.yml");
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Ok((Vec::new(), Vec::new()));
    };
    let value: Value = serde_yaml::from_str(&content).map_err(|e| {
        BuildError::SignatureInputUnavailable(format!("{}: {}", path.display(), e))
    })?;

    let entries = match &value {
        Value::Sequence(items) => items.clone(),
        Value::Mapping(map) => map
            .get("roles")
            .and_then(Value::as_sequence)
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    let mut roles = Vec::new();
    let mut dump = Vec::new();
    for entry in entries {
        let field = |key: &str| entry.get(key).and_then(Value::as_str).map(str::to_string);
        let Some(src) = field("src").or_else(|| field("name")) else {
            continue;
        };
        let name = field("name").unwrap_or_else(|| {
            src.trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or(&src)
                .to_string()
        });
        let local = dir.join(&src);
        if local.is_dir() {
            dump.push(format!("{} path={}", name, src));
            roles.push(LocalSource {
                name,
                path: local,
                declared: src,
            });
        } else {
            dump.push(format!(
                "{} src={} version={}",
                name,
                src,
                field("version").unwrap_or_else(|| "*".to_string())
            ));
        }
    }
    Ok((roles, dump))
}

/// タスク1つを ansible の YAML 値にする
pub fn task_value(task: &AnsibleTask) -> Value {
    let args: Mapping = task
        .args
        .iter()
        .map(|(k, v)| (Value::String(k.clone()), Value::String(v.clone())))
        .collect();

    let mut mapping = Mapping::new();
    match &task.free_form {
        Some(free_form) => {
            mapping.insert(
                Value::String(task.module.clone()),
                Value::String(free_form.clone()),
            );
            if !args.is_empty() {
                mapping.insert(Value::String("args".into()), Value::Mapping(args));
            }
        }
        None => {
            mapping.insert(Value::String(task.module.clone()), Value::Mapping(args));
        }
    }
    Value::Mapping(mapping)
}

/// シグネチャ用のタスクの YAML ダンプ
pub fn task_dumps(tasks: &[AnsibleTask]) -> Result<Vec<String>> {
    tasks
        .iter()
        .map(|task| {
            serde_yaml::to_string(&task_value(task))
                .map_err(|e| BuildError::SignatureInputUnavailable(e.to_string()))
        })
        .collect()
}

/// ステージ用のプレイブック
pub fn playbook_yaml(tasks: &[AnsibleTask]) -> Result<String> {
    let mut play = Mapping::new();
    play.insert("hosts".into(), "all".into());
    play.insert("connection".into(), "local".into());
    play.insert("gather_facts".into(), Value::Bool(false));
    play.insert(
        "tasks".into(),
        Value::Sequence(tasks.iter().map(task_value).collect()),
    );
    serde_yaml::to_string(&Value::Sequence(vec![Value::Mapping(play)]))
        .map_err(|e| BuildError::SignatureInputUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerflow_core::CookbookDependency;
    use std::collections::BTreeMap;
    use std::fs;
    use std::time::Duration;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn chef_project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join(".layerflow_chef/Berksfile"),
            "source 'https://supermarket.chef.io'\ncookbook 'apt', '~> 7.0'\ncookbook 'common', path: '../vendor/common'\n",
        );
        write(&root.join(".layerflow_chef/metadata.rb"), "name 'shop'\n");
        write(
            &root.join(".layerflow_chef/recipes/install/app.rb"),
            "package 'curl'",
        );
        write(&root.join(".layerflow_chef/README.md"), "ignored");
        write(&root.join("vendor/common/metadata.rb"), "name 'common'\n");
        write(&root.join("vendor/common/recipes/setup/app.rb"), "log 'hi'");
        dir
    }

    fn chef_config() -> ChefConfig {
        ChefConfig {
            recipes: vec!["app".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_berksfile() {
        let entries = parse_berksfile(
            "cookbook 'apt', '~> 7.0'\ncookbook \"nginx\", path: './nginx'\n  cookbook 'old', :path => '../old'\n",
        );
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].version.as_deref(), Some("~> 7.0"));
        assert_eq!(entries[1].path.as_deref(), Some("./nginx"));
        assert_eq!(entries[2].path.as_deref(), Some("../old"));
    }

    #[test]
    fn test_chef_recipe_walks_local_dependencies() {
        let dir = chef_project();
        let recipe = ChefRecipe::load(dir.path(), "app", &chef_config()).unwrap();

        let names: Vec<_> = recipe.cookbooks().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["shop", "common"]);
        assert_eq!(recipe.runlist(StageName::Install), vec!["shop::install/app"]);
        assert_eq!(recipe.runlist(StageName::Setup), vec!["common::setup/app"]);
        assert!(recipe.runlist(StageName::BeforeInstall).is_empty());
    }

    #[test]
    fn test_berksfile_path_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("chef/Berksfile"),
            "cookbook 'a', path: '../a'\n",
        );
        write(&root.join("chef/recipes/install/app.rb"), "package 'curl'");
        write(&root.join("a/Berksfile"), "cookbook 'b', path: '../b'\n");
        write(&root.join("a/metadata.rb"), "name 'a'\n");
        write(&root.join("b/Berksfile"), "cookbook 'a', path: '../a'\n");
        write(&root.join("b/metadata.rb"), "name 'b'\n");

        let config = ChefConfig {
            cookbook_dir: "chef".into(),
            ..chef_config()
        };
        let recipe = ChefRecipe::load(root, "app", &config).unwrap();
        let names: Vec<_> = recipe.cookbooks().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["chef", "a", "b"]);
    }

    #[test]
    fn test_missing_local_cookbook() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join(".layerflow_chef/Berksfile"),
            "cookbook 'gone', path: '../gone'\n",
        );
        let err = ChefRecipe::load(dir.path(), "app", &chef_config()).unwrap_err();
        assert!(
            matches!(err, BuildError::SignatureInputUnavailable(ref m) if m.contains("'gone'")),
            "{:?}",
            err
        );
    }

    #[test]
    fn test_chef_checksum_tracks_dependency_files_only() {
        let dir = chef_project();
        let first = ChefRecipe::load(dir.path(), "app", &chef_config())
            .unwrap()
            .checksum()
            .to_string();

        fs::write(dir.path().join(".layerflow_chef/README.md"), "changed").unwrap();
        let same = ChefRecipe::load(dir.path(), "app", &chef_config()).unwrap();
        assert_eq!(first, same.checksum());

        fs::write(dir.path().join("vendor/common/recipes/setup/app.rb"), "log 'bye'").unwrap();
        let changed = ChefRecipe::load(dir.path(), "app", &chef_config()).unwrap();
        assert_ne!(first, changed.checksum());
    }

    #[test]
    fn test_chef_checksum_is_host_independent() {
        let a = chef_project();
        let b = chef_project();
        assert_eq!(
            ChefRecipe::load(a.path(), "app", &chef_config()).unwrap().checksum(),
            ChefRecipe::load(b.path(), "app", &chef_config()).unwrap().checksum()
        );
    }

    #[test]
    fn test_chef_manifest_cookbooks_feed_checksum() {
        let dir = chef_project();
        let base = ChefRecipe::load(dir.path(), "app", &chef_config()).unwrap();
        let mut config = chef_config();
        config.cookbooks.push(CookbookDependency {
            name: "mysql".into(),
            path: None,
            version: Some("8.0".into()),
        });
        let with_mysql = ChefRecipe::load(dir.path(), "app", &config).unwrap();
        assert_ne!(base.checksum(), with_mysql.checksum());
    }

    #[test]
    fn test_missing_berksfile_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChefRecipe::load(dir.path(), "app", &chef_config()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Config(ManifestError::MissingBuilderFile { .. })
        ));
    }

    #[test]
    fn test_stage_attributes_override() {
        let mut config = chef_config();
        config.attributes.insert("env".into(), "prod".into());
        config.attributes.insert("debug".into(), "no".into());
        let mut install = serde_json::Map::new();
        install.insert("debug".into(), "yes".into());
        config.stage_attributes.insert(StageName::Install, install);

        let attrs = ChefRecipe::stage_attributes(&config, StageName::Install);
        assert_eq!(attrs["env"], "prod");
        assert_eq!(attrs["debug"], "yes");
        assert_eq!(ChefRecipe::stage_attributes(&config, StageName::Setup)["debug"], "no");
    }

    #[tokio::test]
    async fn test_materialize_once_per_checksum() {
        let dir = chef_project();
        let build = tempfile::tempdir().unwrap();
        let locks = LockManager::new(build.path(), Duration::from_secs(5));
        let recipe = ChefRecipe::load(dir.path(), "app", &chef_config()).unwrap();

        let path = recipe.materialize(build.path(), "shop", &locks).await.unwrap();
        assert!(path.ends_with(recipe.checksum()));
        assert!(path.join("shop/recipes/install/app.rb").is_file());
        assert!(path.join("common/metadata.rb").is_file());
        assert!(!path.join("shop/README.md").exists());

        let marker = fs::read_to_string(path.join(COMPLETE_MARKER)).unwrap();
        recipe.materialize(build.path(), "shop", &locks).await.unwrap();
        assert_eq!(marker, fs::read_to_string(path.join(COMPLETE_MARKER)).unwrap());
    }

    #[test]
    fn test_ansible_requirements_and_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join(".layerflow_ansible/requirements.yml"),
            "- src: ./local_roles/web\n  name: web\n- src: geerlingguy.nginx\n  version: 3.1.0\n",
        );
        write(&root.join(".layerflow_ansible/local_roles/web/tasks/main.yml"), "- debug: {}");
        write(&root.join(".layerflow_ansible/roles/db/tasks/main.yml"), "- ping: {}");

        let config = AnsibleConfig {
            dir: Some(PathBuf::from(".layerflow_ansible")),
            stages: BTreeMap::new(),
        };
        let playbook = AnsiblePlaybook::load(root, "app", &config).unwrap();
        let first = playbook.checksum().unwrap().to_string();
        assert_eq!(playbook.roles.len(), 1);
        assert_eq!(playbook.requirements.len(), 2);

        fs::write(
            root.join(".layerflow_ansible/local_roles/web/tasks/main.yml"),
            "- debug: {msg: hi}",
        )
        .unwrap();
        let changed = AnsiblePlaybook::load(root, "app", &config).unwrap();
        assert_ne!(first, changed.checksum().unwrap());
    }

    #[test]
    fn test_ansible_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnsibleConfig {
            dir: Some(PathBuf::from("missing")),
            stages: BTreeMap::new(),
        };
        assert!(matches!(
            AnsiblePlaybook::load(dir.path(), "app", &config),
            Err(BuildError::Config(ManifestError::MissingBuilderFile { .. }))
        ));

        let none = AnsiblePlaybook::load(dir.path(), "app", &AnsibleConfig::default()).unwrap();
        assert!(none.checksum().is_none());
        assert!(!none.has_material());
    }

    #[test]
    fn test_task_yaml() {
        let mut args = BTreeMap::new();
        args.insert("name".to_string(), "curl".to_string());
        args.insert("state".to_string(), "present".to_string());
        let apt = AnsibleTask {
            module: "apt".into(),
            args,
            free_form: None,
        };
        let shell = AnsibleTask {
            module: "shell".into(),
            args: BTreeMap::new(),
            free_form: Some("echo hi".into()),
        };

        let dumps = task_dumps(&[apt.clone(), shell.clone()]).unwrap();
        assert!(dumps[0].contains("apt:"));
        assert!(dumps[0].contains("name: curl"));
        assert_eq!(dumps[1].trim(), "shell: echo hi");

        let playbook = playbook_yaml(&[apt, shell]).unwrap();
        assert!(playbook.contains("hosts: all"));
        assert!(playbook.contains("gather_facts: false"));
    }
}
