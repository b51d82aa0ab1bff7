//! ビルド1回分の共有状態
//!
//! マニフェスト、設定、ランタイム、イメージキャッシュ、コミット解決、ロックを
//! まとめて持ち、各ターゲットから参照されます。

use crate::cache::{ImageCacheResolver, RuntimeImageCache};
use crate::lock::LockManager;
use crate::vcs::{GitCli, GitCommitResolver, VersionControl};
use layerflow_config::Settings;
use layerflow_container::ContainerRuntime;
use layerflow_core::Manifest;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// ビルドの挙動を切り替えるオプション
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// 失敗したビルドコンテナを残す
    pub introspect_error: bool,
    /// ターゲットを並列にビルドする
    pub parallel: bool,
}

impl From<&Settings> for BuildOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            introspect_error: settings.introspect_error,
            parallel: settings.parallel,
        }
    }
}

pub struct BuildContext {
    manifest: Arc<Manifest>,
    settings: Settings,
    runtime: Arc<dyn ContainerRuntime>,
    images: ImageCacheResolver,
    git: GitCommitResolver,
    locks: LockManager,
    options: BuildOptions,
    build_dir: PathBuf,
}

impl BuildContext {
    /// git は `git` コマンドで扱う
    pub fn new(manifest: Manifest, settings: Settings, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::with_vcs(manifest, settings, runtime, Arc::new(GitCli::new()))
    }

    pub fn with_vcs(
        manifest: Manifest,
        settings: Settings,
        runtime: Arc<dyn ContainerRuntime>,
        vcs: Arc<dyn VersionControl>,
    ) -> Self {
        let build_dir = settings.project_build_dir(&manifest.project);
        let locks = LockManager::new(&build_dir, settings.lock_timeout());
        let git = GitCommitResolver::new(
            vcs,
            &manifest.project,
            &manifest.root,
            &build_dir,
            locks.clone(),
        );
        let images = ImageCacheResolver::new(runtime.clone(), Arc::new(RuntimeImageCache::new()));
        let options = BuildOptions::from(&settings);
        Self {
            manifest: Arc::new(manifest),
            settings,
            runtime,
            images,
            git,
            locks,
            options,
            build_dir,
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// イメージキャッシュを差し替える（複数のコンテキストで共有する場合）
    pub fn with_cache(mut self, cache: Arc<RuntimeImageCache>) -> Self {
        self.images = ImageCacheResolver::new(self.runtime.clone(), cache);
        self
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn project(&self) -> &str {
        &self.manifest.project
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn images(&self) -> &ImageCacheResolver {
        &self.images
    }

    pub fn git(&self) -> &GitCommitResolver {
        &self.git
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn options(&self) -> BuildOptions {
        self.options
    }

    /// `<build_dir>/<project>`
    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// 全ターゲットのビルド中に共有で持つロック名
    pub fn images_lock_name(&self) -> String {
        format!("{}.images", self.project())
    }
}
