use colored::Colorize;
use layerflow_build::{BuildContext, BuildError, BuildOptions, Conveyor};
use layerflow_config::Settings;
use layerflow_container::DockerRuntime;
use layerflow_core::Manifest;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// マニフェストを探して読み込む
pub fn load_manifest(config: Option<&Path>) -> anyhow::Result<(PathBuf, Manifest)> {
    let path = match config {
        Some(path) => path.to_path_buf(),
        None => layerflow_config::find_manifest_file()?,
    };
    let manifest = layerflow_core::load_manifest(&path)?;
    Ok((path, manifest))
}

/// Docker に接続してビルドの準備をする
pub async fn open_conveyor(config: Option<&Path>, introspect_error: bool) -> anyhow::Result<Conveyor> {
    let (_, manifest) = load_manifest(config)?;
    let settings = Settings::load()?.with_env()?;
    let runtime = DockerRuntime::connect().await?;

    let mut ctx = BuildContext::new(manifest, settings, Arc::new(runtime));
    if introspect_error {
        let options = BuildOptions {
            introspect_error: true,
            ..ctx.options()
        };
        ctx = ctx.with_options(options);
    }
    Ok(Conveyor::new(ctx))
}

/// `-` は無名イメージ
pub fn target_name(name: &str) -> Option<&str> {
    (name != "-").then_some(name)
}

/// シグネチャの先頭12文字
pub fn short(signature: &str) -> &str {
    signature.get(..12).unwrap_or(signature)
}

pub fn print_error(target: &str, error: &BuildError) {
    eprintln!("{} {}", "✗".red().bold(), target.bold());
    for line in error.user_message().lines() {
        eprintln!("  {}", line);
    }
}
