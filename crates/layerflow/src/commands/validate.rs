use crate::utils;
use colored::Colorize;
use std::path::Path;

pub fn handle(config: Option<&Path>) -> anyhow::Result<()> {
    println!("{}", "マニフェストを検証中...".blue());

    let (path, manifest) = match utils::load_manifest(config) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!();
            eprintln!("{}", "✗ マニフェストエラー".red().bold());
            eprintln!("  {}", e);
            return Err(e);
        }
    };

    println!("マニフェスト: {}", path.display().to_string().cyan());
    println!("{}", "✓ マニフェストは正常です！".green().bold());
    println!();
    println!("サマリー:");
    println!("  プロジェクト: {}", manifest.project.cyan());
    println!("  イメージ: {}個", manifest.images.len());
    for image in &manifest.images {
        println!(
            "    - {} (from: {}, builder: {})",
            image.display_name().cyan(),
            image.from,
            image.builder.kind_name()
        );
    }
    if !manifest.artifacts.is_empty() {
        println!("  アーティファクト: {}個", manifest.artifacts.len());
        for (name, artifact) in &manifest.artifacts {
            println!("    - {} (from: {})", name.cyan(), artifact.from);
        }
    }

    Ok(())
}
