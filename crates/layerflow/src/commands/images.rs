use crate::utils;
use colored::Colorize;
use layerflow_build::ImageLifecycleManager;
use std::path::Path;

pub async fn handle_tag(config: Option<&Path>, target: &str, name: &str) -> anyhow::Result<()> {
    let conveyor = utils::open_conveyor(config, false).await?;
    let target = conveyor.target(utils::target_name(target)).await?;
    target.tag(name).await?;
    println!("{} {} -> {}", "✓".green().bold(), target.name().bold(), name.cyan());
    Ok(())
}

/// ターゲットごとにエクスポート（失敗しても他のターゲットは続行）
pub async fn handle_export(
    config: Option<&Path>,
    repo: &str,
    targets: &[String],
    tags: &[String],
    format: Option<&str>,
    with_stages: bool,
) -> anyhow::Result<()> {
    let conveyor = utils::open_conveyor(config, false).await?;
    let plans = conveyor.plan(targets).await?;
    let lifecycle = ImageLifecycleManager::new(conveyor.context());

    let mut failed = 0;
    for plan in &plans {
        match lifecycle.export(plan, repo, tags, format, with_stages).await {
            Ok(names) => {
                for name in names {
                    println!("{} {} -> {}", "✓".green().bold(), plan.name().bold(), name.cyan());
                }
            }
            Err(e) => {
                utils::print_error(plan.name(), &e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{}個のターゲットのエクスポートに失敗しました", failed);
    }
    Ok(())
}

pub async fn handle_import(config: Option<&Path>, source: &str, name: &str) -> anyhow::Result<()> {
    let conveyor = utils::open_conveyor(config, false).await?;
    let metadata = ImageLifecycleManager::new(conveyor.context())
        .import(source, name)
        .await?;
    println!(
        "{} {} -> {} ({})",
        "✓".green().bold(),
        source,
        name.cyan(),
        utils::short(&metadata.id)
    );
    Ok(())
}

pub async fn handle_import_stages(
    config: Option<&Path>,
    repo: &str,
    targets: &[String],
    all: bool,
) -> anyhow::Result<()> {
    let conveyor = utils::open_conveyor(config, false).await?;
    let plans = conveyor.plan(targets).await?;
    let lifecycle = ImageLifecycleManager::new(conveyor.context());

    for plan in &plans {
        let imported = lifecycle.import_stages(plan, repo, all).await?;
        if imported.is_empty() {
            println!("{} {} (no stages imported)", "-".dimmed(), plan.name().bold());
            continue;
        }
        for stage in imported {
            println!("{} {} {}", "✓".green().bold(), plan.name().bold(), stage);
        }
    }
    Ok(())
}
