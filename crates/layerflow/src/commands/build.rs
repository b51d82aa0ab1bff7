use crate::utils;
use colored::Colorize;
use layerflow_build::BuildProgress;
use std::io::IsTerminal;
use std::path::Path;

pub async fn handle(
    config: Option<&Path>,
    targets: &[String],
    introspect_error: bool,
) -> anyhow::Result<()> {
    let conveyor = utils::open_conveyor(config, introspect_error).await?;
    let project = conveyor.context().project().to_string();

    println!("{}", "イメージをビルド中...".green());
    println!("プロジェクト: {}", project.cyan());

    let label = if targets.is_empty() {
        project.clone()
    } else {
        targets.join(", ")
    };
    let progress = if std::io::stderr().is_terminal() {
        BuildProgress::new(&label)
    } else {
        BuildProgress::hidden()
    };

    let outcomes = match conveyor.build(targets).await {
        Ok(outcomes) => outcomes,
        Err(e) => {
            progress.finish_error(&e.to_string());
            return Err(e.into());
        }
    };

    let built: usize = outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok())
        .map(|summary| summary.built.len())
        .sum();
    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    if failed == 0 {
        progress.finish_success(built);
    } else {
        progress.finish_error(&format!("{} target(s) failed", failed));
    }

    println!();
    for outcome in &outcomes {
        match &outcome.result {
            Ok(summary) => {
                let status = if summary.is_cached() {
                    "cached".dimmed().to_string()
                } else {
                    format!("built {} stage(s)", summary.built.len())
                };
                println!(
                    "{} {} {} ({})",
                    "✓".green().bold(),
                    summary.target.bold(),
                    summary.image_name.cyan(),
                    status
                );
            }
            Err(e) => utils::print_error(&outcome.target, e),
        }
    }

    if failed > 0 {
        anyhow::bail!("{}個のターゲットのビルドに失敗しました", failed);
    }
    Ok(())
}
