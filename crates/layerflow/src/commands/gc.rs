use crate::utils;
use colored::Colorize;
use layerflow_build::lifecycle::target_repositories;
use layerflow_build::{GcPolicy, GcReport, ImageLifecycleManager, Registry, RegistryClient};
use layerflow_container::RegistryAuth;
use std::path::Path;

pub async fn handle_gc(config: Option<&Path>, policy: GcPolicy) -> anyhow::Result<()> {
    let conveyor = utils::open_conveyor(config, false).await?;
    let registry = match &policy.registry_repo {
        Some(_) => Some(RegistryClient::new(RegistryAuth::new())?),
        None => None,
    };

    let report = ImageLifecycleManager::new(conveyor.context())
        .gc(&policy, registry.as_ref().map(|r| r as &dyn Registry))
        .await?;
    print_report(&report);
    Ok(())
}

pub async fn handle_cleanup_repo(
    config: Option<&Path>,
    repo: &str,
    dry_run: bool,
) -> anyhow::Result<()> {
    let conveyor = utils::open_conveyor(config, false).await?;
    let names: Vec<Option<String>> = conveyor
        .context()
        .manifest()
        .images
        .iter()
        .map(|image| image.name.clone())
        .collect();
    let registry = RegistryClient::new(RegistryAuth::new())?;

    let report = ImageLifecycleManager::new(conveyor.context())
        .cleanup_repo(repo, &target_repositories(repo, &names), &registry, dry_run)
        .await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &GcReport) {
    let verb = if report.dry_run { "would remove" } else { "removed" };
    for container in &report.removed_containers {
        println!("{} container {}", verb.yellow(), utils::short(container));
    }
    for image in &report.removed {
        println!("{} {}", verb.yellow(), image);
    }
    for (image, reason) in &report.skipped {
        println!("{} {} ({})", "skipped".dimmed(), image, reason);
    }
    for error in &report.errors {
        eprintln!("{} {}", "error".red().bold(), error);
    }
    println!(
        "{}: {} removed, {} skipped, {} errors",
        "GC".bold(),
        report.removed.len() + report.removed_containers.len(),
        report.skipped.len(),
        report.errors.len()
    );
}
