use crate::utils;
use colored::Colorize;
use layerflow_core::StageName;
use std::path::Path;

/// ステージごとのシグネチャとイメージの有無
pub async fn handle_stages(config: Option<&Path>, target: Option<&str>) -> anyhow::Result<()> {
    let conveyor = utils::open_conveyor(config, false).await?;
    let target = conveyor.target(target).await?;

    println!("ターゲット: {}", target.name().cyan());
    println!(
        "{:<26} {:<14} {}",
        "STAGE".bold(),
        "SIGNATURE".bold(),
        "STATUS".bold()
    );
    for status in target.stages().await? {
        let state = if status.empty {
            "empty".dimmed().to_string()
        } else if let Some(image) = &status.image {
            let created = image
                .created_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            format!("{} {}", "built".green(), created.dimmed())
        } else {
            "missing".yellow().to_string()
        };
        println!(
            "{:<26} {:<14} {}",
            status.name.as_str(),
            utils::short(&status.signature),
            state
        );
    }
    Ok(())
}

pub async fn handle_signature(
    config: Option<&Path>,
    target: Option<&str>,
    stage: Option<&str>,
) -> anyhow::Result<()> {
    let conveyor = utils::open_conveyor(config, false).await?;
    let target = conveyor.target(target).await?;

    let signature = match stage {
        Some(stage) => {
            let stage: StageName = stage.parse()?;
            target
                .stage_signature(stage)
                .ok_or_else(|| anyhow::anyhow!("ステージ '{}' がありません", stage))?
                .to_string()
        }
        None => target.signature().to_string(),
    };
    println!("{}", signature);
    Ok(())
}
