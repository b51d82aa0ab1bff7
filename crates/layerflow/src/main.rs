mod commands;
mod utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "layerflow")]
#[command(about = "ステージごとにキャッシュするイメージビルダー", long_about = None)]
struct Cli {
    /// マニフェストのパス（省略時はカレントディレクトリから探す）
    #[arg(long, global = true, env = "LAYERFLOW_CONFIG_PATH")]
    config: Option<PathBuf>,
    /// デバッグログを表示
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// イメージをビルド
    Build {
        /// ターゲット名（省略時はすべてのイメージ）
        targets: Vec<String>,
        /// 失敗したビルドコンテナを残す
        #[arg(long)]
        introspect_error: bool,
    },
    /// ステージの一覧と状態を表示
    Stages {
        /// ターゲット名（無名イメージは省略）
        target: Option<String>,
    },
    /// シグネチャを表示
    Signature {
        target: Option<String>,
        /// ステージ名（省略時は最終ステージ）
        #[arg(long)]
        stage: Option<String>,
    },
    /// 最終イメージに名前を付ける
    Tag {
        /// ターゲット名（無名イメージは `-`）
        target: String,
        /// 付ける名前（repo[:tag]）
        name: String,
    },
    /// 最終イメージをレジストリに送る
    Export {
        /// 送り先のリポジトリ
        repo: String,
        targets: Vec<String>,
        /// タグ（複数指定可）
        #[arg(long = "tag", default_value = "latest")]
        tags: Vec<String>,
        /// 名前の書式（%{repo} %{dimg_name} %{tag}）
        #[arg(long)]
        format: Option<String>,
        /// ステージイメージも送る
        #[arg(long)]
        with_stages: bool,
    },
    /// イメージを取り込んで名前を付ける
    Import {
        source: String,
        name: String,
    },
    /// レジストリのステージイメージを取り込む
    #[command(name = "import-stages")]
    ImportStages {
        repo: String,
        targets: Vec<String>,
        /// 見つかったすべてのステージを取り込む
        #[arg(long)]
        all: bool,
    },
    /// ローカルのイメージを掃除
    Gc {
        /// 残ったビルドコンテナを削除
        #[arg(long)]
        containers: bool,
        /// タグのないイメージ
        #[arg(long)]
        dangling: bool,
        /// キャッシュバージョンが古いイメージ
        #[arg(long)]
        cache_version: bool,
        /// どのイメージからも使われないステージ
        #[arg(long)]
        orphans: bool,
        /// コミットが消えたステージ
        #[arg(long)]
        git_commits: bool,
        /// このリポジトリのタグも使用中とみなす
        #[arg(long)]
        repo: Option<String>,
        /// 削除せずに表示だけする
        #[arg(long)]
        dry_run: bool,
        /// エラーがあれば失敗にする
        #[arg(long)]
        strict: bool,
    },
    /// レジストリのステージタグを掃除
    #[command(name = "cleanup-repo")]
    CleanupRepo {
        repo: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// マニフェストを検証
    Validate,
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Version => {
            println!("layerflow {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Validate => {
            commands::validate::handle(config)?;
        }
        Commands::Build {
            targets,
            introspect_error,
        } => {
            commands::build::handle(config, &targets, introspect_error).await?;
        }
        Commands::Stages { target } => {
            commands::stages::handle_stages(config, target.as_deref()).await?;
        }
        Commands::Signature { target, stage } => {
            commands::stages::handle_signature(config, target.as_deref(), stage.as_deref())
                .await?;
        }
        Commands::Tag { target, name } => {
            commands::images::handle_tag(config, &target, &name).await?;
        }
        Commands::Export {
            repo,
            targets,
            tags,
            format,
            with_stages,
        } => {
            commands::images::handle_export(
                config,
                &repo,
                &targets,
                &tags,
                format.as_deref(),
                with_stages,
            )
            .await?;
        }
        Commands::Import { source, name } => {
            commands::images::handle_import(config, &source, &name).await?;
        }
        Commands::ImportStages {
            repo,
            targets,
            all,
        } => {
            commands::images::handle_import_stages(config, &repo, &targets, all).await?;
        }
        Commands::Gc {
            containers,
            dangling,
            cache_version,
            orphans,
            git_commits,
            repo,
            dry_run,
            strict,
        } => {
            let any = containers || dangling || cache_version || orphans || git_commits;
            // 何も指定しなければコミット以外のすべて
            let policy = layerflow_build::GcPolicy {
                flush_containers: containers || !any,
                dangling: dangling || !any,
                cache_version: cache_version || !any,
                orphan_stages: orphans || !any,
                git_commits,
                registry_repo: repo,
                dry_run,
                strict,
            };
            commands::gc::handle_gc(config, policy).await?;
        }
        Commands::CleanupRepo { repo, dry_run } => {
            commands::gc::handle_cleanup_repo(config, &repo, dry_run).await?;
        }
    }

    Ok(())
}
