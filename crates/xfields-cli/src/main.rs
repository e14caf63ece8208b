use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use xfields_core::ContactId;
use xfields_sync::{
    preview_contact, report_runs_markdown, reports_dir_from_env, SyncConfig, SyncPipeline,
};

#[derive(Debug, Parser)]
#[command(name = "xfields-cli")]
#[command(about = "Enrich warehouse contacts with CRM extra fields")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental enrichment pass.
    Sync,
    /// Fetch and transform a single contact without writing to the warehouse.
    Preview { vanid: ContactId },
    /// Run syncs on `SYNC_CRON` until interrupted.
    Schedule,
    /// Summarize recent runs from the local reports directory.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = xfields_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} selected={} new_rows={} errors={} reports={}",
                summary.run_id,
                summary.selected,
                summary.new_rows,
                summary.errors,
                summary.reports_dir.as_deref().unwrap_or("not written")
            );
        }
        Commands::Preview { vanid } => {
            let config = SyncConfig::from_env()?;
            let row = preview_contact(&config, vanid).await?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env()?;
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let pipeline = std::sync::Arc::new(SyncPipeline::connect(config).await?);
            let mut sched = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!("{}", report_runs_markdown(runs, &reports_dir_from_env())?);
        }
    }

    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
