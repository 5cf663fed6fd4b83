use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use redleaf_storage::{
    DryRunMailer, HttpClientConfig, HttpFetcher, Mailer, PgStore, ResendMailer,
};
use redleaf_sync::{SyncConfig, SyncPipeline};
use redleaf_web::{AppState, WebConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "redleaf-cli")]
#[command(about = "RedLeaf draw tracker: scrape, reconcile and alert")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass over every enabled source.
    Sync {
        /// Mark every draw found as already announced instead of emailing it.
        /// Use once against an empty database.
        #[arg(long)]
        bootstrap: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the HTTP routes, plus the cron jobs when enabled.
    Serve,
}

fn database_url() -> Result<String> {
    std::env::var("DATABASE_URL").context("DATABASE_URL must be set")
}

fn build_mailer(config: &SyncConfig) -> Result<Arc<dyn Mailer>> {
    match &config.resend_api_key {
        Some(key) => Ok(Arc::new(ResendMailer::new(
            key.clone(),
            config.email_from.clone(),
            Duration::from_secs(config.http_timeout_secs),
        )?)),
        None => {
            warn!("RESEND_API_KEY not set; alerts are logged, not sent");
            Ok(Arc::new(DryRunMailer))
        }
    }
}

async fn build_pipeline(config: SyncConfig) -> Result<SyncPipeline> {
    let store = Arc::new(PgStore::connect(&database_url()?).await?);
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let mailer = build_mailer(&config)?;
    Ok(SyncPipeline::new(
        config,
        Arc::new(fetcher),
        store.clone(),
        store.clone(),
        mailer,
    )
    .with_notices(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Loads `.env` first so RUST_LOG from it reaches the filter.
    let config = SyncConfig::from_env().context("loading configuration")?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,redleaf_sync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command.unwrap_or(Commands::Sync { bootstrap: false }) {
        Commands::Sync { bootstrap } => {
            let pipeline = build_pipeline(config).await?;
            let report = if bootstrap {
                pipeline.bootstrap().await?
            } else {
                pipeline.run_once().await?
            };
            println!(
                "sync complete: run_id={} inserted={} updated={} unchanged={} skipped={} emailed={} email_failed={} notified={}",
                report.run_id,
                report.totals.inserted,
                report.totals.updated,
                report.totals.unchanged,
                report.totals.skipped,
                report.totals.emailed,
                report.totals.email_failed,
                report.totals.notified,
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&database_url()?).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let web = WebConfig::from_env()?;
            let pipeline = Arc::new(build_pipeline(config).await?);
            let scheduler = pipeline.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(
                    sync_cron = %pipeline.config().sync_cron,
                    notices_cron = %pipeline.config().notices_cron,
                    "scheduled jobs enabled"
                );
            }
            redleaf_web::serve(AppState::new(pipeline), &web).await?;
        }
    }

    Ok(())
}
