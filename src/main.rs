use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use channel_syncbot::remote::ChannelClient;
use channel_syncbot::{config, db, scheduler};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Run a single scheduling pass and exit
    #[arg(long)]
    once: bool,
    /// Recompute all binding data and re-evaluate all domains before syncing
    #[arg(long)]
    check_all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/syncbot.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    scheduler::apply_roster(&pool, &cfg.account_specs()).await?;
    if args.check_all {
        scheduler::check_all(&pool).await?;
    }

    let api = ChannelClient::new();
    let limit = cfg.app.row_limit;

    if args.once {
        let summary = scheduler::run_pass(&pool, &api, limit).await?;
        info!(?summary, "single pass finished");
        return Ok(());
    }

    info!("starting reconciliation loop");
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    loop {
        // A failed pass (typically a transient remote condition) is simply
        // retried on the next tick; per-binding outcomes were not touched.
        if let Err(err) = scheduler::run_pass(&pool, &api, limit).await {
            error!(?err, "scheduling pass failed; will retry");
        }
        tokio::time::sleep(poll_sleep).await;
    }
}
