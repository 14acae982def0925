use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use rental_digest::config;
use rental_digest::db;
use rental_digest::mailer::PostmarkMailer;
use rental_digest::pipeline::Deps;
use rental_digest::scheduler::{self, RunLocks};
use rental_digest::shortlink::{ShortLinkClient, ShortLinker};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
        .unwrap_or_else(|_| format!("sqlite://{}/digest.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let mailer = PostmarkMailer::new(
        &cfg.mail.api_url,
        &cfg.mail.server_token,
        &cfg.mail.from,
    )?;
    let shortlinker: Option<Arc<dyn ShortLinker>> = if cfg.shortlink.enabled {
        Some(Arc::new(ShortLinkClient::new(
            &cfg.shortlink.api_url,
            &cfg.shortlink.source_tag,
        )?))
    } else {
        None
    };

    let deps = Arc::new(Deps {
        locks: RunLocks::new(pool.clone()),
        pool,
        config: Arc::new(cfg),
        mailer: Arc::new(mailer),
        shortlinker,
    });

    let _scheduler = scheduler::start(deps).await?;

    info!("rental-digest daemon running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
