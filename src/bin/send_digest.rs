use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use rental_digest::config;
use rental_digest::db;
use rental_digest::mailer::PostmarkMailer;
use rental_digest::pipeline::{self, Deps, RunMode, RunReport};
use rental_digest::scheduler::RunLocks;
use rental_digest::shortlink::{ShortLinkClient, ShortLinker};

#[derive(Debug, Parser)]
#[command(about = "Trigger a digest run for one template. Without --yes this \
previews the digest (no mail, no history writes) and prints a summary.")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Template id to run
    #[arg(long)]
    template: i64,

    /// Render only; never dispatch or write send history
    #[arg(long)]
    dry_run: bool,

    /// Include listings already recorded in the send history
    #[arg(long)]
    ignore_history: bool,

    /// Actually send. Without this flag a real run is downgraded to a preview.
    #[arg(long)]
    yes: bool,
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

    let mailer = PostmarkMailer::new(&cfg.mail.api_url, &cfg.mail.server_token, &cfg.mail.from)?;
    let shortlinker: Option<Arc<dyn ShortLinker>> = if cfg.shortlink.enabled {
        Some(Arc::new(ShortLinkClient::new(
            &cfg.shortlink.api_url,
            &cfg.shortlink.source_tag,
        )?))
    } else {
        None
    };

    let deps = Deps {
        locks: RunLocks::new(pool.clone()),
        pool,
        config: Arc::new(cfg),
        mailer: Arc::new(mailer),
        shortlinker,
    };

    // A real send requires explicit confirmation; everything else previews.
    let dry_run = args.dry_run || !args.yes;
    let report = pipeline::run(
        &deps,
        args.template,
        RunMode::manual(dry_run, args.ignore_history),
    )
    .await?;

    print_summary(&report);

    if report.dry_run {
        if args.dry_run {
            if let Some(rendered) = &report.rendered {
                println!("\n--- digest body (plain) ---\n{}", rendered.plain);
            }
        } else {
            println!("\nThis was a preview. Re-run with --yes to send.");
        }
    }

    if !report.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    let verdict = match (report.success, report.dry_run, report.dispatched) {
        (false, _, _) => "FAILED",
        (true, true, _) => "previewed",
        (true, false, true) => "sent",
        (true, false, false) => "skipped (empty digest)",
    };
    println!(
        "{} [{}] run {}: {}",
        report.template_name, report.template_id, report.run_id, verdict
    );
    if let Some(err) = &report.error {
        println!("  error: {}", err);
        return;
    }
    for (label, n) in &report.category_counts {
        println!("  {}: {} listing(s)", label, n);
    }
    for block in &report.collections {
        println!("  collection {}: {} listing(s)", block.label, block.count);
    }
    println!(
        "  {} listing(s) total, {} excluded as already sent",
        report.listing_count, report.excluded_count
    );
    println!("  {} recipient(s)", report.recipient_count);
    if let Some(rendered) = &report.rendered {
        println!(
            "  body: {} lines, {} chars",
            rendered.line_count(),
            rendered.char_count()
        );
    }
    println!("  took {} ms", report.duration_ms);
}
