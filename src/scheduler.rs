//! Hourly trigger and per-template run locks.
//!
//! The tick walks enabled templates and starts a run for each one whose
//! delivery hour matches the local clock and which has not already had a
//! non-dry-run send on the local calendar day. A tick that observes a held
//! run lock skips the template; it never queues behind the running pipeline.

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::Template;
use crate::pipeline::{self, Deps, RunMode};

/// Per-template mutual exclusion for pipeline runs, backed by a claim row in
/// the database. The daemon's hourly tick and a manual `send_digest` run in
/// another process share the same claims, so at most one run per template is
/// ever in flight. All writes to the audit tables happen from inside a held
/// claim, so cross-run races cannot occur.
#[derive(Clone)]
pub struct RunLocks {
    pool: Pool,
}

impl RunLocks {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Claim the lock for a template, or `None` if a run is in flight.
    /// Claims older than `stale_after` are stolen from their dead owner.
    pub async fn try_acquire(
        &self,
        template_id: i64,
        stale_after: Duration,
    ) -> Result<Option<RunLockGuard>> {
        let token = Uuid::new_v4().to_string();
        if db::claim_run_lock(&self.pool, template_id, &token, stale_after).await? {
            Ok(Some(RunLockGuard {
                pool: self.pool.clone(),
                template_id,
                token,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }
}

/// Releases the run claim on every exit path.
pub struct RunLockGuard {
    pool: Pool,
    template_id: i64,
    token: String,
    released: bool,
}

impl RunLockGuard {
    /// Release the claim row and surface any database error. Callers on the
    /// ordinary return path use this; drop is the backstop for early exits.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        db::release_run_lock(&self.pool, self.template_id, &self.token).await
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = self.pool.clone();
        let template_id = self.template_id;
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = db::release_run_lock(&pool, template_id, &token).await {
                    warn!(?err, template_id, "failed to release run claim");
                }
            });
        }
    }
}

pub fn local_now(config: &Config) -> DateTime<FixedOffset> {
    let offset =
        FixedOffset::east_opt(config.app.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
    Utc::now().with_timezone(&offset)
}

/// Hour gate for the automatic trigger.
pub fn is_delivery_hour(template: &Template, now_local: DateTime<FixedOffset>) -> bool {
    template.enabled && template.delivery_hour == now_local.hour()
}

/// One scheduler pass. Per-template failures are logged and do not stop the
/// rest of the tick.
pub async fn tick(deps: &Deps, now_local: DateTime<FixedOffset>) -> Result<()> {
    let templates = db::list_enabled_templates(&deps.pool).await?;
    for template in templates {
        if !is_delivery_hour(&template, now_local) {
            continue;
        }
        match db::has_send_for_local_day(&deps.pool, template.id, now_local.date_naive()).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => {
                warn!(?err, template_id = template.id, "daily-gate check failed; skipping");
                continue;
            }
        }

        info!(template_id = template.id, name = %template.name, "template due; starting digest run");
        match pipeline::run(deps, template.id, RunMode::automatic()).await {
            Ok(report) if report.success => info!(
                template_id = template.id,
                listings = report.listing_count,
                dispatched = report.dispatched,
                "scheduled digest run completed"
            ),
            Ok(report) => warn!(
                template_id = template.id,
                error = report.error.as_deref().unwrap_or("unknown"),
                "scheduled digest run failed"
            ),
            // Lock held by a manual run, or the template vanished mid-tick.
            Err(err) => warn!(?err, template_id = template.id, "digest run skipped"),
        }
    }
    Ok(())
}

/// Start the hourly tick.
pub async fn start(deps: Arc<Deps>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let job_deps = deps.clone();
    let job = Job::new_async("0 0 * * * *", move |_uuid, _lock| {
        let deps = job_deps.clone();
        Box::pin(async move {
            let now_local = local_now(&deps.config);
            if let Err(err) = tick(&deps, now_local).await {
                error!(?err, "hourly digest tick failed");
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    info!("digest scheduler started (hourly tick)");
    Ok(scheduler)
}
