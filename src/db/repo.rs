use super::model::{SendRecordInsert, SentListingInsert};
use crate::db::query;
use crate::model::{FilterConfig, FilterPreset, Listing, SortOrder, Template, TemplateConfig};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and make sure the parent
/// directory exists. In-memory URLs and other schemes pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }
    let expanded = match path_part.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn template_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Template> {
    let id: i64 = row.get("id");
    let config_json: String = row.get("config_json");
    let config = TemplateConfig::parse(&config_json)
        .with_context(|| format!("template {} has invalid config", id))?;
    Ok(Template {
        id,
        name: row.get("name"),
        enabled: row.get::<i64, _>("enabled") != 0,
        delivery_hour: row.get::<i64, _>("delivery_hour") as u32,
        config,
        last_used_at: row.try_get("last_used_at").ok(),
        use_count: row.get("use_count"),
    })
}

#[instrument(skip_all, fields(template_id))]
pub async fn fetch_template(pool: &Pool, template_id: i64) -> Result<Template> {
    let row = sqlx::query(
        "SELECT id, name, enabled, delivery_hour, config_json, last_used_at, use_count \
         FROM digest_templates WHERE id = ?",
    )
    .bind(template_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Err(anyhow!("template {} not found", template_id));
    };
    template_from_row(&row)
}

/// Enabled templates for the scheduler tick. A row with an unparsable config
/// is logged and skipped rather than failing the whole tick.
#[instrument(skip_all)]
pub async fn list_enabled_templates(pool: &Pool) -> Result<Vec<Template>> {
    let rows = sqlx::query(
        "SELECT id, name, enabled, delivery_hour, config_json, last_used_at, use_count \
         FROM digest_templates WHERE enabled = 1 ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    let mut templates = Vec::with_capacity(rows.len());
    for row in &rows {
        match template_from_row(row) {
            Ok(t) => templates.push(t),
            Err(err) => warn!(?err, "skipping template with invalid config"),
        }
    }
    Ok(templates)
}

pub async fn touch_template_usage(pool: &Pool, template_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE digest_templates \
         SET last_used_at = CURRENT_TIMESTAMP, use_count = use_count + 1 WHERE id = ?",
    )
    .bind(template_id)
    .execute(pool)
    .await
    .context("failed to update template usage")?;
    Ok(())
}

/// Fetch presets preserving the requested order. A missing id is an error:
/// a template referencing a deleted preset is a configuration problem.
pub async fn fetch_presets(pool: &Pool, ids: &[i64]) -> Result<Vec<FilterPreset>> {
    let mut presets = Vec::with_capacity(ids.len());
    for id in ids {
        let row = sqlx::query(
            "SELECT id, label, filter_json, search_url, short_url FROM filter_presets WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        let Some(row) = row else {
            return Err(anyhow!("filter preset {} not found", id));
        };
        let filter_json: String = row.get("filter_json");
        let filter: FilterConfig = serde_json::from_str(&filter_json)
            .with_context(|| format!("filter preset {} has invalid filter", id))?;
        // Rejected here, before any count query runs against it.
        filter
            .validate()
            .with_context(|| format!("filter preset {} has invalid filter", id))?;
        presets.push(FilterPreset {
            id: row.get("id"),
            label: row.get("label"),
            filter,
            search_url: row.get("search_url"),
            short_url: row
                .try_get::<Option<String>, _>("short_url")
                .ok()
                .flatten()
                .filter(|s| !s.trim().is_empty()),
        });
    }
    Ok(presets)
}

/// Candidate selection for a run. The filter must already be validated.
#[instrument(skip_all)]
pub async fn query_listings(
    pool: &Pool,
    filter: &FilterConfig,
    sort: SortOrder,
    cutoff: Option<DateTime<Utc>>,
) -> Result<Vec<Listing>> {
    let mut qb = query::listing_select(filter, sort, cutoff);
    let listings = qb
        .build_query_as::<Listing>()
        .fetch_all(pool)
        .await
        .context("listing query failed")?;
    Ok(listings)
}

/// Live count for a collection CTA block.
pub async fn count_listings(
    pool: &Pool,
    filter: &FilterConfig,
    cutoff: Option<DateTime<Utc>>,
) -> Result<i64> {
    let mut qb = query::listing_count(filter, cutoff);
    let count: i64 = qb
        .build_query_scalar()
        .fetch_one(pool)
        .await
        .context("listing count query failed")?;
    Ok(count)
}

/// Downgrade an already-written send record to failed. Used when a write
/// after the record (the dedup ledger) fails, so the audit row never claims
/// more than actually happened.
pub async fn mark_send_record_failed(pool: &Pool, send_id: i64, error: &str) -> Result<()> {
    sqlx::query("UPDATE digest_sends SET success = 0, error = ? WHERE id = ?")
        .bind(error)
        .bind(send_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Atomically claim the per-template run lock. A claim older than
/// `stale_after` belongs to a process that died mid-run and is stolen.
pub async fn claim_run_lock(
    pool: &Pool,
    template_id: i64,
    token: &str,
    stale_after: std::time::Duration,
) -> Result<bool> {
    let cutoff = format!("-{} seconds", stale_after.as_secs());
    sqlx::query(
        "DELETE FROM run_locks WHERE template_id = ? \
         AND datetime(acquired_at) <= datetime('now', ?)",
    )
    .bind(template_id)
    .bind(&cutoff)
    .execute(pool)
    .await?;
    let res = sqlx::query("INSERT OR IGNORE INTO run_locks (template_id, token) VALUES (?, ?)")
        .bind(template_id)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Release a claim. The token guard means a claim stolen after going stale
/// cannot be deleted by its original owner.
pub async fn release_run_lock(pool: &Pool, template_id: i64, token: &str) -> Result<()> {
    sqlx::query("DELETE FROM run_locks WHERE template_id = ? AND token = ?")
        .bind(template_id)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

/// Dedup ledger lookup. With `newer_than = None` every listing ever sent for
/// the template is returned; otherwise only listings whose most recent send
/// is after the threshold.
#[instrument(skip_all, fields(template_id))]
pub async fn sent_listing_ids(
    pool: &Pool,
    template_id: i64,
    newer_than: Option<DateTime<Utc>>,
) -> Result<HashSet<i64>> {
    let ids: Vec<i64> = match newer_than {
        None => {
            sqlx::query_scalar(
                "SELECT DISTINCT listing_id FROM digest_sent_listings WHERE template_id = ?",
            )
            .bind(template_id)
            .fetch_all(pool)
            .await?
        }
        Some(threshold) => {
            sqlx::query_scalar(
                "SELECT listing_id FROM digest_sent_listings WHERE template_id = ? \
                 GROUP BY listing_id HAVING MAX(datetime(sent_at)) > datetime(?)",
            )
            .bind(template_id)
            .bind(threshold)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(ids.into_iter().collect())
}

/// Daily gate for the automatic trigger: has any non-dry-run send happened
/// for this template on the given local calendar day?
pub async fn has_send_for_local_day(
    pool: &Pool,
    template_id: i64,
    local_date: NaiveDate,
) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM digest_sends \
         WHERE template_id = ? AND local_date = ? AND dry_run = 0",
    )
    .bind(template_id)
    .bind(local_date)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

pub async fn active_recipients(pool: &Pool) -> Result<Vec<String>> {
    let emails =
        sqlx::query_scalar("SELECT email FROM recipients WHERE active = 1 ORDER BY email")
            .fetch_all(pool)
            .await?;
    Ok(emails)
}

#[instrument(skip_all, fields(template_id = record.template_id, success = record.success))]
pub async fn insert_send_record(pool: &Pool, record: &SendRecordInsert) -> Result<i64> {
    let row = sqlx::query(
        "INSERT INTO digest_sends \
         (run_id, template_id, success, dry_run, manual, recipient_count, listing_count, \
          category_counts_json, collections_json, duration_ms, error, config_snapshot_json, local_date) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&record.run_id)
    .bind(record.template_id)
    .bind(record.success)
    .bind(record.dry_run)
    .bind(record.manual)
    .bind(record.recipient_count)
    .bind(record.listing_count)
    .bind(record.category_counts.to_string())
    .bind(record.collections.to_string())
    .bind(record.duration_ms)
    .bind(&record.error)
    .bind(&record.config_snapshot)
    .bind(record.local_date)
    .fetch_one(pool)
    .await
    .context("failed to insert send record")?;
    Ok(row.get("id"))
}

/// Write the dedup ledger batch for a confirmed dispatch. One transaction;
/// called only after the send record exists and the dispatch succeeded.
#[instrument(skip_all, fields(send_id, n = entries.len()))]
pub async fn insert_sent_listings(
    pool: &Pool,
    send_id: i64,
    template_id: i64,
    entries: &[SentListingInsert],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    for entry in entries {
        let snapshot = serde_json::to_string(&entry.snapshot)?;
        sqlx::query(
            "INSERT INTO digest_sent_listings \
             (send_id, template_id, listing_id, category_label, snapshot_json) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(send_id)
        .bind(template_id)
        .bind(entry.listing_id)
        .bind(&entry.category_label)
        .bind(snapshot)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}
