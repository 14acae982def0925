//! The digest pipeline: a strict linear run of
//! query -> categorize -> dedup -> mint -> render -> dispatch -> record.
//!
//! Every run that gets past configuration loading produces exactly one send
//! record, success or failure. The dedup ledger is written only after a
//! confirmed dispatch, and always after the send record, so a failed dispatch
//! can never mark content as sent.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::categorize::{self, Bucket};
use crate::config::Config;
use crate::db::{self, Pool, SendRecordInsert, SentListingInsert, SentListingSnapshot};
use crate::dedup;
use crate::mailer::{Mailer, OutgoingEmail};
use crate::model::{DedupPolicy, EmptyBehavior, Listing, OutputFormat, Template};
use crate::render::{self, CollectionBlock, RenderBucket, RenderInput, RenderedMessage};
use crate::scheduler::RunLocks;
use crate::shortlink::{self, ShortLinker};

/// Shared handles for pipeline runs; cheap to clone.
#[derive(Clone)]
pub struct Deps {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub mailer: Arc<dyn Mailer>,
    pub shortlinker: Option<Arc<dyn ShortLinker>>,
    pub locks: RunLocks,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunMode {
    pub dry_run: bool,
    pub manual: bool,
    /// Manual "resend everything" override: skips the dedup ledger filter.
    pub ignore_history: bool,
}

impl RunMode {
    pub fn automatic() -> Self {
        Self::default()
    }

    pub fn manual(dry_run: bool, ignore_history: bool) -> Self {
        Self {
            dry_run,
            manual: true,
            ignore_history,
        }
    }
}

/// What one run did, for operator display and tests. The authoritative audit
/// trail is the send record this mirrors.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub template_id: i64,
    pub template_name: String,
    pub success: bool,
    pub dry_run: bool,
    pub listing_count: usize,
    pub excluded_count: usize,
    pub category_counts: Vec<(String, usize)>,
    pub collections: Vec<CollectionBlock>,
    pub recipient_count: usize,
    pub dispatched: bool,
    pub rendered: Option<RenderedMessage>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

struct StageOutcome {
    listing_count: usize,
    excluded_count: usize,
    category_counts: Vec<(String, usize)>,
    collections: Vec<CollectionBlock>,
    recipients: Vec<String>,
    rendered: RenderedMessage,
    dispatched: bool,
    ledger_entries: Vec<SentListingInsert>,
}

fn local_offset(config: &Config) -> Result<FixedOffset> {
    FixedOffset::east_opt(config.app.utc_offset_minutes * 60)
        .ok_or_else(|| anyhow!("invalid utc_offset_minutes"))
}

/// Execute one pipeline run end to end under the template's run lock.
///
/// Returns `Err` only for conditions that precede the run proper (lock held,
/// template missing, invalid configuration) or when the send record itself
/// cannot be written. Pipeline failures after that point are reported through
/// `RunReport { success: false, .. }` with a persisted failed send record.
#[instrument(skip_all, fields(template_id, dry_run = mode.dry_run, manual = mode.manual))]
pub async fn run(deps: &Deps, template_id: i64, mode: RunMode) -> Result<RunReport> {
    // Claims are stolen once a dead owner's run budget has clearly passed.
    let stale_after = std::time::Duration::from_secs(deps.config.app.run_timeout_seconds + 60);
    let Some(guard) = deps.locks.try_acquire(template_id, stale_after).await? else {
        return Err(anyhow!(
            "a run is already in flight for template {}",
            template_id
        ));
    };

    // Configuration errors surface synchronously; no send record yet.
    let template = db::fetch_template(&deps.pool, template_id).await?;

    let started = Instant::now();
    let now = Utc::now();
    let local_date = now.with_timezone(&local_offset(&deps.config)?).date_naive();
    let run_id = Uuid::new_v4().to_string();
    let config_snapshot =
        serde_json::to_string(&template.config).context("failed to snapshot template config")?;

    let budget = std::time::Duration::from_secs(deps.config.app.run_timeout_seconds);
    let outcome = tokio::time::timeout(budget, execute(deps, &template, mode, now, local_date)).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    let (outcome, error) = match outcome {
        Ok(Ok(outcome)) => (Some(outcome), None),
        Ok(Err(err)) => (None, Some(format!("{err:#}"))),
        Err(_) => (None, Some("timeout".to_string())),
    };

    let record = SendRecordInsert {
        run_id: run_id.clone(),
        template_id: template.id,
        success: error.is_none(),
        dry_run: mode.dry_run,
        manual: mode.manual,
        recipient_count: outcome.as_ref().map_or(0, |o| o.recipients.len() as i64),
        listing_count: outcome.as_ref().map_or(0, |o| o.listing_count as i64),
        category_counts: outcome.as_ref().map_or(json!({}), |o| {
            serde_json::Value::Object(
                o.category_counts
                    .iter()
                    .map(|(label, n)| (label.clone(), json!(n)))
                    .collect(),
            )
        }),
        collections: outcome
            .as_ref()
            .map_or(json!([]), |o| json!(o.collections)),
        duration_ms,
        error: error.clone(),
        config_snapshot,
        local_date,
    };

    // The send record is written on every path, and always before the ledger.
    let send_id = db::insert_send_record(&deps.pool, &record).await?;

    if let Some(outcome) = &outcome {
        if !mode.dry_run {
            if !outcome.ledger_entries.is_empty() {
                if let Err(err) = db::insert_sent_listings(
                    &deps.pool,
                    send_id,
                    template.id,
                    &outcome.ledger_entries,
                )
                .await
                {
                    // The dispatch happened but the ledger did not record it;
                    // downgrade the send record so the audit trail admits it.
                    let message = format!("ledger write failed: {err:#}");
                    if let Err(update_err) =
                        db::mark_send_record_failed(&deps.pool, send_id, &message).await
                    {
                        warn!(?update_err, send_id, "failed to downgrade send record");
                    }
                    return Err(err.context("failed to write dedup ledger"));
                }
            }
            db::touch_template_usage(&deps.pool, template.id).await?;
        }
    }

    match &error {
        None => info!(
            run_id = %run_id,
            listings = record.listing_count,
            recipients = record.recipient_count,
            dry_run = mode.dry_run,
            "digest run completed"
        ),
        Some(err) => warn!(run_id = %run_id, error = %err, "digest run failed"),
    }

    let report = RunReport {
        run_id,
        template_id: template.id,
        template_name: template.name.clone(),
        success: error.is_none(),
        dry_run: mode.dry_run,
        listing_count: outcome.as_ref().map_or(0, |o| o.listing_count),
        excluded_count: outcome.as_ref().map_or(0, |o| o.excluded_count),
        category_counts: outcome
            .as_ref()
            .map_or_else(Vec::new, |o| o.category_counts.clone()),
        collections: outcome
            .as_ref()
            .map_or_else(Vec::new, |o| o.collections.clone()),
        recipient_count: outcome.as_ref().map_or(0, |o| o.recipients.len()),
        dispatched: outcome.as_ref().is_some_and(|o| o.dispatched),
        rendered: outcome.map(|o| o.rendered),
        error,
        duration_ms,
    };
    guard.release().await?;
    Ok(report)
}

fn category_counts_of(buckets: &[Bucket]) -> Vec<(String, usize)> {
    buckets
        .iter()
        .map(|b| (b.label.clone(), b.listings.len()))
        .collect()
}

async fn execute(
    deps: &Deps,
    template: &Template,
    mode: RunMode,
    now: DateTime<Utc>,
    local_date: NaiveDate,
) -> Result<StageOutcome> {
    let cfg = &template.config;
    let spec = &cfg.spec;
    let linker = deps.shortlinker.as_deref();
    let site_base = &deps.config.app.site_base_url;

    // 1. Query candidates.
    let candidates: Vec<Listing> = match spec.filter() {
        Some(filter) => {
            let cutoff = filter.lookback_days.map(|d| now - Duration::days(d));
            db::query_listings(&deps.pool, filter, spec.sort(), cutoff)
                .await
                .context("listing source query failed")?
        }
        None => Vec::new(),
    };

    // 2. Categorize.
    let buckets = match spec.categories() {
        Some(categories) => categorize::assign(candidates, categories),
        None if spec.filter().is_some() => vec![Bucket::uncapped("New Listings", candidates)],
        None => Vec::new(),
    };

    // 3. Dedup against send history.
    let policy = if mode.ignore_history {
        DedupPolicy::IgnoreHistory
    } else {
        spec.dedup_policy()
    };
    let (buckets, excluded_count) =
        dedup::filter_buckets(&deps.pool, buckets, template.id, policy, now).await?;

    // 4. Mint listing links (best-effort, bounded parallelism).
    let included: Vec<&Listing> = buckets.iter().flat_map(|b| b.listings.iter()).collect();
    let links = shortlink::mint_listing_links(
        linker,
        site_base,
        &included,
        deps.config.app.mint_concurrency,
    )
    .await;

    // 5. Collection CTA blocks with live counts.
    let presets = db::fetch_presets(&deps.pool, spec.preset_ids()).await?;
    let mut collections = Vec::with_capacity(presets.len());
    for preset in presets {
        let cutoff = preset.filter.lookback_days.map(|d| now - Duration::days(d));
        let count = db::count_listings(&deps.pool, &preset.filter, cutoff)
            .await
            .context("collection count query failed")?;
        let url = shortlink::collection_link(linker, preset.short_url.as_deref(), &preset.search_url)
            .await;
        collections.push(CollectionBlock {
            label: preset.label,
            count,
            url,
        });
    }

    // 6. Render.
    let header_text = cfg
        .header
        .clone()
        .unwrap_or_else(|| deps.config.digest.default_header.clone());
    let header = header_text.replace("{date}", &local_date.format("%B %-d, %Y").to_string());
    let footer = cfg
        .footer
        .clone()
        .unwrap_or_else(|| deps.config.digest.default_footer.clone());

    let render_buckets: Vec<RenderBucket> = buckets
        .iter()
        .map(|b| RenderBucket {
            label: b.label.clone(),
            entries: b
                .listings
                .iter()
                .map(|l| {
                    let url = links
                        .get(&l.id)
                        .cloned()
                        .unwrap_or_else(|| shortlink::long_listing_url(site_base, l.id));
                    (l.clone(), url)
                })
                .collect(),
        })
        .collect();
    let listing_count: usize = render_buckets.iter().map(|b| b.entries.len()).sum();
    let category_counts = category_counts_of(&buckets);

    let rendered = render::render(&RenderInput {
        header: &header,
        footer: &footer,
        empty_notice: Some(&deps.config.digest.empty_notice),
        collections: &collections,
        buckets: &render_buckets,
        format: cfg.format,
    });

    // 7. Resolve recipients.
    let recipients = db::active_recipients(&deps.pool)
        .await
        .context("recipient query failed")?;

    // 8. Dispatch.
    let is_empty = listing_count == 0 && collections.is_empty();
    let skip_send = is_empty && cfg.empty_behavior == EmptyBehavior::Skip;
    let mut dispatched = false;
    if !mode.dry_run && !skip_send {
        let email = OutgoingEmail {
            to: recipients.clone(),
            subject: build_subject(
                deps.config.mail.subject_prefix.as_deref(),
                &template.name,
                listing_count,
                is_empty,
            ),
            html: rendered.html.clone(),
            text: match cfg.format {
                OutputFormat::Html => None,
                _ => Some(rendered.plain.clone()),
            },
            reply_to: deps.config.mail.reply_to.clone(),
        };
        deps.mailer.send(&email).await.context("dispatch failed")?;
        dispatched = true;
    }

    // Ledger rows exist only for content a real dispatch carried.
    let ledger_entries = if dispatched && !mode.dry_run {
        buckets
            .iter()
            .flat_map(|b| {
                b.listings.iter().map(|l| SentListingInsert {
                    listing_id: l.id,
                    category_label: b.label.clone(),
                    snapshot: SentListingSnapshot::of(l),
                })
            })
            .collect()
    } else {
        Vec::new()
    };

    Ok(StageOutcome {
        listing_count,
        excluded_count,
        category_counts,
        collections,
        recipients,
        rendered,
        dispatched,
        ledger_entries,
    })
}

fn build_subject(prefix: Option<&str>, template_name: &str, listing_count: usize, is_empty: bool) -> String {
    let body = if is_empty {
        format!("{}: nothing new", template_name)
    } else if listing_count == 1 {
        format!("{}: 1 new listing", template_name)
    } else {
        format!("{}: {} new listings", template_name, listing_count)
    };
    match prefix {
        Some(p) => format!("{} {}", p, body),
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_counts_and_prefix() {
        assert_eq!(
            build_subject(Some("[Rentals]"), "Daily", 10, false),
            "[Rentals] Daily: 10 new listings"
        );
        assert_eq!(build_subject(None, "Daily", 1, false), "Daily: 1 new listing");
        assert_eq!(build_subject(None, "Daily", 0, true), "Daily: nothing new");
    }
}
