//! Send-history filtering against the dedup ledger.
//!
//! Runs strictly after bucket assignment, so history removal never reshuffles
//! category balance. A ledger query failure aborts the run: sending without
//! dedup guarantees risks duplicate spam, so this is a hard failure rather
//! than a soft skip.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::instrument;

use crate::categorize::Bucket;
use crate::db::{self, Pool};
use crate::model::DedupPolicy;

/// Remove already-sent listings from the assigned buckets per the template's
/// policy. Returns the surviving buckets and how many listings were excluded.
#[instrument(skip_all, fields(template_id, ?policy))]
pub async fn filter_buckets(
    pool: &Pool,
    mut buckets: Vec<Bucket>,
    template_id: i64,
    policy: DedupPolicy,
    now: DateTime<Utc>,
) -> Result<(Vec<Bucket>, usize)> {
    let exclude = match policy {
        DedupPolicy::IgnoreHistory => return Ok((buckets, 0)),
        DedupPolicy::UnsentOnly => db::sent_listing_ids(pool, template_id, None)
            .await
            .context("dedup ledger query failed")?,
        DedupPolicy::AllowResendAfterDays { days } => {
            let threshold = now - Duration::days(i64::from(days));
            db::sent_listing_ids(pool, template_id, Some(threshold))
                .await
                .context("dedup ledger query failed")?
        }
    };

    let mut excluded = 0usize;
    for bucket in &mut buckets {
        let before = bucket.listings.len();
        bucket.listings.retain(|l| !exclude.contains(&l.id));
        excluded += before - bucket.listings.len();
    }
    Ok((buckets, excluded))
}
