//! Database row and insert payload types used by the repositories.
//!
//! Keep these structs focused on the data crossing the SQL boundary. Pipeline
//! logic lives in higher layers.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::Listing;

/// One audit row per pipeline execution, written on every exit path.
#[derive(Debug, Clone)]
pub struct SendRecordInsert {
    pub run_id: String,
    pub template_id: i64,
    pub success: bool,
    pub dry_run: bool,
    pub manual: bool,
    pub recipient_count: i64,
    pub listing_count: i64,
    /// Bucket label -> rendered count.
    pub category_counts: serde_json::Value,
    /// Collection CTA snapshots (label, live count, link) at send time.
    pub collections: serde_json::Value,
    pub duration_ms: i64,
    pub error: Option<String>,
    /// Full template configuration as it existed for this run.
    pub config_snapshot: String,
    /// Calendar day in the configured local offset; drives the daily gate.
    pub local_date: NaiveDate,
}

/// Denormalized listing display fields captured at send time, so historical
/// digests stay renderable after the listing changes or disappears.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentListingSnapshot {
    pub price: Option<i64>,
    pub bedrooms: i64,
    pub bathrooms: i64,
    pub property_type: String,
    pub neighborhood: String,
    pub broker_fee: bool,
    pub posted_by: String,
}

impl SentListingSnapshot {
    pub fn of(listing: &Listing) -> Self {
        Self {
            price: listing.price,
            bedrooms: listing.bedrooms,
            bathrooms: listing.bathrooms,
            property_type: listing.property_type.clone(),
            neighborhood: listing.neighborhood.clone(),
            broker_fee: listing.broker_fee,
            posted_by: listing.posted_by.clone(),
        }
    }
}

/// One dedup-ledger row per listing in a confirmed dispatch.
#[derive(Debug, Clone)]
pub struct SentListingInsert {
    pub listing_id: i64,
    pub category_label: String,
    pub snapshot: SentListingSnapshot,
}
