//! Partitions candidate listings into ordered, labeled category buckets.

use crate::model::{BucketRule, CategoryConfig, Listing};

/// A filled category bucket, in display order.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub label: String,
    pub max: usize,
    pub listings: Vec<Listing>,
}

impl Bucket {
    /// Implicit single bucket for templates without category configuration.
    pub fn uncapped(label: &str, listings: Vec<Listing>) -> Self {
        Self {
            label: label.to_string(),
            max: usize::MAX,
            listings,
        }
    }
}

fn rule_matches(rule: &BucketRule, listing: &Listing) -> bool {
    match rule {
        BucketRule::Bedrooms { counts } => counts.contains(&listing.bedrooms),
        BucketRule::BedroomsAtLeast { min } => listing.bedrooms >= *min,
        BucketRule::PropertyType { value } => listing.property_type.eq_ignore_ascii_case(value),
    }
}

/// Assign each candidate to at most one bucket (first matching rule wins, in
/// configured order), preserving the candidates' incoming sort within each
/// bucket. Listings matching no bucket are dropped. Each bucket keeps at most
/// `max` listings; the excess is dropped, never carried to another bucket.
pub fn assign(candidates: Vec<Listing>, config: &CategoryConfig) -> Vec<Bucket> {
    let mut buckets: Vec<Bucket> = config
        .buckets
        .iter()
        .map(|b| Bucket {
            label: b.label.clone(),
            max: b.max,
            listings: Vec::new(),
        })
        .collect();

    for listing in candidates {
        if let Some(idx) = config
            .buckets
            .iter()
            .position(|b| rule_matches(&b.rule, &listing))
        {
            buckets[idx].listings.push(listing);
        }
    }

    for bucket in &mut buckets {
        bucket.listings.truncate(bucket.max);
    }
    buckets
}
