//! Domain model: template configuration, filters, categories and listing rows.
//!
//! Template configuration is stored as JSON in `digest_templates.config_json`
//! and parsed into the tagged types below at load time, so a malformed or
//! misspelled field fails the run before any query is issued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateConfigError {
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid template config: {0}")]
    Invalid(&'static str),
}

/// Declarative listing filter. Any omitted field is unconstrained; fields
/// combine with AND, set-valued fields match with IN.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighborhoods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_fee: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback_days: Option<i64>,
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), TemplateConfigError> {
        if let (Some(min), Some(max)) = (self.price_min, self.price_max) {
            if min > max {
                return Err(TemplateConfigError::Invalid("price_min exceeds price_max"));
            }
        }
        if self.bedrooms.as_ref().is_some_and(|b| b.is_empty()) {
            return Err(TemplateConfigError::Invalid(
                "bedrooms must not be an empty list",
            ));
        }
        if self.property_types.as_ref().is_some_and(|p| p.is_empty()) {
            return Err(TemplateConfigError::Invalid(
                "property_types must not be an empty list",
            ));
        }
        if self.neighborhoods.as_ref().is_some_and(|n| n.is_empty()) {
            return Err(TemplateConfigError::Invalid(
                "neighborhoods must not be an empty list",
            ));
        }
        if self.lookback_days.is_some_and(|d| d <= 0) {
            return Err(TemplateConfigError::Invalid("lookback_days must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    UpdatedDesc,
    PriceAsc,
    PriceDesc,
    BedsAsc,
    BedsDesc,
}

/// What a category bucket matches on. `BedroomsAtLeast` exists for the "4+"
/// catch-all: any bedroom count at or above the threshold lands there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum BucketRule {
    Bedrooms { counts: Vec<i64> },
    BedroomsAtLeast { min: i64 },
    PropertyType { value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketConfig {
    pub label: String,
    pub max: usize,
    #[serde(flatten)]
    pub rule: BucketRule,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    BedroomTier,
    PropertyType,
}

/// Ordered bucket definitions. Display order is the configured order; a
/// listing joins the first bucket whose rule matches it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryConfig {
    pub group_by: GroupBy,
    pub buckets: Vec<BucketConfig>,
}

impl CategoryConfig {
    pub fn validate(&self) -> Result<(), TemplateConfigError> {
        if self.buckets.is_empty() {
            return Err(TemplateConfigError::Invalid(
                "categories need at least one bucket",
            ));
        }
        for bucket in &self.buckets {
            if bucket.label.trim().is_empty() {
                return Err(TemplateConfigError::Invalid("bucket label must be non-empty"));
            }
            if bucket.max == 0 {
                return Err(TemplateConfigError::Invalid("bucket max must be > 0"));
            }
            let rule_is_bedrooms = matches!(
                bucket.rule,
                BucketRule::Bedrooms { .. } | BucketRule::BedroomsAtLeast { .. }
            );
            match self.group_by {
                GroupBy::BedroomTier if !rule_is_bedrooms => {
                    return Err(TemplateConfigError::Invalid(
                        "bedroom_tier buckets must use bedroom rules",
                    ));
                }
                GroupBy::PropertyType if rule_is_bedrooms => {
                    return Err(TemplateConfigError::Invalid(
                        "property_type buckets must use property_type rules",
                    ));
                }
                _ => {}
            }
            if let BucketRule::Bedrooms { counts } = &bucket.rule {
                if counts.is_empty() {
                    return Err(TemplateConfigError::Invalid(
                        "bucket bedroom counts must be non-empty",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    UnsentOnly,
    AllowResendAfterDays { days: u32 },
    IgnoreHistory,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    PlainText,
    Html,
    #[default]
    Both,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmptyBehavior {
    /// Record the run but do not dispatch anything.
    #[default]
    Skip,
    /// Dispatch a "nothing new today" message.
    SendNotice,
}

/// One variant per template type. The variant decides which pipeline stages
/// apply and which dedup policy governs the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplateSpec {
    /// Never-sent listings, grouped into categories.
    UnsentOnly {
        filter: FilterConfig,
        #[serde(default)]
        sort: SortOrder,
        categories: CategoryConfig,
    },
    /// Recent listings grouped by category; a listing becomes eligible again
    /// after `resend_after_days`.
    RecentByCategory {
        filter: FilterConfig,
        #[serde(default)]
        sort: SortOrder,
        categories: CategoryConfig,
        resend_after_days: u32,
    },
    /// Collection CTA links only; no individual listing blocks.
    FilterLinks { preset_ids: Vec<i64> },
    /// Operator-supplied filter with a free choice of policy.
    CustomQuery {
        filter: FilterConfig,
        #[serde(default)]
        sort: SortOrder,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        categories: Option<CategoryConfig>,
        dedup: DedupPolicy,
    },
    /// Collection links followed by categorized listings.
    MixedLayout {
        preset_ids: Vec<i64>,
        filter: FilterConfig,
        #[serde(default)]
        sort: SortOrder,
        categories: CategoryConfig,
        dedup: DedupPolicy,
    },
    /// Every approved and active match, history ignored.
    AllActive {
        filter: FilterConfig,
        #[serde(default)]
        sort: SortOrder,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        categories: Option<CategoryConfig>,
    },
}

impl TemplateSpec {
    pub fn filter(&self) -> Option<&FilterConfig> {
        match self {
            TemplateSpec::UnsentOnly { filter, .. }
            | TemplateSpec::RecentByCategory { filter, .. }
            | TemplateSpec::CustomQuery { filter, .. }
            | TemplateSpec::MixedLayout { filter, .. }
            | TemplateSpec::AllActive { filter, .. } => Some(filter),
            TemplateSpec::FilterLinks { .. } => None,
        }
    }

    pub fn sort(&self) -> SortOrder {
        match self {
            TemplateSpec::UnsentOnly { sort, .. }
            | TemplateSpec::RecentByCategory { sort, .. }
            | TemplateSpec::CustomQuery { sort, .. }
            | TemplateSpec::MixedLayout { sort, .. }
            | TemplateSpec::AllActive { sort, .. } => *sort,
            TemplateSpec::FilterLinks { .. } => SortOrder::default(),
        }
    }

    pub fn categories(&self) -> Option<&CategoryConfig> {
        match self {
            TemplateSpec::UnsentOnly { categories, .. }
            | TemplateSpec::RecentByCategory { categories, .. }
            | TemplateSpec::MixedLayout { categories, .. } => Some(categories),
            TemplateSpec::CustomQuery { categories, .. }
            | TemplateSpec::AllActive { categories, .. } => categories.as_ref(),
            TemplateSpec::FilterLinks { .. } => None,
        }
    }

    pub fn preset_ids(&self) -> &[i64] {
        match self {
            TemplateSpec::FilterLinks { preset_ids }
            | TemplateSpec::MixedLayout { preset_ids, .. } => preset_ids,
            _ => &[],
        }
    }

    pub fn dedup_policy(&self) -> DedupPolicy {
        match self {
            TemplateSpec::UnsentOnly { .. } => DedupPolicy::UnsentOnly,
            TemplateSpec::RecentByCategory {
                resend_after_days, ..
            } => DedupPolicy::AllowResendAfterDays {
                days: *resend_after_days,
            },
            TemplateSpec::CustomQuery { dedup, .. } | TemplateSpec::MixedLayout { dedup, .. } => {
                *dedup
            }
            TemplateSpec::FilterLinks { .. } | TemplateSpec::AllActive { .. } => {
                DedupPolicy::IgnoreHistory
            }
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            TemplateSpec::UnsentOnly { .. } => "unsent_only",
            TemplateSpec::RecentByCategory { .. } => "recent_by_category",
            TemplateSpec::FilterLinks { .. } => "filter_links",
            TemplateSpec::CustomQuery { .. } => "custom_query",
            TemplateSpec::MixedLayout { .. } => "mixed_layout",
            TemplateSpec::AllActive { .. } => "all_active",
        }
    }

    pub fn validate(&self) -> Result<(), TemplateConfigError> {
        if let Some(filter) = self.filter() {
            filter.validate()?;
        }
        if let Some(categories) = self.categories() {
            categories.validate()?;
        }
        match self {
            TemplateSpec::FilterLinks { preset_ids }
            | TemplateSpec::MixedLayout { preset_ids, .. } => {
                if preset_ids.is_empty() {
                    return Err(TemplateConfigError::Invalid(
                        "collection templates need at least one preset",
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Full template configuration as stored in `config_json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateConfig {
    #[serde(flatten)]
    pub spec: TemplateSpec,
    /// Header text; a `{date}` token is substituted with the run date.
    /// `None` opts into the global default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub empty_behavior: EmptyBehavior,
}

impl TemplateConfig {
    pub fn parse(json: &str) -> Result<Self, TemplateConfigError> {
        let cfg: TemplateConfig = serde_json::from_str(json)?;
        cfg.spec.validate()?;
        Ok(cfg)
    }
}

/// A digest template row joined with its parsed configuration.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub delivery_hour: u32,
    pub config: TemplateConfig,
    pub last_used_at: Option<DateTime<Utc>>,
    pub use_count: i64,
}

/// Saved-filter preset backing a collection CTA block. Snapshotted into the
/// send record at dispatch time, so later edits do not rewrite history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterPreset {
    pub id: i64,
    pub label: String,
    pub filter: FilterConfig,
    pub search_url: String,
    pub short_url: Option<String>,
}

/// Read-only listing row as exposed by the marketplace.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Listing {
    pub id: i64,
    pub bedrooms: i64,
    pub bathrooms: i64,
    /// `None` renders as "Call for Price".
    pub price: Option<i64>,
    pub property_type: String,
    pub neighborhood: String,
    pub broker_fee: bool,
    pub posted_by: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bedroom_categories() -> serde_json::Value {
        json!({
            "group_by": "bedroom_tier",
            "buckets": [
                { "label": "Studio", "max": 3, "match": "bedrooms", "counts": [0] },
                { "label": "1 Bedroom", "max": 5, "match": "bedrooms", "counts": [1] },
                { "label": "4+ Bedrooms", "max": 5, "match": "bedrooms_at_least", "min": 4 }
            ]
        })
    }

    #[test]
    fn parses_tagged_template_kinds() {
        let raw = json!({
            "kind": "unsent_only",
            "filter": { "bedrooms": [0, 1], "lookback_days": 7 },
            "categories": bedroom_categories(),
            "format": "both"
        });
        let cfg = TemplateConfig::parse(&raw.to_string()).unwrap();
        assert_eq!(cfg.spec.kind_str(), "unsent_only");
        assert_eq!(cfg.spec.dedup_policy(), DedupPolicy::UnsentOnly);
        assert_eq!(cfg.spec.sort(), SortOrder::UpdatedDesc);
        assert_eq!(cfg.spec.categories().unwrap().buckets.len(), 3);
    }

    #[test]
    fn inverted_price_range_rejected() {
        let raw = json!({
            "kind": "custom_query",
            "filter": { "price_min": 1000, "price_max": 500 },
            "dedup": "ignore_history"
        });
        let err = TemplateConfig::parse(&raw.to_string()).unwrap_err();
        assert!(matches!(err, TemplateConfigError::Invalid(_)));
    }

    #[test]
    fn filter_links_requires_presets() {
        let raw = json!({ "kind": "filter_links", "preset_ids": [] });
        let err = TemplateConfig::parse(&raw.to_string()).unwrap_err();
        assert!(matches!(err, TemplateConfigError::Invalid(_)));
    }

    #[test]
    fn resend_policy_carries_days() {
        let raw = json!({
            "kind": "recent_by_category",
            "filter": {},
            "categories": bedroom_categories(),
            "resend_after_days": 14
        });
        let cfg = TemplateConfig::parse(&raw.to_string()).unwrap();
        assert_eq!(
            cfg.spec.dedup_policy(),
            DedupPolicy::AllowResendAfterDays { days: 14 }
        );
    }

    #[test]
    fn mismatched_bucket_rule_rejected() {
        let raw = json!({
            "kind": "custom_query",
            "filter": {},
            "categories": {
                "group_by": "property_type",
                "buckets": [ { "label": "Studio", "max": 3, "match": "bedrooms", "counts": [0] } ]
            },
            "dedup": "unsent_only"
        });
        let err = TemplateConfig::parse(&raw.to_string()).unwrap_err();
        assert!(matches!(err, TemplateConfigError::Invalid(_)));
    }

    #[test]
    fn config_roundtrips_for_snapshot() {
        let raw = json!({
            "kind": "mixed_layout",
            "preset_ids": [1, 2],
            "filter": { "neighborhoods": ["Williamsburg"] },
            "categories": bedroom_categories(),
            "dedup": { "allow_resend_after_days": { "days": 7 } },
            "header": "Daily rentals {date}",
            "empty_behavior": "send_notice"
        });
        let cfg = TemplateConfig::parse(&raw.to_string()).unwrap();
        let snapshot = serde_json::to_string(&cfg).unwrap();
        let back = TemplateConfig::parse(&snapshot).unwrap();
        assert_eq!(cfg, back);
    }
}
