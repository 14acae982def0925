//! Dynamic listing SELECT construction.
//!
//! Translates a validated [`FilterConfig`] into SQL: predicates AND together,
//! set-valued fields expand to IN lists, and unapproved or inactive listings
//! are always excluded. Callers validate the filter shape before building;
//! this module assumes a well-formed filter.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

use crate::model::{FilterConfig, SortOrder};

const LISTING_COLUMNS: &str = "id, bedrooms, bathrooms, price, property_type, \
     neighborhood, broker_fee, posted_by, updated_at";

/// Build the candidate-selection query for a pipeline run.
pub fn listing_select(
    filter: &FilterConfig,
    sort: SortOrder,
    cutoff: Option<DateTime<Utc>>,
) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new(format!(
        "SELECT {LISTING_COLUMNS} FROM listings WHERE approved = 1 AND active = 1"
    ));
    push_predicates(&mut qb, filter, cutoff);
    qb.push(order_clause(sort));
    qb
}

/// Build the live-count query used for collection CTA blocks.
pub fn listing_count(
    filter: &FilterConfig,
    cutoff: Option<DateTime<Utc>>,
) -> QueryBuilder<'static, Sqlite> {
    let mut qb =
        QueryBuilder::new("SELECT COUNT(*) FROM listings WHERE approved = 1 AND active = 1");
    push_predicates(&mut qb, filter, cutoff);
    qb
}

fn push_predicates(
    qb: &mut QueryBuilder<'static, Sqlite>,
    filter: &FilterConfig,
    cutoff: Option<DateTime<Utc>>,
) {
    if let Some(bedrooms) = &filter.bedrooms {
        qb.push(" AND bedrooms IN (");
        let mut separated = qb.separated(", ");
        for count in bedrooms {
            separated.push_bind(*count);
        }
        separated.push_unseparated(")");
    }
    if let Some(min) = filter.price_min {
        qb.push(" AND price >= ").push_bind(min);
    }
    if let Some(max) = filter.price_max {
        qb.push(" AND price <= ").push_bind(max);
    }
    if let Some(types) = &filter.property_types {
        qb.push(" AND property_type IN (");
        let mut separated = qb.separated(", ");
        for t in types {
            separated.push_bind(t.clone());
        }
        separated.push_unseparated(")");
    }
    if let Some(hoods) = &filter.neighborhoods {
        qb.push(" AND neighborhood IN (");
        let mut separated = qb.separated(", ");
        for n in hoods {
            separated.push_bind(n.clone());
        }
        separated.push_unseparated(")");
    }
    if let Some(fee) = filter.broker_fee {
        qb.push(" AND broker_fee = ").push_bind(fee);
    }
    if let Some(cutoff) = cutoff {
        qb.push(" AND datetime(updated_at) >= datetime(")
            .push_bind(cutoff)
            .push(")");
    }
}

fn order_clause(sort: SortOrder) -> &'static str {
    // Call-for-price rows (NULL price) sort after priced rows.
    match sort {
        SortOrder::UpdatedDesc => " ORDER BY updated_at DESC, id DESC",
        SortOrder::PriceAsc => " ORDER BY price IS NULL, price ASC, updated_at DESC",
        SortOrder::PriceDesc => " ORDER BY price IS NULL, price DESC, updated_at DESC",
        SortOrder::BedsAsc => " ORDER BY bedrooms ASC, updated_at DESC",
        SortOrder::BedsDesc => " ORDER BY bedrooms DESC, updated_at DESC",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconstrained_filter_only_gates_on_visibility() {
        let qb = listing_select(&FilterConfig::default(), SortOrder::UpdatedDesc, None);
        let sql = qb.sql();
        assert!(sql.contains("approved = 1 AND active = 1"));
        assert!(!sql.contains("bedrooms IN"));
        assert!(sql.ends_with("ORDER BY updated_at DESC, id DESC"));
    }

    #[test]
    fn set_fields_expand_to_in_lists() {
        let filter = FilterConfig {
            bedrooms: Some(vec![1, 2]),
            property_types: Some(vec!["apartment".into(), "condo".into()]),
            ..Default::default()
        };
        let qb = listing_select(&filter, SortOrder::PriceAsc, None);
        let sql = qb.sql();
        assert!(sql.contains("bedrooms IN (?, ?)"));
        assert!(sql.contains("property_type IN (?, ?)"));
        assert!(sql.contains("ORDER BY price IS NULL, price ASC"));
    }

    #[test]
    fn cutoff_and_fee_become_predicates() {
        let filter = FilterConfig {
            broker_fee: Some(false),
            ..Default::default()
        };
        let qb = listing_select(&filter, SortOrder::UpdatedDesc, Some(Utc::now()));
        let sql = qb.sql();
        assert!(sql.contains("broker_fee = ?"));
        assert!(sql.contains("datetime(updated_at) >= datetime(?)"));
    }

    #[test]
    fn count_query_has_no_ordering() {
        let qb = listing_count(&FilterConfig::default(), None);
        assert!(qb.sql().starts_with("SELECT COUNT(*)"));
        assert!(!qb.sql().contains("ORDER BY"));
    }
}
