//! Short-link minting client, consumed best-effort.
//!
//! Each mint call is independent; a failure falls back to the long URL for
//! that one link while the run continues. A digest with a few long URLs is
//! strictly better than no digest.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

use crate::model::Listing;

#[async_trait]
pub trait ShortLinker: Send + Sync {
    /// Mint (or reuse) a tracked short URL for `original_url`.
    async fn mint(&self, original_url: &str, listing_id: Option<i64>) -> Result<String>;
}

#[derive(Clone)]
pub struct ShortLinkClient {
    http: Client,
    api_url: Url,
    public_base: String,
    source_tag: String,
}

impl fmt::Debug for ShortLinkClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShortLinkClient")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

impl ShortLinkClient {
    pub fn new(api_url: &str, source_tag: &str) -> Result<Self> {
        let api_url = Url::parse(api_url).context("invalid shortlink.api_url")?;
        let public_base = format!(
            "{}://{}",
            api_url.scheme(),
            api_url.host_str().unwrap_or_default()
        );
        let http = Client::builder()
            .user_agent("rental-digest/0.1")
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            api_url,
            public_base,
            source_tag: source_tag.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct MintResponse {
    short_code: String,
}

#[async_trait]
impl ShortLinker for ShortLinkClient {
    async fn mint(&self, original_url: &str, listing_id: Option<i64>) -> Result<String> {
        let body = json!({
            "original_url": original_url,
            "source": self.source_tag,
            "listing_id": listing_id,
        });
        let res = self
            .http
            .post(self.api_url.clone())
            .json(&body)
            .send()
            .await
            .context("failed to reach shortlink service")?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("shortlink error {}: {}", status, text));
        }
        let payload: MintResponse = res
            .json()
            .await
            .context("invalid shortlink response JSON")?;
        Ok(format!("{}/{}", self.public_base, payload.short_code))
    }
}

/// Long-form URL for a listing, used when minting is unavailable or fails.
pub fn long_listing_url(site_base: &str, listing_id: i64) -> String {
    format!("{}/listing/{}", site_base.trim_end_matches('/'), listing_id)
}

/// Mint short links for all listings in a run with bounded parallelism.
/// Returns a listing-id -> URL map; failed mints map to the long URL.
pub async fn mint_listing_links(
    linker: Option<&dyn ShortLinker>,
    site_base: &str,
    listings: &[&Listing],
    concurrency: usize,
) -> HashMap<i64, String> {
    let targets: Vec<(i64, String)> = listings
        .iter()
        .map(|l| (l.id, long_listing_url(site_base, l.id)))
        .collect();
    let Some(linker) = linker else {
        return targets.into_iter().collect();
    };

    stream::iter(targets)
        .map(|(id, long_url)| async move {
            match linker.mint(&long_url, Some(id)).await {
                Ok(short) => (id, short),
                Err(err) => {
                    warn!(?err, listing_id = id, "shortlink mint failed; using long URL");
                    (id, long_url)
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

/// Resolve the CTA link for a collection preset: pre-minted short URL if
/// present, otherwise a fresh mint, otherwise the preset's long search URL.
pub async fn collection_link(
    linker: Option<&dyn ShortLinker>,
    short_url: Option<&str>,
    search_url: &str,
) -> String {
    if let Some(short) = short_url {
        return short.to_string();
    }
    if let Some(linker) = linker {
        match linker.mint(search_url, None).await {
            Ok(short) => return short,
            Err(err) => {
                warn!(?err, search_url, "shortlink mint failed for collection; using long URL");
            }
        }
    }
    search_url.to_string()
}
