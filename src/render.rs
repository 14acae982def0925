//! Digest rendering: plain text (WhatsApp-friendly) and HTML email bodies.
//!
//! Rendering is pure: identical inputs produce byte-identical output, so a
//! dry-run preview is exactly the message a real send would carry. The run
//! date only appears when the header text contains a `{date}` token, which
//! the pipeline substitutes before calling in.

use serde::Serialize;

use crate::model::{Listing, OutputFormat};

/// Collection CTA block with its live count at render time.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionBlock {
    pub label: String,
    pub count: i64,
    pub url: String,
}

/// A labeled group of listing entries, each paired with its link.
#[derive(Debug, Clone)]
pub struct RenderBucket {
    pub label: String,
    pub entries: Vec<(Listing, String)>,
}

#[derive(Debug, Clone)]
pub struct RenderInput<'a> {
    pub header: &'a str,
    pub footer: &'a str,
    /// Shown instead of listing content when there is nothing to list.
    pub empty_notice: Option<&'a str>,
    pub collections: &'a [CollectionBlock],
    pub buckets: &'a [RenderBucket],
    pub format: OutputFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub plain: String,
    pub html: Option<String>,
}

impl RenderedMessage {
    pub fn line_count(&self) -> usize {
        self.plain.lines().count()
    }

    pub fn char_count(&self) -> usize {
        self.plain.chars().count()
    }
}

/// Collection counts under 10 are exact; 10 and up round down to the nearest
/// multiple of 5 with a trailing "+", so a live, changing count never implies
/// false precision.
pub fn display_count(n: i64) -> String {
    if n < 10 {
        n.to_string()
    } else {
        format!("{}+", (n / 5) * 5)
    }
}

pub fn format_price(price: Option<i64>) -> String {
    match price {
        None => "Call for Price".to_string(),
        Some(p) => format!("${}", thousands(p)),
    }
}

fn thousands(mut n: i64) -> String {
    let negative = n < 0;
    n = n.abs();
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    if negative {
        format!("-{}", out)
    } else {
        out
    }
}

fn bed_label(bedrooms: i64) -> String {
    if bedrooms == 0 {
        "Studio".to_string()
    } else {
        format!("{}BR", bedrooms)
    }
}

fn fee_label(broker_fee: bool) -> &'static str {
    if broker_fee {
        "Broker Fee"
    } else {
        "No Fee"
    }
}

/// One listing as a single spec line: price, beds/baths, fee, location, poster.
fn listing_specs(listing: &Listing) -> String {
    format!(
        "{} | {}/{}BA | {} | {} | {}",
        format_price(listing.price),
        bed_label(listing.bedrooms),
        listing.bathrooms,
        fee_label(listing.broker_fee),
        listing.neighborhood,
        listing.posted_by
    )
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_plain(input: &RenderInput<'_>) -> String {
    let mut out = String::new();
    out.push_str(input.header);
    out.push('\n');

    for collection in input.collections {
        out.push('\n');
        out.push_str(&format!(
            "{} ({} listings)\n  {}\n",
            collection.label,
            display_count(collection.count),
            collection.url
        ));
    }

    let has_listings = input.buckets.iter().any(|b| !b.entries.is_empty());
    if has_listings {
        for bucket in input.buckets {
            if bucket.entries.is_empty() {
                continue;
            }
            out.push('\n');
            out.push_str(&bucket.label);
            out.push('\n');
            for (listing, url) in &bucket.entries {
                out.push_str(&format!("- {}\n  {}\n", listing_specs(listing), url));
            }
        }
    } else if input.collections.is_empty() {
        if let Some(notice) = input.empty_notice {
            out.push('\n');
            out.push_str(notice);
            out.push('\n');
        }
    }

    out.push('\n');
    out.push_str(input.footer);
    out.push('\n');
    out
}

fn render_html(input: &RenderInput<'_>) -> String {
    let mut out = String::new();
    out.push_str("<html><body>\n");
    out.push_str(&format!("<p>{}</p>\n", html_escape(input.header)));

    if !input.collections.is_empty() {
        out.push_str("<ul>\n");
        for collection in input.collections {
            out.push_str(&format!(
                "<li><a href=\"{}\">{}</a> ({} listings)</li>\n",
                html_escape(&collection.url),
                html_escape(&collection.label),
                display_count(collection.count)
            ));
        }
        out.push_str("</ul>\n");
    }

    let has_listings = input.buckets.iter().any(|b| !b.entries.is_empty());
    if has_listings {
        for bucket in input.buckets {
            if bucket.entries.is_empty() {
                continue;
            }
            out.push_str(&format!("<h3>{}</h3>\n<ul>\n", html_escape(&bucket.label)));
            for (listing, url) in &bucket.entries {
                out.push_str(&format!(
                    "<li><a href=\"{}\">{}</a></li>\n",
                    html_escape(url),
                    html_escape(&listing_specs(listing))
                ));
            }
            out.push_str("</ul>\n");
        }
    } else if input.collections.is_empty() {
        if let Some(notice) = input.empty_notice {
            out.push_str(&format!("<p>{}</p>\n", html_escape(notice)));
        }
    }

    out.push_str(&format!("<p>{}</p>\n", html_escape(input.footer)));
    out.push_str("</body></html>\n");
    out
}

/// Compose the digest. Structure is fixed: header, collection CTA blocks,
/// categorized listing blocks, footer.
pub fn render(input: &RenderInput<'_>) -> RenderedMessage {
    let plain = render_plain(input);
    let html = match input.format {
        OutputFormat::PlainText => None,
        OutputFormat::Html | OutputFormat::Both => Some(render_html(input)),
    };
    RenderedMessage { plain, html }
}
