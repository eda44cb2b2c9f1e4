//! RSS / Atom / JSON Feed parsing.

use chrono::{DateTime, Utc};
use tracing::debug;

use curator_shared::{CuratorError, RawItem, Result, SourceDescriptor};

use crate::html::html_to_text;

/// Parse a feed document into raw items published at or after `since`.
/// Entries without a publish date are kept.
pub fn parse_feed(
    bytes: &[u8],
    source: &SourceDescriptor,
    since: DateTime<Utc>,
) -> Result<Vec<RawItem>> {
    let feed = feed_rs::parser::parse(bytes)
        .map_err(|e| CuratorError::source(&source.id, format!("failed to parse feed: {e}")))?;

    let total = feed.entries.len();
    let items: Vec<RawItem> = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let published_at = entry.published.or(entry.updated);
            if published_at.is_some_and(|at| at < since) {
                return None;
            }

            let title = entry.title.map(|t| t.content.trim().to_string())?;
            if title.is_empty() {
                return None;
            }

            let url = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()));

            let body_html = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default();

            Some(RawItem {
                source_id: source.id.clone(),
                title,
                url,
                body: html_to_text(&body_html),
                published_at,
            })
        })
        .collect();

    debug!(source = %source.id, total, kept = items.len(), "feed parsed");
    Ok(items)
}
