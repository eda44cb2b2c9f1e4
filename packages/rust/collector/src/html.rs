//! HTML listing pages scraped with CSS selectors.

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use curator_shared::{CuratorError, RawItem, Result, SourceDescriptor};

const DEFAULT_ITEM_SELECTOR: &str = "article";
const DEFAULT_TITLE_SELECTOR: &str = "h1, h2, h3";
const DEFAULT_LINK_SELECTOR: &str = "a[href]";
const DEFAULT_SUMMARY_SELECTOR: &str = "p";

/// Extract one raw item per listing entry. Entries with no title are skipped;
/// entries carrying a `<time datetime>` older than `since` are dropped.
pub fn parse_listing(
    body: &str,
    base_url: &Url,
    source: &SourceDescriptor,
    since: DateTime<Utc>,
) -> Result<Vec<RawItem>> {
    let item_sel = selector(source, source.item_selector.as_deref(), DEFAULT_ITEM_SELECTOR)?;
    let title_sel = selector(source, source.title_selector.as_deref(), DEFAULT_TITLE_SELECTOR)?;
    let link_sel = selector(source, source.link_selector.as_deref(), DEFAULT_LINK_SELECTOR)?;
    let summary_sel =
        selector(source, source.summary_selector.as_deref(), DEFAULT_SUMMARY_SELECTOR)?;
    let time_sel = selector(source, None, "time[datetime]")?;

    let doc = Html::parse_document(body);
    let mut items = Vec::new();
    let mut seen = 0usize;

    for entry in doc.select(&item_sel) {
        seen += 1;
        let Some(title) = entry.select(&title_sel).next().map(element_text) else {
            continue;
        };
        if title.is_empty() {
            continue;
        }

        let published_at = entry
            .select(&time_sel)
            .next()
            .and_then(|t| t.value().attr("datetime"))
            .and_then(|dt| DateTime::parse_from_rfc3339(dt).ok())
            .map(|dt| dt.with_timezone(&Utc));
        if published_at.is_some_and(|at| at < since) {
            continue;
        }

        let url = entry
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| base_url.join(href).ok())
            .map(|u| u.to_string());

        let body = entry
            .select(&summary_sel)
            .next()
            .map(|s| html_to_text(&s.inner_html()))
            .unwrap_or_default();

        items.push(RawItem {
            source_id: source.id.clone(),
            title,
            url,
            body,
            published_at,
        });
    }

    debug!(source = %source.id, entries = seen, kept = items.len(), "listing parsed");
    Ok(items)
}

fn selector(source: &SourceDescriptor, configured: Option<&str>, default: &str) -> Result<Selector> {
    let css = configured.unwrap_or(default);
    Selector::parse(css)
        .map_err(|e| CuratorError::source(&source.id, format!("invalid selector '{css}': {e:?}")))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Convert an HTML fragment to readable text (Markdown-flavoured).
pub(crate) fn html_to_text(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "nav", "iframe", "noscript", "svg", "img"])
        .build();

    match converter.convert(html) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            debug!(error = %e, "htmd conversion failed, falling back to plain text");
            let fragment = Html::parse_fragment(html);
            element_text(fragment.root_element())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curator_shared::SourceKind;

    fn source() -> SourceDescriptor {
        SourceDescriptor {
            id: "launches".into(),
            kind: SourceKind::Html,
            url: "https://launches.example.com/".into(),
            enabled: true,
            credibility: 1.0,
            item_selector: None,
            title_selector: None,
            link_selector: None,
            summary_selector: None,
        }
    }

    const LISTING: &str = r#"<html><body><main>
        <article>
          <h2>Gamma unveils   edge AI chip</h2>
          <a href="/posts/gamma-chip">Read</a>
          <p>Gamma <em>unveils</em> a chip for on-device models.</p>
          <time datetime="2026-10-18T08:00:00Z">Oct 18</time>
        </article>
        <article>
          <h2>Stale story</h2>
          <a href="/posts/stale">Read</a>
          <time datetime="2026-09-01T08:00:00Z">Sep 1</time>
        </article>
        <article><p>No heading here</p></article>
    </main></body></html>"#;

    #[test]
    fn extracts_entries_with_defaults() {
        let base = Url::parse("https://launches.example.com/").unwrap();
        let since = DateTime::parse_from_rfc3339("2026-10-12T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let items = parse_listing(LISTING, &base, &source(), since).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Gamma unveils edge AI chip");
        assert_eq!(
            items[0].url.as_deref(),
            Some("https://launches.example.com/posts/gamma-chip")
        );
        assert!(items[0].body.contains("on-device models"));
        assert!(items[0].published_at.is_some());
    }

    #[test]
    fn custom_selectors() {
        let html = r#"<ul>
            <li class="post"><span class="t">Delta raises Series A</span>
              <a class="go" href="https://delta.example.com/news">x</a>
              <div class="s">Delta raised funding.</div></li>
        </ul>"#;
        let mut src = source();
        src.item_selector = Some("li.post".into());
        src.title_selector = Some("span.t".into());
        src.link_selector = Some("a.go".into());
        src.summary_selector = Some("div.s".into());

        let base = Url::parse("https://launches.example.com/").unwrap();
        let items = parse_listing(html, &base, &src, Utc::now()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Delta raises Series A");
        assert_eq!(items[0].url.as_deref(), Some("https://delta.example.com/news"));
        assert_eq!(items[0].body, "Delta raised funding.");
    }

    #[test]
    fn invalid_selector_is_source_error() {
        let mut src = source();
        src.item_selector = Some("<<<".into());
        let base = Url::parse("https://launches.example.com/").unwrap();
        let err = parse_listing("<html></html>", &base, &src, Utc::now()).unwrap_err();
        assert!(matches!(err, CuratorError::Source { .. }));
    }
}
