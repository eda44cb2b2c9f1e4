//! HTTP source collector and the bounded, timeout-guarded fan-out over sources.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use url::Url;

use curator_shared::{CollectorConfig, CuratorError, RawItem, Result, SourceDescriptor, SourceKind};

use crate::{html, rss};

/// User-Agent string for source requests.
const USER_AGENT: &str = concat!("curator/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// SourceCollector
// ---------------------------------------------------------------------------

/// Fetches the raw items a single source published since a given instant.
///
/// Failures are scoped to the source; callers treat them as non-fatal.
#[async_trait]
pub trait SourceCollector: Send + Sync {
    async fn fetch(&self, source: &SourceDescriptor, since: DateTime<Utc>) -> Result<Vec<RawItem>>;
}

/// Collector for RSS/Atom feeds and HTML listing pages over HTTP.
pub struct HttpCollector {
    client: Client,
    /// Allow localhost/private IPs (for tests against mock servers).
    allow_localhost: bool,
}

impl HttpCollector {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| CuratorError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allow_localhost: false,
        })
    }

    /// Allow fetching localhost/private IPs (for integration tests).
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    async fn get_body(&self, source: &SourceDescriptor, url: &Url) -> Result<String> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| CuratorError::source(&source.id, format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CuratorError::source(&source.id, format!("{url}: HTTP {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| CuratorError::source(&source.id, format!("{url}: body read failed: {e}")))
    }
}

#[async_trait]
impl SourceCollector for HttpCollector {
    async fn fetch(&self, source: &SourceDescriptor, since: DateTime<Utc>) -> Result<Vec<RawItem>> {
        let url = Url::parse(&source.url)
            .map_err(|e| CuratorError::source(&source.id, format!("invalid url: {e}")))?;

        if !self.allow_localhost && is_ssrf_target(&url) {
            warn!(%url, source = %source.id, "SSRF protection: blocked");
            return Err(CuratorError::source(&source.id, "blocked by SSRF protection"));
        }

        debug!(%url, kind = ?source.kind, "fetching source");
        let body = self.get_body(source, &url).await?;

        match source.kind {
            SourceKind::Rss => rss::parse_feed(body.as_bytes(), source, since),
            SourceKind::Html => html::parse_listing(&body, &url, source, since),
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Limits applied by [`collect_all`].
#[derive(Debug, Clone, Copy)]
pub struct CollectLimits {
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_items_per_source: usize,
}

impl From<&CollectorConfig> for CollectLimits {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
            max_items_per_source: config.max_items_per_source,
        }
    }
}

/// How one source fared during collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Ok,
    Failed,
    TimedOut,
    Disabled,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Disabled => "disabled",
        }
    }
}

/// Per-source collection outcome.
#[derive(Debug, Clone)]
pub struct SourceOutcome {
    pub source_id: String,
    pub status: SourceStatus,
    pub item_count: usize,
    pub duration_ms: u64,
    pub error: Option<OutcomeError>,
}

/// Error recorded on a failed outcome.
#[derive(Debug, Clone)]
pub struct OutcomeError {
    pub kind: &'static str,
    pub message: String,
}

impl From<&CuratorError> for OutcomeError {
    fn from(err: &CuratorError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Items from every source plus one outcome per configured source.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub items: Vec<RawItem>,
    pub outcomes: Vec<SourceOutcome>,
}

impl Collection {
    /// Enabled sources that were attempted.
    pub fn attempted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status != SourceStatus::Disabled)
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == SourceStatus::Ok)
            .count()
    }
}

/// Fetch every enabled source concurrently. A source that fails or exceeds
/// `limits.timeout` is reported in its outcome and contributes no items.
/// Items are returned grouped in source order.
#[instrument(skip_all, fields(sources = sources.len(), since = %since))]
pub async fn collect_all(
    collector: Arc<dyn SourceCollector>,
    sources: &[SourceDescriptor],
    since: DateTime<Utc>,
    limits: CollectLimits,
) -> Collection {
    let semaphore = Arc::new(Semaphore::new(limits.concurrency.max(1)));
    let mut handles = Vec::with_capacity(sources.len());

    for source in sources {
        if !source.enabled {
            debug!(source = %source.id, "source disabled, skipping");
            handles.push((source.id.clone(), None));
            continue;
        }

        let source_id = source.id.clone();
        let collector = collector.clone();
        let sem = semaphore.clone();
        let source = source.clone();
        let timeout = limits.timeout;

        let handle = tokio::spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                let err = CuratorError::source(&source.id, "collector semaphore closed");
                return (Ok(Err(err)), Duration::ZERO);
            };
            let started = Instant::now();
            let result = tokio::time::timeout(timeout, collector.fetch(&source, since)).await;
            (result, started.elapsed())
        });
        handles.push((source_id, Some(handle)));
    }

    let mut collection = Collection::default();

    for (source_id, handle) in handles {
        let Some(handle) = handle else {
            collection.outcomes.push(SourceOutcome {
                source_id,
                status: SourceStatus::Disabled,
                item_count: 0,
                duration_ms: 0,
                error: None,
            });
            continue;
        };

        let outcome = match handle.await {
            Ok((Ok(Ok(mut items)), elapsed)) => {
                items.truncate(limits.max_items_per_source);
                let count = items.len();
                collection.items.extend(items);
                SourceOutcome {
                    source_id,
                    status: SourceStatus::Ok,
                    item_count: count,
                    duration_ms: elapsed.as_millis() as u64,
                    error: None,
                }
            }
            Ok((Ok(Err(e)), elapsed)) => {
                warn!(source = %source_id, error = %e, "source failed");
                SourceOutcome {
                    source_id,
                    status: SourceStatus::Failed,
                    item_count: 0,
                    duration_ms: elapsed.as_millis() as u64,
                    error: Some((&e).into()),
                }
            }
            Ok((Err(_), elapsed)) => {
                let e = CuratorError::source(
                    &source_id,
                    format!("timed out after {}s", limits.timeout.as_secs_f64()),
                );
                warn!(source = %source_id, "source timed out");
                SourceOutcome {
                    source_id,
                    status: SourceStatus::TimedOut,
                    item_count: 0,
                    duration_ms: elapsed.as_millis() as u64,
                    error: Some((&e).into()),
                }
            }
            Err(join_err) => {
                let e = CuratorError::source(&source_id, format!("task failed: {join_err}"));
                warn!(source = %source_id, error = %e, "source task failed");
                SourceOutcome {
                    source_id,
                    status: SourceStatus::Failed,
                    item_count: 0,
                    duration_ms: 0,
                    error: Some((&e).into()),
                }
            }
        };
        collection.outcomes.push(outcome);
    }

    info!(
        items = collection.items.len(),
        attempted = collection.attempted(),
        succeeded = collection.succeeded(),
        "collection completed"
    );
    collection
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub(crate) fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn descriptor(id: &str, kind: SourceKind, url: &str) -> SourceDescriptor {
        SourceDescriptor {
            id: id.into(),
            kind,
            url: url.into(),
            enabled: true,
            credibility: 1.0,
            item_selector: None,
            title_selector: None,
            link_selector: None,
            summary_selector: None,
        }
    }

    /// Scripted collector: "slow" sleeps, "broken" fails, others yield two items.
    struct ScriptedCollector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SourceCollector for ScriptedCollector {
        async fn fetch(&self, source: &SourceDescriptor, _since: DateTime<Utc>) -> Result<Vec<RawItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match source.id.as_str() {
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(vec![])
                }
                "broken" => Err(CuratorError::source("broken", "HTTP 500")),
                id => Ok((0..2)
                    .map(|i| RawItem {
                        source_id: id.to_string(),
                        title: format!("{id} item {i}"),
                        url: Some(format!("https://{id}.example.com/{i}")),
                        body: String::new(),
                        published_at: None,
                    })
                    .collect()),
            }
        }
    }

    #[test]
    fn ssrf_blocks_private_targets() {
        for url in [
            "file:///etc/passwd",
            "http://192.168.1.1/admin",
            "http://10.0.0.1/",
            "http://127.0.0.1:8080/",
            "http://localhost:3000/feed",
            "http://[::1]/feed",
        ] {
            assert!(is_ssrf_target(&Url::parse(url).unwrap()), "{url}");
        }
        assert!(!is_ssrf_target(&Url::parse("https://news.example.com/rss").unwrap()));
    }

    #[tokio::test]
    async fn slow_and_broken_sources_fail_alone() {
        let collector = Arc::new(ScriptedCollector {
            calls: AtomicUsize::new(0),
        });
        let mut disabled = descriptor("off", SourceKind::Rss, "https://off.example.com");
        disabled.enabled = false;
        let sources = vec![
            descriptor("alpha", SourceKind::Rss, "https://alpha.example.com"),
            descriptor("slow", SourceKind::Rss, "https://slow.example.com"),
            descriptor("broken", SourceKind::Rss, "https://broken.example.com"),
            descriptor("beta", SourceKind::Html, "https://beta.example.com"),
            disabled,
        ];
        let limits = CollectLimits {
            concurrency: 2,
            timeout: Duration::from_millis(100),
            max_items_per_source: 1,
        };

        let collection = collect_all(collector.clone(), &sources, Utc::now(), limits).await;

        let statuses: Vec<_> = collection.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![
                SourceStatus::Ok,
                SourceStatus::TimedOut,
                SourceStatus::Failed,
                SourceStatus::Ok,
                SourceStatus::Disabled
            ]
        );
        // Capped per source, ordered by source.
        assert_eq!(collection.items.len(), 2);
        assert_eq!(collection.items[0].source_id, "alpha");
        assert_eq!(collection.items[1].source_id, "beta");
        assert_eq!(collection.attempted(), 4);
        assert_eq!(collection.succeeded(), 2);
        assert_eq!(collector.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn http_collector_blocks_localhost_by_default() {
        let collector = HttpCollector::new(Duration::from_secs(5)).unwrap();
        let source = descriptor("local", SourceKind::Rss, "http://127.0.0.1:9/feed");
        let err = collector.fetch(&source, Utc::now()).await.unwrap_err();
        assert!(err.to_string().contains("SSRF"));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn http_collector_reports_http_errors() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::path("/feed"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let collector = HttpCollector::new(Duration::from_secs(5))
            .unwrap()
            .allow_localhost();
        let source = descriptor("down", SourceKind::Rss, &format!("{}/feed", server.uri()));
        let err = collector.fetch(&source, Utc::now()).await.unwrap_err();
        assert!(matches!(err, CuratorError::Source { .. }));
        assert!(err.to_string().contains("503"));
    }
}
