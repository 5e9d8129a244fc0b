use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use tracing::{info, warn};

use common::{SourceConfig, SourceKind};

use crate::article::ArticleRef;

pub mod html;
pub mod json_api;
pub mod rss;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("listing fetch failed with status: {0}")]
    Status(u16),

    #[error("cannot parse listing: {0}")]
    Parse(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// One content origin
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Up to `limit` recent articles, newest first. Articles with a known
    /// publication date older than `since` are left out.
    async fn fetch_recent(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ArticleRef>, FetchError>;
}

/// HTTP access shared by the bundled adapters: one client plus the retry
/// policy for listing requests.
#[derive(Clone)]
pub struct SourceHttp {
    client: Client,
    max_attempts: u32,
    backoff_base: Duration,
}

impl SourceHttp {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("dailyreport/0.1.0")
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client, max_attempts: 3, backoff_base: Duration::from_secs(1) })
    }

    pub fn with_retries(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff_base = backoff_base;
        self
    }

    /// GET `url`, retrying network errors, 5xx and 429 with exponential backoff.
    /// Other 4xx answers are permanent.
    pub async fn get_bytes(&self, origin: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let backoff = self.backoff_base * 2u32.pow(attempt - 2);
                info!(origin, "Retrying fetch of {} (attempt {}/{}) after {:?}...", url, attempt, self.max_attempts, backoff);
                tokio::time::sleep(backoff).await;
            }

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let bytes = response
                            .bytes()
                            .await
                            .map_err(|e| FetchError::Transport(format!("failed to read response body: {}", e)))?;
                        return Ok(bytes.to_vec());
                    } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        last_error = Some(FetchError::Status(status.as_u16()));
                    } else {
                        return Err(FetchError::Status(status.as_u16()));
                    }
                }
                Err(e) => {
                    last_error = Some(FetchError::Transport(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::Transport("no attempt made".to_string())))
    }
}

/// Stable newest-first order. Undated entries keep their listing order after
/// the dated ones.
pub fn order_newest_first(articles: &mut [ArticleRef]) {
    articles.sort_by(|a, b| match (a.published_at, b.published_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

/// Result of fanning out over every origin
#[derive(Debug, Default)]
pub struct SourceBatch {
    /// Articles of all successful origins, in priority order
    pub articles: Vec<ArticleRef>,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, FetchError)>,
}

impl SourceBatch {
    pub fn all_failed(&self) -> bool {
        self.succeeded.is_empty()
    }
}

/// Query every adapter concurrently, each under its own timeout. A failing
/// origin is logged and skipped. Output is grouped by adapter in slice order
/// (the source priority), each group newest first and cut to `limit`.
pub async fn fetch_all(
    adapters: &[Arc<dyn SourceAdapter>],
    limit: usize,
    since: Option<DateTime<Utc>>,
    timeout: Duration,
) -> SourceBatch {
    let calls = adapters.iter().map(|adapter| async move {
        let outcome = match tokio::time::timeout(timeout, adapter.fetch_recent(limit, since)).await {
            Ok(r) => r,
            Err(_) => Err(FetchError::Timeout(timeout)),
        };
        (adapter.id().to_string(), outcome)
    });

    let mut batch = SourceBatch::default();
    for (origin, outcome) in join_all(calls).await {
        match outcome {
            Ok(mut articles) => {
                if let Some(since) = since {
                    articles.retain(|a| a.published_at.map_or(true, |p| p >= since));
                }
                order_newest_first(&mut articles);
                articles.truncate(limit);
                info!(origin = %origin, "fetched {} article(s)", articles.len());
                batch.articles.extend(articles);
                batch.succeeded.push(origin);
            }
            Err(e) => {
                warn!(origin = %origin, stage = "fetch", "source failed: {}", e);
                batch.failed.push((origin, e));
            }
        }
    }
    batch
}

/// Build the adapters described by `[[sources]]`, keeping their order.
pub fn from_config(sources: &[SourceConfig], http: &SourceHttp) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    sources
        .iter()
        .map(|cfg| -> Result<Arc<dyn SourceAdapter>> {
            let adapter: Arc<dyn SourceAdapter> = match cfg.kind {
                SourceKind::Rss => Arc::new(rss::RssSource::new(&cfg.id, &cfg.url, http.clone())),
                SourceKind::Html => Arc::new(
                    html::HtmlListingSource::new(&cfg.id, &cfg.url, &cfg.selectors, http.clone())
                        .with_context(|| format!("invalid html source {}", cfg.id))?,
                ),
                SourceKind::Json => Arc::new(
                    json_api::JsonApiSource::from_config(cfg, http.clone())
                        .with_context(|| format!("invalid json source {}", cfg.id))?,
                ),
            };
            Ok(adapter)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        id: &'static str,
        result: Result<Vec<ArticleRef>, FetchError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SourceAdapter for Fixed {
        fn id(&self) -> &str {
            self.id
        }

        async fn fetch_recent(&self, _: usize, _: Option<DateTime<Utc>>) -> Result<Vec<ArticleRef>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    fn fixed(id: &'static str, result: Result<Vec<ArticleRef>, FetchError>) -> Arc<Fixed> {
        Arc::new(Fixed { id, result, delay: Duration::ZERO, calls: AtomicUsize::new(0) })
    }

    fn dated(origin: &str, n: u32, hour: Option<u32>) -> ArticleRef {
        let published = hour.map(|h| Utc.with_ymd_and_hms(2026, 10, 16, h, 0, 0).unwrap());
        ArticleRef::new(origin, &format!("https://{}.example/{}", origin, n), format!("{} {}", origin, n), published)
            .unwrap()
    }

    #[test]
    fn newest_first_keeps_undated_in_listing_order() {
        let mut list = vec![dated("a", 1, None), dated("a", 2, Some(8)), dated("a", 3, None), dated("a", 4, Some(9))];
        order_newest_first(&mut list);
        let ids: Vec<_> = list.iter().map(|a| a.url.rsplit('/').next().unwrap().to_string()).collect();
        assert_eq!(ids, vec!["4", "2", "1", "3"]);
    }

    #[tokio::test]
    async fn one_failing_source_leaves_the_others() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            fixed("a", Ok(vec![dated("a", 1, Some(8)), dated("a", 2, Some(10))])),
            fixed("b", Err(FetchError::Status(503))),
            fixed("c", Ok(vec![dated("c", 1, Some(9))])),
        ];

        let batch = fetch_all(&adapters, 10, None, Duration::from_secs(1)).await;
        assert_eq!(batch.succeeded, vec!["a", "c"]);
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.failed[0].0, "b");
        let origins: Vec<_> = batch.articles.iter().map(|a| a.origin.as_str()).collect();
        assert_eq!(origins, vec!["a", "a", "c"]);
        assert_eq!(batch.articles[0].url, "https://a.example/2");
    }

    #[tokio::test]
    async fn slow_source_times_out_independently() {
        let slow = Arc::new(Fixed {
            id: "slow",
            result: Ok(vec![dated("slow", 1, None)]),
            delay: Duration::from_secs(5),
            calls: AtomicUsize::new(0),
        });
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![slow, fixed("fast", Ok(vec![dated("fast", 1, None)]))];

        let batch = fetch_all(&adapters, 10, None, Duration::from_millis(50)).await;
        assert_eq!(batch.succeeded, vec!["fast"]);
        assert!(matches!(batch.failed[0].1, FetchError::Timeout(_)));
    }

    #[tokio::test]
    async fn limit_and_since_are_applied() {
        let since = Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap();
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![fixed(
            "a",
            Ok(vec![dated("a", 1, Some(8)), dated("a", 2, Some(10)), dated("a", 3, Some(11)), dated("a", 4, None)]),
        )];

        let batch = fetch_all(&adapters, 2, Some(since), Duration::from_secs(1)).await;
        let urls: Vec<_> = batch.articles.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.example/3", "https://a.example/2"]);
    }

    #[tokio::test]
    async fn all_failing_is_reported() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![fixed("a", Err(FetchError::Parse("bad xml".into())))];
        let batch = fetch_all(&adapters, 10, None, Duration::from_secs(1)).await;
        assert!(batch.all_failed());
        assert!(batch.articles.is_empty());
    }
}
