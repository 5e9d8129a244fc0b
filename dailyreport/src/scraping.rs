use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, warn};

use crate::article::{ArticleContent, ArticleRef, ExtractionStatus};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractionError {
    #[error("failed to fetch article page: {0}")]
    Fetch(String),

    #[error("article fetch failed with status: {0}")]
    Status(u16),

    #[error("readability failed: {0}")]
    Readability(String),

    #[error("content too short after cleanup ({chars} chars)")]
    TooShort { chars: usize },

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Pulls the prose of one article, ready for summarization
#[async_trait::async_trait]
pub trait ArticleExtractor: Send + Sync {
    async fn extract(&self, article: &ArticleRef) -> Result<ArticleContent, ExtractionError>;
}

/// Readability over the fetched page, converted to plain text.
///
/// When the listing already shipped a long enough body (full-content feeds)
/// the page is not fetched at all.
pub struct ReadabilityExtractor {
    client: Client,
    min_chars: usize,
}

impl ReadabilityExtractor {
    pub fn new(timeout: Duration, min_chars: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("dailyreport/0.1.0")
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client, min_chars })
    }

    fn long_enough(&self, text: &str) -> bool {
        text.chars().count() >= self.min_chars
    }

    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, ExtractionError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExtractionError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Status(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExtractionError::Fetch(format!("failed to read response body: {}", e)))?;
        Ok(bytes.to_vec())
    }
}

/// HTML fragment to wrapped plain text with blank-line runs collapsed
pub fn html_to_text(html: &str) -> String {
    let text = html2text::from_read(html.as_bytes(), 80).unwrap_or_else(|_| html.to_string());
    clean_text(&text)
}

fn clean_text(text: &str) -> String {
    let mut out = String::new();
    let mut blank = false;
    for line in text.lines().map(str::trim_end) {
        if line.trim().is_empty() {
            blank = !out.is_empty();
            continue;
        }
        if blank {
            out.push('\n');
            blank = false;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

#[async_trait::async_trait]
impl ArticleExtractor for ReadabilityExtractor {
    async fn extract(&self, article: &ArticleRef) -> Result<ArticleContent, ExtractionError> {
        if let Some(excerpt) = &article.excerpt {
            let body = html_to_text(excerpt);
            if self.long_enough(&body) {
                debug!(url = %article.url, "using listing excerpt ({} chars)", body.chars().count());
                return Ok(ArticleContent {
                    article: article.clone(),
                    body,
                    status: ExtractionStatus::FromExcerpt,
                });
            }
        }

        let bytes = self.fetch_page(&article.url).await?;
        let url_obj = url::Url::parse(&article.url).map_err(|e| ExtractionError::Fetch(e.to_string()))?;

        // Readability requires a Reader
        let mut reader = Cursor::new(bytes);
        let product = readability::extractor::extract(&mut reader, &url_obj)
            .map_err(|e| ExtractionError::Readability(e.to_string()))?;

        let mut body = html_to_text(&product.content);
        if body.is_empty() {
            body = clean_text(&product.text);
        }

        let chars = body.chars().count();
        if !self.long_enough(&body) {
            return Err(ExtractionError::TooShort { chars });
        }

        debug!(url = %article.url, "readability extracted {} chars", chars);
        Ok(ArticleContent {
            article: article.clone(),
            body,
            status: ExtractionStatus::Extracted,
        })
    }
}

/// Extract every article with at most `concurrency` page fetches at once,
/// each under `timeout`. Failures are logged and dropped; survivors keep
/// their input order.
pub async fn extract_all(
    extractor: &dyn ArticleExtractor,
    articles: Vec<ArticleRef>,
    concurrency: usize,
    timeout: Duration,
) -> Vec<ArticleContent> {
    let results: Vec<(ArticleRef, Result<ArticleContent, ExtractionError>)> = stream::iter(articles)
        .map(|article| async move {
            let result = match tokio::time::timeout(timeout, extractor.extract(&article)).await {
                Ok(r) => r,
                Err(_) => Err(ExtractionError::Timeout(timeout)),
            };
            (article, result)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    results
        .into_iter()
        .filter_map(|(article, result)| match result {
            Ok(content) => Some(content),
            Err(e) => {
                warn!(origin = %article.origin, url = %article.url, stage = "extract", "dropping article: {}", e);
                None
            }
        })
        .collect()
}
