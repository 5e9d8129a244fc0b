use std::collections::HashSet;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use super::{FetchError, SourceAdapter, SourceHttp};
use crate::article::ArticleRef;

/// Origin without a feed: article links are picked from a listing page with
/// CSS selectors. Listings carry no dates, so page order stands for recency.
pub struct HtmlListingSource {
    id: String,
    url: Url,
    links: Selector,
    http: SourceHttp,
}

impl HtmlListingSource {
    pub fn new(id: impl Into<String>, url: &str, selectors: &[String], http: SourceHttp) -> Result<Self> {
        if selectors.is_empty() {
            return Err(anyhow!("no link selectors given"));
        }
        // One selector group, so matches come back in document order
        let group = selectors.join(", ");
        let links = Selector::parse(&group).map_err(|e| anyhow!("invalid selector '{}': {:?}", group, e))?;
        let url = Url::parse(url)?;
        Ok(Self { id: id.into(), url, links, http })
    }

    /// Collect up to `limit` distinct links with non-empty text.
    pub fn parse_listing(&self, page: &str, limit: usize) -> Vec<ArticleRef> {
        let document = Html::parse_document(page);
        let mut seen = HashSet::new();
        let mut articles = Vec::new();

        for element in document.select(&self.links) {
            if articles.len() >= limit {
                break;
            }
            let title = element.text().collect::<String>();
            let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            if title.is_empty() || href.trim().is_empty() {
                continue;
            }

            let Ok(absolute) = self.url.join(href.trim()) else {
                debug!(origin = %self.id, "Skipping unresolvable link {}", href);
                continue;
            };
            if !matches!(absolute.scheme(), "http" | "https") {
                continue;
            }

            match ArticleRef::new(self.id.as_str(), absolute.as_str(), title, None) {
                Ok(article) if seen.insert(article.url.clone()) => articles.push(article),
                Ok(_) => {}
                Err(e) => debug!(origin = %self.id, "Skipping link {}: {}", absolute, e),
            }
        }
        articles
    }
}

#[async_trait::async_trait]
impl SourceAdapter for HtmlListingSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_recent(
        &self,
        limit: usize,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ArticleRef>, FetchError> {
        let bytes = self.http.get_bytes(&self.id, self.url.as_str()).await?;
        let page = String::from_utf8_lossy(&bytes);
        Ok(self.parse_listing(&page, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn source() -> HtmlListingSource {
        let http = SourceHttp::new(Duration::from_secs(1)).unwrap();
        let selectors = vec!["article a".to_string(), "h2 a".to_string(), "h3 a".to_string()];
        HtmlListingSource::new("aiera", "https://aiera.com.cn/", &selectors, http).unwrap()
    }

    const PAGE: &str = r#"
        <html><body>
          <nav><a href="/about">About</a></nav>
          <h2><a href="/2026/10/16/agents/">Agents everywhere</a></h2>
          <article><a href="https://aiera.com.cn/2026/10/15/chips?utm_source=home">New  chips</a></article>
          <h3><a href="/2026/10/16/agents">Agents everywhere (again)</a></h3>
          <h3><a href="/empty"> </a></h3>
          <h3><a href="mailto:editor@aiera.com.cn">Contact</a></h3>
          <h2><a href="/2026/10/14/robots">Robots</a></h2>
        </body></html>
    "#;

    #[test]
    fn picks_links_in_document_order_without_duplicates() {
        let articles = source().parse_listing(PAGE, 10);
        let urls: Vec<_> = articles.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://aiera.com.cn/2026/10/16/agents",
                "https://aiera.com.cn/2026/10/15/chips",
                "https://aiera.com.cn/2026/10/14/robots",
            ]
        );
        assert_eq!(articles[1].title, "New chips");
        assert!(articles.iter().all(|a| a.published_at.is_none()));
    }

    #[test]
    fn stops_at_limit() {
        assert_eq!(source().parse_listing(PAGE, 2).len(), 2);
    }

    #[test]
    fn bad_selector_is_rejected() {
        let http = SourceHttp::new(Duration::from_secs(1)).unwrap();
        assert!(HtmlListingSource::new("x", "https://x.com", &["a[".to_string()], http.clone()).is_err());
        assert!(HtmlListingSource::new("x", "https://x.com", &[], http).is_err());
    }
}
