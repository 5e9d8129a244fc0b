use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use feed_rs::parser;
use tracing::debug;

use super::{FetchError, SourceAdapter, SourceHttp};
use crate::article::ArticleRef;

/// RSS or Atom feed origin
pub struct RssSource {
    id: String,
    url: String,
    http: SourceHttp,
}

impl RssSource {
    pub fn new(id: impl Into<String>, url: impl Into<String>, http: SourceHttp) -> Self {
        Self { id: id.into(), url: url.into(), http }
    }
}

/// Turn feed entries into article references. Entries without a usable link
/// are skipped.
pub fn entries_to_refs(origin: &str, entries: &[Entry]) -> Vec<ArticleRef> {
    entries
        .iter()
        .filter_map(|entry| {
            let title = entry.title.as_ref().map(|t| t.content.clone()).unwrap_or_default();
            let link = entry.links.first().map(|l| l.href.clone())?;
            let published = entry.published.or(entry.updated);

            // Feed body first, teaser second
            let excerpt = entry
                .content
                .as_ref()
                .and_then(|c| c.body.clone())
                .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()));

            match ArticleRef::new(origin, &link, title, published) {
                Ok(article) => Some(article.with_excerpt(excerpt)),
                Err(e) => {
                    debug!(origin, "Skipping entry with bad link {}: {}", link, e);
                    None
                }
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl SourceAdapter for RssSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_recent(
        &self,
        limit: usize,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ArticleRef>, FetchError> {
        let bytes = self.http.get_bytes(&self.id, &self.url).await?;
        let feed = parser::parse(bytes.as_slice()).map_err(|e| FetchError::Parse(e.to_string()))?;

        let mut articles = entries_to_refs(&self.id, &feed.entries);
        super::order_newest_first(&mut articles);
        articles.truncate(limit);
        Ok(articles)
    }
}
