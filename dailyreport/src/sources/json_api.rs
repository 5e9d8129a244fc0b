use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::debug;

use common::SourceConfig;

use super::{FetchError, SourceAdapter, SourceHttp};
use crate::article::ArticleRef;

/// Origin exposing its article list as JSON
pub struct JsonApiSource {
    id: String,
    url: String,
    items_field: String,
    title_field: String,
    url_field: Option<String>,
    slug_field: String,
    url_template: Option<String>,
    published_field: Option<String>,
    http: SourceHttp,
}

impl JsonApiSource {
    pub fn from_config(cfg: &SourceConfig, http: SourceHttp) -> Result<Self> {
        if cfg.url_field.is_none() && cfg.url_template.is_none() {
            bail!("json source {} needs url_field or url_template", cfg.id);
        }
        Ok(Self {
            id: cfg.id.clone(),
            url: cfg.url.clone(),
            items_field: cfg.items_field.clone().unwrap_or_else(|| "articles".to_string()),
            title_field: cfg.title_field.clone().unwrap_or_else(|| "title".to_string()),
            url_field: cfg.url_field.clone(),
            slug_field: cfg.slug_field.clone().unwrap_or_else(|| "slug".to_string()),
            url_template: cfg.url_template.clone(),
            published_field: cfg.published_field.clone(),
            http,
        })
    }

    fn item_url(&self, item: &Value) -> Option<String> {
        if let Some(field) = &self.url_field {
            if let Some(url) = lookup(item, field).and_then(Value::as_str) {
                return Some(url.to_string());
            }
        }
        let template = self.url_template.as_ref()?;
        let slug = match lookup(item, &self.slug_field)? {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(template.replace("{slug}", &slug))
    }

    pub fn parse_listing(&self, body: &[u8], limit: usize) -> Result<Vec<ArticleRef>, FetchError> {
        let root: Value = serde_json::from_slice(body).map_err(|e| FetchError::Parse(e.to_string()))?;
        let items = lookup(&root, &self.items_field)
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::Parse(format!("no '{}' array in response", self.items_field)))?;

        let mut articles = Vec::new();
        for item in items {
            let title = lookup(item, &self.title_field).and_then(Value::as_str).unwrap_or_default();
            let Some(url) = self.item_url(item) else {
                debug!(origin = %self.id, "Skipping item without url: {}", title);
                continue;
            };
            let published = self
                .published_field
                .as_ref()
                .and_then(|f| lookup(item, f))
                .and_then(parse_timestamp);

            match ArticleRef::new(self.id.as_str(), &url, title, published) {
                Ok(article) => articles.push(article),
                Err(e) => debug!(origin = %self.id, "Skipping item with bad url {}: {}", url, e),
            }
        }

        // The API order is not trusted to be chronological
        super::order_newest_first(&mut articles);
        articles.truncate(limit);
        Ok(articles)
    }
}

/// Dotted path lookup ("data.items")
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |v, key| v.get(key))
}

/// RFC 3339, "YYYY-MM-DD HH:MM:SS" (taken as UTC) or unix seconds/millis
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|n| Utc.from_utc_datetime(&n))
            }),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw > 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

#[async_trait::async_trait]
impl SourceAdapter for JsonApiSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_recent(
        &self,
        limit: usize,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ArticleRef>, FetchError> {
        let body = self.http.get_bytes(&self.id, &self.url).await?;
        self.parse_listing(&body, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SourceKind;
    use std::time::Duration;

    fn config() -> SourceConfig {
        SourceConfig {
            id: "jiqizhixin".to_string(),
            name: None,
            kind: SourceKind::Json,
            url: "https://www.jiqizhixin.com/api/v4/articles.json?sort=time".to_string(),
            selectors: vec![],
            items_field: None,
            title_field: None,
            url_field: None,
            slug_field: None,
            url_template: Some("https://www.jiqizhixin.com/articles/{slug}".to_string()),
            published_field: Some("published_at".to_string()),
        }
    }

    fn source(cfg: &SourceConfig) -> JsonApiSource {
        JsonApiSource::from_config(cfg, SourceHttp::new(Duration::from_secs(1)).unwrap()).unwrap()
    }

    #[test]
    fn builds_urls_from_slugs() {
        let body = r#"{"articles": [
            {"title": "大模型周报", "slug": "2026-10-16-3", "published_at": "2026-10-16T08:00:00+08:00"},
            {"title": "No slug"},
            {"title": "Numeric", "slug": 42, "published_at": 1792108800}
        ]}"#;
        let articles = source(&config()).parse_listing(body.as_bytes(), 10).unwrap();

        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].url, "https://www.jiqizhixin.com/articles/2026-10-16-3");
        assert_eq!(articles[0].title, "大模型周报");
        assert_eq!(
            articles[0].published_at,
            Some(Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap())
        );
        assert_eq!(articles[1].url, "https://www.jiqizhixin.com/articles/42");
        assert!(articles[1].published_at.is_some());
    }

    #[test]
    fn url_field_and_nested_items() {
        let mut cfg = config();
        cfg.items_field = Some("data.items".to_string());
        cfg.url_field = Some("link".to_string());
        cfg.published_field = None;
        let body = br#"{"data": {"items": [{"title": "A", "link": "https://x.com/a/"}]}}"#;

        let articles = source(&cfg).parse_listing(body, 10).unwrap();
        assert_eq!(articles[0].url, "https://x.com/a");
    }

    #[test]
    fn limit_keeps_the_newest_items_of_an_unsorted_listing() {
        let body = br#"{"articles": [
            {"title": "Old", "slug": "old", "published_at": "2026-10-14 09:00:00"},
            {"title": "Newest", "slug": "newest", "published_at": "2026-10-16 09:00:00"},
            {"title": "Middle", "slug": "middle", "published_at": "2026-10-15 09:00:00"}
        ]}"#;
        let articles = source(&config()).parse_listing(body, 2).unwrap();
        let titles: Vec<_> = articles.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["Newest", "Middle"]);
    }

    #[test]
    fn missing_items_array_is_a_parse_error() {
        let err = source(&config()).parse_listing(br#"{"data": []}"#, 10).unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
        assert!(source(&config()).parse_listing(b"<html>", 10).is_err());
    }
}
