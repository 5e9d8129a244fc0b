use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Query parameters that only identify the referrer or campaign.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "mc_cid", "mc_eid", "igshid", "spm", "ref", "ref_src",
];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Canonical form of an article URL, used as its identity.
///
/// Scheme and host are lowercased (by `Url`), tracking parameters and the
/// fragment are dropped, and trailing slashes are removed from the path.
pub fn normalize_url(raw: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(raw.trim())?;
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let Some(host) = url.host_str() else {
        return Ok(url.to_string());
    };

    let mut out = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        out.push_str(&format!(":{}", port));
    }
    out.push_str(url.path().trim_end_matches('/'));
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    Ok(out)
}

/// Lowercased, whitespace-collapsed title used for fuzzy duplicate detection.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reference to one article as listed by an origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRef {
    /// Id of the source that listed this article
    pub origin: String,
    /// Canonical URL (see [`normalize_url`]); the article identity
    pub url: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Body or teaser shipped with the listing (feed content, API abstract)
    pub excerpt: Option<String>,
}

impl ArticleRef {
    pub fn new(
        origin: impl Into<String>,
        url: &str,
        title: impl Into<String>,
        published_at: Option<DateTime<Utc>>,
    ) -> Result<Self, url::ParseError> {
        let title: String = title.into();
        Ok(Self {
            origin: origin.into(),
            url: normalize_url(url)?,
            title: title.trim().to_string(),
            published_at,
            excerpt: None,
        })
    }

    pub fn with_excerpt(mut self, excerpt: Option<String>) -> Self {
        self.excerpt = excerpt.filter(|e| !e.trim().is_empty());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionStatus {
    /// Body pulled from the article page
    Extracted,
    /// Listing excerpt was long enough, no page fetch
    FromExcerpt,
}

/// Cleaned article text ready for summarization.
#[derive(Debug, Clone)]
pub struct ArticleContent {
    pub article: ArticleRef,
    pub body: String,
    pub status: ExtractionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryStatus {
    Ok,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleSummary {
    pub article: ArticleRef,
    pub text: String,
    pub status: SummaryStatus,
    /// Backend calls made for this article, retries included
    pub attempts: u32,
}

impl ArticleSummary {
    pub fn ok(article: ArticleRef, text: String, attempts: u32) -> Self {
        Self { article, text, status: SummaryStatus::Ok, attempts }
    }

    pub fn failed(article: ArticleRef, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            article,
            text: String::new(),
            status: SummaryStatus::Failed(reason.into()),
            attempts,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == SummaryStatus::Ok
    }
}
