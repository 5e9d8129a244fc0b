use std::collections::HashSet;

use tracing::debug;

use crate::article::{normalize_title, ArticleRef};

/// Drops repeated articles within one generation run, keeping the first
/// occurrence. Identity is the canonical URL; with `fuzzy_titles` two
/// references whose normalized titles are equal also count as the same story.
#[derive(Debug, Clone, Copy)]
pub struct Deduplicator {
    fuzzy_titles: bool,
}

impl Deduplicator {
    pub fn new(fuzzy_titles: bool) -> Self {
        Self { fuzzy_titles }
    }

    pub fn dedupe(&self, articles: Vec<ArticleRef>) -> Vec<ArticleRef> {
        let mut seen_urls = HashSet::new();
        let mut seen_titles = HashSet::new();
        let before = articles.len();

        let kept: Vec<ArticleRef> = articles
            .into_iter()
            .filter(|article| {
                if seen_urls.contains(&article.url) {
                    debug!(origin = %article.origin, url = %article.url, "dedupe: duplicate url");
                    return false;
                }
                let title = normalize_title(&article.title);
                if self.fuzzy_titles && !title.is_empty() && seen_titles.contains(&title) {
                    debug!(origin = %article.origin, url = %article.url, "dedupe: duplicate title");
                    return false;
                }
                seen_urls.insert(article.url.clone());
                if !title.is_empty() {
                    seen_titles.insert(title);
                }
                true
            })
            .collect();

        debug!("dedupe: kept {} of {} articles", kept.len(), before);
        kept
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(true)
    }
}
