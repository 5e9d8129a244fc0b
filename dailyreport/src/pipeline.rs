use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::cache::ReportKey;
use crate::compose::{ComposeError, ReportComposer};
use crate::dedupe::Deduplicator;
use crate::llm::summarizer::Summarizer;
use crate::render::{ArtifactRef, Renderer};
use crate::scraping::{self, ArticleExtractor};
use crate::sources::{self, SourceAdapter};

/// Terminal failure of one generation run. Cloned to every waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunFailure {
    #[error("all {0} source(s) failed")]
    NoSources(usize),

    #[error("no articles left to summarize")]
    NoArticles,

    #[error("every summary failed ({0} attempted)")]
    NoSummaries(usize),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("render failed: {0}")]
    Render(String),

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("build aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub per_source_limit: usize,
    /// Only articles published within this window, when dated
    pub since: Option<chrono::Duration>,
    pub fetch_timeout: Duration,
    pub extract_timeout: Duration,
    pub extract_concurrency: usize,
    pub provider_id: String,
    pub fuzzy_titles: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            per_source_limit: 5,
            since: Some(chrono::Duration::hours(48)),
            fetch_timeout: Duration::from_secs(30),
            extract_timeout: Duration::from_secs(30),
            extract_concurrency: 4,
            provider_id: common::DEFAULT_PROVIDER.to_string(),
            fuzzy_titles: true,
        }
    }
}

/// fetch → dedupe → extract → summarize → compose → render
pub struct Pipeline {
    sources: Vec<Arc<dyn SourceAdapter>>,
    extractor: Arc<dyn ArticleExtractor>,
    summarizer: Arc<Summarizer>,
    composer: ReportComposer,
    renderer: Arc<dyn Renderer>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        sources: Vec<Arc<dyn SourceAdapter>>,
        extractor: Arc<dyn ArticleExtractor>,
        summarizer: Arc<Summarizer>,
        composer: ReportComposer,
        renderer: Arc<dyn Renderer>,
        settings: PipelineSettings,
    ) -> Self {
        Self { sources, extractor, summarizer, composer, renderer, settings }
    }

    /// One full generation run for `key`. Per-item failures are absorbed;
    /// only run-level failures come back as errors.
    pub async fn run(&self, key: &ReportKey, now: DateTime<Utc>) -> Result<ArtifactRef, RunFailure> {
        let since = self.settings.since.map(|window| now - window);
        let batch = sources::fetch_all(
            &self.sources,
            self.settings.per_source_limit,
            since,
            self.settings.fetch_timeout,
        )
        .await;
        if batch.all_failed() {
            error!(key = %key, stage = "fetch", "all {} source(s) failed", batch.failed.len());
            return Err(RunFailure::NoSources(batch.failed.len()));
        }
        if !batch.failed.is_empty() {
            warn!(key = %key, "continuing with {} of {} source(s)", batch.succeeded.len(), self.sources.len());
        }

        let articles = Deduplicator::new(self.settings.fuzzy_titles).dedupe(batch.articles);
        if articles.is_empty() {
            return Err(RunFailure::NoArticles);
        }
        info!(key = %key, "{} unique article(s) after dedupe", articles.len());

        let contents = scraping::extract_all(
            self.extractor.as_ref(),
            articles,
            self.settings.extract_concurrency,
            self.settings.extract_timeout,
        )
        .await;
        if contents.is_empty() {
            return Err(RunFailure::NoArticles);
        }

        let summaries = self.summarizer.summarize_all(&contents, &self.settings.provider_id).await;
        let succeeded = summaries.iter().filter(|s| s.is_ok()).count();
        info!(key = %key, "{} of {} summaries succeeded", succeeded, summaries.len());
        if succeeded == 0 {
            return Err(RunFailure::NoSummaries(summaries.len()));
        }

        let document = self.composer.compose(&summaries, now)?;
        self.renderer
            .render(&document, key)
            .await
            .map_err(|e| RunFailure::Render(e.to_string()))
    }
}
