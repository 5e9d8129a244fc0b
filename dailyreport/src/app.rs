use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::FixedOffset;
use tracing::{info, warn};

use common::{CacheBackend, Config, ScopeMode};

use crate::cache::{KeyPolicy, KeyScoping, MemoryReportStore, ReportCache, ReportStore};
use crate::clock::{Clock, SystemClock};
use crate::compose::ReportComposer;
use crate::llm::remote::RemoteLlmProvider;
use crate::llm::summarizer::{Summarizer, SummarizerSettings};
use crate::llm::ProviderRegistry;
use crate::orchestrator::Orchestrator;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::render::HtmlRenderer;
use crate::scraping::ReadabilityExtractor;
use crate::sources::{self, SourceHttp};
use crate::storage::SqliteReportStore;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_DB_PATH: &str = "data/dailyreport.db";

/// Register one OpenAI-compatible provider per `[llm.providers.<id>]`.
///
/// A provider whose API key variable is unset is skipped, unless it is the
/// one selected for summarization.
pub fn build_registry(config: &Config) -> Result<ProviderRegistry> {
    let selected = config.provider_id();
    let mut registry = ProviderRegistry::new();

    let providers = config.llm.as_ref().map(|l| l.providers.clone()).unwrap_or_default();
    for (id, remote) in providers {
        let api_key = match remote.api_key_env.as_deref() {
            None => String::new(),
            Some(var) => match std::env::var(var) {
                Ok(key) => key,
                Err(_) if id == selected => {
                    bail!("LLM API key env var '{}' not set for provider '{}'", var, id)
                }
                Err(_) => {
                    warn!("LLM API key env var '{}' not set, skipping provider {}", var, id);
                    continue;
                }
            },
        };

        let provider = RemoteLlmProvider::new(
            remote.api_url.clone().unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_key,
            remote.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        )
        .with_defaults(
            remote.timeout_seconds.unwrap_or(30),
            remote.max_tokens.unwrap_or(300),
            remote.temperature.unwrap_or(0.3),
        )
        .with_name(id.clone());
        registry.register(id, Arc::new(provider));
    }

    Ok(registry)
}

pub fn summarizer_settings(config: &Config) -> SummarizerSettings {
    let defaults = SummarizerSettings::default();
    let Some(s) = &config.summarization else {
        return defaults;
    };
    SummarizerSettings {
        max_input_chars: s.max_input_chars.unwrap_or(defaults.max_input_chars),
        max_tokens: s.max_tokens.unwrap_or(defaults.max_tokens),
        max_concurrent: s.max_concurrent.unwrap_or(defaults.max_concurrent),
        max_retries: s.max_retries.unwrap_or(defaults.max_retries),
        call_timeout: s.call_timeout_seconds.map(Duration::from_secs).unwrap_or(defaults.call_timeout),
        backoff_base: s.backoff_base_millis.map(Duration::from_millis).unwrap_or(defaults.backoff_base),
    }
}

pub fn pipeline_settings(config: &Config) -> PipelineSettings {
    let defaults = PipelineSettings::default();
    let p = config.pipeline.clone().unwrap_or_default();
    PipelineSettings {
        per_source_limit: p.per_source_limit.unwrap_or(defaults.per_source_limit),
        since: match p.since_hours {
            Some(h) if h > 0 => Some(chrono::Duration::hours(h)),
            Some(_) => None,
            None => defaults.since,
        },
        fetch_timeout: p.fetch_timeout_seconds.map(Duration::from_secs).unwrap_or(defaults.fetch_timeout),
        extract_timeout: p.extract_timeout_seconds.map(Duration::from_secs).unwrap_or(defaults.extract_timeout),
        extract_concurrency: p.extract_concurrency.unwrap_or(defaults.extract_concurrency),
        provider_id: config.provider_id().to_string(),
        fuzzy_titles: p.fuzzy_titles.unwrap_or(defaults.fuzzy_titles),
    }
}

pub fn key_policy(config: &Config) -> KeyPolicy {
    let report = config.report.clone().unwrap_or_default();
    let scoping = match report.scope.unwrap_or(ScopeMode::Global) {
        ScopeMode::Global => KeyScoping::Global,
        ScopeMode::Session => KeyScoping::Session,
    };
    KeyPolicy::new(report.bucket_hours.unwrap_or(24), report.utc_offset_hours.unwrap_or(0), scoping)
}

async fn open_store(config: &Config) -> Result<Arc<dyn ReportStore>> {
    let cache = config.cache.clone().unwrap_or_default();
    match cache.backend.unwrap_or(CacheBackend::Memory) {
        CacheBackend::Memory => Ok(Arc::new(MemoryReportStore::new())),
        CacheBackend::Sqlite => {
            let path = cache.path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
            let pool = common::init_db_pool(&path).await?;
            common::run_migrations(&pool).await?;
            info!(db_path = %path, "sqlite report cache ready");
            Ok(Arc::new(SqliteReportStore::new(pool)))
        }
    }
}

/// Fully wired service
pub struct App {
    pub orchestrator: Arc<Orchestrator>,
    pub cache: Arc<ReportCache>,
}

impl App {
    pub async fn build(config: &Config) -> Result<Self> {
        Self::build_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn build_with_clock(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        // Configs built in code skip `load_with_defaults`
        config.validate()?;

        // Unknown provider ids fail here, before any trigger
        let registry = build_registry(config)?;
        registry.resolve(config.provider_id())?;
        info!(provider = %config.provider_id(), "summarization provider selected");

        if config.sources.is_empty() {
            bail!("no [[sources]] configured");
        }

        let pipeline_settings = pipeline_settings(config);
        let p = config.pipeline.clone().unwrap_or_default();

        let http = SourceHttp::new(pipeline_settings.fetch_timeout)?;
        let adapters = sources::from_config(&config.sources, &http)?;
        let extractor = ReadabilityExtractor::new(pipeline_settings.extract_timeout, p.min_content_chars.unwrap_or(200))?;
        let summarizer = Summarizer::new(Arc::new(registry), summarizer_settings(config));

        let report = config.report.clone().unwrap_or_default();
        let mut composer = ReportComposer::new(
            report.title.clone().unwrap_or_else(|| "AI Daily".to_string()),
            config.sources.iter().map(|s| s.id.clone()).collect(),
        );
        for source in &config.sources {
            if let Some(name) = &source.name {
                composer = composer.with_name(&source.id, name);
            }
        }

        let offset = FixedOffset::east_opt(report.utc_offset_hours.unwrap_or(0) * 3600)
            .context("report.utc_offset_hours out of range")?;
        let mut renderer = HtmlRenderer::new(PathBuf::from(report.output_dir.clone().unwrap_or_else(|| "reports".to_string())))
            .with_offset(offset);
        if let Some(template) = &report.template {
            renderer = renderer.with_template(template);
        }

        let store = open_store(config).await?;
        let cache = Arc::new(ReportCache::new(store, clock));
        if let Err(e) = cache.purge_expired().await {
            warn!("failed to purge expired reports: {:#}", e);
        }

        let generation_timeout = Duration::from_secs(p.generation_timeout_seconds.unwrap_or(600));
        let pipeline = Pipeline::new(
            adapters,
            Arc::new(extractor),
            Arc::new(summarizer),
            composer,
            Arc::new(renderer),
            pipeline_settings,
        );

        let orchestrator = Orchestrator::new(Arc::new(pipeline), cache.clone(), key_policy(config), generation_timeout);
        info!(sources = config.sources.len(), "report service ready");

        Ok(Self { orchestrator: Arc::new(orchestrator), cache })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [summarization]
        provider = "local"
        max_retries = 1

        [llm.providers.local]
        api_url = "http://localhost:11434/v1/chat/completions"
        model = "qwen2.5"

        [[sources]]
        id = "qbitai"
        name = "量子位"
        kind = "rss"
        url = "https://www.qbitai.com/feed"

        [pipeline]
        since_hours = 0

        [report]
        scope = "session"
        bucket_hours = 12
        utc_offset_hours = 8
    "#;

    fn config() -> Config {
        toml::from_str(CONFIG).unwrap()
    }

    #[tokio::test]
    async fn builds_with_memory_cache() {
        let app = App::build(&config()).await.expect("app");
        assert_eq!(app.orchestrator.builds_in_flight(), 0);
        let key = app.orchestrator.key_for(Some("chat-1"));
        assert_eq!(key.scope.as_deref(), Some("chat-1"));
        assert!(key.bucket.ends_with("T00") || key.bucket.ends_with("T12"));
    }

    #[tokio::test]
    async fn unknown_provider_fails_at_startup() {
        let mut cfg = config();
        cfg.summarization.as_mut().unwrap().provider = Some("anthropic".into());
        let err = App::build(&cfg).await.err().expect("must fail");
        assert!(err.to_string().contains("anthropic"));
    }

    #[tokio::test]
    async fn invalid_bucket_width_fails_at_startup() {
        let mut cfg = config();
        cfg.report.as_mut().unwrap().bucket_hours = Some(5);
        let err = App::build(&cfg).await.err().expect("must fail");
        assert!(err.to_string().contains("bucket_hours"));

        let mut cfg = config();
        cfg.report.as_mut().unwrap().bucket_hours = Some(0);
        assert!(App::build(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn out_of_range_offset_fails_at_startup() {
        let mut cfg = config();
        cfg.report.as_mut().unwrap().utc_offset_hours = Some(30);
        let err = App::build(&cfg).await.err().expect("must fail");
        assert!(err.to_string().contains("utc_offset_hours"));
    }

    #[tokio::test]
    async fn missing_key_of_selected_provider_fails() {
        let mut cfg = config();
        cfg.llm.as_mut().unwrap().providers.get_mut("local").unwrap().api_key_env =
            Some("DAILYREPORT_TEST_UNSET_KEY".into());
        assert!(build_registry(&cfg).is_err());
    }

    #[tokio::test]
    async fn sqlite_backend_is_opened_and_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.cache = Some(common::CacheConfig {
            backend: Some(CacheBackend::Sqlite),
            path: Some(dir.path().join("cache.db").to_string_lossy().to_string()),
        });
        let app = App::build(&cfg).await.expect("app");
        let key = app.orchestrator.key_for(None);
        assert!(app.cache.lookup(&key).await.is_none());
    }

    #[test]
    fn settings_follow_config() {
        let cfg = config();
        let p = pipeline_settings(&cfg);
        assert_eq!(p.provider_id, "local");
        assert!(p.since.is_none());
        assert_eq!(summarizer_settings(&cfg).max_retries, 1);
        assert_eq!(summarizer_settings(&Config::default()).max_retries, SummarizerSettings::default().max_retries);
    }
}
