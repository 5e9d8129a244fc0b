/*!
common/src/lib.rs

Shared configuration types and DB helper functions for dailyreport.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader merging a default file with an optional override file
- Helpers to initialize and migrate the SQLite database backing the report cache
*/

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;

/// Summarization settings. `provider` selects an entry of `[llm.providers]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummarizationConfig {
    /// Provider identifier, defaults to "openai"
    pub provider: Option<String>,
    /// Article text is cut to this many characters before prompting
    pub max_input_chars: Option<usize>,
    pub max_tokens: Option<usize>,
    /// Simultaneous calls allowed against the backend
    pub max_concurrent: Option<usize>,
    pub max_retries: Option<u32>,
    pub call_timeout_seconds: Option<u64>,
    pub backoff_base_millis: Option<u64>,
}

/// One OpenAI-compatible endpoint, registered under its table name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

/// LLM top-level config: `[llm.providers.<id>]` tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, RemoteLlmConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// RSS or Atom feed
    Rss,
    /// HTML listing page scraped with CSS selectors
    Html,
    /// JSON API returning an array of articles
    Json,
}

/// One content origin. The order of `[[sources]]` is the source priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: Option<String>,
    pub kind: SourceKind,
    pub url: String,
    /// html: CSS selectors matching article links, tried in order
    #[serde(default)]
    pub selectors: Vec<String>,
    /// json: field holding the article array (default "articles")
    pub items_field: Option<String>,
    pub title_field: Option<String>,
    /// json: field holding a full article URL
    pub url_field: Option<String>,
    /// json: field substituted into `url_template` as `{slug}`
    pub slug_field: Option<String>,
    pub url_template: Option<String>,
    pub published_field: Option<String>,
}

/// Limits and timeouts for one generation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub per_source_limit: Option<usize>,
    pub since_hours: Option<i64>,
    pub fetch_timeout_seconds: Option<u64>,
    pub extract_timeout_seconds: Option<u64>,
    pub extract_concurrency: Option<usize>,
    pub min_content_chars: Option<usize>,
    pub generation_timeout_seconds: Option<u64>,
    pub fuzzy_titles: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeMode {
    /// One report per time bucket, shared by every caller
    Global,
    /// One report per time bucket and caller session
    Session,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    pub title: Option<String>,
    pub scope: Option<ScopeMode>,
    /// Width of the key bucket; 24 means one report per calendar day
    pub bucket_hours: Option<u32>,
    pub utc_offset_hours: Option<i32>,
    pub output_dir: Option<String>,
    /// Optional HTML template with {title}, {date} and {articles} placeholders
    pub template: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    pub backend: Option<CacheBackend>,
    /// Path to the sqlite database file when `backend = "sqlite"`
    pub path: Option<String>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub summarization: Option<SummarizationConfig>,
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    pub pipeline: Option<PipelineConfig>,
    pub report: Option<ReportConfig>,
    pub cache: Option<CacheConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        if let Some(path) = default_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("Failed to read default config: {}", path.display()))?;
                let val: toml::Value = toml::from_str(&data)
                    .context("Failed to parse default configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        if let Some(path) = override_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("Failed to read override config: {}", path.display()))?;
                let val: toml::Value = toml::from_str(&data)
                    .context("Failed to parse override configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// The summarization provider identifier, "openai" unless configured.
    pub fn provider_id(&self) -> &str {
        self.summarization
            .as_ref()
            .and_then(|s| s.provider.as_deref())
            .unwrap_or(DEFAULT_PROVIDER)
    }

    /// Structural checks that do not need the network or the provider registry.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                bail!("source with url {} has an empty id", source.url);
            }
            if !seen.insert(source.id.as_str()) {
                bail!("duplicate source id: {}", source.id);
            }
            url::Url::parse(&source.url)
                .with_context(|| format!("source {} has an invalid url: {}", source.id, source.url))?;
            if source.kind == SourceKind::Html && source.selectors.is_empty() {
                bail!("html source {} needs at least one selector", source.id);
            }
            if source.kind == SourceKind::Json && source.url_field.is_none() && source.url_template.is_none() {
                bail!("json source {} needs url_field or url_template", source.id);
            }
        }

        if let Some(report) = &self.report {
            if let Some(hours) = report.bucket_hours {
                if hours == 0 || 24 % hours != 0 {
                    bail!("report.bucket_hours must divide 24, got {}", hours);
                }
            }
            if let Some(offset) = report.utc_offset_hours {
                if !(-23..=23).contains(&offset) {
                    bail!("report.utc_offset_hours out of range: {}", offset);
                }
            }
        }

        if let Some(s) = &self.summarization {
            if s.max_concurrent == Some(0) {
                bail!("summarization.max_concurrent must be at least 1");
            }
        }

        Ok(())
    }
}

pub const DEFAULT_PROVIDER: &str = "openai";

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Run SQL migrations using sqlx's migration macro.
/// This expects a `migrations` directory at the workspace root containing the
/// SQL migration files for the report cache tables.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .context("Failed to run sqlx migrations")?;

    Ok(())
}

/// Initialize an SQLite connection pool.
///
/// This function will create the parent directory if necessary and return a
/// configured `SqlitePool` (WAL journal, at most 5 connections).
///
/// Example:
///   let pool = init_db_pool("data/dailyreport.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}
