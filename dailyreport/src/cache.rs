use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::render::ArtifactRef;

/// Lifetime of a cached report
pub const REPORT_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// Identity of one report: a time bucket, optionally narrowed to a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportKey {
    pub bucket: String,
    pub scope: Option<String>,
}

impl fmt::Display for ReportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}@{}", self.bucket, scope),
            None => f.write_str(&self.bucket),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScoping {
    /// Session ids are ignored, everyone shares the bucket's report
    Global,
    Session,
}

/// Derives report keys from the trigger time alone.
#[derive(Debug, Clone)]
pub struct KeyPolicy {
    bucket_hours: u32,
    offset: FixedOffset,
    scoping: KeyScoping,
}

impl KeyPolicy {
    /// `bucket_hours` must divide 24. Anything else falls back to daily buckets.
    pub fn new(bucket_hours: u32, utc_offset_hours: i32, scoping: KeyScoping) -> Self {
        let bucket_hours = if bucket_hours == 0 || 24 % bucket_hours != 0 { 24 } else { bucket_hours };
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix());
        Self { bucket_hours, offset, scoping }
    }

    pub fn daily(scoping: KeyScoping) -> Self {
        Self::new(24, 0, scoping)
    }

    pub fn key_for(&self, now: DateTime<Utc>, session: Option<&str>) -> ReportKey {
        let local = now.with_timezone(&self.offset);
        let day = local.date_naive().format("%Y-%m-%d");
        let bucket = if self.bucket_hours == 24 {
            day.to_string()
        } else {
            let start = local.hour() / self.bucket_hours * self.bucket_hours;
            format!("{}T{:02}", day, start)
        };

        let scope = match self.scoping {
            KeyScoping::Global => None,
            KeyScoping::Session => session
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        };

        ReportKey { bucket, scope }
    }
}

/// One cached report. Expired entries are treated as absent by every reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: ReportKey,
    pub artifact: ArtifactRef,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Backing storage for cache entries. Writes replace whole entries.
#[async_trait::async_trait]
pub trait ReportStore: Send + Sync {
    async fn get(&self, key: &ReportKey) -> Result<Option<CacheEntry>>;
    async fn put(&self, entry: CacheEntry) -> Result<()>;
    async fn remove(&self, key: &ReportKey) -> Result<bool>;
    /// Drop every entry expired at `now`, returning how many went away
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Process-lifetime store
#[derive(Default)]
pub struct MemoryReportStore {
    entries: RwLock<HashMap<ReportKey, CacheEntry>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ReportStore for MemoryReportStore {
    async fn get(&self, key: &ReportKey) -> Result<Option<CacheEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        self.entries.write().await.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &ReportKey) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }
}

/// TTL discipline on top of a [`ReportStore`].
pub struct ReportCache {
    store: Arc<dyn ReportStore>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl ReportCache {
    pub fn new(store: Arc<dyn ReportStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            ttl: chrono::Duration::seconds(REPORT_TTL.as_secs() as i64),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Live entry for `key`, if any. A failing store reads as a miss.
    pub async fn lookup(&self, key: &ReportKey) -> Option<CacheEntry> {
        match self.store.get(key).await {
            Ok(Some(entry)) if entry.is_live(self.clock.now()) => Some(entry),
            Ok(Some(entry)) => {
                debug!(key = %key, expired_at = %entry.expires_at, "cache entry expired");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, "cache lookup failed, treating as miss: {:#}", e);
                None
            }
        }
    }

    /// Entry for an artifact created now, valid for the TTL
    pub fn entry_for(&self, key: &ReportKey, artifact: ArtifactRef) -> CacheEntry {
        let created_at = self.clock.now();
        CacheEntry {
            key: key.clone(),
            artifact,
            created_at,
            expires_at: created_at + self.ttl,
        }
    }

    /// Write `entry`, replacing any previous one for its key.
    pub async fn put(&self, entry: &CacheEntry) -> Result<()> {
        self.store.put(entry.clone()).await?;
        debug!(key = %entry.key, expires_at = %entry.expires_at, "cache entry stored");
        Ok(())
    }

    /// Record a freshly rendered artifact, replacing any previous entry.
    pub async fn store(&self, key: &ReportKey, artifact: ArtifactRef) -> Result<CacheEntry> {
        let entry = self.entry_for(key, artifact);
        self.put(&entry).await?;
        Ok(entry)
    }

    pub async fn invalidate(&self, key: &ReportKey) -> Result<bool> {
        let removed = self.store.remove(key).await?;
        if removed {
            info!(key = %key, "cache entry invalidated");
        }
        Ok(removed)
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        let purged = self.store.purge_expired(self.clock.now()).await?;
        if purged > 0 {
            info!("purged {} expired report(s)", purged);
        }
        Ok(purged)
    }
}
