use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::cache::{CacheEntry, ReportKey, ReportStore};
use crate::render::ArtifactRef;

/// Report cache persisted in the `report_cache` table, so a restart keeps
/// serving reports that are still within their TTL.
pub struct SqliteReportStore {
    pool: SqlitePool,
}

impl SqliteReportStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn key_column(key: &ReportKey) -> String {
    key.to_string()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("invalid timestamp in report_cache: {}", ms))
}

#[async_trait::async_trait]
impl ReportStore for SqliteReportStore {
    async fn get(&self, key: &ReportKey) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT artifact_json, created_at, expires_at FROM report_cache WHERE report_key = ?",
        )
        .bind(key_column(key))
        .fetch_optional(&self.pool)
        .await
        .context("failed to read report_cache")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let artifact_json: String = row.try_get("artifact_json")?;
        let artifact: ArtifactRef = serde_json::from_str(&artifact_json)
            .with_context(|| format!("corrupt artifact for report {}", key))?;

        Ok(Some(CacheEntry {
            key: key.clone(),
            artifact,
            created_at: from_millis(row.try_get("created_at")?)?,
            expires_at: from_millis(row.try_get("expires_at")?)?,
        }))
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let artifact_json = serde_json::to_string(&entry.artifact).context("failed to encode artifact")?;

        sqlx::query(
            r#"
            INSERT INTO report_cache (report_key, artifact_json, created_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(report_key) DO UPDATE SET
                artifact_json = excluded.artifact_json,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key_column(&entry.key))
        .bind(artifact_json)
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("failed to write report_cache")?;

        debug!(key = %entry.key, "report cached in sqlite");
        Ok(())
    }

    async fn remove(&self, key: &ReportKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM report_cache WHERE report_key = ?")
            .bind(key_column(key))
            .execute(&self.pool)
            .await
            .context("failed to delete from report_cache")?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query("DELETE FROM report_cache WHERE expires_at <= ?")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
            .context("failed to purge report_cache")?;
        Ok(result.rows_affected() as usize)
    }
}
