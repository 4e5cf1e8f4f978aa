//! Durable record of which opportunities have been seen and posted.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundwatch_core::{DeliveryState, SeenRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("creating storage directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Delivery transition requested alongside a `mark_seen` write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryUpdate {
    /// Leave delivery columns as they are (filter rejections, backfill).
    Unchanged,
    Pending,
    Posted(DateTime<Utc>),
    Failed(String),
}

impl DeliveryUpdate {
    fn columns(&self) -> (Option<DateTime<Utc>>, Option<&'static str>, Option<String>) {
        match self {
            Self::Unchanged => (None, None, None),
            Self::Pending => (None, Some("pending"), None),
            Self::Posted(at) => (Some(*at), Some("posted"), None),
            Self::Failed(reason) => (None, Some("failed"), Some(reason.clone())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeenUpdate<'a> {
    pub external_id: &'a str,
    pub source_id: &'a str,
    pub title: &'a str,
    pub url: &'a str,
    pub match_reason: Option<&'a str>,
    pub delivery: DeliveryUpdate,
}

#[async_trait]
pub trait DedupeStore: Send + Sync {
    /// Create the schema if missing. Safe to call repeatedly.
    async fn init(&self) -> Result<(), StoreError>;

    async fn has_seen(&self, external_id: &str) -> Result<Option<SeenRecord>, StoreError>;

    /// Insert or update one record.
    ///
    /// An existing `posted_at` is never cleared, and an absent match reason
    /// never overwrites a stored one.
    async fn mark_seen(&self, update: &SeenUpdate<'_>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteDedupeStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteDedupeStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        debug!(path = %path.display(), "opened dedupe store");
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DedupeStore for SqliteDedupeStore {
    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS opportunities (
                external_id    TEXT PRIMARY KEY,
                source_id      TEXT NOT NULL,
                first_seen_at  TEXT NOT NULL,
                posted_at      TEXT NULL,
                title          TEXT NOT NULL,
                url            TEXT NOT NULL,
                match_reason   TEXT NULL,
                delivery_state TEXT NOT NULL DEFAULT 'none',
                delivery_error TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_opportunities_posted_at ON opportunities(posted_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn has_seen(&self, external_id: &str) -> Result<Option<SeenRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT external_id, source_id, first_seen_at, posted_at, title, url,
                   match_reason, delivery_state, delivery_error
              FROM opportunities
             WHERE external_id = ?1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    async fn mark_seen(&self, update: &SeenUpdate<'_>) -> Result<(), StoreError> {
        let (posted_at, state, error) = update.delivery.columns();
        sqlx::query(
            r#"
            INSERT INTO opportunities (
                external_id, source_id, first_seen_at, posted_at, title, url,
                match_reason, delivery_state, delivery_error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, COALESCE(?8, 'none'), ?9)
            ON CONFLICT(external_id) DO UPDATE SET
                source_id = excluded.source_id,
                title = excluded.title,
                url = excluded.url,
                match_reason = COALESCE(excluded.match_reason, opportunities.match_reason),
                posted_at = COALESCE(opportunities.posted_at, excluded.posted_at),
                delivery_state = CASE
                    WHEN opportunities.posted_at IS NOT NULL THEN 'posted'
                    ELSE COALESCE(?8, opportunities.delivery_state)
                END,
                delivery_error = CASE
                    WHEN opportunities.posted_at IS NOT NULL THEN opportunities.delivery_error
                    WHEN ?8 IS NULL THEN opportunities.delivery_error
                    ELSE ?9
                END
            "#,
        )
        .bind(update.external_id)
        .bind(update.source_id)
        .bind(Utc::now())
        .bind(posted_at)
        .bind(update.title)
        .bind(update.url)
        .bind(update.match_reason)
        .bind(state)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<SeenRecord, StoreError> {
    let posted_at: Option<DateTime<Utc>> = row.try_get("posted_at")?;
    let state: String = row.try_get("delivery_state")?;
    let error: Option<String> = row.try_get("delivery_error")?;

    let delivery = match (posted_at, state.as_str()) {
        (Some(at), _) => DeliveryState::Posted { at },
        (None, "pending") => DeliveryState::Pending,
        (None, "failed") => DeliveryState::PostFailed {
            reason: error.unwrap_or_default(),
        },
        _ => DeliveryState::Unseen,
    };

    Ok(SeenRecord {
        external_id: row.try_get("external_id")?,
        source_id: row.try_get("source_id")?,
        first_seen_at: row.try_get("first_seen_at")?,
        posted_at,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        match_reason: row.try_get("match_reason")?,
        delivery,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn update<'a>(external_id: &'a str, match_reason: Option<&'a str>, delivery: DeliveryUpdate) -> SeenUpdate<'a> {
        SeenUpdate {
            external_id,
            source_id: "ukri_rss",
            title: "AI for health systems",
            url: "https://www.ukri.org/opportunity/ai-health",
            match_reason,
            delivery,
        }
    }

    async fn open_store(dir: &Path) -> SqliteDedupeStore {
        let store = SqliteDedupeStore::open(dir.join("nested").join("state.sqlite")).await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn init_is_idempotent_and_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.init().await.unwrap();
        assert!(store.path().exists());
        assert_eq!(store.has_seen("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unchanged_delivery_records_a_rejection() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store
            .mark_seen(&update("id-1", Some("filtered out: no include keyword match"), DeliveryUpdate::Unchanged))
            .await
            .unwrap();

        let record = store.has_seen("id-1").await.unwrap().unwrap();
        assert_eq!(record.delivery, DeliveryState::Unseen);
        assert_eq!(record.posted_at, None);
        assert_eq!(record.match_reason.as_deref(), Some("filtered out: no include keyword match"));
    }

    #[tokio::test]
    async fn pending_then_posted_then_pending_keeps_posted_at() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let at = Utc.with_ymd_and_hms(2026, 1, 6, 10, 0, 0).unwrap();

        store.mark_seen(&update("id-2", Some("matched include keyword: AI"), DeliveryUpdate::Pending)).await.unwrap();
        assert!(store.has_seen("id-2").await.unwrap().unwrap().delivery.is_pending());

        store.mark_seen(&update("id-2", None, DeliveryUpdate::Posted(at))).await.unwrap();
        store.mark_seen(&update("id-2", None, DeliveryUpdate::Pending)).await.unwrap();
        store.mark_seen(&update("id-2", None, DeliveryUpdate::Failed("boom".into()))).await.unwrap();

        let record = store.has_seen("id-2").await.unwrap().unwrap();
        assert_eq!(record.posted_at, Some(at));
        assert_eq!(record.delivery, DeliveryState::Posted { at });
        assert_eq!(record.match_reason.as_deref(), Some("matched include keyword: AI"));
    }

    #[tokio::test]
    async fn failed_delivery_keeps_reason_and_can_be_retried() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store.mark_seen(&update("id-3", Some("reason"), DeliveryUpdate::Pending)).await.unwrap();
        store.mark_seen(&update("id-3", None, DeliveryUpdate::Failed("http status 500".into()))).await.unwrap();
        let failed = store.has_seen("id-3").await.unwrap().unwrap();
        assert_eq!(
            failed.delivery,
            DeliveryState::PostFailed {
                reason: "http status 500".into()
            }
        );

        store.mark_seen(&update("id-3", None, DeliveryUpdate::Unchanged)).await.unwrap();
        assert!(matches!(
            store.has_seen("id-3").await.unwrap().unwrap().delivery,
            DeliveryState::PostFailed { .. }
        ));

        store.mark_seen(&update("id-3", None, DeliveryUpdate::Pending)).await.unwrap();
        assert!(store.has_seen("id-3").await.unwrap().unwrap().delivery.is_pending());
    }

    #[tokio::test]
    async fn later_writes_refresh_title_but_keep_first_seen() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.mark_seen(&update("id-4", None, DeliveryUpdate::Unchanged)).await.unwrap();
        let first = store.has_seen("id-4").await.unwrap().unwrap();

        let mut renamed = update("id-4", None, DeliveryUpdate::Unchanged);
        renamed.title = "AI for health systems (updated)";
        store.mark_seen(&renamed).await.unwrap();

        let second = store.has_seen("id-4").await.unwrap().unwrap();
        assert_eq!(second.title, "AI for health systems (updated)");
        assert_eq!(second.first_seen_at, first.first_seen_at);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2026, 2, 1, 9, 30, 0).unwrap();
        {
            let store = open_store(dir.path()).await;
            store.mark_seen(&update("id-5", Some("r"), DeliveryUpdate::Posted(at))).await.unwrap();
            store.close().await;
        }
        let reopened = open_store(dir.path()).await;
        let record = reopened.has_seen("id-5").await.unwrap().unwrap();
        assert_eq!(record.posted_at, Some(at));
    }
}
