//! Checkpoint Store: the single writer of source checkpoints and processed
//! markers. Every write is a single-key upsert.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fdp_core::{CheckpointStatus, Cursor, CursorError, ProcessedMarker, SourceCheckpoint};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint for {source_key} would regress from {previous} to {attempted}")]
    Regression {
        source_key: String,
        previous: String,
        attempted: String,
    },
    #[error(transparent)]
    Cursor(#[from] CursorError),
    #[error("corrupt checkpoint row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_checkpoint(&self, source_key: &str) -> Result<Option<SourceCheckpoint>, CheckpointError>;

    /// Upserts a checkpoint. Unless `force` is set, a cursor that would move
    /// backwards is rejected with [`CheckpointError::Regression`].
    async fn put_checkpoint(&self, checkpoint: &SourceCheckpoint, force: bool) -> Result<(), CheckpointError>;

    async fn list_checkpoints(&self) -> Result<Vec<SourceCheckpoint>, CheckpointError>;

    async fn get_marker(&self, item_id: &str) -> Result<Option<ProcessedMarker>, CheckpointError>;

    /// Overwrites any existing marker for the same item.
    async fn put_marker(&self, marker: &ProcessedMarker) -> Result<(), CheckpointError>;

    async fn marker_count(&self) -> Result<usize, CheckpointError>;

    async fn is_processed(&self, item_id: &str) -> Result<bool, CheckpointError> {
        Ok(self
            .get_marker(item_id)
            .await?
            .map(|marker| marker.processed)
            .unwrap_or(false))
    }
}

fn ensure_forward(
    previous: Option<&SourceCheckpoint>,
    next: &SourceCheckpoint,
    force: bool,
) -> Result<(), CheckpointError> {
    let Some(previous) = previous else {
        return Ok(());
    };
    if !force && next.regresses_from(previous)? {
        return Err(CheckpointError::Regression {
            source_key: next.source_key.clone(),
            previous: display_cursor(previous.cursor.as_ref()),
            attempted: display_cursor(next.cursor.as_ref()),
        });
    }
    Ok(())
}

fn display_cursor(cursor: Option<&Cursor>) -> String {
    cursor.map(ToString::to_string).unwrap_or_else(|| "<none>".to_string())
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, SourceCheckpoint>>,
    markers: RwLock<HashMap<String, ProcessedMarker>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get_checkpoint(&self, source_key: &str) -> Result<Option<SourceCheckpoint>, CheckpointError> {
        Ok(self.checkpoints.read().await.get(source_key).cloned())
    }

    async fn put_checkpoint(&self, checkpoint: &SourceCheckpoint, force: bool) -> Result<(), CheckpointError> {
        let mut map = self.checkpoints.write().await;
        ensure_forward(map.get(&checkpoint.source_key), checkpoint, force)?;
        map.insert(checkpoint.source_key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<SourceCheckpoint>, CheckpointError> {
        let mut all = self.checkpoints.read().await.values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| a.source_key.cmp(&b.source_key));
        Ok(all)
    }

    async fn get_marker(&self, item_id: &str) -> Result<Option<ProcessedMarker>, CheckpointError> {
        Ok(self.markers.read().await.get(item_id).cloned())
    }

    async fn put_marker(&self, marker: &ProcessedMarker) -> Result<(), CheckpointError> {
        self.markers
            .write()
            .await
            .insert(marker.item_id.clone(), marker.clone());
        Ok(())
    }

    async fn marker_count(&self) -> Result<usize, CheckpointError> {
        Ok(self.markers.read().await.len())
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS source_checkpoints (
        source_key      TEXT PRIMARY KEY,
        cursor          TEXT,
        fingerprint     TEXT,
        status          TEXT NOT NULL,
        last_success_at TEXT,
        updated_at      TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS processed_markers (
        item_id        TEXT PRIMARY KEY,
        processed      INTEGER NOT NULL,
        method         TEXT NOT NULL,
        output_pointer TEXT NOT NULL,
        processed_at   TEXT NOT NULL
    )
    "#,
];

/// Embedded-database backend.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Opens (creating if missing) a database such as `sqlite:state/checkpoints.db`.
    pub async fn connect(url: &str) -> Result<Self, CheckpointError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// A private in-memory database; one connection so every query sees the
    /// same data.
    pub async fn in_memory() -> Result<Self, CheckpointError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, CheckpointError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, CheckpointError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| CheckpointError::Corrupt(format!("bad timestamp {value:?}: {err}")))
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<SourceCheckpoint, CheckpointError> {
    let cursor: Option<String> = row.try_get("cursor")?;
    let status: String = row.try_get("status")?;
    let last_success_at: Option<String> = row.try_get("last_success_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(SourceCheckpoint {
        source_key: row.try_get("source_key")?,
        cursor: cursor.as_deref().map(serde_json::from_str).transpose()?,
        fingerprint: row.try_get("fingerprint")?,
        status: CheckpointStatus::parse(&status)
            .ok_or_else(|| CheckpointError::Corrupt(format!("unknown status {status:?}")))?,
        last_success_at: last_success_at.as_deref().map(parse_ts).transpose()?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn marker_from_row(row: &SqliteRow) -> Result<ProcessedMarker, CheckpointError> {
    let processed: i64 = row.try_get("processed")?;
    let processed_at: String = row.try_get("processed_at")?;
    Ok(ProcessedMarker {
        item_id: row.try_get("item_id")?,
        processed: processed != 0,
        method: row.try_get("method")?,
        output_pointer: row.try_get("output_pointer")?,
        processed_at: parse_ts(&processed_at)?,
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get_checkpoint(&self, source_key: &str) -> Result<Option<SourceCheckpoint>, CheckpointError> {
        let row = sqlx::query("SELECT * FROM source_checkpoints WHERE source_key = ?")
            .bind(source_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn put_checkpoint(&self, checkpoint: &SourceCheckpoint, force: bool) -> Result<(), CheckpointError> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("SELECT * FROM source_checkpoints WHERE source_key = ?")
            .bind(&checkpoint.source_key)
            .fetch_optional(&mut *tx)
            .await?;
        let existing = existing.as_ref().map(checkpoint_from_row).transpose()?;
        ensure_forward(existing.as_ref(), checkpoint, force)?;

        let cursor = checkpoint.cursor.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO source_checkpoints (source_key, cursor, fingerprint, status, last_success_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_key) DO UPDATE SET
                cursor = excluded.cursor,
                fingerprint = excluded.fingerprint,
                status = excluded.status,
                last_success_at = excluded.last_success_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.source_key)
        .bind(cursor)
        .bind(&checkpoint.fingerprint)
        .bind(checkpoint.status.as_str())
        .bind(checkpoint.last_success_at.map(|ts| ts.to_rfc3339()))
        .bind(checkpoint.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<SourceCheckpoint>, CheckpointError> {
        let rows = sqlx::query("SELECT * FROM source_checkpoints ORDER BY source_key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn get_marker(&self, item_id: &str) -> Result<Option<ProcessedMarker>, CheckpointError> {
        let row = sqlx::query("SELECT * FROM processed_markers WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(marker_from_row).transpose()
    }

    async fn put_marker(&self, marker: &ProcessedMarker) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            INSERT INTO processed_markers (item_id, processed, method, output_pointer, processed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(item_id) DO UPDATE SET
                processed = excluded.processed,
                method = excluded.method,
                output_pointer = excluded.output_pointer,
                processed_at = excluded.processed_at
            "#,
        )
        .bind(&marker.item_id)
        .bind(i64::from(marker.processed))
        .bind(&marker.method)
        .bind(&marker.output_pointer)
        .bind(marker.processed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn marker_count(&self) -> Result<usize, CheckpointError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_markers")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn marker(item_id: &str) -> ProcessedMarker {
        ProcessedMarker {
            item_id: item_id.into(),
            processed: true,
            method: "html_table".into(),
            output_pointer: format!("normalized:{item_id}"),
            processed_at: Utc::now(),
        }
    }

    async fn exercise(store: &dyn CheckpointStore) {
        assert!(store.get_checkpoint("filings-2024").await.unwrap().is_none());

        let first = SourceCheckpoint::new("filings-2024")
            .advanced(Some(Cursor::Seq(100)), CheckpointStatus::RateLimited)
            .with_fingerprint(Some("abc".into()));
        store.put_checkpoint(&first, false).await.unwrap();

        let loaded = store.get_checkpoint("filings-2024").await.unwrap().unwrap();
        assert_eq!(loaded.cursor, Some(Cursor::Seq(100)));
        assert_eq!(loaded.status, CheckpointStatus::RateLimited);
        assert_eq!(loaded.fingerprint.as_deref(), Some("abc"));

        let mut backwards = loaded.clone();
        backwards.cursor = Some(Cursor::Seq(40));
        let err = store.put_checkpoint(&backwards, false).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Regression { .. }));
        store.put_checkpoint(&backwards, true).await.unwrap();
        assert_eq!(
            store.get_checkpoint("filings-2024").await.unwrap().unwrap().cursor,
            Some(Cursor::Seq(40))
        );

        assert!(!store.is_processed("doc-1").await.unwrap());
        store.put_marker(&marker("doc-1")).await.unwrap();
        store.put_marker(&marker("doc-1")).await.unwrap();
        assert!(store.is_processed("doc-1").await.unwrap());
        assert_eq!(store.marker_count().await.unwrap(), 1);
        assert_eq!(store.list_checkpoints().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryCheckpointStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_contract() {
        let store = SqliteCheckpointStore::in_memory().await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("checkpoints.db").display());
        {
            let store = SqliteCheckpointStore::connect(&url).await.unwrap();
            let cp = SourceCheckpoint::new("bills")
                .advanced(Some(Cursor::Token("2024-06-01".into())), CheckpointStatus::Completed);
            store.put_checkpoint(&cp, false).await.unwrap();
            store.put_marker(&marker("bill-9")).await.unwrap();
            store.close().await;
        }
        let store = SqliteCheckpointStore::connect(&url).await.unwrap();
        let cp = store.get_checkpoint("bills").await.unwrap().unwrap();
        assert_eq!(cp.cursor, Some(Cursor::Token("2024-06-01".into())));
        assert!(store.is_processed("bill-9").await.unwrap());
    }
}
