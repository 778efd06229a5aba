use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error};

use crate::model::{DataType, ItemId, OperationRecord, OperationState};
use crate::record_store::RecordStore;
use crate::{Error, Result};

pub async fn open_record_db(path: &Path) -> Result<SqlitePool> {
    debug!(
        event = "sqlite.open",
        db_path = %path.display(),
        create_if_missing = true,
        "sqlite.open"
    );
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| {
            error!(
                event = "io.sqlite.connect_failed",
                db_path = %path.display(),
                error = %e,
                "io.sqlite.connect_failed"
            );
            e
        })?;

    sqlx::migrate!().run(&pool).await.map_err(|e| {
        error!(
            event = "io.sqlite.migrate_failed",
            db_path = %path.display(),
            error = %e,
            "io.sqlite.migrate_failed"
        );
        e
    })?;
    Ok(pool)
}

/// [`RecordStore`] on SQLite. The single-connection pool serializes writers.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_record_db(path).await?))
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_db_bytes(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

fn from_db_bytes(bytes: i64) -> u64 {
    u64::try_from(bytes).unwrap_or(0)
}

impl RecordStore for SqliteRecordStore {
    fn previous_bytes<'a>(
        &'a self,
        item: &'a ItemId,
        data_type: DataType,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u64>>> + Send + 'a>> {
        Box::pin(async move {
            let row = sqlx::query(
                r#"
                SELECT bytes
                FROM slice_bytes
                WHERE item_id = ? AND data_type = ?
                "#,
            )
            .bind(item.as_str())
            .bind(data_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(|r| from_db_bytes(r.get::<i64, _>("bytes"))))
        })
    }

    fn record_bytes<'a>(
        &'a self,
        item: &'a ItemId,
        data_type: DataType,
        bytes: u64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO slice_bytes (item_id, data_type, bytes, updated_at)
                VALUES (?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
                ON CONFLICT (item_id, data_type) DO UPDATE SET
                    bytes = excluded.bytes,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(item.as_str())
            .bind(data_type.as_str())
            .bind(to_db_bytes(bytes))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn upsert_operation<'a>(
        &'a self,
        run_id: &'a str,
        item: &'a ItemId,
        data_type: DataType,
        record: &'a OperationRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO operations (run_id, item_id, data_type, state, bytes, log, content, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
                ON CONFLICT (run_id, item_id, data_type) DO UPDATE SET
                    state = excluded.state,
                    bytes = excluded.bytes,
                    log = excluded.log,
                    content = excluded.content,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(run_id)
            .bind(item.as_str())
            .bind(data_type.as_str())
            .bind(record.state.as_str())
            .bind(to_db_bytes(record.bytes))
            .bind(&record.log)
            .bind(record.content.as_deref())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn operation<'a>(
        &'a self,
        run_id: &'a str,
        item: &'a ItemId,
        data_type: DataType,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OperationRecord>>> + Send + 'a>> {
        Box::pin(async move {
            let row = sqlx::query(
                r#"
                SELECT state, bytes, log, content
                FROM operations
                WHERE run_id = ? AND item_id = ? AND data_type = ?
                "#,
            )
            .bind(run_id)
            .bind(item.as_str())
            .bind(data_type.as_str())
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let state: String = row.get("state");
            let state = OperationState::parse(&state).ok_or_else(|| Error::InvalidConfig {
                message: format!("unknown operation state in record db: {state}"),
            })?;
            Ok(Some(OperationRecord {
                state,
                bytes: from_db_bytes(row.get::<i64, _>("bytes")),
                log: row.get("log"),
                content: row.get("content"),
            }))
        })
    }
}
