use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::models::{PersistenceRecord, RecordKind};
use crate::infrastructure::error::{PersistenceError, PersistenceResult};

#[cfg(feature = "storage-sqlite")]
pub use sqlite::SqliteSink;

/// 持久化目标 trait
///
/// Implementations must apply a batch atomically: either every record of the
/// call is stored or none is.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    fn name(&self) -> &str;

    async fn write_batch(&self, kind: RecordKind, records: &[PersistenceRecord]) -> PersistenceResult<()>;
}

#[derive(Debug, Default)]
struct MemorySinkState {
    records: HashMap<RecordKind, Vec<PersistenceRecord>>,
    batches: usize,
    fail_next: usize,
}

/// In-process sink, used by tests and the load simulator
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemorySinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write calls fail with a transient error
    pub async fn fail_next(&self, count: usize) {
        self.state.lock().await.fail_next = count;
    }

    pub async fn records(&self, kind: RecordKind) -> Vec<PersistenceRecord> {
        self.state
            .lock()
            .await
            .records
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count(&self, kind: RecordKind) -> usize {
        self.state.lock().await.records.get(&kind).map_or(0, Vec::len)
    }

    pub async fn total(&self) -> usize {
        self.state.lock().await.records.values().map(Vec::len).sum()
    }

    /// Successful write calls so far
    pub async fn batches(&self) -> usize {
        self.state.lock().await.batches
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write_batch(&self, kind: RecordKind, records: &[PersistenceRecord]) -> PersistenceResult<()> {
        let mut state = self.state.lock().await;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(PersistenceError::transient(kind, records.len(), "injected sink failure"));
        }

        state.records.entry(kind).or_default().extend_from_slice(records);
        state.batches += 1;
        debug!(%kind, count = records.len(), "memory sink stored batch");
        Ok(())
    }
}

#[cfg(feature = "storage-sqlite")]
mod sqlite {
    use std::str::FromStr;

    use async_trait::async_trait;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use sqlx::SqlitePool;
    use tracing::{debug, info};

    use super::PersistenceSink;
    use crate::infrastructure::error::{PersistenceError, PersistenceResult};
    use crate::persistence::models::{PersistenceRecord, RecordKind};

    /// SQLite 持久化目标
    pub struct SqliteSink {
        pool: SqlitePool,
        table_name: String,
    }

    impl SqliteSink {
        /// Open (creating if missing) the database at `url` and ensure the table exists
        pub async fn connect(url: &str, max_connections: u32) -> PersistenceResult<Self> {
            let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .connect_with(options)
                .await?;

            Self::from_pool(pool, "classification_records").await
        }

        pub async fn from_pool(pool: SqlitePool, table_name: impl Into<String>) -> PersistenceResult<Self> {
            let sink = Self {
                pool,
                table_name: table_name.into(),
            };
            sink.create_tables().await?;
            Ok(sink)
        }

        async fn create_tables(&self) -> PersistenceResult<()> {
            let create_table_sql = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    enqueued_at TEXT NOT NULL
                )
                "#,
                self.table_name
            );
            sqlx::query(&create_table_sql).execute(&self.pool).await?;

            let index_sql = format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_kind ON {} (kind)",
                self.table_name, self.table_name
            );
            sqlx::query(&index_sql).execute(&self.pool).await?;

            info!("SQLite table '{}' created or verified", self.table_name);
            Ok(())
        }

        pub async fn count(&self, kind: RecordKind) -> PersistenceResult<i64> {
            let sql = format!("SELECT COUNT(*) FROM {} WHERE kind = ?", self.table_name);
            let count: i64 = sqlx::query_scalar(&sql)
                .bind(kind.as_str())
                .fetch_one(&self.pool)
                .await?;
            Ok(count)
        }

        /// Stored payloads for `kind` in insertion order
        pub async fn payloads(&self, kind: RecordKind) -> PersistenceResult<Vec<serde_json::Value>> {
            let sql = format!("SELECT payload FROM {} WHERE kind = ? ORDER BY id", self.table_name);
            let rows: Vec<String> = sqlx::query_scalar(&sql)
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?;

            rows.iter()
                .map(|raw| serde_json::from_str::<serde_json::Value>(raw).map_err(PersistenceError::from))
                .collect()
        }
    }

    #[async_trait]
    impl PersistenceSink for SqliteSink {
        fn name(&self) -> &str {
            "sqlite"
        }

        async fn write_batch(&self, kind: RecordKind, records: &[PersistenceRecord]) -> PersistenceResult<()> {
            let sql = format!(
                "INSERT INTO {} (kind, payload, enqueued_at) VALUES (?, ?, ?)",
                self.table_name
            );

            let mut tx = self.pool.begin().await?;
            for record in records {
                let payload = serde_json::to_string(&record.payload)?;
                sqlx::query(&sql)
                    .bind(kind.as_str())
                    .bind(payload)
                    .bind(record.enqueued_at.to_rfc3339())
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;

            debug!(%kind, count = records.len(), "sqlite sink committed batch");
            Ok(())
        }
    }

}
