use async_trait::async_trait;
use log::debug;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::KvStore;
use crate::error::StoreResult;
use crate::queries::{ddl, kv};

/// SQLite-backed store; one file per recording store
///
/// WAL mode and a busy timeout let several processes share the file. Every
/// conditional write is a single statement, so `compare_and_swap` is atomic
/// across connections.
#[derive(Clone)]
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    /// Open (creating if needed) the database at `path`
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        debug!("SQLite store: {}", path.display());
        Ok(store)
    }

    /// Private in-memory database, mostly for tests
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(&ddl::create_kv_entries_table())
            .execute(&self.pool)
            .await?;
        sqlx::query(&ddl::create_object_type_index())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let row = sqlx::query(&kv::select_value(key))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<Vec<u8>, _>(0)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &[u8], index: Option<&str>) -> StoreResult<()> {
        sqlx::query(&kv::upsert(key, value, index))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        sqlx::query(&kv::delete(key)).execute(&self.pool).await?;
        Ok(())
    }

    async fn query_by_index(&self, index: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query(&kv::select_by_object_type(index))
            .fetch_all(&self.pool)
            .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push((row.try_get::<String, _>(0)?, row.try_get::<Vec<u8>, _>(1)?));
        }
        Ok(entries)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> StoreResult<bool> {
        let sql = match (expected, new) {
            (None, Some(value)) => kv::insert_if_absent(key, value),
            (Some(current), Some(value)) => kv::update_if_matches(key, current, value),
            (Some(current), None) => kv::delete_if_matches(key, current),
            (None, None) => return Ok(self.get(key).await?.is_none()),
        };
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}
