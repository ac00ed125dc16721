//! Durable storage - the key-value table boundary, its SQLite implementation,
//! and the conversation/summary stores built on top of it
pub mod schema;
pub mod migration;
pub mod conversation_store;
pub mod summary_store;
pub use schema::*;
pub use migration::MigrationManager;
pub use conversation_store::DurableChatStorage;
pub use summary_store::SummaryStore;
use std::path::Path;
use std::sync::Arc;
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, error, info};

/// Minimal key-value table: single-item operations are atomic, nothing
/// spanning several items is.
#[async_trait]
pub trait ItemTable: Send + Sync {
    async fn put_item(&self, item: StoredItem) -> anyhow::Result<()>;

    async fn get_item(&self, key: &ItemKey) -> anyhow::Result<Option<StoredItem>>;

    /// Items in `partition_key` whose sort key starts with `sort_key_prefix`,
    /// ordered by sort key.
    async fn query_prefix(
        &self,
        partition_key: &str,
        sort_key_prefix: &str,
    ) -> anyhow::Result<Vec<StoredItem>>;

    /// Remove an item, returning what was stored.
    async fn delete_item(&self, key: &ItemKey) -> anyhow::Result<Option<StoredItem>>;
}

/// SQLite-backed [`ItemTable`]. Items past their expiry are invisible to
/// reads and removed by [`SqliteItemTable::purge_expired`].
pub struct SqliteItemTable {
    pool: Arc<Pool<SqliteConnectionManager>>,
    ttl_attribute: Option<String>,
}
impl SqliteItemTable {
    pub fn new(db_path: &Path, pool_size: u32) -> anyhow::Result<Self> {
        info!("Opening item table at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }
        info!("Item table initialized successfully");
        Ok(Self { pool: Arc::new(pool), ttl_attribute: None })
    }

    /// A private in-memory table. Every pooled connection would open its own
    /// empty database, so the pool holds exactly one long-lived connection.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        {
            let mut conn = pool.get()?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }
        Ok(Self { pool: Arc::new(pool), ttl_attribute: None })
    }

    /// Read item expiry (epoch seconds) from `attribute`.
    pub fn with_ttl_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.ttl_attribute = Some(attribute.into());
        self
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn get_stats(&self) -> anyhow::Result<TableStats> {
        let conn = self.get_conn()?;
        Ok(migration::get_table_stats(&conn, Utc::now().timestamp())?)
    }

    pub fn purge_expired(&self) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM items WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            [Utc::now().timestamp()],
        )?;
        info!("Purged {} expired items", deleted);
        Ok(deleted)
    }

    fn row_to_item(row: &Row) -> anyhow::Result<StoredItem> {
        let attributes_json: String = row.get(2)?;
        let attributes = serde_json::from_str(&attributes_json)
            .map_err(|e| anyhow::anyhow!("Attributes JSON error: {}", e))?;
        Ok(StoredItem {
            key: ItemKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
            attributes,
        })
    }
}

#[async_trait]
impl ItemTable for SqliteItemTable {
    async fn put_item(&self, item: StoredItem) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        let expires_at = self
            .ttl_attribute
            .as_deref()
            .and_then(|attribute| item.expires_at(attribute));
        let attributes_json = serde_json::to_string(&item.attributes)?;

        conn.execute(
            "INSERT OR REPLACE INTO items
             (partition_key, sort_key, attributes, expires_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &item.key.partition_key,
                &item.key.sort_key,
                attributes_json,
                expires_at,
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!("Put item {}/{}", item.key.partition_key, item.key.sort_key);
        Ok(())
    }

    async fn get_item(&self, key: &ItemKey) -> anyhow::Result<Option<StoredItem>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT partition_key, sort_key, attributes FROM items
             WHERE partition_key = ?1 AND sort_key = ?2
             AND (expires_at IS NULL OR expires_at > ?3)"
        )?;
        let mut rows = stmt.query(params![&key.partition_key, &key.sort_key, Utc::now().timestamp()])?;

        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_item(row)?))
        } else {
            Ok(None)
        }
    }

    async fn query_prefix(
        &self,
        partition_key: &str,
        sort_key_prefix: &str,
    ) -> anyhow::Result<Vec<StoredItem>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT partition_key, sort_key, attributes FROM items
             WHERE partition_key = ?1
             AND substr(sort_key, 1, length(?2)) = ?2
             AND (expires_at IS NULL OR expires_at > ?3)
             ORDER BY sort_key"
        )?;
        let mut rows = stmt.query(params![partition_key, sort_key_prefix, Utc::now().timestamp()])?;
        let mut items = Vec::new();

        while let Some(row) = rows.next()? {
            match Self::row_to_item(row) {
                Ok(item) => items.push(item),
                Err(e) => error!("Skipping unreadable item under {}: {}", partition_key, e),
            }
        }

        Ok(items)
    }

    async fn delete_item(&self, key: &ItemKey) -> anyhow::Result<Option<StoredItem>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let previous = tx
            .query_row(
                "SELECT partition_key, sort_key, attributes FROM items
                 WHERE partition_key = ?1 AND sort_key = ?2",
                params![&key.partition_key, &key.sort_key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()?;

        tx.execute(
            "DELETE FROM items WHERE partition_key = ?1 AND sort_key = ?2",
            params![&key.partition_key, &key.sort_key],
        )?;
        tx.commit()?;

        previous
            .map(|(partition_key, sort_key, attributes_json)| -> anyhow::Result<StoredItem> {
                let attributes = serde_json::from_str(&attributes_json)
                    .with_context(|| format!("Attributes JSON error in {}", sort_key))?;
                Ok(StoredItem { key: ItemKey::new(partition_key, sort_key), attributes })
            })
            .transpose()
    }
}

impl Drop for SqliteItemTable {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}
