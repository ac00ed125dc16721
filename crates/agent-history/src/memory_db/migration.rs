//! Database migration system

use rusqlite::{Connection, Result, OptionalExtension};
use tracing::{info, warn, error};

use crate::memory_db::schema::TableStats;

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }
    
    /// Initialize database with current schema
    pub fn initialize_database(&mut self) -> Result<()> {
        info!("Initializing item table schema...");
        
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        
        let current_version = self.get_current_version()?;
        info!("Current database schema version: {}", current_version);
        
        self.apply_migrations()?;
        
        Ok(())
    }
    
    /// Apply every migration not yet recorded, each in its own transaction
    fn apply_migrations(&mut self) -> Result<()> {
        for (version, migration_sql) in get_migrations() {
            if !self.has_migration_applied(version)? {
                info!("Applying migration {}...", version);
                
                let tx = self.conn.transaction()?;
                
                if let Err(e) = tx.execute_batch(migration_sql) {
                    error!("Failed to apply migration {}: {}", version, e);
                    return Err(e);
                }
                
                tx.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [version],
                )?;
                
                tx.commit()?;
                
                info!("Migration {} applied successfully", version);
            }
        }
        
        Ok(())
    }
    
    pub fn get_current_version(&self) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .or_else(|_| Ok(0))
    }
    
    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|result| result.is_some())
    }
}

fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![
        (1, include_str!("migrations/001_initial.sql")),
        (2, include_str!("migrations/002_add_expiry_index.sql")),
    ]
}

/// Row counts and file size. Only performs read queries.
pub fn get_table_stats(conn: &Connection, now_epoch_seconds: i64) -> Result<TableStats> {
    let total_items: i64 = conn
        .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
        .unwrap_or_else(|e| {
            warn!("Failed to count items: {}", e);
            0
        });

    let expiring_items: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM items WHERE expires_at IS NOT NULL AND expires_at > ?1",
            [now_epoch_seconds],
            |row| row.get(0),
        )
        .unwrap_or(0);
    
    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    
    Ok(TableStats {
        total_items,
        expiring_items,
        database_size_bytes,
    })
}
