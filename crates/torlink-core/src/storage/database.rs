//! Database handle.
//!
//! One SQLite connection behind a mutex, cloned cheaply into every store.
//! Each store call holds the lock for a single statement or transaction.

use super::schema::{CREATE_SCHEMA, SCHEMA_VERSION};
use crate::error::{Error, Result};
use rusqlite::{params, Connection, OpenFlags, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database file.
    pub path: String,
    /// Whether to use an in-memory database (for testing).
    pub in_memory: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: super::DEFAULT_DB_NAME.to_string(),
            in_memory: false,
        }
    }
}

/// Shared database handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database and apply the schema.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let conn = if config.in_memory {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = Path::new(&config.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::Storage(format!("failed to create directory: {}", e)))?;
                }
            }
            Connection::open_with_flags(
                &config.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        }
        .map_err(|e| Error::Storage(format!("failed to open database: {}", e)))?;

        // Another process may hold the write lock briefly.
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            PRAGMA secure_delete = ON;
            PRAGMA temp_store = MEMORY;
            "#,
        )
        .map_err(|e| Error::Storage(format!("failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open a fresh in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&DatabaseConfig {
            path: String::new(),
            in_memory: true,
        })
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(CREATE_SCHEMA)
                .map_err(|e| Error::Storage(format!("failed to create schema: {}", e)))?;

            let stored: Option<u32> = conn
                .query_row("SELECT version FROM schema_meta WHERE id = 1", [], |row| row.get(0))
                .ok();
            match stored {
                None => {
                    conn.execute(
                        "INSERT INTO schema_meta (id, version) VALUES (1, ?)",
                        params![SCHEMA_VERSION],
                    )?;
                }
                Some(v) if v > SCHEMA_VERSION => {
                    return Err(Error::StorageCorrupt(format!(
                        "schema version {} is newer than supported {}",
                        v, SCHEMA_VERSION
                    )));
                }
                Some(_) => {}
            }
            Ok(())
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))
    }

    /// Run `f` with the connection locked.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside a transaction. Any error rolls everything back.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Stored schema version.
    pub fn schema_version(&self) -> Result<u32> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT version FROM schema_meta WHERE id = 1", [], |row| {
                row.get(0)
            })?)
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Database")
    }
}
