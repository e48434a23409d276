//! Durable local database
//!
//! One SQLite file holds the entity cache, the mutation queue, the dead-letter
//! log and the legacy key-value namespace. The connection is opened on first
//! use and cached for the lifetime of the `Database` handle, which is shared
//! (`Arc<Database>`) by every component that needs it.

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

enum Location {
    File(PathBuf),
    Memory,
}

pub struct Database {
    location: Location,
    conn: OnceCell<Mutex<Connection>>,
}

impl Database {
    /// Describe a database at `path`. Nothing is opened until first use.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            location: Location::File(path.as_ref().to_path_buf()),
            conn: OnceCell::new(),
        }
    }

    /// A private in-memory database, gone when the handle is dropped
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            conn: OnceCell::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.get().is_some()
    }

    /// Lock the connection, opening it and creating the schema on first call
    pub fn connection(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        let conn = self.conn.get_or_try_init(|| self.open().map(Mutex::new))?;
        Ok(conn.lock())
    }

    fn open(&self) -> EngineResult<Connection> {
        let conn = match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                tracing::debug!("Opening local database at {}", path.display());
                Connection::open(path)?
            }
            Location::Memory => Connection::open_in_memory()?,
        };

        init_schema(&conn)?;
        recover_interrupted(&conn)?;
        Ok(conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let location = match &self.location {
            Location::File(path) => path.display().to_string(),
            Location::Memory => ":memory:".to_string(),
        };
        f.debug_struct("Database")
            .field("location", &location)
            .field("open", &self.is_open())
            .finish()
    }
}

fn init_schema(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entities (
             id TEXT PRIMARY KEY,
             owner_id TEXT NOT NULL,
             data TEXT NOT NULL,
             updated_at INTEGER NOT NULL,
             cached_at INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_entities_owner ON entities(owner_id);

         CREATE TABLE IF NOT EXISTS pending_mutations (
             seq INTEGER PRIMARY KEY AUTOINCREMENT,
             id TEXT NOT NULL UNIQUE,
             owner_id TEXT NOT NULL,
             kind TEXT NOT NULL,
             target_id TEXT NOT NULL,
             payload TEXT,
             status TEXT NOT NULL DEFAULT 'pending',
             created_at INTEGER NOT NULL,
             retry_count INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX IF NOT EXISTS idx_pending_created ON pending_mutations(created_at, seq);

         CREATE TABLE IF NOT EXISTS dead_letters (
             id TEXT PRIMARY KEY,
             owner_id TEXT NOT NULL,
             kind TEXT NOT NULL,
             target_id TEXT NOT NULL,
             payload TEXT,
             created_at INTEGER NOT NULL,
             retry_count INTEGER NOT NULL,
             dropped_at INTEGER NOT NULL,
             last_error TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS legacy_kv (
             key TEXT PRIMARY KEY,
             value TEXT NOT NULL
         );",
    )
    .map_err(EngineError::from)
}

/// A pass that died mid-flight leaves entries in `syncing`; nobody owns them now.
fn recover_interrupted(conn: &Connection) -> EngineResult<()> {
    let reset = conn.execute(
        "UPDATE pending_mutations SET status = 'pending' WHERE status = 'syncing'",
        [],
    )?;
    if reset > 0 {
        tracing::warn!("Reset {} interrupted mutations back to pending", reset);
    }
    Ok(())
}
