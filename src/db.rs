//! Local SQLite database backing the persistent key-value store.
//!
//! Uses rusqlite with WAL mode. Holds the cached master, config, order
//! history and legacy blobs as JSON text under versioned keys; see
//! `storage.rs` for the typed accessors.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::SyncError;

/// Shared handle holding the database connection.
pub struct LocalDb {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

const DB_FILE_NAME: &str = "order-sheet.db";

/// Initialize the database at `{data_dir}/order-sheet.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<LocalDb, SyncError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| SyncError::LocalStore(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening local store at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Local store open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path).map_err(|e| {
                SyncError::LocalStore(format!("open failed after retry: {e}"))
            })?
        }
    };

    run_migrations(&conn)?;

    info!("Local store initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(LocalDb {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// In-memory store with the full schema. Nothing survives the process.
pub fn open_in_memory() -> Result<LocalDb, SyncError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
    run_migrations(&conn)?;
    Ok(LocalDb {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, SyncError> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Local store schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating local store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Migration v1: key-value table for cached documents.
fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_store (
            store_key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        SyncError::LocalStore(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1 (local_store table)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Key-value helpers
// ---------------------------------------------------------------------------

/// Raw value stored under `key`, if any.
pub fn get_value(conn: &Connection, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT value FROM local_store WHERE store_key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .unwrap_or_else(|e| {
        warn!(key, error = %e, "local store read failed");
        None
    })
}

/// Insert or replace the value under `key`.
pub fn set_value(conn: &Connection, key: &str, value: &str) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO local_store (store_key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(store_key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![key, value],
    )?;
    Ok(())
}

pub fn has_value(conn: &Connection, key: &str) -> bool {
    get_value(conn, key).is_some()
}


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_tables() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");
        let tables = table_names(&conn);
        assert!(tables.contains(&"local_store".to_string()));
        assert!(tables.contains(&"schema_version".to_string()));
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");
        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = std::env::temp_dir().join(format!("order-sheet-db-{}", std::process::id()));
        let db = init(&dir).expect("init file db");
        let mode: String = db
            .conn
            .lock()
            .unwrap()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        drop(db);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_value_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        assert!(get_value(&conn, "orderConfig_v5").is_none());
        set_value(&conn, "orderConfig_v5", "{\"staff\":\"田中\"}").expect("set");
        assert_eq!(
            get_value(&conn, "orderConfig_v5").as_deref(),
            Some("{\"staff\":\"田中\"}")
        );

        set_value(&conn, "orderConfig_v5", "{}").expect("update");
        assert_eq!(get_value(&conn, "orderConfig_v5").as_deref(), Some("{}"));
        assert!(has_value(&conn, "orderConfig_v5"));
        assert!(!has_value(&conn, "orderMaster_v5"));
    }
}
