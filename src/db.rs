//! SQLite database layer for the Kassa server.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers, and the serializable write envelope every engine mutation runs
//! in. Monetary columns are TEXT holding decimal strings; JSON columns are
//! TEXT normalized by the repository layer.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{PosError, PosResult};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Initialize the database at `db_path`.
///
/// Creates the parent directory if needed, opens the connection, applies
/// the connection pragmas, and brings the schema up to date. A file that
/// cannot be opened (corruption, torn WAL) is discarded and recreated once;
/// fiscal truth lives in the log rows, not in the file staying pristine.
pub fn init(db_path: &Path) -> PosResult<DbState> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| PosError::Database(format!("create data dir: {e}")))?;
        }
    }

    info!("Opening database at {}", db_path.display());

    let conn = match open_database(db_path) {
        Ok(conn) => conn,
        Err(first_err) => {
            warn!("Database open failed ({first_err}), recreating the file");
            for stale in [
                db_path.to_path_buf(),
                db_path.with_extension("db-wal"),
                db_path.with_extension("db-shm"),
            ] {
                let _ = fs::remove_file(stale);
            }
            open_database(db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: db_path.to_path_buf(),
    })
}

/// Open one connection with the pragmas every handle needs: WAL for
/// concurrent readers, enforced foreign keys, a bounded busy wait so lock
/// contention surfaces as SQLITE_BUSY instead of hanging.
fn open_database(path: &Path) -> PosResult<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Write envelope
// ---------------------------------------------------------------------------

/// Run `f` inside a serializable write envelope (`BEGIN IMMEDIATE`).
///
/// The envelope commits when `f` returns `Ok` and rolls back otherwise.
/// SQLITE_BUSY surfaces as `Conflict` so callers can retry. Fiscal signer
/// and printer calls must never run inside `f`.
pub fn with_envelope<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> PosResult<T>,
) -> PosResult<T> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(PosError::from)?;

    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT").map_err(PosError::from)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// As [`with_envelope`], retrying exactly once on a serialization conflict.
pub fn with_envelope_retry<T>(
    conn: &Connection,
    mut f: impl FnMut(&Connection) -> PosResult<T>,
) -> PosResult<T> {
    match with_envelope(conn, &mut f) {
        Err(e) if e.is_retryable() => {
            warn!("Write envelope conflict, retrying once: {e}");
            with_envelope(conn, &mut f)
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> PosResult<()> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| PosError::Database(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }
    if current < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

/// Migration v1: catalog tree and active transactions.
fn migrate_v1(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- company -> branch -> pos_device -> (category, item)
        CREATE TABLE IF NOT EXISTS companies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            company_full_name TEXT NOT NULL,
            meta_information TEXT NOT NULL DEFAULT '{}',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS branches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            company_id INTEGER NOT NULL REFERENCES companies(id),
            branch_name TEXT NOT NULL DEFAULT '{}',
            branch_address TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS pos_devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            branch_id INTEGER NOT NULL REFERENCES branches(id),
            pos_device_name TEXT NOT NULL DEFAULT '{}',
            pos_device_type TEXT DEFAULT 'DESKTOP',
            pos_device_external_number INTEGER DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pos_device_id INTEGER NOT NULL REFERENCES pos_devices(id),
            source_unique_identifier TEXT,
            category_names TEXT NOT NULL DEFAULT '{}',
            category_type TEXT NOT NULL DEFAULT 'other',
            default_linked_main_group_unique_identifier INTEGER,
            audit_trail TEXT NOT NULL DEFAULT '{}',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pos_device_id INTEGER NOT NULL REFERENCES pos_devices(id),
            associated_category_unique_identifier INTEGER NOT NULL REFERENCES categories(id),
            source_unique_identifier TEXT,
            display_names TEXT NOT NULL DEFAULT '{}',
            item_price_value TEXT NOT NULL DEFAULT '0',
            item_flags TEXT NOT NULL DEFAULT '{}',
            audit_trail TEXT NOT NULL DEFAULT '{}',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- active_transactions (receipts under construction)
        CREATE TABLE IF NOT EXISTS active_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'parked', 'finished', 'cancelled')),
            resolution_status TEXT NOT NULL DEFAULT 'none'
                CHECK (resolution_status IN ('none', 'pending', 'postponed')),
            user_id INTEGER,
            business_date TEXT NOT NULL,
            total_amount TEXT NOT NULL DEFAULT '0',
            tax_amount TEXT NOT NULL DEFAULT '0',
            payment_type TEXT,
            payment_amount TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS active_transaction_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            active_transaction_id INTEGER NOT NULL REFERENCES active_transactions(id),
            item_id INTEGER NOT NULL,
            quantity TEXT NOT NULL,
            unit_price TEXT NOT NULL,
            total_price TEXT NOT NULL,
            tax_rate TEXT NOT NULL,
            tax_amount TEXT NOT NULL,
            parent_transaction_item_id INTEGER REFERENCES active_transaction_items(id),
            notes TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_items_category
            ON items(associated_category_unique_identifier);
        CREATE INDEX IF NOT EXISTS idx_active_tx_status ON active_transactions(status);
        CREATE INDEX IF NOT EXISTS idx_active_tx_uuid ON active_transactions(uuid);
        CREATE INDEX IF NOT EXISTS idx_active_tx_items_tx
            ON active_transaction_items(active_transaction_id);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key
            ON local_settings(setting_category, setting_key);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        PosError::Database(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: fiscal log, pending operations, operational log.
fn migrate_v2(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        -- fiscal_log (append-only; rows are never updated or deleted)
        CREATE TABLE IF NOT EXISTS fiscal_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_uuid TEXT NOT NULL,
            event_type TEXT NOT NULL,
            user_id INTEGER,
            payload TEXT NOT NULL DEFAULT '{}',
            signature TEXT,
            signature_counter INTEGER,
            timestamp_utc TEXT NOT NULL
        );

        -- pending_fiscal_operations (two-phase write-ahead records)
        CREATE TABLE IF NOT EXISTS pending_fiscal_operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_id TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (status IN ('PENDING', 'TSE_SUCCESS', 'TSE_FAILED')),
            request_payload TEXT NOT NULL,
            signed_payload TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- operational_log (non-fiscal events feeding fiscal reconstruction)
        CREATE TABLE IF NOT EXISTS operational_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            transaction_uuid TEXT,
            user_id INTEGER,
            payload TEXT NOT NULL DEFAULT '{}',
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_fiscal_log_tx_uuid ON fiscal_log(transaction_uuid);
        CREATE INDEX IF NOT EXISTS idx_pending_fiscal_status
            ON pending_fiscal_operations(status);
        CREATE INDEX IF NOT EXISTS idx_operational_log_tx_uuid
            ON operational_log(transaction_uuid);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        PosError::Database(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (fiscal tables)");
    Ok(())
}

/// Migration v3: users, roles, storno accounting, pending changes.
fn migrate_v3(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS roles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            role_name TEXT UNIQUE NOT NULL,
            permissions TEXT NOT NULL DEFAULT '[]',
            can_approve_changes INTEGER NOT NULL DEFAULT 0,
            can_manage_users INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT UNIQUE NOT NULL,
            full_name TEXT,
            password_hash TEXT NOT NULL,
            role_id INTEGER NOT NULL REFERENCES roles(id),
            storno_daily_limit TEXT NOT NULL DEFAULT '50',
            storno_emergency_limit TEXT NOT NULL DEFAULT '25',
            storno_used_today TEXT NOT NULL DEFAULT '0',
            trust_score TEXT NOT NULL DEFAULT '50',
            is_active INTEGER NOT NULL DEFAULT 1,
            force_password_change INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS storno_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_uuid TEXT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            amount TEXT NOT NULL,
            reason TEXT NOT NULL DEFAULT '',
            is_emergency INTEGER NOT NULL DEFAULT 0,
            approval_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (approval_status IN ('automatic', 'pending', 'approved', 'rejected')),
            credit_used TEXT NOT NULL DEFAULT '0',
            approved_by INTEGER,
            approver_notes TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS pending_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            change_type TEXT NOT NULL,
            target_entity TEXT NOT NULL,
            target_id INTEGER,
            proposed_payload TEXT NOT NULL DEFAULT '{}',
            priority TEXT NOT NULL DEFAULT 'normal',
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'approved', 'rejected')),
            requested_by INTEGER,
            reviewed_by INTEGER,
            review_notes TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_storno_log_status ON storno_log(approval_status);
        CREATE INDEX IF NOT EXISTS idx_pending_changes_status ON pending_changes(status);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        PosError::Database(format!("migration v3: {e}"))
    })?;

    info!("Applied migration v3 (users, storno, approvals)");
    Ok(())
}

/// Migration v4: layouts, full-text index, embedding side table.
fn migrate_v4(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS layouts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            layout_name TEXT NOT NULL,
            categories_snapshot TEXT NOT NULL DEFAULT '[]',
            source_type TEXT NOT NULL DEFAULT 'manual',
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- 768-dim embedding vectors, little-endian f32 blobs
        CREATE TABLE IF NOT EXISTS item_embeddings (
            item_id INTEGER PRIMARY KEY,
            embedding BLOB NOT NULL,
            semantic_hash TEXT NOT NULL,
            dims INTEGER NOT NULL DEFAULT 768
        );

        -- Full-text index over item and category display names
        CREATE VIRTUAL TABLE IF NOT EXISTS items_fts USING fts5(
            item_id UNINDEXED,
            name,
            category_name
        );

        CREATE INDEX IF NOT EXISTS idx_layouts_active ON layouts(is_active);

        INSERT INTO schema_version (version) VALUES (4);
        ",
    )
    .map_err(|e| {
        error!("Migration v4 failed: {e}");
        PosError::Database(format!("migration v4: {e}"))
    })?;

    info!("Applied migration v4 (layouts, search tables)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings store
// ---------------------------------------------------------------------------

/// Read one value from the category/key settings store. Absence is a
/// normal outcome (`Ok(None)`), not an error.
pub fn setting_get(conn: &Connection, category: &str, key: &str) -> PosResult<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT setting_value FROM local_settings
          WHERE setting_category = ?1 AND setting_key = ?2
          LIMIT 1",
    )?;
    let mut rows = stmt.query(params![category, key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Write one value into the settings store, replacing any previous value
/// under the same category/key and bumping `updated_at`.
pub fn setting_put(conn: &Connection, category: &str, key: &str, value: &str) -> PosResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key)
         DO UPDATE SET setting_value = ?3, updated_at = datetime('now')",
        params![category, key, value],
    )?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// Open a fresh in-memory database with the full schema (test helper).
#[cfg(test)]
pub fn test_db() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_cleanly() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        run_migrations(&conn).expect("re-running migrations is a no-op");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_settings_roundtrip() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        assert!(setting_get(&conn, "system", "missing").unwrap().is_none());
        setting_put(&conn, "system", "storno_reset_date", "2026-08-01").unwrap();
        assert_eq!(
            setting_get(&conn, "system", "storno_reset_date")
                .unwrap()
                .as_deref(),
            Some("2026-08-01")
        );
        setting_put(&conn, "system", "storno_reset_date", "2026-08-02").unwrap();
        assert_eq!(
            setting_get(&conn, "system", "storno_reset_date")
                .unwrap()
                .as_deref(),
            Some("2026-08-02")
        );
    }

    #[test]
    fn test_envelope_commits() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        with_envelope(&conn, |c| {
            c.execute(
                "INSERT INTO companies (company_full_name) VALUES ('Testco')",
                [],
            )
            .map_err(PosError::from)?;
            Ok(())
        })
        .unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM companies", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_envelope_rolls_back_on_error() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let result: PosResult<()> = with_envelope(&conn, |c| {
            c.execute(
                "INSERT INTO companies (company_full_name) VALUES ('Doomed')",
                [],
            )
            .map_err(PosError::from)?;
            Err(PosError::Validation("abort".into()))
        });
        assert!(result.is_err());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM companies", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_fts_table_available() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO items_fts (item_id, name, category_name) VALUES (1, 'Coffee', 'Drinks')",
            [],
        )
        .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM items_fts WHERE items_fts MATCH 'coffee'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }
}
