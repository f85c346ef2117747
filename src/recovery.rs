//! Startup recovery and initialization guard.
//!
//! Runs once before the dispatcher accepts traffic:
//! 1. validate the schema structure (fatal on mismatch)
//! 2. ensure the administrative principal exists
//! 3. commit fiscal operations that were signed but not committed
//! 4. flag transactions left active by a previous session for manual
//!    resolution
//!
//! Nothing here talks to the network; the signer is not needed because
//! recovered operations already carry their signature data.

use rusqlite::Connection;
use serde_json::json;
use tracing::{error, info, warn};

use crate::db::{with_envelope, DbState};
use crate::error::{PosError, PosResult};
use crate::fiscal;
use crate::models::{now_utc, PendingOpStatus, ResolutionStatus};

/// Well-known initial administrator credential. The account is created with
/// `force_password_change` so it cannot be used productively as-is.
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin";

/// Permissions granted to the bootstrap administrator role.
const ADMIN_PERMISSIONS: &[&str] = &[
    "view_orders",
    "create_order",
    "update_order",
    "finish_order",
    "perform_storno",
    "approve_changes",
    "manage_users",
    "manage_layouts",
    "import_catalog",
    "view_reports",
];

/// Tables (and a marker column each) the core cannot run without.
const REQUIRED_TABLES: &[(&str, &str)] = &[
    ("active_transactions", "resolution_status"),
    ("active_transaction_items", "parent_transaction_item_id"),
    ("fiscal_log", "signature_counter"),
    ("pending_fiscal_operations", "signed_payload"),
    ("operational_log", "transaction_uuid"),
    ("users", "storno_used_today"),
    ("roles", "can_approve_changes"),
    ("storno_log", "credit_used"),
    ("pending_changes", "proposed_payload"),
    ("layouts", "is_active"),
    ("items", "item_price_value"),
    ("categories", "category_type"),
    ("item_embeddings", "semantic_hash"),
];

/// Summary of one startup recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub committed_operations: usize,
    pub failed_operations: usize,
    pub operations_for_review: usize,
    pub transactions_marked_pending: usize,
    pub admin_created: bool,
}

/// Full startup sequence. Errors here are fatal to the process.
pub fn run_startup(db: &DbState) -> PosResult<RecoveryReport> {
    {
        let conn = db.conn.lock()?;
        validate_schema(&conn)?;
    }

    let mut report = RecoveryReport {
        admin_created: ensure_admin_principal(db)?,
        ..Default::default()
    };

    recover_pending_fiscal_operations(db, &mut report)?;
    report.transactions_marked_pending = run_recovery_process(db)?;

    info!(
        committed = report.committed_operations,
        for_review = report.operations_for_review,
        marked_pending = report.transactions_marked_pending,
        "Startup recovery complete"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Schema validation
// ---------------------------------------------------------------------------

/// Verify every required table and marker column exists.
pub fn validate_schema(conn: &Connection) -> PosResult<()> {
    for (table, column) in REQUIRED_TABLES {
        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table','view') AND name = ?1",
                [table],
                |row| row.get::<_, i64>(0).map(|n| n > 0),
            )
            .map_err(PosError::from)?;
        if !exists {
            error!(table, "Schema validation failed: table missing");
            return Err(PosError::Database(format!("required table {table} missing")));
        }

        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        if !columns.iter().any(|c| c == column) {
            error!(table, column, "Schema validation failed: column missing");
            return Err(PosError::Database(format!(
                "required column {table}.{column} missing"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Administrative principal
// ---------------------------------------------------------------------------

/// Ensure at least one role that can approve changes and one active user
/// holding it. Returns true when the default administrator was created.
pub fn ensure_admin_principal(db: &DbState) -> PosResult<bool> {
    let conn = db.conn.lock()?;

    let role_id: i64 = match conn
        .query_row(
            "SELECT id FROM roles WHERE can_approve_changes = 1 AND can_manage_users = 1
             ORDER BY id LIMIT 1",
            [],
            |row| row.get(0),
        ) {
        Ok(id) => id,
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            let permissions = serde_json::to_string(ADMIN_PERMISSIONS)?;
            conn.execute(
                "INSERT INTO roles (role_name, permissions, can_approve_changes, can_manage_users)
                 VALUES ('administrator', ?1, 1, 1)",
                [permissions],
            )?;
            info!("Created administrator role");
            conn.last_insert_rowid()
        }
        Err(e) => return Err(e.into()),
    };

    let admin_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM users WHERE role_id = ?1 AND is_active = 1",
            [role_id],
            |row| row.get::<_, i64>(0).map(|n| n > 0),
        )
        .map_err(PosError::from)?;

    if admin_exists {
        return Ok(false);
    }

    let hash = bcrypt::hash(DEFAULT_ADMIN_PASSWORD, bcrypt::DEFAULT_COST)
        .map_err(|e| PosError::Internal(format!("bcrypt hash: {e}")))?;
    conn.execute(
        "INSERT INTO users (username, full_name, password_hash, role_id, force_password_change)
         VALUES (?1, 'Administrator', ?2, ?3, 1)",
        rusqlite::params![DEFAULT_ADMIN_USERNAME, hash, role_id],
    )?;
    warn!(
        username = DEFAULT_ADMIN_USERNAME,
        "Created default administrator with initial credential; password change is forced"
    );
    Ok(true)
}

// ---------------------------------------------------------------------------
// Fiscal recovery
// ---------------------------------------------------------------------------

/// Commit every signed-but-uncommitted fiscal operation; leave `PENDING` and
/// `TSE_FAILED` rows intact for manual review.
///
/// The original event type died with the crash, so recovered entries commit
/// under the generic `recovered_transaction` type.
fn recover_pending_fiscal_operations(db: &DbState, report: &mut RecoveryReport) -> PosResult<()> {
    let pending = {
        let conn = db.conn.lock()?;
        fiscal::all_pending_operations(&conn)?
    };

    for op in pending {
        match op.status {
            PendingOpStatus::TseSuccess => {
                match fiscal::commit_fiscal_operation(db, &op.operation_id, fiscal::EVENT_RECOVERED, None)
                {
                    Ok(entry) => {
                        info!(
                            operation_id = %op.operation_id,
                            fiscal_log_id = entry.id,
                            "Recovered signed fiscal operation"
                        );
                        report.committed_operations += 1;
                    }
                    Err(e) => {
                        error!(operation_id = %op.operation_id, "Recovery commit failed: {e}");
                        report.failed_operations += 1;
                    }
                }
            }
            PendingOpStatus::Pending | PendingOpStatus::TseFailed => {
                warn!(
                    operation_id = %op.operation_id,
                    status = op.status.as_str(),
                    "Fiscal operation left for manual review"
                );
                report.operations_for_review += 1;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stale transaction recovery
// ---------------------------------------------------------------------------

/// Flag every transaction still `active` with no resolution state so
/// operators decide its fate after the restart. Returns the number flagged.
pub fn run_recovery_process(db: &DbState) -> PosResult<usize> {
    let conn = db.conn.lock()?;
    let now = now_utc();

    let marked = with_envelope(&conn, |c| {
        let mut stmt = c.prepare(
            "SELECT id, uuid FROM active_transactions
             WHERE status = 'active' AND resolution_status = 'none'",
        )?;
        let stale: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        for (id, uuid) in &stale {
            crate::repository::set_resolution_status(c, *id, ResolutionStatus::Pending, &now)?;
            fiscal::log_operational_event(
                c,
                "recovery_marked_pending",
                Some(uuid),
                None,
                &json!({ "transactionId": id }),
            )?;
        }
        Ok(stale.len())
    })?;

    if marked > 0 {
        warn!(count = marked, "Stale active transactions flagged for resolution");
    }
    Ok(marked)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::repository as repo;
    use rusqlite::params;
    use serde_json::json;

    #[test]
    fn test_schema_validation_passes_on_fresh_db() {
        let state = db::test_db();
        let conn = state.conn.lock().unwrap();
        validate_schema(&conn).unwrap();
    }

    #[test]
    fn test_schema_validation_fails_on_missing_table() {
        let state = db::test_db();
        let conn = state.conn.lock().unwrap();
        conn.execute_batch("ALTER TABLE layouts RENAME TO layouts_old;")
            .unwrap();
        assert!(matches!(
            validate_schema(&conn),
            Err(PosError::Database(_))
        ));
    }

    #[test]
    fn test_admin_bootstrap_idempotent() {
        let state = db::test_db();
        assert!(ensure_admin_principal(&state).unwrap());
        // Second run finds the account and creates nothing
        assert!(!ensure_admin_principal(&state).unwrap());

        let conn = state.conn.lock().unwrap();
        let (count, force_change): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(force_password_change) FROM users WHERE username = 'admin'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(force_change, 1);
    }

    #[test]
    fn test_startup_recovers_signed_op_and_marks_stale_active() {
        let state = db::test_db();

        // One transaction left active from a previous session
        {
            let conn = state.conn.lock().unwrap();
            repo::insert_transaction(
                &conn,
                "stale-1",
                None,
                "2026-07-31",
                &json!({}),
                "2026-07-31T22:00:00Z",
            )
            .unwrap();

            // One signed-but-uncommitted fiscal operation
            conn.execute(
                "INSERT INTO pending_fiscal_operations
                    (operation_id, status, request_payload, signed_payload)
                 VALUES ('op-r', 'TSE_SUCCESS', ?1, ?2)",
                params![
                    json!({"transactionUuid": "stale-1", "data": {}}).to_string(),
                    json!({"signature": "sig", "signatureCounter": 7}).to_string()
                ],
            )
            .unwrap();

            // One failed operation stays for review
            conn.execute(
                "INSERT INTO pending_fiscal_operations (operation_id, status, request_payload)
                 VALUES ('op-f', 'TSE_FAILED', '{}')",
                [],
            )
            .unwrap();
        }

        let report = run_startup(&state).unwrap();
        assert_eq!(report.committed_operations, 1);
        assert_eq!(report.operations_for_review, 1);
        assert_eq!(report.transactions_marked_pending, 1);

        let conn = state.conn.lock().unwrap();
        let tx = repo::get_transaction_by_uuid(&conn, "stale-1").unwrap();
        assert_eq!(tx.resolution_status, ResolutionStatus::Pending);

        let entries = fiscal::fiscal_log_for_transaction(&conn, "stale-1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, fiscal::EVENT_RECOVERED);
        assert_eq!(entries[0].signature_counter, Some(7));

        // The failed op is untouched
        let remaining: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pending_fiscal_operations WHERE operation_id = 'op-f'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn test_recovery_ignores_parked_and_resolved() {
        let state = db::test_db();
        {
            let conn = state.conn.lock().unwrap();
            let parked = repo::insert_transaction(
                &conn,
                "parked-1",
                None,
                "2026-07-31",
                &json!({}),
                "2026-07-31T22:00:00Z",
            )
            .unwrap();
            repo::update_transaction_status(
                &conn,
                parked,
                crate::models::TransactionStatus::Parked,
                false,
                "2026-07-31T22:01:00Z",
            )
            .unwrap();
        }

        let marked = run_recovery_process(&state).unwrap();
        assert_eq!(marked, 0);
    }
}
