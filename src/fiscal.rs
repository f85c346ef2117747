//! Append-only fiscal log with a two-phase write-ahead protocol.
//!
//! Every receipt-affecting event passes through three steps:
//! 1. **Pending** — a `pending_fiscal_operations` row (`PENDING`) records the
//!    payload before anything else happens.
//! 2. **Sign** — the external TSE signs the payload; the row moves to
//!    `TSE_SUCCESS` (with signature data) or `TSE_FAILED`.
//! 3. **Commit** — an immutable `fiscal_log` row is appended and the pending
//!    row is removed.
//!
//! A crash between sign and commit leaves a `TSE_SUCCESS` row behind;
//! startup recovery commits it under the generic `recovered_transaction`
//! event type (the original type is not stored in the pending row).
//!
//! **Rules:**
//! - `fiscal_log` rows are never updated or deleted
//! - the signer is never called while a write envelope or the connection
//!   lock is held
//! - fiscal log ids are assigned strictly in commit order

use rusqlite::{params, Connection};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{with_envelope, DbState};
use crate::error::{PosError, PosResult};
use crate::models::{
    now_utc, parse_json_column, FiscalLogEntry, PendingFiscalOperation, PendingOpStatus,
};
use crate::signer::FiscalSigner;

/// Event type used when recovery commits an operation whose original type
/// was lost with the crash.
pub const EVENT_RECOVERED: &str = "recovered_transaction";

// ---------------------------------------------------------------------------
// Fiscal events
// ---------------------------------------------------------------------------

/// Append a signed fiscal event for `transaction_uuid`.
///
/// Runs the full two-phase protocol. Must be called outside any business
/// write envelope; the signer may be slow or remote.
pub fn log_fiscal_event(
    db: &DbState,
    signer: &dyn FiscalSigner,
    event_type: &str,
    transaction_uuid: &str,
    user_id: Option<i64>,
    payload: Value,
) -> PosResult<FiscalLogEntry> {
    let operation_id = Uuid::new_v4().to_string();
    let request_payload = json!({
        "transactionUuid": transaction_uuid,
        "userId": user_id,
        "data": payload,
    });

    // Phase 1: durable pending record
    {
        let conn = db.conn.lock()?;
        conn.execute(
            "INSERT INTO pending_fiscal_operations (operation_id, status, request_payload)
             VALUES (?1, 'PENDING', ?2)",
            params![operation_id, request_payload.to_string()],
        )?;
    }

    // Phase 2: sign without holding the connection lock
    let sign_input = json!({
        "operationId": operation_id,
        "eventType": event_type,
        "payload": request_payload,
    });
    let signature = match signer.sign(&sign_input) {
        Ok(sig) => sig,
        Err(e) => {
            let conn = db.conn.lock()?;
            conn.execute(
                "UPDATE pending_fiscal_operations
                 SET status = 'TSE_FAILED', updated_at = datetime('now')
                 WHERE operation_id = ?1",
                params![operation_id],
            )?;
            error!(operation_id = %operation_id, event_type, "TSE signing failed: {e}");
            return Err(match e {
                PosError::ExternalTimeout(msg) => PosError::ExternalTimeout(msg),
                other => PosError::FiscalCommitFailed(other.to_string()),
            });
        }
    };

    let signed_payload = json!({
        "signature": signature.signature,
        "signatureCounter": signature.counter,
        "tseTimestamp": signature.tse_timestamp,
    });

    let conn = db.conn.lock()?;

    // Phase 2 completion is its own durable write so a crash before commit
    // leaves a recoverable TSE_SUCCESS row.
    conn.execute(
        "UPDATE pending_fiscal_operations
         SET status = 'TSE_SUCCESS', signed_payload = ?1, updated_at = datetime('now')
         WHERE operation_id = ?2",
        params![signed_payload.to_string(), operation_id],
    )?;

    // Phase 3: append + clear pending
    let timestamp_utc = now_utc();
    let entry_id = with_envelope(&conn, |c| {
        c.execute(
            "INSERT INTO fiscal_log
                (transaction_uuid, event_type, user_id, payload, signature,
                 signature_counter, timestamp_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                transaction_uuid,
                event_type,
                user_id,
                payload.to_string(),
                signature.signature,
                signature.counter,
                timestamp_utc
            ],
        )?;
        let id = c.last_insert_rowid();
        c.execute(
            "DELETE FROM pending_fiscal_operations WHERE operation_id = ?1",
            params![operation_id],
        )?;
        Ok(id)
    })?;

    info!(
        fiscal_log_id = entry_id,
        event_type,
        transaction_uuid,
        signature_counter = signature.counter,
        "Fiscal event committed"
    );

    Ok(FiscalLogEntry {
        id: entry_id,
        transaction_uuid: transaction_uuid.to_string(),
        event_type: event_type.to_string(),
        user_id,
        payload,
        signature: Some(signature.signature),
        signature_counter: Some(signature.counter),
        timestamp_utc,
    })
}

/// Commit a previously signed but uncommitted operation.
///
/// Used by startup recovery; the stored request payload supplies the
/// transaction reference, the caller supplies the event type.
pub fn commit_fiscal_operation(
    db: &DbState,
    operation_id: &str,
    event_type: &str,
    user_id: Option<i64>,
) -> PosResult<FiscalLogEntry> {
    let conn = db.conn.lock()?;

    let op = get_pending_operation(&conn, operation_id)?;
    if op.status != PendingOpStatus::TseSuccess {
        return Err(PosError::InvalidState(format!(
            "pending operation {operation_id} is {}, expected TSE_SUCCESS",
            op.status.as_str()
        )));
    }

    let transaction_uuid = op
        .request_payload
        .get("transactionUuid")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let stored_user = op
        .request_payload
        .get("userId")
        .and_then(Value::as_i64)
        .or(user_id);
    let payload = op
        .request_payload
        .get("data")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let signed = op.signed_payload.clone().unwrap_or_else(|| json!({}));
    let signature = signed
        .get("signature")
        .and_then(Value::as_str)
        .map(String::from);
    let signature_counter = signed.get("signatureCounter").and_then(Value::as_i64);

    let timestamp_utc = now_utc();
    let entry_id = with_envelope(&conn, |c| {
        c.execute(
            "INSERT INTO fiscal_log
                (transaction_uuid, event_type, user_id, payload, signature,
                 signature_counter, timestamp_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                transaction_uuid,
                event_type,
                stored_user,
                payload.to_string(),
                signature,
                signature_counter,
                timestamp_utc
            ],
        )?;
        let id = c.last_insert_rowid();
        c.execute(
            "DELETE FROM pending_fiscal_operations WHERE operation_id = ?1",
            params![operation_id],
        )?;
        Ok(id)
    })?;

    info!(
        fiscal_log_id = entry_id,
        operation_id, event_type, "Pending fiscal operation committed"
    );

    Ok(FiscalLogEntry {
        id: entry_id,
        transaction_uuid,
        event_type: event_type.to_string(),
        user_id: stored_user,
        payload,
        signature,
        signature_counter,
        timestamp_utc,
    })
}

// ---------------------------------------------------------------------------
// Operational log
// ---------------------------------------------------------------------------

/// Append a durable non-fiscal event. These feed the finish-time fiscal
/// reconstruction (`partial_storno`, `price_override`) and the audit trail
/// (`print_failed`, divergence warnings, client events).
pub fn log_operational_event(
    conn: &Connection,
    event_type: &str,
    transaction_uuid: Option<&str>,
    user_id: Option<i64>,
    payload: &Value,
) -> PosResult<i64> {
    conn.execute(
        "INSERT INTO operational_log (event_type, transaction_uuid, user_id, payload)
         VALUES (?1, ?2, ?3, ?4)",
        params![event_type, transaction_uuid, user_id, payload.to_string()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// One operational event feeding reconstruction.
#[derive(Debug, Clone)]
pub struct OperationalEvent {
    pub id: i64,
    pub event_type: String,
    pub payload: Value,
}

/// Operational events for a transaction in ascending time order, filtered
/// to the given event types.
pub fn operational_events_for_transaction(
    conn: &Connection,
    transaction_uuid: &str,
    event_types: &[&str],
) -> PosResult<Vec<OperationalEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, event_type, payload FROM operational_log
         WHERE transaction_uuid = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![transaction_uuid], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (id, event_type, payload_raw) = row?;
        if !event_types.contains(&event_type.as_str()) {
            continue;
        }
        events.push(OperationalEvent {
            id,
            event_type,
            payload: parse_json_column(payload_raw, "operational_log.payload"),
        });
    }
    Ok(events)
}

// ---------------------------------------------------------------------------
// Pending operation queries
// ---------------------------------------------------------------------------

fn map_pending(row: &rusqlite::Row) -> rusqlite::Result<PendingFiscalOperation> {
    let status_raw: String = row.get("status")?;
    let request_raw: Option<String> = row.get("request_payload")?;
    let signed_raw: Option<String> = row.get("signed_payload")?;
    Ok(PendingFiscalOperation {
        id: row.get("id")?,
        operation_id: row.get("operation_id")?,
        status: PendingOpStatus::parse(&status_raw).unwrap_or(PendingOpStatus::Pending),
        request_payload: parse_json_column(request_raw, "pending_fiscal_operations.request"),
        signed_payload: signed_raw
            .map(|s| parse_json_column(Some(s), "pending_fiscal_operations.signed")),
    })
}

pub fn get_pending_operation(
    conn: &Connection,
    operation_id: &str,
) -> PosResult<PendingFiscalOperation> {
    conn.query_row(
        "SELECT * FROM pending_fiscal_operations WHERE operation_id = ?1",
        params![operation_id],
        map_pending,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            PosError::NotFound(format!("pending fiscal operation {operation_id}"))
        }
        other => other.into(),
    })
}

/// All pending rows grouped for recovery.
pub fn all_pending_operations(conn: &Connection) -> PosResult<Vec<PendingFiscalOperation>> {
    let mut stmt = conn.prepare("SELECT * FROM pending_fiscal_operations ORDER BY id")?;
    let rows = stmt.query_map([], map_pending)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Fiscal log rows for one transaction in commit order.
pub fn fiscal_log_for_transaction(
    conn: &Connection,
    transaction_uuid: &str,
) -> PosResult<Vec<FiscalLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM fiscal_log WHERE transaction_uuid = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![transaction_uuid], |row| {
        let payload_raw: Option<String> = row.get("payload")?;
        Ok(FiscalLogEntry {
            id: row.get("id")?,
            transaction_uuid: row.get("transaction_uuid")?,
            event_type: row.get("event_type")?,
            user_id: row.get("user_id")?,
            payload: parse_json_column(payload_raw, "fiscal_log.payload"),
            signature: row.get("signature")?,
            signature_counter: row.get("signature_counter")?,
            timestamp_utc: row.get("timestamp_utc")?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Record a post-commit fiscal failure as an operational divergence entry.
///
/// Business state is never rolled back once committed; the divergence row
/// is the durable trace operators reconcile from.
pub fn record_divergence(
    db: &DbState,
    transaction_uuid: &str,
    event_type: &str,
    error: &PosError,
) -> Option<String> {
    let warning = format!("fiscal event {event_type} failed after business commit: {error}");
    warn!(transaction_uuid, "{warning}");
    match db.conn.lock() {
        Ok(conn) => {
            let _ = log_operational_event(
                &conn,
                "fiscal_divergence",
                Some(transaction_uuid),
                None,
                &json!({ "eventType": event_type, "error": error.to_string() }),
            );
        }
        Err(e) => error!("Could not record divergence: {e}"),
    }
    Some(warning)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::signer::{FailingSigner, LocalSigner};

    #[test]
    fn test_two_phase_commit_appends_and_clears_pending() {
        let state = db::test_db();
        let signer = LocalSigner::new();

        let entry = log_fiscal_event(
            &state,
            &signer,
            "startTransaction",
            "uuid-f1",
            Some(1),
            json!({"metadata": {}}),
        )
        .unwrap();
        assert_eq!(entry.event_type, "startTransaction");
        assert_eq!(entry.signature_counter, Some(1));
        assert!(entry.signature.is_some());

        let conn = state.conn.lock().unwrap();
        let pending: i64 = conn
            .query_row("SELECT COUNT(*) FROM pending_fiscal_operations", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(pending, 0);

        let log = fiscal_log_for_transaction(&conn, "uuid-f1").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].event_type, "startTransaction");
    }

    #[test]
    fn test_sign_failure_leaves_tse_failed_row() {
        let state = db::test_db();

        let result = log_fiscal_event(
            &state,
            &FailingSigner,
            "startTransaction",
            "uuid-f2",
            None,
            json!({}),
        );
        assert!(result.is_err());

        let conn = state.conn.lock().unwrap();
        let status: String = conn
            .query_row(
                "SELECT status FROM pending_fiscal_operations LIMIT 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, "TSE_FAILED");

        let committed: i64 = conn
            .query_row("SELECT COUNT(*) FROM fiscal_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(committed, 0);
    }

    #[test]
    fn test_commit_recovers_signed_operation() {
        let state = db::test_db();

        // Simulate a crash after sign: a TSE_SUCCESS row with no log entry.
        {
            let conn = state.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO pending_fiscal_operations
                    (operation_id, status, request_payload, signed_payload)
                 VALUES ('op-1', 'TSE_SUCCESS', ?1, ?2)",
                params![
                    json!({"transactionUuid": "uuid-f3", "userId": 4, "data": {"k": 1}})
                        .to_string(),
                    json!({"signature": "sig", "signatureCounter": 42}).to_string()
                ],
            )
            .unwrap();
        }

        let entry = commit_fiscal_operation(&state, "op-1", EVENT_RECOVERED, None).unwrap();
        assert_eq!(entry.event_type, EVENT_RECOVERED);
        assert_eq!(entry.transaction_uuid, "uuid-f3");
        assert_eq!(entry.user_id, Some(4));
        assert_eq!(entry.signature_counter, Some(42));

        let conn = state.conn.lock().unwrap();
        let pending: i64 = conn
            .query_row("SELECT COUNT(*) FROM pending_fiscal_operations", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[test]
    fn test_commit_rejects_unsigned_operation() {
        let state = db::test_db();
        {
            let conn = state.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO pending_fiscal_operations (operation_id, status, request_payload)
                 VALUES ('op-2', 'PENDING', '{}')",
                [],
            )
            .unwrap();
        }
        let result = commit_fiscal_operation(&state, "op-2", EVENT_RECOVERED, None);
        assert!(matches!(result, Err(PosError::InvalidState(_))));
    }

    #[test]
    fn test_fiscal_ids_are_commit_ordered() {
        let state = db::test_db();
        let signer = LocalSigner::new();
        for i in 0..3 {
            log_fiscal_event(
                &state,
                &signer,
                "updateTransaction",
                "uuid-f4",
                None,
                json!({"i": i}),
            )
            .unwrap();
        }
        let conn = state.conn.lock().unwrap();
        let log = fiscal_log_for_transaction(&conn, "uuid-f4").unwrap();
        let ids: Vec<i64> = log.iter().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_operational_events_filter_and_order() {
        let state = db::test_db();
        let conn = state.conn.lock().unwrap();
        log_operational_event(&conn, "partial_storno", Some("u"), None, &json!({"a": 1}))
            .unwrap();
        log_operational_event(&conn, "print_failed", Some("u"), None, &json!({})).unwrap();
        log_operational_event(&conn, "price_override", Some("u"), None, &json!({"b": 2}))
            .unwrap();

        let events =
            operational_events_for_transaction(&conn, "u", &["partial_storno", "price_override"])
                .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "partial_storno");
        assert_eq!(events[1].event_type, "price_override");
        assert!(events[0].id < events[1].id);
    }
}
