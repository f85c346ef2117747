//! Storno credit accounting and the manager approval workflow.
//!
//! Every void consumes per-user daily credit. Voids within the available
//! credit run automatically; anything larger lands in the pending queue as
//! a storno log row plus a generic pending-change record for a manager to
//! review. Trust scores drift with outcomes and, on large adjustments,
//! drive the credit limits themselves.
//!
//! **Rules:**
//! - credit debits and log rows commit in one envelope
//! - rejected stornos never debit credit
//! - `trust_score` stays within `[0, 100]`

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::info;

use crate::db::{with_envelope_retry, DbState};
use crate::error::{PosError, PosResult};
use crate::fiscal;
use crate::models::{now_utc, PendingChange, StornoEntry, User};
use crate::repository as repo;
use crate::signer::FiscalSigner;

/// Trust deltas per outcome.
fn trust_delta_automatic() -> Decimal {
    Decimal::ONE
}
fn trust_delta_approved() -> Decimal {
    Decimal::new(5, 1)
}
fn trust_delta_rejected() -> Decimal {
    -Decimal::ONE
}

/// Absolute trust change at which credit limits are recalculated.
fn limit_recalc_threshold() -> Decimal {
    Decimal::from(5)
}

/// The wired storno engine.
pub struct StornoService {
    pub db: Arc<DbState>,
    pub signer: Arc<dyn FiscalSigner>,
}

/// Outcome of `perform_storno`.
#[derive(Debug)]
pub struct StornoOutcome {
    pub storno: StornoEntry,
    /// Present on the pending path.
    pub pending_change_id: Option<i64>,
    pub fiscal_warning: Option<String>,
}

impl StornoService {
    pub fn new(db: Arc<DbState>, signer: Arc<dyn FiscalSigner>) -> Self {
        StornoService { db, signer }
    }

    // -----------------------------------------------------------------------
    // Request path
    // -----------------------------------------------------------------------

    /// Request a storno of `amount` for `user_id`.
    ///
    /// Within the available credit the storno is automatic: the credit is
    /// debited atomically with the log insert and a `storno_automatic`
    /// fiscal event follows. Beyond it, a pending request is queued with
    /// `urgent` priority for emergencies and `high` otherwise.
    pub fn perform_storno(
        &self,
        user_id: i64,
        transaction_uuid: Option<&str>,
        amount: Decimal,
        reason: &str,
        is_emergency: bool,
    ) -> PosResult<StornoOutcome> {
        if amount <= Decimal::ZERO {
            return Err(PosError::Validation("storno amount must be positive".into()));
        }

        let now = now_utc();
        let (storno_id, pending_change_id, automatic, tx_uuid_owned) = {
            let conn = self.db.conn.lock()?;
            with_envelope_retry(&conn, |c| {
                let user = repo::get_user(c, user_id)?;
                if !user.is_active {
                    return Err(PosError::PermissionDenied(format!(
                        "user {} is deactivated",
                        user.username
                    )));
                }

                let limit = if is_emergency {
                    user.storno_emergency_limit
                } else {
                    user.storno_daily_limit
                };
                let available = limit - user.storno_used_today;

                if amount <= available {
                    repo::update_storno_used(
                        c,
                        user.id,
                        user.storno_used_today + amount,
                        &now,
                    )?;
                    let storno_id = repo::insert_storno(
                        c,
                        transaction_uuid,
                        user.id,
                        amount,
                        reason,
                        is_emergency,
                        "automatic",
                        amount,
                        &now,
                    )?;
                    adjust_trust(c, &user, trust_delta_automatic(), &now)?;
                    Ok((storno_id, None, true, transaction_uuid.map(String::from)))
                } else {
                    let storno_id = repo::insert_storno(
                        c,
                        transaction_uuid,
                        user.id,
                        amount,
                        reason,
                        is_emergency,
                        "pending",
                        Decimal::ZERO,
                        &now,
                    )?;
                    let priority = if is_emergency { "urgent" } else { "high" };
                    let change_id = repo::insert_pending_change(
                        c,
                        "storno_approval",
                        "storno_log",
                        Some(storno_id),
                        &json!({
                            "amount": amount,
                            "reason": reason,
                            "isEmergency": is_emergency,
                            "availableCredit": available,
                        }),
                        priority,
                        Some(user.id),
                        &now,
                    )?;
                    Ok((
                        storno_id,
                        Some(change_id),
                        false,
                        transaction_uuid.map(String::from),
                    ))
                }
            })?
        };

        let fiscal_warning = if automatic {
            self.emit_storno_event(
                "storno_automatic",
                tx_uuid_owned.as_deref(),
                user_id,
                json!({ "stornoId": storno_id, "amount": amount, "reason": reason }),
            )
        } else {
            info!(storno_id, user_id, %amount, "Storno exceeds credit, queued for approval");
            None
        };

        let conn = self.db.conn.lock()?;
        Ok(StornoOutcome {
            storno: repo::get_storno(&conn, storno_id)?,
            pending_change_id,
            fiscal_warning,
        })
    }

    // -----------------------------------------------------------------------
    // Review path
    // -----------------------------------------------------------------------

    /// Approve a pending storno. The debit lands on the requesting user's
    /// credit even when it exceeds the plain daily limit.
    pub fn approve_storno(
        &self,
        manager: &User,
        storno_id: i64,
        notes: Option<&str>,
    ) -> PosResult<StornoOutcome> {
        self.require_approver(manager)?;

        let now = now_utc();
        let (user_id, amount, tx_uuid) = {
            let conn = self.db.conn.lock()?;
            with_envelope_retry(&conn, |c| {
                let storno = repo::get_storno(c, storno_id)?;
                if storno.approval_status != "pending" {
                    return Err(PosError::InvalidState(format!(
                        "storno {} is {}, expected pending",
                        storno.id, storno.approval_status
                    )));
                }

                let user = repo::get_user(c, storno.user_id)?;
                repo::update_storno_used(
                    c,
                    user.id,
                    user.storno_used_today + storno.amount,
                    &now,
                )?;
                repo::resolve_storno(
                    c,
                    storno.id,
                    "approved",
                    storno.amount,
                    manager.id,
                    notes,
                    &now,
                )?;
                if let Some(change) = repo::change_for_storno(c, storno.id)? {
                    repo::review_pending_change(c, change.id, "approved", manager.id, notes, &now)?;
                }
                adjust_trust(c, &user, trust_delta_approved(), &now)?;

                Ok((user.id, storno.amount, storno.transaction_uuid.clone()))
            })?
        };

        let fiscal_warning = self.emit_storno_event(
            "storno_approved",
            tx_uuid.as_deref(),
            user_id,
            json!({ "stornoId": storno_id, "amount": amount, "approvedBy": manager.id }),
        );

        let conn = self.db.conn.lock()?;
        Ok(StornoOutcome {
            storno: repo::get_storno(&conn, storno_id)?,
            pending_change_id: None,
            fiscal_warning,
        })
    }

    /// Reject a pending storno. No credit is debited.
    pub fn reject_storno(
        &self,
        manager: &User,
        storno_id: i64,
        notes: Option<&str>,
    ) -> PosResult<StornoOutcome> {
        self.require_approver(manager)?;

        let now = now_utc();
        let (user_id, tx_uuid) = {
            let conn = self.db.conn.lock()?;
            with_envelope_retry(&conn, |c| {
                let storno = repo::get_storno(c, storno_id)?;
                if storno.approval_status != "pending" {
                    return Err(PosError::InvalidState(format!(
                        "storno {} is {}, expected pending",
                        storno.id, storno.approval_status
                    )));
                }
                let user = repo::get_user(c, storno.user_id)?;
                repo::resolve_storno(
                    c,
                    storno.id,
                    "rejected",
                    Decimal::ZERO,
                    manager.id,
                    notes,
                    &now,
                )?;
                if let Some(change) = repo::change_for_storno(c, storno.id)? {
                    repo::review_pending_change(c, change.id, "rejected", manager.id, notes, &now)?;
                }
                adjust_trust(c, &user, trust_delta_rejected(), &now)?;
                Ok((user.id, storno.transaction_uuid.clone()))
            })?
        };

        let fiscal_warning = self.emit_storno_event(
            "storno_rejected",
            tx_uuid.as_deref(),
            user_id,
            json!({ "stornoId": storno_id, "rejectedBy": manager.id }),
        );

        let conn = self.db.conn.lock()?;
        Ok(StornoOutcome {
            storno: repo::get_storno(&conn, storno_id)?,
            pending_change_id: None,
            fiscal_warning,
        })
    }

    /// Review a generic pending change. Storno changes delegate to the
    /// storno path so credit accounting stays in one place.
    pub fn review_change(
        &self,
        manager: &User,
        change_id: i64,
        approve: bool,
        notes: Option<&str>,
    ) -> PosResult<Value> {
        self.require_approver(manager)?;

        let change = {
            let conn = self.db.conn.lock()?;
            repo::get_pending_change(&conn, change_id)?
        };
        if change.status != "pending" {
            return Err(PosError::InvalidState(format!(
                "change {} is {}, expected pending",
                change.id, change.status
            )));
        }

        if change.target_entity == "storno_log" {
            let storno_id = change.target_id.ok_or_else(|| {
                PosError::Internal(format!("change {} has no storno target", change.id))
            })?;
            let outcome = if approve {
                self.approve_storno(manager, storno_id, notes)?
            } else {
                self.reject_storno(manager, storno_id, notes)?
            };
            return Ok(json!({
                "changeId": change.id,
                "storno": outcome.storno,
                "warning": outcome.fiscal_warning,
            }));
        }

        let now = now_utc();
        let status = if approve { "approved" } else { "rejected" };
        let conn = self.db.conn.lock()?;
        with_envelope_retry(&conn, |c| {
            repo::review_pending_change(c, change.id, status, manager.id, notes, &now)
        })?;
        Ok(json!({ "changeId": change.id, "status": status }))
    }

    /// Review several changes in one call; individual failures are
    /// collected, not fatal.
    pub fn batch_process_changes(
        &self,
        manager: &User,
        change_ids: &[i64],
        approve: bool,
        notes: Option<&str>,
    ) -> PosResult<Value> {
        let mut processed = Vec::new();
        let mut errors = Vec::new();
        for &change_id in change_ids {
            match self.review_change(manager, change_id, approve, notes) {
                Ok(result) => processed.push(result),
                Err(e) => errors.push(json!({ "changeId": change_id, "error": e.to_string() })),
            }
        }
        Ok(json!({ "processed": processed, "errors": errors }))
    }

    // -----------------------------------------------------------------------
    // Queries and maintenance
    // -----------------------------------------------------------------------

    pub fn pending_stornos(&self) -> PosResult<Vec<StornoEntry>> {
        let conn = self.db.conn.lock()?;
        repo::pending_stornos(&conn)
    }

    pub fn pending_changes(&self) -> PosResult<Vec<PendingChange>> {
        let conn = self.db.conn.lock()?;
        repo::pending_changes(&conn)
    }

    /// Zero all consumed storno credit, at most once per business day.
    pub fn reset_daily_storno_credits(&self, business_date: &str) -> PosResult<bool> {
        let conn = self.db.conn.lock()?;
        let last_reset = crate::db::setting_get(&conn, "system", "storno_reset_date")?;
        if last_reset.as_deref() == Some(business_date) {
            return Ok(false);
        }

        let now = now_utc();
        with_envelope_retry(&conn, |c| {
            let changed = repo::reset_all_storno_used(c, &now)?;
            crate::db::setting_put(c, "system", "storno_reset_date", business_date)?;
            info!(business_date, users_reset = changed, "Daily storno credits reset");
            Ok(())
        })?;
        Ok(true)
    }

    /// Counters and per-user usage for the manager dashboard.
    pub fn manager_dashboard(&self) -> PosResult<Value> {
        let conn = self.db.conn.lock()?;
        let pending_stornos = repo::pending_stornos(&conn)?;
        let pending_changes = repo::pending_changes(&conn)?;
        let users = repo::active_users(&conn)?;

        let usage: Vec<Value> = users
            .iter()
            .map(|u| {
                json!({
                    "userId": u.id,
                    "username": u.username,
                    "stornoUsedToday": u.storno_used_today,
                    "stornoDailyLimit": u.storno_daily_limit,
                    "trustScore": u.trust_score,
                })
            })
            .collect();

        Ok(json!({
            "pendingStornoCount": pending_stornos.len(),
            "pendingChangeCount": pending_changes.len(),
            "pendingStornos": pending_stornos,
            "creditUsage": usage,
        }))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn require_approver(&self, manager: &User) -> PosResult<()> {
        let conn = self.db.conn.lock()?;
        let role = repo::get_role(&conn, manager.role_id)?;
        if !role.can_approve_changes {
            return Err(PosError::PermissionDenied(format!(
                "user {} cannot approve changes",
                manager.username
            )));
        }
        Ok(())
    }

    fn emit_storno_event(
        &self,
        event_type: &str,
        transaction_uuid: Option<&str>,
        user_id: i64,
        payload: Value,
    ) -> Option<String> {
        let uuid = transaction_uuid.unwrap_or("storno");
        match fiscal::log_fiscal_event(
            &self.db,
            self.signer.as_ref(),
            event_type,
            uuid,
            Some(user_id),
            payload,
        ) {
            Ok(_) => None,
            Err(e) => fiscal::record_divergence(&self.db, uuid, event_type, &e),
        }
    }
}

/// Clamp-and-store a trust adjustment; a change of five points or more also
/// recalculates the credit limits from the new trust score.
fn adjust_trust(
    conn: &rusqlite::Connection,
    user: &User,
    delta: Decimal,
    now: &str,
) -> PosResult<()> {
    let mut new_trust = user.trust_score + delta;
    if new_trust < Decimal::ZERO {
        new_trust = Decimal::ZERO;
    }
    if new_trust > Decimal::ONE_HUNDRED {
        new_trust = Decimal::ONE_HUNDRED;
    }

    if delta.abs() >= limit_recalc_threshold() {
        let fifty = Decimal::from(50);
        let daily = fifty * (new_trust / fifty);
        let emergency = daily * Decimal::new(5, 1);
        repo::update_trust_and_limits(conn, user.id, new_trust, daily, emergency, now)?;
    } else {
        repo::update_trust(conn, user.id, new_trust, now)?;
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::signer::LocalSigner;
    use rusqlite::params;
    use rust_decimal_macros::dec;

    fn service() -> StornoService {
        StornoService::new(Arc::new(db::test_db()), Arc::new(LocalSigner::new()))
    }

    /// Seed a staff role/user and a manager; returns (staff_id, manager_id).
    fn seed_users(svc: &StornoService) -> (i64, i64) {
        let conn = svc.db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO roles (role_name, permissions, can_approve_changes, can_manage_users)
             VALUES ('staff', '[\"create_order\"]', 0, 0)",
            [],
        )
        .unwrap();
        let staff_role = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO roles (role_name, permissions, can_approve_changes, can_manage_users)
             VALUES ('manager', '[\"create_order\",\"approve_changes\"]', 1, 1)",
            [],
        )
        .unwrap();
        let manager_role = conn.last_insert_rowid();

        conn.execute(
            "INSERT INTO users (username, password_hash, role_id,
                storno_daily_limit, storno_emergency_limit, storno_used_today, trust_score)
             VALUES ('kasse1', 'x', ?1, '50', '25', '40', '50')",
            params![staff_role],
        )
        .unwrap();
        let staff = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO users (username, password_hash, role_id)
             VALUES ('chef', 'x', ?1)",
            params![manager_role],
        )
        .unwrap();
        (staff, conn.last_insert_rowid())
    }

    fn load_user(svc: &StornoService, id: i64) -> User {
        let conn = svc.db.conn.lock().unwrap();
        repo::get_user(&conn, id).unwrap()
    }

    #[test]
    fn test_automatic_storno_within_credit() {
        let svc = service();
        let (staff, _) = seed_users(&svc);

        let outcome = svc
            .perform_storno(staff, Some("tx-1"), dec!(5), "wrong item", false)
            .unwrap();
        assert_eq!(outcome.storno.approval_status, "automatic");
        assert_eq!(outcome.storno.credit_used, dec!(5));
        assert!(outcome.pending_change_id.is_none());

        let user = load_user(&svc, staff);
        assert_eq!(user.storno_used_today, dec!(45));
        assert_eq!(user.trust_score, dec!(51));

        let conn = svc.db.conn.lock().unwrap();
        let events = fiscal::fiscal_log_for_transaction(&conn, "tx-1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "storno_automatic");
    }

    #[test]
    fn test_over_credit_goes_pending_then_approved() {
        let svc = service();
        let (staff, manager_id) = seed_users(&svc);

        // 20 > 50 - 40 available: pending, credit untouched
        let outcome = svc
            .perform_storno(staff, Some("tx-2"), dec!(20), "spill", false)
            .unwrap();
        assert_eq!(outcome.storno.approval_status, "pending");
        assert_eq!(outcome.storno.credit_used, dec!(0));
        assert!(outcome.pending_change_id.is_some());
        assert_eq!(load_user(&svc, staff).storno_used_today, dec!(40));

        {
            let conn = svc.db.conn.lock().unwrap();
            let changes = repo::pending_changes(&conn).unwrap();
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].priority, "high");
        }

        let manager = load_user(&svc, manager_id);
        let approved = svc
            .approve_storno(&manager, outcome.storno.id, Some("ok"))
            .unwrap();
        assert_eq!(approved.storno.approval_status, "approved");
        assert_eq!(approved.storno.credit_used, dec!(20));

        let user = load_user(&svc, staff);
        assert_eq!(user.storno_used_today, dec!(60));
        assert_eq!(user.trust_score, dec!(50.5));

        let conn = svc.db.conn.lock().unwrap();
        let events = fiscal::fiscal_log_for_transaction(&conn, "tx-2").unwrap();
        assert!(events.iter().any(|e| e.event_type == "storno_approved"));
        let changes = repo::pending_changes(&conn).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_emergency_priority_is_urgent() {
        let svc = service();
        let (staff, _) = seed_users(&svc);

        // Emergency limit 25, used 40: no credit at all, pending urgent
        let outcome = svc
            .perform_storno(staff, None, dec!(10), "drawer jam", true)
            .unwrap();
        assert_eq!(outcome.storno.approval_status, "pending");

        let conn = svc.db.conn.lock().unwrap();
        let changes = repo::pending_changes(&conn).unwrap();
        assert_eq!(changes[0].priority, "urgent");
    }

    #[test]
    fn test_reject_leaves_credit_untouched() {
        let svc = service();
        let (staff, manager_id) = seed_users(&svc);

        let outcome = svc
            .perform_storno(staff, None, dec!(20), "typo", false)
            .unwrap();
        let manager = load_user(&svc, manager_id);
        let rejected = svc
            .reject_storno(&manager, outcome.storno.id, Some("no"))
            .unwrap();
        assert_eq!(rejected.storno.approval_status, "rejected");
        assert_eq!(rejected.storno.credit_used, dec!(0));

        let user = load_user(&svc, staff);
        assert_eq!(user.storno_used_today, dec!(40));
        assert_eq!(user.trust_score, dec!(49));
    }

    #[test]
    fn test_non_approver_cannot_review() {
        let svc = service();
        let (staff, _) = seed_users(&svc);
        let outcome = svc
            .perform_storno(staff, None, dec!(20), "x", false)
            .unwrap();

        let staff_user = load_user(&svc, staff);
        assert!(matches!(
            svc.approve_storno(&staff_user, outcome.storno.id, None),
            Err(PosError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_double_review_rejected() {
        let svc = service();
        let (staff, manager_id) = seed_users(&svc);
        let outcome = svc
            .perform_storno(staff, None, dec!(20), "x", false)
            .unwrap();
        let manager = load_user(&svc, manager_id);
        svc.approve_storno(&manager, outcome.storno.id, None).unwrap();
        assert!(matches!(
            svc.approve_storno(&manager, outcome.storno.id, None),
            Err(PosError::InvalidState(_))
        ));
    }

    #[test]
    fn test_trust_clamped_at_bounds() {
        let svc = service();
        let (staff, _) = seed_users(&svc);
        {
            let conn = svc.db.conn.lock().unwrap();
            conn.execute(
                "UPDATE users SET trust_score = '100', storno_used_today = '0' WHERE id = ?1",
                params![staff],
            )
            .unwrap();
        }

        svc.perform_storno(staff, None, dec!(1), "ok", false).unwrap();
        assert_eq!(load_user(&svc, staff).trust_score, dec!(100));
    }

    #[test]
    fn test_large_trust_change_recalculates_limits() {
        let svc = service();
        let (staff, _) = seed_users(&svc);
        let user = load_user(&svc, staff);
        {
            let conn = svc.db.conn.lock().unwrap();
            adjust_trust(&conn, &user, dec!(10), "2026-08-01T10:00:00Z").unwrap();
        }
        let after = load_user(&svc, staff);
        assert_eq!(after.trust_score, dec!(60));
        assert_eq!(after.storno_daily_limit, dec!(60));
        assert_eq!(after.storno_emergency_limit, dec!(30.0));
    }

    #[test]
    fn test_daily_reset_is_idempotent_per_day() {
        let svc = service();
        let (staff, _) = seed_users(&svc);

        assert!(svc.reset_daily_storno_credits("2026-08-01").unwrap());
        assert_eq!(load_user(&svc, staff).storno_used_today, dec!(0));

        // Same day again: no-op
        assert!(!svc.reset_daily_storno_credits("2026-08-01").unwrap());

        // Next day resets again
        svc.perform_storno(staff, None, dec!(5), "x", false).unwrap();
        assert!(svc.reset_daily_storno_credits("2026-08-02").unwrap());
        assert_eq!(load_user(&svc, staff).storno_used_today, dec!(0));
    }

    #[test]
    fn test_batch_review_collects_errors() {
        let svc = service();
        let (staff, manager_id) = seed_users(&svc);
        let a = svc
            .perform_storno(staff, None, dec!(20), "a", false)
            .unwrap();
        let manager = load_user(&svc, manager_id);

        let change_id = a.pending_change_id.unwrap();
        let result = svc
            .batch_process_changes(&manager, &[change_id, 9999], true, None)
            .unwrap();
        assert_eq!(result["processed"].as_array().unwrap().len(), 1);
        assert_eq!(result["errors"].as_array().unwrap().len(), 1);
    }
}
