//! Operator authentication with bcrypt.
//!
//! Provides login, session management, lockout tracking, and permission
//! checks against the `users`/`roles` tables. Sessions are kept in-memory;
//! they do not survive a restart, which is acceptable because the recovery
//! queue greets reconnecting operators anyway.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::models::{Role, User};
use crate::repository as repo;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const SESSION_INACTIVITY_MINUTES: i64 = 30;
const SESSION_MAX_DURATION_HOURS: i64 = 12;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An active operator session.
#[derive(Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: i64,
    pub username: String,
    pub login_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Check whether this session has expired (inactivity or max duration).
    fn is_expired(&self) -> bool {
        let now = Utc::now();
        if now >= self.expires_at {
            return true;
        }
        if now - self.last_activity > Duration::minutes(SESSION_INACTIVITY_MINUTES) {
            return true;
        }
        false
    }
}

/// Lockout tracking entry, keyed by username.
struct LockoutEntry {
    attempts: u32,
    last_attempt: DateTime<Utc>,
}

/// Shared authentication state.
pub struct AuthState {
    sessions: Mutex<HashMap<String, Session>>,
    lockouts: Mutex<HashMap<String, LockoutEntry>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            lockouts: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Login / logout
// ---------------------------------------------------------------------------

/// Verify credentials and open a session.
pub fn login(db: &DbState, auth: &AuthState, username: &str, password: &str) -> PosResult<Value> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(PosError::Validation("username and password required".into()));
    }

    // Lockout window check
    {
        let mut lockouts = auth.lockouts.lock()?;
        if let Some(entry) = lockouts.get_mut(username) {
            let since = Utc::now() - entry.last_attempt;
            if entry.attempts >= MAX_FAILED_ATTEMPTS {
                if since < Duration::minutes(LOCKOUT_MINUTES) {
                    warn!(username, "Login rejected: account locked out");
                    return Err(PosError::PermissionDenied(format!(
                        "too many failed attempts, retry in {} minutes",
                        LOCKOUT_MINUTES - since.num_minutes()
                    )));
                }
                entry.attempts = 0;
            }
        }
    }

    let (user, role) = {
        let conn = db.conn.lock()?;
        let user = match repo::get_user_by_username(&conn, username) {
            Ok(u) => u,
            Err(PosError::NotFound(_)) => {
                record_failed_attempt(auth, username)?;
                return Err(PosError::PermissionDenied("invalid credentials".into()));
            }
            Err(e) => return Err(e),
        };
        let role = repo::get_role(&conn, user.role_id)?;
        (user, role)
    };

    if !user.is_active {
        return Err(PosError::PermissionDenied("account is deactivated".into()));
    }

    let verified = bcrypt::verify(password, &user.password_hash)
        .map_err(|e| PosError::Internal(format!("bcrypt verify: {e}")))?;
    if !verified {
        record_failed_attempt(auth, username)?;
        return Err(PosError::PermissionDenied("invalid credentials".into()));
    }

    // Success clears the lockout entry
    auth.lockouts.lock()?.remove(username);

    let now = Utc::now();
    let session = Session {
        session_id: Uuid::new_v4().to_string(),
        user_id: user.id,
        username: user.username.clone(),
        login_time: now,
        last_activity: now,
        expires_at: now + Duration::hours(SESSION_MAX_DURATION_HOURS),
    };

    let session_id = session.session_id.clone();
    auth.sessions.lock()?.insert(session_id.clone(), session);

    info!(username, user_id = user.id, "Operator logged in");

    Ok(json!({
        "sessionId": session_id,
        "user": user_json(&user, &role),
        "forcePasswordChange": user.force_password_change,
    }))
}

/// Close a session. Unknown session ids succeed silently.
pub fn logout(auth: &AuthState, session_id: &str) -> PosResult<()> {
    if auth.sessions.lock()?.remove(session_id).is_some() {
        info!(session_id, "Operator logged out");
    }
    Ok(())
}

fn record_failed_attempt(auth: &AuthState, username: &str) -> PosResult<()> {
    let mut lockouts = auth.lockouts.lock()?;
    let entry = lockouts.entry(username.to_string()).or_insert(LockoutEntry {
        attempts: 0,
        last_attempt: Utc::now(),
    });
    entry.attempts += 1;
    entry.last_attempt = Utc::now();
    if entry.attempts >= MAX_FAILED_ATTEMPTS {
        warn!(username, attempts = entry.attempts, "Account locked out");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Session resolution
// ---------------------------------------------------------------------------

/// Resolve a session to its user and role, refreshing the activity window.
pub fn resolve_session(
    db: &DbState,
    auth: &AuthState,
    session_id: &str,
) -> PosResult<(User, Role)> {
    let user_id = {
        let mut sessions = auth.sessions.lock()?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| PosError::PermissionDenied("no such session".into()))?;
        if session.is_expired() {
            sessions.remove(session_id);
            return Err(PosError::PermissionDenied("session expired".into()));
        }
        session.last_activity = Utc::now();
        session.user_id
    };

    let conn = db.conn.lock()?;
    let user = repo::get_user(&conn, user_id)?;
    if !user.is_active {
        return Err(PosError::PermissionDenied("account is deactivated".into()));
    }
    let role = repo::get_role(&conn, user.role_id)?;
    Ok((user, role))
}

/// The current user for a session, shaped for clients.
pub fn current_user(db: &DbState, auth: &AuthState, session_id: &str) -> PosResult<Value> {
    let (user, role) = resolve_session(db, auth, session_id)?;
    Ok(user_json(&user, &role))
}

/// Whether the session's role carries `permission`.
pub fn check_permission(
    db: &DbState,
    auth: &AuthState,
    session_id: &str,
    permission: &str,
) -> PosResult<bool> {
    let (_, role) = resolve_session(db, auth, session_id)?;
    Ok(role.permissions.iter().any(|p| p == permission))
}

/// Active users for the login screen. No credential material leaves here.
pub fn login_users(db: &DbState) -> PosResult<Value> {
    let conn = db.conn.lock()?;
    let users = repo::active_users(&conn)?;
    let list: Vec<Value> = users
        .iter()
        .map(|u| {
            json!({
                "id": u.id,
                "username": u.username,
                "fullName": u.full_name,
            })
        })
        .collect();
    Ok(json!({ "users": list }))
}

fn user_json(user: &User, role: &Role) -> Value {
    json!({
        "id": user.id,
        "username": user.username,
        "fullName": user.full_name,
        "role": {
            "name": role.role_name,
            "permissions": role.permissions,
            "canApproveChanges": role.can_approve_changes,
            "canManageUsers": role.can_manage_users,
        },
        "stornoDailyLimit": user.storno_daily_limit,
        "stornoEmergencyLimit": user.storno_emergency_limit,
        "stornoUsedToday": user.storno_used_today,
        "trustScore": user.trust_score,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::params;

    fn seed_user(state: &DbState, username: &str, password: &str) -> i64 {
        let conn = state.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO roles (role_name, permissions, can_approve_changes)
             VALUES ('staff', '[\"create_order\"]', 0)",
            [],
        )
        .unwrap();
        let hash = bcrypt::hash(password, 4).unwrap();
        conn.execute(
            "INSERT INTO users (username, password_hash, role_id) VALUES (?1, ?2, 1)",
            params![username, hash],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn test_login_logout_roundtrip() {
        let state = db::test_db();
        let auth = AuthState::new();
        seed_user(&state, "anna", "pw123");

        let result = login(&state, &auth, "anna", "pw123").unwrap();
        let session_id = result["sessionId"].as_str().unwrap().to_string();
        assert_eq!(result["user"]["username"], "anna");

        let user = current_user(&state, &auth, &session_id).unwrap();
        assert_eq!(user["role"]["name"], "staff");
        assert!(check_permission(&state, &auth, &session_id, "create_order").unwrap());
        assert!(!check_permission(&state, &auth, &session_id, "approve_changes").unwrap());

        logout(&auth, &session_id).unwrap();
        assert!(matches!(
            current_user(&state, &auth, &session_id),
            Err(PosError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_wrong_password_rejected() {
        let state = db::test_db();
        let auth = AuthState::new();
        seed_user(&state, "anna", "pw123");

        assert!(matches!(
            login(&state, &auth, "anna", "nope"),
            Err(PosError::PermissionDenied(_))
        ));
        assert!(matches!(
            login(&state, &auth, "ghost", "pw123"),
            Err(PosError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_lockout_after_repeated_failures() {
        let state = db::test_db();
        let auth = AuthState::new();
        seed_user(&state, "anna", "pw123");

        for _ in 0..MAX_FAILED_ATTEMPTS {
            let _ = login(&state, &auth, "anna", "wrong");
        }
        // Even the correct password is rejected during lockout
        let result = login(&state, &auth, "anna", "pw123");
        assert!(matches!(result, Err(PosError::PermissionDenied(_))));
    }

    #[test]
    fn test_login_users_excludes_credentials() {
        let state = db::test_db();
        seed_user(&state, "anna", "pw123");
        let list = login_users(&state).unwrap();
        let users = list["users"].as_array().unwrap();
        assert_eq!(users.len(), 1);
        assert!(users[0].get("passwordHash").is_none());
    }
}
