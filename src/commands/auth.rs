//! Authentication and permission commands.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth;
use crate::error::PosResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginPayload {
    username: String,
    password: String,
}

pub fn login(state: &AppState, payload: Value) -> PosResult<Value> {
    let parsed: LoginPayload = serde_json::from_value(payload)?;
    auth::login(&state.db, &state.auth, &parsed.username, &parsed.password)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    #[serde(alias = "session_id")]
    session_id: String,
}

pub fn logout(state: &AppState, payload: Value) -> PosResult<Value> {
    let parsed: SessionPayload = serde_json::from_value(payload)?;
    auth::logout(&state.auth, &parsed.session_id)?;
    Ok(json!({ "loggedOut": true }))
}

pub fn get_current_user(state: &AppState, payload: Value) -> PosResult<Value> {
    let parsed: SessionPayload = serde_json::from_value(payload)?;
    auth::current_user(&state.db, &state.auth, &parsed.session_id)
}

pub fn get_login_users(state: &AppState) -> PosResult<Value> {
    auth::login_users(&state.db)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionPayload {
    #[serde(alias = "session_id")]
    session_id: String,
    permission: String,
}

pub fn check_permission(state: &AppState, payload: Value) -> PosResult<Value> {
    let parsed: PermissionPayload = serde_json::from_value(payload)?;
    let granted =
        auth::check_permission(&state.db, &state.auth, &parsed.session_id, &parsed.permission)?;
    Ok(json!({ "permission": parsed.permission, "granted": granted }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionPayload {
    #[serde(alias = "session_id")]
    session_id: String,
    action: String,
}

/// Action gate for UI affordances. Approval actions additionally require
/// the role flag, not just the permission token.
pub fn can_perform_action(state: &AppState, payload: Value) -> PosResult<Value> {
    let parsed: ActionPayload = serde_json::from_value(payload)?;
    let (_, role) = auth::resolve_session(&state.db, &state.auth, &parsed.session_id)?;

    let allowed = match parsed.action.as_str() {
        "approve_storno" | "review_changes" => role.can_approve_changes,
        "manage_users" => role.can_manage_users,
        action => role.permissions.iter().any(|p| p == action),
    };
    Ok(json!({ "action": parsed.action, "allowed": allowed }))
}
