//! Storno and approval commands.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::commands::required_user;
use crate::error::{PosError, PosResult};
use crate::storno::StornoOutcome;
use crate::AppState;

fn outcome_json(outcome: StornoOutcome) -> Value {
    let mut value = json!({ "storno": outcome.storno });
    if let Some(change_id) = outcome.pending_change_id {
        value["pendingChangeId"] = json!(change_id);
        value["requiresApproval"] = json!(true);
    }
    if let Some(warning) = outcome.fiscal_warning {
        value["warning"] = json!(warning);
    }
    value
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PerformPayload {
    #[serde(default, alias = "transaction_uuid", alias = "originalTransactionUuid")]
    transaction_uuid: Option<String>,
    amount: Decimal,
    #[serde(default)]
    reason: String,
    #[serde(default, alias = "is_emergency")]
    is_emergency: bool,
}

pub fn perform(state: &AppState, payload: Value) -> PosResult<Value> {
    let (user, _) = required_user(state, &payload)?;
    let parsed: PerformPayload = serde_json::from_value(payload)?;
    if parsed.reason.trim().is_empty() {
        return Err(PosError::Validation("storno reason required".into()));
    }
    let outcome = state.storno.perform_storno(
        user.id,
        parsed.transaction_uuid.as_deref(),
        parsed.amount,
        parsed.reason.trim(),
        parsed.is_emergency,
    )?;
    Ok(outcome_json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewStornoPayload {
    #[serde(alias = "storno_id")]
    storno_id: i64,
    #[serde(default)]
    notes: Option<String>,
}

pub fn approve(state: &AppState, payload: Value) -> PosResult<Value> {
    let (manager, _) = required_user(state, &payload)?;
    let parsed: ReviewStornoPayload = serde_json::from_value(payload)?;
    let outcome = state
        .storno
        .approve_storno(&manager, parsed.storno_id, parsed.notes.as_deref())?;
    Ok(outcome_json(outcome))
}

pub fn reject(state: &AppState, payload: Value) -> PosResult<Value> {
    let (manager, _) = required_user(state, &payload)?;
    let parsed: ReviewStornoPayload = serde_json::from_value(payload)?;
    let outcome = state
        .storno
        .reject_storno(&manager, parsed.storno_id, parsed.notes.as_deref())?;
    Ok(outcome_json(outcome))
}

pub fn pending_stornos(state: &AppState) -> PosResult<Value> {
    let stornos = state.storno.pending_stornos()?;
    Ok(json!({ "stornos": stornos }))
}

pub fn pending_changes(state: &AppState) -> PosResult<Value> {
    let changes = state.storno.pending_changes()?;
    Ok(json!({ "changes": changes }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewChangePayload {
    #[serde(alias = "change_id")]
    change_id: i64,
    #[serde(default)]
    notes: Option<String>,
}

pub fn approve_change(state: &AppState, payload: Value) -> PosResult<Value> {
    let (manager, _) = required_user(state, &payload)?;
    let parsed: ReviewChangePayload = serde_json::from_value(payload)?;
    state
        .storno
        .review_change(&manager, parsed.change_id, true, parsed.notes.as_deref())
}

pub fn reject_change(state: &AppState, payload: Value) -> PosResult<Value> {
    let (manager, _) = required_user(state, &payload)?;
    let parsed: ReviewChangePayload = serde_json::from_value(payload)?;
    state
        .storno
        .review_change(&manager, parsed.change_id, false, parsed.notes.as_deref())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchPayload {
    #[serde(alias = "change_ids")]
    change_ids: Vec<i64>,
    approve: bool,
    #[serde(default)]
    notes: Option<String>,
}

pub fn batch_process(state: &AppState, payload: Value) -> PosResult<Value> {
    let (manager, _) = required_user(state, &payload)?;
    let parsed: BatchPayload = serde_json::from_value(payload)?;
    state.storno.batch_process_changes(
        &manager,
        &parsed.change_ids,
        parsed.approve,
        parsed.notes.as_deref(),
    )
}

pub fn manager_dashboard(state: &AppState) -> PosResult<Value> {
    state.storno.manager_dashboard()
}
