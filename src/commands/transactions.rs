//! Transaction lifecycle commands.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::commands::optional_user_id;
use crate::error::{PosError, PosResult};
use crate::transactions::{FindOrCreateCriteria, FinishOutcome, MutationOutcome, PaymentData};
use crate::AppState;

fn outcome_json(outcome: MutationOutcome) -> Value {
    let mut value = json!({
        "transaction": outcome.transaction,
        "items": outcome.items,
    });
    if let Some(warning) = outcome.fiscal_warning {
        value["warning"] = json!(warning);
    }
    value
}

fn finish_json(outcome: FinishOutcome) -> Value {
    let mut value = json!({
        "transaction": outcome.transaction,
        "items": outcome.items,
        "processData": outcome.process_data,
        "printStatus": outcome.print_status,
    });
    if let Some(warning) = outcome.fiscal_warning {
        value["warning"] = json!(warning);
    }
    value
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindOrCreatePayload {
    #[serde(default, alias = "transaction_id")]
    transaction_id: Option<i64>,
    #[serde(default)]
    metadata: Option<Value>,
}

pub fn find_or_create(state: &AppState, payload: Value) -> PosResult<Value> {
    let user_id = optional_user_id(state, &payload)?;
    let parsed: FindOrCreatePayload = serde_json::from_value(payload)?;
    let outcome = state.engine.find_or_create(
        FindOrCreateCriteria {
            transaction_id: parsed.transaction_id,
            metadata: parsed.metadata,
        },
        user_id,
    )?;
    Ok(outcome_json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddItemPayload {
    #[serde(alias = "transaction_id")]
    transaction_id: i64,
    #[serde(alias = "item_id")]
    item_id: i64,
    quantity: Decimal,
    #[serde(default)]
    notes: Option<String>,
}

pub fn add_item(state: &AppState, payload: Value) -> PosResult<Value> {
    let user_id = optional_user_id(state, &payload)?;
    let parsed: AddItemPayload = serde_json::from_value(payload)?;
    let outcome = state.engine.add_item(
        parsed.transaction_id,
        parsed.item_id,
        parsed.quantity,
        user_id,
        parsed.notes,
    )?;
    Ok(outcome_json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateQuantityPayload {
    #[serde(alias = "transaction_id")]
    transaction_id: i64,
    #[serde(alias = "item_line_id", alias = "lineId")]
    item_line_id: i64,
    #[serde(alias = "new_quantity", alias = "quantity")]
    new_quantity: Decimal,
}

pub fn update_item_quantity(state: &AppState, payload: Value) -> PosResult<Value> {
    let user_id = optional_user_id(state, &payload)?;
    let parsed: UpdateQuantityPayload = serde_json::from_value(payload)?;
    let outcome = state.engine.update_item_quantity(
        parsed.transaction_id,
        parsed.item_line_id,
        parsed.new_quantity,
        user_id,
    )?;
    Ok(outcome_json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePricePayload {
    #[serde(alias = "transaction_id")]
    transaction_id: i64,
    #[serde(alias = "item_line_id", alias = "lineId")]
    item_line_id: i64,
    #[serde(alias = "new_price", alias = "price")]
    new_price: Decimal,
    #[serde(default, alias = "is_total_price")]
    is_total_price: bool,
}

pub fn update_item_price(state: &AppState, payload: Value) -> PosResult<Value> {
    let user_id = optional_user_id(state, &payload)?;
    let parsed: UpdatePricePayload = serde_json::from_value(payload)?;
    let outcome = state.engine.update_item_price(
        parsed.transaction_id,
        parsed.item_line_id,
        parsed.new_price,
        user_id,
        parsed.is_total_price,
    )?;
    Ok(outcome_json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomPricePayload {
    #[serde(alias = "transaction_id")]
    transaction_id: i64,
    #[serde(alias = "item_id")]
    item_id: i64,
    quantity: Decimal,
    #[serde(alias = "custom_price", alias = "price")]
    custom_price: Decimal,
}

pub fn add_custom_price_item(state: &AppState, payload: Value) -> PosResult<Value> {
    let user_id = optional_user_id(state, &payload)?;
    let parsed: CustomPricePayload = serde_json::from_value(payload)?;
    let outcome = state.engine.add_custom_price_item(
        parsed.transaction_id,
        parsed.item_id,
        parsed.quantity,
        parsed.custom_price,
        user_id,
    )?;
    Ok(outcome_json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishPayload {
    #[serde(alias = "transaction_id")]
    transaction_id: i64,
    payment: PaymentPayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentPayload {
    #[serde(alias = "payment_type", alias = "type")]
    payment_type: String,
    amount: Decimal,
}

pub fn finish(state: &AppState, payload: Value) -> PosResult<Value> {
    let user_id = optional_user_id(state, &payload)?;
    let parsed: FinishPayload = serde_json::from_value(payload)?;
    if parsed.payment.payment_type.trim().is_empty() {
        return Err(PosError::Validation("payment type required".into()));
    }
    let outcome = state.engine.finish(
        parsed.transaction_id,
        PaymentData {
            payment_type: parsed.payment.payment_type,
            amount: parsed.payment.amount,
        },
        user_id,
    )?;
    Ok(finish_json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParkPayload {
    #[serde(alias = "transaction_id")]
    transaction_id: i64,
    #[serde(alias = "table", alias = "table_number")]
    table_number: String,
    #[serde(default = "default_true", alias = "update_timestamp")]
    update_timestamp: bool,
}

fn default_true() -> bool {
    true
}

pub fn park(state: &AppState, payload: Value) -> PosResult<Value> {
    let user_id = optional_user_id(state, &payload)?;
    let parsed: ParkPayload = serde_json::from_value(payload)?;
    let outcome = state.engine.park(
        parsed.transaction_id,
        &parsed.table_number,
        user_id,
        parsed.update_timestamp,
    )?;
    Ok(outcome_json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivatePayload {
    #[serde(alias = "transaction_id")]
    transaction_id: i64,
    #[serde(default, alias = "update_timestamp")]
    update_timestamp: bool,
}

pub fn activate(state: &AppState, payload: Value) -> PosResult<Value> {
    let user_id = optional_user_id(state, &payload)?;
    let parsed: ActivatePayload = serde_json::from_value(payload)?;
    let outcome =
        state
            .engine
            .activate(parsed.transaction_id, user_id, parsed.update_timestamp)?;
    Ok(outcome_json(outcome))
}

pub fn get_parked(state: &AppState) -> PosResult<Value> {
    let parked = state.engine.parked_transactions()?;
    Ok(json!({
        "transactions": parked.into_iter().map(outcome_json).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataPayload {
    #[serde(alias = "transaction_id")]
    transaction_id: i64,
    metadata: Value,
    #[serde(default, alias = "update_timestamp")]
    update_timestamp: bool,
}

pub fn update_metadata(state: &AppState, payload: Value) -> PosResult<Value> {
    let user_id = optional_user_id(state, &payload)?;
    let parsed: MetadataPayload = serde_json::from_value(payload)?;
    if !parsed.metadata.is_object() {
        return Err(PosError::Validation("metadata must be an object".into()));
    }
    let outcome = state.engine.update_metadata(
        parsed.transaction_id,
        &parsed.metadata,
        user_id,
        parsed.update_timestamp,
    )?;
    Ok(outcome_json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableCheckPayload {
    #[serde(alias = "table", alias = "table_number")]
    table_number: String,
    #[serde(default, alias = "exclude_transaction_id", alias = "excludeTx")]
    exclude_transaction_id: Option<i64>,
}

pub fn check_table(state: &AppState, payload: Value) -> PosResult<Value> {
    let parsed: TableCheckPayload = serde_json::from_value(payload)?;
    let in_use = state
        .engine
        .check_table_in_use(&parsed.table_number, parsed.exclude_transaction_id)?;
    Ok(json!({ "table": parsed.table_number, "inUse": in_use }))
}

pub fn get_pending(state: &AppState) -> PosResult<Value> {
    let pending = state.engine.pending_transactions()?;
    Ok(json!({
        "transactions": pending.into_iter().map(outcome_json).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolvePayload {
    #[serde(alias = "transaction_id")]
    transaction_id: i64,
    resolution: String,
}

pub fn resolve_pending(state: &AppState, payload: Value) -> PosResult<Value> {
    let user_id = optional_user_id(state, &payload)?;
    let parsed: ResolvePayload = serde_json::from_value(payload)?;
    let outcome =
        state
            .engine
            .resolve_pending(parsed.transaction_id, &parsed.resolution, user_id)?;
    Ok(outcome_json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReprintPayload {
    #[serde(alias = "transaction_id")]
    transaction_id: i64,
}

pub fn reprint(state: &AppState, payload: Value) -> PosResult<Value> {
    let user_id = optional_user_id(state, &payload)?;
    let parsed: ReprintPayload = serde_json::from_value(payload)?;
    state.engine.reprint_receipt(parsed.transaction_id, user_id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecentPayload {
    #[serde(default = "default_recent_limit")]
    limit: i64,
}

fn default_recent_limit() -> i64 {
    20
}

pub fn recent_receipts(state: &AppState, payload: Value) -> PosResult<Value> {
    let parsed: RecentPayload = serde_json::from_value(payload).unwrap_or(RecentPayload {
        limit: default_recent_limit(),
    });
    let limit = parsed.limit.clamp(1, 100);
    let recent = state.engine.recent_receipts(limit)?;
    Ok(json!({
        "transactions": recent.into_iter().map(outcome_json).collect::<Vec<_>>(),
    }))
}
