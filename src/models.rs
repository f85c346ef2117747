//! Typed entities and column normalization.
//!
//! The storage engine hands back JSON columns as TEXT; other engines return
//! native objects. Normalization lives here so the rest of the server only
//! ever sees structured values: strings are parsed, objects pass through,
//! and a parse failure yields an empty mapping plus a warning.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Active,
    Parked,
    Finished,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Active => "active",
            TransactionStatus::Parked => "parked",
            TransactionStatus::Finished => "finished",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TransactionStatus::Active),
            "parked" => Some(TransactionStatus::Parked),
            "finished" => Some(TransactionStatus::Finished),
            "cancelled" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }
}

/// Post-crash resolution state of a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    None,
    Pending,
    Postponed,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::None => "none",
            ResolutionStatus::Pending => "pending",
            ResolutionStatus::Postponed => "postponed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ResolutionStatus::None),
            "pending" => Some(ResolutionStatus::Pending),
            "postponed" => Some(ResolutionStatus::Postponed),
            _ => None,
        }
    }
}

/// Two-phase write-ahead record state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOpStatus {
    Pending,
    TseSuccess,
    TseFailed,
}

impl PendingOpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingOpStatus::Pending => "PENDING",
            PendingOpStatus::TseSuccess => "TSE_SUCCESS",
            PendingOpStatus::TseFailed => "TSE_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PendingOpStatus::Pending),
            "TSE_SUCCESS" => Some(PendingOpStatus::TseSuccess),
            "TSE_FAILED" => Some(PendingOpStatus::TseFailed),
            _ => None,
        }
    }
}

/// Reserved notes tokens on compliance child lines.
pub const NOTE_STORNO: &str = "STORNO";
pub const NOTE_DISCOUNT: &str = "DISCOUNT";
pub const NOTE_SURCHARGE: &str = "SURCHARGE";

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A receipt under construction (or finished/cancelled).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTransaction {
    pub id: i64,
    pub uuid: String,
    pub status: TransactionStatus,
    pub resolution_status: ResolutionStatus,
    pub user_id: Option<i64>,
    pub business_date: String,
    pub total_amount: Decimal,
    pub tax_amount: Decimal,
    pub payment_type: Option<String>,
    pub payment_amount: Option<Decimal>,
    pub metadata: Value,
    pub created_at: String,
    pub updated_at: String,
}

/// A single receipt line. Negative quantities mark storno lines.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionItem {
    pub id: i64,
    pub active_transaction_id: i64,
    pub item_id: i64,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub parent_transaction_item_id: Option<i64>,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Resolved display name, filled when listing for clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// One append-only fiscal log row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FiscalLogEntry {
    pub id: i64,
    pub transaction_uuid: String,
    pub event_type: String,
    pub user_id: Option<i64>,
    pub payload: Value,
    pub signature: Option<String>,
    pub signature_counter: Option<i64>,
    pub timestamp_utc: String,
}

/// A two-phase write-ahead record awaiting commit.
#[derive(Debug, Clone)]
pub struct PendingFiscalOperation {
    pub id: i64,
    pub operation_id: String,
    pub status: PendingOpStatus,
    pub request_payload: Value,
    pub signed_payload: Option<Value>,
}

/// Operator account with storno credit accounting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub username: String,
    pub full_name: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role_id: i64,
    pub storno_daily_limit: Decimal,
    pub storno_emergency_limit: Decimal,
    pub storno_used_today: Decimal,
    pub trust_score: Decimal,
    pub is_active: bool,
    pub force_password_change: bool,
}

/// Permission set shared by users.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: i64,
    pub role_name: String,
    pub permissions: Vec<String>,
    pub can_approve_changes: bool,
    pub can_manage_users: bool,
}

/// One storno request and its approval outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StornoEntry {
    pub id: i64,
    pub transaction_uuid: Option<String>,
    pub user_id: i64,
    pub amount: Decimal,
    pub reason: String,
    pub is_emergency: bool,
    pub approval_status: String,
    pub credit_used: Decimal,
    pub approved_by: Option<i64>,
    pub approver_notes: Option<String>,
    pub created_at: String,
}

/// Generic manager-approval record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub id: i64,
    pub change_type: String,
    pub target_entity: String,
    pub target_id: Option<i64>,
    pub proposed_payload: Value,
    pub priority: String,
    pub status: String,
    pub requested_by: Option<i64>,
    pub reviewed_by: Option<i64>,
    pub review_notes: Option<String>,
    pub created_at: String,
}

/// A named snapshot of the catalog arrangement.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Layout {
    pub id: i64,
    pub layout_name: String,
    pub categories_snapshot: Value,
    pub source_type: String,
    pub is_active: bool,
    pub created_at: String,
}

/// A catalog category with its multilingual names.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: i64,
    pub pos_device_id: i64,
    pub category_names: Value,
    pub category_type: String,
}

/// A sellable catalog item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: i64,
    pub pos_device_id: i64,
    pub category_id: i64,
    pub display_names: Value,
    pub price: Decimal,
    pub item_flags: Value,
}

// ---------------------------------------------------------------------------
// Column normalization
// ---------------------------------------------------------------------------

/// Normalize a JSON column read from storage.
///
/// Storage engines disagree on JSON column shape: some return the parsed
/// object, some the raw string. Accept both; on parse failure return an
/// empty mapping and log, never fail the read.
pub fn normalize_json(raw: Value, context: &str) -> Value {
    match raw {
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(context, error = %e, "Malformed JSON column, substituting empty object");
                Value::Object(serde_json::Map::new())
            }
        },
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    }
}

/// Normalize a TEXT JSON column (the SQLite case).
pub fn parse_json_column(raw: Option<String>, context: &str) -> Value {
    match raw {
        Some(s) => normalize_json(Value::String(s), context),
        None => Value::Object(serde_json::Map::new()),
    }
}

/// Serialize a structured value for a JSON TEXT column.
pub fn json_to_column(value: &Value) -> String {
    value.to_string()
}

/// Parse a decimal TEXT column, treating junk as zero with a warning.
pub fn parse_decimal_column(raw: &str, context: &str) -> Decimal {
    raw.parse::<Decimal>().unwrap_or_else(|e| {
        warn!(context, raw, error = %e, "Malformed decimal column, substituting zero");
        Decimal::ZERO
    })
}

/// Resolve a display name from a multilingual name map.
///
/// Preference order: `de`, then `en`, then the first entry, then a
/// placeholder. Plain-string columns pass through unchanged.
pub fn resolve_display_name(names: &Value) -> String {
    match names {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("de")
            .or_else(|| map.get("en"))
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| {
                map.values()
                    .find_map(|v| v.as_str().map(String::from))
            })
            .unwrap_or_else(|| "(unnamed)".to_string()),
        _ => "(unnamed)".to_string(),
    }
}

/// Current UTC timestamp in RFC 3339.
pub fn now_utc() -> String {
    Utc::now().to_rfc3339()
}

/// Current UTC calendar day (`YYYY-MM-DD`), the business date.
pub fn business_date_today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_json_string_form() {
        let v = normalize_json(Value::String(r#"{"table":"5"}"#.into()), "metadata");
        assert_eq!(v["table"], "5");
    }

    #[test]
    fn test_normalize_json_object_passthrough() {
        let v = normalize_json(json!({"table": "5"}), "metadata");
        assert_eq!(v["table"], "5");
    }

    #[test]
    fn test_normalize_json_garbage_becomes_empty_map() {
        let v = normalize_json(Value::String("{not json".into()), "metadata");
        assert_eq!(v, json!({}));
    }

    #[test]
    fn test_parse_decimal_column_garbage_is_zero() {
        assert_eq!(parse_decimal_column("bogus", "price"), Decimal::ZERO);
        assert_eq!(
            parse_decimal_column("3.50", "price"),
            Decimal::new(350, 2)
        );
    }

    #[test]
    fn test_resolve_display_name_preference() {
        assert_eq!(
            resolve_display_name(&json!({"de": "Kaffee", "en": "Coffee"})),
            "Kaffee"
        );
        assert_eq!(resolve_display_name(&json!({"en": "Coffee"})), "Coffee");
        assert_eq!(resolve_display_name(&json!({"fr": "Café"})), "Café");
        assert_eq!(resolve_display_name(&json!("Plain")), "Plain");
        assert_eq!(resolve_display_name(&json!(42)), "(unnamed)");
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for s in ["active", "parked", "finished", "cancelled"] {
            assert_eq!(TransactionStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(TransactionStatus::parse("limbo").is_none());
        for s in ["none", "pending", "postponed"] {
            assert_eq!(ResolutionStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["PENDING", "TSE_SUCCESS", "TSE_FAILED"] {
            assert_eq!(PendingOpStatus::parse(s).unwrap().as_str(), s);
        }
    }
}
