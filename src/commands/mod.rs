//! Protocol command adapters.
//!
//! Each inbound `{operationId, command, payload}` frame routes through
//! [`dispatch`]. Adapters parse the payload into typed structs, call the
//! domain modules, and shape the reply. Response command names follow the
//! `<command>Response` convention except where clients group handlers
//! (`orderUpdated`, `transactionFinished`, `reprintResult`).

mod auth;
mod catalog;
mod storno;
mod transactions;

use serde_json::Value;

use crate::error::{PosError, PosResult};
use crate::AppState;

/// Route one command to its adapter.
pub fn dispatch(state: &AppState, command: &str, payload: Value) -> PosResult<Value> {
    match command {
        // Liveness
        "ping_ws" => Ok(serde_json::json!({ "pong": true })),

        // Auth
        "login" => auth::login(state, payload),
        "logout" => auth::logout(state, payload),
        "getCurrentUser" => auth::get_current_user(state, payload),
        "getLoginUsers" => auth::get_login_users(state),
        "checkPermission" => auth::check_permission(state, payload),
        "canPerformAction" => auth::can_perform_action(state, payload),

        // Transaction lifecycle
        "findOrCreateActiveTransaction" => transactions::find_or_create(state, payload),
        "addItemToTransaction" => transactions::add_item(state, payload),
        "updateItemQuantity" => transactions::update_item_quantity(state, payload),
        "updateItemPrice" => transactions::update_item_price(state, payload),
        "addCustomPriceItem" => transactions::add_custom_price_item(state, payload),
        "finishTransaction" => transactions::finish(state, payload),
        "parkTransaction" => transactions::park(state, payload),
        "activateTransaction" => transactions::activate(state, payload),
        "getParkedTransactions" => transactions::get_parked(state),
        "updateTransactionMetadata" => transactions::update_metadata(state, payload),
        "checkTableAvailability" => transactions::check_table(state, payload),
        "getPendingTransactions" => transactions::get_pending(state),
        "resolvePendingTransaction" => transactions::resolve_pending(state, payload),
        "reprintReceipt" => transactions::reprint(state, payload),
        "getRecentReceipts" => transactions::recent_receipts(state, payload),

        // Storno / approvals
        "performStorno" => storno::perform(state, payload),
        "approveStorno" => storno::approve(state, payload),
        "rejectStorno" => storno::reject(state, payload),
        "getPendingStornos" => storno::pending_stornos(state),
        "getPendingChanges" => storno::pending_changes(state),
        "approveChange" => storno::approve_change(state, payload),
        "rejectChange" => storno::reject_change(state, payload),
        "batchProcessChanges" => storno::batch_process(state, payload),
        "getManagerDashboard" => storno::manager_dashboard(state),

        // Catalog / search / layouts
        "getCategories" => catalog::get_categories(state),
        "getItemsByCategory" => catalog::get_items_by_category(state, payload),
        "searchProducts" => catalog::search_products(state, payload),
        "importProducts" => catalog::import_products(state, payload),
        "listLayouts" => catalog::list_layouts(state),
        "saveLayout" => catalog::save_layout(state, payload),
        "activateLayout" => catalog::activate_layout(state, payload),
        "logClientEvent" => catalog::log_client_event(state, payload),

        other => Err(PosError::Validation(format!("unknown command '{other}'"))),
    }
}

/// The `command` value echoed in the reply.
pub fn response_command(command: &str) -> String {
    match command {
        "findOrCreateActiveTransaction"
        | "addItemToTransaction"
        | "updateItemQuantity"
        | "updateItemPrice"
        | "addCustomPriceItem"
        | "parkTransaction"
        | "activateTransaction"
        | "updateTransactionMetadata" => "orderUpdated".to_string(),
        "finishTransaction" => "transactionFinished".to_string(),
        "reprintReceipt" => "reprintResult".to_string(),
        other => format!("{other}Response"),
    }
}

/// Broadcast pushed to other clients after a successful mutation of shared
/// state, if any.
pub fn broadcast_for(command: &str) -> Option<&'static str> {
    match command {
        "parkTransaction" | "activateTransaction" | "finishTransaction" => {
            Some("parkedTransactionsChanged")
        }
        "resolvePendingTransaction" => Some("pendingTransactionsChanged"),
        "performStorno" | "approveStorno" | "rejectStorno" | "approveChange" | "rejectChange"
        | "batchProcessChanges" => Some("pendingApprovalsChanged"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Shared payload helpers
// ---------------------------------------------------------------------------

/// Resolve an optional session id to a user id; `None` when absent.
pub(crate) fn optional_user_id(state: &AppState, payload: &Value) -> PosResult<Option<i64>> {
    let Some(session_id) = payload.get("sessionId").and_then(Value::as_str) else {
        return Ok(None);
    };
    let (user, _) = crate::auth::resolve_session(&state.db, &state.auth, session_id)?;
    Ok(Some(user.id))
}

/// Resolve a mandatory session id to its user and role.
pub(crate) fn required_user(
    state: &AppState,
    payload: &Value,
) -> PosResult<(crate::models::User, crate::models::Role)> {
    let session_id = payload
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| PosError::Validation("sessionId required".into()))?;
    crate::auth::resolve_session(&state.db, &state.auth, session_id)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_renames() {
        assert_eq!(response_command("addItemToTransaction"), "orderUpdated");
        assert_eq!(response_command("finishTransaction"), "transactionFinished");
        assert_eq!(response_command("reprintReceipt"), "reprintResult");
        assert_eq!(
            response_command("checkTableAvailability"),
            "checkTableAvailabilityResponse"
        );
        assert_eq!(response_command("ping_ws"), "ping_wsResponse");
    }

    #[test]
    fn test_broadcast_map() {
        assert_eq!(broadcast_for("parkTransaction"), Some("parkedTransactionsChanged"));
        assert_eq!(broadcast_for("performStorno"), Some("pendingApprovalsChanged"));
        assert_eq!(broadcast_for("ping_ws"), None);
    }
}
