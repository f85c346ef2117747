//! Catalog, search, layout, and client-event commands.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::commands::{optional_user_id, required_user};
use crate::error::{PosError, PosResult};
use crate::models::resolve_display_name;
use crate::repository as repo;
use crate::search::{self, SearchOptions};
use crate::{fiscal, import, layouts, AppState};

pub fn get_categories(state: &AppState) -> PosResult<Value> {
    let conn = state.db.conn.lock()?;
    let categories = repo::all_categories(&conn)?;
    let list: Vec<Value> = categories
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "displayName": resolve_display_name(&c.category_names),
                "categoryNames": c.category_names,
                "categoryType": c.category_type,
            })
        })
        .collect();
    Ok(json!({ "categories": list }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemsByCategoryPayload {
    #[serde(alias = "category_id")]
    category_id: i64,
}

pub fn get_items_by_category(state: &AppState, payload: Value) -> PosResult<Value> {
    let parsed: ItemsByCategoryPayload = serde_json::from_value(payload)?;
    let conn = state.db.conn.lock()?;
    let items = repo::items_by_category(&conn, parsed.category_id)?;
    let list: Vec<Value> = items
        .iter()
        .map(|i| {
            json!({
                "id": i.id,
                "displayName": resolve_display_name(&i.display_names),
                "displayNames": i.display_names,
                "price": i.price,
                "itemFlags": i.item_flags,
            })
        })
        .collect();
    Ok(json!({ "categoryId": parsed.category_id, "items": list }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPayload {
    query: String,
    #[serde(default, alias = "fts_only")]
    fts_only: bool,
    #[serde(default, alias = "vector_only")]
    vector_only: bool,
    #[serde(default, alias = "levenshtein_threshold")]
    levenshtein_threshold: Option<usize>,
    #[serde(default, alias = "vector_distance_threshold")]
    vector_distance_threshold: Option<f32>,
}

pub fn search_products(state: &AppState, payload: Value) -> PosResult<Value> {
    let parsed: SearchPayload = serde_json::from_value(payload)?;
    search::search_products(
        &state.db,
        state.embedder.as_ref(),
        &parsed.query,
        &SearchOptions {
            fts_only: parsed.fts_only,
            vector_only: parsed.vector_only,
            levenshtein_threshold: parsed.levenshtein_threshold,
            vector_distance_threshold: parsed.vector_distance_threshold,
        },
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportPayload {
    export: Value,
}

/// Replace the catalog from an export. Requires the import permission.
pub fn import_products(state: &AppState, payload: Value) -> PosResult<Value> {
    let (user, role) = required_user(state, &payload)?;
    if !role.permissions.iter().any(|p| p == "import_catalog") {
        return Err(PosError::PermissionDenied(format!(
            "user {} cannot import the catalog",
            user.username
        )));
    }
    let parsed: ImportPayload = serde_json::from_value(payload)?;
    let report = import::import_catalog(&state.db, state.embedder.clone(), &parsed.export)?;
    Ok(report.to_json())
}

pub fn list_layouts(state: &AppState) -> PosResult<Value> {
    let list = layouts::list_layouts(&state.db)?;
    let active = layouts::get_active_layout(&state.db)?;
    Ok(json!({ "layouts": list, "active": active }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveLayoutPayload {
    name: String,
    #[serde(alias = "categories_snapshot", alias = "categories")]
    categories_snapshot: Value,
    #[serde(default = "default_source_type", alias = "source_type")]
    source_type: String,
}

fn default_source_type() -> String {
    "manual".to_string()
}

pub fn save_layout(state: &AppState, payload: Value) -> PosResult<Value> {
    let parsed: SaveLayoutPayload = serde_json::from_value(payload)?;
    let layout = layouts::save_layout(
        &state.db,
        &parsed.name,
        &parsed.categories_snapshot,
        &parsed.source_type,
    )?;
    Ok(json!({ "layout": layout }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivateLayoutPayload {
    #[serde(alias = "layout_id")]
    layout_id: i64,
}

pub fn activate_layout(state: &AppState, payload: Value) -> PosResult<Value> {
    let parsed: ActivateLayoutPayload = serde_json::from_value(payload)?;
    let layout = layouts::activate_layout(&state.db, parsed.layout_id)?;
    Ok(json!({ "layout": layout }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientEventPayload {
    #[serde(alias = "event_type", alias = "event")]
    event_type: String,
    #[serde(default)]
    details: Value,
}

/// Append a client-reported UI event to the operational log.
pub fn log_client_event(state: &AppState, payload: Value) -> PosResult<Value> {
    let user_id = optional_user_id(state, &payload)?;
    let parsed: ClientEventPayload = serde_json::from_value(payload)?;
    let conn = state.db.conn.lock()?;
    let id = fiscal::log_operational_event(
        &conn,
        &format!("client:{}", parsed.event_type),
        None,
        user_id,
        &parsed.details,
    )?;
    Ok(json!({ "logged": true, "entryId": id }))
}
