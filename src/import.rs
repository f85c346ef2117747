//! Bulk catalog import with content-addressed embedding reuse.
//!
//! Replaces the whole catalog tree atomically: child tables are cleared in
//! referential order, identity sequences reset, then the tree is rebuilt
//! company → branches → pos devices → categories → items while a source-id
//! map translates the export's identifiers.
//!
//! Embeddings are expensive; an item whose export carries `embeddingData`
//! with a SHA-256 matching the freshly computed semantic string reuses the
//! shipped vector instead of calling the provider. Per-item failures are
//! collected, never fatal to the import.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::params;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::db::{with_envelope, DbState};
use crate::embeddings::{encode_embedding, semantic_hash, EmbeddingProvider, EMBEDDING_DIMS};
use crate::error::{PosError, PosResult};
use crate::models::{now_utc, resolve_display_name};

/// Import statistics returned to the caller.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub companies: usize,
    pub branches: usize,
    pub pos_devices: usize,
    pub categories: usize,
    pub items: usize,
    pub embeddings_reused: usize,
    pub embeddings_computed: usize,
    pub item_errors: Vec<String>,
}

impl ImportReport {
    pub fn to_json(&self) -> Value {
        json!({
            "companies": self.companies,
            "branches": self.branches,
            "posDevices": self.pos_devices,
            "categories": self.categories,
            "items": self.items,
            "embeddingsReused": self.embeddings_reused,
            "embeddingsComputed": self.embeddings_computed,
            "itemErrors": self.item_errors,
        })
    }
}

/// Import an OOP-MDF style catalog export, replacing the current catalog.
pub fn import_catalog(
    db: &DbState,
    embedder: Arc<dyn EmbeddingProvider>,
    export: &Value,
) -> PosResult<ImportReport> {
    let company = export
        .get("company")
        .ok_or_else(|| PosError::Validation("export missing company".into()))?;

    let mut report = ImportReport::default();
    // Reused vectors ready to insert after the envelope: (item_id, blob, hash)
    let mut vectors: Vec<(i64, Vec<u8>, String)> = Vec::new();
    // Items needing a provider call: (item_id, label, semantic, hash).
    // The provider is slow and remote; it never runs inside the envelope.
    let mut to_embed: Vec<(i64, String, String, String)> = Vec::new();

    {
        let conn = db.conn.lock()?;
        with_envelope(&conn, |c| {
            clear_catalog(c)?;
            let now = now_utc();

            let company_name = company
                .get("companyFullName")
                .or_else(|| company.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("Imported company");
            c.execute(
                "INSERT INTO companies (company_full_name, meta_information, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![
                    company_name,
                    company.get("metaInformation").cloned().unwrap_or(json!({})).to_string(),
                    now
                ],
            )?;
            let company_id = c.last_insert_rowid();
            report.companies += 1;

            for branch in array_of(company, "branches") {
                c.execute(
                    "INSERT INTO branches (company_id, branch_name, branch_address, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![
                        company_id,
                        name_map(branch, &["branchNames", "branchName", "name"]).to_string(),
                        branch.get("branchAddress").and_then(Value::as_str),
                        now
                    ],
                )?;
                let branch_id = c.last_insert_rowid();
                report.branches += 1;

                for device in array_of(branch, "posDevices") {
                    c.execute(
                        "INSERT INTO pos_devices
                            (branch_id, pos_device_name, pos_device_type,
                             pos_device_external_number, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                        params![
                            branch_id,
                            name_map(device, &["posDeviceNames", "posDeviceName", "name"])
                                .to_string(),
                            device
                                .get("posDeviceType")
                                .and_then(Value::as_str)
                                .unwrap_or("DESKTOP"),
                            device
                                .get("posDeviceExternalNumber")
                                .and_then(Value::as_i64)
                                .unwrap_or(1),
                            now
                        ],
                    )?;
                    let device_id = c.last_insert_rowid();
                    report.pos_devices += 1;

                    // source category id -> (storage id, display name)
                    let mut category_map: HashMap<String, (i64, String)> = HashMap::new();

                    for category in array_of(device, "categories") {
                        let names = name_map(category, &["categoryNames", "name"]);
                        c.execute(
                            "INSERT INTO categories
                                (pos_device_id, source_unique_identifier, category_names,
                                 category_type, audit_trail, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                            params![
                                device_id,
                                source_id(category),
                                names.to_string(),
                                category
                                    .get("categoryType")
                                    .and_then(Value::as_str)
                                    .unwrap_or("other"),
                                category
                                    .get("auditTrail")
                                    .cloned()
                                    .unwrap_or(json!({}))
                                    .to_string(),
                                now
                            ],
                        )?;
                        let category_id = c.last_insert_rowid();
                        report.categories += 1;
                        if let Some(src) = source_id(category) {
                            category_map
                                .insert(src, (category_id, resolve_display_name(&names)));
                        }
                    }

                    for item in array_of(device, "items") {
                        match import_item(
                            c,
                            device_id,
                            &category_map,
                            item,
                            &now,
                            &mut report,
                            &mut vectors,
                            &mut to_embed,
                        ) {
                            Ok(()) => report.items += 1,
                            Err(e) => {
                                let label = resolve_display_name(&name_map(
                                    item,
                                    &["displayNames", "name"],
                                ));
                                warn!(item = %label, "Item import failed: {e}");
                                report.item_errors.push(format!("{label}: {e}"));
                            }
                        }
                    }
                }
            }
            Ok(())
        })?;

    }

    // Provider calls run after the tree envelope has committed; a vector
    // failure cannot roll back the catalog.
    for (item_id, label, semantic, hash) in to_embed {
        match embedder.embed(&semantic) {
            Ok(vector) => {
                report.embeddings_computed += 1;
                vectors.push((item_id, encode_embedding(&vector), hash));
            }
            Err(e) => {
                warn!(item_id, item = %label, "Embedding request failed: {e}");
                report.item_errors.push(format!("{label}: embedding: {e}"));
            }
        }
    }

    {
        let conn = db.conn.lock()?;
        for (item_id, blob, hash) in &vectors {
            if let Err(e) = conn.execute(
                "INSERT OR REPLACE INTO item_embeddings (item_id, embedding, semantic_hash, dims)
                 VALUES (?1, ?2, ?3, ?4)",
                params![item_id, blob, hash, EMBEDDING_DIMS as i64],
            ) {
                warn!(item_id, "Embedding insert failed: {e}");
                report.item_errors.push(format!("embedding {item_id}: {e}"));
            }
        }
    }

    info!(
        items = report.items,
        reused = report.embeddings_reused,
        computed = report.embeddings_computed,
        errors = report.item_errors.len(),
        "Catalog import complete"
    );
    Ok(report)
}

/// Delete the catalog in referential order and reset identity sequences.
fn clear_catalog(conn: &rusqlite::Connection) -> PosResult<()> {
    conn.execute_batch(
        "DELETE FROM item_embeddings;
         DELETE FROM items_fts;
         DELETE FROM items;
         DELETE FROM categories;
         DELETE FROM pos_devices;
         DELETE FROM branches;
         DELETE FROM companies;",
    )
    .map_err(PosError::from)?;

    // sqlite_sequence only materializes after the first AUTOINCREMENT
    // insert; on a fresh database there is nothing to reset.
    let _ = conn.execute(
        "DELETE FROM sqlite_sequence
         WHERE name IN ('items', 'categories', 'pos_devices', 'branches', 'companies')",
        [],
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn import_item(
    conn: &rusqlite::Connection,
    device_id: i64,
    category_map: &HashMap<String, (i64, String)>,
    item: &Value,
    now: &str,
    report: &mut ImportReport,
    vectors: &mut Vec<(i64, Vec<u8>, String)>,
    to_embed: &mut Vec<(i64, String, String, String)>,
) -> PosResult<()> {
    let source_category = item
        .get("associatedCategoryUniqueIdentifier")
        .or_else(|| item.get("categoryId"))
        .map(id_string)
        .ok_or_else(|| PosError::Validation("item missing category reference".into()))?;
    let (category_id, category_name) = category_map
        .get(&source_category)
        .cloned()
        .ok_or_else(|| PosError::Validation(format!("unknown category {source_category}")))?;

    let names = name_map(item, &["displayNames", "name"]);
    let price = item
        .get("itemPriceValue")
        .or_else(|| item.get("price"))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "0".to_string());

    conn.execute(
        "INSERT INTO items
            (pos_device_id, associated_category_unique_identifier, source_unique_identifier,
             display_names, item_price_value, item_flags, audit_trail, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            device_id,
            category_id,
            source_id(item),
            names.to_string(),
            price,
            item.get("itemFlags").cloned().unwrap_or(json!({})).to_string(),
            item.get("auditTrail").cloned().unwrap_or(json!({})).to_string(),
            now
        ],
    )?;
    let item_id = conn.last_insert_rowid();

    let display_name = resolve_display_name(&names);
    conn.execute(
        "INSERT INTO items_fts (item_id, name, category_name) VALUES (?1, ?2, ?3)",
        params![item_id, display_name, category_name],
    )?;

    // Content-addressed embedding reuse
    let description = item
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("");
    let semantic =
        format!("Category: {category_name}. Product: {display_name}. Description: {description}");
    let hash = semantic_hash(&semantic);

    let shipped = item.get("embeddingData");
    let reusable = shipped.and_then(|data| {
        let shipped_hash = data.get("contentHash").and_then(Value::as_str)?;
        if shipped_hash != hash {
            return None;
        }
        let vector: Vec<f32> = data
            .get("vector")?
            .as_array()?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        (vector.len() == EMBEDDING_DIMS).then_some(vector)
    });

    match reusable {
        Some(vector) => {
            report.embeddings_reused += 1;
            vectors.push((item_id, encode_embedding(&vector), hash));
        }
        None => to_embed.push((item_id, display_name, semantic, hash)),
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Export walking helpers
// ---------------------------------------------------------------------------

fn array_of<'a>(value: &'a Value, key: &str) -> Vec<&'a Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter().collect())
        .unwrap_or_default()
}

/// A multilingual name map from the first matching key; a plain string
/// becomes `{"de": ...}`.
fn name_map(value: &Value, keys: &[&str]) -> Value {
    for key in keys {
        match value.get(*key) {
            Some(Value::Object(map)) => return Value::Object(map.clone()),
            Some(Value::String(s)) => return json!({ "de": s }),
            _ => {}
        }
    }
    json!({})
}

fn source_id(value: &Value) -> Option<String> {
    value
        .get("sourceUniqueIdentifier")
        .or_else(|| value.get("uniqueIdentifier"))
        .or_else(|| value.get("id"))
        .map(id_string)
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::embeddings::{CountingProvider, HashEmbeddingProvider};

    fn export_with(items: Vec<Value>) -> Value {
        json!({
            "company": {
                "companyFullName": "Muster GmbH",
                "branches": [{
                    "branchNames": {"de": "Filiale Mitte"},
                    "posDevices": [{
                        "posDeviceNames": {"de": "Kasse 1"},
                        "categories": [{
                            "uniqueIdentifier": 10,
                            "categoryNames": {"de": "Getränke", "en": "Drinks"},
                            "categoryType": "drink"
                        }],
                        "items": items
                    }]
                }]
            }
        })
    }

    fn plain_item(name: &str, price: &str) -> Value {
        json!({
            "uniqueIdentifier": 100,
            "associatedCategoryUniqueIdentifier": 10,
            "displayNames": {"de": name},
            "itemPriceValue": price,
        })
    }

    #[test]
    fn test_import_builds_full_tree() {
        let state = db::test_db();
        let report = import_catalog(
            &state,
            Arc::new(HashEmbeddingProvider),
            &export_with(vec![plain_item("Kaffee", "3.00")]),
        )
        .unwrap();

        assert_eq!(report.companies, 1);
        assert_eq!(report.branches, 1);
        assert_eq!(report.pos_devices, 1);
        assert_eq!(report.categories, 1);
        assert_eq!(report.items, 1);
        assert_eq!(report.embeddings_computed, 1);
        assert!(report.item_errors.is_empty());

        let conn = state.conn.lock().unwrap();
        let fts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM items_fts WHERE items_fts MATCH 'kaffee'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(fts, 1);
        let vectors: i64 = conn
            .query_row("SELECT COUNT(*) FROM item_embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(vectors, 1);
    }

    #[test]
    fn test_reimport_replaces_and_resets_sequences() {
        let state = db::test_db();
        let provider = Arc::new(HashEmbeddingProvider);
        import_catalog(
            &state,
            provider.clone(),
            &export_with(vec![plain_item("Kaffee", "3.00")]),
        )
        .unwrap();
        import_catalog(
            &state,
            provider,
            &export_with(vec![plain_item("Tee", "2.50")]),
        )
        .unwrap();

        let conn = state.conn.lock().unwrap();
        let (count, min_id): (i64, i64) = conn
            .query_row("SELECT COUNT(*), MIN(id) FROM items", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(min_id, 1);
    }

    #[test]
    fn test_embedding_reuse_with_matching_hash() {
        let state = db::test_db();
        let provider = Arc::new(CountingProvider::new());

        let semantic = "Category: Getränke. Product: Kaffee. Description: ";
        let vector = HashEmbeddingProvider.embed(semantic).unwrap();
        let mut item = plain_item("Kaffee", "3.00");
        item["embeddingData"] = json!({
            "contentHash": semantic_hash(semantic),
            "vector": vector,
        });

        let report = import_catalog(&state, provider.clone(), &export_with(vec![item])).unwrap();
        assert_eq!(report.embeddings_reused, 1);
        assert_eq!(report.embeddings_computed, 0);
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_stale_hash_recomputes() {
        let state = db::test_db();
        let provider = Arc::new(CountingProvider::new());

        let mut item = plain_item("Kaffee", "3.00");
        item["embeddingData"] = json!({
            "contentHash": "0000",
            "vector": HashEmbeddingProvider.embed("old").unwrap(),
        });

        let report = import_catalog(&state, provider.clone(), &export_with(vec![item])).unwrap();
        assert_eq!(report.embeddings_reused, 0);
        assert_eq!(report.embeddings_computed, 1);
        assert_eq!(provider.call_count(), 1);
    }

    #[test]
    fn test_item_error_does_not_abort_import() {
        let state = db::test_db();
        let broken = json!({
            "uniqueIdentifier": 101,
            "associatedCategoryUniqueIdentifier": 999,
            "displayNames": {"de": "Geisterprodukt"},
            "itemPriceValue": "1.00",
        });
        let report = import_catalog(
            &state,
            Arc::new(HashEmbeddingProvider),
            &export_with(vec![broken, plain_item("Kaffee", "3.00")]),
        )
        .unwrap();

        assert_eq!(report.items, 1);
        assert_eq!(report.item_errors.len(), 1);
        assert!(report.item_errors[0].contains("Geisterprodukt"));
    }

    #[test]
    fn test_missing_company_rejected() {
        let state = db::test_db();
        let result = import_catalog(&state, Arc::new(HashEmbeddingProvider), &json!({}));
        assert!(matches!(result, Err(PosError::Validation(_))));
    }
}
