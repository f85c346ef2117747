//! Hybrid catalog search: full-text, then vector similarity, then bounded
//! edit distance.
//!
//! The stages short-circuit: the first stage that yields results decides
//! the `searchMethod`. Vector similarity runs over the `item_embeddings`
//! side table with cosine distance computed in process; the catalog is
//! thousands of rows, not millions.

use rusqlite::params;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::debug;

use crate::db::DbState;
use crate::embeddings::{cosine_distance, decode_embedding, EmbeddingProvider};
use crate::error::PosResult;
use crate::models::{parse_decimal_column, parse_json_column, resolve_display_name};

/// Default cosine-distance acceptance threshold for the vector stage.
const DEFAULT_VECTOR_DISTANCE: f32 = 0.6;
/// Default maximum edit distance for the fuzzy stage.
const DEFAULT_LEVENSHTEIN: usize = 2;
/// Queries shorter than this skip the fuzzy stage entirely.
const MIN_FUZZY_QUERY_LEN: usize = 3;

/// Per-call search tuning.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub fts_only: bool,
    pub vector_only: bool,
    pub levenshtein_threshold: Option<usize>,
    pub vector_distance_threshold: Option<f32>,
}

/// Run the hybrid search and shape the reply for clients.
pub fn search_products(
    db: &DbState,
    embedder: &dyn EmbeddingProvider,
    query: &str,
    options: &SearchOptions,
) -> PosResult<Value> {
    let started = Instant::now();
    let query = query.trim();
    if query.is_empty() {
        return Ok(result_json(Vec::new(), "none", started));
    }

    let conn = db.conn.lock()?;

    // Stage 1: full-text
    if !options.vector_only {
        let results = fts_stage(&conn, query)?;
        if !results.is_empty() {
            return Ok(result_json(results, "fts", started));
        }
    }

    // Stage 2: vector similarity
    if !options.fts_only {
        let threshold = options
            .vector_distance_threshold
            .unwrap_or(DEFAULT_VECTOR_DISTANCE);
        match embedder.embed(query) {
            Ok(query_vector) => {
                let results = vector_stage(&conn, &query_vector, threshold)?;
                if !results.is_empty() {
                    return Ok(result_json(results, "vector", started));
                }
            }
            Err(e) => debug!("Vector stage skipped: {e}"),
        }
    }

    // Stage 3: bounded edit distance
    if !options.fts_only && !options.vector_only && query.chars().count() >= MIN_FUZZY_QUERY_LEN {
        let max_distance = options.levenshtein_threshold.unwrap_or(DEFAULT_LEVENSHTEIN);
        let results = fuzzy_stage(&conn, query, max_distance)?;
        if !results.is_empty() {
            return Ok(result_json(results, "fuzzy", started));
        }
    }

    Ok(result_json(Vec::new(), "none", started))
}

fn result_json(results: Vec<Value>, method: &str, started: Instant) -> Value {
    let count = results.len();
    json!({
        "results": results,
        "metadata": {
            "searchMethod": method,
            "resultCount": count,
            "executionTime": started.elapsed().as_millis() as u64,
        }
    })
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

fn fts_stage(conn: &rusqlite::Connection, query: &str) -> PosResult<Vec<Value>> {
    // Quote each token so user input cannot inject FTS5 query syntax.
    let match_expr = query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ");
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT f.item_id, f.name, f.category_name, i.item_price_value
         FROM items_fts f
         JOIN items i ON i.id = f.item_id
         WHERE items_fts MATCH ?1
         ORDER BY rank
         LIMIT 25",
    )?;
    let rows = stmt.query_map(params![match_expr], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut results = Vec::new();
    for row in rows {
        let (item_id, name, category_name, price_raw) = row?;
        results.push(json!({
            "itemId": item_id,
            "productName": name,
            "categoryName": category_name,
            "price": parse_decimal_column(&price_raw, "items.item_price_value"),
            "search_type": "fts",
        }));
    }
    Ok(results)
}

fn vector_stage(
    conn: &rusqlite::Connection,
    query_vector: &[f32],
    max_distance: f32,
) -> PosResult<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT e.item_id, e.embedding, i.display_names, i.item_price_value
         FROM item_embeddings e
         JOIN items i ON i.id = e.item_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut scored: Vec<(f32, Value)> = Vec::new();
    for row in rows {
        let (item_id, blob, names_raw, price_raw) = row?;
        let distance = cosine_distance(query_vector, &decode_embedding(&blob));
        if distance > max_distance {
            continue;
        }
        let names = parse_json_column(names_raw, "items.display_names");
        let similarity_pct = ((1.0 - distance) * 100.0).clamp(0.0, 100.0);
        scored.push((
            distance,
            json!({
                "itemId": item_id,
                "productName": resolve_display_name(&names),
                "price": parse_decimal_column(&price_raw, "items.item_price_value"),
                "similarity": format!("{similarity_pct:.1}%"),
                "search_type": "vector",
            }),
        ));
    }

    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scored.into_iter().take(25).map(|(_, v)| v).collect())
}

fn fuzzy_stage(
    conn: &rusqlite::Connection,
    query: &str,
    max_distance: usize,
) -> PosResult<Vec<Value>> {
    let mut stmt =
        conn.prepare("SELECT id, display_names, item_price_value FROM items")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let query_lower = query.to_lowercase();
    let mut scored: Vec<(usize, Value)> = Vec::new();
    for row in rows {
        let (item_id, names_raw, price_raw) = row?;
        let names = parse_json_column(names_raw, "items.display_names");
        let name = resolve_display_name(&names);
        let Some(distance) = bounded_levenshtein(&query_lower, &name.to_lowercase(), max_distance)
        else {
            continue;
        };
        scored.push((
            distance,
            json!({
                "itemId": item_id,
                "productName": name,
                "price": parse_decimal_column(&price_raw, "items.item_price_value"),
                "levenshteinDistance": distance,
                "search_type": "fuzzy",
            }),
        ));
    }

    scored.sort_by_key(|(d, _)| *d);
    Ok(scored.into_iter().take(25).map(|(_, v)| v).collect())
}

/// Levenshtein distance, abandoning early once every path exceeds `max`.
/// Returns `None` when the distance is above the bound.
fn bounded_levenshtein(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return None;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        let mut row_min = current[0];
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
            row_min = row_min.min(current[j + 1]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut previous, &mut current);
    }

    let distance = previous[b.len()];
    (distance <= max).then_some(distance)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::embeddings::{encode_embedding, HashEmbeddingProvider};

    fn seed_items(state: &DbState) {
        let conn = state.conn.lock().unwrap();
        conn.execute_batch(
            "INSERT INTO companies (company_full_name) VALUES ('Testco');
             INSERT INTO branches (company_id, branch_name) VALUES (1, '{}');
             INSERT INTO pos_devices (branch_id, pos_device_name) VALUES (1, '{}');
             INSERT INTO categories (pos_device_id, category_names, category_type)
                 VALUES (1, '{\"en\":\"Drinks\"}', 'drink');",
        )
        .unwrap();
        for (name, price) in [("Espresso", "2.20"), ("Cappuccino", "3.40"), ("Matcha Latte", "4.10")]
        {
            conn.execute(
                "INSERT INTO items (pos_device_id, associated_category_unique_identifier,
                    display_names, item_price_value)
                 VALUES (1, 1, ?1, ?2)",
                params![format!("{{\"en\":\"{name}\"}}"), price],
            )
            .unwrap();
            let item_id = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO items_fts (item_id, name, category_name) VALUES (?1, ?2, 'Drinks')",
                params![item_id, name],
            )
            .unwrap();

            let vector = HashEmbeddingProvider.embed(name).unwrap();
            conn.execute(
                "INSERT INTO item_embeddings (item_id, embedding, semantic_hash)
                 VALUES (?1, ?2, 'h')",
                params![item_id, encode_embedding(&vector)],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_fts_stage_wins_on_exact_name() {
        let state = db::test_db();
        seed_items(&state);
        let result = search_products(
            &state,
            &HashEmbeddingProvider,
            "Espresso",
            &SearchOptions::default(),
        )
        .unwrap();
        assert_eq!(result["metadata"]["searchMethod"], "fts");
        assert_eq!(result["results"][0]["productName"], "Espresso");
    }

    #[test]
    fn test_vector_stage_matches_identical_embedding() {
        let state = db::test_db();
        seed_items(&state);
        // fts_only off, but the FTS index has no "Cappuccino " typo entry;
        // the hash provider embeds the exact name identically.
        let result = search_products(
            &state,
            &HashEmbeddingProvider,
            "Cappuccino",
            &SearchOptions {
                vector_only: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(result["metadata"]["searchMethod"], "vector");
        assert_eq!(result["results"][0]["productName"], "Cappuccino");
    }

    #[test]
    fn test_fuzzy_stage_catches_typo() {
        let state = db::test_db();
        seed_items(&state);
        let result = search_products(
            &state,
            &HashEmbeddingProvider,
            "Espresso",
            &SearchOptions::default(),
        )
        .unwrap();
        assert_eq!(result["metadata"]["searchMethod"], "fts");

        let typo = search_products(
            &state,
            &HashEmbeddingProvider,
            "Esprezso",
            &SearchOptions::default(),
        )
        .unwrap();
        assert_eq!(typo["metadata"]["searchMethod"], "fuzzy");
        assert_eq!(typo["results"][0]["productName"], "Espresso");
        assert_eq!(typo["results"][0]["levenshteinDistance"], 1);
    }

    #[test]
    fn test_short_query_skips_fuzzy() {
        let state = db::test_db();
        seed_items(&state);
        let result = search_products(
            &state,
            &HashEmbeddingProvider,
            "Es",
            &SearchOptions {
                fts_only: false,
                vector_only: false,
                levenshtein_threshold: Some(5),
                vector_distance_threshold: Some(0.0),
            },
        )
        .unwrap();
        // Too short for fuzzy, no fts/vector hit: none
        assert_eq!(result["metadata"]["searchMethod"], "none");
    }

    #[test]
    fn test_fts_only_never_falls_through() {
        let state = db::test_db();
        seed_items(&state);
        let result = search_products(
            &state,
            &HashEmbeddingProvider,
            "Esprezso",
            &SearchOptions {
                fts_only: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(result["metadata"]["searchMethod"], "none");
    }

    #[test]
    fn test_bounded_levenshtein() {
        assert_eq!(bounded_levenshtein("kaffee", "kaffee", 2), Some(0));
        assert_eq!(bounded_levenshtein("kafee", "kaffee", 2), Some(1));
        assert_eq!(bounded_levenshtein("katze", "kaffee", 2), None);
        assert_eq!(bounded_levenshtein("a", "abcdef", 2), None);
    }

    #[test]
    fn test_fts_query_syntax_is_escaped() {
        let state = db::test_db();
        seed_items(&state);
        // Raw FTS operators must not panic or leak syntax errors
        let result = search_products(
            &state,
            &HashEmbeddingProvider,
            "\"espresso OR",
            &SearchOptions {
                fts_only: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(result["metadata"]["searchMethod"].is_string());
    }
}
