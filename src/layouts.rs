//! Catalog layout snapshots.
//!
//! A layout is a named snapshot of the catalog arrangement. Saving never
//! activates; activation flips every other row off inside one envelope so
//! at most one snapshot is active at any moment.

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;

use crate::db::{with_envelope, DbState};
use crate::error::{PosError, PosResult};
use crate::models::{now_utc, parse_json_column, Layout};

fn map_layout(row: &rusqlite::Row) -> rusqlite::Result<Layout> {
    let snapshot_raw: Option<String> = row.get("categories_snapshot")?;
    Ok(Layout {
        id: row.get("id")?,
        layout_name: row.get("layout_name")?,
        categories_snapshot: parse_json_column(snapshot_raw, "layouts.categories_snapshot"),
        source_type: row.get("source_type")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        created_at: row.get("created_at")?,
    })
}

/// Save a new snapshot. It starts inactive.
pub fn save_layout(
    db: &DbState,
    name: &str,
    categories_snapshot: &Value,
    source_type: &str,
) -> PosResult<Layout> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PosError::Validation("layout name required".into()));
    }

    let conn = db.conn.lock()?;
    let now = now_utc();
    conn.execute(
        "INSERT INTO layouts (layout_name, categories_snapshot, source_type, is_active, created_at)
         VALUES (?1, ?2, ?3, 0, ?4)",
        params![name, categories_snapshot.to_string(), source_type, now],
    )?;
    let id = conn.last_insert_rowid();
    info!(layout_id = id, name, "Layout snapshot saved");
    get_layout(&conn, id)
}

/// Activate one snapshot, deactivating every other.
pub fn activate_layout(db: &DbState, id: i64) -> PosResult<Layout> {
    let conn = db.conn.lock()?;
    with_envelope(&conn, |c| {
        // Existence check inside the envelope so a concurrent delete
        // cannot produce a world without any active layout.
        let exists: i64 = c.query_row(
            "SELECT COUNT(*) FROM layouts WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(PosError::NotFound(format!("layout {id}")));
        }
        c.execute("UPDATE layouts SET is_active = 0 WHERE is_active = 1", [])?;
        c.execute("UPDATE layouts SET is_active = 1 WHERE id = ?1", params![id])?;
        Ok(())
    })?;
    info!(layout_id = id, "Layout activated");
    get_layout(&conn, id)
}

/// The active snapshot; falls back to the most recent when none is active.
pub fn get_active_layout(db: &DbState) -> PosResult<Option<Layout>> {
    let conn = db.conn.lock()?;
    let active = conn
        .query_row(
            "SELECT * FROM layouts WHERE is_active = 1 ORDER BY id DESC LIMIT 1",
            [],
            map_layout,
        )
        .map(Some);
    match active {
        Ok(layout) => Ok(layout),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            match conn.query_row(
                "SELECT * FROM layouts ORDER BY id DESC LIMIT 1",
                [],
                map_layout,
            ) {
                Ok(layout) => Ok(Some(layout)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// All snapshots, newest first.
pub fn list_layouts(db: &DbState) -> PosResult<Vec<Layout>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare("SELECT * FROM layouts ORDER BY id DESC")?;
    let rows = stmt.query_map([], map_layout)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn get_layout(conn: &Connection, id: i64) -> PosResult<Layout> {
    conn.query_row("SELECT * FROM layouts WHERE id = ?1", params![id], map_layout)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => PosError::NotFound(format!("layout {id}")),
            other => other.into(),
        })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    #[test]
    fn test_save_starts_inactive() {
        let state = db::test_db();
        let layout = save_layout(&state, "Sommer", &json!([{"id": 1}]), "manual").unwrap();
        assert!(!layout.is_active);
        assert_eq!(layout.layout_name, "Sommer");
    }

    #[test]
    fn test_activation_is_exclusive() {
        let state = db::test_db();
        let a = save_layout(&state, "A", &json!([]), "manual").unwrap();
        let b = save_layout(&state, "B", &json!([]), "import").unwrap();

        activate_layout(&state, a.id).unwrap();
        let b_active = activate_layout(&state, b.id).unwrap();
        assert!(b_active.is_active);

        let active_count: i64 = {
            let conn = state.conn.lock().unwrap();
            conn.query_row(
                "SELECT COUNT(*) FROM layouts WHERE is_active = 1",
                [],
                |r| r.get(0),
            )
            .unwrap()
        };
        assert_eq!(active_count, 1);
        assert_eq!(get_active_layout(&state).unwrap().unwrap().id, b.id);
    }

    #[test]
    fn test_active_falls_back_to_most_recent() {
        let state = db::test_db();
        assert!(get_active_layout(&state).unwrap().is_none());

        save_layout(&state, "A", &json!([]), "manual").unwrap();
        let b = save_layout(&state, "B", &json!([]), "manual").unwrap();
        let fallback = get_active_layout(&state).unwrap().unwrap();
        assert_eq!(fallback.id, b.id);
    }

    #[test]
    fn test_activate_missing_layout() {
        let state = db::test_db();
        assert!(matches!(
            activate_layout(&state, 42),
            Err(PosError::NotFound(_))
        ));
    }
}
