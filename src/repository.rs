//! Typed queries over persistent entities.
//!
//! Every function takes a `&Connection` so callers holding a write envelope
//! run their reads and writes on the same handle; callers outside an
//! envelope pass the pooled connection directly. JSON columns are
//! normalized on the way out (see `models`), decimals travel as TEXT.

use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::{PosError, PosResult};
use crate::models::{
    json_to_column, parse_decimal_column, parse_json_column, resolve_display_name,
    ActiveTransaction, Category, Item, PendingChange, ResolutionStatus, Role, StornoEntry,
    TransactionItem, TransactionStatus, User,
};

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn map_transaction(row: &Row) -> rusqlite::Result<ActiveTransaction> {
    let status_raw: String = row.get("status")?;
    let resolution_raw: String = row.get("resolution_status")?;
    let total_raw: String = row.get("total_amount")?;
    let tax_raw: String = row.get("tax_amount")?;
    let payment_raw: Option<String> = row.get("payment_amount")?;
    let metadata_raw: Option<String> = row.get("metadata")?;

    Ok(ActiveTransaction {
        id: row.get("id")?,
        uuid: row.get("uuid")?,
        status: TransactionStatus::parse(&status_raw).unwrap_or(TransactionStatus::Active),
        resolution_status: ResolutionStatus::parse(&resolution_raw)
            .unwrap_or(ResolutionStatus::None),
        user_id: row.get("user_id")?,
        business_date: row.get("business_date")?,
        total_amount: parse_decimal_column(&total_raw, "active_transactions.total_amount"),
        tax_amount: parse_decimal_column(&tax_raw, "active_transactions.tax_amount"),
        payment_type: row.get("payment_type")?,
        payment_amount: payment_raw
            .map(|p| parse_decimal_column(&p, "active_transactions.payment_amount")),
        metadata: parse_json_column(metadata_raw, "active_transactions.metadata"),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn map_item_line(row: &Row) -> rusqlite::Result<TransactionItem> {
    let quantity: String = row.get("quantity")?;
    let unit_price: String = row.get("unit_price")?;
    let total_price: String = row.get("total_price")?;
    let tax_rate: String = row.get("tax_rate")?;
    let tax_amount: String = row.get("tax_amount")?;

    Ok(TransactionItem {
        id: row.get("id")?,
        active_transaction_id: row.get("active_transaction_id")?,
        item_id: row.get("item_id")?,
        quantity: parse_decimal_column(&quantity, "item.quantity"),
        unit_price: parse_decimal_column(&unit_price, "item.unit_price"),
        total_price: parse_decimal_column(&total_price, "item.total_price"),
        tax_rate: parse_decimal_column(&tax_rate, "item.tax_rate"),
        tax_amount: parse_decimal_column(&tax_amount, "item.tax_amount"),
        parent_transaction_item_id: row.get("parent_transaction_item_id")?,
        notes: row.get("notes")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        display_name: None,
    })
}

fn map_user(row: &Row) -> rusqlite::Result<User> {
    let daily: String = row.get("storno_daily_limit")?;
    let emergency: String = row.get("storno_emergency_limit")?;
    let used: String = row.get("storno_used_today")?;
    let trust: String = row.get("trust_score")?;
    Ok(User {
        id: row.get("id")?,
        username: row.get("username")?,
        full_name: row.get("full_name")?,
        password_hash: row.get("password_hash")?,
        role_id: row.get("role_id")?,
        storno_daily_limit: parse_decimal_column(&daily, "users.storno_daily_limit"),
        storno_emergency_limit: parse_decimal_column(&emergency, "users.storno_emergency_limit"),
        storno_used_today: parse_decimal_column(&used, "users.storno_used_today"),
        trust_score: parse_decimal_column(&trust, "users.trust_score"),
        is_active: row.get::<_, i64>("is_active")? != 0,
        force_password_change: row.get::<_, i64>("force_password_change")? != 0,
    })
}

fn map_storno(row: &Row) -> rusqlite::Result<StornoEntry> {
    let amount: String = row.get("amount")?;
    let credit_used: String = row.get("credit_used")?;
    Ok(StornoEntry {
        id: row.get("id")?,
        transaction_uuid: row.get("transaction_uuid")?,
        user_id: row.get("user_id")?,
        amount: parse_decimal_column(&amount, "storno_log.amount"),
        reason: row.get("reason")?,
        is_emergency: row.get::<_, i64>("is_emergency")? != 0,
        approval_status: row.get("approval_status")?,
        credit_used: parse_decimal_column(&credit_used, "storno_log.credit_used"),
        approved_by: row.get("approved_by")?,
        approver_notes: row.get("approver_notes")?,
        created_at: row.get("created_at")?,
    })
}

fn map_change(row: &Row) -> rusqlite::Result<PendingChange> {
    let payload: Option<String> = row.get("proposed_payload")?;
    Ok(PendingChange {
        id: row.get("id")?,
        change_type: row.get("change_type")?,
        target_entity: row.get("target_entity")?,
        target_id: row.get("target_id")?,
        proposed_payload: parse_json_column(payload, "pending_changes.proposed_payload"),
        priority: row.get("priority")?,
        status: row.get("status")?,
        requested_by: row.get("requested_by")?,
        reviewed_by: row.get("reviewed_by")?,
        review_notes: row.get("review_notes")?,
        created_at: row.get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Active transactions
// ---------------------------------------------------------------------------

pub fn insert_transaction(
    conn: &Connection,
    uuid: &str,
    user_id: Option<i64>,
    business_date: &str,
    metadata: &Value,
    now: &str,
) -> PosResult<i64> {
    conn.execute(
        "INSERT INTO active_transactions
            (uuid, status, resolution_status, user_id, business_date,
             total_amount, tax_amount, metadata, created_at, updated_at)
         VALUES (?1, 'active', 'none', ?2, ?3, '0', '0', ?4, ?5, ?5)",
        params![uuid, user_id, business_date, json_to_column(metadata), now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_transaction(conn: &Connection, id: i64) -> PosResult<ActiveTransaction> {
    conn.query_row(
        "SELECT * FROM active_transactions WHERE id = ?1",
        params![id],
        map_transaction,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            PosError::NotFound(format!("transaction {id}"))
        }
        other => other.into(),
    })
}

pub fn get_transaction_by_uuid(conn: &Connection, uuid: &str) -> PosResult<ActiveTransaction> {
    conn.query_row(
        "SELECT * FROM active_transactions WHERE uuid = ?1",
        params![uuid],
        map_transaction,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            PosError::NotFound(format!("transaction {uuid}"))
        }
        other => other.into(),
    })
}

/// Hard-delete a transaction row. Used only to undo a create whose
/// `startTransaction` fiscal event failed; finished rows are never deleted.
pub fn delete_transaction(conn: &Connection, id: i64) -> PosResult<()> {
    conn.execute(
        "DELETE FROM active_transaction_items WHERE active_transaction_id = ?1",
        params![id],
    )?;
    conn.execute("DELETE FROM active_transactions WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn update_transaction_status(
    conn: &Connection,
    id: i64,
    status: TransactionStatus,
    touch_timestamp: bool,
    now: &str,
) -> PosResult<()> {
    if touch_timestamp {
        conn.execute(
            "UPDATE active_transactions SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )?;
    } else {
        conn.execute(
            "UPDATE active_transactions SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
    }
    Ok(())
}

pub fn update_transaction_totals(
    conn: &Connection,
    id: i64,
    total: Decimal,
    tax: Decimal,
    now: &str,
) -> PosResult<()> {
    conn.execute(
        "UPDATE active_transactions SET total_amount = ?1, tax_amount = ?2, updated_at = ?3
         WHERE id = ?4",
        params![total.to_string(), tax.to_string(), now, id],
    )?;
    Ok(())
}

pub fn update_transaction_metadata(
    conn: &Connection,
    id: i64,
    metadata: &Value,
    touch_timestamp: bool,
    now: &str,
) -> PosResult<()> {
    if touch_timestamp {
        conn.execute(
            "UPDATE active_transactions SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![json_to_column(metadata), now, id],
        )?;
    } else {
        conn.execute(
            "UPDATE active_transactions SET metadata = ?1 WHERE id = ?2",
            params![json_to_column(metadata), id],
        )?;
    }
    Ok(())
}

pub fn finalize_transaction(
    conn: &Connection,
    id: i64,
    payment_type: &str,
    payment_amount: Decimal,
    total: Decimal,
    tax: Decimal,
    now: &str,
) -> PosResult<()> {
    conn.execute(
        "UPDATE active_transactions SET
            status = 'finished',
            payment_type = ?1,
            payment_amount = ?2,
            total_amount = ?3,
            tax_amount = ?4,
            updated_at = ?5
         WHERE id = ?6",
        params![
            payment_type,
            payment_amount.to_string(),
            total.to_string(),
            tax.to_string(),
            now,
            id
        ],
    )?;
    Ok(())
}

pub fn set_resolution_status(
    conn: &Connection,
    id: i64,
    resolution: ResolutionStatus,
    now: &str,
) -> PosResult<()> {
    conn.execute(
        "UPDATE active_transactions SET resolution_status = ?1, updated_at = ?2 WHERE id = ?3",
        params![resolution.as_str(), now, id],
    )?;
    Ok(())
}

/// Parked receipts, oldest `updated_at` first to preserve arrival order.
pub fn parked_transactions(conn: &Connection) -> PosResult<Vec<ActiveTransaction>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM active_transactions WHERE status = 'parked' ORDER BY updated_at, id",
    )?;
    let rows = stmt.query_map([], map_transaction)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Receipts flagged for manual resolution after a restart.
pub fn pending_resolution_transactions(conn: &Connection) -> PosResult<Vec<ActiveTransaction>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM active_transactions WHERE resolution_status = 'pending' ORDER BY id",
    )?;
    let rows = stmt.query_map([], map_transaction)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn recent_finished_transactions(
    conn: &Connection,
    limit: i64,
) -> PosResult<Vec<ActiveTransaction>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM active_transactions WHERE status = 'finished'
         ORDER BY updated_at DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], map_transaction)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// True iff a parked transaction other than `exclude` holds this table.
pub fn is_table_in_use(
    conn: &Connection,
    table: &str,
    exclude_transaction_id: Option<i64>,
) -> PosResult<bool> {
    let mut stmt = conn.prepare(
        "SELECT id, metadata FROM active_transactions WHERE status = 'parked'",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
    })?;

    for row in rows {
        let (id, metadata_raw) = row?;
        if exclude_transaction_id == Some(id) {
            continue;
        }
        let metadata = parse_json_column(metadata_raw, "active_transactions.metadata");
        if metadata.get("table").and_then(Value::as_str) == Some(table) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `(tax_rate, sum(total_price))` pairs grouped by exact rate value.
pub fn tax_breakdown(conn: &Connection, transaction_id: i64) -> PosResult<Vec<(Decimal, Decimal)>> {
    let mut stmt = conn.prepare(
        "SELECT tax_rate, total_price FROM active_transaction_items
         WHERE active_transaction_id = ?1",
    )?;
    let rows = stmt.query_map(params![transaction_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    // Group in Rust so the grouping key is the decimal value, not the
    // stored string (e.g. "19.0" and "19.00" land in one bucket).
    let mut buckets: Vec<(Decimal, Decimal)> = Vec::new();
    for row in rows {
        let (rate_raw, total_raw) = row?;
        let rate = parse_decimal_column(&rate_raw, "item.tax_rate");
        let total = parse_decimal_column(&total_raw, "item.total_price");
        match buckets.iter_mut().find(|(r, _)| *r == rate) {
            Some((_, sum)) => *sum += total,
            None => buckets.push((rate, total)),
        }
    }
    Ok(buckets)
}

// ---------------------------------------------------------------------------
// Transaction items
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn insert_item_line(
    conn: &Connection,
    transaction_id: i64,
    item_id: i64,
    quantity: Decimal,
    unit_price: Decimal,
    total_price: Decimal,
    tax_rate: Decimal,
    tax_amount: Decimal,
    parent_transaction_item_id: Option<i64>,
    notes: Option<&str>,
    now: &str,
) -> PosResult<i64> {
    conn.execute(
        "INSERT INTO active_transaction_items
            (active_transaction_id, item_id, quantity, unit_price, total_price,
             tax_rate, tax_amount, parent_transaction_item_id, notes,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            transaction_id,
            item_id,
            quantity.to_string(),
            unit_price.to_string(),
            total_price.to_string(),
            tax_rate.to_string(),
            tax_amount.to_string(),
            parent_transaction_item_id,
            notes,
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_item_line(conn: &Connection, id: i64) -> PosResult<TransactionItem> {
    conn.query_row(
        "SELECT * FROM active_transaction_items WHERE id = ?1",
        params![id],
        map_item_line,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => PosError::NotFound(format!("item line {id}")),
        other => other.into(),
    })
}

pub fn update_item_line_amounts(
    conn: &Connection,
    id: i64,
    quantity: Decimal,
    unit_price: Decimal,
    total_price: Decimal,
    tax_amount: Decimal,
    now: &str,
) -> PosResult<()> {
    conn.execute(
        "UPDATE active_transaction_items SET
            quantity = ?1, unit_price = ?2, total_price = ?3, tax_amount = ?4,
            updated_at = ?5
         WHERE id = ?6",
        params![
            quantity.to_string(),
            unit_price.to_string(),
            total_price.to_string(),
            tax_amount.to_string(),
            now,
            id
        ],
    )?;
    Ok(())
}

/// All lines of a transaction in insertion order.
pub fn items_for_transaction(
    conn: &Connection,
    transaction_id: i64,
) -> PosResult<Vec<TransactionItem>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM active_transaction_items WHERE active_transaction_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![transaction_id], map_item_line)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Lines with display names resolved from the catalog.
pub fn items_with_names_for_transaction(
    conn: &Connection,
    transaction_id: i64,
) -> PosResult<Vec<TransactionItem>> {
    let mut lines = items_for_transaction(conn, transaction_id)?;
    for line in &mut lines {
        if let Ok(item) = get_item(conn, line.item_id) {
            line.display_name = Some(resolve_display_name(&item.display_names));
        }
    }
    Ok(lines)
}

/// Signed sums `(total, tax)` over all lines of a transaction.
pub fn sum_item_lines(conn: &Connection, transaction_id: i64) -> PosResult<(Decimal, Decimal)> {
    let lines = items_for_transaction(conn, transaction_id)?;
    let total = lines.iter().map(|l| l.total_price).sum();
    let tax = lines.iter().map(|l| l.tax_amount).sum();
    Ok((total, tax))
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

pub fn get_item(conn: &Connection, id: i64) -> PosResult<Item> {
    conn.query_row("SELECT * FROM items WHERE id = ?1", params![id], |row| {
        let names: Option<String> = row.get("display_names")?;
        let price: String = row.get("item_price_value")?;
        let flags: Option<String> = row.get("item_flags")?;
        Ok(Item {
            id: row.get("id")?,
            pos_device_id: row.get("pos_device_id")?,
            category_id: row.get("associated_category_unique_identifier")?,
            display_names: parse_json_column(names, "items.display_names"),
            price: parse_decimal_column(&price, "items.item_price_value"),
            item_flags: parse_json_column(flags, "items.item_flags"),
        })
    })
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => PosError::NotFound(format!("item {id}")),
        other => other.into(),
    })
}

pub fn get_category(conn: &Connection, id: i64) -> PosResult<Category> {
    conn.query_row(
        "SELECT * FROM categories WHERE id = ?1",
        params![id],
        |row| {
            let names: Option<String> = row.get("category_names")?;
            Ok(Category {
                id: row.get("id")?,
                pos_device_id: row.get("pos_device_id")?,
                category_names: parse_json_column(names, "categories.category_names"),
                category_type: row.get("category_type")?,
            })
        },
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => PosError::NotFound(format!("category {id}")),
        other => other.into(),
    })
}

pub fn all_categories(conn: &Connection) -> PosResult<Vec<Category>> {
    let mut stmt = conn.prepare("SELECT * FROM categories ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        let names: Option<String> = row.get("category_names")?;
        Ok(Category {
            id: row.get("id")?,
            pos_device_id: row.get("pos_device_id")?,
            category_names: parse_json_column(names, "categories.category_names"),
            category_type: row.get("category_type")?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn items_by_category(conn: &Connection, category_id: i64) -> PosResult<Vec<Item>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM items WHERE associated_category_unique_identifier = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![category_id], |row| {
        let names: Option<String> = row.get("display_names")?;
        let price: String = row.get("item_price_value")?;
        let flags: Option<String> = row.get("item_flags")?;
        Ok(Item {
            id: row.get("id")?,
            pos_device_id: row.get("pos_device_id")?,
            category_id: row.get("associated_category_unique_identifier")?,
            display_names: parse_json_column(names, "items.display_names"),
            price: parse_decimal_column(&price, "items.item_price_value"),
            item_flags: parse_json_column(flags, "items.item_flags"),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Users and roles
// ---------------------------------------------------------------------------

pub fn get_user(conn: &Connection, id: i64) -> PosResult<User> {
    conn.query_row("SELECT * FROM users WHERE id = ?1", params![id], map_user)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => PosError::NotFound(format!("user {id}")),
            other => other.into(),
        })
}

pub fn get_user_by_username(conn: &Connection, username: &str) -> PosResult<User> {
    conn.query_row(
        "SELECT * FROM users WHERE username = ?1",
        params![username],
        map_user,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            PosError::NotFound(format!("user {username}"))
        }
        other => other.into(),
    })
}

pub fn active_users(conn: &Connection) -> PosResult<Vec<User>> {
    let mut stmt = conn.prepare("SELECT * FROM users WHERE is_active = 1 ORDER BY username")?;
    let rows = stmt.query_map([], map_user)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn get_role(conn: &Connection, id: i64) -> PosResult<Role> {
    conn.query_row("SELECT * FROM roles WHERE id = ?1", params![id], |row| {
        let permissions_raw: Option<String> = row.get("permissions")?;
        let permissions = parse_json_column(permissions_raw, "roles.permissions");
        Ok(Role {
            id: row.get("id")?,
            role_name: row.get("role_name")?,
            permissions: permissions
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            can_approve_changes: row.get::<_, i64>("can_approve_changes")? != 0,
            can_manage_users: row.get::<_, i64>("can_manage_users")? != 0,
        })
    })
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => PosError::NotFound(format!("role {id}")),
        other => other.into(),
    })
}

pub fn update_storno_used(
    conn: &Connection,
    user_id: i64,
    used_today: Decimal,
    now: &str,
) -> PosResult<()> {
    conn.execute(
        "UPDATE users SET storno_used_today = ?1, updated_at = ?2 WHERE id = ?3",
        params![used_today.to_string(), now, user_id],
    )?;
    Ok(())
}

pub fn update_trust(conn: &Connection, user_id: i64, trust_score: Decimal, now: &str) -> PosResult<()> {
    conn.execute(
        "UPDATE users SET trust_score = ?1, updated_at = ?2 WHERE id = ?3",
        params![trust_score.to_string(), now, user_id],
    )?;
    Ok(())
}

pub fn update_trust_and_limits(
    conn: &Connection,
    user_id: i64,
    trust_score: Decimal,
    daily_limit: Decimal,
    emergency_limit: Decimal,
    now: &str,
) -> PosResult<()> {
    conn.execute(
        "UPDATE users SET trust_score = ?1, storno_daily_limit = ?2,
            storno_emergency_limit = ?3, updated_at = ?4
         WHERE id = ?5",
        params![
            trust_score.to_string(),
            daily_limit.to_string(),
            emergency_limit.to_string(),
            now,
            user_id
        ],
    )?;
    Ok(())
}

/// Zero every user's consumed storno credit (daily reset).
pub fn reset_all_storno_used(conn: &Connection, now: &str) -> PosResult<usize> {
    let changed = conn.execute(
        "UPDATE users SET storno_used_today = '0', updated_at = ?1
         WHERE storno_used_today != '0'",
        params![now],
    )?;
    Ok(changed)
}

// ---------------------------------------------------------------------------
// Storno log
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn insert_storno(
    conn: &Connection,
    transaction_uuid: Option<&str>,
    user_id: i64,
    amount: Decimal,
    reason: &str,
    is_emergency: bool,
    approval_status: &str,
    credit_used: Decimal,
    now: &str,
) -> PosResult<i64> {
    conn.execute(
        "INSERT INTO storno_log
            (transaction_uuid, user_id, amount, reason, is_emergency,
             approval_status, credit_used, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            transaction_uuid,
            user_id,
            amount.to_string(),
            reason,
            is_emergency as i64,
            approval_status,
            credit_used.to_string(),
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_storno(conn: &Connection, id: i64) -> PosResult<StornoEntry> {
    conn.query_row(
        "SELECT * FROM storno_log WHERE id = ?1",
        params![id],
        map_storno,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => PosError::NotFound(format!("storno {id}")),
        other => other.into(),
    })
}

pub fn resolve_storno(
    conn: &Connection,
    id: i64,
    approval_status: &str,
    credit_used: Decimal,
    approved_by: i64,
    notes: Option<&str>,
    now: &str,
) -> PosResult<()> {
    conn.execute(
        "UPDATE storno_log SET
            approval_status = ?1, credit_used = ?2, approved_by = ?3,
            approver_notes = ?4, updated_at = ?5
         WHERE id = ?6",
        params![
            approval_status,
            credit_used.to_string(),
            approved_by,
            notes,
            now,
            id
        ],
    )?;
    Ok(())
}

pub fn pending_stornos(conn: &Connection) -> PosResult<Vec<StornoEntry>> {
    let mut stmt = conn
        .prepare("SELECT * FROM storno_log WHERE approval_status = 'pending' ORDER BY id")?;
    let rows = stmt.query_map([], map_storno)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Pending changes
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn insert_pending_change(
    conn: &Connection,
    change_type: &str,
    target_entity: &str,
    target_id: Option<i64>,
    proposed_payload: &Value,
    priority: &str,
    requested_by: Option<i64>,
    now: &str,
) -> PosResult<i64> {
    conn.execute(
        "INSERT INTO pending_changes
            (change_type, target_entity, target_id, proposed_payload, priority,
             status, requested_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?7)",
        params![
            change_type,
            target_entity,
            target_id,
            proposed_payload.to_string(),
            priority,
            requested_by,
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_pending_change(conn: &Connection, id: i64) -> PosResult<PendingChange> {
    conn.query_row(
        "SELECT * FROM pending_changes WHERE id = ?1",
        params![id],
        map_change,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            PosError::NotFound(format!("pending change {id}"))
        }
        other => other.into(),
    })
}

pub fn review_pending_change(
    conn: &Connection,
    id: i64,
    status: &str,
    reviewed_by: i64,
    notes: Option<&str>,
    now: &str,
) -> PosResult<()> {
    conn.execute(
        "UPDATE pending_changes SET
            status = ?1, reviewed_by = ?2, review_notes = ?3, updated_at = ?4
         WHERE id = ?5",
        params![status, reviewed_by, notes, now, id],
    )?;
    Ok(())
}

pub fn pending_changes(conn: &Connection) -> PosResult<Vec<PendingChange>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM pending_changes WHERE status = 'pending'
         ORDER BY CASE priority
             WHEN 'urgent' THEN 0
             WHEN 'high' THEN 1
             ELSE 2
         END, id",
    )?;
    let rows = stmt.query_map([], map_change)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Storno rows referenced by a pending change, matched on target id.
pub fn change_for_storno(conn: &Connection, storno_id: i64) -> PosResult<Option<PendingChange>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM pending_changes
         WHERE target_entity = 'storno_log' AND target_id = ?1 AND status = 'pending'
         LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![storno_id], map_change)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn seed_catalog(conn: &Connection) -> (i64, i64) {
        conn.execute(
            "INSERT INTO companies (company_full_name) VALUES ('Testco')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO branches (company_id, branch_name) VALUES (1, '{\"de\":\"Mitte\"}')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO pos_devices (branch_id, pos_device_name) VALUES (1, '{}')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO categories (pos_device_id, category_names, category_type)
             VALUES (1, '{\"de\":\"Getränke\"}', 'drink')",
            [],
        )
        .unwrap();
        let category_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO items (pos_device_id, associated_category_unique_identifier,
                display_names, item_price_value)
             VALUES (1, ?1, '{\"de\":\"Kaffee\",\"en\":\"Coffee\"}', '3.00')",
            params![category_id],
        )
        .unwrap();
        (category_id, conn.last_insert_rowid())
    }

    #[test]
    fn test_transaction_roundtrip() {
        let state = db::test_db();
        let conn = state.conn.lock().unwrap();
        let id = insert_transaction(
            &conn,
            "uuid-1",
            Some(7),
            "2026-08-01",
            &json!({"table": "5"}),
            "2026-08-01T10:00:00Z",
        )
        .unwrap();

        let tx = get_transaction(&conn, id).unwrap();
        assert_eq!(tx.uuid, "uuid-1");
        assert_eq!(tx.status, TransactionStatus::Active);
        assert_eq!(tx.metadata["table"], "5");
        assert_eq!(tx.total_amount, Decimal::ZERO);

        let by_uuid = get_transaction_by_uuid(&conn, "uuid-1").unwrap();
        assert_eq!(by_uuid.id, id);

        assert!(matches!(
            get_transaction(&conn, 999),
            Err(PosError::NotFound(_))
        ));
    }

    #[test]
    fn test_table_in_use_excludes_given_transaction() {
        let state = db::test_db();
        let conn = state.conn.lock().unwrap();
        let id = insert_transaction(
            &conn,
            "uuid-t",
            None,
            "2026-08-01",
            &json!({"table": "5"}),
            "2026-08-01T10:00:00Z",
        )
        .unwrap();
        update_transaction_status(
            &conn,
            id,
            TransactionStatus::Parked,
            true,
            "2026-08-01T10:01:00Z",
        )
        .unwrap();

        assert!(is_table_in_use(&conn, "5", None).unwrap());
        assert!(!is_table_in_use(&conn, "5", Some(id)).unwrap());
        assert!(!is_table_in_use(&conn, "9", None).unwrap());
    }

    #[test]
    fn test_tax_breakdown_groups_by_value() {
        let state = db::test_db();
        let conn = state.conn.lock().unwrap();
        let id = insert_transaction(
            &conn,
            "uuid-b",
            None,
            "2026-08-01",
            &json!({}),
            "2026-08-01T10:00:00Z",
        )
        .unwrap();

        // Same rate stored with different textual precision
        for (rate, total) in [("19.00", "6.00"), ("19.0", "5.00"), ("7.00", "3.20")] {
            conn.execute(
                "INSERT INTO active_transaction_items
                    (active_transaction_id, item_id, quantity, unit_price, total_price,
                     tax_rate, tax_amount, created_at, updated_at)
                 VALUES (?1, 1, '1', ?2, ?2, ?3, '0', datetime('now'), datetime('now'))",
                params![id, total, rate],
            )
            .unwrap();
        }

        let breakdown = tax_breakdown(&conn, id).unwrap();
        assert_eq!(breakdown.len(), 2);
        let nineteen = breakdown
            .iter()
            .find(|(r, _)| *r == dec!(19.00))
            .unwrap();
        assert_eq!(nineteen.1, dec!(11.00));
    }

    #[test]
    fn test_item_line_sums() {
        let state = db::test_db();
        let conn = state.conn.lock().unwrap();
        seed_catalog(&conn);
        let tx = insert_transaction(
            &conn,
            "uuid-s",
            None,
            "2026-08-01",
            &json!({}),
            "2026-08-01T10:00:00Z",
        )
        .unwrap();

        insert_item_line(
            &conn,
            tx,
            1,
            dec!(3),
            dec!(3.00),
            dec!(9.00),
            dec!(19.00),
            dec!(1.436975),
            None,
            None,
            "2026-08-01T10:00:01Z",
        )
        .unwrap();
        insert_item_line(
            &conn,
            tx,
            1,
            dec!(-2),
            dec!(3.00),
            dec!(-6.00),
            dec!(19.00),
            dec!(-0.957983),
            Some(1),
            Some("STORNO"),
            "2026-08-01T10:00:02Z",
        )
        .unwrap();

        let (total, tax) = sum_item_lines(&conn, tx).unwrap();
        assert_eq!(total, dec!(3.00));
        assert_eq!(tax, dec!(0.478992));
    }

    #[test]
    fn test_catalog_lookup_and_names() {
        let state = db::test_db();
        let conn = state.conn.lock().unwrap();
        let (category_id, item_id) = seed_catalog(&conn);

        let item = get_item(&conn, item_id).unwrap();
        assert_eq!(item.price, dec!(3.00));
        assert_eq!(item.category_id, category_id);

        let category = get_category(&conn, category_id).unwrap();
        assert_eq!(category.category_type, "drink");

        let items = items_by_category(&conn, category_id).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(resolve_display_name(&items[0].display_names), "Kaffee");
    }

    #[test]
    fn test_pending_changes_priority_order() {
        let state = db::test_db();
        let conn = state.conn.lock().unwrap();
        let now = "2026-08-01T10:00:00Z";
        insert_pending_change(&conn, "storno", "storno_log", Some(1), &json!({}), "high", None, now)
            .unwrap();
        insert_pending_change(
            &conn,
            "storno",
            "storno_log",
            Some(2),
            &json!({}),
            "urgent",
            None,
            now,
        )
        .unwrap();

        let changes = pending_changes(&conn).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].priority, "urgent");
    }
}
