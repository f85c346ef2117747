//! Transaction engine: the receipt lifecycle state machine.
//!
//! Holds the state transitions `active → parked → active`,
//! `active → finished`, `active → cancelled`, the live item mutations, and
//! the finish-time fiscal reconstruction that turns in-place edits back into
//! append-only compliance lines.
//!
//! **Rules:**
//! - every mutation runs inside a serializable write envelope and retries
//!   once on conflict
//! - fiscal events are emitted after the envelope commits; a fiscal failure
//!   after commit is a warning (divergence), never a rollback
//! - the only pre-commit fiscal emit is `startTransaction`; if it fails the
//!   just-created row is deleted again

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{with_envelope, with_envelope_retry, DbState};
use crate::error::{PosError, PosResult};
use crate::fiscal;
use crate::models::{
    business_date_today, now_utc, ActiveTransaction, ResolutionStatus, TransactionItem,
    TransactionStatus, NOTE_DISCOUNT, NOTE_STORNO, NOTE_SURCHARGE,
};
use crate::money::{self, TaxRules};
use crate::printer::ReceiptPrinter;
use crate::repository as repo;
use crate::signer::FiscalSigner;

/// Operational event types consumed by the finish-time reconstruction.
const EVENT_PARTIAL_STORNO: &str = "partial_storno";
const EVENT_PRICE_OVERRIDE: &str = "price_override";

/// The wired transaction engine. Constructed once at startup.
pub struct Engine {
    pub db: Arc<DbState>,
    pub signer: Arc<dyn FiscalSigner>,
    pub printer: Arc<dyn ReceiptPrinter>,
    pub tax_rules: TaxRules,
}

/// Criteria for [`Engine::find_or_create`].
#[derive(Debug, Default)]
pub struct FindOrCreateCriteria {
    pub transaction_id: Option<i64>,
    pub metadata: Option<Value>,
}

/// Payment data supplied on finish.
#[derive(Debug, Clone)]
pub struct PaymentData {
    pub payment_type: String,
    pub amount: Decimal,
}

/// Result of a live mutation: the refreshed receipt plus an optional
/// post-commit fiscal warning.
#[derive(Debug)]
pub struct MutationOutcome {
    pub transaction: ActiveTransaction,
    pub items: Vec<TransactionItem>,
    pub fiscal_warning: Option<String>,
}

/// Result of `finish`: the terminal receipt, reconstruction output, and the
/// print hand-off status.
#[derive(Debug)]
pub struct FinishOutcome {
    pub transaction: ActiveTransaction,
    pub items: Vec<TransactionItem>,
    pub process_data: String,
    pub fiscal_warning: Option<String>,
    pub print_status: Value,
}

impl Engine {
    pub fn new(
        db: Arc<DbState>,
        signer: Arc<dyn FiscalSigner>,
        printer: Arc<dyn ReceiptPrinter>,
        tax_rules: TaxRules,
    ) -> Self {
        Engine {
            db,
            signer,
            printer,
            tax_rules,
        }
    }

    // -----------------------------------------------------------------------
    // Create / load
    // -----------------------------------------------------------------------

    /// Return the referenced transaction when it is still active, otherwise
    /// start a fresh one.
    ///
    /// A fresh transaction is only kept if its `startTransaction` fiscal
    /// event commits; on fiscal failure the row is deleted again and the
    /// call fails with `FiscalCommitFailed`.
    pub fn find_or_create(
        &self,
        criteria: FindOrCreateCriteria,
        user_id: Option<i64>,
    ) -> PosResult<MutationOutcome> {
        if let Some(id) = criteria.transaction_id {
            let conn = self.db.conn.lock()?;
            match repo::get_transaction(&conn, id) {
                Ok(tx) if tx.status == TransactionStatus::Active => {
                    let items = repo::items_with_names_for_transaction(&conn, tx.id)?;
                    return Ok(MutationOutcome {
                        transaction: tx,
                        items,
                        fiscal_warning: None,
                    });
                }
                Ok(_) | Err(PosError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let uuid = Uuid::new_v4().to_string();
        let metadata = criteria
            .metadata
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let now = now_utc();
        let business_date = business_date_today();

        let tx_id = {
            let conn = self.db.conn.lock()?;
            with_envelope_retry(&conn, |c| {
                repo::insert_transaction(c, &uuid, user_id, &business_date, &metadata, &now)
            })?
        };

        // startTransaction is the one fiscal emit that gates the business
        // row: without it the receipt never legally existed.
        let fiscal_result = fiscal::log_fiscal_event(
            &self.db,
            self.signer.as_ref(),
            "startTransaction",
            &uuid,
            user_id,
            json!({ "metadata": metadata, "businessDate": business_date }),
        );

        if let Err(e) = fiscal_result {
            let conn = self.db.conn.lock()?;
            with_envelope(&conn, |c| repo::delete_transaction(c, tx_id))?;
            warn!(uuid, "startTransaction fiscal emit failed, transaction discarded");
            return Err(PosError::FiscalCommitFailed(e.to_string()));
        }

        info!(transaction_id = tx_id, uuid, "Transaction started");

        let conn = self.db.conn.lock()?;
        let tx = repo::get_transaction(&conn, tx_id)?;
        Ok(MutationOutcome {
            transaction: tx,
            items: Vec::new(),
            fiscal_warning: None,
        })
    }

    // -----------------------------------------------------------------------
    // Item mutations
    // -----------------------------------------------------------------------

    /// Add a catalog item line at its catalog price.
    pub fn add_item(
        &self,
        transaction_id: i64,
        item_id: i64,
        quantity: Decimal,
        user_id: Option<i64>,
        notes: Option<String>,
    ) -> PosResult<MutationOutcome> {
        self.add_item_line(transaction_id, item_id, quantity, user_id, notes, None)
    }

    /// Add a line at a caller-supplied unit price.
    pub fn add_custom_price_item(
        &self,
        transaction_id: i64,
        item_id: i64,
        quantity: Decimal,
        custom_price: Decimal,
        user_id: Option<i64>,
    ) -> PosResult<MutationOutcome> {
        let notes = format!("Custom price: {}", money::fmt2(custom_price));
        self.add_item_line(
            transaction_id,
            item_id,
            quantity,
            user_id,
            Some(notes),
            Some(custom_price),
        )
    }

    fn add_item_line(
        &self,
        transaction_id: i64,
        item_id: i64,
        quantity: Decimal,
        user_id: Option<i64>,
        notes: Option<String>,
        price_override: Option<Decimal>,
    ) -> PosResult<MutationOutcome> {
        if quantity <= Decimal::ZERO {
            return Err(PosError::Validation("quantity must be positive".into()));
        }

        let now = now_utc();
        let (tx_uuid, line_payload) = {
            let conn = self.db.conn.lock()?;
            with_envelope_retry(&conn, |c| {
                let tx = repo::get_transaction(c, transaction_id)?;
                require_active(&tx)?;

                let item = repo::get_item(c, item_id)?;
                let category = repo::get_category(c, item.category_id)?;
                let tax_rate = self.tax_rules.rate_for(&category.category_type);

                let unit_price = price_override.unwrap_or(item.price);
                let total_price = unit_price * quantity;
                let tax_amount = money::tax_portion(total_price, tax_rate);

                let line_id = repo::insert_item_line(
                    c,
                    tx.id,
                    item.id,
                    quantity,
                    unit_price,
                    total_price,
                    tax_rate,
                    tax_amount,
                    None,
                    notes.as_deref(),
                    &now,
                )?;

                repo::update_transaction_totals(
                    c,
                    tx.id,
                    tx.total_amount + total_price,
                    tx.tax_amount + tax_amount,
                    &now,
                )?;

                Ok((
                    tx.uuid,
                    json!({
                        "lineId": line_id,
                        "itemId": item.id,
                        "quantity": quantity,
                        "unitPrice": unit_price,
                        "totalPrice": total_price,
                        "taxRate": tax_rate,
                    }),
                ))
            })?
        };

        let warning = self.emit_update_event(&tx_uuid, user_id, json!({ "added": line_payload }));
        self.mutation_outcome(transaction_id, warning)
    }

    /// Change a line's quantity in place.
    ///
    /// A reduction is a partial storno: the user-friendly live view shrinks,
    /// and an operational event preserves the original state for the
    /// finish-time reconstruction to undo this edit.
    pub fn update_item_quantity(
        &self,
        transaction_id: i64,
        item_line_id: i64,
        new_quantity: Decimal,
        user_id: Option<i64>,
    ) -> PosResult<MutationOutcome> {
        if new_quantity <= Decimal::ZERO {
            return Err(PosError::Validation("quantity must be positive".into()));
        }

        let now = now_utc();
        let tx_uuid = {
            let conn = self.db.conn.lock()?;
            with_envelope_retry(&conn, |c| {
                let tx = repo::get_transaction(c, transaction_id)?;
                require_active(&tx)?;
                let line = repo::get_item_line(c, item_line_id)?;
                require_line_of(&line, &tx)?;

                if new_quantity < line.quantity {
                    fiscal::log_operational_event(
                        c,
                        EVENT_PARTIAL_STORNO,
                        Some(&tx.uuid),
                        user_id,
                        &json!({
                            "item_line_id": line.id,
                            "original_quantity": line.quantity,
                            "new_quantity": new_quantity,
                            "item_id": line.item_id,
                        }),
                    )?;
                }

                let new_total = line.unit_price * new_quantity;
                let new_tax = money::tax_portion(new_total, line.tax_rate);

                repo::update_item_line_amounts(
                    c,
                    line.id,
                    new_quantity,
                    line.unit_price,
                    new_total,
                    new_tax,
                    &now,
                )?;
                repo::update_transaction_totals(
                    c,
                    tx.id,
                    tx.total_amount - line.total_price + new_total,
                    tx.tax_amount - line.tax_amount + new_tax,
                    &now,
                )?;

                Ok(tx.uuid)
            })?
        };

        let warning = self.emit_update_event(
            &tx_uuid,
            user_id,
            json!({ "quantityChanged": { "lineId": item_line_id, "quantity": new_quantity } }),
        );
        self.mutation_outcome(transaction_id, warning)
    }

    /// Override a line's price.
    ///
    /// `is_total_price` marks the argument as the post-quantity total; the
    /// unit price is then derived from the current quantity.
    pub fn update_item_price(
        &self,
        transaction_id: i64,
        item_line_id: i64,
        new_price: Decimal,
        user_id: Option<i64>,
        is_total_price: bool,
    ) -> PosResult<MutationOutcome> {
        let now = now_utc();
        let tx_uuid = {
            let conn = self.db.conn.lock()?;
            with_envelope_retry(&conn, |c| {
                let tx = repo::get_transaction(c, transaction_id)?;
                require_active(&tx)?;
                let line = repo::get_item_line(c, item_line_id)?;
                require_line_of(&line, &tx)?;

                if line.quantity.is_zero() {
                    return Err(PosError::InvalidState(
                        "cannot reprice a zero-quantity line".into(),
                    ));
                }

                let new_unit_price = if is_total_price {
                    new_price / line.quantity
                } else {
                    new_price
                };

                fiscal::log_operational_event(
                    c,
                    EVENT_PRICE_OVERRIDE,
                    Some(&tx.uuid),
                    user_id,
                    &json!({
                        "item_line_id": line.id,
                        "original_unit_price": line.unit_price,
                        "new_unit_price": new_unit_price,
                        "quantity": line.quantity,
                        "item_id": line.item_id,
                    }),
                )?;

                let new_total = new_unit_price * line.quantity;
                let new_tax = money::tax_portion(new_total, line.tax_rate);

                repo::update_item_line_amounts(
                    c,
                    line.id,
                    line.quantity,
                    new_unit_price,
                    new_total,
                    new_tax,
                    &now,
                )?;
                repo::update_transaction_totals(
                    c,
                    tx.id,
                    tx.total_amount - line.total_price + new_total,
                    tx.tax_amount - line.tax_amount + new_tax,
                    &now,
                )?;

                Ok(tx.uuid)
            })?
        };

        let warning = self.emit_update_event(
            &tx_uuid,
            user_id,
            json!({ "priceChanged": { "lineId": item_line_id, "price": new_price } }),
        );
        self.mutation_outcome(transaction_id, warning)
    }

    // -----------------------------------------------------------------------
    // Park / activate / metadata
    // -----------------------------------------------------------------------

    /// Park an active receipt on a table.
    ///
    /// `update_timestamp=false` preserves arrival order in parked lists when
    /// the caller is only moving UI focus.
    pub fn park(
        &self,
        transaction_id: i64,
        table: &str,
        user_id: Option<i64>,
        update_timestamp: bool,
    ) -> PosResult<MutationOutcome> {
        let now = now_utc();
        let tx_uuid = {
            let conn = self.db.conn.lock()?;
            with_envelope_retry(&conn, |c| {
                let tx = repo::get_transaction(c, transaction_id)?;
                require_active(&tx)?;

                let mut metadata = tx.metadata.clone();
                merge_metadata(&mut metadata, &json!({ "table": table }));
                repo::update_transaction_metadata(c, tx.id, &metadata, false, &now)?;
                repo::update_transaction_status(
                    c,
                    tx.id,
                    TransactionStatus::Parked,
                    update_timestamp,
                    &now,
                )?;
                Ok(tx.uuid)
            })?
        };

        let warning = self.emit_fiscal_after_commit(
            "parkTransaction",
            &tx_uuid,
            user_id,
            json!({ "table": table }),
        );
        self.mutation_outcome(transaction_id, warning)
    }

    /// Reactivate a parked receipt. Any operator may take it over.
    pub fn activate(
        &self,
        transaction_id: i64,
        user_id: Option<i64>,
        update_timestamp: bool,
    ) -> PosResult<MutationOutcome> {
        let now = now_utc();
        let tx_uuid = {
            let conn = self.db.conn.lock()?;
            with_envelope_retry(&conn, |c| {
                let tx = repo::get_transaction(c, transaction_id)?;
                if tx.status != TransactionStatus::Parked {
                    return Err(PosError::InvalidState(format!(
                        "transaction {} is {}, expected parked",
                        tx.id,
                        tx.status.as_str()
                    )));
                }
                repo::update_transaction_status(
                    c,
                    tx.id,
                    TransactionStatus::Active,
                    update_timestamp,
                    &now,
                )?;
                Ok(tx.uuid)
            })?
        };

        let warning =
            self.emit_fiscal_after_commit("activateTransaction", &tx_uuid, user_id, json!({}));
        self.mutation_outcome(transaction_id, warning)
    }

    /// Merge a metadata patch into the transaction.
    ///
    /// Merge, never replace: callers routinely send partial patches and a
    /// replace would drop fields like the table binding.
    pub fn update_metadata(
        &self,
        transaction_id: i64,
        patch: &Value,
        _user_id: Option<i64>,
        update_timestamp: bool,
    ) -> PosResult<MutationOutcome> {
        let now = now_utc();
        {
            let conn = self.db.conn.lock()?;
            with_envelope_retry(&conn, |c| {
                let tx = repo::get_transaction(c, transaction_id)?;
                if tx.status == TransactionStatus::Finished
                    || tx.status == TransactionStatus::Cancelled
                {
                    return Err(PosError::InvalidState(format!(
                        "transaction {} is {}",
                        tx.id,
                        tx.status.as_str()
                    )));
                }
                let mut metadata = tx.metadata.clone();
                merge_metadata(&mut metadata, patch);
                repo::update_transaction_metadata(c, tx.id, &metadata, update_timestamp, &now)
            })?;
        }
        self.mutation_outcome(transaction_id, None)
    }

    /// True iff another parked transaction already holds this table.
    pub fn check_table_in_use(
        &self,
        table: &str,
        exclude_transaction_id: Option<i64>,
    ) -> PosResult<bool> {
        let conn = self.db.conn.lock()?;
        repo::is_table_in_use(&conn, table, exclude_transaction_id)
    }

    /// All parked receipts with their items, arrival order preserved.
    pub fn parked_transactions(&self) -> PosResult<Vec<MutationOutcome>> {
        let conn = self.db.conn.lock()?;
        let parked = repo::parked_transactions(&conn)?;
        parked
            .into_iter()
            .map(|tx| {
                let items = repo::items_with_names_for_transaction(&conn, tx.id)?;
                Ok(MutationOutcome {
                    transaction: tx,
                    items,
                    fiscal_warning: None,
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Finish
    // -----------------------------------------------------------------------

    /// Finish an active receipt: reconstruct compliance lines, finalize
    /// totals, emit the `finishTransaction` fiscal event, hand off to the
    /// printer.
    pub fn finish(
        &self,
        transaction_id: i64,
        payment: PaymentData,
        user_id: Option<i64>,
    ) -> PosResult<FinishOutcome> {
        let now = now_utc();

        let (tx_uuid, process_data, display_order) = {
            let conn = self.db.conn.lock()?;
            with_envelope_retry(&conn, |c| {
                let tx = repo::get_transaction(c, transaction_id)?;
                require_active(&tx)?;

                // Payment must match the live total before reconstruction
                // shifts value between lines.
                if (payment.amount - tx.total_amount).abs() > money::payment_tolerance() {
                    return Err(PosError::Validation(format!(
                        "payment amount {} does not match total {}",
                        payment.amount, tx.total_amount
                    )));
                }

                let lines = repo::items_for_transaction(c, tx.id)?;
                let display_order: HashMap<i64, usize> = lines
                    .iter()
                    .enumerate()
                    .map(|(index, line)| (line.id, index))
                    .collect();

                self.reconstruct_compliance_lines(c, &tx, &now)?;

                let (total, tax) = repo::sum_item_lines(c, tx.id)?;
                let breakdown = repo::tax_breakdown(c, tx.id)?;
                // The payment is considered to match the reconstructed
                // total; cash is reconciled externally.
                let process_data =
                    money::format_process_data(&breakdown, total, &payment.payment_type);

                repo::finalize_transaction(
                    c,
                    tx.id,
                    &payment.payment_type,
                    total,
                    total,
                    tax,
                    &now,
                )?;

                Ok((tx.uuid, process_data, display_order))
            })?
        };

        let fiscal_warning = self.emit_fiscal_after_commit(
            "finishTransaction",
            &tx_uuid,
            user_id,
            json!({
                "processData": process_data.clone(),
                "paymentType": payment.payment_type,
            }),
        );

        let (transaction, items) = {
            let conn = self.db.conn.lock()?;
            let tx = repo::get_transaction(&conn, transaction_id)?;
            let mut items = repo::items_with_names_for_transaction(&conn, tx.id)?;
            sort_for_display(&mut items, &display_order);
            (tx, items)
        };

        let receipt = json!({
            "uuid": &transaction.uuid,
            "transaction": &transaction,
            "items": &items,
            "processData": &process_data,
        });
        let print_status = match self.printer.print_receipt(&receipt) {
            Ok(()) => json!({ "failed": false }),
            Err(e) => {
                let conn = self.db.conn.lock()?;
                let _ = fiscal::log_operational_event(
                    &conn,
                    "print_failed",
                    Some(&transaction.uuid),
                    user_id,
                    &json!({ "error": e.to_string() }),
                );
                warn!(uuid = %transaction.uuid, "Receipt print failed: {e}");
                json!({ "failed": true, "error": e.to_string() })
            }
        };

        info!(
            transaction_id,
            uuid = %transaction.uuid,
            total = %transaction.total_amount,
            "Transaction finished"
        );

        Ok(FinishOutcome {
            transaction,
            items,
            process_data,
            fiscal_warning,
            print_status,
        })
    }

    /// Replay the operational log and rebuild the append-only line set:
    /// in-place edits are reverted, and each storno / discount / surcharge
    /// becomes a signed child line pointing at its original.
    fn reconstruct_compliance_lines(
        &self,
        conn: &rusqlite::Connection,
        tx: &ActiveTransaction,
        now: &str,
    ) -> PosResult<()> {
        let events = fiscal::operational_events_for_transaction(
            conn,
            &tx.uuid,
            &[EVENT_PARTIAL_STORNO, EVENT_PRICE_OVERRIDE],
        )?;
        if events.is_empty() {
            return Ok(());
        }

        // Only the first storno event per line carries the pre-edit state;
        // later events for the same line revert nothing.
        let mut reverted: HashSet<i64> = HashSet::new();

        for event in events {
            let payload = &event.payload;
            let line_id = payload
                .get("item_line_id")
                .and_then(Value::as_i64)
                .ok_or_else(|| PosError::Internal("operational event missing line id".into()))?;
            let line = repo::get_item_line(conn, line_id)?;
            let item = repo::get_item(conn, line.item_id)?;

            match event.event_type.as_str() {
                EVENT_PARTIAL_STORNO => {
                    let original_quantity = decimal_field(payload, "original_quantity")?;
                    let new_quantity = decimal_field(payload, "new_quantity")?;
                    if original_quantity <= new_quantity {
                        continue;
                    }

                    if reverted.insert(line_id) {
                        let original_total = item.price * original_quantity;
                        repo::update_item_line_amounts(
                            conn,
                            line.id,
                            original_quantity,
                            item.price,
                            original_total,
                            money::tax_portion(original_total, line.tax_rate),
                            now,
                        )?;
                    }

                    let storno_quantity = -(original_quantity - new_quantity);
                    let storno_total = item.price * storno_quantity;
                    repo::insert_item_line(
                        conn,
                        tx.id,
                        line.item_id,
                        storno_quantity,
                        item.price,
                        storno_total,
                        line.tax_rate,
                        money::tax_portion(storno_total, line.tax_rate),
                        Some(line.id),
                        Some(NOTE_STORNO),
                        now,
                    )?;
                }
                EVENT_PRICE_OVERRIDE => {
                    let original_unit = decimal_field(payload, "original_unit_price")?;
                    let new_unit = decimal_field(payload, "new_unit_price")?;
                    let quantity = decimal_field(payload, "quantity")?;

                    let unit_difference = new_unit - original_unit;
                    let total_difference = unit_difference * quantity;
                    if total_difference.is_zero() {
                        continue;
                    }

                    let catalog_total = item.price * line.quantity;
                    repo::update_item_line_amounts(
                        conn,
                        line.id,
                        line.quantity,
                        item.price,
                        catalog_total,
                        money::tax_portion(catalog_total, line.tax_rate),
                        now,
                    )?;
                    reverted.insert(line_id);

                    let notes = if total_difference < Decimal::ZERO {
                        NOTE_DISCOUNT
                    } else {
                        NOTE_SURCHARGE
                    };
                    repo::insert_item_line(
                        conn,
                        tx.id,
                        line.item_id,
                        Decimal::ONE,
                        total_difference,
                        total_difference,
                        line.tax_rate,
                        money::tax_portion(total_difference, line.tax_rate),
                        Some(line.id),
                        Some(notes),
                        now,
                    )?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pending resolution
    // -----------------------------------------------------------------------

    /// Receipts flagged for manual resolution after a restart, with items.
    pub fn pending_transactions(&self) -> PosResult<Vec<MutationOutcome>> {
        let conn = self.db.conn.lock()?;
        let pending = repo::pending_resolution_transactions(&conn)?;
        pending
            .into_iter()
            .map(|tx| {
                let items = repo::items_with_names_for_transaction(&conn, tx.id)?;
                Ok(MutationOutcome {
                    transaction: tx,
                    items,
                    fiscal_warning: None,
                })
            })
            .collect()
    }

    /// Resolve a recovery-pending receipt.
    ///
    /// Only `postpone` has a defined contract. `cancel` and `fiscalize`
    /// stay reserved until the fiscal authority's cancellation semantics
    /// are specified.
    pub fn resolve_pending(
        &self,
        transaction_id: i64,
        resolution: &str,
        user_id: Option<i64>,
    ) -> PosResult<MutationOutcome> {
        match resolution {
            "postpone" => {}
            "cancel" | "fiscalize" => {
                return Err(PosError::NotImplemented(format!(
                    "resolution '{resolution}' is reserved"
                )))
            }
            other => {
                return Err(PosError::Validation(format!(
                    "unknown resolution '{other}'"
                )))
            }
        }

        let now = now_utc();
        let tx_uuid = {
            let conn = self.db.conn.lock()?;
            with_envelope_retry(&conn, |c| {
                let tx = repo::get_transaction(c, transaction_id)?;
                if tx.resolution_status != ResolutionStatus::Pending {
                    return Err(PosError::InvalidState(format!(
                        "transaction {} is not pending resolution",
                        tx.id
                    )));
                }
                repo::set_resolution_status(c, tx.id, ResolutionStatus::Postponed, &now)?;
                Ok(tx.uuid)
            })?
        };

        let warning =
            self.emit_fiscal_after_commit("postponeTransaction", &tx_uuid, user_id, json!({}));
        self.mutation_outcome(transaction_id, warning)
    }

    /// Last finished receipts (newest first) with items, for reprint.
    pub fn recent_receipts(&self, limit: i64) -> PosResult<Vec<MutationOutcome>> {
        let conn = self.db.conn.lock()?;
        let recent = repo::recent_finished_transactions(&conn, limit)?;
        recent
            .into_iter()
            .map(|tx| {
                let items = repo::items_with_names_for_transaction(&conn, tx.id)?;
                Ok(MutationOutcome {
                    transaction: tx,
                    items,
                    fiscal_warning: None,
                })
            })
            .collect()
    }

    /// Re-render a finished receipt through the printer collaborator.
    pub fn reprint_receipt(&self, transaction_id: i64, user_id: Option<i64>) -> PosResult<Value> {
        let (tx, items) = {
            let conn = self.db.conn.lock()?;
            let tx = repo::get_transaction(&conn, transaction_id)?;
            if tx.status != TransactionStatus::Finished {
                return Err(PosError::InvalidState(format!(
                    "transaction {} is {}, only finished receipts reprint",
                    tx.id,
                    tx.status.as_str()
                )));
            }
            let items = repo::items_with_names_for_transaction(&conn, tx.id)?;
            (tx, items)
        };

        let receipt = json!({
            "uuid": &tx.uuid,
            "transaction": &tx,
            "items": &items,
            "reprint": true,
        });
        let print_status = match self.printer.print_receipt(&receipt) {
            Ok(()) => {
                let conn = self.db.conn.lock()?;
                let _ = fiscal::log_operational_event(
                    &conn,
                    "reprint",
                    Some(&tx.uuid),
                    user_id,
                    &json!({}),
                );
                json!({ "failed": false })
            }
            Err(e) => {
                let conn = self.db.conn.lock()?;
                let _ = fiscal::log_operational_event(
                    &conn,
                    "print_failed",
                    Some(&tx.uuid),
                    user_id,
                    &json!({ "error": e.to_string(), "reprint": true }),
                );
                json!({ "failed": true, "error": e.to_string() })
            }
        };

        Ok(json!({ "transaction": tx, "items": items, "printStatus": print_status }))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Emit `updateTransaction` after a committed item mutation.
    fn emit_update_event(
        &self,
        tx_uuid: &str,
        user_id: Option<i64>,
        delta: Value,
    ) -> Option<String> {
        self.emit_fiscal_after_commit("updateTransaction", tx_uuid, user_id, delta)
    }

    /// Emit a fiscal event for already-committed business state. Failure is
    /// a divergence warning, never an error.
    fn emit_fiscal_after_commit(
        &self,
        event_type: &str,
        tx_uuid: &str,
        user_id: Option<i64>,
        payload: Value,
    ) -> Option<String> {
        match fiscal::log_fiscal_event(
            &self.db,
            self.signer.as_ref(),
            event_type,
            tx_uuid,
            user_id,
            payload,
        ) {
            Ok(_) => None,
            Err(e) => fiscal::record_divergence(&self.db, tx_uuid, event_type, &e),
        }
    }

    fn mutation_outcome(
        &self,
        transaction_id: i64,
        fiscal_warning: Option<String>,
    ) -> PosResult<MutationOutcome> {
        let conn = self.db.conn.lock()?;
        let tx = repo::get_transaction(&conn, transaction_id)?;
        let items = repo::items_with_names_for_transaction(&conn, tx.id)?;
        Ok(MutationOutcome {
            transaction: tx,
            items,
            fiscal_warning,
        })
    }
}

fn require_active(tx: &ActiveTransaction) -> PosResult<()> {
    if tx.status != TransactionStatus::Active {
        return Err(PosError::InvalidState(format!(
            "transaction {} is {}, expected active",
            tx.id,
            tx.status.as_str()
        )));
    }
    Ok(())
}

fn require_line_of(line: &TransactionItem, tx: &ActiveTransaction) -> PosResult<()> {
    if line.active_transaction_id != tx.id {
        return Err(PosError::Validation(format!(
            "line {} does not belong to transaction {}",
            line.id, tx.id
        )));
    }
    Ok(())
}

/// Shallow-merge a patch object into metadata.
fn merge_metadata(metadata: &mut Value, patch: &Value) {
    if let (Value::Object(base), Value::Object(incoming)) = (metadata, patch) {
        for (key, value) in incoming {
            base.insert(key.clone(), value.clone());
        }
    }
}

fn decimal_field(payload: &Value, key: &str) -> PosResult<Decimal> {
    let raw = payload
        .get(key)
        .ok_or_else(|| PosError::Internal(format!("operational event missing {key}")))?;
    match raw {
        Value::String(s) => s
            .parse::<Decimal>()
            .map_err(|e| PosError::Internal(format!("bad decimal in {key}: {e}"))),
        Value::Number(n) => n
            .to_string()
            .parse::<Decimal>()
            .map_err(|e| PosError::Internal(format!("bad decimal in {key}: {e}"))),
        _ => Err(PosError::Internal(format!("bad decimal in {key}"))),
    }
}

/// Order lines for output: each compliance child directly after its parent,
/// children in insertion order, parents in original display order.
fn sort_for_display(items: &mut [TransactionItem], display_order: &HashMap<i64, usize>) {
    items.sort_by_key(|line| {
        let anchor = line.parent_transaction_item_id.unwrap_or(line.id);
        let index = display_order.get(&anchor).copied().unwrap_or(usize::MAX);
        (index, line.id)
    });
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::printer::{FailingPrinter, LogPrinter};
    use crate::signer::LocalSigner;
    use rusqlite::params;
    use rust_decimal_macros::dec;

    fn test_engine() -> Engine {
        let state = Arc::new(db::test_db());
        Engine::new(
            state,
            Arc::new(LocalSigner::new()),
            Arc::new(LogPrinter),
            TaxRules::default_rules(),
        )
    }

    /// Seed a drink (19%) and a food (7%) item; returns their ids.
    fn seed_catalog(engine: &Engine) -> (i64, i64) {
        let conn = engine.db.conn.lock().unwrap();
        conn.execute_batch(
            "INSERT INTO companies (company_full_name) VALUES ('Testco');
             INSERT INTO branches (company_id, branch_name) VALUES (1, '{}');
             INSERT INTO pos_devices (branch_id, pos_device_name) VALUES (1, '{}');
             INSERT INTO categories (pos_device_id, category_names, category_type)
                 VALUES (1, '{\"de\":\"Getränke\"}', 'drink');
             INSERT INTO categories (pos_device_id, category_names, category_type)
                 VALUES (1, '{\"de\":\"Speisen\"}', 'food');",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO items (pos_device_id, associated_category_unique_identifier,
                display_names, item_price_value)
             VALUES (1, 1, '{\"en\":\"Coffee\"}', '3.00')",
            [],
        )
        .unwrap();
        let coffee = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO items (pos_device_id, associated_category_unique_identifier,
                display_names, item_price_value)
             VALUES (1, 2, '{\"en\":\"Widget\"}', '10.00')",
            [],
        )
        .unwrap();
        let widget = conn.last_insert_rowid();
        (coffee, widget)
    }

    fn fiscal_event_types(engine: &Engine, uuid: &str) -> Vec<String> {
        let conn = engine.db.conn.lock().unwrap();
        fiscal::fiscal_log_for_transaction(&conn, uuid)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[test]
    fn test_happy_path_finish() {
        let engine = test_engine();
        let (coffee, _) = seed_catalog(&engine);

        let created = engine
            .find_or_create(FindOrCreateCriteria::default(), Some(1))
            .unwrap();
        let tx_id = created.transaction.id;

        let after_add = engine
            .add_item(tx_id, coffee, dec!(2), Some(1), None)
            .unwrap();
        assert_eq!(after_add.transaction.total_amount, dec!(6.00));
        assert_eq!(after_add.items.len(), 1);
        assert_eq!(after_add.items[0].quantity, dec!(2));

        let finished = engine
            .finish(
                tx_id,
                PaymentData {
                    payment_type: "CASH".into(),
                    amount: dec!(6.00),
                },
                Some(1),
            )
            .unwrap();

        assert_eq!(finished.transaction.status, TransactionStatus::Finished);
        assert_eq!(finished.transaction.total_amount, dec!(6.00));
        assert_eq!(finished.transaction.tax_amount, dec!(0.957983));
        assert_eq!(finished.transaction.payment_amount, Some(dec!(6.00)));
        assert_eq!(
            finished.process_data,
            "Beleg^6.00_0.00_0.00_0.00_0.00^6.00:CASH"
        );
        assert_eq!(finished.items.len(), 1);
        assert!(finished.fiscal_warning.is_none());

        assert_eq!(
            fiscal_event_types(&engine, &finished.transaction.uuid),
            vec!["startTransaction", "updateTransaction", "finishTransaction"]
        );
    }

    #[test]
    fn test_partial_storno_reconstruction() {
        let engine = test_engine();
        let (coffee, _) = seed_catalog(&engine);

        let tx_id = engine
            .find_or_create(FindOrCreateCriteria::default(), Some(1))
            .unwrap()
            .transaction
            .id;
        let added = engine.add_item(tx_id, coffee, dec!(3), Some(1), None).unwrap();
        let line_id = added.items[0].id;

        // Live view shrinks to qty 1 / 3.00
        let updated = engine
            .update_item_quantity(tx_id, line_id, dec!(1), Some(1))
            .unwrap();
        assert_eq!(updated.items.len(), 1);
        assert_eq!(updated.items[0].quantity, dec!(1));
        assert_eq!(updated.transaction.total_amount, dec!(3.00));

        let finished = engine
            .finish(
                tx_id,
                PaymentData {
                    payment_type: "CASH".into(),
                    amount: dec!(3.00),
                },
                Some(1),
            )
            .unwrap();

        assert_eq!(finished.items.len(), 2);
        let original = &finished.items[0];
        let child = &finished.items[1];
        assert_eq!(original.id, line_id);
        assert_eq!(original.quantity, dec!(3));
        assert_eq!(original.unit_price, dec!(3.00));
        assert_eq!(original.total_price, dec!(9.00));
        assert_eq!(child.parent_transaction_item_id, Some(line_id));
        assert_eq!(child.quantity, dec!(-2));
        assert_eq!(child.unit_price, dec!(3.00));
        assert_eq!(child.total_price, dec!(-6.00));
        assert_eq!(child.notes.as_deref(), Some(NOTE_STORNO));
        assert_eq!(finished.transaction.total_amount, dec!(3.00));
    }

    #[test]
    fn test_price_override_discount_reconstruction() {
        let engine = test_engine();
        let (_, widget) = seed_catalog(&engine);

        let tx_id = engine
            .find_or_create(FindOrCreateCriteria::default(), Some(1))
            .unwrap()
            .transaction
            .id;
        let added = engine.add_item(tx_id, widget, dec!(1), Some(1), None).unwrap();
        let line_id = added.items[0].id;

        engine
            .update_item_price(tx_id, line_id, dec!(8.00), Some(1), false)
            .unwrap();

        let finished = engine
            .finish(
                tx_id,
                PaymentData {
                    payment_type: "CASH".into(),
                    amount: dec!(8.00),
                },
                Some(1),
            )
            .unwrap();

        assert_eq!(finished.items.len(), 2);
        let original = &finished.items[0];
        let child = &finished.items[1];
        assert_eq!(original.unit_price, dec!(10.00));
        assert_eq!(original.total_price, dec!(10.00));
        assert_eq!(child.quantity, dec!(1));
        assert_eq!(child.unit_price, dec!(-2.00));
        assert_eq!(child.total_price, dec!(-2.00));
        assert_eq!(child.notes.as_deref(), Some(NOTE_DISCOUNT));
        assert_eq!(finished.transaction.total_amount, dec!(8.00));
        // 7% bucket is the second field
        assert_eq!(
            finished.process_data,
            "Beleg^0.00_8.00_0.00_0.00_0.00^8.00:CASH"
        );
    }

    #[test]
    fn test_price_override_surcharge() {
        let engine = test_engine();
        let (_, widget) = seed_catalog(&engine);

        let tx_id = engine
            .find_or_create(FindOrCreateCriteria::default(), None)
            .unwrap()
            .transaction
            .id;
        let added = engine.add_item(tx_id, widget, dec!(2), None, None).unwrap();
        let line_id = added.items[0].id;

        // Total-price form: 26.00 for qty 2 → unit 13.00
        engine
            .update_item_price(tx_id, line_id, dec!(26.00), None, true)
            .unwrap();

        let finished = engine
            .finish(
                tx_id,
                PaymentData {
                    payment_type: "CARD".into(),
                    amount: dec!(26.00),
                },
                None,
            )
            .unwrap();

        let child = &finished.items[1];
        assert_eq!(child.notes.as_deref(), Some(NOTE_SURCHARGE));
        assert_eq!(child.total_price, dec!(6.00));
        assert_eq!(finished.transaction.total_amount, dec!(26.00));
    }

    #[test]
    fn test_chained_quantity_reductions_revert_once() {
        let engine = test_engine();
        let (coffee, _) = seed_catalog(&engine);

        let tx_id = engine
            .find_or_create(FindOrCreateCriteria::default(), None)
            .unwrap()
            .transaction
            .id;
        let added = engine.add_item(tx_id, coffee, dec!(3), None, None).unwrap();
        let line_id = added.items[0].id;

        engine
            .update_item_quantity(tx_id, line_id, dec!(2), None)
            .unwrap();
        engine
            .update_item_quantity(tx_id, line_id, dec!(1), None)
            .unwrap();

        let finished = engine
            .finish(
                tx_id,
                PaymentData {
                    payment_type: "CASH".into(),
                    amount: dec!(3.00),
                },
                None,
            )
            .unwrap();

        // Original restored to 3, two storno children of -1 each
        assert_eq!(finished.items.len(), 3);
        assert_eq!(finished.items[0].quantity, dec!(3));
        assert_eq!(finished.items[1].quantity, dec!(-1));
        assert_eq!(finished.items[2].quantity, dec!(-1));
        assert_eq!(finished.transaction.total_amount, dec!(3.00));
    }

    #[test]
    fn test_payment_tolerance_boundary() {
        let engine = test_engine();
        let (coffee, _) = seed_catalog(&engine);

        let tx_id = engine
            .find_or_create(FindOrCreateCriteria::default(), None)
            .unwrap()
            .transaction
            .id;
        engine.add_item(tx_id, coffee, dec!(2), None, None).unwrap();

        // 0.002 off: rejected
        let too_far = engine.finish(
            tx_id,
            PaymentData {
                payment_type: "CASH".into(),
                amount: dec!(6.002),
            },
            None,
        );
        assert!(matches!(too_far, Err(PosError::Validation(_))));

        // 0.001 off: accepted
        let ok = engine.finish(
            tx_id,
            PaymentData {
                payment_type: "CASH".into(),
                amount: dec!(6.001),
            },
            None,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_park_activate_roundtrip_preserves_metadata() {
        let engine = test_engine();
        let (coffee, _) = seed_catalog(&engine);

        let created = engine
            .find_or_create(
                FindOrCreateCriteria {
                    transaction_id: None,
                    metadata: Some(json!({"guest": "Anna"})),
                },
                None,
            )
            .unwrap();
        let tx_id = created.transaction.id;
        engine.add_item(tx_id, coffee, dec!(1), None, None).unwrap();

        let parked = engine.park(tx_id, "5", None, true).unwrap();
        assert_eq!(parked.transaction.status, TransactionStatus::Parked);
        assert_eq!(parked.transaction.metadata["table"], "5");
        assert_eq!(parked.transaction.metadata["guest"], "Anna");

        let active = engine.activate(tx_id, None, false).unwrap();
        assert_eq!(active.transaction.status, TransactionStatus::Active);
        assert_eq!(active.transaction.metadata["guest"], "Anna");

        // park on non-active fails
        assert!(matches!(
            engine.park(tx_id, "6", None, true),
            Ok(_)
        ));
        assert!(matches!(
            engine.park(tx_id, "7", None, true),
            Err(PosError::InvalidState(_))
        ));
    }

    #[test]
    fn test_table_check_excludes_current() {
        let engine = test_engine();
        seed_catalog(&engine);

        let tx_id = engine
            .find_or_create(FindOrCreateCriteria::default(), None)
            .unwrap()
            .transaction
            .id;
        engine.park(tx_id, "5", None, true).unwrap();

        assert!(engine.check_table_in_use("5", None).unwrap());
        assert!(!engine.check_table_in_use("5", Some(tx_id)).unwrap());
    }

    #[test]
    fn test_metadata_merge_keeps_existing_fields() {
        let engine = test_engine();
        seed_catalog(&engine);

        let tx_id = engine
            .find_or_create(
                FindOrCreateCriteria {
                    transaction_id: None,
                    metadata: Some(json!({"table": "5", "guest": "Anna"})),
                },
                None,
            )
            .unwrap()
            .transaction
            .id;

        let updated = engine
            .update_metadata(tx_id, &json!({"guest": "Ben"}), None, false)
            .unwrap();
        assert_eq!(updated.transaction.metadata["table"], "5");
        assert_eq!(updated.transaction.metadata["guest"], "Ben");
    }

    #[test]
    fn test_find_or_create_returns_existing_active() {
        let engine = test_engine();
        seed_catalog(&engine);

        let first = engine
            .find_or_create(FindOrCreateCriteria::default(), None)
            .unwrap();
        let again = engine
            .find_or_create(
                FindOrCreateCriteria {
                    transaction_id: Some(first.transaction.id),
                    metadata: None,
                },
                None,
            )
            .unwrap();
        assert_eq!(again.transaction.id, first.transaction.id);
        assert_eq!(again.transaction.uuid, first.transaction.uuid);
    }

    #[test]
    fn test_failed_start_fiscal_event_discards_transaction() {
        let state = Arc::new(db::test_db());
        let engine = Engine::new(
            state,
            Arc::new(crate::signer::FailingSigner),
            Arc::new(LogPrinter),
            TaxRules::default_rules(),
        );

        let result = engine.find_or_create(FindOrCreateCriteria::default(), None);
        assert!(matches!(result, Err(PosError::FiscalCommitFailed(_))));

        let conn = engine.db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM active_transactions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_post_commit_fiscal_failure_is_warning() {
        // Start with a working signer, then swap in a failing one for the
        // add: the business write must stand and carry a warning.
        let state = Arc::new(db::test_db());
        let good = Engine::new(
            state.clone(),
            Arc::new(LocalSigner::new()),
            Arc::new(LogPrinter),
            TaxRules::default_rules(),
        );
        let (coffee, _) = seed_catalog(&good);
        let tx_id = good
            .find_or_create(FindOrCreateCriteria::default(), None)
            .unwrap()
            .transaction
            .id;

        let flaky = Engine::new(
            state,
            Arc::new(crate::signer::FailingSigner),
            Arc::new(LogPrinter),
            TaxRules::default_rules(),
        );
        let outcome = flaky.add_item(tx_id, coffee, dec!(1), None, None).unwrap();
        assert!(outcome.fiscal_warning.is_some());
        assert_eq!(outcome.transaction.total_amount, dec!(3.00));
        assert_eq!(outcome.items.len(), 1);
    }

    #[test]
    fn test_print_failure_is_nonfatal_and_logged() {
        let state = Arc::new(db::test_db());
        let engine = Engine::new(
            state,
            Arc::new(LocalSigner::new()),
            Arc::new(FailingPrinter),
            TaxRules::default_rules(),
        );
        let (coffee, _) = seed_catalog(&engine);

        let tx_id = engine
            .find_or_create(FindOrCreateCriteria::default(), None)
            .unwrap()
            .transaction
            .id;
        engine.add_item(tx_id, coffee, dec!(1), None, None).unwrap();

        let finished = engine
            .finish(
                tx_id,
                PaymentData {
                    payment_type: "CASH".into(),
                    amount: dec!(3.00),
                },
                None,
            )
            .unwrap();

        assert_eq!(finished.transaction.status, TransactionStatus::Finished);
        assert_eq!(finished.print_status["failed"], true);

        let conn = engine.db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM operational_log WHERE event_type = 'print_failed'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_resolve_pending_reserved_paths() {
        let engine = test_engine();
        seed_catalog(&engine);
        let tx_id = engine
            .find_or_create(FindOrCreateCriteria::default(), None)
            .unwrap()
            .transaction
            .id;
        {
            let conn = engine.db.conn.lock().unwrap();
            conn.execute(
                "UPDATE active_transactions SET resolution_status = 'pending' WHERE id = ?1",
                params![tx_id],
            )
            .unwrap();
        }

        assert!(matches!(
            engine.resolve_pending(tx_id, "cancel", None),
            Err(PosError::NotImplemented(_))
        ));
        assert!(matches!(
            engine.resolve_pending(tx_id, "fiscalize", None),
            Err(PosError::NotImplemented(_))
        ));
        assert!(matches!(
            engine.resolve_pending(tx_id, "shrug", None),
            Err(PosError::Validation(_))
        ));

        let resolved = engine.resolve_pending(tx_id, "postpone", None).unwrap();
        assert_eq!(
            resolved.transaction.resolution_status,
            ResolutionStatus::Postponed
        );
        let types = fiscal_event_types(&engine, &resolved.transaction.uuid);
        assert!(types.contains(&"postponeTransaction".to_string()));
    }

    #[test]
    fn test_item_line_sum_invariant_after_finish() {
        let engine = test_engine();
        let (coffee, widget) = seed_catalog(&engine);

        let tx_id = engine
            .find_or_create(FindOrCreateCriteria::default(), None)
            .unwrap()
            .transaction
            .id;
        engine.add_item(tx_id, coffee, dec!(2), None, None).unwrap();
        let added = engine.add_item(tx_id, widget, dec!(1), None, None).unwrap();
        let widget_line = added.items[1].id;
        engine
            .update_item_price(tx_id, widget_line, dec!(8.00), None, false)
            .unwrap();

        let finished = engine
            .finish(
                tx_id,
                PaymentData {
                    payment_type: "CASH".into(),
                    amount: dec!(14.00),
                },
                None,
            )
            .unwrap();

        let total: Decimal = finished.items.iter().map(|l| l.total_price).sum();
        let tax: Decimal = finished.items.iter().map(|l| l.tax_amount).sum();
        assert_eq!(total, finished.transaction.total_amount);
        assert_eq!(tax, finished.transaction.tax_amount);
        assert_eq!(
            finished.process_data,
            "Beleg^6.00_8.00_0.00_0.00_0.00^14.00:CASH"
        );
    }

    #[test]
    fn test_custom_price_item_notes() {
        let engine = test_engine();
        let (coffee, _) = seed_catalog(&engine);

        let tx_id = engine
            .find_or_create(FindOrCreateCriteria::default(), None)
            .unwrap()
            .transaction
            .id;
        let outcome = engine
            .add_custom_price_item(tx_id, coffee, dec!(1), dec!(2.50), None)
            .unwrap();
        assert_eq!(outcome.items[0].unit_price, dec!(2.50));
        assert_eq!(outcome.items[0].notes.as_deref(), Some("Custom price: 2.50"));
    }

    #[test]
    fn test_reprint_requires_finished() {
        let engine = test_engine();
        seed_catalog(&engine);
        let tx_id = engine
            .find_or_create(FindOrCreateCriteria::default(), None)
            .unwrap()
            .transaction
            .id;
        assert!(matches!(
            engine.reprint_receipt(tx_id, None),
            Err(PosError::InvalidState(_))
        ));
    }
}
