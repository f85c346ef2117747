//! Receipt printer collaborator.
//!
//! Physical rendering is out of scope for the core; the engine only needs a
//! narrow interface it can hand a finished receipt to. Print failures are
//! always non-fatal: the caller records a `print_failed` operational event
//! and reports `printStatus.failed` to the client.

use serde_json::Value;
use tracing::info;

use crate::error::PosResult;

/// Narrow interface to whatever renders receipts.
pub trait ReceiptPrinter: Send + Sync {
    fn print_receipt(&self, receipt: &Value) -> PosResult<()>;
}

/// Default collaborator: logs the receipt hand-off and succeeds.
pub struct LogPrinter;

impl ReceiptPrinter for LogPrinter {
    fn print_receipt(&self, receipt: &Value) -> PosResult<()> {
        let uuid = receipt
            .get("uuid")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(transaction_uuid = uuid, "Receipt handed to printer");
        Ok(())
    }
}

/// Printer that always fails; lets tests exercise the `print_failed` path.
#[cfg(test)]
pub struct FailingPrinter;

#[cfg(test)]
impl ReceiptPrinter for FailingPrinter {
    fn print_receipt(&self, _receipt: &Value) -> PosResult<()> {
        Err(crate::error::PosError::ExternalTimeout(
            "printer offline".into(),
        ))
    }
}
