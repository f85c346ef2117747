//! Exact money math and fiscal amount formatting.
//!
//! All monetary values are `rust_decimal::Decimal` end to end and persist as
//! TEXT columns. Binary floats appear nowhere in the money path; the 0.001
//! payment tolerance applies only at the payment comparison site in the
//! transaction engine.

use rust_decimal::Decimal;
use tracing::warn;

/// Tolerance for comparing a tendered payment against the transaction total.
pub fn payment_tolerance() -> Decimal {
    // 10^-3 currency units
    Decimal::new(1, 3)
}

/// The fixed DSFinV-K gross bucket order for `processData`:
/// 19.00, 7.00, 10.70, 5.50, 0.00.
pub fn fiscal_tax_buckets() -> [Decimal; 5] {
    [
        Decimal::new(1900, 2),
        Decimal::new(700, 2),
        Decimal::new(1070, 2),
        Decimal::new(550, 2),
        Decimal::ZERO,
    ]
}

/// Round to accounting precision (2 fractional digits, banker-free).
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp(2)
}

/// Format with exactly two fractional digits and a dot separator.
pub fn fmt2(value: Decimal) -> String {
    format!("{:.2}", value)
}

/// Tax portion contained in a gross amount at the given percent rate:
/// `total − total / (1 + rate/100)`, kept at six fractional digits.
pub fn tax_portion(gross: Decimal, rate_percent: Decimal) -> Decimal {
    let divisor = Decimal::ONE + rate_percent / Decimal::ONE_HUNDRED;
    if divisor.is_zero() {
        return Decimal::ZERO;
    }
    (gross - gross / divisor).round_dp(6)
}

// ---------------------------------------------------------------------------
// Tax rate selection
// ---------------------------------------------------------------------------

/// Category-type → tax-rate mapping, chosen at engine construction time.
///
/// The two-rate default (`drink` → 19 %, everything else → 7 %) is a
/// configuration default, not a contract; deployments override entries via
/// `KASSA_TAX_RULES`.
#[derive(Debug, Clone)]
pub struct TaxRules {
    entries: Vec<(String, Decimal)>,
    fallback: Decimal,
}

impl TaxRules {
    /// The default German restaurant mapping.
    pub fn default_rules() -> Self {
        TaxRules {
            entries: vec![("drink".to_string(), Decimal::new(1900, 2))],
            fallback: Decimal::new(700, 2),
        }
    }

    /// Default mapping with per-category-type overrides applied on top.
    pub fn with_overrides(overrides: &[(String, Decimal)]) -> Self {
        let mut rules = Self::default_rules();
        for (category_type, rate) in overrides {
            if let Some(entry) = rules
                .entries
                .iter_mut()
                .find(|(k, _)| k == category_type)
            {
                entry.1 = *rate;
            } else {
                rules.entries.push((category_type.clone(), *rate));
            }
        }
        rules
    }

    /// Rate (in percent) for a catalog category type such as `drink`.
    pub fn rate_for(&self, category_type: &str) -> Decimal {
        self.entries
            .iter()
            .find(|(k, _)| k == category_type)
            .map(|(_, r)| *r)
            .unwrap_or(self.fallback)
    }
}

// ---------------------------------------------------------------------------
// processData
// ---------------------------------------------------------------------------

/// Build the bit-exact fiscal `processData` string:
/// `Beleg^<g19>_<g7>_<g10.7>_<g5.5>_<g0>^<amount>:<payment_type>`.
///
/// `breakdown` holds `(tax_rate, gross_total)` pairs as produced by the
/// repository's tax-breakdown query. Rates are matched against the fixed
/// buckets by value with a half-cent tolerance; a rate outside every bucket
/// folds into the 0 % bucket so the gross total is never dropped.
pub fn format_process_data(
    breakdown: &[(Decimal, Decimal)],
    payment_amount: Decimal,
    payment_type: &str,
) -> String {
    let buckets = fiscal_tax_buckets();
    let tolerance = Decimal::new(5, 3);
    let mut gross = [Decimal::ZERO; 5];

    for (rate, total) in breakdown {
        let slot = buckets
            .iter()
            .position(|b| (*rate - *b).abs() < tolerance)
            .unwrap_or_else(|| {
                warn!(rate = %rate, "Tax rate outside fiscal buckets; folding into 0%");
                buckets.len() - 1
            });
        gross[slot] += *total;
    }

    let bucket_str = gross
        .iter()
        .map(|g| fmt2(round2(*g)))
        .collect::<Vec<_>>()
        .join("_");

    format!(
        "Beleg^{}^{}:{}",
        bucket_str,
        fmt2(round2(payment_amount)),
        payment_type
    )
}

// ===========================================================================
// Tests
// ===========================================================================
