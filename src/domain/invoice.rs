//! Invoice snapshot as handed over by the invoicing application.
//!
//! Snapshots are read-only inputs taken at delivery time. Amounts are exact
//! decimals; tax rates are percentages (`21` means 21%).

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::{InvoiceId, TenantId};

/// Number of decimals used for every monetary amount on the wire.
pub const CURRENCY_DECIMALS: u32 = 2;

/// Round an amount to currency precision (half away from zero).
pub fn round_currency(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(CURRENCY_DECIMALS, RoundingStrategy::MidpointAwayFromZero)
}

/// Format an amount with exactly two decimals, e.g. `121.00`.
pub fn format_amount(value: Decimal) -> String {
    let mut rounded = round_currency(value);
    if rounded.is_zero() {
        rounded.set_sign_positive(true);
    }
    rounded.rescale(CURRENCY_DECIMALS);
    rounded.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparty {
    pub tax_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// Percentage applied to the line's taxable base.
    pub tax_rate: Decimal,
}

impl LineItem {
    /// Quantity times unit price, rounded to currency precision.
    pub fn taxable_base(&self) -> Decimal {
        round_currency(self.quantity * self.unit_price)
    }

    pub fn tax_amount(&self) -> Decimal {
        round_currency(self.taxable_base() * self.tax_rate / Decimal::ONE_HUNDRED)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSnapshot {
    pub invoice_id: InvoiceId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub series: String,
    pub number: String,
    pub issue_date: Option<NaiveDate>,
    #[serde(default)]
    pub counterparty: Option<Counterparty>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub lines: Vec<LineItem>,
    /// Total computed by the invoicing application.
    pub total: Option<Decimal>,
}

impl InvoiceSnapshot {
    /// Series and number as they appear on the issued invoice.
    pub fn document_number(&self) -> String {
        let series = self.series.trim();
        let number = self.number.trim();
        if series.is_empty() {
            number.to_string()
        } else {
            format!("{series}-{number}")
        }
    }

    pub fn counterparty_tax_id(&self) -> &str {
        self.counterparty
            .as_ref()
            .map(|c| c.tax_id.trim())
            .unwrap_or("")
    }
}

/// Legal identity of the issuing tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantIdentity {
    pub tenant_id: TenantId,
    pub legal_name: String,
    pub tax_id: String,
}
