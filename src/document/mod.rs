//! Record composer
//!
//! Renders the fixed-schema registration document for one invoice. The
//! output is a pure function of the invoice snapshot, the tenant identity
//! and the chain linkage, so a stored unsigned document can always be
//! re-derived and compared during an audit.

pub mod xml;

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::crypto::chain::FIELD_SEPARATOR;
use crate::domain::{
    format_amount, round_currency, ChainPayload, InvoiceSnapshot, TenantIdentity,
};
use crate::infra::{LedgerError, Result};

use xml::XmlWriter;

pub const DOCUMENT_NAMESPACE: &str = "urn:compliance-ledger:registro:1.0";
pub const DOCUMENT_VERSION: &str = "1.0";
pub const DIGEST_ALGORITHM: &str = "HMAC-SHA256";
const PREFIX: &str = "sf";

/// Invoice type: full invoice with an identified recipient, or simplified.
pub const INVOICE_TYPE_FULL: &str = "F1";
pub const INVOICE_TYPE_SIMPLIFIED: &str = "F2";

/// Identifies the software that produced the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareInfo {
    pub name: String,
    pub version: String,
}

impl Default for SoftwareInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Taxable base and tax amount of one tax rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxBreakdown {
    pub rate: Decimal,
    pub base: Decimal,
    pub tax: Decimal,
}

/// Group line items by tax rate, ascending. Bases and taxes are summed
/// independently within each group.
pub fn tax_breakdown(invoice: &InvoiceSnapshot) -> Vec<TaxBreakdown> {
    let mut groups: BTreeMap<Decimal, (Decimal, Decimal)> = BTreeMap::new();
    for line in &invoice.lines {
        let entry = groups
            .entry(line.tax_rate.normalize())
            .or_insert((Decimal::ZERO, Decimal::ZERO));
        entry.0 += line.taxable_base();
        entry.1 += line.tax_amount();
    }
    groups
        .into_iter()
        .map(|(rate, (base, tax))| TaxBreakdown {
            rate,
            base: round_currency(base),
            tax: round_currency(tax),
        })
        .collect()
}

/// Check the invoice and tenant carry everything the document and the chain
/// digest need, and return the chain payload.
pub fn validate(invoice: &InvoiceSnapshot, tenant: &TenantIdentity) -> Result<ChainPayload> {
    let mut missing = Vec::new();
    if tenant.tax_id.trim().is_empty() {
        missing.push("issuer_tax_id");
    }
    if invoice.number.trim().is_empty() {
        missing.push("invoice_number");
    }
    if invoice.issue_date.is_none() {
        missing.push("issue_date");
    }
    if invoice.total.is_none() {
        missing.push("total");
    }
    if !missing.is_empty() {
        return Err(LedgerError::IncompleteInvoice { missing });
    }

    if invoice.tenant_id != tenant.tenant_id {
        return Err(LedgerError::Validation(format!(
            "invoice {} belongs to tenant {}, not {}",
            invoice.invoice_id, invoice.tenant_id, tenant.tenant_id
        )));
    }

    let payload = ChainPayload::from_invoice(invoice)
        .ok_or_else(|| LedgerError::Internal("chain payload incomplete after validation".into()))?;

    for (field, value) in [
        ("invoice_number", payload.document_number.as_str()),
        ("counterparty_tax_id", payload.counterparty_tax_id.as_str()),
    ] {
        if value.contains(FIELD_SEPARATOR) {
            return Err(LedgerError::Validation(format!(
                "{field} must not contain '{FIELD_SEPARATOR}'"
            )));
        }
    }

    if let Some(counterparty) = &invoice.counterparty {
        if counterparty.tax_id.trim().is_empty() {
            return Err(LedgerError::Validation(
                "counterparty is present but has no tax id".to_string(),
            ));
        }
    }

    for (index, line) in invoice.lines.iter().enumerate() {
        if line.tax_rate < Decimal::ZERO || line.tax_rate > Decimal::ONE_HUNDRED {
            return Err(LedgerError::Validation(format!(
                "line {index}: tax rate {} is outside 0..=100",
                line.tax_rate
            )));
        }
    }

    Ok(payload)
}

/// Renders registration documents.
#[derive(Debug, Clone, Default)]
pub struct RecordComposer {
    software: SoftwareInfo,
}

impl RecordComposer {
    pub fn new(software: SoftwareInfo) -> Self {
        Self { software }
    }

    pub fn software(&self) -> &SoftwareInfo {
        &self.software
    }

    pub fn compose(
        &self,
        invoice: &InvoiceSnapshot,
        tenant: &TenantIdentity,
        digest: &str,
        previous_digest: &str,
    ) -> Result<String> {
        let payload = validate(invoice, tenant)?;
        let [document_number, issue_date, total, _] = payload.canonical_fields();
        let breakdown = tax_breakdown(invoice);
        let tax_total: Decimal = breakdown.iter().map(|b| b.tax).sum();

        let mut w = XmlWriter::new(PREFIX);
        w.raw("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        w.raw(&format!(
            "<{PREFIX}:RegistroAlta xmlns:{PREFIX}=\"{DOCUMENT_NAMESPACE}\">\n"
        ));
        w.text("IDVersion", DOCUMENT_VERSION);

        w.open("IDFactura")
            .text("IDEmisorFactura", tenant.tax_id.trim())
            .text("NumSerieFactura", &document_number)
            .text("FechaExpedicionFactura", &issue_date)
            .close("IDFactura");
        w.text("NombreRazonEmisor", &tenant.legal_name);

        match &invoice.counterparty {
            Some(counterparty) => {
                w.text("TipoFactura", INVOICE_TYPE_FULL);
                w.open("Destinatarios")
                    .open("IDDestinatario")
                    .text("NombreRazon", &counterparty.name)
                    .text("NIF", counterparty.tax_id.trim())
                    .close("IDDestinatario")
                    .close("Destinatarios");
            }
            None => {
                w.text("TipoFactura", INVOICE_TYPE_SIMPLIFIED);
            }
        }
        if let Some(description) = invoice.description.as_deref().filter(|d| !d.trim().is_empty()) {
            w.text("DescripcionOperacion", description);
        }

        if !breakdown.is_empty() {
            w.open("Desglose");
            for group in &breakdown {
                w.open("DetalleDesglose")
                    .text("TipoImpositivo", &format_amount(group.rate))
                    .text("BaseImponible", &format_amount(group.base))
                    .text("CuotaRepercutida", &format_amount(group.tax))
                    .close("DetalleDesglose");
            }
            w.close("Desglose");
        }
        w.text("CuotaTotal", &format_amount(tax_total));
        w.text("ImporteTotal", &total);

        w.open("Encadenamiento");
        if previous_digest.is_empty() {
            w.text("PrimerRegistro", "S");
        } else {
            w.open("RegistroAnterior")
                .text("Huella", previous_digest)
                .close("RegistroAnterior");
        }
        w.close("Encadenamiento");

        w.open("SistemaInformatico")
            .text("NombreSistemaInformatico", &self.software.name)
            .text("Version", &self.software.version)
            .close("SistemaInformatico");

        w.text("AlgoritmoHuella", DIGEST_ALGORITHM);
        w.text("Huella", digest);
        w.raw(&format!("</{PREFIX}:RegistroAlta>"));

        Ok(w.finish())
    }
}

/// Text content of the first `sf:<name>` element, unescaped.
pub fn field(document: &str, name: &str) -> Option<String> {
    let open = format!("<{PREFIX}:{name}>");
    let close = format!("</{PREFIX}:{name}>");
    let start = document.find(&open)? + open.len();
    let end = start + document[start..].find(&close)?;
    Some(xml::unescape(&document[start..end]))
}
