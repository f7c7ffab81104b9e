//! Compliance records, chain links and the delivery state machine.
//!
//! A record moves `pending -> submitted -> {accepted | rejected | error}`.
//! `rejected` and `error` can be re-chained back to `pending`; `accepted`
//! is terminal and never reverts.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{format_amount, InvoiceId, InvoiceSnapshot, TenantId};

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Submitted,
    Accepted,
    Rejected,
    Error,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 5] = [
        RecordStatus::Pending,
        RecordStatus::Submitted,
        RecordStatus::Accepted,
        RecordStatus::Rejected,
        RecordStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Submitted => "submitted",
            RecordStatus::Accepted => "accepted",
            RecordStatus::Rejected => "rejected",
            RecordStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecordStatus::Pending),
            "submitted" => Some(RecordStatus::Submitted),
            "accepted" => Some(RecordStatus::Accepted),
            "rejected" => Some(RecordStatus::Rejected),
            "error" => Some(RecordStatus::Error),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RecordStatus::Rejected | RecordStatus::Error)
    }

    /// `pending` and `submitted` are in flight: the outcome is not yet known.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, RecordStatus::Pending | RecordStatus::Submitted)
    }

    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        match (self, next) {
            (Accepted, _) => false,
            (Pending, Submitted | Error) => true,
            (Submitted, Accepted | Rejected | Error) => true,
            (Rejected | Error, Pending | Submitted | Rejected | Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record ended up in `rejected` or `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network failure, timeout, non-success status or unknown outcome.
    Authority,
    /// The authority answered and refused the record.
    Rejected,
    /// The invoice could not be composed.
    Validation,
    /// Missing, expired or undecryptable certificate.
    Certificate,
    Signing,
    /// Stopped by a chain integrity halt. Re-driven once the tenant resumes.
    ChainIntegrity,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Authority => "authority",
            FailureKind::Rejected => "rejected",
            FailureKind::Validation => "validation",
            FailureKind::Certificate => "certificate",
            FailureKind::Signing => "signing",
            FailureKind::ChainIntegrity => "chain_integrity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authority" => Some(FailureKind::Authority),
            "rejected" => Some(FailureKind::Rejected),
            "validation" => Some(FailureKind::Validation),
            "certificate" => Some(FailureKind::Certificate),
            "signing" => Some(FailureKind::Signing),
            "chain_integrity" => Some(FailureKind::ChainIntegrity),
            _ => None,
        }
    }

    /// Kinds the recovery engine re-drives without tenant action.
    pub fn auto_retryable(retry_rejected: bool) -> Vec<FailureKind> {
        let mut kinds = vec![FailureKind::Authority, FailureKind::ChainIntegrity];
        if retry_rejected {
            kinds.push(FailureKind::Rejected);
        }
        kinds
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status transition from {from} to {to}")]
pub struct TransitionError {
    pub from: RecordStatus,
    pub to: RecordStatus,
}

// ============================================================================
// Authority result
// ============================================================================

/// Outcome of one submission, as interpreted from the authority's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityResult {
    pub success: bool,
    pub code: String,
    pub message: String,
    pub confirmation_code: Option<String>,
    pub raw_response: Option<String>,
}

/// Codes produced locally when the authority could not be reached.
pub mod transport_codes {
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const HTTP_STATUS_PREFIX: &str = "HTTP_";
    pub const OUTCOME_UNKNOWN: &str = "OUTCOME_UNKNOWN";
}

impl AuthorityResult {
    pub fn accepted(code: impl Into<String>, confirmation_code: impl Into<String>) -> Self {
        Self {
            success: true,
            code: code.into(),
            message: "accepted".to_string(),
            confirmation_code: Some(confirmation_code.into()),
            raw_response: None,
        }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code: code.into(),
            message: message.into(),
            confirmation_code: None,
            raw_response: None,
        }
    }

    pub fn transport_failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::rejected(code, message)
    }

    pub fn with_raw_response(mut self, raw: impl Into<String>) -> Self {
        self.raw_response = Some(raw.into());
        self
    }

    /// True when the failure happened before the authority gave a verdict.
    pub fn is_transport_failure(&self) -> bool {
        !self.success
            && (self.code == transport_codes::NETWORK_ERROR
                || self.code == transport_codes::TIMEOUT
                || self.code == transport_codes::CIRCUIT_OPEN
                || self.code == transport_codes::OUTCOME_UNKNOWN
                || self.code.starts_with(transport_codes::HTTP_STATUS_PREFIX))
    }

    /// Status the record takes after this result.
    pub fn resulting_status(&self) -> RecordStatus {
        if self.success {
            RecordStatus::Accepted
        } else if self.is_transport_failure() {
            RecordStatus::Error
        } else {
            RecordStatus::Rejected
        }
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Business fields covered by the chain digest, in canonical order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPayload {
    pub document_number: String,
    pub issue_date: NaiveDate,
    pub total: Decimal,
    pub counterparty_tax_id: String,
}

impl ChainPayload {
    /// Returns `None` when the invoice lacks a date or total.
    pub fn from_invoice(invoice: &InvoiceSnapshot) -> Option<Self> {
        Some(Self {
            document_number: invoice.document_number(),
            issue_date: invoice.issue_date?,
            total: invoice.total?,
            counterparty_tax_id: invoice.counterparty_tax_id().to_string(),
        })
    }

    /// Canonical field values in digest order.
    pub fn canonical_fields(&self) -> [String; 4] {
        [
            self.document_number.clone(),
            self.issue_date.format("%d-%m-%Y").to_string(),
            format_amount(self.total),
            self.counterparty_tax_id.clone(),
        ]
    }
}

/// One entry of a tenant's append-only chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub tenant_id: TenantId,
    pub seq: u64,
    pub invoice_id: InvoiceId,
    pub record_id: Uuid,
    pub digest: String,
    pub previous_digest: String,
    pub payload: ChainPayload,
    pub created_at: DateTime<Utc>,
}

/// Latest link of a tenant's chain. `seq == 0` means the chain is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub tenant_id: TenantId,
    pub seq: u64,
    pub digest: String,
}

impl ChainHead {
    pub fn genesis(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            seq: 0,
            digest: String::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.seq == 0
    }
}

/// A tenant whose automatic processing was stopped after an integrity failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantHalt {
    pub tenant_id: TenantId,
    pub halted_at: DateTime<Utc>,
    pub reason: String,
}

// ============================================================================
// Record
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub invoice: InvoiceSnapshot,
    /// Sequence of the record's latest chain link.
    pub chain_seq: Option<u64>,
    pub digest: String,
    pub previous_digest: String,
    pub unsigned_document: Option<String>,
    pub signed_document: Option<String>,
    pub authority_response: Option<AuthorityResult>,
    pub status: RecordStatus,
    pub failure_kind: Option<FailureKind>,
    pub confirmation_code: Option<String>,
    pub qr_payload: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComplianceRecord {
    pub fn new(invoice: InvoiceSnapshot) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: invoice.tenant_id,
            invoice_id: invoice.invoice_id,
            invoice,
            chain_seq: None,
            digest: String::new(),
            previous_digest: String::new(),
            unsigned_document: None,
            signed_document: None,
            authority_response: None,
            status: RecordStatus::Pending,
            failure_kind: None,
            confirmation_code: None,
            qr_payload: None,
            sent_at: None,
            retry_count: 0,
            error_message: None,
            escalated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: RecordStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Attach the record to a freshly appended link.
    ///
    /// A failed record re-entering the chain counts as a retry. Fresh records
    /// (never chained) stay `pending`.
    pub fn chain(
        &mut self,
        link: &ChainLink,
        invoice: InvoiceSnapshot,
        unsigned_document: String,
    ) -> Result<(), TransitionError> {
        if self.status.is_failure() {
            self.transition(RecordStatus::Pending)?;
            self.retry_count += 1;
        } else if self.status != RecordStatus::Pending {
            return Err(TransitionError {
                from: self.status,
                to: RecordStatus::Pending,
            });
        }

        self.invoice = invoice;
        self.chain_seq = Some(link.seq);
        self.digest = link.digest.clone();
        self.previous_digest = link.previous_digest.clone();
        self.unsigned_document = Some(unsigned_document);
        self.signed_document = None;
        self.authority_response = None;
        self.failure_kind = None;
        self.confirmation_code = None;
        self.qr_payload = None;
        self.sent_at = None;
        self.error_message = None;
        self.escalated_at = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_submitted(
        &mut self,
        signed_document: String,
        sent_at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(RecordStatus::Submitted)?;
        self.signed_document = Some(signed_document);
        self.sent_at = Some(sent_at);
        Ok(())
    }

    /// Apply an authority verdict. `verification_payload` is only used on acceptance.
    pub fn apply_authority_result(
        &mut self,
        result: AuthorityResult,
        verification_payload: Option<String>,
    ) -> Result<(), TransitionError> {
        let next = result.resulting_status();
        self.transition(next)?;
        match next {
            RecordStatus::Accepted => {
                self.confirmation_code = result.confirmation_code.clone();
                self.qr_payload = verification_payload;
                self.failure_kind = None;
                self.error_message = None;
            }
            RecordStatus::Rejected => {
                self.failure_kind = Some(FailureKind::Rejected);
                self.error_message = Some(format!("{}: {}", result.code, result.message));
            }
            _ => {
                self.failure_kind = Some(FailureKind::Authority);
                self.error_message = Some(format!("{}: {}", result.code, result.message));
            }
        }
        self.authority_response = Some(result);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.transition(RecordStatus::Error)?;
        self.failure_kind = Some(kind);
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn is_accepted(&self) -> bool {
        self.status == RecordStatus::Accepted
    }
}

// ============================================================================
// Views
// ============================================================================

/// Per-tenant counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub pending: u64,
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub error: u64,
    /// Failed records past the retry ceiling.
    pub escalated: u64,
}

impl DeliveryStats {
    pub fn total(&self) -> u64 {
        self.pending + self.submitted + self.accepted + self.rejected + self.error
    }

    pub fn add(&mut self, status: RecordStatus, count: u64) {
        match status {
            RecordStatus::Pending => self.pending += count,
            RecordStatus::Submitted => self.submitted += count,
            RecordStatus::Accepted => self.accepted += count,
            RecordStatus::Rejected => self.rejected += count,
            RecordStatus::Error => self.error += count,
        }
    }
}

/// Delivery status of one invoice as shown to the invoicing application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatusView {
    pub invoice_id: InvoiceId,
    pub status: RecordStatus,
    pub confirmation_code: Option<String>,
    pub verification_payload: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub escalated: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<&ComplianceRecord> for DeliveryStatusView {
    fn from(record: &ComplianceRecord) -> Self {
        Self {
            invoice_id: record.invoice_id,
            status: record.status,
            confirmation_code: record.confirmation_code.clone(),
            verification_payload: record.qr_payload.clone(),
            retry_count: record.retry_count,
            last_error: record.error_message.clone(),
            escalated: record.escalated_at.is_some(),
            updated_at: record.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn invoice() -> InvoiceSnapshot {
        InvoiceSnapshot {
            invoice_id: InvoiceId::new(),
            tenant_id: TenantId::new(),
            series: "F".to_string(),
            number: "1".to_string(),
            issue_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            counterparty: None,
            description: None,
            lines: vec![],
            total: Some(dec!(121)),
        }
    }

    fn link_for(record: &ComplianceRecord, seq: u64, prev: &str, digest: &str) -> ChainLink {
        ChainLink {
            tenant_id: record.tenant_id,
            seq,
            invoice_id: record.invoice_id,
            record_id: record.id,
            digest: digest.to_string(),
            previous_digest: prev.to_string(),
            payload: ChainPayload::from_invoice(&record.invoice).unwrap(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn accepted_is_terminal() {
        for next in RecordStatus::ALL {
            assert!(!RecordStatus::Accepted.can_transition_to(next));
        }
    }

    #[test]
    fn pending_cannot_skip_submission() {
        assert!(!RecordStatus::Pending.can_transition_to(RecordStatus::Accepted));
        assert!(!RecordStatus::Pending.can_transition_to(RecordStatus::Rejected));
        assert!(RecordStatus::Pending.can_transition_to(RecordStatus::Error));
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in RecordStatus::ALL {
            assert_eq!(RecordStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RecordStatus::parse("done"), None);
    }

    #[test]
    fn transport_failures_become_error_and_verdicts_become_rejected() {
        let timeout = AuthorityResult::transport_failure(transport_codes::TIMEOUT, "slow");
        assert_eq!(timeout.resulting_status(), RecordStatus::Error);

        let http = AuthorityResult::transport_failure("HTTP_503", "unavailable");
        assert_eq!(http.resulting_status(), RecordStatus::Error);

        let verdict = AuthorityResult::rejected("4102", "bad tax id");
        assert_eq!(verdict.resulting_status(), RecordStatus::Rejected);

        let ok = AuthorityResult::accepted("OK", "CSV123");
        assert_eq!(ok.resulting_status(), RecordStatus::Accepted);
    }

    #[test]
    fn rechaining_a_failed_record_counts_a_retry() {
        let mut record = ComplianceRecord::new(invoice());
        let first = link_for(&record, 1, "", "AA");
        record
            .chain(&first, record.invoice.clone(), "<doc/>".into())
            .unwrap();
        assert_eq!(record.retry_count, 0);

        record
            .mark_submitted("<signed/>".into(), Utc::now())
            .unwrap();
        record
            .apply_authority_result(AuthorityResult::rejected("4102", "nope"), None)
            .unwrap();
        assert_eq!(record.status, RecordStatus::Rejected);
        assert_eq!(record.failure_kind, Some(FailureKind::Rejected));

        let second = link_for(&record, 3, "BB", "CC");
        record
            .chain(&second, record.invoice.clone(), "<doc2/>".into())
            .unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.previous_digest, "BB");
        assert_eq!(record.chain_seq, Some(3));
        assert!(record.signed_document.is_none());
        assert!(record.error_message.is_none());
    }

    #[test]
    fn accepted_record_cannot_be_rechained() {
        let mut record = ComplianceRecord::new(invoice());
        let link = link_for(&record, 1, "", "AA");
        record
            .chain(&link, record.invoice.clone(), "<doc/>".into())
            .unwrap();
        record.mark_submitted("<s/>".into(), Utc::now()).unwrap();
        record
            .apply_authority_result(
                AuthorityResult::accepted("OK", "CSV1"),
                Some("https://verify".into()),
            )
            .unwrap();

        let err = record
            .chain(&link, record.invoice.clone(), "<doc/>".into())
            .unwrap_err();
        assert_eq!(err.from, RecordStatus::Accepted);
        assert!(record.mark_failed(FailureKind::Authority, "x").is_err());
        assert_eq!(record.confirmation_code.as_deref(), Some("CSV1"));
    }

    #[test]
    fn stats_total_ignores_escalated_overlay() {
        let mut stats = DeliveryStats::default();
        stats.add(RecordStatus::Accepted, 3);
        stats.add(RecordStatus::Error, 2);
        stats.escalated = 1;
        assert_eq!(stats.total(), 5);
    }

    #[test]
    fn chain_payload_requires_date_and_total() {
        let mut inv = invoice();
        inv.total = None;
        assert!(ChainPayload::from_invoice(&inv).is_none());

        let payload = ChainPayload::from_invoice(&invoice()).unwrap();
        assert_eq!(
            payload.canonical_fields(),
            [
                "F-1".to_string(),
                "01-03-2025".to_string(),
                "121.00".to_string(),
                String::new()
            ]
        );
    }
}
