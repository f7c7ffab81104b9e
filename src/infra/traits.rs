//! Storage and collaborator seams of the compliance ledger

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use uuid::Uuid;

use crate::domain::{
    CertificateMaterial, ChainHead, ChainLink, ComplianceRecord, DeliveryStats, FailureKind,
    InvoiceId, InvoiceSnapshot, TenantHalt, TenantId, TenantIdentity,
};

use super::Result;

/// Filter for records the recovery engine may redrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryQuery {
    /// Only records last touched before this instant (cooldown).
    pub updated_before: DateTime<Utc>,
    /// Failure kinds eligible for automatic retry.
    pub kinds: Vec<FailureKind>,
    /// Resume after this record in `(updated_at, id)` order.
    pub after: Option<RetryCursor>,
    pub limit: u32,
}

/// Position of a record in the retry listing order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCursor {
    pub updated_at: DateTime<Utc>,
    pub record_id: Uuid,
}

impl RetryCursor {
    pub fn after(record: &ComplianceRecord) -> Self {
        Self {
            updated_at: record.updated_at,
            record_id: record.id,
        }
    }
}

/// Delivery ledger: one record per invoice plus each tenant's append-only chain.
///
/// Invariants:
/// - Links are appended only at the current head (`append_link` is a
///   compare-and-swap on the head).
/// - No two links of a tenant share a `previous_digest`.
/// - An `accepted` record is never overwritten.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Current head of the tenant's chain (genesis when empty)
    async fn chain_head(&self, tenant_id: &TenantId) -> Result<ChainHead>;

    async fn chain_link(&self, tenant_id: &TenantId, seq: u64) -> Result<Option<ChainLink>>;

    /// Links with `seq > after_seq`, ascending
    async fn chain_links(
        &self,
        tenant_id: &TenantId,
        after_seq: u64,
        limit: u32,
    ) -> Result<Vec<ChainLink>>;

    /// Append `link` and upsert `record` atomically if the head still equals
    /// `expected_head`. Fails with `ChainHeadMoved` otherwise.
    async fn append_link(
        &self,
        expected_head: &ChainHead,
        link: &ChainLink,
        record: &ComplianceRecord,
    ) -> Result<()>;

    /// Upsert keyed by invoice. Refuses to overwrite an accepted record.
    async fn save_record(&self, record: &ComplianceRecord) -> Result<()>;

    async fn find_by_invoice(&self, invoice_id: &InvoiceId) -> Result<Option<ComplianceRecord>>;

    /// Failed, non-escalated records of non-halted tenants, ordered by
    /// `(updated_at, id)`
    async fn list_retryable(&self, query: &RetryQuery) -> Result<Vec<ComplianceRecord>>;

    /// `pending`/`submitted` records of non-halted tenants older than the cutoff
    async fn list_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ComplianceRecord>>;

    async fn mark_escalated(&self, invoice_id: &InvoiceId, at: DateTime<Utc>) -> Result<()>;

    async fn stats(&self, tenant_id: &TenantId) -> Result<DeliveryStats>;

    async fn halt_tenant(&self, tenant_id: &TenantId, reason: &str) -> Result<()>;

    /// Returns false when the tenant was not halted
    async fn resume_tenant(&self, tenant_id: &TenantId) -> Result<bool>;

    async fn tenant_halt(&self, tenant_id: &TenantId) -> Result<Option<TenantHalt>>;
}

/// At most one active certificate per tenant.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn get_certificate(&self, tenant_id: &TenantId) -> Result<Option<CertificateMaterial>>;

    /// Insert or replace the tenant's certificate
    async fn put_certificate(&self, material: &CertificateMaterial) -> Result<()>;

    async fn delete_certificate(&self, tenant_id: &TenantId) -> Result<bool>;
}

/// Read side of the invoicing application.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InvoiceDirectory: Send + Sync {
    async fn invoice(&self, invoice_id: &InvoiceId) -> Result<Option<InvoiceSnapshot>>;

    async fn tenant_identity(&self, tenant_id: &TenantId) -> Result<Option<TenantIdentity>>;

    /// Invoices not yet reported compliant, oldest first, starting after
    /// `after` when given. Implementations that can see the ledger also
    /// leave out invoices that already have a record and tenants that
    /// cannot deliver.
    async fn unreported_invoices(
        &self,
        after: Option<InvoiceId>,
        limit: u32,
    ) -> Result<Vec<InvoiceSnapshot>>;

    /// Flag the invoice as compliantly issued
    async fn mark_compliant(&self, invoice_id: &InvoiceId, confirmation_code: &str) -> Result<()>;
}
