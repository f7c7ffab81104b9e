//! Invoice inbox on PostgreSQL
//!
//! The invoicing application publishes snapshots and tenant identities into
//! `ledger_invoices` / `ledger_tenants`; the ledger reads them and flags
//! invoices once they are compliantly reported.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::domain::{InvoiceId, InvoiceSnapshot, TenantId, TenantIdentity};
use crate::infra::{InvoiceDirectory, Result};

#[derive(Clone)]
pub struct PgInvoiceDirectory {
    pool: PgPool,
}

impl PgInvoiceDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or refresh an invoice snapshot. Compliance flags are kept.
    pub async fn publish_invoice(&self, invoice: &InvoiceSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_invoices (invoice_id, tenant_id, snapshot, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (invoice_id) DO UPDATE SET snapshot = EXCLUDED.snapshot
            "#,
        )
        .bind(invoice.invoice_id.0)
        .bind(invoice.tenant_id.0)
        .bind(serde_json::to_value(invoice)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn publish_tenant(&self, tenant: &TenantIdentity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_tenants (tenant_id, legal_name, tax_id, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (tenant_id) DO UPDATE SET
                legal_name = EXCLUDED.legal_name,
                tax_id = EXCLUDED.tax_id,
                updated_at = NOW()
            "#,
        )
        .bind(tenant.tenant_id.0)
        .bind(&tenant.legal_name)
        .bind(&tenant.tax_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Confirmation code stored when the invoice was flagged compliant
    pub async fn compliance_code(&self, invoice_id: &InvoiceId) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT confirmation_code FROM ledger_invoices WHERE invoice_id = $1 AND compliant_at IS NOT NULL",
        )
        .bind(invoice_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(code,)| code))
    }
}

#[async_trait]
impl InvoiceDirectory for PgInvoiceDirectory {
    async fn invoice(&self, invoice_id: &InvoiceId) -> Result<Option<InvoiceSnapshot>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT snapshot FROM ledger_invoices WHERE invoice_id = $1")
                .bind(invoice_id.0)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(snapshot,)| serde_json::from_value(snapshot)).transpose()?)
    }

    async fn tenant_identity(&self, tenant_id: &TenantId) -> Result<Option<TenantIdentity>> {
        let row: Option<(Uuid, String, String)> = sqlx::query_as(
            "SELECT tenant_id, legal_name, tax_id FROM ledger_tenants WHERE tenant_id = $1",
        )
        .bind(tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(tenant_id, legal_name, tax_id)| TenantIdentity {
            tenant_id: TenantId::from_uuid(tenant_id),
            legal_name,
            tax_id,
        }))
    }

    /// Ineligible tenants and invoices that already have a record are
    /// filtered before the limit, so they cannot fill every page.
    async fn unreported_invoices(
        &self,
        after: Option<InvoiceId>,
        limit: u32,
    ) -> Result<Vec<InvoiceSnapshot>> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT i.snapshot
            FROM ledger_invoices i
            JOIN tenant_certificates c
              ON c.tenant_id = i.tenant_id AND c.expires_at > NOW()
            LEFT JOIN chain_heads h ON h.tenant_id = i.tenant_id
            WHERE i.compliant_at IS NULL
              AND h.halted_at IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM compliance_records r WHERE r.invoice_id = i.invoice_id
              )
              AND (
                  $1::uuid IS NULL
                  OR (i.created_at, i.invoice_id) > (
                      SELECT a.created_at, a.invoice_id FROM ledger_invoices a WHERE a.invoice_id = $1
                  )
              )
            ORDER BY i.created_at ASC, i.invoice_id ASC
            LIMIT $2
            "#,
        )
        .bind(after.map(|id| id.0))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(snapshot,)| serde_json::from_value(snapshot).map_err(Into::into))
            .collect()
    }

    async fn mark_compliant(&self, invoice_id: &InvoiceId, confirmation_code: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ledger_invoices
            SET compliant_at = COALESCE(compliant_at, NOW()), confirmation_code = $2
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id.0)
        .bind(confirmation_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
