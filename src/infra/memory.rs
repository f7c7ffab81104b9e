//! In-memory invoice directory for embedding and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{InvoiceId, InvoiceSnapshot, TenantId, TenantIdentity};
use crate::infra::{InvoiceDirectory, Result};

#[derive(Default)]
struct DirectoryState {
    /// Insertion order, used for oldest-first listings
    order: Vec<InvoiceId>,
    invoices: HashMap<InvoiceId, InvoiceSnapshot>,
    tenants: HashMap<TenantId, TenantIdentity>,
    compliant: HashMap<InvoiceId, String>,
}

#[derive(Default)]
pub struct InMemoryInvoiceDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryInvoiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_invoice(&self, invoice: InvoiceSnapshot) {
        let mut state = self.state.write().await;
        if !state.invoices.contains_key(&invoice.invoice_id) {
            state.order.push(invoice.invoice_id);
        }
        state.invoices.insert(invoice.invoice_id, invoice);
    }

    pub async fn insert_tenant(&self, tenant: TenantIdentity) {
        self.state.write().await.tenants.insert(tenant.tenant_id, tenant);
    }

    /// Confirmation code recorded by `mark_compliant`, if any
    pub async fn compliance_code(&self, invoice_id: &InvoiceId) -> Option<String> {
        self.state.read().await.compliant.get(invoice_id).cloned()
    }
}

#[async_trait]
impl InvoiceDirectory for InMemoryInvoiceDirectory {
    async fn invoice(&self, invoice_id: &InvoiceId) -> Result<Option<InvoiceSnapshot>> {
        Ok(self.state.read().await.invoices.get(invoice_id).cloned())
    }

    async fn tenant_identity(&self, tenant_id: &TenantId) -> Result<Option<TenantIdentity>> {
        Ok(self.state.read().await.tenants.get(tenant_id).cloned())
    }

    /// Not yet flagged compliant, in insertion order. Whether a record
    /// exists or the tenant can deliver is the caller's concern here, since
    /// this directory cannot see the ledger; `after` lets the caller page
    /// past what it skipped.
    async fn unreported_invoices(
        &self,
        after: Option<InvoiceId>,
        limit: u32,
    ) -> Result<Vec<InvoiceSnapshot>> {
        let state = self.state.read().await;
        let start = match after {
            Some(after) => match state.order.iter().position(|id| *id == after) {
                Some(index) => index + 1,
                None => return Ok(Vec::new()),
            },
            None => 0,
        };
        Ok(state.order[start..]
            .iter()
            .filter(|id| !state.compliant.contains_key(id))
            .filter_map(|id| state.invoices.get(id).cloned())
            .take(limit as usize)
            .collect())
    }

    async fn mark_compliant(&self, invoice_id: &InvoiceId, confirmation_code: &str) -> Result<()> {
        self.state
            .write()
            .await
            .compliant
            .insert(*invoice_id, confirmation_code.to_string());
        Ok(())
    }
}
