//! Compliance service facade
//!
//! The surface the invoicing application talks to: certificate upload and
//! status, per-invoice delivery and status, statistics, and the manual
//! recovery triggers.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::authority::{AuthorityClient, HttpAuthorityClient, SimulatedAuthority};
use crate::config::AuthorityMode;
use crate::crypto::vault::is_expiring_soon;
use crate::crypto::{certificate_status, CertificateVault, EXPIRING_SOON_DAYS};
use crate::domain::{
    CertificateMetadata, CertificateStatus, DeliveryStats, DeliveryStatusView, InvoiceId,
    InvoiceSnapshot, TenantId,
};
use crate::infra::{LedgerError, Result};
use crate::metrics::MetricsRegistry;
use crate::pipeline::{
    ChainAuditReport, DeliveryOutcome, DeliveryPipeline, RecoveryConfig, RecoveryEngine,
    RecoveryReport,
};

/// Build the authority client selected by configuration.
pub fn build_authority(
    mode: &AuthorityMode,
    metrics: Arc<MetricsRegistry>,
) -> Result<Arc<dyn AuthorityClient>> {
    match mode {
        AuthorityMode::Simulator { delay } => {
            info!(delay_ms = delay.as_millis() as u64, "Using authority simulator");
            Ok(Arc::new(SimulatedAuthority::new(*delay)))
        }
        AuthorityMode::Production(config) => {
            info!(endpoint = %config.endpoint, timeout_secs = config.timeout.as_secs(), "Using authority endpoint");
            Ok(Arc::new(
                HttpAuthorityClient::new(config.clone())?.with_metrics(metrics),
            ))
        }
    }
}

pub struct ComplianceService {
    pipeline: Arc<DeliveryPipeline>,
    recovery: RecoveryEngine,
    vault: Arc<CertificateVault>,
}

impl ComplianceService {
    pub fn new(
        pipeline: Arc<DeliveryPipeline>,
        vault: Arc<CertificateVault>,
        recovery: RecoveryConfig,
    ) -> Self {
        Self {
            recovery: RecoveryEngine::new(pipeline.clone(), recovery),
            pipeline,
            vault,
        }
    }

    pub fn pipeline(&self) -> &Arc<DeliveryPipeline> {
        &self.pipeline
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    // ========================================================================
    // Certificates
    // ========================================================================

    /// Validate, encrypt and store a tenant's certificate container.
    ///
    /// Replaces any previous certificate. Returns the validated metadata.
    #[instrument(skip(self, container, passphrase), fields(tenant_id = %tenant_id))]
    pub async fn upload_certificate(
        &self,
        tenant_id: &TenantId,
        container: &[u8],
        passphrase: &str,
    ) -> Result<CertificateMetadata> {
        let now = Utc::now();
        let sealed = self.vault.encrypt_at(tenant_id, container, passphrase, now)?;
        let material = sealed.into_material(*tenant_id, now);
        self.pipeline.certificates().put_certificate(&material).await?;

        let metadata = material.metadata;
        if is_expiring_soon(metadata.not_after, now, EXPIRING_SOON_DAYS) {
            warn!(not_after = %metadata.not_after, "Uploaded certificate expires soon");
        }
        info!(
            subject = %metadata.subject,
            not_after = %metadata.not_after,
            "Certificate stored"
        );
        Ok(metadata)
    }

    pub async fn certificate_status(&self, tenant_id: &TenantId) -> Result<CertificateStatus> {
        let material = self.pipeline.certificates().get_certificate(tenant_id).await?;
        Ok(certificate_status(material.as_ref(), Utc::now()))
    }

    pub async fn delete_certificate(&self, tenant_id: &TenantId) -> Result<bool> {
        let deleted = self.pipeline.certificates().delete_certificate(tenant_id).await?;
        if deleted {
            info!(tenant_id = %tenant_id, "Certificate deleted");
        }
        Ok(deleted)
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    pub async fn deliver_invoice(&self, invoice: &InvoiceSnapshot) -> Result<DeliveryOutcome> {
        self.pipeline.deliver_invoice(invoice).await
    }

    /// Look the invoice up in the directory and deliver it.
    pub async fn deliver_invoice_by_id(&self, invoice_id: &InvoiceId) -> Result<DeliveryOutcome> {
        let invoice = self
            .pipeline
            .directory()
            .invoice(invoice_id)
            .await?
            .ok_or(LedgerError::InvoiceNotFound(*invoice_id))?;
        self.pipeline.deliver_invoice(&invoice).await
    }

    /// Delivery from the invoice-creation path. Never fails: the invoice is
    /// issued regardless, and the recovery engine picks up what failed here.
    pub async fn deliver_invoice_best_effort(
        &self,
        invoice: &InvoiceSnapshot,
    ) -> Option<DeliveryOutcome> {
        match self.pipeline.deliver_invoice(invoice).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                if err.is_retryable() {
                    warn!(
                        invoice_id = %invoice.invoice_id,
                        category = err.category(),
                        error = %err,
                        "Compliance delivery failed, leaving it to recovery"
                    );
                } else {
                    error!(
                        invoice_id = %invoice.invoice_id,
                        category = err.category(),
                        error = %err,
                        "Compliance delivery failed"
                    );
                }
                None
            }
        }
    }

    pub async fn delivery_status(&self, invoice_id: &InvoiceId) -> Result<Option<DeliveryStatusView>> {
        let record = self.pipeline.ledger().find_by_invoice(invoice_id).await?;
        Ok(record.as_ref().map(DeliveryStatusView::from))
    }

    pub async fn delivery_stats(&self, tenant_id: &TenantId) -> Result<DeliveryStats> {
        self.pipeline.ledger().stats(tenant_id).await
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub async fn retry_invoice(&self, invoice_id: &InvoiceId) -> Result<DeliveryOutcome> {
        self.recovery.retry_invoice(invoice_id).await
    }

    /// Synchronous full recovery pass.
    pub async fn process_all_pending(&self) -> Result<RecoveryReport> {
        self.recovery.run_once().await
    }

    pub async fn process_new_invoices(&self) -> Result<RecoveryReport> {
        self.recovery.process_new_invoices().await
    }

    pub async fn audit_chain(
        &self,
        tenant_id: &TenantId,
        halt_on_violation: bool,
    ) -> Result<ChainAuditReport> {
        self.pipeline.audit_chain(tenant_id, halt_on_violation).await
    }

    /// Lift an integrity halt after manual audit. Returns false if the
    /// tenant was not halted.
    pub async fn resume_tenant(&self, tenant_id: &TenantId) -> Result<bool> {
        let resumed = self.pipeline.ledger().resume_tenant(tenant_id).await?;
        if resumed {
            info!(tenant_id = %tenant_id, "Tenant resumed after integrity halt");
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt::generate_key;
    use crate::crypto::test_support::container;
    use crate::crypto::ChainSecret;
    use crate::domain::{RecordStatus, TenantIdentity};
    use crate::infra::{
        CertificateError, InMemoryInvoiceDirectory, SqliteCertificateStore, SqliteDeliveryLedger,
    };
    use crate::pipeline::PipelineConfig;
    use chrono::{Duration, NaiveDate};
    use rust_decimal_macros::dec;

    async fn service() -> (ComplianceService, Arc<InMemoryInvoiceDirectory>, TenantId) {
        let ledger = Arc::new(SqliteDeliveryLedger::in_memory().await.unwrap());
        let certificates = Arc::new(SqliteCertificateStore::new(ledger.pool().clone()));
        let directory = Arc::new(InMemoryInvoiceDirectory::new());
        let vault = Arc::new(CertificateVault::new(vec![generate_key()]).unwrap());
        let tenant_id = TenantId::new();
        directory
            .insert_tenant(TenantIdentity {
                tenant_id,
                legal_name: "Panadería Sol".to_string(),
                tax_id: "B87654321".to_string(),
            })
            .await;
        let pipeline = Arc::new(DeliveryPipeline::new(
            ledger,
            certificates,
            directory.clone(),
            Arc::new(SimulatedAuthority::new(std::time::Duration::ZERO)),
            vault.clone(),
            ChainSecret::new(vec![3u8; 32]),
            PipelineConfig::default(),
        ));
        (
            ComplianceService::new(pipeline, vault, RecoveryConfig::default()),
            directory,
            tenant_id,
        )
    }

    fn invoice(tenant_id: TenantId) -> InvoiceSnapshot {
        InvoiceSnapshot {
            invoice_id: InvoiceId::new(),
            tenant_id,
            series: "T".to_string(),
            number: "15".to_string(),
            issue_date: NaiveDate::from_ymd_opt(2025, 5, 2),
            counterparty: None,
            description: None,
            lines: vec![],
            total: Some(dec!(12.10)),
        }
    }

    #[tokio::test]
    async fn certificate_upload_and_status() {
        let (service, _, tenant_id) = service().await;
        assert!(!service.certificate_status(&tenant_id).await.unwrap().has_certificate);

        let now = Utc::now();
        let raw = container("Panaderia", "secret", now - Duration::days(1), now + Duration::days(10));
        let metadata = service.upload_certificate(&tenant_id, &raw, "secret").await.unwrap();
        assert!(metadata.subject.contains("Panaderia"));

        let status = service.certificate_status(&tenant_id).await.unwrap();
        assert!(status.has_certificate);
        assert!(!status.expired);
        assert!(status.expiring_soon);
        assert!(status.days_remaining.unwrap() >= 9);

        assert!(service.delete_certificate(&tenant_id).await.unwrap());
        assert!(!service.delete_certificate(&tenant_id).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_passphrase_is_a_certificate_error() {
        let (service, _, tenant_id) = service().await;
        let now = Utc::now();
        let raw = container("X", "right", now - Duration::days(1), now + Duration::days(100));

        let err = service.upload_certificate(&tenant_id, &raw, "wrong").await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Certificate(CertificateError::WrongPassphrase)
        ));
        assert!(!service.certificate_status(&tenant_id).await.unwrap().has_certificate);
    }

    #[tokio::test]
    async fn delivery_status_and_stats_follow_the_record() {
        let (service, directory, tenant_id) = service().await;
        let now = Utc::now();
        let raw = container("Sol", "pw", now - Duration::days(1), now + Duration::days(100));
        service.upload_certificate(&tenant_id, &raw, "pw").await.unwrap();

        let invoice = invoice(tenant_id);
        directory.insert_invoice(invoice.clone()).await;
        assert!(service.delivery_status(&invoice.invoice_id).await.unwrap().is_none());

        let outcome = service.deliver_invoice_by_id(&invoice.invoice_id).await.unwrap();
        assert!(outcome.is_accepted());

        let view = service.delivery_status(&invoice.invoice_id).await.unwrap().unwrap();
        assert_eq!(view.status, RecordStatus::Accepted);
        assert!(view.confirmation_code.unwrap().starts_with("SIM-"));
        assert!(view.verification_payload.is_some());

        let stats = service.delivery_stats(&tenant_id).await.unwrap();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.total(), 1);
    }

    #[tokio::test]
    async fn best_effort_delivery_swallows_errors() {
        let (service, _, _) = service().await;
        let stranger = invoice(TenantId::new());
        let now = Utc::now();
        let raw = container("Y", "pw", now - Duration::days(1), now + Duration::days(100));
        service
            .upload_certificate(&stranger.tenant_id, &raw, "pw")
            .await
            .unwrap();

        // Tenant identity unknown to the directory
        assert!(service.deliver_invoice_best_effort(&stranger).await.is_none());
        assert!(service.deliver_invoice(&stranger).await.is_err());
    }

    #[tokio::test]
    async fn unknown_invoice_cannot_be_retried() {
        let (service, _, _) = service().await;
        let err = service.retry_invoice(&InvoiceId::new()).await.unwrap_err();
        assert!(matches!(err, LedgerError::RecordNotFound(_)));
        assert!(!service.resume_tenant(&TenantId::new()).await.unwrap());
    }
}
