//! Delivery pipeline
//!
//! `deliver_invoice` takes one invoice through gate -> chain -> sign ->
//! submit and persists whatever came out of it. The recovery engine and the
//! scheduled worker re-drive failed records through the same path.

pub mod audit;
pub mod recovery;
pub mod worker;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::authority::AuthorityClient;
use crate::crypto::{compute_digest, verify_link, ChainSecret, CertificateVault, DocumentSigner};
use crate::crypto::vault::is_expired;
use crate::document::{validate, RecordComposer, SoftwareInfo};
use crate::domain::{
    format_amount, CertificateMaterial, ChainHead, ChainLink, ChainPayload, ComplianceRecord,
    FailureKind, InvoiceSnapshot, RecordStatus, TenantId, TenantIdentity,
};
use crate::infra::{
    retry_with_backoff, Backoff, CertificateStore, DeliveryLedger, DeliveryTracker,
    InvoiceDirectory, LedgerError, Result, TenantLocks,
};
use crate::metrics::{labeled, metric_names, MetricsRegistry};
use crate::telemetry::alerts;

pub use audit::{audit_chain, ChainAuditReport, ChainViolation, ViolationKind};
pub use recovery::{RecoveryConfig, RecoveryEngine, RecoveryReport};
pub use worker::{spawn_recovery_worker, RecoveryWorker, RecoveryWorkerMessage};

/// Base URL of the authority's public verification service.
pub const DEFAULT_VERIFICATION_URL: &str =
    "https://www2.agenciatributaria.gob.es/wlpl/TIKE-CONT/ValidarQR";

/// Characters of the digest carried in the verification payload.
const VERIFICATION_DIGEST_PREFIX: usize = 16;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub verification_url: Url,
    pub software: SoftwareInfo,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            verification_url: Url::parse(DEFAULT_VERIFICATION_URL)
                .unwrap_or_else(|_| unreachable!("constant URL parses")),
            software: SoftwareInfo::default(),
        }
    }
}

/// Why an invoice was not delivered without that being an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotEligibleReason {
    NoCertificate,
    CertificateExpired { expired_at: DateTime<Utc> },
}

impl std::fmt::Display for NotEligibleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotEligibleReason::NoCertificate => f.write_str("tenant has no certificate"),
            NotEligibleReason::CertificateExpired { expired_at } => {
                write!(f, "certificate expired at {expired_at}")
            }
        }
    }
}

/// Outcome of one `deliver_invoice` call.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// The invoice already has an accepted record; nothing was submitted.
    AlreadyAccepted(ComplianceRecord),
    /// No usable certificate; no record was created or touched.
    NotEligible(NotEligibleReason),
    /// Another delivery of this invoice is pending or submitted.
    InFlight(ComplianceRecord),
    /// The record was chained and submitted. Its status holds the verdict.
    Delivered(ComplianceRecord),
}

impl DeliveryOutcome {
    pub fn record(&self) -> Option<&ComplianceRecord> {
        match self {
            DeliveryOutcome::AlreadyAccepted(r)
            | DeliveryOutcome::InFlight(r)
            | DeliveryOutcome::Delivered(r) => Some(r),
            DeliveryOutcome::NotEligible(_) => None,
        }
    }

    pub fn status(&self) -> Option<RecordStatus> {
        self.record().map(|r| r.status)
    }

    pub fn is_accepted(&self) -> bool {
        self.record().is_some_and(|r| r.is_accepted())
    }

    pub fn is_not_eligible(&self) -> bool {
        matches!(self, DeliveryOutcome::NotEligible(_))
    }

    /// Label used for logs and the deliveries counter.
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::AlreadyAccepted(_) => "already_accepted",
            DeliveryOutcome::NotEligible(_) => "not_eligible",
            DeliveryOutcome::InFlight(_) => "in_flight",
            DeliveryOutcome::Delivered(r) => r.status.as_str(),
        }
    }
}

/// Orchestrates certificate gating, chaining, signing and submission.
pub struct DeliveryPipeline {
    ledger: Arc<dyn DeliveryLedger>,
    certificates: Arc<dyn CertificateStore>,
    directory: Arc<dyn InvoiceDirectory>,
    authority: Arc<dyn AuthorityClient>,
    signer: DocumentSigner,
    composer: RecordComposer,
    chain_secret: ChainSecret,
    locks: Arc<TenantLocks>,
    metrics: Arc<MetricsRegistry>,
    tracker: Option<Arc<DeliveryTracker>>,
    config: PipelineConfig,
}

impl DeliveryPipeline {
    pub fn new(
        ledger: Arc<dyn DeliveryLedger>,
        certificates: Arc<dyn CertificateStore>,
        directory: Arc<dyn InvoiceDirectory>,
        authority: Arc<dyn AuthorityClient>,
        vault: Arc<CertificateVault>,
        chain_secret: ChainSecret,
        config: PipelineConfig,
    ) -> Self {
        Self {
            ledger,
            certificates,
            directory,
            authority,
            signer: DocumentSigner::new(vault),
            composer: RecordComposer::new(config.software.clone()),
            chain_secret,
            locks: Arc::new(TenantLocks::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            tracker: None,
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Share per-tenant locks with other pipelines in this process.
    pub fn with_locks(mut self, locks: Arc<TenantLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<DeliveryTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn ledger(&self) -> &Arc<dyn DeliveryLedger> {
        &self.ledger
    }

    pub fn certificates(&self) -> &Arc<dyn CertificateStore> {
        &self.certificates
    }

    pub fn directory(&self) -> &Arc<dyn InvoiceDirectory> {
        &self.directory
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn chain_secret(&self) -> &ChainSecret {
        &self.chain_secret
    }

    pub fn locks(&self) -> &Arc<TenantLocks> {
        &self.locks
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Deliver one invoice to the authority.
    ///
    /// Never submits an invoice whose record is already accepted. Every
    /// attempt that got past the certificate gate leaves a persisted record,
    /// including validation, certificate and signing failures.
    #[instrument(
        skip(self, invoice),
        fields(tenant_id = %invoice.tenant_id, invoice_id = %invoice.invoice_id)
    )]
    pub async fn deliver_invoice(&self, invoice: &InvoiceSnapshot) -> Result<DeliveryOutcome> {
        let _delivery = self.tracker.as_ref().map(|t| t.begin());
        let started = Instant::now();
        let tenant_id = invoice.tenant_id;

        if let Some(existing) = self.ledger.find_by_invoice(&invoice.invoice_id).await? {
            if existing.is_accepted() {
                debug!("Invoice already accepted");
                return Ok(DeliveryOutcome::AlreadyAccepted(existing));
            }
        }

        if let Some(halt) = self.ledger.tenant_halt(&tenant_id).await? {
            return Err(LedgerError::TenantHalted {
                tenant_id,
                reason: halt.reason,
            });
        }

        let material = match self.eligible_certificate(&tenant_id).await? {
            Ok(material) => material,
            Err(reason) => {
                info!(reason = %reason, "Invoice not eligible for delivery");
                self.metrics
                    .inc_counter(metric_names::NOT_ELIGIBLE_TOTAL)
                    .await;
                return Ok(DeliveryOutcome::NotEligible(reason));
            }
        };

        let _chain_guard = self.locks.lock(tenant_id).await;

        // Re-read under the lock: a concurrent delivery may have finished.
        let existing = self.ledger.find_by_invoice(&invoice.invoice_id).await?;
        let record = match existing {
            Some(record) if record.is_accepted() => {
                return Ok(DeliveryOutcome::AlreadyAccepted(record));
            }
            Some(record) if record.status.is_in_flight() => {
                warn!(status = %record.status, "Delivery already in flight");
                return Ok(DeliveryOutcome::InFlight(record));
            }
            Some(mut record) => {
                record.invoice = invoice.clone();
                record
            }
            None => ComplianceRecord::new(invoice.clone()),
        };

        let identity = self
            .directory
            .tenant_identity(&tenant_id)
            .await?
            .ok_or(LedgerError::TenantNotFound(tenant_id))?;

        let payload = match validate(invoice, &identity) {
            Ok(payload) => payload,
            Err(err) => {
                self.persist_failure(record, FailureKind::Validation, &err).await;
                return Err(err);
            }
        };

        let record = match self.chain(&record, invoice, &identity, &payload).await {
            Ok(record) => record,
            Err(err) => {
                if matches!(
                    err,
                    LedgerError::ChainIntegrity { .. } | LedgerError::TenantHalted { .. }
                ) {
                    self.persist_failure(record, FailureKind::ChainIntegrity, &err)
                        .await;
                }
                return Err(err);
            }
        };

        let record = self.sign_and_submit(record, &identity, &payload, &material).await?;

        let outcome = DeliveryOutcome::Delivered(record);
        self.metrics
            .inc_counter(&labeled(metric_names::DELIVERIES_TOTAL, "status", outcome.label()))
            .await;
        self.metrics
            .observe_histogram(
                metric_names::DELIVERY_DURATION_MS,
                started.elapsed().as_secs_f64() * 1000.0,
            )
            .await;
        Ok(outcome)
    }

    /// `Ok(Err(reason))` when the tenant cannot sign right now.
    async fn eligible_certificate(
        &self,
        tenant_id: &TenantId,
    ) -> Result<std::result::Result<CertificateMaterial, NotEligibleReason>> {
        let Some(material) = self.certificates.get_certificate(tenant_id).await? else {
            return Ok(Err(NotEligibleReason::NoCertificate));
        };
        if is_expired(material.expires_at(), Utc::now()) {
            return Ok(Err(NotEligibleReason::CertificateExpired {
                expired_at: material.expires_at(),
            }));
        }
        Ok(Ok(material))
    }

    /// Whether the tenant could deliver right now: not halted and holding an
    /// unexpired certificate. Nothing is decrypted.
    pub async fn can_deliver(&self, tenant_id: &TenantId) -> Result<bool> {
        if self.ledger.tenant_halt(tenant_id).await?.is_some() {
            return Ok(false);
        }
        Ok(self.eligible_certificate(tenant_id).await?.is_ok())
    }

    /// Append a link for `record` at the current head, retrying when another
    /// writer moved the head in between.
    async fn chain(
        &self,
        record: &ComplianceRecord,
        invoice: &InvoiceSnapshot,
        identity: &TenantIdentity,
        payload: &ChainPayload,
    ) -> Result<ComplianceRecord> {
        let outcome = retry_with_backoff(
            Backoff::chain_append(),
            || self.chain_once(record, invoice, identity, payload),
            |err: &LedgerError| err.is_retryable(),
        )
        .await;
        if outcome.attempts > 1 {
            debug!(attempts = outcome.attempts, "Chain append needed retries");
        }
        outcome.into_result()
    }

    async fn chain_once(
        &self,
        base: &ComplianceRecord,
        invoice: &InvoiceSnapshot,
        identity: &TenantIdentity,
        payload: &ChainPayload,
    ) -> Result<ComplianceRecord> {
        let tenant_id = invoice.tenant_id;
        let head = self.ledger.chain_head(&tenant_id).await?;
        self.verify_head(&head).await?;

        let secret = self.chain_secret.for_tenant(&tenant_id);
        let digest = compute_digest(payload, &head.digest, &secret);
        let unsigned = self
            .composer
            .compose(invoice, identity, &digest, &head.digest)?;

        let link = ChainLink {
            tenant_id,
            seq: head.seq + 1,
            invoice_id: invoice.invoice_id,
            record_id: base.id,
            digest,
            previous_digest: head.digest.clone(),
            payload: payload.clone(),
            created_at: Utc::now(),
        };

        let mut record = base.clone();
        record.chain(&link, invoice.clone(), unsigned)?;

        match self.ledger.append_link(&head, &link, &record).await {
            Ok(()) => {
                info!(seq = link.seq, retry_count = record.retry_count, "Record chained");
                Ok(record)
            }
            Err(err @ LedgerError::ChainHeadMoved { .. }) => {
                self.metrics
                    .inc_counter(metric_names::CHAIN_HEAD_CONFLICTS_TOTAL)
                    .await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// The head must point at a stored link whose digest recomputes.
    async fn verify_head(&self, head: &ChainHead) -> Result<()> {
        if head.is_genesis() {
            return Ok(());
        }
        let tenant_id = head.tenant_id;
        let Some(link) = self.ledger.chain_link(&tenant_id, head.seq).await? else {
            return Err(self
                .halt_for_integrity(tenant_id, format!("head seq {} has no stored link", head.seq))
                .await);
        };
        if link.digest != head.digest {
            return Err(self
                .halt_for_integrity(tenant_id, format!("head digest differs from link {}", link.seq))
                .await);
        }
        if !verify_link(&link, &self.chain_secret.for_tenant(&tenant_id)) {
            return Err(self
                .halt_for_integrity(tenant_id, format!("link {} digest does not recompute", link.seq))
                .await);
        }
        Ok(())
    }

    /// Halt the tenant and raise the operator alert.
    pub(crate) async fn halt_for_integrity(&self, tenant_id: TenantId, message: String) -> LedgerError {
        error!(
            alert = alerts::CHAIN_INTEGRITY,
            tenant_id = %tenant_id,
            message = %message,
            "Chain integrity violation, halting tenant"
        );
        self.metrics
            .inc_counter(metric_names::CHAIN_INTEGRITY_FAILURES_TOTAL)
            .await;
        if let Err(err) = self.ledger.halt_tenant(&tenant_id, &message).await {
            error!(tenant_id = %tenant_id, error = %err, "Failed to persist tenant halt");
        }
        LedgerError::ChainIntegrity { tenant_id, message }
    }

    async fn sign_and_submit(
        &self,
        mut record: ComplianceRecord,
        identity: &TenantIdentity,
        payload: &ChainPayload,
        material: &CertificateMaterial,
    ) -> Result<ComplianceRecord> {
        let unsigned = record.unsigned_document.clone().unwrap_or_default();
        let signed = match self.signer.sign(&unsigned, material) {
            Ok(signed) => signed,
            Err(err) => {
                let kind = match err {
                    LedgerError::Certificate(_) => FailureKind::Certificate,
                    _ => FailureKind::Signing,
                };
                self.persist_failure(record, kind, &err).await;
                return Err(err);
            }
        };

        record.mark_submitted(signed.clone(), Utc::now())?;
        self.ledger.save_record(&record).await?;

        let result = self.authority.submit(&signed).await;
        let verification = if result.success {
            result.confirmation_code.as_deref().map(|code| {
                verification_payload(
                    &self.config.verification_url,
                    identity,
                    payload,
                    code,
                    &record.digest,
                )
            })
        } else {
            None
        };

        record.apply_authority_result(result, verification)?;
        self.ledger.save_record(&record).await?;

        match record.status {
            RecordStatus::Accepted => {
                info!(
                    confirmation_code = record.confirmation_code.as_deref().unwrap_or(""),
                    "Record accepted"
                );
                let code = record.confirmation_code.clone().unwrap_or_default();
                if let Err(err) = self.directory.mark_compliant(&record.invoice_id, &code).await {
                    warn!(error = %err, "Failed to flag invoice as compliant");
                }
            }
            status => {
                warn!(
                    status = %status,
                    error = record.error_message.as_deref().unwrap_or(""),
                    "Record not accepted"
                );
            }
        }
        Ok(record)
    }

    /// Persist a failed attempt. Storage errors here are logged; the caller
    /// reports the original failure.
    async fn persist_failure(&self, mut record: ComplianceRecord, kind: FailureKind, err: &LedgerError) {
        if let Err(transition) = record.mark_failed(kind, err.to_string()) {
            error!(error = %transition, "Cannot record failed attempt");
            return;
        }
        self.metrics
            .inc_counter(&labeled(metric_names::DELIVERIES_TOTAL, "status", "error"))
            .await;
        warn!(kind = %kind, category = err.category(), error = %err, "Delivery attempt failed");
        if let Err(save_err) = self.ledger.save_record(&record).await {
            error!(error = %save_err, "Failed to persist failed attempt");
        }
    }

    // ========================================================================
    // Stale records
    // ========================================================================

    /// Resolve a record stuck in `pending`/`submitted` to an unknown outcome.
    ///
    /// Returns false when the record moved on, or was touched after
    /// `updated_before`, by the time the tenant lock was acquired.
    #[instrument(skip(self, record), fields(tenant_id = %record.tenant_id, invoice_id = %record.invoice_id))]
    pub async fn resolve_stale(
        &self,
        record: &ComplianceRecord,
        updated_before: DateTime<Utc>,
    ) -> Result<bool> {
        let _chain_guard = self.locks.lock(record.tenant_id).await;
        let Some(mut current) = self.ledger.find_by_invoice(&record.invoice_id).await? else {
            return Ok(false);
        };
        if !current.status.is_in_flight() || current.updated_at >= updated_before {
            return Ok(false);
        }
        let previous = current.status;
        current.mark_failed(
            FailureKind::Authority,
            format!(
                "{}: no verdict recorded while {}",
                crate::domain::transport_codes::OUTCOME_UNKNOWN,
                previous
            ),
        )?;
        self.ledger.save_record(&current).await?;
        warn!(previous = %previous, "Stale delivery resolved to unknown outcome");
        self.metrics
            .inc_counter(metric_names::STALE_RECOVERED_TOTAL)
            .await;
        Ok(true)
    }

    // ========================================================================
    // Audit
    // ========================================================================

    /// Walk the tenant's chain. With `halt_on_violation`, a broken chain
    /// halts the tenant.
    pub async fn audit_chain(
        &self,
        tenant_id: &TenantId,
        halt_on_violation: bool,
    ) -> Result<ChainAuditReport> {
        let report = audit_chain(self.ledger.as_ref(), &self.chain_secret, tenant_id).await?;
        if !report.is_intact() && halt_on_violation {
            let first = report
                .violations
                .first()
                .map(|v| v.to_string())
                .unwrap_or_default();
            self.halt_for_integrity(*tenant_id, format!("audit found: {first}"))
                .await;
        }
        Ok(report)
    }
}

/// Verification URL printed as a scannable code on the rendered invoice.
pub fn verification_payload(
    base: &Url,
    identity: &TenantIdentity,
    payload: &ChainPayload,
    confirmation_code: &str,
    digest: &str,
) -> String {
    let mut url = base.clone();
    let prefix: String = digest.chars().take(VERIFICATION_DIGEST_PREFIX).collect();
    url.query_pairs_mut()
        .append_pair("nif", identity.tax_id.trim())
        .append_pair("numserie", &payload.document_number)
        .append_pair("fecha", &payload.issue_date.format("%d-%m-%Y").to_string())
        .append_pair("importe", &format_amount(payload.total))
        .append_pair("csv", confirmation_code)
        .append_pair("huella", &prefix);
    url.to_string()
}
