//! Retry/recovery engine
//!
//! Re-drives failed records, delivers invoices that never got a record, and
//! resolves deliveries left in flight by a crash. Every path goes through
//! [`DeliveryPipeline::deliver_invoice`], so the chain head is always read
//! fresh and a retry can never reorder the chain.
//!
//! # Configuration
//!
//! - `RECOVERY_INTERVAL_SECS` - scheduler tick (default: 300)
//! - `RECOVERY_COOLDOWN_SECS` - minimum age of a failed record (default: 600)
//! - `RECOVERY_BATCH_SIZE` - records per pass (default: 50)
//! - `RECOVERY_CONCURRENCY` - tenants processed in parallel (default: 4)
//! - `RECOVERY_MAX_RETRIES` - retry ceiling, `0` or `none` disables (default: 20)
//! - `RECOVERY_RETRY_REJECTED` - retry authority rejections unmodified (default: true)
//! - `RECOVERY_STALE_SUBMISSION_SECS` - in-flight age treated as unknown outcome (default: 900)

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{DeliveryOutcome, DeliveryPipeline};
use crate::domain::{ComplianceRecord, FailureKind, InvoiceId, InvoiceSnapshot, TenantId};
use crate::infra::{LedgerError, Result, RetryCursor, RetryQuery};
use crate::metrics::metric_names;
use crate::telemetry::alerts;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How often the scheduled worker runs a pass
    pub interval: Duration,
    /// Failed records younger than this are left alone
    pub cooldown: Duration,
    pub batch_size: u32,
    /// Tenants processed in parallel; one tenant is always sequential
    pub concurrency: usize,
    /// Escalate instead of retrying once a record reached this many retries
    pub max_retries: Option<u32>,
    pub retry_rejected: bool,
    /// In-flight records older than this are treated as an unknown outcome
    pub stale_after: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            cooldown: Duration::from_secs(600),
            batch_size: 50,
            concurrency: 4,
            max_retries: Some(20),
            retry_rejected: true,
            stale_after: Duration::from_secs(900),
        }
    }
}

impl RecoveryConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let secs = |name: &str, default: Duration| {
            lookup(name)
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let batch_size = lookup("RECOVERY_BATCH_SIZE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.batch_size);

        let concurrency = lookup("RECOVERY_CONCURRENCY")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.concurrency);

        let max_retries = match lookup("RECOVERY_MAX_RETRIES") {
            Some(s) => parse_ceiling(&s).unwrap_or(defaults.max_retries),
            None => defaults.max_retries,
        };

        let retry_rejected = lookup("RECOVERY_RETRY_REJECTED")
            .map(|s| s == "true" || s == "1")
            .unwrap_or(defaults.retry_rejected);

        Self {
            interval: secs("RECOVERY_INTERVAL_SECS", defaults.interval),
            cooldown: secs("RECOVERY_COOLDOWN_SECS", defaults.cooldown),
            batch_size,
            concurrency,
            max_retries,
            retry_rejected,
            stale_after: secs("RECOVERY_STALE_SUBMISSION_SECS", defaults.stale_after),
        }
    }
}

/// `Some(None)` disables the ceiling; `None` means unparseable.
fn parse_ceiling(value: &str) -> Option<Option<u32>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("none") {
        return Some(None);
    }
    match value.parse::<u32>().ok()? {
        0 => Some(None),
        n => Some(Some(n)),
    }
}

/// Counts from one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Deliveries started
    pub attempted: u64,
    pub accepted: u64,
    /// Delivered but rejected or errored again
    pub failed: u64,
    pub not_eligible: u64,
    /// Already accepted or in flight elsewhere
    pub skipped: u64,
    pub escalated: u64,
    pub stale_resolved: u64,
    pub errors: u64,
}

impl RecoveryReport {
    pub fn merge(&mut self, other: &RecoveryReport) {
        self.attempted += other.attempted;
        self.accepted += other.accepted;
        self.failed += other.failed;
        self.not_eligible += other.not_eligible;
        self.skipped += other.skipped;
        self.escalated += other.escalated;
        self.stale_resolved += other.stale_resolved;
        self.errors += other.errors;
    }

    pub fn is_empty(&self) -> bool {
        *self == RecoveryReport::default()
    }

    fn record(&mut self, result: &Result<DeliveryOutcome>) {
        self.attempted += 1;
        match result {
            Ok(DeliveryOutcome::Delivered(record)) if record.is_accepted() => self.accepted += 1,
            Ok(DeliveryOutcome::Delivered(_)) => self.failed += 1,
            Ok(DeliveryOutcome::NotEligible(_)) => self.not_eligible += 1,
            Ok(DeliveryOutcome::AlreadyAccepted(_) | DeliveryOutcome::InFlight(_)) => {
                self.skipped += 1
            }
            Err(_) => self.errors += 1,
        }
    }
}

enum Job {
    /// Failed record past its cooldown
    Retry(ComplianceRecord),
    /// In-flight record past the stale threshold
    Stale(ComplianceRecord, DateTime<Utc>),
    /// Invoice without any record
    Fresh(InvoiceSnapshot),
}

impl Job {
    fn tenant_id(&self) -> TenantId {
        match self {
            Job::Retry(r) | Job::Stale(r, _) => r.tenant_id,
            Job::Fresh(i) => i.tenant_id,
        }
    }
}

/// Drives the periodic recovery passes over the delivery pipeline.
#[derive(Clone)]
pub struct RecoveryEngine {
    pipeline: Arc<DeliveryPipeline>,
    config: RecoveryConfig,
}

impl RecoveryEngine {
    pub fn new(pipeline: Arc<DeliveryPipeline>, config: RecoveryConfig) -> Self {
        Self { pipeline, config }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<DeliveryPipeline> {
        &self.pipeline
    }

    /// One full pass: stale submissions, failed records, then new invoices.
    pub async fn run_once(&self) -> Result<RecoveryReport> {
        let mut report = self.recover_stale_submissions().await?;
        report.merge(&self.process_pending_invoices().await?);
        report.merge(&self.process_new_invoices().await?);
        if !report.is_empty() {
            info!(
                attempted = report.attempted,
                accepted = report.accepted,
                failed = report.failed,
                escalated = report.escalated,
                stale_resolved = report.stale_resolved,
                errors = report.errors,
                "Recovery pass finished"
            );
        }
        Ok(report)
    }

    /// Retry `rejected`/`error` records older than the cooldown.
    ///
    /// Pages through the listing until `batch_size` records of tenants that
    /// can deliver are collected, so a backlog of an ineligible tenant never
    /// hides the records behind it.
    pub async fn process_pending_invoices(&self) -> Result<RecoveryReport> {
        let batch = self.config.batch_size as usize;
        let mut query = RetryQuery {
            updated_before: age_cutoff(self.config.cooldown),
            kinds: FailureKind::auto_retryable(self.config.retry_rejected),
            after: None,
            limit: self.config.batch_size,
        };
        let mut gate = TenantGate::new(&self.pipeline);
        let mut report = RecoveryReport::default();
        let mut jobs = Vec::new();

        'pages: while jobs.len() < batch {
            let page = self.pipeline.ledger().list_retryable(&query).await?;
            let Some(last) = page.last() else { break };
            query.after = Some(RetryCursor::after(last));
            let exhausted = page.len() < batch;

            for record in page {
                if jobs.len() >= batch {
                    break 'pages;
                }
                if self.past_ceiling(&record) {
                    match self.escalate(&record).await {
                        Ok(()) => report.escalated += 1,
                        Err(err) => {
                            warn!(
                                invoice_id = %record.invoice_id,
                                category = err.category(),
                                error = %err,
                                "Could not escalate record"
                            );
                            report.errors += 1;
                        }
                    }
                } else if gate.admits(record.tenant_id, &mut report).await {
                    jobs.push(Job::Retry(record));
                }
            }
            if exhausted {
                break;
            }
        }

        self.pipeline
            .metrics()
            .set_gauge(metric_names::RECOVERY_BATCH_SIZE, jobs.len() as u64)
            .await;
        report.merge(&self.fan_out(jobs).await);
        Ok(report)
    }

    /// First-time delivery for invoices that have no record at all.
    ///
    /// Pages through the directory the same way, skipping invoices that
    /// already have a record and tenants that cannot deliver.
    pub async fn process_new_invoices(&self) -> Result<RecoveryReport> {
        let batch = self.config.batch_size as usize;
        let mut gate = TenantGate::new(&self.pipeline);
        let mut report = RecoveryReport::default();
        let mut after = None;
        let mut jobs = Vec::new();

        'pages: while jobs.len() < batch {
            let page = self
                .pipeline
                .directory()
                .unreported_invoices(after, self.config.batch_size)
                .await?;
            let Some(last) = page.last() else { break };
            after = Some(last.invoice_id);
            let exhausted = page.len() < batch;

            for invoice in page {
                if jobs.len() >= batch {
                    break 'pages;
                }
                if self
                    .pipeline
                    .ledger()
                    .find_by_invoice(&invoice.invoice_id)
                    .await?
                    .is_some()
                {
                    continue;
                }
                if gate.admits(invoice.tenant_id, &mut report).await {
                    jobs.push(Job::Fresh(invoice));
                }
            }
            if exhausted {
                break;
            }
        }

        report.merge(&self.fan_out(jobs).await);
        Ok(report)
    }

    /// Resolve records stuck in flight and re-drive them.
    pub async fn recover_stale_submissions(&self) -> Result<RecoveryReport> {
        let cutoff = age_cutoff(self.config.stale_after);
        let records = self
            .pipeline
            .ledger()
            .list_stale(cutoff, self.config.batch_size)
            .await?;
        let jobs = records
            .into_iter()
            .map(|record| Job::Stale(record, cutoff))
            .collect();
        Ok(self.fan_out(jobs).await)
    }

    /// Manual retry of one invoice. Ignores cooldown and clears escalation.
    pub async fn retry_invoice(&self, invoice_id: &InvoiceId) -> Result<DeliveryOutcome> {
        let record = self
            .pipeline
            .ledger()
            .find_by_invoice(invoice_id)
            .await?
            .ok_or(LedgerError::RecordNotFound(*invoice_id))?;
        if record.is_accepted() {
            return Ok(DeliveryOutcome::AlreadyAccepted(record));
        }
        info!(invoice_id = %invoice_id, retry_count = record.retry_count, "Manual retry");
        redeliver(&self.pipeline, &record).await
    }

    fn past_ceiling(&self, record: &ComplianceRecord) -> bool {
        self.config
            .max_retries
            .is_some_and(|max| record.retry_count >= max)
    }

    async fn escalate(&self, record: &ComplianceRecord) -> Result<()> {
        self.pipeline
            .ledger()
            .mark_escalated(&record.invoice_id, Utc::now())
            .await?;
        self.pipeline
            .metrics()
            .inc_counter(metric_names::ESCALATIONS_TOTAL)
            .await;
        error!(
            alert = alerts::RETRY_CEILING,
            tenant_id = %record.tenant_id,
            invoice_id = %record.invoice_id,
            retry_count = record.retry_count,
            last_error = record.error_message.as_deref().unwrap_or(""),
            "Record reached the retry ceiling, escalating"
        );
        Ok(())
    }

    /// Run jobs with one task per tenant, at most `concurrency` at a time.
    async fn fan_out(&self, jobs: Vec<Job>) -> RecoveryReport {
        let mut by_tenant: BTreeMap<TenantId, Vec<Job>> = BTreeMap::new();
        for job in jobs {
            by_tenant.entry(job.tenant_id()).or_default().push(job);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (tenant_id, jobs) in by_tenant {
            let pipeline = self.pipeline.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return RecoveryReport::default();
                    };
                    run_tenant_jobs(&pipeline, jobs).await
                }
                .instrument(info_span!("recovery_tenant", tenant_id = %tenant_id)),
            );
        }

        let mut report = RecoveryReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(tenant_report) => report.merge(&tenant_report),
                Err(err) => {
                    error!(error = %err, "Recovery task failed");
                    report.errors += 1;
                }
            }
        }
        report
    }
}

/// Per-pass memo of which tenants can deliver
struct TenantGate<'a> {
    pipeline: &'a DeliveryPipeline,
    known: HashMap<TenantId, bool>,
}

impl<'a> TenantGate<'a> {
    fn new(pipeline: &'a DeliveryPipeline) -> Self {
        Self {
            pipeline,
            known: HashMap::new(),
        }
    }

    /// Counts a refusal as `not_eligible` and a lookup failure as an error.
    async fn admits(&mut self, tenant_id: TenantId, report: &mut RecoveryReport) -> bool {
        let open = match self.known.get(&tenant_id) {
            Some(open) => *open,
            None => match self.pipeline.can_deliver(&tenant_id).await {
                Ok(open) => {
                    if !open {
                        debug!(tenant_id = %tenant_id, "Tenant cannot deliver, skipping its backlog");
                    }
                    self.known.insert(tenant_id, open);
                    open
                }
                Err(err) => {
                    warn!(tenant_id = %tenant_id, error = %err, "Eligibility check failed");
                    report.errors += 1;
                    return false;
                }
            },
        };
        if !open {
            report.not_eligible += 1;
        }
        open
    }
}

/// Jobs of one tenant run in order. A halted tenant stops the rest.
async fn run_tenant_jobs(pipeline: &DeliveryPipeline, jobs: Vec<Job>) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    for job in jobs {
        let result = match job {
            Job::Retry(record) => redeliver(pipeline, &record).await,
            Job::Fresh(invoice) => pipeline.deliver_invoice(&invoice).await,
            Job::Stale(record, cutoff) => match pipeline.resolve_stale(&record, cutoff).await {
                Ok(true) => {
                    report.stale_resolved += 1;
                    redeliver(pipeline, &record).await
                }
                Ok(false) => continue,
                Err(err) => Err(err),
            },
        };

        report.record(&result);
        if let Err(err) = result {
            warn!(category = err.category(), error = %err, "Recovery delivery failed");
            if matches!(
                err,
                LedgerError::ChainIntegrity { .. } | LedgerError::TenantHalted { .. }
            ) {
                break;
            }
        }
    }
    report
}

/// Re-run an existing record with the freshest invoice snapshot available.
async fn redeliver(pipeline: &DeliveryPipeline, record: &ComplianceRecord) -> Result<DeliveryOutcome> {
    let invoice = match pipeline.directory().invoice(&record.invoice_id).await? {
        Some(invoice) => invoice,
        None => record.invoice.clone(),
    };
    pipeline
        .metrics()
        .inc_counter(metric_names::RETRIES_TOTAL)
        .await;
    pipeline.deliver_invoice(&invoice).await
}

/// Instant `age` ago, saturating at the earliest representable time.
fn age_cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
