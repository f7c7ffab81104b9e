//! Postgres-backed integration tests.
//!
//! These are ignored by default and are intended to run in CI (or locally)
//! with `DATABASE_URL` set.

mod common;

use std::sync::Arc;

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;

use common::{eager_recovery, invoice, settle, simulator, valid_container, PASSPHRASE};
use compliance_ledger::authority::{AuthorityClient, SimulatorMode};
use compliance_ledger::crypto::{generate_key, CertificateVault};
use compliance_ledger::infra::{
    CertificateStore, DeliveryLedger, InvoiceDirectory, PgCertificateStore, PgDeliveryLedger,
    PgInvoiceDirectory, TenantLocks,
};
use compliance_ledger::pipeline::{DeliveryPipeline, PipelineConfig, RecoveryEngine};
use compliance_ledger::{RecordStatus, TenantId, TenantIdentity};

async fn connect_db() -> Option<sqlx::PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&url)
        .await
        .ok()?;
    Some(pool)
}

struct PgFixture {
    ledger: Arc<PgDeliveryLedger>,
    certificates: Arc<PgCertificateStore>,
    directory: Arc<PgInvoiceDirectory>,
    vault: Arc<CertificateVault>,
    tenant: TenantIdentity,
}

impl PgFixture {
    async fn new(pool: sqlx::PgPool) -> Self {
        compliance_ledger::migrations::run_postgres(&pool)
            .await
            .unwrap();

        let fixture = Self {
            ledger: Arc::new(PgDeliveryLedger::new(pool.clone())),
            certificates: Arc::new(PgCertificateStore::new(pool.clone())),
            directory: Arc::new(PgInvoiceDirectory::new(pool)),
            vault: Arc::new(CertificateVault::new(vec![generate_key()]).unwrap()),
            tenant: TenantIdentity {
                tenant_id: TenantId::new(),
                legal_name: "Postgres Pruebas S.L.".to_string(),
                tax_id: "B20202020".to_string(),
            },
        };
        fixture.directory.publish_tenant(&fixture.tenant).await.unwrap();

        let now = Utc::now();
        let material = fixture
            .vault
            .encrypt_at(
                &fixture.tenant.tenant_id,
                &valid_container("Postgres Tenant"),
                PASSPHRASE,
                now,
            )
            .unwrap()
            .into_material(fixture.tenant.tenant_id, now);
        fixture.certificates.put_certificate(&material).await.unwrap();
        fixture
    }

    fn pipeline(&self, authority: Arc<dyn AuthorityClient>) -> DeliveryPipeline {
        DeliveryPipeline::new(
            self.ledger.clone(),
            self.certificates.clone(),
            self.directory.clone(),
            authority,
            self.vault.clone(),
            common::chain_secret(),
            PipelineConfig::default(),
        )
        .with_locks(Arc::new(TenantLocks::new()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn postgres_concurrent_pipelines_keep_one_chain() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let fixture = PgFixture::new(pool).await;
    let tenant_id = fixture.tenant.tenant_id;

    let tasks: usize = 4;
    let per_task: usize = 5;
    let mut handles = Vec::new();
    for task in 0..tasks {
        // Separate locks per task: only the database CAS serializes them.
        let pipeline = Arc::new(fixture.pipeline(simulator()));
        handles.push(tokio::spawn(async move {
            for n in 0..per_task {
                let inv = invoice(tenant_id, &format!("T{task}-{n}"));
                let outcome = pipeline.deliver_invoice(&inv).await.unwrap();
                assert!(outcome.is_accepted());
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let links = fixture
        .ledger
        .chain_links(&tenant_id, 0, 1000)
        .await
        .unwrap();
    assert_eq!(links.len(), tasks * per_task);
    let mut previous = String::new();
    for (index, link) in links.iter().enumerate() {
        assert_eq!(link.seq, index as u64 + 1);
        assert_eq!(link.previous_digest, previous);
        previous = link.digest.clone();
    }

    let stats = fixture.ledger.stats(&tenant_id).await.unwrap();
    assert_eq!(stats.accepted, (tasks * per_task) as u64);
}

#[tokio::test]
#[ignore]
async fn postgres_inbox_invoices_are_delivered_and_marked_compliant() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let fixture = PgFixture::new(pool).await;
    let inv = invoice(fixture.tenant.tenant_id, "PG-1");
    fixture.directory.publish_invoice(&inv).await.unwrap();

    let stored = fixture.directory.invoice(&inv.invoice_id).await.unwrap();
    assert_eq!(stored.as_ref(), Some(&inv));

    let pipeline = Arc::new(fixture.pipeline(simulator()));
    let outcome = pipeline.deliver_invoice(&inv).await.unwrap();
    assert!(outcome.is_accepted());

    let code = fixture
        .directory
        .compliance_code(&inv.invoice_id)
        .await
        .unwrap();
    assert_eq!(code, outcome.record().unwrap().confirmation_code);

    let unreported = fixture.directory.unreported_invoices(None, 1000).await.unwrap();
    assert!(unreported.iter().all(|i| i.invoice_id != inv.invoice_id));
}

#[tokio::test]
#[ignore]
async fn postgres_inbox_skips_tenants_that_cannot_deliver() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let fixture = PgFixture::new(pool).await;

    let uncertified = TenantIdentity {
        tenant_id: TenantId::new(),
        legal_name: "Sin Certificado S.L.".to_string(),
        tax_id: "B21212121".to_string(),
    };
    fixture.directory.publish_tenant(&uncertified).await.unwrap();
    let blocked = invoice(uncertified.tenant_id, "PG-U1");
    fixture.directory.publish_invoice(&blocked).await.unwrap();

    let deliverable = invoice(fixture.tenant.tenant_id, "PG-D1");
    fixture.directory.publish_invoice(&deliverable).await.unwrap();
    let already_recorded = invoice(fixture.tenant.tenant_id, "PG-D2");
    fixture.directory.publish_invoice(&already_recorded).await.unwrap();
    fixture
        .ledger
        .save_record(&compliance_ledger::ComplianceRecord::new(already_recorded.clone()))
        .await
        .unwrap();

    let unreported = fixture.directory.unreported_invoices(None, 10_000).await.unwrap();
    let ids: Vec<_> = unreported.iter().map(|i| i.invoice_id).collect();
    assert!(ids.contains(&deliverable.invoice_id));
    assert!(!ids.contains(&blocked.invoice_id));
    assert!(!ids.contains(&already_recorded.invoice_id));

    let after = fixture
        .directory
        .unreported_invoices(Some(deliverable.invoice_id), 10_000)
        .await
        .unwrap();
    assert!(after.iter().all(|i| i.invoice_id != deliverable.invoice_id));

    fixture
        .ledger
        .halt_tenant(&fixture.tenant.tenant_id, "inbox test halt")
        .await
        .unwrap();
    let unreported = fixture.directory.unreported_invoices(None, 10_000).await.unwrap();
    assert!(unreported.iter().all(|i| i.invoice_id != deliverable.invoice_id));
}

#[tokio::test]
#[ignore]
async fn postgres_rejected_records_are_retried_by_recovery() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let fixture = PgFixture::new(pool).await;
    let authority = simulator();
    authority.set_mode(SimulatorMode::RejectAll {
        code: "4102".to_string(),
        message: "El XML no cumple el esquema".to_string(),
    });
    let pipeline = Arc::new(fixture.pipeline(authority.clone()));

    let inv = invoice(fixture.tenant.tenant_id, "PG-R1");
    let first = pipeline.deliver_invoice(&inv).await.unwrap();
    assert_eq!(first.status(), Some(RecordStatus::Rejected));

    authority.set_mode(SimulatorMode::AcceptAll);
    settle().await;
    let engine = RecoveryEngine::new(pipeline.clone(), eager_recovery());
    engine.process_pending_invoices().await.unwrap();

    let record = fixture
        .ledger
        .find_by_invoice(&inv.invoice_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, RecordStatus::Accepted);
    assert_eq!(record.retry_count, 1);
}

#[tokio::test]
#[ignore]
async fn postgres_halt_and_resume() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let fixture = PgFixture::new(pool).await;
    let tenant_id = fixture.tenant.tenant_id;

    fixture
        .ledger
        .halt_tenant(&tenant_id, "manual test halt")
        .await
        .unwrap();
    let halt = fixture.ledger.tenant_halt(&tenant_id).await.unwrap().unwrap();
    assert_eq!(halt.reason, "manual test halt");

    let pipeline = fixture.pipeline(simulator());
    let err = pipeline
        .deliver_invoice(&invoice(tenant_id, "PG-H1"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "chain_integrity");

    assert!(fixture.ledger.resume_tenant(&tenant_id).await.unwrap());
    assert!(fixture.ledger.tenant_halt(&tenant_id).await.unwrap().is_none());
}
