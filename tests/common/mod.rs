//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509NameBuilder, X509};
use rust_decimal_macros::dec;

use compliance_ledger::authority::{AuthorityClient, SimulatedAuthority};
use compliance_ledger::crypto::{generate_key, CertificateVault, ChainSecret};
use compliance_ledger::domain::{Counterparty, LineItem};
use compliance_ledger::infra::{
    CertificateStore, InMemoryInvoiceDirectory, SqliteCertificateStore, SqliteDeliveryLedger,
    TenantLocks,
};
use compliance_ledger::pipeline::{DeliveryPipeline, PipelineConfig, RecoveryConfig};
use compliance_ledger::{InvoiceId, InvoiceSnapshot, TenantId, TenantIdentity};

pub const PASSPHRASE: &str = "correct horse";

/// Fixed chain secret shared by every pipeline of a test
pub fn chain_secret() -> ChainSecret {
    ChainSecret::new(b"integration-test-chain-secret-0123456789".to_vec())
}

/// PKCS#12 container holding a self-signed RSA certificate
pub fn pkcs12_container(
    common_name: &str,
    passphrase: &str,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Vec<u8> {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    name.append_entry_by_text("C", "ES").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(rand::random::<u32>())
        .unwrap()
        .to_asn1_integer()
        .unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(not_before.timestamp()).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(not_after.timestamp()).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let mut pkcs12 = Pkcs12::builder();
    pkcs12.name(common_name).pkey(&key).cert(&cert);
    pkcs12.build2(passphrase).unwrap().to_der().unwrap()
}

/// Certificate valid from yesterday for another 90 days
pub fn valid_container(common_name: &str) -> Vec<u8> {
    let now = Utc::now();
    pkcs12_container(
        common_name,
        PASSPHRASE,
        now - chrono::Duration::days(1),
        now + chrono::Duration::days(90),
    )
}

/// Recovery settings that pick up everything immediately
pub fn eager_recovery() -> RecoveryConfig {
    RecoveryConfig {
        interval: Duration::from_secs(3600),
        cooldown: Duration::ZERO,
        batch_size: 100,
        concurrency: 4,
        max_retries: Some(20),
        retry_rejected: true,
        stale_after: Duration::ZERO,
    }
}

/// Let stored timestamps fall strictly behind a zero-age cutoff.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

/// SQLite-backed ledger, stores and vault for one test
pub struct TestLedger {
    pub ledger: Arc<SqliteDeliveryLedger>,
    pub certificates: Arc<SqliteCertificateStore>,
    pub directory: Arc<InMemoryInvoiceDirectory>,
    pub vault: Arc<CertificateVault>,
}

impl TestLedger {
    pub async fn new() -> Self {
        let ledger = Arc::new(SqliteDeliveryLedger::in_memory().await.unwrap());
        let certificates = Arc::new(SqliteCertificateStore::new(ledger.pool().clone()));
        Self {
            ledger,
            certificates,
            directory: Arc::new(InMemoryInvoiceDirectory::new()),
            vault: Arc::new(CertificateVault::new(vec![generate_key()]).unwrap()),
        }
    }

    /// Register a tenant identity with the directory
    pub async fn tenant(&self, legal_name: &str, tax_id: &str) -> TenantIdentity {
        let tenant = TenantIdentity {
            tenant_id: TenantId::new(),
            legal_name: legal_name.to_string(),
            tax_id: tax_id.to_string(),
        };
        self.directory.insert_tenant(tenant.clone()).await;
        tenant
    }

    /// Encrypt and store a valid certificate for the tenant
    pub async fn install_certificate(&self, tenant_id: &TenantId) {
        let raw = valid_container("Integration Tenant");
        self.install_container(tenant_id, &raw).await;
    }

    pub async fn install_container(&self, tenant_id: &TenantId, raw: &[u8]) {
        let now = Utc::now();
        let material = self
            .vault
            .encrypt_at(tenant_id, raw, PASSPHRASE, now)
            .unwrap()
            .into_material(*tenant_id, now);
        self.certificates.put_certificate(&material).await.unwrap();
    }

    pub fn pipeline(&self, authority: Arc<dyn AuthorityClient>) -> DeliveryPipeline {
        DeliveryPipeline::new(
            self.ledger.clone(),
            self.certificates.clone(),
            self.directory.clone(),
            authority,
            self.vault.clone(),
            chain_secret(),
            PipelineConfig::default(),
        )
    }

    /// Pipeline with its own tenant locks, as a second process would have
    pub fn independent_pipeline(&self, authority: Arc<dyn AuthorityClient>) -> DeliveryPipeline {
        self.pipeline(authority)
            .with_locks(Arc::new(TenantLocks::new()))
    }
}

/// Simulator that answers immediately
pub fn simulator() -> Arc<SimulatedAuthority> {
    Arc::new(SimulatedAuthority::new(Duration::ZERO))
}

/// Complete invoice with one line at 21%
pub fn invoice(tenant_id: TenantId, number: &str) -> InvoiceSnapshot {
    InvoiceSnapshot {
        invoice_id: InvoiceId::new(),
        tenant_id,
        series: "F".to_string(),
        number: number.to_string(),
        issue_date: NaiveDate::from_ymd_opt(2025, 6, 2),
        counterparty: Some(Counterparty {
            tax_id: "12345678Z".to_string(),
            name: "Lucía Gómez".to_string(),
        }),
        description: Some("Servicios de consultoría".to_string()),
        lines: vec![LineItem {
            description: "Consultoría".to_string(),
            quantity: dec!(2),
            unit_price: dec!(50),
            tax_rate: dec!(21),
        }],
        total: Some(dec!(121.00)),
    }
}
