//! PostgreSQL certificate store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{CertificateMaterial, CertificateMetadata, TenantId};
use crate::infra::{CertificateStore, Result};

#[derive(Clone)]
pub struct PgCertificateStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct CertificateRow {
    tenant_id: Uuid,
    certificate_ciphertext: Vec<u8>,
    passphrase_ciphertext: Vec<u8>,
    subject: String,
    issuer: String,
    serial_number: String,
    not_before: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    uploaded_at: DateTime<Utc>,
}

impl From<CertificateRow> for CertificateMaterial {
    fn from(row: CertificateRow) -> Self {
        CertificateMaterial {
            tenant_id: TenantId::from_uuid(row.tenant_id),
            certificate_ciphertext: row.certificate_ciphertext,
            passphrase_ciphertext: row.passphrase_ciphertext,
            metadata: CertificateMetadata {
                subject: row.subject,
                issuer: row.issuer,
                serial_number: row.serial_number,
                not_before: row.not_before,
                not_after: row.expires_at,
            },
            uploaded_at: row.uploaded_at,
        }
    }
}

impl PgCertificateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CertificateStore for PgCertificateStore {
    async fn get_certificate(&self, tenant_id: &TenantId) -> Result<Option<CertificateMaterial>> {
        let row: Option<CertificateRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, certificate_ciphertext, passphrase_ciphertext, subject, issuer,
                   serial_number, not_before, expires_at, uploaded_at
            FROM tenant_certificates
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CertificateMaterial::from))
    }

    #[instrument(skip(self, material), fields(tenant_id = %material.tenant_id))]
    async fn put_certificate(&self, material: &CertificateMaterial) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_certificates (
                tenant_id, certificate_ciphertext, passphrase_ciphertext, subject, issuer,
                serial_number, not_before, expires_at, uploaded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id) DO UPDATE SET
                certificate_ciphertext = EXCLUDED.certificate_ciphertext,
                passphrase_ciphertext = EXCLUDED.passphrase_ciphertext,
                subject = EXCLUDED.subject,
                issuer = EXCLUDED.issuer,
                serial_number = EXCLUDED.serial_number,
                not_before = EXCLUDED.not_before,
                expires_at = EXCLUDED.expires_at,
                uploaded_at = EXCLUDED.uploaded_at
            "#,
        )
        .bind(material.tenant_id.0)
        .bind(&material.certificate_ciphertext)
        .bind(&material.passphrase_ciphertext)
        .bind(&material.metadata.subject)
        .bind(&material.metadata.issuer)
        .bind(&material.metadata.serial_number)
        .bind(material.metadata.not_before)
        .bind(material.metadata.not_after)
        .bind(material.uploaded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_certificate(&self, tenant_id: &TenantId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tenant_certificates WHERE tenant_id = $1")
            .bind(tenant_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
