//! SQLite certificate store

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

use super::{from_millis, parse_uuid, to_millis};
use crate::domain::{CertificateMaterial, CertificateMetadata, TenantId};
use crate::infra::{CertificateStore, LedgerError, Result};

#[derive(Clone)]
pub struct SqliteCertificateStore {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct CertificateRow {
    tenant_id: String,
    certificate_ciphertext: Vec<u8>,
    passphrase_ciphertext: Vec<u8>,
    subject: String,
    issuer: String,
    serial_number: String,
    not_before: i64,
    expires_at: i64,
    uploaded_at: i64,
}

impl TryFrom<CertificateRow> for CertificateMaterial {
    type Error = LedgerError;

    fn try_from(row: CertificateRow) -> Result<Self> {
        Ok(CertificateMaterial {
            tenant_id: TenantId::from_uuid(parse_uuid(&row.tenant_id)?),
            certificate_ciphertext: row.certificate_ciphertext,
            passphrase_ciphertext: row.passphrase_ciphertext,
            metadata: CertificateMetadata {
                subject: row.subject,
                issuer: row.issuer,
                serial_number: row.serial_number,
                not_before: from_millis(row.not_before)?,
                not_after: from_millis(row.expires_at)?,
            },
            uploaded_at: from_millis(row.uploaded_at)?,
        })
    }
}

impl SqliteCertificateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CertificateStore for SqliteCertificateStore {
    async fn get_certificate(&self, tenant_id: &TenantId) -> Result<Option<CertificateMaterial>> {
        let row: Option<CertificateRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, certificate_ciphertext, passphrase_ciphertext, subject, issuer,
                   serial_number, not_before, expires_at, uploaded_at
            FROM tenant_certificates
            WHERE tenant_id = ?
            "#,
        )
        .bind(tenant_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(CertificateMaterial::try_from).transpose()
    }

    async fn put_certificate(&self, material: &CertificateMaterial) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_certificates (
                tenant_id, certificate_ciphertext, passphrase_ciphertext, subject, issuer,
                serial_number, not_before, expires_at, uploaded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tenant_id) DO UPDATE SET
                certificate_ciphertext = excluded.certificate_ciphertext,
                passphrase_ciphertext = excluded.passphrase_ciphertext,
                subject = excluded.subject,
                issuer = excluded.issuer,
                serial_number = excluded.serial_number,
                not_before = excluded.not_before,
                expires_at = excluded.expires_at,
                uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(material.tenant_id.to_string())
        .bind(&material.certificate_ciphertext)
        .bind(&material.passphrase_ciphertext)
        .bind(&material.metadata.subject)
        .bind(&material.metadata.issuer)
        .bind(&material.metadata.serial_number)
        .bind(to_millis(material.metadata.not_before))
        .bind(to_millis(material.metadata.not_after))
        .bind(to_millis(material.uploaded_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_certificate(&self, tenant_id: &TenantId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tenant_certificates WHERE tenant_id = ?")
            .bind(tenant_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
