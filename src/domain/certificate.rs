//! Tenant signing certificate material.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TenantId;

/// Plaintext metadata extracted at upload time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMetadata {
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Encrypted container and passphrase for one tenant.
///
/// `metadata.not_after` is kept in clear so expiry can be checked without
/// touching the ciphertexts.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMaterial {
    pub tenant_id: TenantId,
    pub certificate_ciphertext: Vec<u8>,
    pub passphrase_ciphertext: Vec<u8>,
    pub metadata: CertificateMetadata,
    pub uploaded_at: DateTime<Utc>,
}

impl CertificateMaterial {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.metadata.not_after
    }
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("tenant_id", &self.tenant_id)
            .field("certificate_ciphertext", &format_args!("[{} bytes]", self.certificate_ciphertext.len()))
            .field("passphrase_ciphertext", &"[redacted]")
            .field("metadata", &self.metadata)
            .field("uploaded_at", &self.uploaded_at)
            .finish()
    }
}

/// Answer to "can this tenant sign, and for how long".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateStatus {
    pub has_certificate: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
    pub expiring_soon: bool,
    pub days_remaining: Option<i64>,
    pub subject: Option<String>,
}
