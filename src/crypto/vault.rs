//! Certificate vault
//!
//! Validates tenant certificate containers at upload and keeps them, and
//! their passphrases, encrypted at rest. Expiry is advisory metadata here;
//! refusing to sign with an expired certificate is the pipeline's job.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::container::{ContainerParser, ParsedContainer, Pkcs12Parser};
use crate::crypto::encrypt::{
    compute_vault_aad, decrypt_at_rest, encrypt_at_rest, BlobPurpose, EncryptionKey,
};
use crate::domain::{CertificateMaterial, CertificateMetadata, CertificateStatus, TenantId};
use crate::infra::CertificateError;

/// Default warning window before expiry.
pub const EXPIRING_SOON_DAYS: i64 = 30;

pub fn is_expired(expiry: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= expiry
}

pub fn is_expiring_soon(expiry: DateTime<Utc>, now: DateTime<Utc>, threshold_days: i64) -> bool {
    !is_expired(expiry, now) && expiry - now <= Duration::days(threshold_days)
}

/// Whole days left, negative once expired.
pub fn days_remaining(expiry: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expiry - now).num_days()
}

pub fn certificate_status(
    material: Option<&CertificateMaterial>,
    now: DateTime<Utc>,
) -> CertificateStatus {
    let Some(material) = material else {
        return CertificateStatus::default();
    };
    let expiry = material.expires_at();
    CertificateStatus {
        has_certificate: true,
        expires_at: Some(expiry),
        expired: is_expired(expiry, now),
        expiring_soon: is_expiring_soon(expiry, now, EXPIRING_SOON_DAYS),
        days_remaining: Some(days_remaining(expiry, now)),
        subject: Some(material.metadata.subject.clone()),
    }
}

/// Output of [`CertificateVault::encrypt`].
#[derive(Debug, Clone)]
pub struct SealedCertificate {
    pub certificate_ciphertext: Vec<u8>,
    pub passphrase_ciphertext: Vec<u8>,
    pub metadata: CertificateMetadata,
}

impl SealedCertificate {
    pub fn expiry(&self) -> DateTime<Utc> {
        self.metadata.not_after
    }

    pub fn into_material(self, tenant_id: TenantId, uploaded_at: DateTime<Utc>) -> CertificateMaterial {
        CertificateMaterial {
            tenant_id,
            certificate_ciphertext: self.certificate_ciphertext,
            passphrase_ciphertext: self.passphrase_ciphertext,
            metadata: self.metadata,
            uploaded_at,
        }
    }
}

pub struct CertificateVault {
    /// First key encrypts; every key is tried on decrypt.
    keyring: Vec<EncryptionKey>,
    parser: Arc<dyn ContainerParser>,
}

impl CertificateVault {
    pub fn new(keyring: Vec<EncryptionKey>) -> Result<Self, CertificateError> {
        Self::with_parser(keyring, Arc::new(Pkcs12Parser))
    }

    pub fn with_parser(
        keyring: Vec<EncryptionKey>,
        parser: Arc<dyn ContainerParser>,
    ) -> Result<Self, CertificateError> {
        if keyring.is_empty() {
            return Err(CertificateError::Encryption(
                "vault keyring is empty".to_string(),
            ));
        }
        Ok(Self { keyring, parser })
    }

    /// Validate a container and encrypt it with its passphrase.
    pub fn encrypt(
        &self,
        tenant_id: &TenantId,
        raw_container: &[u8],
        passphrase: &str,
    ) -> Result<SealedCertificate, CertificateError> {
        self.encrypt_at(tenant_id, raw_container, passphrase, Utc::now())
    }

    pub fn encrypt_at(
        &self,
        tenant_id: &TenantId,
        raw_container: &[u8],
        passphrase: &str,
        now: DateTime<Utc>,
    ) -> Result<SealedCertificate, CertificateError> {
        let parsed = self.parser.parse(raw_container, passphrase)?;
        let metadata = parsed.metadata;

        if now < metadata.not_before {
            return Err(CertificateError::NotYetValid(metadata.not_before));
        }
        if is_expired(metadata.not_after, now) {
            return Err(CertificateError::Expired(metadata.not_after));
        }

        let key = &self.keyring[0];
        let certificate_ciphertext = encrypt_at_rest(
            key,
            &compute_vault_aad(tenant_id, BlobPurpose::CertificateContainer),
            raw_container,
        )
        .map_err(|e| CertificateError::Encryption(e.to_string()))?;
        let passphrase_ciphertext = encrypt_at_rest(
            key,
            &compute_vault_aad(tenant_id, BlobPurpose::Passphrase),
            passphrase.as_bytes(),
        )
        .map_err(|e| CertificateError::Encryption(e.to_string()))?;

        Ok(SealedCertificate {
            certificate_ciphertext,
            passphrase_ciphertext,
            metadata,
        })
    }

    fn decrypt_blob(
        &self,
        tenant_id: &TenantId,
        purpose: BlobPurpose,
        blob: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CertificateError> {
        let aad = compute_vault_aad(tenant_id, purpose);
        let mut last_error = None;
        for key in &self.keyring {
            match decrypt_at_rest(key, &aad, blob) {
                Ok(plaintext) => return Ok(Zeroizing::new(plaintext)),
                Err(e) => last_error = Some(e),
            }
        }
        Err(CertificateError::DecryptionFailed(format!(
            "{}: {}",
            purpose.as_str(),
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no keys".to_string())
        )))
    }

    /// Raw container bytes. A failure means corrupted storage and is fatal.
    pub fn decrypt(
        &self,
        material: &CertificateMaterial,
    ) -> Result<Zeroizing<Vec<u8>>, CertificateError> {
        self.decrypt_blob(
            &material.tenant_id,
            BlobPurpose::CertificateContainer,
            &material.certificate_ciphertext,
        )
    }

    pub fn decrypt_passphrase(
        &self,
        material: &CertificateMaterial,
    ) -> Result<Zeroizing<String>, CertificateError> {
        let mut bytes = self.decrypt_blob(
            &material.tenant_id,
            BlobPurpose::Passphrase,
            &material.passphrase_ciphertext,
        )?;
        let passphrase = String::from_utf8(std::mem::take(&mut *bytes)).map_err(|e| {
            let mut raw = e.into_bytes();
            raw.zeroize();
            CertificateError::DecryptionFailed("passphrase is not valid UTF-8".to_string())
        })?;
        Ok(Zeroizing::new(passphrase))
    }

    /// Decrypt and open the container for signing.
    pub fn open(&self, material: &CertificateMaterial) -> Result<ParsedContainer, CertificateError> {
        let container = self.decrypt(material)?;
        let passphrase = self.decrypt_passphrase(material)?;
        self.parser.parse(&container, &passphrase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt::generate_key;
    use crate::crypto::test_support::container;

    fn seal(vault: &CertificateVault, tenant: TenantId, days_valid: i64) -> CertificateMaterial {
        let now = Utc::now();
        let bytes = container(
            "Tenant Cert",
            "pw",
            now - Duration::days(1),
            now + Duration::days(days_valid),
        );
        vault
            .encrypt(&tenant, &bytes, "pw")
            .unwrap()
            .into_material(tenant, now)
    }

    #[test]
    fn expiry_predicates() {
        let now = Utc::now();
        assert!(is_expired(now, now));
        assert!(is_expired(now - Duration::seconds(1), now));
        assert!(!is_expired(now + Duration::days(1), now));

        assert!(is_expiring_soon(now + Duration::days(29), now, 30));
        assert!(is_expiring_soon(now + Duration::days(30), now, 30));
        assert!(!is_expiring_soon(now + Duration::days(31), now, 30));
        assert!(!is_expiring_soon(now - Duration::days(1), now, 30));

        assert_eq!(days_remaining(now + Duration::days(10) + Duration::hours(1), now), 10);
        assert_eq!(days_remaining(now - Duration::days(2), now), -2);
    }

    #[test]
    fn encrypt_validates_and_roundtrips() {
        let vault = CertificateVault::new(vec![generate_key()]).unwrap();
        let tenant = TenantId::new();
        let material = seal(&vault, tenant, 365);

        assert!(material.metadata.subject.contains("Tenant Cert"));
        assert_eq!(vault.decrypt_passphrase(&material).unwrap().as_str(), "pw");
        let opened = vault.open(&material).unwrap();
        assert_eq!(opened.metadata, material.metadata);
    }

    #[test]
    fn rejects_certificates_outside_validity_window() {
        let vault = CertificateVault::new(vec![generate_key()]).unwrap();
        let tenant = TenantId::new();
        let now = Utc::now();

        let expired = container("Old", "pw", now - Duration::days(30), now - Duration::days(1));
        assert!(matches!(
            vault.encrypt(&tenant, &expired, "pw"),
            Err(CertificateError::Expired(_))
        ));

        let future = container("New", "pw", now + Duration::days(2), now + Duration::days(30));
        assert!(matches!(
            vault.encrypt(&tenant, &future, "pw"),
            Err(CertificateError::NotYetValid(_))
        ));

        let ok = container("Ok", "pw", now - Duration::days(1), now + Duration::days(30));
        assert!(matches!(
            vault.encrypt(&tenant, &ok, "wrong"),
            Err(CertificateError::WrongPassphrase)
        ));
    }

    #[test]
    fn tampered_material_fails_decryption() {
        let vault = CertificateVault::new(vec![generate_key()]).unwrap();
        let tenant = TenantId::new();
        let mut material = seal(&vault, tenant, 30);
        let last = material.certificate_ciphertext.len() - 1;
        material.certificate_ciphertext[last] ^= 0xff;
        assert!(matches!(
            vault.decrypt(&material),
            Err(CertificateError::DecryptionFailed(_))
        ));

        let mut moved = seal(&vault, tenant, 30);
        moved.tenant_id = TenantId::new();
        assert!(vault.decrypt_passphrase(&moved).is_err());
    }

    #[test]
    fn rotated_keyring_still_decrypts_old_material() {
        let old_key = generate_key();
        let old_vault = CertificateVault::new(vec![old_key]).unwrap();
        let tenant = TenantId::new();
        let material = seal(&old_vault, tenant, 30);

        let rotated = CertificateVault::new(vec![generate_key(), old_key]).unwrap();
        assert!(rotated.open(&material).is_ok());

        let unrelated = CertificateVault::new(vec![generate_key()]).unwrap();
        assert!(matches!(
            unrelated.open(&material),
            Err(CertificateError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn status_reports_expiry_window() {
        let vault = CertificateVault::new(vec![generate_key()]).unwrap();
        let tenant = TenantId::new();
        let material = seal(&vault, tenant, 10);

        let status = certificate_status(Some(&material), Utc::now());
        assert!(status.has_certificate);
        assert!(status.expiring_soon);
        assert!(!status.expired);
        assert_eq!(status.days_remaining, Some(9));

        let absent = certificate_status(None, Utc::now());
        assert!(!absent.has_certificate);
        assert_eq!(absent.expires_at, None);
    }

    #[test]
    fn empty_keyring_is_rejected() {
        assert!(CertificateVault::new(vec![]).is_err());
    }
}
