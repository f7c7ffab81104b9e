//! Encryption at rest (AES-256-GCM)
//!
//! Blob format: `VAULT_ATREST_MAGIC_V1 || nonce(12) || ciphertext_with_tag`.
//! The AAD binds every blob to its tenant and purpose, so a stored
//! passphrase cannot be swapped into another tenant's row and still decrypt.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::domain::TenantId;

/// Encryption key (32 bytes for AES-256)
pub type EncryptionKey = [u8; 32];

/// 32-byte SHA-256 output
pub type Hash256 = [u8; 32];

pub const NONCE_SIZE: usize = 12;

pub const TAG_SIZE: usize = 16;

/// Domain prefix for vault AAD.
pub const DOMAIN_VAULT_AAD_V1: &[u8] = b"COMPLIANCE_LEDGER_VAULT_AAD_V1";

/// Magic prefix for encrypted blobs.
pub const VAULT_ATREST_MAGIC_V1: &[u8; 4] = b"CLV1";

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid ciphertext length")]
    InvalidCiphertext,

    #[error("not an at-rest blob (missing magic prefix)")]
    InvalidPayloadFormat,
}

/// What an encrypted blob holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobPurpose {
    CertificateContainer,
    Passphrase,
}

impl BlobPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobPurpose::CertificateContainer => "certificate_container",
            BlobPurpose::Passphrase => "certificate_passphrase",
        }
    }
}

fn encode_string(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

/// AAD for a vault blob.
pub fn compute_vault_aad(tenant_id: &TenantId, purpose: BlobPurpose) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_VAULT_AAD_V1);
    hasher.update(tenant_id.0.as_bytes());
    hasher.update(encode_string(purpose.as_str()));
    hasher.finalize().into()
}

pub fn is_encrypted_at_rest(data: &[u8]) -> bool {
    data.len() >= VAULT_ATREST_MAGIC_V1.len()
        && &data[..VAULT_ATREST_MAGIC_V1.len()] == VAULT_ATREST_MAGIC_V1
}

/// Encrypt with a fresh random nonce.
pub fn encrypt_at_rest(
    key: &EncryptionKey,
    aad: &Hash256,
    plaintext: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext_with_tag = cipher
        .encrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

    let mut result =
        Vec::with_capacity(VAULT_ATREST_MAGIC_V1.len() + NONCE_SIZE + ciphertext_with_tag.len());
    result.extend_from_slice(VAULT_ATREST_MAGIC_V1);
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext_with_tag);
    Ok(result)
}

pub fn decrypt_at_rest(
    key: &EncryptionKey,
    aad: &Hash256,
    ciphertext: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let header_len = VAULT_ATREST_MAGIC_V1.len() + NONCE_SIZE;
    if ciphertext.len() < header_len + TAG_SIZE {
        return Err(EncryptionError::InvalidCiphertext);
    }
    if !is_encrypted_at_rest(ciphertext) {
        return Err(EncryptionError::InvalidPayloadFormat);
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))?;

    let nonce = Nonce::from_slice(&ciphertext[VAULT_ATREST_MAGIC_V1.len()..header_len]);

    cipher
        .decrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: &ciphertext[header_len..],
                aad,
            },
        )
        .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))
}

pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Parse a 32-byte key given as hex (optionally `0x`-prefixed) or base64.
pub fn parse_key(s: &str) -> Result<EncryptionKey, String> {
    let trimmed = s.trim();
    let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);

    if hex_str.len() == 64 && hex_str.chars().all(|c| c.is_ascii_hexdigit()) {
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid key hex: {e}"))?;
        return bytes
            .try_into()
            .map_err(|_| "key must be 32 bytes".to_string());
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|e| format!("invalid key base64: {e}"))?;

    bytes
        .try_into()
        .map_err(|_| "key must be 32 bytes".to_string())
}

/// Parse a comma-separated keyring. The first key is the active one.
pub fn parse_keyring(s: &str) -> Result<Vec<EncryptionKey>, String> {
    let keys: Vec<&str> = s
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .collect();
    if keys.is_empty() {
        return Err("keyring must contain at least one key".to_string());
    }
    keys.into_iter().map(parse_key).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_rest_roundtrip_and_format() {
        let key = generate_key();
        let aad = compute_vault_aad(&TenantId::new(), BlobPurpose::Passphrase);
        let blob = encrypt_at_rest(&key, &aad, b"hunter2").unwrap();
        assert!(is_encrypted_at_rest(&blob));
        assert_eq!(blob.len(), 4 + NONCE_SIZE + 7 + TAG_SIZE);
        assert_eq!(decrypt_at_rest(&key, &aad, &blob).unwrap(), b"hunter2");
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let key = generate_key();
        let aad = compute_vault_aad(&TenantId::new(), BlobPurpose::Passphrase);
        let a = encrypt_at_rest(&key, &aad, b"same").unwrap();
        let b = encrypt_at_rest(&key, &aad, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_and_wrong_context_fail() {
        let key = generate_key();
        let tenant = TenantId::new();
        let aad = compute_vault_aad(&tenant, BlobPurpose::CertificateContainer);
        let mut blob = encrypt_at_rest(&key, &aad, b"container").unwrap();

        let other_purpose = compute_vault_aad(&tenant, BlobPurpose::Passphrase);
        assert!(matches!(
            decrypt_at_rest(&key, &other_purpose, &blob),
            Err(EncryptionError::DecryptionFailed(_))
        ));

        let other_tenant = compute_vault_aad(&TenantId::new(), BlobPurpose::CertificateContainer);
        assert!(decrypt_at_rest(&key, &other_tenant, &blob).is_err());

        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(decrypt_at_rest(&key, &aad, &blob).is_err());

        assert!(matches!(
            decrypt_at_rest(&key, &aad, b"short"),
            Err(EncryptionError::InvalidCiphertext)
        ));
    }

    #[test]
    fn parses_hex_and_base64_keys() {
        let key = generate_key();
        assert_eq!(parse_key(&hex::encode(key)).unwrap(), key);
        assert_eq!(parse_key(&format!("0x{}", hex::encode(key))).unwrap(), key);
        let b64 = base64::engine::general_purpose::STANDARD.encode(key);
        assert_eq!(parse_key(&b64).unwrap(), key);
        assert!(parse_key("abcd").is_err());
    }

    #[test]
    fn keyring_keeps_order() {
        let a = generate_key();
        let b = generate_key();
        let ring = parse_keyring(&format!("{}, {} ,", hex::encode(a), hex::encode(b))).unwrap();
        assert_eq!(ring, vec![a, b]);
        assert!(parse_keyring(" , ").is_err());
    }
}
