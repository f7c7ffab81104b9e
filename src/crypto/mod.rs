//! Cryptographic building blocks for the compliance ledger
//!
//! - Keyed hash chain digests (HMAC-SHA256, per-tenant keys)
//! - At-rest encryption of certificate material (AES-256-GCM)
//! - Certificate container parsing (PKCS#12)
//! - The certificate vault
//! - Enveloped document signatures

pub mod chain;
pub mod container;
pub mod encrypt;
pub mod signing;
pub mod vault;

pub use chain::{canonical_message, compute_digest, verify_link, ChainSecret};
pub use container::{ContainerParser, ParsedContainer, Pkcs12Parser};
pub use encrypt::{generate_key, parse_key, parse_keyring, EncryptionKey};
pub use signing::{verify_signed_document, DocumentSigner, SigningError, VerifiedSignature};
pub use vault::{certificate_status, CertificateVault, SealedCertificate, EXPIRING_SOON_DAYS};
