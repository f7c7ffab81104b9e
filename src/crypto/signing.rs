//! Document signer
//!
//! Produces an enveloped XML-DSig style signature: the SHA-256 digest of
//! the unsigned document goes into `SignedInfo`, `SignedInfo` (exactly as
//! emitted) is signed with the tenant key, and the block is inserted as the
//! last child of the document's root element.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use openssl::hash::MessageDigest;
use openssl::pkey::{Id, PKey};
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;
use sha2::{Digest, Sha256};

use crate::crypto::container::ParsedContainer;
use crate::crypto::vault::{is_expired, CertificateVault};
use crate::domain::CertificateMaterial;
use crate::infra::{CertificateError, LedgerError};

pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const ALG_C14N_EXCLUSIVE: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ALG_ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const ALG_DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const ALG_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const ALG_ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";

const SIGNATURE_OPEN: &str = "<ds:Signature ";
const SIGNATURE_CLOSE: &str = "</ds:Signature>";
const SIGNED_INFO_OPEN: &str = "<ds:SignedInfo>";
const SIGNED_INFO_CLOSE: &str = "</ds:SignedInfo>";

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("key extraction failed: {0}")]
    KeyExtraction(String),

    #[error("unsupported key type: {0:?}")]
    UnsupportedKey(Id),

    #[error("signature computation failed: {0}")]
    Signature(String),

    #[error("document has no root element to carry the signature")]
    MalformedDocument,

    #[error("signed document is missing {0}")]
    MissingElement(&'static str),

    #[error("document digest does not match the signed digest")]
    DigestMismatch,

    #[error("signature does not verify against the embedded certificate")]
    BadSignature,
}

impl From<SigningError> for LedgerError {
    fn from(err: SigningError) -> Self {
        LedgerError::Signing(err.to_string())
    }
}

/// Facts about a verified signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub document_digest: String,
    pub signature_algorithm: String,
    pub certificate_der: Vec<u8>,
}

pub fn document_digest(document: &str) -> String {
    BASE64.encode(Sha256::digest(document.as_bytes()))
}

fn signed_info(signature_algorithm: &str, digest_b64: &str) -> String {
    format!(
        "{SIGNED_INFO_OPEN}\
<ds:CanonicalizationMethod Algorithm=\"{ALG_C14N_EXCLUSIVE}\"/>\
<ds:SignatureMethod Algorithm=\"{signature_algorithm}\"/>\
<ds:Reference URI=\"\">\
<ds:Transforms><ds:Transform Algorithm=\"{ALG_ENVELOPED_SIGNATURE}\"/></ds:Transforms>\
<ds:DigestMethod Algorithm=\"{ALG_DIGEST_SHA256}\"/>\
<ds:DigestValue>{digest_b64}</ds:DigestValue>\
</ds:Reference>\
{SIGNED_INFO_CLOSE}"
    )
}

/// Sign with an already opened container.
pub fn sign_with(unsigned_document: &str, container: &ParsedContainer) -> Result<String, SigningError> {
    let key = PKey::private_key_from_pkcs8(&container.private_key_der)
        .map_err(|e| SigningError::KeyExtraction(e.to_string()))?;
    let algorithm = match key.id() {
        Id::RSA => ALG_RSA_SHA256,
        Id::EC => ALG_ECDSA_SHA256,
        other => return Err(SigningError::UnsupportedKey(other)),
    };

    let insert_at = unsigned_document
        .rfind("</")
        .ok_or(SigningError::MalformedDocument)?;

    let info = signed_info(algorithm, &document_digest(unsigned_document));

    let mut signer = Signer::new(MessageDigest::sha256(), &key)
        .map_err(|e| SigningError::Signature(e.to_string()))?;
    signer
        .update(info.as_bytes())
        .map_err(|e| SigningError::Signature(e.to_string()))?;
    let signature = signer
        .sign_to_vec()
        .map_err(|e| SigningError::Signature(e.to_string()))?;

    let block = format!(
        "<ds:Signature xmlns:ds=\"{XMLDSIG_NS}\">{info}\
<ds:SignatureValue>{}</ds:SignatureValue>\
<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>\
</ds:Signature>",
        BASE64.encode(signature),
        BASE64.encode(&container.certificate_der),
    );

    let mut signed = String::with_capacity(unsigned_document.len() + block.len());
    signed.push_str(&unsigned_document[..insert_at]);
    signed.push_str(&block);
    signed.push_str(&unsigned_document[insert_at..]);
    Ok(signed)
}

fn element<'a>(doc: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = doc.find(open)? + open.len();
    let end = start + doc[start..].find(close)?;
    Some(&doc[start..end])
}

/// Check a signed document against its embedded certificate.
pub fn verify_signed_document(signed_document: &str) -> Result<VerifiedSignature, SigningError> {
    let sig_start = signed_document
        .find(SIGNATURE_OPEN)
        .ok_or(SigningError::MissingElement("ds:Signature"))?;
    let sig_end = signed_document[sig_start..]
        .find(SIGNATURE_CLOSE)
        .map(|i| sig_start + i + SIGNATURE_CLOSE.len())
        .ok_or(SigningError::MissingElement("ds:Signature"))?;
    let block = &signed_document[sig_start..sig_end];

    let mut unsigned = String::with_capacity(signed_document.len() - block.len());
    unsigned.push_str(&signed_document[..sig_start]);
    unsigned.push_str(&signed_document[sig_end..]);

    let digest = element(block, "<ds:DigestValue>", "</ds:DigestValue>")
        .ok_or(SigningError::MissingElement("ds:DigestValue"))?;
    let computed = document_digest(&unsigned);
    if computed != digest {
        return Err(SigningError::DigestMismatch);
    }

    let info_body = element(block, SIGNED_INFO_OPEN, SIGNED_INFO_CLOSE)
        .ok_or(SigningError::MissingElement("ds:SignedInfo"))?;
    let info = format!("{SIGNED_INFO_OPEN}{info_body}{SIGNED_INFO_CLOSE}");
    let algorithm = element(info_body, "<ds:SignatureMethod Algorithm=\"", "\"")
        .ok_or(SigningError::MissingElement("ds:SignatureMethod"))?
        .to_string();

    let signature = element(block, "<ds:SignatureValue>", "</ds:SignatureValue>")
        .and_then(|v| BASE64.decode(v).ok())
        .ok_or(SigningError::MissingElement("ds:SignatureValue"))?;
    let certificate_der = element(block, "<ds:X509Certificate>", "</ds:X509Certificate>")
        .and_then(|v| BASE64.decode(v).ok())
        .ok_or(SigningError::MissingElement("ds:X509Certificate"))?;

    let public_key = X509::from_der(&certificate_der)
        .and_then(|cert| cert.public_key())
        .map_err(|e| SigningError::KeyExtraction(e.to_string()))?;
    let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key)
        .map_err(|e| SigningError::Signature(e.to_string()))?;
    verifier
        .update(info.as_bytes())
        .map_err(|e| SigningError::Signature(e.to_string()))?;
    if !verifier.verify(&signature).unwrap_or(false) {
        return Err(SigningError::BadSignature);
    }

    Ok(VerifiedSignature {
        document_digest: computed,
        signature_algorithm: algorithm,
        certificate_der,
    })
}

/// Signs composed documents with the tenant's vaulted certificate.
#[derive(Clone)]
pub struct DocumentSigner {
    vault: Arc<CertificateVault>,
}

impl DocumentSigner {
    pub fn new(vault: Arc<CertificateVault>) -> Self {
        Self { vault }
    }

    pub fn sign(
        &self,
        unsigned_document: &str,
        material: &CertificateMaterial,
    ) -> Result<String, LedgerError> {
        self.sign_at(unsigned_document, material, Utc::now())
    }

    /// Undecryptable material is a certificate error; anything that goes
    /// wrong after decryption is a signing error.
    pub fn sign_at(
        &self,
        unsigned_document: &str,
        material: &CertificateMaterial,
        now: DateTime<Utc>,
    ) -> Result<String, LedgerError> {
        if is_expired(material.expires_at(), now) {
            return Err(CertificateError::Expired(material.expires_at()).into());
        }

        let container = self.vault.open(material).map_err(|e| match e {
            CertificateError::DecryptionFailed(_) => LedgerError::Certificate(e),
            other => LedgerError::Signing(format!("key extraction failed: {other}")),
        })?;

        Ok(sign_with(unsigned_document, &container)?)
    }
}
