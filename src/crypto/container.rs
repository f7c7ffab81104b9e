//! Certificate container adapter
//!
//! The only code that knows the container format. Everything else sees
//! `parse(bytes, passphrase) -> ParsedContainer`.

use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::pkcs12::Pkcs12;
use openssl::x509::{X509NameRef, X509};
use zeroize::Zeroizing;

use crate::domain::CertificateMetadata;
use crate::infra::CertificateError;

/// Certificate and key pulled out of a container.
pub struct ParsedContainer {
    /// DER-encoded X.509 signing certificate
    pub certificate_der: Vec<u8>,
    /// DER-encoded PKCS#8 private key
    pub private_key_der: Zeroizing<Vec<u8>>,
    pub metadata: CertificateMetadata,
}

impl std::fmt::Debug for ParsedContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedContainer")
            .field("certificate_der", &format_args!("[{} bytes]", self.certificate_der.len()))
            .field("private_key_der", &"[redacted]")
            .field("metadata", &self.metadata)
            .finish()
    }
}

pub trait ContainerParser: Send + Sync {
    /// Open the container. Fails with `InvalidCertificate` when the bytes are
    /// not a container holding exactly one certificate and its private key,
    /// and with `WrongPassphrase` when the container does not open.
    fn parse(&self, bytes: &[u8], passphrase: &str) -> Result<ParsedContainer, CertificateError>;
}

/// PKCS#12 (`.p12` / `.pfx`) containers.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pkcs12Parser;

fn invalid(message: impl std::fmt::Display) -> CertificateError {
    CertificateError::InvalidCertificate(message.to_string())
}

impl ContainerParser for Pkcs12Parser {
    fn parse(&self, bytes: &[u8], passphrase: &str) -> Result<ParsedContainer, CertificateError> {
        let pkcs12 = Pkcs12::from_der(bytes).map_err(invalid)?;
        let parsed = pkcs12
            .parse2(passphrase)
            .map_err(|_| CertificateError::WrongPassphrase)?;

        let certificate = parsed
            .cert
            .ok_or_else(|| invalid("container holds no certificate"))?;
        let key = parsed
            .pkey
            .ok_or_else(|| invalid("container holds no private key"))?;

        let extra = parsed.ca.as_ref().map(|chain| chain.len()).unwrap_or(0);
        if extra > 0 {
            return Err(invalid(format!(
                "container must hold exactly one certificate, found {}",
                extra + 1
            )));
        }

        let public = certificate.public_key().map_err(invalid)?;
        if !public.public_eq(&*key) {
            return Err(invalid("private key does not match the certificate"));
        }

        let metadata = metadata_of(&certificate)?;
        let certificate_der = certificate.to_der().map_err(invalid)?;
        let private_key_der = Zeroizing::new(key.private_key_to_pkcs8().map_err(invalid)?);

        Ok(ParsedContainer {
            certificate_der,
            private_key_der,
            metadata,
        })
    }
}

fn metadata_of(certificate: &X509) -> Result<CertificateMetadata, CertificateError> {
    let serial_number = certificate
        .serial_number()
        .to_bn()
        .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
        .map_err(invalid)?;

    Ok(CertificateMetadata {
        subject: name_to_string(certificate.subject_name()),
        issuer: name_to_string(certificate.issuer_name()),
        serial_number,
        not_before: asn1_to_utc(certificate.not_before())?,
        not_after: asn1_to_utc(certificate.not_after())?,
    })
}

fn name_to_string(name: &X509NameRef) -> String {
    name.entries()
        .filter_map(|entry| {
            let key = entry.object().nid().short_name().ok()?;
            let value = entry.data().as_utf8().ok()?;
            Some(format!("{key}={value}"))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn asn1_to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>, CertificateError> {
    let epoch = Asn1Time::from_unix(0).map_err(invalid)?;
    let diff = epoch.diff(time).map_err(invalid)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0).ok_or_else(|| invalid("certificate validity out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_support::{container, container_with_chain};
    use chrono::Duration;

    #[test]
    fn extracts_certificate_key_and_validity() {
        let now = Utc::now();
        let bytes = container("ACME SL", "s3cret", now - Duration::days(1), now + Duration::days(90));

        let parsed = Pkcs12Parser.parse(&bytes, "s3cret").unwrap();
        assert!(parsed.metadata.subject.contains("CN=ACME SL"));
        assert!(!parsed.certificate_der.is_empty());
        assert!(!parsed.private_key_der.is_empty());
        let skew = (parsed.metadata.not_after - (now + Duration::days(90))).num_seconds();
        assert!(skew.abs() <= 1, "validity end off by {skew}s");
    }

    #[test]
    fn wrong_passphrase_is_distinguished_from_garbage() {
        let now = Utc::now();
        let bytes = container("ACME SL", "right", now, now + Duration::days(1));
        assert!(matches!(
            Pkcs12Parser.parse(&bytes, "wrong"),
            Err(CertificateError::WrongPassphrase)
        ));
        assert!(matches!(
            Pkcs12Parser.parse(b"definitely not pkcs12", "right"),
            Err(CertificateError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn rejects_containers_with_more_than_one_certificate() {
        let bytes = container_with_chain("ACME SL", "pw");
        assert!(matches!(
            Pkcs12Parser.parse(&bytes, "pw"),
            Err(CertificateError::InvalidCertificate(msg)) if msg.contains("exactly one")
        ));
    }
}
