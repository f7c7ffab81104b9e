//! Hash chain builder
//!
//! Each compliance record carries a keyed digest over its business payload
//! and the previous record's digest:
//!
//! ```text
//! digest = HEX_UPPER(HMAC-SHA256(tenant_key,
//!     document_number | issue_date | total | counterparty_tax_id | previous_digest))
//! ```
//!
//! `issue_date` is `DD-MM-YYYY`, `total` has exactly two decimals and the
//! first record of a chain uses an empty `previous_digest`. The tenant key is
//! derived from the deployment secret, so an auditor handed one tenant's key
//! can recompute that tenant's chain and nothing else.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::domain::{ChainLink, ChainPayload, TenantId};

type HmacSha256 = Hmac<Sha256>;

/// Domain prefix for per-tenant chain key derivation.
pub const DOMAIN_CHAIN_KEY_V1: &[u8] = b"COMPLIANCE_LEDGER_CHAIN_KEY_V1";

/// Separator between canonical fields.
pub const FIELD_SEPARATOR: &str = "|";

/// Minimum accepted length of the deployment secret.
pub const MIN_SECRET_LEN: usize = 32;

/// HMAC key for a chain. `Debug` never prints the key.
#[derive(Clone)]
pub struct ChainSecret {
    key: Zeroizing<Vec<u8>>,
}

impl ChainSecret {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Zeroizing::new(key.into()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    /// Parse a deployment secret given as hex, base64 or raw text.
    ///
    /// Whatever the encoding, the decoded secret must be at least
    /// [`MIN_SECRET_LEN`] bytes.
    pub fn parse(s: &str) -> Result<ChainSecret, String> {
        use base64::Engine;

        let trimmed = s.trim();
        let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = if hex_str.len() % 2 == 0
            && hex_str.len() >= MIN_SECRET_LEN * 2
            && hex_str.chars().all(|c| c.is_ascii_hexdigit())
        {
            hex::decode(hex_str).map_err(|e| format!("invalid secret hex: {e}"))?
        } else if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(trimmed) {
            decoded
        } else {
            trimmed.as_bytes().to_vec()
        };

        if bytes.len() < MIN_SECRET_LEN {
            return Err(format!(
                "chain secret must be at least {MIN_SECRET_LEN} bytes, got {}",
                bytes.len()
            ));
        }
        Ok(ChainSecret::new(bytes))
    }

    /// Key used for one tenant's chain.
    pub fn for_tenant(&self, tenant_id: &TenantId) -> ChainSecret {
        let mut mac = keyed(self.as_bytes());
        mac.update(DOMAIN_CHAIN_KEY_V1);
        mac.update(tenant_id.0.as_bytes());
        ChainSecret::new(mac.finalize().into_bytes().to_vec())
    }
}

impl std::fmt::Debug for ChainSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSecret")
            .field("len", &self.key.len())
            .finish_non_exhaustive()
    }
}

fn keyed(key: &[u8]) -> HmacSha256 {
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    }
}

/// The exact message fed into the HMAC.
pub fn canonical_message(payload: &ChainPayload, previous_digest: &str) -> String {
    let mut message = payload.canonical_fields().join(FIELD_SEPARATOR);
    message.push_str(FIELD_SEPARATOR);
    message.push_str(previous_digest);
    message
}

/// Compute a record's chain digest. Pure and deterministic.
pub fn compute_digest(payload: &ChainPayload, previous_digest: &str, secret: &ChainSecret) -> String {
    let mut mac = keyed(secret.as_bytes());
    mac.update(canonical_message(payload, previous_digest).as_bytes());
    hex::encode_upper(mac.finalize().into_bytes())
}

/// Recompute a stored link's digest and compare in constant time.
pub fn verify_link(link: &ChainLink, secret: &ChainSecret) -> bool {
    let Ok(expected) = hex::decode(&link.digest) else {
        return false;
    };
    let mut mac = keyed(secret.as_bytes());
    mac.update(canonical_message(&link.payload, &link.previous_digest).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn payload() -> ChainPayload {
        ChainPayload {
            document_number: "A-0001".to_string(),
            issue_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            total: dec!(121),
            counterparty_tax_id: "B12345678".to_string(),
        }
    }

    fn secret() -> ChainSecret {
        ChainSecret::new(vec![7u8; 32])
    }

    #[test]
    fn canonical_message_has_fixed_order() {
        assert_eq!(
            canonical_message(&payload(), ""),
            "A-0001|15-01-2025|121.00|B12345678|"
        );
        assert_eq!(
            canonical_message(&payload(), "ABCD"),
            "A-0001|15-01-2025|121.00|B12345678|ABCD"
        );
    }

    #[test]
    fn digest_is_uppercase_hex_sha256() {
        let digest = compute_digest(&payload(), "", &secret());
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn scale_of_total_does_not_matter() {
        let mut a = payload();
        a.total = dec!(121);
        let mut b = payload();
        b.total = dec!(121.000);
        assert_eq!(
            compute_digest(&a, "", &secret()),
            compute_digest(&b, "", &secret())
        );
    }

    #[test]
    fn digest_depends_on_previous_and_secret() {
        let base = compute_digest(&payload(), "", &secret());
        assert_ne!(base, compute_digest(&payload(), "00", &secret()));
        assert_ne!(
            base,
            compute_digest(&payload(), "", &ChainSecret::new(vec![8u8; 32]))
        );
    }

    #[test]
    fn tenant_keys_are_distinct_and_stable() {
        let root = secret();
        let a = TenantId::new();
        let b = TenantId::new();
        assert_eq!(root.for_tenant(&a).as_bytes(), root.for_tenant(&a).as_bytes());
        assert_ne!(root.for_tenant(&a).as_bytes(), root.for_tenant(&b).as_bytes());
        assert_ne!(root.for_tenant(&a).as_bytes(), root.as_bytes());
    }

    #[test]
    fn verify_link_detects_tampering() {
        let tenant = TenantId::new();
        let key = secret().for_tenant(&tenant);
        let mut link = ChainLink {
            tenant_id: tenant,
            seq: 1,
            invoice_id: crate::domain::InvoiceId::new(),
            record_id: uuid::Uuid::new_v4(),
            digest: compute_digest(&payload(), "", &key),
            previous_digest: String::new(),
            payload: payload(),
            created_at: chrono::Utc::now(),
        };
        assert!(verify_link(&link, &key));

        link.payload.total = dec!(120.99);
        assert!(!verify_link(&link, &key));

        link.payload = payload();
        link.digest = "not hex".to_string();
        assert!(!verify_link(&link, &key));
    }

    #[test]
    fn secrets_parse_from_hex_base64_or_raw() {
        let hex_secret = ChainSecret::parse(&"ab".repeat(32)).unwrap();
        assert_eq!(hex_secret.as_bytes(), &[0xab; 32][..]);

        let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [9u8; 40]);
        assert_eq!(ChainSecret::parse(&b64).unwrap().as_bytes(), &[9u8; 40][..]);

        let raw = "a raw deployment secret that is long enough";
        assert_eq!(ChainSecret::parse(raw).unwrap().as_bytes(), raw.as_bytes());

        assert!(ChainSecret::parse("short").is_err());
    }

    #[test]
    fn debug_does_not_leak_key() {
        let rendered = format!("{:?}", ChainSecret::new(b"super-secret-chain-key".to_vec()));
        assert!(!rendered.contains("super"));
    }

    proptest! {
        #[test]
        fn prop_digest_deterministic(
            number in "[A-Z0-9-]{1,20}",
            cents in -1_000_000_00i64..1_000_000_00i64,
            prev in "[0-9A-F]{0,64}",
        ) {
            let mut p = payload();
            p.document_number = number;
            p.total = Decimal::new(cents, 2);
            prop_assert_eq!(
                compute_digest(&p, &prev, &secret()),
                compute_digest(&p, &prev, &secret())
            );
        }

        #[test]
        fn prop_single_field_change_changes_digest(
            number in "[A-Z0-9]{1,12}",
            other in "[A-Z0-9]{1,12}",
        ) {
            prop_assume!(number != other);
            let mut a = payload();
            a.counterparty_tax_id = number;
            let mut b = payload();
            b.counterparty_tax_id = other;
            prop_assert_ne!(
                compute_digest(&a, "", &secret()),
                compute_digest(&b, "", &secret())
            );
        }

        #[test]
        fn prop_total_change_changes_digest(a in 0i64..10_000_000, b in 0i64..10_000_000) {
            prop_assume!(a != b);
            let mut pa = payload();
            pa.total = Decimal::new(a, 2);
            let mut pb = payload();
            pb.total = Decimal::new(b, 2);
            prop_assert_ne!(
                compute_digest(&pa, "", &secret()),
                compute_digest(&pb, "", &secret())
            );
        }
    }
}
