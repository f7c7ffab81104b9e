//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for any valid input.

use chrono::NaiveDate;
use proptest::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

use compliance_ledger::crypto::{compute_digest, ChainSecret};
use compliance_ledger::document::tax_breakdown;
use compliance_ledger::document::xml::{escape, unescape};
use compliance_ledger::domain::{format_amount, ChainPayload, LineItem};
use compliance_ledger::{InvoiceId, InvoiceSnapshot, TenantId};

// ============================================================================
// Custom Strategies
// ============================================================================

fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
    any::<[u8; 16]>().prop_map(|bytes| TenantId::from_uuid(Uuid::from_bytes(bytes)))
}

fn arb_date() -> impl Strategy<Value = NaiveDate> {
    (2000i32..2100, 1u32..=12, 1u32..=28)
        .prop_map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

/// Amounts in cents, up to ten million
fn arb_amount() -> impl Strategy<Value = Decimal> {
    (-1_000_000_000i64..1_000_000_000).prop_map(|cents| Decimal::new(cents, 2))
}

fn arb_payload() -> impl Strategy<Value = ChainPayload> {
    (
        "[A-Z]{0,3}-?[0-9]{1,8}",
        arb_date(),
        arb_amount(),
        prop_oneof![Just(String::new()), "[0-9]{8}[A-Z]"],
    )
        .prop_map(
            |(document_number, issue_date, total, counterparty_tax_id)| ChainPayload {
                document_number,
                issue_date,
                total,
                counterparty_tax_id,
            },
        )
}

/// Digest-shaped previous values, including the empty genesis value
fn arb_previous() -> impl Strategy<Value = String> {
    prop_oneof![Just(String::new()), "[0-9A-F]{64}"]
}

fn arb_secret() -> impl Strategy<Value = ChainSecret> {
    prop::collection::vec(any::<u8>(), 32..64).prop_map(ChainSecret::new)
}

fn arb_line() -> impl Strategy<Value = LineItem> {
    (
        1i64..50,
        0i64..10_000_000,
        prop_oneof![Just(0i64), Just(4), Just(10), Just(21)],
    )
        .prop_map(|(quantity, cents, rate)| LineItem {
            description: "item".to_string(),
            quantity: Decimal::from(quantity),
            unit_price: Decimal::new(cents, 2),
            tax_rate: Decimal::from(rate),
        })
}

fn invoice_with(lines: Vec<LineItem>) -> InvoiceSnapshot {
    InvoiceSnapshot {
        invoice_id: InvoiceId::new(),
        tenant_id: TenantId::new(),
        series: String::new(),
        number: "1".to_string(),
        issue_date: NaiveDate::from_ymd_opt(2025, 1, 1),
        counterparty: None,
        description: None,
        lines,
        total: None,
    }
}

// ============================================================================
// Chain digest
// ============================================================================

proptest! {
    #[test]
    fn digest_is_deterministic(
        payload in arb_payload(),
        previous in arb_previous(),
        secret in arb_secret(),
    ) {
        let first = compute_digest(&payload, &previous, &secret);
        let second = compute_digest(&payload.clone(), &previous.clone(), &secret.clone());
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), 64);
        prop_assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn digest_depends_on_the_document_number(
        payload in arb_payload(),
        other in "[A-Z]{0,3}-?[0-9]{1,8}",
        previous in arb_previous(),
        secret in arb_secret(),
    ) {
        prop_assume!(payload.document_number != other);
        let changed = ChainPayload { document_number: other, ..payload.clone() };
        prop_assert_ne!(
            compute_digest(&payload, &previous, &secret),
            compute_digest(&changed, &previous, &secret)
        );
    }

    #[test]
    fn digest_depends_on_the_total(
        payload in arb_payload(),
        other in arb_amount(),
        previous in arb_previous(),
        secret in arb_secret(),
    ) {
        prop_assume!(format_amount(payload.total) != format_amount(other));
        let changed = ChainPayload { total: other, ..payload.clone() };
        prop_assert_ne!(
            compute_digest(&payload, &previous, &secret),
            compute_digest(&changed, &previous, &secret)
        );
    }

    #[test]
    fn digest_depends_on_the_previous_digest(
        payload in arb_payload(),
        a in arb_previous(),
        b in arb_previous(),
        secret in arb_secret(),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(
            compute_digest(&payload, &a, &secret),
            compute_digest(&payload, &b, &secret)
        );
    }

    #[test]
    fn tenants_derive_distinct_keys(
        payload in arb_payload(),
        previous in arb_previous(),
        secret in arb_secret(),
        a in arb_tenant_id(),
        b in arb_tenant_id(),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(
            compute_digest(&payload, &previous, &secret.for_tenant(&a)),
            compute_digest(&payload, &previous, &secret.for_tenant(&b))
        );
    }
}

// ============================================================================
// Document composition
// ============================================================================

proptest! {
    #[test]
    fn escaped_text_has_no_markup(text in "\\PC*") {
        let escaped = escape(&text);
        prop_assert!(!escaped.contains('<'));
        prop_assert!(!escaped.contains('>'));
        prop_assert!(!escaped.contains('"'));
        prop_assert!(!escaped.contains('\''));
        prop_assert_eq!(unescape(&escaped), text);
    }

    #[test]
    fn amounts_render_with_two_decimals(amount in arb_amount()) {
        let rendered = format_amount(amount);
        let (_, decimals) = rendered.split_once('.').unwrap_or((rendered.as_str(), ""));
        prop_assert_eq!(decimals.len(), 2);
    }

    #[test]
    fn tax_breakdown_preserves_line_sums(lines in prop::collection::vec(arb_line(), 0..12)) {
        let invoice = invoice_with(lines.clone());
        let breakdown = tax_breakdown(&invoice);

        let base: Decimal = breakdown.iter().map(|b| b.base).sum();
        let tax: Decimal = breakdown.iter().map(|b| b.tax).sum();
        prop_assert_eq!(base, lines.iter().map(|l| l.taxable_base()).sum::<Decimal>());
        prop_assert_eq!(tax, lines.iter().map(|l| l.tax_amount()).sum::<Decimal>());

        // One group per distinct rate, ascending.
        prop_assert!(breakdown.windows(2).all(|w| w[0].rate < w[1].rate));
    }
}
