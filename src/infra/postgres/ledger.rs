//! PostgreSQL delivery ledger
//!
//! # Chain appends
//!
//! Every append runs in one transaction that locks the tenant's
//! `chain_heads` row:
//! ```sql
//! BEGIN;
//! SELECT head_seq, head_digest, halted_at FROM chain_heads
//!     WHERE tenant_id = $1 FOR UPDATE;
//! -- compare with the caller's head, insert link, advance head, upsert record
//! COMMIT;
//! ```
//! A caller that composed against a stale head gets `ChainHeadMoved` and
//! must re-read the head. `UNIQUE (tenant_id, previous_digest)` on
//! `chain_links` backs this up at the schema level.
//!
//! # Accepted records
//!
//! Record upserts carry `WHERE compliance_records.status <> 'accepted'`, so
//! an accepted row can never be overwritten, whatever the caller holds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::domain::{
    AuthorityResult, ChainHead, ChainLink, ChainPayload, ComplianceRecord, DeliveryStats,
    FailureKind, InvoiceId, InvoiceSnapshot, RecordStatus, TenantHalt, TenantId,
};
use crate::infra::{DeliveryLedger, LedgerError, Result, RetryQuery};

/// PostgreSQL-backed delivery ledger
#[derive(Clone)]
pub struct PgDeliveryLedger {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    tenant_id: Uuid,
    invoice_id: Uuid,
    invoice_snapshot: serde_json::Value,
    chain_seq: Option<i64>,
    digest: String,
    previous_digest: String,
    unsigned_document: Option<String>,
    signed_document: Option<String>,
    authority_response: Option<serde_json::Value>,
    status: String,
    failure_kind: Option<String>,
    confirmation_code: Option<String>,
    qr_payload: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    retry_count: i32,
    error_message: Option<String>,
    escalated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for ComplianceRecord {
    type Error = LedgerError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let status = RecordStatus::parse(&row.status)
            .ok_or_else(|| LedgerError::Internal(format!("unknown record status {}", row.status)))?;
        let failure_kind = row
            .failure_kind
            .as_deref()
            .map(|kind| {
                FailureKind::parse(kind)
                    .ok_or_else(|| LedgerError::Internal(format!("unknown failure kind {kind}")))
            })
            .transpose()?;
        let invoice: InvoiceSnapshot = serde_json::from_value(row.invoice_snapshot)?;
        let authority_response: Option<AuthorityResult> =
            row.authority_response.map(serde_json::from_value).transpose()?;

        Ok(ComplianceRecord {
            id: row.id,
            tenant_id: TenantId::from_uuid(row.tenant_id),
            invoice_id: InvoiceId::from_uuid(row.invoice_id),
            invoice,
            chain_seq: row.chain_seq.map(|seq| seq as u64),
            digest: row.digest,
            previous_digest: row.previous_digest,
            unsigned_document: row.unsigned_document,
            signed_document: row.signed_document,
            authority_response,
            status,
            failure_kind,
            confirmation_code: row.confirmation_code,
            qr_payload: row.qr_payload,
            sent_at: row.sent_at,
            retry_count: row.retry_count.max(0) as u32,
            error_message: row.error_message,
            escalated_at: row.escalated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LinkRow {
    tenant_id: Uuid,
    seq: i64,
    invoice_id: Uuid,
    record_id: Uuid,
    digest: String,
    previous_digest: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<LinkRow> for ChainLink {
    type Error = LedgerError;

    fn try_from(row: LinkRow) -> Result<Self> {
        let payload: ChainPayload = serde_json::from_value(row.payload)?;
        Ok(ChainLink {
            tenant_id: TenantId::from_uuid(row.tenant_id),
            seq: row.seq as u64,
            invoice_id: InvoiceId::from_uuid(row.invoice_id),
            record_id: row.record_id,
            digest: row.digest,
            previous_digest: row.previous_digest,
            payload,
            created_at: row.created_at,
        })
    }
}

const RECORD_COLUMNS: &str = r#"
    r.id, r.tenant_id, r.invoice_id, r.invoice_snapshot, r.chain_seq, r.digest,
    r.previous_digest, r.unsigned_document, r.signed_document, r.authority_response,
    r.status, r.failure_kind, r.confirmation_code, r.qr_payload, r.sent_at,
    r.retry_count, r.error_message, r.escalated_at, r.created_at, r.updated_at
"#;

struct LockedHead {
    seq: u64,
    digest: String,
    halted_at: Option<DateTime<Utc>>,
    halt_reason: Option<String>,
}

impl PgDeliveryLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        crate::migrations::run_postgres(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_chain_head(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &TenantId,
    ) -> Result<LockedHead> {
        sqlx::query(
            r#"
            INSERT INTO chain_heads (tenant_id, head_seq, head_digest, updated_at)
            VALUES ($1, 0, '', NOW())
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(tenant_id.0)
        .execute(&mut **tx)
        .await?;

        let row: (i64, String, Option<DateTime<Utc>>, Option<String>) = sqlx::query_as(
            r#"
            SELECT head_seq, head_digest, halted_at, halt_reason
            FROM chain_heads
            WHERE tenant_id = $1
            FOR UPDATE
            "#,
        )
        .bind(tenant_id.0)
        .fetch_one(&mut **tx)
        .await?;

        Ok(LockedHead {
            seq: row.0 as u64,
            digest: row.1,
            halted_at: row.2,
            halt_reason: row.3,
        })
    }

    async fn upsert_record<'e, E>(executor: E, record: &ComplianceRecord) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let snapshot = serde_json::to_value(&record.invoice)?;
        let response = record
            .authority_response
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO compliance_records (
                id, tenant_id, invoice_id, invoice_snapshot, chain_seq, digest,
                previous_digest, unsigned_document, signed_document, authority_response,
                status, failure_kind, confirmation_code, qr_payload, sent_at,
                retry_count, error_message, escalated_at, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
            )
            ON CONFLICT (invoice_id) DO UPDATE SET
                invoice_snapshot = EXCLUDED.invoice_snapshot,
                chain_seq = EXCLUDED.chain_seq,
                digest = EXCLUDED.digest,
                previous_digest = EXCLUDED.previous_digest,
                unsigned_document = EXCLUDED.unsigned_document,
                signed_document = EXCLUDED.signed_document,
                authority_response = EXCLUDED.authority_response,
                status = EXCLUDED.status,
                failure_kind = EXCLUDED.failure_kind,
                confirmation_code = EXCLUDED.confirmation_code,
                qr_payload = EXCLUDED.qr_payload,
                sent_at = EXCLUDED.sent_at,
                retry_count = EXCLUDED.retry_count,
                error_message = EXCLUDED.error_message,
                escalated_at = EXCLUDED.escalated_at,
                updated_at = EXCLUDED.updated_at
            WHERE compliance_records.status <> 'accepted'
            "#,
        )
        .bind(record.id)
        .bind(record.tenant_id.0)
        .bind(record.invoice_id.0)
        .bind(snapshot)
        .bind(record.chain_seq.map(|seq| seq as i64))
        .bind(&record.digest)
        .bind(&record.previous_digest)
        .bind(&record.unsigned_document)
        .bind(&record.signed_document)
        .bind(response)
        .bind(record.status.as_str())
        .bind(record.failure_kind.map(|kind| kind.as_str()))
        .bind(&record.confirmation_code)
        .bind(&record.qr_payload)
        .bind(record.sent_at)
        .bind(record.retry_count as i32)
        .bind(&record.error_message)
        .bind(record.escalated_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(executor)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::InvalidStateTransition {
                from: RecordStatus::Accepted,
                to: record.status,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryLedger for PgDeliveryLedger {
    async fn chain_head(&self, tenant_id: &TenantId) -> Result<ChainHead> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT head_seq, head_digest FROM chain_heads WHERE tenant_id = $1",
        )
        .bind(tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((seq, digest)) => ChainHead {
                tenant_id: *tenant_id,
                seq: seq as u64,
                digest,
            },
            None => ChainHead::genesis(*tenant_id),
        })
    }

    async fn chain_link(&self, tenant_id: &TenantId, seq: u64) -> Result<Option<ChainLink>> {
        let row: Option<LinkRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, seq, invoice_id, record_id, digest, previous_digest, payload, created_at
            FROM chain_links
            WHERE tenant_id = $1 AND seq = $2
            "#,
        )
        .bind(tenant_id.0)
        .bind(seq as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChainLink::try_from).transpose()
    }

    async fn chain_links(
        &self,
        tenant_id: &TenantId,
        after_seq: u64,
        limit: u32,
    ) -> Result<Vec<ChainLink>> {
        let rows: Vec<LinkRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, seq, invoice_id, record_id, digest, previous_digest, payload, created_at
            FROM chain_links
            WHERE tenant_id = $1 AND seq > $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(tenant_id.0)
        .bind(after_seq as i64)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChainLink::try_from).collect()
    }

    #[instrument(skip(self, link, record), fields(tenant_id = %expected_head.tenant_id, seq = link.seq))]
    async fn append_link(
        &self,
        expected_head: &ChainHead,
        link: &ChainLink,
        record: &ComplianceRecord,
    ) -> Result<()> {
        let tenant_id = expected_head.tenant_id;
        if link.tenant_id != tenant_id
            || link.seq != expected_head.seq + 1
            || link.previous_digest != expected_head.digest
        {
            return Err(LedgerError::Internal(
                "link does not extend the expected head".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let head = Self::lock_chain_head(&mut tx, &tenant_id).await?;

        if head.halted_at.is_some() {
            return Err(LedgerError::TenantHalted {
                tenant_id,
                reason: head.halt_reason.unwrap_or_default(),
            });
        }
        if head.seq != expected_head.seq || head.digest != expected_head.digest {
            warn!(actual_seq = head.seq, "chain head moved during append");
            return Err(LedgerError::ChainHeadMoved {
                tenant_id,
                expected_seq: expected_head.seq,
                actual_seq: head.seq,
            });
        }

        let payload = serde_json::to_value(&link.payload)?;
        sqlx::query(
            r#"
            INSERT INTO chain_links (
                tenant_id, seq, invoice_id, record_id, digest, previous_digest, payload, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(tenant_id.0)
        .bind(link.seq as i64)
        .bind(link.invoice_id.0)
        .bind(link.record_id)
        .bind(&link.digest)
        .bind(&link.previous_digest)
        .bind(payload)
        .bind(link.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE chain_heads
            SET head_seq = $2, head_digest = $3, updated_at = NOW()
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.0)
        .bind(link.seq as i64)
        .bind(&link.digest)
        .execute(&mut *tx)
        .await?;

        Self::upsert_record(&mut *tx, record).await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(invoice_id = %record.invoice_id, status = %record.status))]
    async fn save_record(&self, record: &ComplianceRecord) -> Result<()> {
        Self::upsert_record(&self.pool, record).await
    }

    async fn find_by_invoice(&self, invoice_id: &InvoiceId) -> Result<Option<ComplianceRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM compliance_records r WHERE r.invoice_id = $1"
        ))
        .bind(invoice_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ComplianceRecord::try_from).transpose()
    }

    async fn list_retryable(&self, query: &RetryQuery) -> Result<Vec<ComplianceRecord>> {
        let kinds: Vec<String> = query.kinds.iter().map(|k| k.as_str().to_string()).collect();
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM compliance_records r
            LEFT JOIN chain_heads h ON h.tenant_id = r.tenant_id
            WHERE r.status IN ('rejected', 'error')
              AND r.escalated_at IS NULL
              AND r.updated_at < $1
              AND r.failure_kind = ANY($2)
              AND h.halted_at IS NULL
              AND ($3::timestamptz IS NULL OR (r.updated_at, r.id) > ($3, $4::uuid))
            ORDER BY r.updated_at ASC, r.id ASC
            LIMIT $5
            "#
        ))
        .bind(query.updated_before)
        .bind(&kinds)
        .bind(query.after.map(|c| c.updated_at))
        .bind(query.after.map(|c| c.record_id))
        .bind(i64::from(query.limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ComplianceRecord::try_from).collect()
    }

    async fn list_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ComplianceRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM compliance_records r
            LEFT JOIN chain_heads h ON h.tenant_id = r.tenant_id
            WHERE r.status IN ('pending', 'submitted')
              AND r.updated_at < $1
              AND h.halted_at IS NULL
            ORDER BY r.updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(updated_before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ComplianceRecord::try_from).collect()
    }

    async fn mark_escalated(&self, invoice_id: &InvoiceId, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE compliance_records
            SET escalated_at = $2
            WHERE invoice_id = $1 AND status IN ('rejected', 'error')
            "#,
        )
        .bind(invoice_id.0)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::RecordNotFound(*invoice_id));
        }
        Ok(())
    }

    async fn stats(&self, tenant_id: &TenantId) -> Result<DeliveryStats> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*), COUNT(escalated_at)
            FROM compliance_records
            WHERE tenant_id = $1
            GROUP BY status
            "#,
        )
        .bind(tenant_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = DeliveryStats::default();
        for (status, count, escalated) in rows {
            if let Some(status) = RecordStatus::parse(&status) {
                stats.add(status, count as u64);
                if status.is_failure() {
                    stats.escalated += escalated as u64;
                }
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self))]
    async fn halt_tenant(&self, tenant_id: &TenantId, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_heads (tenant_id, head_seq, head_digest, halted_at, halt_reason, updated_at)
            VALUES ($1, 0, '', NOW(), $2, NOW())
            ON CONFLICT (tenant_id) DO UPDATE SET
                halted_at = COALESCE(chain_heads.halted_at, EXCLUDED.halted_at),
                halt_reason = COALESCE(chain_heads.halt_reason, EXCLUDED.halt_reason),
                updated_at = NOW()
            "#,
        )
        .bind(tenant_id.0)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resume_tenant(&self, tenant_id: &TenantId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chain_heads
            SET halted_at = NULL, halt_reason = NULL, updated_at = NOW()
            WHERE tenant_id = $1 AND halted_at IS NOT NULL
            "#,
        )
        .bind(tenant_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn tenant_halt(&self, tenant_id: &TenantId) -> Result<Option<TenantHalt>> {
        let row: Option<(DateTime<Utc>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT halted_at, halt_reason
            FROM chain_heads
            WHERE tenant_id = $1 AND halted_at IS NOT NULL
            "#,
        )
        .bind(tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(halted_at, reason)| TenantHalt {
            tenant_id: *tenant_id,
            halted_at,
            reason: reason.unwrap_or_default(),
        }))
    }
}
