//! SQLite delivery ledger
//!
//! Same contract as the PostgreSQL ledger. The append transaction is a
//! deferred one whose first statement writes to `chain_heads`, so it holds
//! SQLite's write lock before the head is read and the compare-and-swap
//! cannot interleave. A writer that loses the race gets `SQLITE_BUSY` or
//! `SQLITE_BUSY_SNAPSHOT`, which the pipeline retries like a moved head.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::{FromRow, Sqlite};
use tracing::{instrument, warn};

use super::{connect_sqlite, from_millis, parse_uuid, to_millis};
use crate::domain::{
    ChainHead, ChainLink, ComplianceRecord, DeliveryStats, FailureKind, InvoiceId, RecordStatus,
    TenantHalt, TenantId,
};
use crate::infra::{DeliveryLedger, LedgerError, Result, RetryQuery};

#[derive(Clone)]
pub struct SqliteDeliveryLedger {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct RecordRow {
    id: String,
    tenant_id: String,
    invoice_id: String,
    invoice_snapshot: String,
    chain_seq: Option<i64>,
    digest: String,
    previous_digest: String,
    unsigned_document: Option<String>,
    signed_document: Option<String>,
    authority_response: Option<String>,
    status: String,
    failure_kind: Option<String>,
    confirmation_code: Option<String>,
    qr_payload: Option<String>,
    sent_at: Option<i64>,
    retry_count: i64,
    error_message: Option<String>,
    escalated_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<RecordRow> for ComplianceRecord {
    type Error = LedgerError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let status = RecordStatus::parse(&row.status)
            .ok_or_else(|| LedgerError::Internal(format!("unknown record status {}", row.status)))?;
        let failure_kind = match row.failure_kind.as_deref() {
            Some(kind) => Some(
                FailureKind::parse(kind)
                    .ok_or_else(|| LedgerError::Internal(format!("unknown failure kind {kind}")))?,
            ),
            None => None,
        };

        Ok(ComplianceRecord {
            id: parse_uuid(&row.id)?,
            tenant_id: TenantId::from_uuid(parse_uuid(&row.tenant_id)?),
            invoice_id: InvoiceId::from_uuid(parse_uuid(&row.invoice_id)?),
            invoice: serde_json::from_str(&row.invoice_snapshot)?,
            chain_seq: row.chain_seq.map(|seq| seq as u64),
            digest: row.digest,
            previous_digest: row.previous_digest,
            unsigned_document: row.unsigned_document,
            signed_document: row.signed_document,
            authority_response: row
                .authority_response
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            status,
            failure_kind,
            confirmation_code: row.confirmation_code,
            qr_payload: row.qr_payload,
            sent_at: row.sent_at.map(from_millis).transpose()?,
            retry_count: row.retry_count.max(0) as u32,
            error_message: row.error_message,
            escalated_at: row.escalated_at.map(from_millis).transpose()?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(FromRow)]
struct LinkRow {
    tenant_id: String,
    seq: i64,
    invoice_id: String,
    record_id: String,
    digest: String,
    previous_digest: String,
    payload: String,
    created_at: i64,
}

impl TryFrom<LinkRow> for ChainLink {
    type Error = LedgerError;

    fn try_from(row: LinkRow) -> Result<Self> {
        Ok(ChainLink {
            tenant_id: TenantId::from_uuid(parse_uuid(&row.tenant_id)?),
            seq: row.seq as u64,
            invoice_id: InvoiceId::from_uuid(parse_uuid(&row.invoice_id)?),
            record_id: parse_uuid(&row.record_id)?,
            digest: row.digest,
            previous_digest: row.previous_digest,
            payload: serde_json::from_str(&row.payload)?,
            created_at: from_millis(row.created_at)?,
        })
    }
}

const RECORD_COLUMNS: &str = r#"
    r.id, r.tenant_id, r.invoice_id, r.invoice_snapshot, r.chain_seq, r.digest,
    r.previous_digest, r.unsigned_document, r.signed_document, r.authority_response,
    r.status, r.failure_kind, r.confirmation_code, r.qr_payload, r.sent_at,
    r.retry_count, r.error_message, r.escalated_at, r.created_at, r.updated_at
"#;

const LINK_COLUMNS: &str =
    "tenant_id, seq, invoice_id, record_id, digest, previous_digest, payload, created_at";

impl SqliteDeliveryLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and migrate
    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self::new(connect_sqlite(url, 4).await?))
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn upsert_record<'e, E>(executor: E, record: &ComplianceRecord) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let snapshot = serde_json::to_string(&record.invoice)?;
        let response = record
            .authority_response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO compliance_records (
                id, tenant_id, invoice_id, invoice_snapshot, chain_seq, digest,
                previous_digest, unsigned_document, signed_document, authority_response,
                status, failure_kind, confirmation_code, qr_payload, sent_at,
                retry_count, error_message, escalated_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (invoice_id) DO UPDATE SET
                invoice_snapshot = excluded.invoice_snapshot,
                chain_seq = excluded.chain_seq,
                digest = excluded.digest,
                previous_digest = excluded.previous_digest,
                unsigned_document = excluded.unsigned_document,
                signed_document = excluded.signed_document,
                authority_response = excluded.authority_response,
                status = excluded.status,
                failure_kind = excluded.failure_kind,
                confirmation_code = excluded.confirmation_code,
                qr_payload = excluded.qr_payload,
                sent_at = excluded.sent_at,
                retry_count = excluded.retry_count,
                error_message = excluded.error_message,
                escalated_at = excluded.escalated_at,
                updated_at = excluded.updated_at
            WHERE compliance_records.status <> 'accepted'
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.tenant_id.to_string())
        .bind(record.invoice_id.to_string())
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
        .bind(record.sent_at.map(to_millis))
        .bind(i64::from(record.retry_count))
        .bind(&record.error_message)
        .bind(record.escalated_at.map(to_millis))
        .bind(to_millis(record.created_at))
        .bind(to_millis(record.updated_at))
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
impl DeliveryLedger for SqliteDeliveryLedger {
    async fn chain_head(&self, tenant_id: &TenantId) -> Result<ChainHead> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT head_seq, head_digest FROM chain_heads WHERE tenant_id = ?")
                .bind(tenant_id.to_string())
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
        let row: Option<LinkRow> = sqlx::query_as(&format!(
            "SELECT {LINK_COLUMNS} FROM chain_links WHERE tenant_id = ? AND seq = ?"
        ))
        .bind(tenant_id.to_string())
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
        let rows: Vec<LinkRow> = sqlx::query_as(&format!(
            "SELECT {LINK_COLUMNS} FROM chain_links WHERE tenant_id = ? AND seq > ? ORDER BY seq ASC LIMIT ?"
        ))
        .bind(tenant_id.to_string())
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
        let tenant = tenant_id.to_string();
        let now = to_millis(Utc::now());

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO chain_heads (tenant_id, head_seq, head_digest, updated_at)
            VALUES (?, 0, '', ?)
            ON CONFLICT (tenant_id) DO UPDATE SET updated_at = chain_heads.updated_at
            "#,
        )
        .bind(&tenant)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (seq, digest, halted_at, halt_reason): (i64, String, Option<i64>, Option<String>) =
            sqlx::query_as(
                "SELECT head_seq, head_digest, halted_at, halt_reason FROM chain_heads WHERE tenant_id = ?",
            )
            .bind(&tenant)
            .fetch_one(&mut *tx)
            .await?;

        if halted_at.is_some() {
            return Err(LedgerError::TenantHalted {
                tenant_id,
                reason: halt_reason.unwrap_or_default(),
            });
        }
        if seq as u64 != expected_head.seq || digest != expected_head.digest {
            warn!(actual_seq = seq, "chain head moved during append");
            return Err(LedgerError::ChainHeadMoved {
                tenant_id,
                expected_seq: expected_head.seq,
                actual_seq: seq as u64,
            });
        }

        sqlx::query(&format!(
            "INSERT INTO chain_links ({LINK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&tenant)
        .bind(link.seq as i64)
        .bind(link.invoice_id.to_string())
        .bind(link.record_id.to_string())
        .bind(&link.digest)
        .bind(&link.previous_digest)
        .bind(serde_json::to_string(&link.payload)?)
        .bind(to_millis(link.created_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE chain_heads SET head_seq = ?, head_digest = ?, updated_at = ? WHERE tenant_id = ?",
        )
        .bind(link.seq as i64)
        .bind(&link.digest)
        .bind(now)
        .bind(&tenant)
        .execute(&mut *tx)
        .await?;

        Self::upsert_record(&mut *tx, record).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn save_record(&self, record: &ComplianceRecord) -> Result<()> {
        Self::upsert_record(&self.pool, record).await
    }

    async fn find_by_invoice(&self, invoice_id: &InvoiceId) -> Result<Option<ComplianceRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM compliance_records r WHERE r.invoice_id = ?"
        ))
        .bind(invoice_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ComplianceRecord::try_from).transpose()
    }

    async fn list_retryable(&self, query: &RetryQuery) -> Result<Vec<ComplianceRecord>> {
        if query.kinds.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; query.kinds.len()].join(", ");
        let resume = if query.after.is_some() {
            "AND (r.updated_at > ? OR (r.updated_at = ? AND r.id > ?))"
        } else {
            ""
        };
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM compliance_records r
            LEFT JOIN chain_heads h ON h.tenant_id = r.tenant_id
            WHERE r.status IN ('rejected', 'error')
              AND r.escalated_at IS NULL
              AND r.updated_at < ?
              AND r.failure_kind IN ({placeholders})
              AND h.halted_at IS NULL
              {resume}
            ORDER BY r.updated_at ASC, r.id ASC
            LIMIT ?
            "#
        );

        let mut q = sqlx::query_as::<_, RecordRow>(&sql).bind(to_millis(query.updated_before));
        for kind in &query.kinds {
            q = q.bind(kind.as_str());
        }
        if let Some(cursor) = &query.after {
            let at = to_millis(cursor.updated_at);
            q = q.bind(at).bind(at).bind(cursor.record_id.to_string());
        }
        let rows = q.bind(i64::from(query.limit)).fetch_all(&self.pool).await?;

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
              AND r.updated_at < ?
              AND h.halted_at IS NULL
            ORDER BY r.updated_at ASC
            LIMIT ?
            "#
        ))
        .bind(to_millis(updated_before))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ComplianceRecord::try_from).collect()
    }

    async fn mark_escalated(&self, invoice_id: &InvoiceId, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE compliance_records
            SET escalated_at = ?
            WHERE invoice_id = ? AND status IN ('rejected', 'error')
            "#,
        )
        .bind(to_millis(at))
        .bind(invoice_id.to_string())
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
            WHERE tenant_id = ?
            GROUP BY status
            "#,
        )
        .bind(tenant_id.to_string())
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

    async fn halt_tenant(&self, tenant_id: &TenantId, reason: &str) -> Result<()> {
        let now = to_millis(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO chain_heads (tenant_id, head_seq, head_digest, halted_at, halt_reason, updated_at)
            VALUES (?, 0, '', ?, ?, ?)
            ON CONFLICT (tenant_id) DO UPDATE SET
                halted_at = COALESCE(chain_heads.halted_at, excluded.halted_at),
                halt_reason = COALESCE(chain_heads.halt_reason, excluded.halt_reason),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(now)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resume_tenant(&self, tenant_id: &TenantId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chain_heads
            SET halted_at = NULL, halt_reason = NULL, updated_at = ?
            WHERE tenant_id = ? AND halted_at IS NOT NULL
            "#,
        )
        .bind(to_millis(Utc::now()))
        .bind(tenant_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn tenant_halt(&self, tenant_id: &TenantId) -> Result<Option<TenantHalt>> {
        let row: Option<(i64, Option<String>)> = sqlx::query_as(
            "SELECT halted_at, halt_reason FROM chain_heads WHERE tenant_id = ? AND halted_at IS NOT NULL",
        )
        .bind(tenant_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(halted_at, reason)| {
            Ok(TenantHalt {
                tenant_id: *tenant_id,
                halted_at: from_millis(halted_at)?,
                reason: reason.unwrap_or_default(),
            })
        })
        .transpose()
    }
}
