//! Error taxonomy for the compliance ledger

use thiserror::Error;

use crate::domain::{InvoiceId, RecordStatus, TenantId, TransitionError};

/// Certificate problems. None of these are retried automatically; they
/// require the tenant to upload a working certificate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertificateError {
    #[error("tenant has no certificate on file")]
    Missing,

    #[error("invalid certificate container: {0}")]
    InvalidCertificate(String),

    #[error("passphrase does not open the certificate container")]
    WrongPassphrase,

    #[error("certificate is not valid until {0}")]
    NotYetValid(chrono::DateTime<chrono::Utc>),

    #[error("certificate expired at {0}")]
    Expired(chrono::DateTime<chrono::Utc>),

    /// Authentication tag mismatch: the stored material is corrupted.
    #[error("certificate material failed to decrypt: {0}")]
    DecryptionFailed(String),

    #[error("certificate encryption failed: {0}")]
    Encryption(String),
}

/// Errors that can occur in the compliance ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Malformed input that is not an incomplete invoice
    #[error("validation error: {0}")]
    Validation(String),

    /// Required invoice fields are missing
    #[error("incomplete invoice: missing {}", missing.join(", "))]
    IncompleteInvoice { missing: Vec<&'static str> },

    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("authority error: {0}")]
    Authority(String),

    /// Stored chain does not verify; the tenant is halted
    #[error("chain integrity violation for tenant {tenant_id}: {message}")]
    ChainIntegrity { tenant_id: TenantId, message: String },

    #[error("tenant {tenant_id} is halted: {reason}")]
    TenantHalted { tenant_id: TenantId, reason: String },

    /// Optimistic concurrency check on the chain head failed
    #[error("chain head for tenant {tenant_id} moved (expected seq {expected_seq}, found {actual_seq})")]
    ChainHeadMoved {
        tenant_id: TenantId,
        expected_seq: u64,
        actual_seq: u64,
    },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: RecordStatus, to: RecordStatus },

    #[error("compliance record not found for invoice {0}")]
    RecordNotFound(InvoiceId),

    #[error("invoice not found: {0}")]
    InvoiceNotFound(InvoiceId),

    #[error("unknown tenant identity: {0}")]
    TenantNotFound(TenantId),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TransitionError> for LedgerError {
    fn from(err: TransitionError) -> Self {
        LedgerError::InvalidStateTransition {
            from: err.from,
            to: err.to,
        }
    }
}

impl LedgerError {
    /// Whether the same operation may succeed if attempted again unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Authority(_) | LedgerError::ChainHeadMoved { .. } => true,
            LedgerError::Database(err) => crate::infra::is_retryable_db_error(err),
            _ => false,
        }
    }

    /// Stable label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            LedgerError::Validation(_)
            | LedgerError::IncompleteInvoice { .. }
            | LedgerError::InvoiceNotFound(_)
            | LedgerError::TenantNotFound(_) => "validation",
            LedgerError::Certificate(_) => "certificate",
            LedgerError::Signing(_) => "signing",
            LedgerError::Authority(_) => "authority",
            LedgerError::ChainIntegrity { .. } | LedgerError::TenantHalted { .. } => {
                "chain_integrity"
            }
            LedgerError::Database(_)
            | LedgerError::Migration(_)
            | LedgerError::ChainHeadMoved { .. }
            | LedgerError::RecordNotFound(_) => "storage",
            LedgerError::InvalidStateTransition { .. }
            | LedgerError::Serialization(_)
            | LedgerError::Configuration(_)
            | LedgerError::Internal(_) => "internal",
        }
    }
}

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;
