//! Infrastructure layer for the compliance ledger
//!
//! Contains trait definitions and implementations for:
//! - Delivery ledger and chain storage (PostgreSQL, SQLite)
//! - Certificate storage
//! - Invoice directory (PostgreSQL inbox, in-memory)
//! - Retry with backoff (transient storage errors, chain-head races)
//! - Circuit breaker (authority endpoint protection)
//! - Per-tenant serialization of chain appends
//! - Graceful shutdown (delivery draining)

pub mod circuit_breaker;
mod error;
mod graceful_shutdown;
pub mod memory;
pub mod postgres;
mod retry;
pub mod sqlite;
mod tenant_locks;
mod traits;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::*;
pub use graceful_shutdown::{
    shutdown_signal, DeliveryGuard, DeliveryTracker, ShutdownCoordinator, ShutdownSignal,
};
pub use memory::InMemoryInvoiceDirectory;
pub use postgres::{PgCertificateStore, PgDeliveryLedger, PgInvoiceDirectory};
pub use retry::{is_retryable_db_error, retry_with_backoff, Backoff, Retried};
pub use sqlite::{connect_sqlite, SqliteCertificateStore, SqliteDeliveryLedger};
pub use tenant_locks::TenantLocks;
pub use traits::*;
