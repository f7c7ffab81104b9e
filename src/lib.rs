//! Compliance Ledger Library
//!
//! Tamper-evident delivery of signed invoice records to a tax authority,
//! for a multi-tenant invoicing application. Every record a tenant sends
//! is linked into that tenant's hash chain, signed with the tenant's own
//! certificate, and tracked until the authority accepts it.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (invoices, compliance records, chain links, certificates)
//! - [`crypto`] - Hash chain, certificate vault, at-rest encryption and signing
//! - [`document`] - Fixed-schema compliance document composition
//! - [`authority`] - Authority client (HTTP, simulator) and response parsing
//! - [`infra`] - Storage implementations (PostgreSQL, SQLite), retry and shutdown plumbing
//! - [`pipeline`] - Delivery orchestration, recovery engine and worker, chain audit
//! - [`service`] - Facade used by the invoicing application
//! - [`config`] - Environment configuration
//! - [`metrics`] - Observability and metrics
//! - [`telemetry`] - Structured logging
//! - [`server`] - Worker daemon bootstrap

pub mod authority;
pub mod config;
pub mod crypto;
pub mod document;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod pipeline;
pub mod server;
pub mod service;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{
    ChainHead, ChainLink, ComplianceRecord, FailureKind, InvoiceId, InvoiceSnapshot,
    RecordStatus, TenantId, TenantIdentity,
};

pub use config::LedgerConfig;
pub use infra::{LedgerError, Result};
pub use pipeline::{DeliveryOutcome, DeliveryPipeline, RecoveryEngine};
pub use service::ComplianceService;
