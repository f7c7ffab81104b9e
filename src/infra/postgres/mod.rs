//! PostgreSQL implementations for the production deployment
//!
//! Delivery ledger, certificate store and the invoice inbox shared with
//! the invoicing application.

mod certificates;
mod invoices;
mod ledger;

pub use certificates::*;
pub use invoices::*;
pub use ledger::*;
