//! Domain models for the compliance ledger
//!
//! Invoice inputs, compliance records with their delivery state machine,
//! chain links, and tenant certificate material.

mod certificate;
mod invoice;
mod record;
mod types;

pub use certificate::*;
pub use invoice::*;
pub use record::*;
pub use types::*;
