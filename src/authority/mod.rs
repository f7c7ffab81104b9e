//! Authority client
//!
//! Transmits signed documents to the tax authority and interprets the
//! answer. Transport problems are never raised as errors: every outcome is
//! an [`AuthorityResult`] so the caller can persist the attempt.

pub mod http;
pub mod response;
pub mod simulator;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::domain::AuthorityResult;

pub use http::{HttpAuthorityClient, HttpAuthorityConfig};
pub use response::parse_response;
pub use simulator::{SimulatedAuthority, SimulatorMode};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthorityClient: Send + Sync {
    /// Submit one signed document. Must return within a bounded time.
    async fn submit(&self, signed_document: &str) -> AuthorityResult;

    /// Short label for logs and metrics
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: AuthorityClient + ?Sized> AuthorityClient for Arc<T> {
    async fn submit(&self, signed_document: &str) -> AuthorityResult {
        (**self).submit(signed_document).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
