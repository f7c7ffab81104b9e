//! HTTP transport to the tax authority endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, instrument, warn};
use url::Url;

use super::response::parse_response;
use super::AuthorityClient;
use crate::domain::{transport_codes, AuthorityResult};
use crate::infra::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig};
use crate::infra::{LedgerError, Result};
use crate::metrics::{metric_names, MetricsRegistry};

#[derive(Debug, Clone)]
pub struct HttpAuthorityConfig {
    pub endpoint: Url,
    /// Upper bound for one submission, connect included
    pub timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl HttpAuthorityConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            timeout: Duration::from_secs(30),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }
}

/// Posts signed XML documents to the configured endpoint.
pub struct HttpAuthorityClient {
    client: reqwest::Client,
    endpoint: Url,
    breaker: CircuitBreaker,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl HttpAuthorityClient {
    pub fn new(config: HttpAuthorityConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LedgerError::Configuration(format!("authority http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint,
            breaker: CircuitBreaker::new("authority", config.circuit_breaker),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn note_timeout(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(metric_names::AUTHORITY_TIMEOUTS_TOTAL).await;
        }
    }
}

#[async_trait]
impl AuthorityClient for HttpAuthorityClient {
    #[instrument(skip(self, signed_document), fields(endpoint = %self.endpoint, bytes = signed_document.len()))]
    async fn submit(&self, signed_document: &str) -> AuthorityResult {
        if let Admission::Rejected { retry_after } = self.breaker.admit().await {
            warn!(retry_after_secs = retry_after.as_secs(), "authority circuit open, submission not attempted");
            return AuthorityResult::transport_failure(
                transport_codes::CIRCUIT_OPEN,
                format!("authority circuit breaker is open, next probe in {}s", retry_after.as_secs()),
            );
        }

        let started = Instant::now();
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(signed_document.to_owned())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                self.breaker.on_failure().await;
                self.note_timeout().await;
                warn!(elapsed_ms = started.elapsed().as_millis() as u64, "authority submission timed out");
                return AuthorityResult::transport_failure(
                    transport_codes::TIMEOUT,
                    format!("no answer within {}ms", started.elapsed().as_millis()),
                );
            }
            Err(e) => {
                self.breaker.on_failure().await;
                warn!(error = %e, "authority unreachable");
                return AuthorityResult::transport_failure(transport_codes::NETWORK_ERROR, e.to_string());
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                self.breaker.on_failure().await;
                let code = if e.is_timeout() {
                    self.note_timeout().await;
                    transport_codes::TIMEOUT
                } else {
                    transport_codes::NETWORK_ERROR
                };
                return AuthorityResult::transport_failure(code, format!("reading response: {e}"));
            }
        };

        if !status.is_success() {
            // 4xx still proves the endpoint is up
            if status.is_server_error() || status.as_u16() == 429 {
                self.breaker.on_failure().await;
            } else {
                self.breaker.on_success().await;
            }
            warn!(status = status.as_u16(), "authority returned non-success status");
            let excerpt: String = body.chars().take(256).collect();
            return AuthorityResult::transport_failure(
                format!("{}{}", transport_codes::HTTP_STATUS_PREFIX, status.as_u16()),
                format!("HTTP {status}: {excerpt}"),
            )
            .with_raw_response(body);
        }

        self.breaker.on_success().await;
        let result = parse_response(&body);
        debug!(
            accepted = result.success,
            code = %result.code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "authority answered"
        );
        result
    }

    fn name(&self) -> &str {
        "http"
    }
}
