//! Local stand-in for the tax authority used outside production.
//!
//! Answers with the same XML shape as the real endpoint so responses go
//! through the regular parser.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::response::parse_response;
use super::AuthorityClient;
use crate::document::{self, xml::escape};
use crate::domain::{transport_codes, AuthorityResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatorMode {
    AcceptAll,
    RejectAll { code: String, message: String },
    /// Behave as if the endpoint were unreachable
    FailTransport,
}

pub struct SimulatedAuthority {
    delay: Duration,
    mode: Mutex<SimulatorMode>,
    submissions: AtomicU64,
}

impl SimulatedAuthority {
    pub fn new(delay: Duration) -> Self {
        Self::with_mode(delay, SimulatorMode::AcceptAll)
    }

    pub fn with_mode(delay: Duration, mode: SimulatorMode) -> Self {
        Self {
            delay,
            mode: Mutex::new(mode),
            submissions: AtomicU64::new(0),
        }
    }

    /// Switch behavior for subsequent submissions.
    pub fn set_mode(&self, mode: SimulatorMode) {
        match self.mode.lock() {
            Ok(mut guard) => *guard = mode,
            Err(poisoned) => *poisoned.into_inner() = mode,
        }
    }

    fn mode(&self) -> SimulatorMode {
        match self.mode.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Submissions that reached the simulator, failed ones included
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    fn confirmation_code(signed_document: &str) -> String {
        let digest = Sha256::digest(signed_document.as_bytes());
        format!("SIM-{}", hex::encode_upper(&digest[..8]))
    }

    fn accepted_response(signed_document: &str) -> String {
        let number = document::field(signed_document, "NumSerieFactura").unwrap_or_default();
        format!(
            "<tikR:RespuestaRegFactuSistemaFacturacion xmlns:tikR=\"urn:simulator\">\
<tikR:CSV>{}</tikR:CSV>\
<tikR:EstadoEnvio>Correcto</tikR:EstadoEnvio>\
<tikR:RespuestaLinea><tikR:NumSerieFactura>{}</tikR:NumSerieFactura>\
<tikR:EstadoRegistro>Correcto</tikR:EstadoRegistro></tikR:RespuestaLinea>\
</tikR:RespuestaRegFactuSistemaFacturacion>",
            Self::confirmation_code(signed_document),
            escape(&number),
        )
    }

    fn rejected_response(code: &str, message: &str) -> String {
        format!(
            "<tikR:RespuestaRegFactuSistemaFacturacion xmlns:tikR=\"urn:simulator\">\
<tikR:EstadoEnvio>Incorrecto</tikR:EstadoEnvio>\
<tikR:RespuestaLinea><tikR:EstadoRegistro>Incorrecto</tikR:EstadoRegistro>\
<tikR:CodigoErrorRegistro>{}</tikR:CodigoErrorRegistro>\
<tikR:DescripcionErrorRegistro>{}</tikR:DescripcionErrorRegistro></tikR:RespuestaLinea>\
</tikR:RespuestaRegFactuSistemaFacturacion>",
            escape(code),
            escape(message),
        )
    }
}

impl Default for SimulatedAuthority {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl AuthorityClient for SimulatedAuthority {
    async fn submit(&self, signed_document: &str) -> AuthorityResult {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = match self.mode() {
            SimulatorMode::AcceptAll => parse_response(&Self::accepted_response(signed_document)),
            SimulatorMode::RejectAll { code, message } => {
                parse_response(&Self::rejected_response(&code, &message))
            }
            SimulatorMode::FailTransport => AuthorityResult::transport_failure(
                transport_codes::NETWORK_ERROR,
                "simulated transport failure",
            ),
        };
        debug!(accepted = result.success, code = %result.code, "simulated authority answered");
        result
    }

    fn name(&self) -> &str {
        "simulator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "<sf:RegistroAlta><sf:NumSerieFactura>A-1</sf:NumSerieFactura></sf:RegistroAlta>";

    #[tokio::test(start_paused = true)]
    async fn accepts_after_delay_with_stable_code() {
        let authority = SimulatedAuthority::new(Duration::from_millis(250));
        let started = tokio::time::Instant::now();

        let first = authority.submit(DOC).await;
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(first.success);
        let code = first.confirmation_code.clone().unwrap();
        assert!(code.starts_with("SIM-"));

        let second = authority.submit(DOC).await;
        assert_eq!(second.confirmation_code.as_deref(), Some(code.as_str()));
        assert_eq!(authority.submissions(), 2);
    }

    #[tokio::test]
    async fn rejection_mode_goes_through_the_parser() {
        let authority = SimulatedAuthority::with_mode(
            Duration::ZERO,
            SimulatorMode::RejectAll {
                code: "1100".into(),
                message: "NIF no identificado".into(),
            },
        );
        let result = authority.submit(DOC).await;
        assert!(!result.success);
        assert_eq!(result.code, "1100");
        assert!(!result.is_transport_failure());
        assert!(result.raw_response.is_some());
    }

    #[tokio::test]
    async fn mode_can_be_switched() {
        let authority = SimulatedAuthority::with_mode(Duration::ZERO, SimulatorMode::FailTransport);
        assert!(authority.submit(DOC).await.is_transport_failure());

        authority.set_mode(SimulatorMode::AcceptAll);
        assert!(authority.submit(DOC).await.success);
    }
}
