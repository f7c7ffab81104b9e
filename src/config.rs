//! Process configuration
//!
//! Everything is read from environment variables. Defaults suit a
//! development deployment against the authority simulator.

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::authority::HttpAuthorityConfig;
use crate::crypto::{parse_keyring, ChainSecret, EncryptionKey};
use crate::document::SoftwareInfo;
use crate::infra::{CircuitBreakerConfig, LedgerError, Result};
use crate::pipeline::{PipelineConfig, RecoveryConfig, DEFAULT_VERIFICATION_URL};

/// Where signed documents go.
#[derive(Debug, Clone)]
pub enum AuthorityMode {
    /// Local simulator that accepts after a delay
    Simulator { delay: Duration },
    Production(HttpAuthorityConfig),
}

#[derive(Clone)]
pub struct LedgerConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// First key encrypts; all keys are tried on decrypt
    pub vault_keys: Vec<EncryptionKey>,
    pub chain_secret: ChainSecret,
    pub authority: AuthorityMode,
    pub recovery: RecoveryConfig,
    pub pipeline: PipelineConfig,
}

impl fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "[set]"))
            .field("db_max_connections", &self.db_max_connections)
            .field("vault_keys", &self.vault_keys.len())
            .field("chain_secret", &self.chain_secret)
            .field("authority", &self.authority)
            .field("recovery", &self.recovery)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl LedgerConfig {
    /// Load configuration from environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());

        let vault_keys = lookup("LEDGER_VAULT_KEYS")
            .or_else(|| lookup("LEDGER_VAULT_KEY"))
            .ok_or_else(|| missing("LEDGER_VAULT_KEYS"))
            .and_then(|s| {
                parse_keyring(&s)
                    .map_err(|e| LedgerError::Configuration(format!("LEDGER_VAULT_KEYS: {e}")))
            })?;

        let chain_secret = lookup("LEDGER_CHAIN_SECRET")
            .ok_or_else(|| missing("LEDGER_CHAIN_SECRET"))
            .and_then(|s| {
                ChainSecret::parse(&s)
                    .map_err(|e| LedgerError::Configuration(format!("LEDGER_CHAIN_SECRET: {e}")))
            })?;

        let mode = lookup("AUTHORITY_MODE").unwrap_or_else(|| "simulator".to_string());
        let authority = match mode.trim().to_ascii_lowercase().as_str() {
            "simulator" => AuthorityMode::Simulator {
                delay: Duration::from_millis(parsed("AUTHORITY_SIMULATOR_DELAY_MS").unwrap_or(250)),
            },
            "production" => {
                let endpoint = lookup("AUTHORITY_ENDPOINT")
                    .ok_or_else(|| missing("AUTHORITY_ENDPOINT"))?;
                let endpoint = Url::parse(&endpoint).map_err(|e| {
                    LedgerError::Configuration(format!("AUTHORITY_ENDPOINT: {e}"))
                })?;
                let breaker = CircuitBreakerConfig {
                    failure_threshold: parsed("AUTHORITY_CIRCUIT_FAILURE_THRESHOLD")
                        .map(|n| n as u32)
                        .unwrap_or(5),
                    open_timeout: Duration::from_secs(
                        parsed("AUTHORITY_CIRCUIT_OPEN_SECS").unwrap_or(60),
                    ),
                    ..CircuitBreakerConfig::default()
                };
                AuthorityMode::Production(
                    HttpAuthorityConfig::new(endpoint)
                        .with_timeout(Duration::from_secs(
                            parsed("AUTHORITY_TIMEOUT_SECS").unwrap_or(30),
                        ))
                        .with_circuit_breaker(breaker),
                )
            }
            other => {
                return Err(LedgerError::Configuration(format!(
                    "AUTHORITY_MODE must be simulator or production, got {other:?}"
                )))
            }
        };

        let verification_url = lookup("LEDGER_VERIFICATION_URL")
            .unwrap_or_else(|| DEFAULT_VERIFICATION_URL.to_string());
        let verification_url = Url::parse(&verification_url).map_err(|e| {
            LedgerError::Configuration(format!("LEDGER_VERIFICATION_URL: {e}"))
        })?;
        let defaults = SoftwareInfo::default();
        let software = SoftwareInfo {
            name: lookup("LEDGER_SOFTWARE_NAME").unwrap_or(defaults.name),
            version: lookup("LEDGER_SOFTWARE_VERSION").unwrap_or(defaults.version),
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            db_max_connections: parsed("DB_MAX_CONNECTIONS").map(|n| n as u32).unwrap_or(10),
            vault_keys,
            chain_secret,
            authority,
            recovery: RecoveryConfig::from_lookup(&lookup),
            pipeline: PipelineConfig {
                verification_url,
                software,
            },
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| missing("DATABASE_URL"))
    }
}

fn missing(name: &str) -> LedgerError {
    LedgerError::Configuration(format!("{name} is not set"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            (
                "LEDGER_VAULT_KEYS",
                "0000000000000000000000000000000000000000000000000000000000000001,\
                 0000000000000000000000000000000000000000000000000000000000000002",
            ),
            ("LEDGER_CHAIN_SECRET", "a deployment chain secret of sufficient length"),
        ]
    }

    #[test]
    fn defaults_use_the_simulator() {
        let config = LedgerConfig::from_lookup(lookup(&base())).unwrap();
        assert_eq!(config.vault_keys.len(), 2);
        assert_eq!(config.db_max_connections, 10);
        assert!(config.database_url.is_none());
        assert!(matches!(
            config.authority,
            AuthorityMode::Simulator { delay } if delay == Duration::from_millis(250)
        ));
        assert_eq!(config.pipeline.verification_url.as_str(), DEFAULT_VERIFICATION_URL);
    }

    #[test]
    fn production_requires_an_endpoint() {
        let mut vars = base();
        vars.push(("AUTHORITY_MODE", "production"));
        let err = LedgerConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("AUTHORITY_ENDPOINT"));

        vars.push(("AUTHORITY_ENDPOINT", "https://authority.example/submit"));
        vars.push(("AUTHORITY_TIMEOUT_SECS", "7"));
        vars.push(("AUTHORITY_CIRCUIT_FAILURE_THRESHOLD", "3"));
        let config = LedgerConfig::from_lookup(lookup(&vars)).unwrap();
        match config.authority {
            AuthorityMode::Production(http) => {
                assert_eq!(http.timeout, Duration::from_secs(7));
                assert_eq!(http.circuit_breaker.failure_threshold, 3);
                assert_eq!(http.endpoint.host_str(), Some("authority.example"));
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn missing_secrets_are_configuration_errors() {
        let err = LedgerConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, LedgerError::Configuration(_)));

        let vars = vec![(
            "LEDGER_VAULT_KEY",
            "0000000000000000000000000000000000000000000000000000000000000001",
        )];
        let err = LedgerConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("LEDGER_CHAIN_SECRET"));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let mut vars = base();
        vars.push(("AUTHORITY_MODE", "staging"));
        assert!(LedgerConfig::from_lookup(lookup(&vars)).is_err());
    }

    #[test]
    fn software_identity_is_overridable() {
        let mut vars = base();
        vars.push(("LEDGER_SOFTWARE_NAME", "Facturas Pro"));
        let config = LedgerConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.pipeline.software.name, "Facturas Pro");
        assert_eq!(config.pipeline.software.version, env!("CARGO_PKG_VERSION"));
    }
}
