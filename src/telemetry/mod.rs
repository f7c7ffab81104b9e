//! Structured logging for the compliance ledger
//!
//! One `tracing` subscriber per process: `EnvFilter` from `RUST_LOG` or
//! `LOG_LEVEL`, compact or JSON output. Operator alerts are ordinary
//! `error!` events carrying an `alert` field (see [`alerts`]).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    /// One JSON object per event, for log shippers
    Json,
    Off,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" | "text" => Some(Self::Compact),
            "json" => Some(Self::Json),
            "off" | "none" => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// Filter directives, used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// `LOG_FORMAT` wins over the older `LOG_JSON=true` switch.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let json_flag = lookup("LOG_JSON").is_some_and(|v| v == "true" || v == "1");
        let format = lookup("LOG_FORMAT")
            .and_then(|v| LogFormat::parse(&v))
            .unwrap_or(if json_flag {
                LogFormat::Json
            } else {
                LogFormat::Compact
            });
        Self {
            format,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = tracing_subscriber::registry().with(config.env_filter());
    match config.format {
        LogFormat::Off => registry.try_init()?,
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?,
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(true))
            .try_init()?,
    }

    tracing::info!(
        service = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        format = ?config.format,
        "Logging initialized"
    );
    Ok(())
}

/// Values of the `alert` field on operator-facing `error!` events
pub mod alerts {
    pub const CHAIN_INTEGRITY: &str = "chain_integrity";
    pub const RETRY_CEILING: &str = "retry_ceiling";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> TelemetryConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TelemetryConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_to_compact_info() {
        let config = config(&[]);
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn log_format_overrides_the_json_switch() {
        assert_eq!(config(&[("LOG_JSON", "1")]).format, LogFormat::Json);
        assert_eq!(
            config(&[("LOG_JSON", "true"), ("LOG_FORMAT", "off")]).format,
            LogFormat::Off
        );
        assert_eq!(config(&[("LOG_FORMAT", "bogus")]).format, LogFormat::Compact);
    }
}
