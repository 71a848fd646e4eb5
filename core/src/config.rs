//! Bridge configuration loaded from the environment.
//!
//! # Environment variables
//!
//! | Variable | Required | Default |
//! |---|---|---|
//! | `KAFKA_BOOTSTRAP_SERVERS` | yes | |
//! | `KAFKA_CURRENT_SERVICE` | yes | |
//! | `KAFKA_SOURCE_SERVICES` | no (comma-separated) | none |
//! | `KAFKA_REQUEST_TIMEOUT_SECS` | no | 30 |
//! | `KAFKA_POLL_TIMEOUT_MS` | no | 1000 |
//!
//! # Example
//!
//! ```no_run
//! use entity_bridge_core::config::BridgeConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BridgeConfig::from_env()?;
//! println!("{} consumes from {:?}", config.service_name, config.source_services);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bounded wait for a single poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable not set
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    /// A value could not be parsed
    #[error("Failed to parse {name}: {reason}")]
    ParseError {
        /// Variable or field name
        name: String,
        /// Why parsing failed
        reason: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Everything a process needs to join the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Comma-separated broker list.
    pub brokers: String,
    /// This process's service name.
    pub service_name: String,
    /// Peers whose commands this process consumes.
    pub source_services: Vec<String>,
    /// How long a request waits for its reply.
    pub request_timeout: Duration,
    /// Bounded wait for each poll of a read loop.
    pub poll_timeout: Duration,
}

impl BridgeConfig {
    /// Create a configuration with defaults for everything optional.
    #[must_use]
    pub fn new(brokers: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            service_name: service_name.into(),
            source_services: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Set the peers whose commands are consumed.
    #[must_use]
    pub fn with_source_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_services = services.into_iter().map(Into::into).collect();
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the poll timeout.
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Load from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing, a value does
    /// not parse, or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`BridgeConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ConfigError::EnvVarNotSet(name.to_string()))
        };

        let mut config = Self::new(
            required("KAFKA_BOOTSTRAP_SERVERS")?,
            required("KAFKA_CURRENT_SERVICE")?.trim(),
        );

        if let Some(raw) = lookup("KAFKA_SOURCE_SERVICES") {
            config.source_services = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(raw) = lookup("KAFKA_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse_number("KAFKA_REQUEST_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = lookup("KAFKA_POLL_TIMEOUT_MS") {
            config.poll_timeout = Duration::from_millis(parse_number("KAFKA_POLL_TIMEOUT_MS", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for empty brokers, empty or
    /// whitespace-containing service names, or zero timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.trim().is_empty() {
            return Err(ConfigError::ValidationError("brokers must not be empty".to_string()));
        }
        for name in std::iter::once(&self.service_name).chain(&self.source_services) {
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(ConfigError::ValidationError(format!(
                    "invalid service name '{name}'"
                )));
            }
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "request timeout must be greater than 0".to_string(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "poll timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number(name: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::ParseError {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn loads_required_and_defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092"),
            ("KAFKA_CURRENT_SERVICE", "payment"),
        ]))
        .unwrap();

        assert_eq!(config.brokers, "localhost:9092");
        assert_eq!(config.service_name, "payment");
        assert!(config.source_services.is_empty());
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.poll_timeout, DEFAULT_POLL_TIMEOUT);
    }

    #[test]
    fn parses_source_list_and_timeouts() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("KAFKA_BOOTSTRAP_SERVERS", "a:9092,b:9092"),
            ("KAFKA_CURRENT_SERVICE", "payment"),
            ("KAFKA_SOURCE_SERVICES", " order, user ,,"),
            ("KAFKA_REQUEST_TIMEOUT_SECS", "5"),
            ("KAFKA_POLL_TIMEOUT_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.source_services, vec!["order", "user"]);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_timeout, Duration::from_millis(250));
    }

    #[test]
    fn missing_required_variable_is_reported() {
        let err = BridgeConfig::from_lookup(lookup(&[("KAFKA_CURRENT_SERVICE", "payment")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::EnvVarNotSet("KAFKA_BOOTSTRAP_SERVERS".to_string()));
    }

    #[test]
    fn bad_numbers_and_zero_timeouts_are_rejected() {
        let err = BridgeConfig::from_lookup(lookup(&[
            ("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092"),
            ("KAFKA_CURRENT_SERVICE", "payment"),
            ("KAFKA_REQUEST_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));

        let err = BridgeConfig::new("localhost:9092", "payment")
            .with_request_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn service_names_with_whitespace_are_invalid() {
        let err = BridgeConfig::new("localhost:9092", "payment")
            .with_source_services(["order service"])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
