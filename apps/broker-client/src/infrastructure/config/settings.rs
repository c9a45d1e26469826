//! Client Configuration Settings
//!
//! Configuration for the binary, loaded from environment variables. The
//! library itself only takes the typed values.

use std::str::FromStr;
use std::time::Duration;

use crate::application::services::{ConnectionSettings, ReconnectConfig, RunnerSettings};
use crate::domain::connection::{ConnectionConfig, ConnectionError};

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Gateway endpoint and client id.
    pub connection: ConnectionConfig,
    /// Handshake, poll and join timeouts.
    pub session: ConnectionSettings,
    /// Strategy shutdown bound.
    pub runner: RunnerSettings,
    /// Backoff for the opt-in reconnect helper.
    pub reconnect: ReconnectConfig,
    /// Server port settings.
    pub server: ServerSettings,
    /// Instrument traded by the demo strategy.
    pub demo_instrument: String,
}

impl ClientConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that does not parse
    /// or the resulting connection config is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let host = env.string("BROKER_HOST", "127.0.0.1")?;
        let port = env.parse("BROKER_PORT", 7497_u16)?;
        let client_id = env.parse("BROKER_CLIENT_ID", 1_i32)?;
        let connection = ConnectionConfig::new(host, port, client_id);
        connection.validate()?;

        let session_defaults = ConnectionSettings::default();
        let session = ConnectionSettings {
            handshake_timeout: env.secs(
                "BROKER_HANDSHAKE_TIMEOUT_SECS",
                session_defaults.handshake_timeout,
            )?,
            read_poll_interval: env.millis(
                "BROKER_READ_POLL_MS",
                session_defaults.read_poll_interval,
            )?,
            join_timeout: env.secs("BROKER_JOIN_TIMEOUT_SECS", session_defaults.join_timeout)?,
        };
        if session.read_poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "BROKER_READ_POLL_MS".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        let runner = RunnerSettings {
            shutdown_timeout: env.secs(
                "RUNNER_SHUTDOWN_TIMEOUT_SECS",
                RunnerSettings::default().shutdown_timeout,
            )?,
        };

        let reconnect_defaults = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            initial_delay: env.millis(
                "BROKER_RECONNECT_INITIAL_MS",
                reconnect_defaults.initial_delay,
            )?,
            max_delay: env.secs("BROKER_RECONNECT_MAX_SECS", reconnect_defaults.max_delay)?,
            multiplier: env.parse("BROKER_RECONNECT_MULTIPLIER", reconnect_defaults.multiplier)?,
            jitter_factor: env.parse("BROKER_RECONNECT_JITTER", reconnect_defaults.jitter_factor)?,
            max_attempts: env.parse(
                "BROKER_RECONNECT_MAX_ATTEMPTS",
                reconnect_defaults.max_attempts,
            )?,
        };
        if reconnect.multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                key: "BROKER_RECONNECT_MULTIPLIER".to_string(),
                reason: "must be at least 1.0".to_string(),
            });
        }

        let server = ServerSettings {
            health_port: env.parse("BROKER_HEALTH_PORT", ServerSettings::default().health_port)?,
        };

        Ok(Self {
            connection,
            session,
            runner,
            reconnect,
            server,
            demo_instrument: env.string("BROKER_DEMO_INSTRUMENT", "SPY")?,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed or is out of range.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// What was wrong.
        reason: String,
    },
    /// The connection settings were rejected.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn string(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        match (self.0)(key) {
            None => Ok(default.to_string()),
            Some(value) if value.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(value) => Ok(value.trim().to_string()),
        }
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = (self.0)(key) else {
            return Ok(default);
        };
        raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            reason: format!("{raw:?}: {err}"),
        })
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ClientConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ClientConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.connection, ConnectionConfig::new("127.0.0.1", 7497, 1));
        assert_eq!(config.session, ConnectionSettings::default());
        assert_eq!(config.runner.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.server.health_port, 8083);
        assert_eq!(config.demo_instrument, "SPY");
        assert_eq!(config.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("BROKER_HOST", "gateway.local"),
            ("BROKER_PORT", "4002"),
            ("BROKER_CLIENT_ID", "17"),
            ("BROKER_READ_POLL_MS", "25"),
            ("BROKER_RECONNECT_MAX_ATTEMPTS", "0"),
            ("BROKER_DEMO_INSTRUMENT", "QQQ"),
        ])
        .unwrap();
        assert_eq!(config.connection.endpoint(), "gateway.local:4002");
        assert_eq!(config.connection.client_id, 17);
        assert_eq!(config.session.read_poll_interval, Duration::from_millis(25));
        assert_eq!(config.reconnect.max_attempts, 0);
        assert_eq!(config.demo_instrument, "QQQ");
    }

    #[test]
    fn rejects_bad_values() {
        for (key, value) in [
            ("BROKER_PORT", "70000"),
            ("BROKER_PORT", "abc"),
            ("BROKER_CLIENT_ID", "one"),
            ("BROKER_READ_POLL_MS", "0"),
            ("BROKER_RECONNECT_MULTIPLIER", "0.5"),
        ] {
            let err = load(&[(key, value)]).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { key: ref k, .. } if k == key),
                "{key}={value} gave {err}"
            );
        }
    }

    #[test]
    fn rejects_zero_port_and_empty_host() {
        assert!(matches!(
            load(&[("BROKER_PORT", "0")]),
            Err(ConfigError::Connection(ConnectionError::InvalidConfig(_)))
        ));
        assert!(matches!(
            load(&[("BROKER_HOST", "  ")]),
            Err(ConfigError::EmptyValue(_))
        ));
    }
}
