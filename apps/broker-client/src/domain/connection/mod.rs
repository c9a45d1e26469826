//! Broker Session
//!
//! Configuration, status and errors for the single session a client holds
//! with its broker gateway.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Gateway host.
    pub host: String,
    /// Gateway TCP port.
    pub port: u16,
    /// Client id, unique among sessions connected to the same gateway.
    pub client_id: i32,
}

impl ConnectionConfig {
    /// Create a configuration.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, client_id: i32) -> Self {
        Self {
            host: host.into(),
            port,
            client_id,
        }
    }

    /// Validate before any network activity.
    ///
    /// Uniqueness of `client_id` is enforced by the gateway, not here.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::InvalidConfig` for an empty host, port zero,
    /// or a negative client id.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.host.trim().is_empty() {
            return Err(ConnectionError::InvalidConfig(
                "host must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConnectionError::InvalidConfig(
                "port must be a valid TCP port (1-65535)".to_string(),
            ));
        }
        if self.client_id < 0 {
            return Err(ConnectionError::InvalidConfig(format!(
                "client id must be non-negative, got {}",
                self.client_id
            )));
        }
        Ok(())
    }

    /// `host:port` for logging.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No session.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Session established and read loop running.
    Connected,
    /// Explicit reconnect in progress.
    Reconnecting,
    /// Handshake or transport failure. Recovered only by an explicit reconnect.
    Failed,
}

impl ConnectionStatus {
    /// Returns true if requests can be sent.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    /// Numeric code for the status gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Reconnecting => 3.0,
            Self::Failed => 4.0,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake and transport failures. Recoverable through an explicit reconnect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Configuration rejected before connecting.
    #[error("invalid connection config: {0}")]
    InvalidConfig(String),

    /// A session is already established.
    #[error("already connected")]
    AlreadyConnected,

    /// No session is established.
    #[error("not connected (status: {0})")]
    NotConnected(ConnectionStatus),

    /// `reconnect` was called without a prior `connect`.
    #[error("no previous connection config to reconnect with")]
    NeverConnected,

    /// The gateway did not complete the handshake in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The gateway refused or broke the handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The transport failed while sending or reading.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The read thread could not be started.
    #[error("failed to start read thread: {0}")]
    ReadThread(String),

    /// Retries stopped before a session was re-established.
    #[error("reconnect abandoned after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the last attempt.
        last_error: String,
    },
}
