//! Connection Manager
//!
//! Owns the session with the broker gateway: handshake, the dedicated read
//! thread that feeds the dispatcher, explicit reconnects and the serialized
//! send path.
//!
//! # Status transitions
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──handshake ok──▶ Connected
//!                               │                            │
//!                          handshake error            socket closed
//!                               ▼                            ▼
//!                             Failed ◀───────────────────────┘
//!                               │
//!                           reconnect ──▶ Reconnecting ──▶ Connected | Failed
//! ```
//!
//! Every transition is published through the dispatcher so the shared state
//! mirrors connectivity. Nothing here reconnects on its own.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::dispatcher::EventDispatcher;
use super::orders::OrderIdSequence;
use super::reconnect::{ReconnectPolicy, sleep_unless_cancelled};
use super::worker::{WorkerThread, panic_message};
use crate::application::ports::{BrokerTransport, InboundMessage, OutboundRequest};
use crate::domain::connection::{ConnectionConfig, ConnectionError, ConnectionStatus};
use crate::infrastructure::metrics;

const READ_THREAD_NAME: &str = "broker-read";

// =============================================================================
// Settings
// =============================================================================

/// Timeouts for the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// How long the gateway has to complete the handshake.
    pub handshake_timeout: Duration,
    /// Read timeout per poll; bounds how quickly the read thread notices
    /// cancellation.
    pub read_poll_interval: Duration,
    /// How long `disconnect` waits for the read thread to exit.
    pub join_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            read_poll_interval: Duration::from_millis(100),
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Session summary for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    /// Current status.
    pub status: ConnectionStatus,
    /// `host:port` of the last configured gateway.
    pub endpoint: Option<String>,
    /// Client id of the last configured session.
    pub client_id: Option<i32>,
    /// Protocol version reported by the gateway.
    pub server_version: Option<i32>,
    /// When the current or most recent session was established.
    pub connected_at: Option<DateTime<Utc>>,
    /// Sessions established since creation.
    pub sessions: u64,
    /// Explicit reconnect attempts since creation.
    pub reconnects: u64,
    /// Most recent connection failure.
    pub last_error: Option<String>,
}

// =============================================================================
// Session State (shared with the read thread)
// =============================================================================

#[derive(Debug, Default)]
struct SessionShared {
    status: RwLock<ConnectionStatus>,
    /// Bumped whenever a session is retired so a stale read thread cannot
    /// mark a newer session as failed.
    generation: AtomicU64,
    config: RwLock<Option<ConnectionConfig>>,
    server_version: RwLock<Option<i32>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    sessions: AtomicU64,
    reconnects: AtomicU64,
}

impl SessionShared {
    fn publish(&self, dispatcher: &EventDispatcher, status: ConnectionStatus) {
        let mut current = self.status.write();
        *current = status;
        dispatcher.on_connection_status(status);
    }

    fn fail(&self, dispatcher: &EventDispatcher, reason: String) {
        *self.last_error.write() = Some(reason);
        self.publish(dispatcher, ConnectionStatus::Failed);
    }

    /// Mark the session failed if it is still the live one.
    fn fail_session(&self, dispatcher: &EventDispatcher, generation: u64, reason: &str) -> bool {
        let mut current = self.status.write();
        if self.generation.load(Ordering::SeqCst) != generation || !current.is_connected() {
            return false;
        }
        *self.last_error.write() = Some(reason.to_string());
        *current = ConnectionStatus::Failed;
        dispatcher.on_connection_status(ConnectionStatus::Failed);
        true
    }

    fn retire_session(&self) {
        let _status = self.status.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn begin_session(&self) -> u64 {
        let _status = self.status.write();
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }
}

struct Reader {
    worker: WorkerThread<()>,
    cancel: CancellationToken,
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Owns the broker session.
pub struct ConnectionManager {
    transport: Arc<dyn BrokerTransport>,
    dispatcher: Arc<EventDispatcher>,
    sequence: Arc<OrderIdSequence>,
    settings: ConnectionSettings,
    shared: Arc<SessionShared>,
    /// Serializes connect, disconnect and reconnect.
    reader: Mutex<Option<Reader>>,
    /// Serializes outbound requests; transports are not assumed safe for
    /// concurrent sends.
    send_lock: Mutex<()>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.status())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager around `transport`. No connection is made yet.
    #[must_use]
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        dispatcher: Arc<EventDispatcher>,
        sequence: Arc<OrderIdSequence>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            sequence,
            settings,
            shared: Arc::new(SessionShared::default()),
            reader: Mutex::new(None),
            send_lock: Mutex::new(()),
        }
    }

    /// Perform the handshake and start the read thread. Blocks until the
    /// session is established or has failed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a bad config, `AlreadyConnected` if a
    /// session is live, and a handshake or transport error if the gateway
    /// cannot be reached. On a handshake failure the status becomes `Failed`.
    pub fn connect(&self, config: ConnectionConfig) -> Result<(), ConnectionError> {
        config.validate()?;

        let mut reader = self.reader.lock();
        if self.is_connected() {
            return Err(ConnectionError::AlreadyConnected);
        }
        self.teardown(&mut reader);
        *self.shared.config.write() = Some(config.clone());
        self.establish(&mut reader, &config, ConnectionStatus::Connecting)
    }

    /// End the session and wait (bounded) for the read thread to exit.
    pub fn disconnect(&self) {
        self.shutdown();
    }

    /// Like [`disconnect`](Self::disconnect); returns false if the read
    /// thread did not exit within the join timeout.
    pub(crate) fn shutdown(&self) -> bool {
        let mut reader = self.reader.lock();
        let exited = self.teardown(&mut reader);
        if self.status() != ConnectionStatus::Disconnected {
            self.shared.publish(&self.dispatcher, ConnectionStatus::Disconnected);
            tracing::info!("Disconnected from broker gateway");
        }
        exited
    }

    /// Tear down whatever is left of the session and establish a new one
    /// with the last config.
    ///
    /// # Errors
    ///
    /// Returns `NeverConnected` if `connect` was never called, otherwise the
    /// same errors as [`connect`](Self::connect).
    pub fn reconnect(&self) -> Result<(), ConnectionError> {
        let config = self
            .shared
            .config
            .read()
            .clone()
            .ok_or(ConnectionError::NeverConnected)?;

        let mut reader = self.reader.lock();
        self.teardown(&mut reader);
        self.shared.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::record_reconnect();
        self.establish(&mut reader, &config, ConnectionStatus::Reconnecting)
    }

    /// Call [`reconnect`](Self::reconnect) until it succeeds, the policy
    /// runs out of retries, or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `NeverConnected` if there is nothing to reconnect to and
    /// `ReconnectExhausted` when retries stop.
    pub fn reconnect_with_backoff(
        &self,
        policy: &mut ReconnectPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        let mut attempts = 0;
        let mut last_error = String::from("cancelled before the first attempt");

        while !cancel.is_cancelled() {
            attempts += 1;
            match self.reconnect() {
                Ok(()) => {
                    policy.reset();
                    tracing::info!(attempts, "Reconnected to broker gateway");
                    return Ok(());
                }
                Err(ConnectionError::NeverConnected) => {
                    return Err(ConnectionError::NeverConnected);
                }
                Err(err) => {
                    last_error = err.to_string();
                    let Some(delay) = policy.next_delay() else {
                        break;
                    };
                    tracing::warn!(
                        attempts,
                        delay_ms = millis(delay),
                        error = %err,
                        "Reconnect failed, backing off"
                    );
                    if sleep_unless_cancelled(delay, cancel) {
                        break;
                    }
                }
            }
        }

        tracing::error!(attempts, error = %last_error, "Giving up on reconnect");
        Err(ConnectionError::ReconnectExhausted {
            attempts,
            last_error,
        })
    }

    /// Returns true while a session is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.read()
    }

    /// Session summary.
    #[must_use]
    pub fn health(&self) -> ConnectionHealth {
        let config = self.shared.config.read().clone();
        ConnectionHealth {
            status: self.status(),
            endpoint: config.as_ref().map(ConnectionConfig::endpoint),
            client_id: config.map(|c| c.client_id),
            server_version: *self.shared.server_version.read(),
            connected_at: *self.shared.connected_at.read(),
            sessions: self.shared.sessions.load(Ordering::Relaxed),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
            last_error: self.shared.last_error.read().clone(),
        }
    }

    /// Send one request. Requests from concurrent callers are serialized.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless a session is established, or the
    /// transport's error.
    pub(crate) fn send(&self, request: &OutboundRequest) -> Result<(), ConnectionError> {
        let _guard = self.send_lock.lock();
        let status = self.status();
        if !status.is_connected() {
            return Err(ConnectionError::NotConnected(status));
        }
        tracing::debug!(kind = request.kind(), "Sending request");
        self.transport.send(request).map_err(ConnectionError::from)
    }

    fn establish(
        &self,
        reader: &mut Option<Reader>,
        config: &ConnectionConfig,
        pending: ConnectionStatus,
    ) -> Result<(), ConnectionError> {
        self.shared.publish(&self.dispatcher, pending);
        tracing::info!(
            endpoint = %config.endpoint(),
            client_id = config.client_id,
            "Connecting to broker gateway"
        );

        let handshake = match self.transport.connect(config, self.settings.handshake_timeout) {
            Ok(handshake) => handshake,
            Err(err) => {
                let err = ConnectionError::from(err);
                tracing::error!(endpoint = %config.endpoint(), error = %err, "Handshake failed");
                self.transport.disconnect();
                self.shared.fail(&self.dispatcher, err.to_string());
                return Err(err);
            }
        };

        let next_id = self.sequence.advance_to(handshake.next_order_id);
        let generation = self.shared.begin_session();
        *self.shared.server_version.write() = Some(handshake.server_version);
        *self.shared.connected_at.write() = Some(Utc::now());
        self.shared.sessions.fetch_add(1, Ordering::Relaxed);
        // Connected before the reader starts so the first message already
        // sees a live session.
        self.shared.publish(&self.dispatcher, ConnectionStatus::Connected);

        let cancel = CancellationToken::new();
        let loop_ctx = ReadLoop {
            transport: Arc::clone(&self.transport),
            dispatcher: Arc::clone(&self.dispatcher),
            shared: Arc::clone(&self.shared),
            generation,
            poll: self.settings.read_poll_interval,
            cancel: cancel.clone(),
        };
        match WorkerThread::spawn(READ_THREAD_NAME, move || loop_ctx.run()) {
            Ok(worker) => {
                *reader = Some(Reader { worker, cancel });
                tracing::info!(
                    endpoint = %config.endpoint(),
                    server_version = handshake.server_version,
                    next_order_id = next_id,
                    "Connected to broker gateway"
                );
                Ok(())
            }
            Err(err) => {
                self.shared.retire_session();
                self.transport.disconnect();
                let err = ConnectionError::ReadThread(err.to_string());
                self.shared.fail(&self.dispatcher, err.to_string());
                tracing::error!(error = %err, "Could not start read thread");
                Err(err)
            }
        }
    }

    /// Stop the read thread and close the transport. Returns false if the
    /// thread is still running after the join timeout.
    fn teardown(&self, reader: &mut Option<Reader>) -> bool {
        self.shared.retire_session();
        let Some(mut current) = reader.take() else {
            self.transport.disconnect();
            return true;
        };

        current.cancel.cancel();
        self.transport.disconnect();
        match current.worker.join_within(self.settings.join_timeout) {
            Some(Ok(())) => true,
            Some(Err(panic)) => {
                tracing::error!(
                    thread = current.worker.name(),
                    panic = %panic,
                    "Read thread panicked"
                );
                true
            }
            None => {
                tracing::warn!(
                    thread = current.worker.name(),
                    timeout_ms = millis(self.settings.join_timeout),
                    "Read thread did not exit in time, detaching"
                );
                false
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Let a still-running reader wind down instead of polling forever.
        if let Some(reader) = self.reader.get_mut().take() {
            reader.cancel.cancel();
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Read Loop
// =============================================================================

struct ReadLoop {
    transport: Arc<dyn BrokerTransport>,
    dispatcher: Arc<EventDispatcher>,
    shared: Arc<SessionShared>,
    generation: u64,
    poll: Duration,
    cancel: CancellationToken,
}

impl ReadLoop {
    fn run(self) {
        tracing::debug!(generation = self.generation, "Read loop started");
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.poll_until_closed())) {
            self.lost(&format!("read loop panicked: {}", panic_message(&*payload)));
        }
        tracing::debug!(generation = self.generation, "Read loop exited");
    }

    fn poll_until_closed(&self) {
        while !self.cancel.is_cancelled() {
            match self.transport.read(self.poll) {
                Ok(None) => {}
                Ok(Some(InboundMessage::ConnectionClosed { reason })) => {
                    self.dispatcher.dispatch(InboundMessage::ConnectionClosed {
                        reason: reason.clone(),
                    });
                    self.lost(&reason);
                    break;
                }
                Ok(Some(message)) => self.dispatcher.dispatch(message),
                Err(err) => {
                    self.lost(&err.to_string());
                    break;
                }
            }
        }
    }

    fn lost(&self, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self
            .shared
            .fail_session(&self.dispatcher, self.generation, reason)
        {
            tracing::error!(reason = %reason, "Connection to broker gateway lost");
        }
    }
}
