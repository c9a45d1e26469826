//! Broker Client
//!
//! The object a strategy works with: read accessors over the shared state,
//! the order manager and the connection, all wired to one transport.

use std::sync::Arc;

use super::connection::{ConnectionManager, ConnectionSettings};
use super::dispatcher::{DispatchCounters, EventDispatcher};
use super::orders::{OrderIdSequence, OrderManager};
use super::state::SharedState;
use crate::application::ports::{BrokerTransport, OutboundRequest};
use crate::domain::connection::ConnectionError;

/// Handle to one broker session. Cheap to clone; clones share everything.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    state: Arc<SharedState>,
    dispatcher: Arc<EventDispatcher>,
    connection: Arc<ConnectionManager>,
    orders: OrderManager,
}

impl BrokerClient {
    /// Wire a client around `transport`. Nothing connects until
    /// `connection().connect` or a runner does.
    #[must_use]
    pub fn new(transport: Arc<dyn BrokerTransport>, settings: ConnectionSettings) -> Self {
        let state = Arc::new(SharedState::new());
        let sequence = Arc::new(OrderIdSequence::new());
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&state),
            Arc::clone(&sequence),
        ));
        let connection = Arc::new(ConnectionManager::new(
            transport,
            Arc::clone(&dispatcher),
            Arc::clone(&sequence),
            settings,
        ));
        let orders = OrderManager::new(Arc::clone(&state), Arc::clone(&connection), sequence);

        Self {
            state,
            dispatcher,
            connection,
            orders,
        }
    }

    /// Orders, positions and market data as seen so far.
    #[must_use]
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Submit, cancel and modify orders.
    #[must_use]
    pub const fn orders(&self) -> &OrderManager {
        &self.orders
    }

    /// The broker session.
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Inbound message counters.
    #[must_use]
    pub fn dispatch_counters(&self) -> DispatchCounters {
        self.dispatcher.counters()
    }

    /// Start streaming ticks for `instrument`.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` or the transport's error.
    pub fn subscribe_market_data(&self, instrument: &str) -> Result<(), ConnectionError> {
        self.connection.send(&OutboundRequest::RequestMarketData {
            instrument: instrument.to_string(),
        })?;
        tracing::info!(instrument, "Subscribed to market data");
        Ok(())
    }

    /// Stop streaming ticks for `instrument`. The last snapshot is kept.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` or the transport's error.
    pub fn unsubscribe_market_data(&self, instrument: &str) -> Result<(), ConnectionError> {
        self.connection.send(&OutboundRequest::CancelMarketData {
            instrument: instrument.to_string(),
        })?;
        tracing::info!(instrument, "Unsubscribed from market data");
        Ok(())
    }

    /// Ask the broker for its view of account positions. Reports arrive
    /// asynchronously in [`SharedState::broker_positions`].
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` or the transport's error.
    pub fn request_positions(&self) -> Result<(), ConnectionError> {
        self.connection.send(&OutboundRequest::RequestPositions)
    }
}
