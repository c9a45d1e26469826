//! Broker Transport Port (Driven Port)
//!
//! The opaque transport to a broker gateway. The wire protocol lives behind
//! this trait; the runtime only sees typed inbound messages and fire-and-forget
//! outbound requests, correlated solely through later inbound messages.
//!
//! The read loop pulls one [`InboundMessage`] at a time on its own thread and
//! hands it to the dispatcher, which is the same as the transport invoking one
//! callback per message on its network thread.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::connection::{ConnectionConfig, ConnectionError};
use crate::domain::market_data::MarketDataTick;
use crate::domain::order::{OrderId, OrderRequest, Side};
use crate::domain::position::Fill;

// =============================================================================
// Handshake
// =============================================================================

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// First order id the gateway will accept from this client.
    pub next_order_id: u64,
    /// Gateway protocol version.
    pub server_version: i32,
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// Order status as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusUpdate {
    /// Order id.
    pub order_id: OrderId,
    /// Raw broker status string, e.g. `PreSubmitted` or `Cancelled`.
    pub status: String,
    /// Broker's filled quantity.
    pub filled: Decimal,
    /// Broker's remaining quantity.
    pub remaining: Decimal,
    /// Broker's average fill price.
    pub avg_fill_price: Decimal,
}

/// A single execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Broker execution id.
    pub exec_id: String,
    /// Order id.
    pub order_id: OrderId,
    /// Instrument symbol.
    pub instrument: String,
    /// Side.
    pub side: Side,
    /// Executed quantity.
    pub quantity: Decimal,
    /// Execution price.
    pub price: Decimal,
    /// Execution time.
    pub time: DateTime<Utc>,
}

impl ExecutionReport {
    /// The fill this execution represents.
    #[must_use]
    pub fn to_fill(&self) -> Fill {
        Fill {
            order_id: self.order_id,
            exec_id: self.exec_id.clone(),
            instrument: self.instrument.clone(),
            side: self.side,
            quantity: self.quantity,
            price: self.price,
            time: self.time,
        }
    }
}

/// Account position as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionReport {
    /// Account id.
    pub account: String,
    /// Instrument symbol.
    pub instrument: String,
    /// Signed quantity.
    pub quantity: Decimal,
    /// Average cost per unit.
    pub avg_cost: Decimal,
}

/// Error or warning pushed by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerError {
    /// Order the error refers to, if any.
    pub order_id: Option<OrderId>,
    /// Broker error code.
    pub code: i32,
    /// Message text.
    pub message: String,
}

impl BrokerError {
    /// Order rejected by the broker.
    pub const ORDER_REJECTED: i32 = 201;
    /// Order cancelled by the broker.
    pub const ORDER_CANCELLED: i32 = 202;

    /// Returns true for codes the broker uses for status notices
    /// (market data farm connected, etc.) rather than failures.
    #[must_use]
    pub const fn is_informational(&self) -> bool {
        self.code >= 2100 && self.code < 2200
    }
}

/// Everything the transport can deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Order status callback.
    OrderStatus(OrderStatusUpdate),
    /// Execution callback.
    Execution(ExecutionReport),
    /// Position callback.
    Position(PositionReport),
    /// Market data tick callback.
    Tick(MarketDataTick),
    /// Error callback.
    Error(BrokerError),
    /// The gateway advertised a new next valid order id.
    NextValidId(u64),
    /// The gateway closed the session.
    ConnectionClosed {
        /// Why, as far as the transport knows.
        reason: String,
    },
}

impl InboundMessage {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::OrderStatus(_) => "order_status",
            Self::Execution(_) => "execution",
            Self::Position(_) => "position",
            Self::Tick(_) => "tick",
            Self::Error(_) => "error",
            Self::NextValidId(_) => "next_valid_id",
            Self::ConnectionClosed { .. } => "connection_closed",
        }
    }
}

// =============================================================================
// Outbound Requests
// =============================================================================

/// Everything the runtime can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundRequest {
    /// Place a new order.
    PlaceOrder {
        /// Locally allocated id.
        order_id: OrderId,
        /// Order details.
        request: OrderRequest,
        /// Whether the gateway should transmit immediately. Bracket parents
        /// and the first child hold until the last child arrives.
        transmit: bool,
    },
    /// Replace a working order's details.
    ModifyOrder {
        /// Order id.
        order_id: OrderId,
        /// Full updated order.
        request: OrderRequest,
    },
    /// Cancel one order.
    CancelOrder {
        /// Order id.
        order_id: OrderId,
    },
    /// Cancel every open order of the account.
    GlobalCancel,
    /// Start streaming ticks for an instrument.
    RequestMarketData {
        /// Instrument symbol.
        instrument: String,
    },
    /// Stop streaming ticks for an instrument.
    CancelMarketData {
        /// Instrument symbol.
        instrument: String,
    },
    /// Ask for the account's positions.
    RequestPositions,
}

impl OutboundRequest {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PlaceOrder { .. } => "place_order",
            Self::ModifyOrder { .. } => "modify_order",
            Self::CancelOrder { .. } => "cancel_order",
            Self::GlobalCancel => "global_cancel",
            Self::RequestMarketData { .. } => "request_market_data",
            Self::CancelMarketData { .. } => "cancel_market_data",
            Self::RequestPositions => "request_positions",
        }
    }
}

// =============================================================================
// Transport Trait
// =============================================================================

/// Transport-level failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The handshake did not complete in time.
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    /// The gateway refused the session.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The session is closed.
    #[error("connection closed")]
    Closed,

    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(timeout) => Self::HandshakeTimeout(timeout),
            TransportError::Rejected(reason) => Self::Handshake(reason),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Port for a broker gateway session.
///
/// `read` and `send` are called from different threads, so implementations
/// must allow one reader and one sender concurrently. Concurrent sends never
/// happen; the connection manager serializes them.
#[cfg_attr(test, mockall::automock)]
pub trait BrokerTransport: Send + Sync {
    /// Open the session and perform the handshake.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the gateway is unreachable, refuses the
    /// client, or does not answer within `timeout`.
    fn connect(
        &self,
        config: &ConnectionConfig,
        timeout: Duration,
    ) -> Result<Handshake, TransportError>;

    /// Close the session. Unblocks a pending `read`.
    fn disconnect(&self);

    /// Send one request.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the session is closed or the write fails.
    fn send(&self, request: &OutboundRequest) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next inbound message. `Ok(None)` means
    /// nothing arrived.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` once the session is closed or broken.
    fn read(&self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError>;
}
