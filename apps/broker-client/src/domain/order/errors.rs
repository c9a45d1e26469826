//! Order errors.

use rust_decimal::Decimal;

use super::value_objects::{OrderId, OrderStatus};
use crate::domain::connection::ConnectionError;

/// Errors raised by order operations.
///
/// Validation and lifecycle errors are returned synchronously to the caller
/// that caused them. Broker-side rejections never appear here; they surface
/// as `OrderStatus::Rejected` in shared state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    /// No order with this id exists in the session.
    #[error("order {0} not found")]
    NotFound(OrderId),

    /// The order already reached a terminal status.
    #[error("order {order_id} is in terminal state {status}")]
    TerminalState {
        /// Order id.
        order_id: OrderId,
        /// Terminal status.
        status: OrderStatus,
    },

    /// The request failed local validation.
    #[error("invalid order request: {0}")]
    InvalidRequest(String),

    /// A status change outside the order state machine.
    #[error("order {order_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        /// Order id.
        order_id: OrderId,
        /// Current status.
        from: OrderStatus,
        /// Attempted status.
        to: OrderStatus,
    },

    /// A fill would push the filled quantity past the order quantity.
    #[error("fill of {fill} on order {order_id} exceeds remaining {remaining}")]
    Overfill {
        /// Order id.
        order_id: OrderId,
        /// Fill quantity.
        fill: Decimal,
        /// Quantity still open.
        remaining: Decimal,
    },

    /// A fill does not match the order it references.
    #[error("fill does not match order {order_id}: {reason}")]
    FillMismatch {
        /// Order id.
        order_id: OrderId,
        /// What did not match.
        reason: String,
    },

    /// Applying a fill would overflow the decimal range.
    #[error("fill on order {order_id} overflows its {field}")]
    FillOverflow {
        /// Order id.
        order_id: OrderId,
        /// What overflowed.
        field: &'static str,
    },

    /// The request could not be handed to the transport.
    #[error("transport error: {0}")]
    Transport(#[from] ConnectionError),
}
