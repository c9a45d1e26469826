//! Event Dispatcher
//!
//! The single entry point for inbound broker messages. It runs only on the
//! read thread and handles messages strictly in arrival order, so every
//! broker-driven mutation of [`SharedState`] is serialized through here.
//!
//! Each handler validates the message, applies it under the relevant entity
//! lock, and returns. A message that fails validation or would break an
//! invariant becomes a [`TransportFault`]: it is logged, counted and dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;

use super::orders::OrderIdSequence;
use super::state::{FillOutcome, SharedState};
use super::worker::panic_message;
use crate::application::ports::{
    BrokerError, ExecutionReport, InboundMessage, OrderStatusUpdate, PositionReport,
};
use crate::domain::connection::ConnectionStatus;
use crate::domain::market_data::MarketDataTick;
use crate::domain::order::{OrderError, OrderId, OrderStatus};
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// An inbound message that could not be applied. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFault {
    /// The message is structurally invalid.
    #[error("malformed {kind} message: {reason}")]
    Malformed {
        /// Message kind.
        kind: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// The broker reported a status string this runtime does not know.
    #[error("unrecognized status {status:?} for order {order_id}")]
    UnrecognizedStatus {
        /// Order id.
        order_id: OrderId,
        /// Raw status.
        status: String,
    },

    /// The message references an order this session never created.
    #[error("{kind} for unknown order {order_id}")]
    UnknownOrder {
        /// Message kind.
        kind: &'static str,
        /// Order id.
        order_id: OrderId,
    },

    /// Applying the message would violate the order lifecycle.
    #[error("{kind} rejected for order {order_id}: {source}")]
    Rejected {
        /// Message kind.
        kind: &'static str,
        /// Order id.
        order_id: OrderId,
        /// Lifecycle error.
        source: OrderError,
    },

    /// A handler panicked while applying the message.
    #[error("{kind} handler panicked: {message}")]
    Panicked {
        /// Message kind.
        kind: &'static str,
        /// Panic payload text.
        message: String,
    },
}

impl TransportFault {
    /// Label for the dropped-messages metric.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed",
            Self::UnrecognizedStatus { .. } => "unrecognized_status",
            Self::UnknownOrder { .. } => "unknown_order",
            Self::Rejected { .. } => "rejected",
            Self::Panicked { .. } => "panicked",
        }
    }

    fn from_order_error(kind: &'static str, order_id: OrderId, err: OrderError) -> Self {
        match err {
            OrderError::NotFound(_) => Self::UnknownOrder { kind, order_id },
            err @ OrderError::FillOverflow { .. } => Self::Malformed {
                kind,
                reason: err.to_string(),
            },
            source => Self::Rejected {
                kind,
                order_id,
                source,
            },
        }
    }
}

// =============================================================================
// Broker Status Mapping
// =============================================================================

/// Order status strings sent by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrokerStatus {
    ApiPending,
    PendingSubmit,
    PendingCancel,
    PreSubmitted,
    Submitted,
    ApiCancelled,
    Cancelled,
    Filled,
    Inactive,
}

impl BrokerStatus {
    fn parse(raw: &str) -> Option<Self> {
        let status = match raw.trim() {
            "ApiPending" => Self::ApiPending,
            "PendingSubmit" => Self::PendingSubmit,
            "PendingCancel" => Self::PendingCancel,
            "PreSubmitted" => Self::PreSubmitted,
            "Submitted" => Self::Submitted,
            "ApiCancelled" => Self::ApiCancelled,
            "Cancelled" => Self::Cancelled,
            "Filled" => Self::Filled,
            "Inactive" => Self::Inactive,
            _ => return None,
        };
        Some(status)
    }

    /// Local status this broker status drives, if any. Fill progress comes
    /// only from executions, so `Filled` is informational here.
    const fn target(self) -> Option<OrderStatus> {
        match self {
            Self::PreSubmitted | Self::Submitted => Some(OrderStatus::Acknowledged),
            Self::ApiCancelled | Self::Cancelled => Some(OrderStatus::Cancelled),
            Self::Inactive => Some(OrderStatus::Rejected),
            Self::ApiPending | Self::PendingSubmit | Self::PendingCancel | Self::Filled => None,
        }
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Dispatch counters for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchCounters {
    /// Messages handed to the dispatcher.
    pub received: u64,
    /// Messages applied.
    pub applied: u64,
    /// Messages dropped as faults.
    pub dropped: u64,
    /// Arrival time of the last message.
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct DispatchStats {
    received: AtomicU64,
    applied: AtomicU64,
    dropped: AtomicU64,
    last_message_at: RwLock<Option<DateTime<Utc>>>,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Translates inbound broker messages into shared state mutations.
#[derive(Debug)]
pub struct EventDispatcher {
    state: Arc<SharedState>,
    sequence: Arc<OrderIdSequence>,
    stats: DispatchStats,
}

impl EventDispatcher {
    /// Create a dispatcher writing into `state`.
    #[must_use]
    pub fn new(state: Arc<SharedState>, sequence: Arc<OrderIdSequence>) -> Self {
        Self {
            state,
            sequence,
            stats: DispatchStats::default(),
        }
    }

    /// Counters since creation.
    #[must_use]
    pub fn counters(&self) -> DispatchCounters {
        DispatchCounters {
            received: self.stats.received.load(Ordering::Relaxed),
            applied: self.stats.applied.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            last_message_at: *self.stats.last_message_at.read(),
        }
    }

    /// Handle one inbound message. Faults, including handler panics, are
    /// logged and dropped.
    pub fn dispatch(&self, message: InboundMessage) {
        let kind = message.kind();
        let started = Instant::now();
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        *self.stats.last_message_at.write() = Some(Utc::now());
        metrics::record_message_received(kind);

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.route(message)))
            .unwrap_or_else(|payload| {
                Err(TransportFault::Panicked {
                    kind,
                    message: panic_message(&*payload),
                })
            });

        match result {
            Ok(()) => {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(fault) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_message_dropped(fault.reason());
                tracing::warn!(kind, error = %fault, "Dropped inbound message");
            }
        }
        metrics::record_dispatch_duration(started.elapsed());
    }

    fn route(&self, message: InboundMessage) -> Result<(), TransportFault> {
        match message {
            InboundMessage::OrderStatus(update) => self.on_order_status(&update),
            InboundMessage::Execution(report) => self.on_execution(&report),
            InboundMessage::Position(report) => self.on_position(report),
            InboundMessage::Tick(tick) => self.on_tick(&tick),
            InboundMessage::Error(error) => {
                self.on_error(error);
                Ok(())
            }
            InboundMessage::NextValidId(next) => {
                self.on_next_valid_id(next);
                Ok(())
            }
            InboundMessage::ConnectionClosed { reason } => {
                tracing::debug!(reason = %reason, "Connection closed notice reached dispatcher");
                Ok(())
            }
        }
    }

    /// Order status callback.
    ///
    /// # Errors
    ///
    /// Returns a fault for unknown status strings, unknown orders, negative
    /// quantities, or transitions outside the order state machine.
    pub fn on_order_status(&self, update: &OrderStatusUpdate) -> Result<(), TransportFault> {
        let order_id = update.order_id;
        let status =
            BrokerStatus::parse(&update.status).ok_or_else(|| TransportFault::UnrecognizedStatus {
                order_id,
                status: update.status.clone(),
            })?;

        if update.filled < Decimal::ZERO || update.remaining < Decimal::ZERO {
            return Err(TransportFault::Malformed {
                kind: "order_status",
                reason: format!(
                    "negative quantities (filled {}, remaining {})",
                    update.filled, update.remaining
                ),
            });
        }

        let Some(target) = status.target() else {
            if self.state.order(order_id).is_none() {
                return Err(TransportFault::UnknownOrder {
                    kind: "order_status",
                    order_id,
                });
            }
            tracing::debug!(
                order_id = %order_id,
                broker_status = %update.status,
                filled = %update.filled,
                remaining = %update.remaining,
                "Broker order status"
            );
            return Ok(());
        };

        let changed = self
            .state
            .update_order(order_id, |order| {
                let current = order.status();
                let stale_ack = target == OrderStatus::Acknowledged
                    && matches!(
                        current,
                        OrderStatus::Acknowledged
                            | OrderStatus::PartiallyFilled
                            | OrderStatus::Filled
                    );
                if current == target || stale_ack {
                    return Ok(false);
                }
                order.transition(target, Utc::now()).map(|()| true)
            })
            .map_err(|err| TransportFault::from_order_error("order_status", order_id, err))?;

        if changed {
            tracing::info!(
                order_id = %order_id,
                status = %target,
                broker_status = %update.status,
                "Order status changed"
            );
        }
        Ok(())
    }

    /// Execution callback. Applies the fill to its order and position.
    ///
    /// # Errors
    ///
    /// Returns a fault for malformed executions (including ones whose
    /// quantity or price overflows the order or position), unknown orders,
    /// overfills, or fills on terminal orders.
    pub fn on_execution(&self, report: &ExecutionReport) -> Result<(), TransportFault> {
        let malformed = |reason: String| TransportFault::Malformed {
            kind: "execution",
            reason,
        };
        if report.exec_id.trim().is_empty() {
            return Err(malformed("missing execution id".to_string()));
        }
        if report.quantity <= Decimal::ZERO || report.price <= Decimal::ZERO {
            return Err(malformed(format!(
                "invalid execution {}@{}",
                report.quantity, report.price
            )));
        }

        let outcome = self
            .state
            .apply_fill(&report.to_fill())
            .map_err(|err| TransportFault::from_order_error("execution", report.order_id, err))?;

        match outcome {
            FillOutcome::Applied { order, position } => {
                tracing::info!(
                    order_id = %report.order_id,
                    exec_id = %report.exec_id,
                    instrument = %report.instrument,
                    side = %report.side,
                    quantity = %report.quantity,
                    price = %report.price,
                    status = %order.status(),
                    filled = %order.filled_quantity(),
                    net_quantity = %position.net_quantity(),
                    avg_cost = %position.avg_cost(),
                    "Fill applied"
                );
            }
            FillOutcome::Duplicate => {
                tracing::debug!(
                    order_id = %report.order_id,
                    exec_id = %report.exec_id,
                    "Ignoring duplicate execution"
                );
            }
        }
        Ok(())
    }

    /// Position callback. Stored as the broker's view, never merged into
    /// derived positions.
    ///
    /// # Errors
    ///
    /// Returns a fault if the report has no instrument.
    pub fn on_position(&self, report: PositionReport) -> Result<(), TransportFault> {
        if report.instrument.trim().is_empty() {
            return Err(TransportFault::Malformed {
                kind: "position",
                reason: "missing instrument".to_string(),
            });
        }
        tracing::debug!(
            account = %report.account,
            instrument = %report.instrument,
            quantity = %report.quantity,
            avg_cost = %report.avg_cost,
            "Broker position"
        );
        self.state.record_broker_position(report);
        Ok(())
    }

    /// Market data tick callback.
    ///
    /// # Errors
    ///
    /// Returns a fault for ticks with missing instruments or invalid prices.
    pub fn on_tick(&self, tick: &MarketDataTick) -> Result<(), TransportFault> {
        tick.validate()
            .map_err(|reason| TransportFault::Malformed { kind: "tick", reason })?;
        self.state.apply_tick(tick);
        Ok(())
    }

    /// Error callback. Rejections and cancellations naming an order become
    /// status transitions; anything else is recorded on the order.
    pub fn on_error(&self, error: BrokerError) {
        self.state.record_error(error.clone());

        if error.is_informational() {
            tracing::info!(code = error.code, message = %error.message, "Broker notice");
            return;
        }

        let Some(order_id) = error.order_id else {
            tracing::warn!(code = error.code, message = %error.message, "Broker error");
            return;
        };

        tracing::warn!(
            order_id = %order_id,
            code = error.code,
            message = %error.message,
            "Broker error for order"
        );

        let now = Utc::now();
        let result = self.state.update_order(order_id, |order| {
            order.set_last_error(format!("{}: {}", error.code, error.message), now);
            match error.code {
                BrokerError::ORDER_REJECTED => order.transition(OrderStatus::Rejected, now),
                BrokerError::ORDER_CANCELLED => order.transition(OrderStatus::Cancelled, now),
                _ => Ok(()),
            }
        });
        if let Err(err) = result {
            let fault = TransportFault::from_order_error("error", order_id, err);
            tracing::warn!(error = %fault, "Broker error not applied to order");
        }
    }

    /// Next valid id callback.
    pub fn on_next_valid_id(&self, next: u64) {
        let next_id = self.sequence.advance_to(next);
        tracing::debug!(advertised = next, next_id, "Next valid order id");
    }

    /// Connection status change, published by the connection manager.
    pub fn on_connection_status(&self, status: ConnectionStatus) {
        let previous = self.state.connection_status();
        self.state.set_connection_status(status);
        metrics::set_connection_status(status);
        if previous != status {
            tracing::info!(from = %previous, to = %status, "Connection status changed");
        }
    }
}
