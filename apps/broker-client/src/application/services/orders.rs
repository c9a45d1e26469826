//! Order Manager
//!
//! Allocates order ids and turns strategy commands into transport requests.
//! Submission is fire-and-forget: the call returns once the request is handed
//! to the transport, and the strategy follows progress through `SharedState`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::connection::ConnectionManager;
use super::state::SharedState;
use crate::application::ports::OutboundRequest;
use crate::domain::order::{
    Order, OrderChanges, OrderError, OrderId, OrderRequest, OrderStatus, Side,
};
use crate::infrastructure::metrics;

// =============================================================================
// Id Sequence
// =============================================================================

/// Session-scoped, strictly increasing order id source.
///
/// Seeded from the gateway's next valid id on every handshake; it only ever
/// moves forward, so ids are never reused within a session, including across
/// reconnects and for cancelled or rejected orders.
#[derive(Debug)]
pub struct OrderIdSequence {
    next: AtomicU64,
}

impl Default for OrderIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderIdSequence {
    /// Sequence starting at 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Take the next id.
    pub fn allocate(&self) -> OrderId {
        OrderId::new(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// Take `count` consecutive ids and return the first.
    pub fn reserve(&self, count: u64) -> OrderId {
        OrderId::new(self.next.fetch_add(count, Ordering::SeqCst))
    }

    /// Make sure the next id is at least `next`. Returns the resulting next id.
    pub fn advance_to(&self, next: u64) -> u64 {
        self.next.fetch_max(next, Ordering::SeqCst).max(next)
    }

    /// The id the next allocation would return.
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Bracket Orders
// =============================================================================

/// Entry limit order with attached take-profit and stop-loss exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketRequest {
    /// Instrument symbol.
    pub instrument: String,
    /// Entry side. Exits use the opposite side.
    pub side: Side,
    /// Quantity for every leg.
    pub quantity: Decimal,
    /// Entry limit price.
    pub entry_price: Decimal,
    /// Take-profit limit price.
    pub take_profit_price: Decimal,
    /// Stop-loss trigger price.
    pub stop_loss_price: Decimal,
    /// Allow execution outside regular trading hours.
    pub outside_regular_hours: bool,
}

impl BracketRequest {
    fn legs(&self) -> Result<[OrderRequest; 3], OrderError> {
        let (profit_above, stop_below) = match self.side {
            Side::Buy => (
                self.take_profit_price > self.entry_price,
                self.stop_loss_price < self.entry_price,
            ),
            Side::Sell => (
                self.take_profit_price < self.entry_price,
                self.stop_loss_price > self.entry_price,
            ),
        };
        if !(profit_above && stop_below) {
            return Err(OrderError::InvalidRequest(format!(
                "{} bracket needs take-profit {} and stop-loss {} on opposite sides of entry {}",
                self.side, self.take_profit_price, self.stop_loss_price, self.entry_price
            )));
        }

        let exit = self.side.opposite();
        let parent =
            OrderRequest::limit(&*self.instrument, self.side, self.quantity, self.entry_price)
                .with_outside_regular_hours(self.outside_regular_hours);
        let take_profit =
            OrderRequest::limit(&*self.instrument, exit, self.quantity, self.take_profit_price)
                .with_outside_regular_hours(self.outside_regular_hours);
        let stop_loss =
            OrderRequest::stop(&*self.instrument, exit, self.quantity, self.stop_loss_price)
                .with_outside_regular_hours(self.outside_regular_hours);

        for leg in [&parent, &take_profit, &stop_loss] {
            leg.validate()?;
        }
        Ok([parent, take_profit, stop_loss])
    }
}

/// Ids assigned to a bracket's legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BracketOrderIds {
    /// Entry order.
    pub parent: OrderId,
    /// Take-profit exit.
    pub take_profit: OrderId,
    /// Stop-loss exit.
    pub stop_loss: OrderId,
}

// =============================================================================
// Order Manager
// =============================================================================

/// Submit, cancel and modify orders.
#[derive(Debug, Clone)]
pub struct OrderManager {
    state: Arc<SharedState>,
    connection: Arc<ConnectionManager>,
    sequence: Arc<OrderIdSequence>,
}

impl OrderManager {
    /// Create an order manager.
    #[must_use]
    pub const fn new(
        state: Arc<SharedState>,
        connection: Arc<ConnectionManager>,
        sequence: Arc<OrderIdSequence>,
    ) -> Self {
        Self {
            state,
            connection,
            sequence,
        }
    }

    /// Validate, allocate an id and send a new order. Does not wait for the
    /// broker's acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::InvalidRequest` before any id is allocated if the
    /// request is invalid. Returns `OrderError::Transport` if the send fails;
    /// the order then stays in state as `Rejected` and its id is spent.
    pub fn submit(&self, request: OrderRequest) -> Result<OrderId, OrderError> {
        request.validate()?;
        let order_id = self.sequence.allocate();
        self.place(order_id, request, true)?;
        Ok(order_id)
    }

    /// Submit an entry order with take-profit and stop-loss children.
    ///
    /// The legs use three consecutive ids. The parent and take-profit are
    /// held by the gateway until the stop-loss arrives, so a partial send
    /// never leaves an unprotected entry working.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::InvalidRequest` if the prices are inconsistent,
    /// or `OrderError::Transport` if any leg fails to send. Legs already
    /// placed are then marked `Rejected` locally.
    pub fn submit_bracket(&self, request: &BracketRequest) -> Result<BracketOrderIds, OrderError> {
        let [parent, mut take_profit, mut stop_loss] = request.legs()?;

        let parent_id = self.sequence.reserve(3);
        let ids = BracketOrderIds {
            parent: parent_id,
            take_profit: OrderId::new(parent_id.get() + 1),
            stop_loss: OrderId::new(parent_id.get() + 2),
        };
        take_profit.parent_id = Some(parent_id);
        stop_loss.parent_id = Some(parent_id);

        let legs = [
            (ids.parent, parent, false),
            (ids.take_profit, take_profit, false),
            (ids.stop_loss, stop_loss, true),
        ];
        let mut placed = Vec::with_capacity(legs.len());
        for (order_id, leg, transmit) in legs {
            if let Err(err) = self.place(order_id, leg, transmit) {
                for earlier in placed {
                    self.reject_locally(earlier, format!("bracket leg {order_id} failed to send"));
                }
                return Err(err);
            }
            placed.push(order_id);
        }

        tracing::info!(
            parent = %ids.parent,
            take_profit = %ids.take_profit,
            stop_loss = %ids.stop_loss,
            "Bracket order placed"
        );
        Ok(ids)
    }

    /// Request cancellation. The status changes only when the broker confirms.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::NotFound` for unknown ids, `OrderError::TerminalState`
    /// if the order is already done, or `OrderError::Transport` if the send fails.
    pub fn cancel(&self, order_id: OrderId) -> Result<(), OrderError> {
        let order = self.require_open(order_id)?;
        self.send(&OutboundRequest::CancelOrder { order_id }, "cancel")?;
        tracing::info!(
            order_id = %order_id,
            status = %order.status(),
            "Cancel requested"
        );
        Ok(())
    }

    /// Change quantity or prices of a working order.
    ///
    /// The changes are checked and the outgoing request built from one
    /// consistent view of the order, then applied locally once the request
    /// has been sent. A fill landing while the request is in flight can make
    /// part of the change stale; whatever still fits is applied and the
    /// difference is logged.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::NotFound`, `OrderError::TerminalState`,
    /// `OrderError::InvalidRequest` if the changes do not fit the order, or
    /// `OrderError::Transport` if the send fails.
    pub fn modify(&self, order_id: OrderId, changes: &OrderChanges) -> Result<(), OrderError> {
        let request = self.state.update_order(order_id, |order| {
            order.check_changes(changes)?;
            let mut updated = order.clone();
            updated.apply_changes(changes, Utc::now());
            Ok(updated.to_request())
        })?;
        self.send(&OutboundRequest::ModifyOrder { order_id, request }, "modify")?;

        let applied = self
            .state
            .update_order(order_id, |order| Ok(apply_sent_changes(order, changes)))?;
        if applied.as_ref() == Some(changes) {
            tracing::info!(
                order_id = %order_id,
                quantity = ?changes.quantity,
                limit_price = ?changes.limit_price,
                stop_price = ?changes.stop_price,
                "Order modified"
            );
        } else {
            tracing::warn!(
                order_id = %order_id,
                requested = ?changes,
                applied = ?applied,
                "Order changed while modify was in flight, local copy differs from request"
            );
        }
        Ok(())
    }

    /// Cancel every open order of the account, including ones placed by
    /// other sessions.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::Transport` if the send fails.
    pub fn cancel_all(&self) -> Result<(), OrderError> {
        self.send(&OutboundRequest::GlobalCancel, "cancel_all")?;
        tracing::info!(open_orders = self.state.open_orders().len(), "Global cancel requested");
        Ok(())
    }

    fn require_open(&self, order_id: OrderId) -> Result<Order, OrderError> {
        let order = self
            .state
            .order(order_id)
            .ok_or(OrderError::NotFound(order_id))?;
        if order.status().is_terminal() {
            return Err(OrderError::TerminalState {
                order_id,
                status: order.status(),
            });
        }
        Ok(order)
    }

    fn place(
        &self,
        order_id: OrderId,
        request: OrderRequest,
        transmit: bool,
    ) -> Result<(), OrderError> {
        let now = Utc::now();
        let mut order = Order::new(order_id, request.clone(), now);
        // Marked before the send so an acknowledgement can never race ahead.
        order.transition(OrderStatus::Submitted, now)?;
        self.state.insert_order(order);

        tracing::info!(
            order_id = %order_id,
            instrument = %request.instrument,
            side = %request.side,
            quantity = %request.quantity,
            order_type = %request.order_type,
            limit_price = ?request.limit_price,
            stop_price = ?request.stop_price,
            parent_id = ?request.parent_id.map(OrderId::get),
            "Placing order"
        );

        let order_type = request.order_type;
        let result = self.send(
            &OutboundRequest::PlaceOrder {
                order_id,
                request,
                transmit,
            },
            "submit",
        );
        match result {
            Ok(()) => {
                metrics::record_order_submitted(order_type.as_str());
                Ok(())
            }
            Err(err) => {
                self.reject_locally(order_id, err.to_string());
                Err(err)
            }
        }
    }

    fn reject_locally(&self, order_id: OrderId, reason: String) {
        let result = self.state.update_order(order_id, |order| {
            order.set_last_error(reason.clone(), Utc::now());
            order.transition(OrderStatus::Rejected, Utc::now())
        });
        match result {
            Ok(()) => {
                tracing::warn!(order_id = %order_id, reason = %reason, "Order rejected locally");
            }
            Err(err) => {
                tracing::warn!(order_id = %order_id, error = %err, "Could not reject order locally");
            }
        }
    }

    fn send(&self, request: &OutboundRequest, operation: &'static str) -> Result<(), OrderError> {
        self.connection.send(request).map_err(|err| {
            metrics::record_order_failure(operation);
            tracing::warn!(operation, error = %err, "Order request not sent");
            OrderError::Transport(err)
        })
    }
}

/// Apply as much of an already-sent change as the order still accepts.
fn apply_sent_changes(order: &mut Order, changes: &OrderChanges) -> Option<OrderChanges> {
    let prices_only = OrderChanges {
        quantity: None,
        ..changes.clone()
    };
    let accepted = [changes.clone(), prices_only]
        .into_iter()
        .find(|candidate| order.check_changes(candidate).is_ok())?;
    order.apply_changes(&accepted, Utc::now());
    Some(accepted)
}
