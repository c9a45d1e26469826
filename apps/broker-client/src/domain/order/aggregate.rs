//! Order aggregate.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::errors::OrderError;
use super::request::{OrderChanges, OrderRequest};
use super::value_objects::{OrderId, OrderStatus, OrderType, Side};
use crate::domain::position::Fill;

/// An order tracked for the life of the session.
///
/// Mutation is crate-private: the strategy only ever sees clones handed out by
/// `SharedState`. Status changes go through [`OrderStatus::can_transition_to`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    order_id: OrderId,
    instrument: String,
    side: Side,
    quantity: Decimal,
    order_type: OrderType,
    limit_price: Option<Decimal>,
    stop_price: Option<Decimal>,
    outside_regular_hours: bool,
    parent_id: Option<OrderId>,
    status: OrderStatus,
    filled_quantity: Decimal,
    avg_fill_price: Decimal,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    executions: HashSet<String>,
}

impl Order {
    /// Create an order in `Created` state from a validated request.
    pub(crate) fn new(order_id: OrderId, request: OrderRequest, now: DateTime<Utc>) -> Self {
        Self {
            order_id,
            instrument: request.instrument,
            side: request.side,
            quantity: request.quantity,
            order_type: request.order_type,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            outside_regular_hours: request.outside_regular_hours,
            parent_id: request.parent_id,
            status: OrderStatus::Created,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            last_error: None,
            created_at: now,
            updated_at: now,
            executions: HashSet::new(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Order id.
    #[must_use]
    pub const fn order_id(&self) -> OrderId {
        self.order_id
    }

    /// Instrument symbol.
    #[must_use]
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Side.
    #[must_use]
    pub const fn side(&self) -> Side {
        self.side
    }

    /// Requested quantity.
    #[must_use]
    pub const fn quantity(&self) -> Decimal {
        self.quantity
    }

    /// Order type.
    #[must_use]
    pub const fn order_type(&self) -> OrderType {
        self.order_type
    }

    /// Limit price.
    #[must_use]
    pub const fn limit_price(&self) -> Option<Decimal> {
        self.limit_price
    }

    /// Stop price.
    #[must_use]
    pub const fn stop_price(&self) -> Option<Decimal> {
        self.stop_price
    }

    /// Parent order id for bracket children.
    #[must_use]
    pub const fn parent_id(&self) -> Option<OrderId> {
        self.parent_id
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> OrderStatus {
        self.status
    }

    /// Quantity filled so far.
    #[must_use]
    pub const fn filled_quantity(&self) -> Decimal {
        self.filled_quantity
    }

    /// Quantity still open.
    #[must_use]
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    /// Volume-weighted average fill price, zero before the first fill.
    #[must_use]
    pub const fn avg_fill_price(&self) -> Decimal {
        self.avg_fill_price
    }

    /// Most recent broker error message naming this order.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last change.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// The request that would place this order as it stands now.
    #[must_use]
    pub fn to_request(&self) -> OrderRequest {
        OrderRequest {
            instrument: self.instrument.clone(),
            side: self.side,
            quantity: self.quantity,
            order_type: self.order_type,
            limit_price: self.limit_price,
            stop_price: self.stop_price,
            outside_regular_hours: self.outside_regular_hours,
            parent_id: self.parent_id,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Move to `next`, rejecting anything outside the state machine.
    pub(crate) fn transition(
        &mut self,
        next: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        if self.status.is_terminal() {
            return Err(OrderError::TerminalState {
                order_id: self.order_id,
                status: self.status,
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition {
                order_id: self.order_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Returns true if this execution was already applied.
    pub(crate) fn has_execution(&self, exec_id: &str) -> bool {
        self.executions.contains(exec_id)
    }

    /// Check that `fill` can be applied without breaking the order's invariants.
    pub(crate) fn check_fill(&self, fill: &Fill) -> Result<(), OrderError> {
        match self.status {
            status if status.is_terminal() => {
                return Err(OrderError::TerminalState {
                    order_id: self.order_id,
                    status,
                });
            }
            OrderStatus::Created => {
                return Err(OrderError::InvalidTransition {
                    order_id: self.order_id,
                    from: OrderStatus::Created,
                    to: OrderStatus::PartiallyFilled,
                });
            }
            _ => {}
        }

        if fill.instrument != self.instrument {
            return Err(OrderError::FillMismatch {
                order_id: self.order_id,
                reason: format!(
                    "instrument {} does not match {}",
                    fill.instrument, self.instrument
                ),
            });
        }
        if fill.side != self.side {
            return Err(OrderError::FillMismatch {
                order_id: self.order_id,
                reason: format!("side {} does not match {}", fill.side, self.side),
            });
        }

        let remaining = self.remaining_quantity();
        if fill.quantity > remaining {
            return Err(OrderError::Overfill {
                order_id: self.order_id,
                fill: fill.quantity,
                remaining,
            });
        }
        Ok(())
    }

    /// Apply `fill` after [`Order::check_fill`] accepts it.
    ///
    /// Status moves through [`Order::transition`]: a fill on a `Submitted`
    /// order implies the broker accepted it, so the order passes through
    /// `Acknowledged` on its way to `PartiallyFilled` or `Filled`. On error
    /// the order is unchanged.
    pub(crate) fn record_fill(&mut self, fill: &Fill) -> Result<(), OrderError> {
        self.check_fill(fill)?;

        let order_id = self.order_id;
        let overflow = |field| OrderError::FillOverflow { order_id, field };
        let filled = self
            .filled_quantity
            .checked_add(fill.quantity)
            .ok_or_else(|| overflow("filled quantity"))?;
        let avg_fill_price = if filled > Decimal::ZERO {
            self.avg_fill_price
                .checked_mul(self.filled_quantity)
                .zip(fill.price.checked_mul(fill.quantity))
                .and_then(|(held, added)| held.checked_add(added))
                .and_then(|notional| notional.checked_div(filled))
                .ok_or_else(|| overflow("average fill price"))?
        } else {
            self.avg_fill_price
        };

        let target = if filled == self.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let saved = (self.status, self.updated_at);
        let moved = if self.status == OrderStatus::Submitted {
            self.transition(OrderStatus::Acknowledged, fill.time)
                .and_then(|()| self.transition(target, fill.time))
        } else {
            self.transition(target, fill.time)
        };
        if let Err(err) = moved {
            (self.status, self.updated_at) = saved;
            return Err(err);
        }

        self.filled_quantity = filled;
        self.avg_fill_price = avg_fill_price;
        self.executions.insert(fill.exec_id.clone());
        Ok(())
    }

    /// Check that `changes` can be applied to this order.
    pub(crate) fn check_changes(&self, changes: &OrderChanges) -> Result<(), OrderError> {
        if self.status.is_terminal() {
            return Err(OrderError::TerminalState {
                order_id: self.order_id,
                status: self.status,
            });
        }
        if changes.is_empty() {
            return Err(OrderError::InvalidRequest(
                "modification contains no changes".to_string(),
            ));
        }
        if let Some(quantity) = changes.quantity
            && quantity <= self.filled_quantity
        {
            return Err(OrderError::InvalidRequest(format!(
                "quantity {quantity} must exceed filled quantity {}",
                self.filled_quantity
            )));
        }
        if changes.limit_price.is_some() && !self.order_type.requires_limit_price() {
            return Err(OrderError::InvalidRequest(format!(
                "{} order does not take a limit price",
                self.order_type
            )));
        }
        if changes.stop_price.is_some() && !self.order_type.requires_stop_price() {
            return Err(OrderError::InvalidRequest(format!(
                "{} order does not take a stop price",
                self.order_type
            )));
        }
        if [changes.limit_price, changes.stop_price]
            .into_iter()
            .flatten()
            .any(|price| price <= Decimal::ZERO)
        {
            return Err(OrderError::InvalidRequest(
                "prices must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply changes that already passed [`Order::check_changes`].
    pub(crate) fn apply_changes(&mut self, changes: &OrderChanges, now: DateTime<Utc>) {
        if let Some(quantity) = changes.quantity {
            self.quantity = quantity;
        }
        if let Some(price) = changes.limit_price {
            self.limit_price = Some(price);
        }
        if let Some(price) = changes.stop_price {
            self.stop_price = Some(price);
        }
        self.updated_at = now;
    }

    pub(crate) fn set_last_error(&mut self, message: String, now: DateTime<Utc>) {
        self.last_error = Some(message);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use super::*;

    fn submitted(quantity: Decimal) -> Order {
        let request = OrderRequest::market("AAPL", Side::Buy, quantity);
        let mut order = Order::new(OrderId::new(1), request, Utc::now());
        order.transition(OrderStatus::Submitted, Utc::now()).unwrap();
        order
    }

    fn fill(exec_id: &str, quantity: Decimal, price: Decimal) -> Fill {
        Fill {
            order_id: OrderId::new(1),
            exec_id: exec_id.to_string(),
            instrument: "AAPL".to_string(),
            side: Side::Buy,
            quantity,
            price,
            time: Utc::now(),
        }
    }

    #[test]
    fn new_order_starts_created() {
        let request = OrderRequest::limit("AAPL", Side::Sell, dec!(5), dec!(190));
        let order = Order::new(OrderId::new(7), request.clone(), Utc::now());
        assert_eq!(order.status(), OrderStatus::Created);
        assert_eq!(order.filled_quantity(), Decimal::ZERO);
        assert_eq!(order.to_request(), request);
    }

    #[test]
    fn partial_then_complete_fill() {
        let mut order = submitted(dec!(100));

        order.record_fill(&fill("e1", dec!(40), dec!(100))).unwrap();
        assert_eq!(order.status(), OrderStatus::PartiallyFilled);

        order.record_fill(&fill("e2", dec!(60), dec!(101))).unwrap();
        assert_eq!(order.status(), OrderStatus::Filled);
        assert_eq!(order.filled_quantity(), dec!(100));
        assert_eq!(order.avg_fill_price(), dec!(100.6));
        assert!(order.has_execution("e1"));
    }

    #[test]
    fn complete_fill_before_ack_passes_through_acknowledged() {
        let mut order = submitted(dec!(100));
        let at = Utc::now();
        let mut complete = fill("e1", dec!(100), dec!(50));
        complete.time = at;

        order.record_fill(&complete).unwrap();
        assert_eq!(order.status(), OrderStatus::Filled);
        assert_eq!(order.updated_at(), at);
        assert!(order.transition(OrderStatus::Cancelled, Utc::now()).is_err());

        let mut partial = submitted(dec!(100));
        partial.record_fill(&fill("e1", dec!(30), dec!(50))).unwrap();
        assert_eq!(partial.status(), OrderStatus::PartiallyFilled);
    }

    #[test]
    fn overflowing_fill_leaves_order_untouched() {
        let mut order = submitted(dec!(100));
        order.record_fill(&fill("e1", dec!(50), dec!(100))).unwrap();
        let before = order.clone();

        let err = order
            .record_fill(&fill("e2", dec!(50), Decimal::MAX))
            .unwrap_err();
        assert_eq!(
            err,
            OrderError::FillOverflow {
                order_id: OrderId::new(1),
                field: "average fill price",
            }
        );
        assert_eq!(order, before);
        assert!(!order.has_execution("e2"));
    }

    #[test]
    fn overfill_is_rejected() {
        let mut order = submitted(dec!(10));
        order.record_fill(&fill("e1", dec!(8), dec!(1))).unwrap();

        let err = order.check_fill(&fill("e2", dec!(3), dec!(1))).unwrap_err();
        assert_eq!(
            err,
            OrderError::Overfill {
                order_id: OrderId::new(1),
                fill: dec!(3),
                remaining: dec!(2),
            }
        );
    }

    #[test]
    fn fill_on_terminal_order_is_rejected() {
        let mut order = submitted(dec!(10));
        order.transition(OrderStatus::Cancelled, Utc::now()).unwrap();
        let err = order.check_fill(&fill("e1", dec!(1), dec!(1))).unwrap_err();
        assert!(matches!(err, OrderError::TerminalState { .. }));
    }

    #[test]
    fn fill_for_other_instrument_is_rejected() {
        let order = submitted(dec!(10));
        let mut wrong = fill("e1", dec!(1), dec!(1));
        wrong.instrument = "MSFT".to_string();
        assert!(matches!(
            order.check_fill(&wrong),
            Err(OrderError::FillMismatch { .. })
        ));
    }

    #[test]
    fn terminal_status_is_immutable() {
        let mut order = submitted(dec!(10));
        order.transition(OrderStatus::Rejected, Utc::now()).unwrap();
        let err = order
            .transition(OrderStatus::Acknowledged, Utc::now())
            .unwrap_err();
        assert!(matches!(err, OrderError::TerminalState { .. }));
        assert_eq!(order.status(), OrderStatus::Rejected);
    }

    #[test]
    fn changes_respect_filled_quantity() {
        let mut order = submitted(dec!(10));
        order.record_fill(&fill("e1", dec!(4), dec!(1))).unwrap();

        assert!(
            order
                .check_changes(&OrderChanges::default().quantity(dec!(4)))
                .is_err()
        );
        let changes = OrderChanges::default().quantity(dec!(6));
        order.check_changes(&changes).unwrap();
        order.apply_changes(&changes, Utc::now());
        assert_eq!(order.quantity(), dec!(6));
        assert_eq!(order.remaining_quantity(), dec!(2));
    }

    #[test]
    fn limit_change_on_market_order_is_rejected() {
        let order = submitted(dec!(10));
        let err = order
            .check_changes(&OrderChanges::default().limit_price(dec!(5)))
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidRequest(_)));
    }

    proptest! {
        #[test]
        fn filled_never_exceeds_quantity(
            quantity in 1_u32..500,
            sizes in prop::collection::vec(1_u32..200, 1..32),
        ) {
            let mut order = submitted(Decimal::from(quantity));
            for (i, size) in sizes.into_iter().enumerate() {
                let next = fill(&format!("e{i}"), Decimal::from(size), dec!(10));
                let before = order.clone();
                if order.record_fill(&next).is_err() {
                    prop_assert_eq!(&order, &before);
                }
                prop_assert!(order.filled_quantity() <= order.quantity());
                prop_assert_eq!(
                    order.status() == OrderStatus::Filled,
                    order.filled_quantity() == order.quantity()
                );
            }
        }
    }
}
