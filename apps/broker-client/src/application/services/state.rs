//! Shared State
//!
//! The single source of truth the strategy reads and the dispatcher writes.
//! Each entity class sits behind its own `RwLock` so that a slow strategy
//! read of one class never stalls dispatch of another.
//!
//! # Lock Order
//!
//! When more than one lock is held the order is always
//! `orders → positions → market_data → broker_positions → connection → errors`.
//! Only fill application and [`SharedState::snapshot`] hold more than one.
//! No lock is held across a transport call.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::application::ports::{BrokerError, PositionReport};
use crate::domain::connection::ConnectionStatus;
use crate::domain::market_data::{MarketDataSnapshot, MarketDataTick};
use crate::domain::order::{Order, OrderError, OrderId};
use crate::domain::position::{Fill, Position, PositionTracker};

/// How many broker errors are kept.
const RECENT_ERRORS_CAPACITY: usize = 32;

/// Consistent copy of the whole state, taken under all locks at once.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    /// All orders, by id.
    pub orders: Vec<Order>,
    /// All positions, by instrument.
    pub positions: Vec<Position>,
    /// Latest market data, by instrument.
    pub market_data: Vec<MarketDataSnapshot>,
    /// Session status.
    pub connection: ConnectionStatus,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Entity counts for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    /// Orders created this session.
    pub orders: usize,
    /// Orders not yet terminal.
    pub open_orders: usize,
    /// Instruments with a derived position.
    pub positions: usize,
    /// Instruments with market data.
    pub instruments: usize,
}

/// Result of applying a fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FillOutcome {
    /// Order and position both updated.
    Applied {
        /// Order after the fill.
        order: Order,
        /// Position after the fill.
        position: Position,
    },
    /// The execution id was already applied to this order.
    Duplicate,
}

/// Thread-safe orders, positions and market data for one session.
#[derive(Debug, Default)]
pub struct SharedState {
    orders: RwLock<BTreeMap<OrderId, Order>>,
    positions: RwLock<PositionTracker>,
    market_data: RwLock<HashMap<String, MarketDataSnapshot>>,
    broker_positions: RwLock<BTreeMap<String, PositionReport>>,
    connection: RwLock<ConnectionStatus>,
    errors: RwLock<VecDeque<BrokerError>>,
}

impl SharedState {
    /// Create empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Readers
    // =========================================================================

    /// One order.
    #[must_use]
    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        self.orders.read().get(&order_id).cloned()
    }

    /// All orders, by id.
    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        self.orders.read().values().cloned().collect()
    }

    /// Orders not yet in a terminal state.
    #[must_use]
    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|order| !order.status().is_terminal())
            .cloned()
            .collect()
    }

    /// Derived position for one instrument.
    #[must_use]
    pub fn position(&self, instrument: &str) -> Option<Position> {
        self.positions.read().position(instrument).cloned()
    }

    /// All derived positions, by instrument.
    #[must_use]
    pub fn positions(&self) -> Vec<Position> {
        self.positions.read().positions().cloned().collect()
    }

    /// Latest market data for one instrument.
    #[must_use]
    pub fn market_data(&self, instrument: &str) -> Option<MarketDataSnapshot> {
        self.market_data.read().get(instrument).cloned()
    }

    /// Position as last reported by the broker, kept apart from derived positions.
    #[must_use]
    pub fn broker_position(&self, instrument: &str) -> Option<PositionReport> {
        self.broker_positions.read().get(instrument).cloned()
    }

    /// All broker-reported positions, by instrument.
    #[must_use]
    pub fn broker_positions(&self) -> Vec<PositionReport> {
        self.broker_positions.read().values().cloned().collect()
    }

    /// Session status as last published by the connection manager.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        *self.connection.read()
    }

    /// Most recent broker errors, oldest first.
    #[must_use]
    pub fn recent_errors(&self) -> Vec<BrokerError> {
        self.errors.read().iter().cloned().collect()
    }

    /// Entity counts.
    #[must_use]
    pub fn counts(&self) -> StateCounts {
        let (orders, open_orders) = {
            let orders = self.orders.read();
            let open = orders
                .values()
                .filter(|order| !order.status().is_terminal())
                .count();
            (orders.len(), open)
        };
        StateCounts {
            orders,
            open_orders,
            positions: self.positions.read().len(),
            instruments: self.market_data.read().len(),
        }
    }

    /// Copy of orders, positions and market data as of one instant.
    ///
    /// Every fill lands in its order and its position under one orders lock,
    /// so the two always agree in a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        let orders = self.orders.read();
        let positions = self.positions.read();
        let market_data = self.market_data.read();
        let connection = self.connection.read();

        let mut market: Vec<_> = market_data.values().cloned().collect();
        market.sort_by(|a, b| a.instrument.cmp(&b.instrument));

        StateSnapshot {
            orders: orders.values().cloned().collect(),
            positions: positions.positions().cloned().collect(),
            market_data: market,
            connection: *connection,
            taken_at: Utc::now(),
        }
    }

    // =========================================================================
    // Writers
    // =========================================================================

    pub(crate) fn insert_order(&self, order: Order) {
        self.orders.write().insert(order.order_id(), order);
    }

    /// Run `f` against one order under the orders write lock.
    pub(crate) fn update_order<R>(
        &self,
        order_id: OrderId,
        f: impl FnOnce(&mut Order) -> Result<R, OrderError>,
    ) -> Result<R, OrderError> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(&order_id)
            .ok_or(OrderError::NotFound(order_id))?;
        f(order)
    }

    /// Apply a fill to its order and to the instrument's position atomically.
    ///
    /// The orders lock is held while the position is updated, so no reader
    /// can see one without the other. Both results are computed before either
    /// is stored; a rejected fill changes neither.
    pub(crate) fn apply_fill(&self, fill: &Fill) -> Result<FillOutcome, OrderError> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(&fill.order_id)
            .ok_or(OrderError::NotFound(fill.order_id))?;

        if order.has_execution(&fill.exec_id) {
            return Ok(FillOutcome::Duplicate);
        }

        let mut positions = self.positions.write();
        let position = positions.preview(
            fill.order_id,
            &fill.instrument,
            fill.side,
            fill.quantity,
            fill.price,
        )?;
        order.record_fill(fill)?;
        let position = positions.commit(position).clone();

        Ok(FillOutcome::Applied {
            order: order.clone(),
            position,
        })
    }

    pub(crate) fn apply_tick(&self, tick: &MarketDataTick) {
        let mut market_data = self.market_data.write();
        match market_data.get_mut(&tick.instrument) {
            Some(snapshot) => snapshot.update(tick),
            None => {
                market_data.insert(tick.instrument.clone(), MarketDataSnapshot::from_tick(tick));
            }
        }
    }

    pub(crate) fn record_broker_position(&self, report: PositionReport) {
        self.broker_positions
            .write()
            .insert(report.instrument.clone(), report);
    }

    pub(crate) fn set_connection_status(&self, status: ConnectionStatus) {
        *self.connection.write() = status;
    }

    pub(crate) fn record_error(&self, error: BrokerError) {
        let mut errors = self.errors.write();
        if errors.len() == RECENT_ERRORS_CAPACITY {
            errors.pop_front();
        }
        errors.push_back(error);
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::market_data::TickKind;
    use crate::domain::order::{OrderRequest, OrderStatus, Side};

    fn state_with_order(id: u64, quantity: Decimal) -> SharedState {
        let state = SharedState::new();
        let mut order = Order::new(
            OrderId::new(id),
            OrderRequest::market("AAPL", Side::Buy, quantity),
            Utc::now(),
        );
        order.transition(OrderStatus::Submitted, Utc::now()).unwrap();
        state.insert_order(order);
        state
    }

    fn fill(id: u64, exec_id: &str, quantity: Decimal, price: Decimal) -> Fill {
        Fill {
            order_id: OrderId::new(id),
            exec_id: exec_id.to_string(),
            instrument: "AAPL".to_string(),
            side: Side::Buy,
            quantity,
            price,
            time: Utc::now(),
        }
    }

    #[test]
    fn fill_updates_order_and_position_together() {
        let state = state_with_order(1, dec!(10));
        let outcome = state.apply_fill(&fill(1, "e1", dec!(4), dec!(50))).unwrap();

        let FillOutcome::Applied { order, position } = outcome else {
            panic!("expected applied fill");
        };
        assert_eq!(order.status(), OrderStatus::PartiallyFilled);
        assert_eq!(position.net_quantity(), dec!(4));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.orders[0].filled_quantity(), dec!(4));
        assert_eq!(snapshot.positions[0].net_quantity(), dec!(4));
    }

    #[test]
    fn duplicate_execution_is_ignored() {
        let state = state_with_order(1, dec!(10));
        state.apply_fill(&fill(1, "e1", dec!(4), dec!(50))).unwrap();
        let outcome = state.apply_fill(&fill(1, "e1", dec!(4), dec!(50))).unwrap();

        assert_eq!(outcome, FillOutcome::Duplicate);
        assert_eq!(state.position("AAPL").unwrap().net_quantity(), dec!(4));
    }

    #[test]
    fn rejected_fill_leaves_position_untouched() {
        let state = state_with_order(1, dec!(10));
        let err = state
            .apply_fill(&fill(1, "e1", dec!(11), dec!(50)))
            .unwrap_err();

        assert!(matches!(err, OrderError::Overfill { .. }));
        assert!(state.position("AAPL").is_none());
        assert_eq!(state.order(OrderId::new(1)).unwrap().filled_quantity(), Decimal::ZERO);
    }

    #[test]
    fn overflowing_fill_changes_neither_side() {
        let state = state_with_order(1, dec!(100));
        state.apply_fill(&fill(1, "e1", dec!(50), dec!(100))).unwrap();
        let before = state.snapshot();

        let err = state
            .apply_fill(&fill(1, "e2", dec!(50), Decimal::MAX))
            .unwrap_err();

        assert!(matches!(err, OrderError::FillOverflow { .. }));
        let after = state.snapshot();
        assert_eq!(after.orders, before.orders);
        assert_eq!(after.positions, before.positions);
        assert_eq!(state.order(OrderId::new(1)).unwrap().filled_quantity(), dec!(50));
    }

    #[test]
    fn fill_for_unknown_order() {
        let state = SharedState::new();
        let err = state.apply_fill(&fill(9, "e1", dec!(1), dec!(1))).unwrap_err();
        assert_eq!(err, OrderError::NotFound(OrderId::new(9)));
    }

    #[test]
    fn ticks_overwrite_snapshot() {
        let state = SharedState::new();
        for price in [dec!(10), dec!(11)] {
            state.apply_tick(&MarketDataTick {
                instrument: "SPY".to_string(),
                kind: TickKind::Trade {
                    price,
                    size: dec!(1),
                },
                timestamp: Utc::now(),
            });
        }
        assert_eq!(state.market_data("SPY").unwrap().last_price, Some(dec!(11)));
        assert_eq!(state.counts().instruments, 1);
    }

    #[test]
    fn recent_errors_are_bounded() {
        let state = SharedState::new();
        for code in 0..40 {
            state.record_error(BrokerError {
                order_id: None,
                code,
                message: String::new(),
            });
        }
        let errors = state.recent_errors();
        assert_eq!(errors.len(), RECENT_ERRORS_CAPACITY);
        assert_eq!(errors[0].code, 8);
    }

    #[test]
    fn broker_positions_are_separate_from_derived() {
        let state = SharedState::new();
        state.record_broker_position(PositionReport {
            account: "DU123".to_string(),
            instrument: "AAPL".to_string(),
            quantity: dec!(300),
            avg_cost: dec!(180),
        });
        assert!(state.position("AAPL").is_none());
        assert_eq!(state.broker_position("AAPL").unwrap().quantity, dec!(300));
    }

    #[test]
    fn counts_open_orders() {
        let state = state_with_order(1, dec!(1));
        state
            .update_order(OrderId::new(1), |order| {
                order.transition(OrderStatus::Cancelled, Utc::now())
            })
            .unwrap();
        state.insert_order(Order::new(
            OrderId::new(2),
            OrderRequest::market("MSFT", Side::Sell, dec!(1)),
            Utc::now(),
        ));
        let counts = state.counts();
        assert_eq!(counts.orders, 2);
        assert_eq!(counts.open_orders, 1);
    }
}
