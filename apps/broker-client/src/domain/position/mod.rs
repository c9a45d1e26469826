//! Positions
//!
//! Net positions derived incrementally from fills. A position is never set
//! directly; it is the fold of its instrument's fills in arrival order, so
//! replaying the same ordered fills always yields the same positions.
//!
//! # Average cost
//!
//! | Fill relative to position | `avg_cost`                          |
//! |---------------------------|-------------------------------------|
//! | opens or increases        | volume-weighted with the fill price |
//! | reduces                   | unchanged                           |
//! | closes to zero            | reset to zero, position retained    |
//! | flips sign                | reset to the fill price             |

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::order::{OrderError, OrderId, Side};

/// A broker-reported execution of (part of) an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Order the execution belongs to.
    pub order_id: OrderId,
    /// Broker execution id, unique per execution.
    pub exec_id: String,
    /// Instrument symbol.
    pub instrument: String,
    /// Side of the execution.
    pub side: Side,
    /// Executed quantity.
    pub quantity: Decimal,
    /// Execution price.
    pub price: Decimal,
    /// Execution time.
    pub time: DateTime<Utc>,
}

/// Net position in one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    instrument: String,
    net_quantity: Decimal,
    avg_cost: Decimal,
    last_order_id: Option<OrderId>,
}

impl Position {
    /// A flat position.
    #[must_use]
    pub fn flat(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            net_quantity: Decimal::ZERO,
            avg_cost: Decimal::ZERO,
            last_order_id: None,
        }
    }

    /// Instrument symbol.
    #[must_use]
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Signed net quantity: positive long, negative short.
    #[must_use]
    pub const fn net_quantity(&self) -> Decimal {
        self.net_quantity
    }

    /// Average cost of the open quantity.
    #[must_use]
    pub const fn avg_cost(&self) -> Decimal {
        self.avg_cost
    }

    /// Order of the most recent fill applied.
    #[must_use]
    pub const fn last_order_id(&self) -> Option<OrderId> {
        self.last_order_id
    }

    /// Returns true if there is no open quantity.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.net_quantity.is_zero()
    }

    /// Apply one fill.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::FillOverflow` if the new quantity or average cost
    /// leaves the decimal range. The position is unchanged in that case.
    pub fn apply(
        &mut self,
        order_id: OrderId,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), OrderError> {
        let overflow = |field| OrderError::FillOverflow { order_id, field };
        let delta = side.signed(quantity);
        let current = self.net_quantity;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| overflow("net quantity"))?;

        let before = current.cmp(&Decimal::ZERO);
        let after = next.cmp(&Decimal::ZERO);
        let increasing = before == Ordering::Equal || before == delta.cmp(&Decimal::ZERO);

        let avg_cost = if increasing {
            if next.is_zero() {
                Decimal::ZERO
            } else {
                current
                    .abs()
                    .checked_mul(self.avg_cost)
                    .zip(quantity.checked_mul(price))
                    .and_then(|(held, added)| held.checked_add(added))
                    .and_then(|cost| cost.checked_div(next.abs()))
                    .ok_or_else(|| overflow("average cost"))?
            }
        } else if after == Ordering::Equal {
            Decimal::ZERO
        } else if after == before {
            self.avg_cost
        } else {
            price
        };
        self.avg_cost = avg_cost;
        self.net_quantity = next;
        self.last_order_id = Some(order_id);
        Ok(())
    }
}

/// Derives positions from fills.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionTracker {
    positions: BTreeMap<String, Position>,
}

impl PositionTracker {
    /// Create an empty tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            positions: BTreeMap::new(),
        }
    }

    /// Rebuild positions from an ordered fill sequence.
    ///
    /// # Errors
    ///
    /// Returns the first `OrderError::FillOverflow` hit while folding.
    pub fn replay<'a>(fills: impl IntoIterator<Item = &'a Fill>) -> Result<Self, OrderError> {
        let mut tracker = Self::new();
        for fill in fills {
            tracker.apply(fill)?;
        }
        Ok(tracker)
    }

    /// Incrementally apply one fill and return the updated position.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::FillOverflow` without touching the tracker if the
    /// fill overflows the position.
    pub fn on_fill(
        &mut self,
        order_id: OrderId,
        instrument: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<&Position, OrderError> {
        let position = self.preview(order_id, instrument, side, quantity, price)?;
        Ok(self.commit(position))
    }

    /// Apply a [`Fill`].
    ///
    /// # Errors
    ///
    /// See [`PositionTracker::on_fill`].
    pub fn apply(&mut self, fill: &Fill) -> Result<&Position, OrderError> {
        self.on_fill(
            fill.order_id,
            &fill.instrument,
            fill.side,
            fill.quantity,
            fill.price,
        )
    }

    /// The position `fill` would produce, leaving the tracker untouched.
    pub(crate) fn preview(
        &self,
        order_id: OrderId,
        instrument: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Position, OrderError> {
        let mut position = self
            .positions
            .get(instrument)
            .cloned()
            .unwrap_or_else(|| Position::flat(instrument));
        position.apply(order_id, side, quantity, price)?;
        Ok(position)
    }

    /// Store a position produced by [`PositionTracker::preview`].
    pub(crate) fn commit(&mut self, position: Position) -> &Position {
        match self.positions.entry(position.instrument.clone()) {
            Entry::Occupied(mut slot) => {
                slot.insert(position);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(position),
        }
    }

    /// Position for one instrument, if any fill was ever seen for it.
    #[must_use]
    pub fn position(&self, instrument: &str) -> Option<&Position> {
        self.positions.get(instrument)
    }

    /// All positions, ordered by instrument. Flat positions are included.
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Number of instruments with a position record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if no fill has been applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use super::*;

    const ID: OrderId = OrderId::new(1);

    fn tracker_with(fills: &[(Side, Decimal, Decimal)]) -> PositionTracker {
        let mut tracker = PositionTracker::new();
        for &(side, quantity, price) in fills {
            tracker.on_fill(ID, "ES", side, quantity, price).unwrap();
        }
        tracker
    }

    #[test]
    fn weighted_average_on_increase() {
        let tracker = tracker_with(&[
            (Side::Buy, dec!(40), dec!(100)),
            (Side::Buy, dec!(60), dec!(101)),
        ]);
        let position = tracker.position("ES").unwrap();
        assert_eq!(position.net_quantity(), dec!(100));
        assert_eq!(position.avg_cost(), dec!(100.6));
    }

    #[test]
    fn reduce_keeps_average() {
        let tracker = tracker_with(&[
            (Side::Buy, dec!(10), dec!(50)),
            (Side::Sell, dec!(4), dec!(70)),
        ]);
        let position = tracker.position("ES").unwrap();
        assert_eq!(position.net_quantity(), dec!(6));
        assert_eq!(position.avg_cost(), dec!(50));
    }

    #[test]
    fn close_retains_flat_position() {
        let tracker = tracker_with(&[
            (Side::Sell, dec!(5), dec!(20)),
            (Side::Buy, dec!(5), dec!(18)),
        ]);
        let position = tracker.position("ES").unwrap();
        assert!(position.is_flat());
        assert_eq!(position.avg_cost(), Decimal::ZERO);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn flip_resets_average_to_fill_price() {
        let tracker = tracker_with(&[
            (Side::Buy, dec!(10), dec!(50)),
            (Side::Sell, dec!(15), dec!(55)),
        ]);
        let position = tracker.position("ES").unwrap();
        assert_eq!(position.net_quantity(), dec!(-5));
        assert_eq!(position.avg_cost(), dec!(55));
    }

    #[test]
    fn short_side_averages_like_long_side() {
        let tracker = tracker_with(&[
            (Side::Sell, dec!(2), dec!(10)),
            (Side::Sell, dec!(2), dec!(12)),
        ]);
        let position = tracker.position("ES").unwrap();
        assert_eq!(position.net_quantity(), dec!(-4));
        assert_eq!(position.avg_cost(), dec!(11));
    }

    #[test]
    fn instruments_are_independent() {
        let mut tracker = PositionTracker::new();
        tracker.on_fill(ID, "ES", Side::Buy, dec!(1), dec!(5000)).unwrap();
        tracker.on_fill(ID, "NQ", Side::Sell, dec!(2), dec!(18000)).unwrap();
        let names: Vec<_> = tracker.positions().map(Position::instrument).collect();
        assert_eq!(names, ["ES", "NQ"]);
    }

    #[test]
    fn overflowing_fill_leaves_position_untouched() {
        let mut tracker = tracker_with(&[(Side::Buy, dec!(50), dec!(100))]);
        let before = tracker.clone();

        let err = tracker
            .on_fill(OrderId::new(2), "ES", Side::Buy, dec!(50), Decimal::MAX)
            .unwrap_err();
        assert_eq!(
            err,
            OrderError::FillOverflow {
                order_id: OrderId::new(2),
                field: "average cost",
            }
        );
        assert_eq!(tracker, before);

        tracker
            .on_fill(ID, "NQ", Side::Sell, Decimal::MAX, dec!(1))
            .unwrap();
        let err = tracker
            .on_fill(ID, "NQ", Side::Sell, Decimal::MAX, dec!(1))
            .unwrap_err();
        assert!(matches!(err, OrderError::FillOverflow { field: "net quantity", .. }));
        assert_eq!(
            tracker.position("NQ").unwrap().net_quantity(),
            -Decimal::MAX
        );
    }

    fn fill_strategy() -> impl Strategy<Value = Fill> {
        (
            prop::bool::ANY,
            1u32..500,
            1u32..100_000,
            prop::sample::select(vec!["ES", "NQ", "CL"]),
        )
            .prop_map(|(buy, quantity, cents, instrument)| Fill {
                order_id: ID,
                exec_id: String::new(),
                instrument: instrument.to_string(),
                side: if buy { Side::Buy } else { Side::Sell },
                quantity: Decimal::from(quantity),
                price: Decimal::new(i64::from(cents), 2),
                time: DateTime::<Utc>::UNIX_EPOCH,
            })
    }

    proptest! {
        #[test]
        fn replay_is_deterministic(fills in prop::collection::vec(fill_strategy(), 0..64)) {
            let first = PositionTracker::replay(&fills).unwrap();
            let second = PositionTracker::replay(&fills).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn net_quantity_is_signed_sum(fills in prop::collection::vec(fill_strategy(), 0..64)) {
            let tracker = PositionTracker::replay(&fills).unwrap();
            for position in tracker.positions() {
                let expected: Decimal = fills
                    .iter()
                    .filter(|f| f.instrument == position.instrument())
                    .map(|f| f.side.signed(f.quantity))
                    .sum();
                prop_assert_eq!(position.net_quantity(), expected);
                prop_assert!(position.avg_cost() >= Decimal::ZERO);
            }
        }
    }
}
