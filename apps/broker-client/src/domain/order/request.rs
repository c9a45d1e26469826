//! Order requests and modifications issued by the strategy.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::errors::OrderError;
use super::value_objects::{OrderId, OrderType, Side};

/// A request to place a new order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Instrument symbol.
    pub instrument: String,
    /// Buy or sell.
    pub side: Side,
    /// Requested quantity, must be positive.
    pub quantity: Decimal,
    /// Order type.
    pub order_type: OrderType,
    /// Limit price, required for limit and stop-limit orders.
    pub limit_price: Option<Decimal>,
    /// Stop trigger price, required for stop and stop-limit orders.
    pub stop_price: Option<Decimal>,
    /// Allow execution outside regular trading hours.
    pub outside_regular_hours: bool,
    /// Parent order for bracket children.
    pub parent_id: Option<OrderId>,
}

impl OrderRequest {
    fn base(
        instrument: impl Into<String>,
        side: Side,
        quantity: Decimal,
        order_type: OrderType,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            side,
            quantity,
            order_type,
            limit_price: None,
            stop_price: None,
            outside_regular_hours: false,
            parent_id: None,
        }
    }

    /// Market order.
    #[must_use]
    pub fn market(instrument: impl Into<String>, side: Side, quantity: Decimal) -> Self {
        Self::base(instrument, side, quantity, OrderType::Market)
    }

    /// Limit order.
    #[must_use]
    pub fn limit(
        instrument: impl Into<String>,
        side: Side,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            limit_price: Some(limit_price),
            ..Self::base(instrument, side, quantity, OrderType::Limit)
        }
    }

    /// Stop order.
    #[must_use]
    pub fn stop(
        instrument: impl Into<String>,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            stop_price: Some(stop_price),
            ..Self::base(instrument, side, quantity, OrderType::Stop)
        }
    }

    /// Stop-limit order.
    #[must_use]
    pub fn stop_limit(
        instrument: impl Into<String>,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            limit_price: Some(limit_price),
            stop_price: Some(stop_price),
            ..Self::base(instrument, side, quantity, OrderType::StopLimit)
        }
    }

    /// Allow or forbid execution outside regular trading hours.
    #[must_use]
    pub const fn with_outside_regular_hours(mut self, allowed: bool) -> Self {
        self.outside_regular_hours = allowed;
        self
    }

    /// Validate the request before an id is allocated.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::InvalidRequest` if the instrument is empty, the
    /// quantity is not positive, or the prices do not fit the order type.
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.instrument.trim().is_empty() {
            return Err(OrderError::InvalidRequest(
                "instrument must not be empty".to_string(),
            ));
        }

        if self.quantity <= Decimal::ZERO {
            return Err(OrderError::InvalidRequest(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }

        check_price(
            "limit",
            self.limit_price,
            self.order_type.requires_limit_price(),
            self.order_type,
        )?;
        check_price(
            "stop",
            self.stop_price,
            self.order_type.requires_stop_price(),
            self.order_type,
        )
    }
}

fn check_price(
    label: &str,
    price: Option<Decimal>,
    required: bool,
    order_type: OrderType,
) -> Result<(), OrderError> {
    match (price, required) {
        (None, true) => Err(OrderError::InvalidRequest(format!(
            "{order_type} order requires a {label} price"
        ))),
        (Some(_), false) => Err(OrderError::InvalidRequest(format!(
            "{order_type} order does not take a {label} price"
        ))),
        (Some(p), true) if p <= Decimal::ZERO => Err(OrderError::InvalidRequest(format!(
            "{label} price must be positive, got {p}"
        ))),
        _ => Ok(()),
    }
}

/// Changes to a working order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderChanges {
    /// New total quantity.
    pub quantity: Option<Decimal>,
    /// New limit price.
    pub limit_price: Option<Decimal>,
    /// New stop price.
    pub stop_price: Option<Decimal>,
}

impl OrderChanges {
    /// Change the total quantity.
    #[must_use]
    pub const fn quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Change the limit price.
    #[must_use]
    pub const fn limit_price(mut self, price: Decimal) -> Self {
        self.limit_price = Some(price);
        self
    }

    /// Change the stop price.
    #[must_use]
    pub const fn stop_price(mut self, price: Decimal) -> Self {
        self.stop_price = Some(price);
        self
    }

    /// Returns true if nothing would change.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.quantity.is_none() && self.limit_price.is_none() && self.stop_price.is_none()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn market_request_is_valid() {
        assert!(OrderRequest::market("AAPL", Side::Buy, dec!(100)).validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_quantity() {
        for quantity in [dec!(0), dec!(-5)] {
            let err = OrderRequest::market("AAPL", Side::Buy, quantity)
                .validate()
                .unwrap_err();
            assert!(matches!(err, OrderError::InvalidRequest(_)));
        }
    }

    #[test]
    fn rejects_empty_instrument() {
        let err = OrderRequest::market("  ", Side::Sell, dec!(1))
            .validate()
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidRequest(_)));
    }

    #[test]
    fn limit_order_requires_limit_price() {
        let mut request = OrderRequest::limit("AAPL", Side::Buy, dec!(10), dec!(150.25));
        assert!(request.validate().is_ok());

        request.limit_price = None;
        let err = request.validate().unwrap_err();
        assert_eq!(
            err,
            OrderError::InvalidRequest("LMT order requires a limit price".to_string())
        );
    }

    #[test]
    fn market_order_rejects_limit_price() {
        let mut request = OrderRequest::market("AAPL", Side::Buy, dec!(10));
        request.limit_price = Some(dec!(1));
        assert!(request.validate().is_err());
    }

    #[test]
    fn stop_limit_needs_both_prices() {
        let request = OrderRequest::stop_limit("ES", Side::Sell, dec!(1), dec!(4990), dec!(4985));
        assert!(request.validate().is_ok());

        let mut missing_stop = request;
        missing_stop.stop_price = None;
        assert!(missing_stop.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_prices() {
        let request = OrderRequest::limit("AAPL", Side::Buy, dec!(10), dec!(0));
        assert!(request.validate().is_err());
    }

    #[test]
    fn empty_changes() {
        assert!(OrderChanges::default().is_empty());
        assert!(!OrderChanges::default().limit_price(dec!(1)).is_empty());
    }
}
