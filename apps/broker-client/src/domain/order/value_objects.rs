//! Order value objects: identifiers, side, type and status.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::errors::OrderError;

// =============================================================================
// OrderId
// =============================================================================

/// Session-scoped order identifier, allocated locally and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(u64);

impl OrderId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw identifier value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for OrderId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// =============================================================================
// Side
// =============================================================================

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl Side {
    /// The side that closes a position opened by this side.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Signed quantity for this side: positive for buys, negative for sells.
    #[must_use]
    pub fn signed(self, quantity: Decimal) -> Decimal {
        match self {
            Self::Buy => quantity,
            Self::Sell => -quantity,
        }
    }

    /// Broker action code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" | "BOT" => Ok(Self::Buy),
            "SELL" | "SLD" => Ok(Self::Sell),
            other => Err(OrderError::InvalidRequest(format!(
                "unrecognized side: {other}"
            ))),
        }
    }
}

// =============================================================================
// OrderType
// =============================================================================

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Market order.
    Market,
    /// Limit order.
    Limit,
    /// Stop order, becomes a market order once triggered.
    Stop,
    /// Stop-limit order, becomes a limit order once triggered.
    StopLimit,
}

impl OrderType {
    /// Returns true if this type needs a limit price.
    #[must_use]
    pub const fn requires_limit_price(self) -> bool {
        matches!(self, Self::Limit | Self::StopLimit)
    }

    /// Returns true if this type needs a stop price.
    #[must_use]
    pub const fn requires_stop_price(self) -> bool {
        matches!(self, Self::Stop | Self::StopLimit)
    }

    /// Broker order type code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MKT",
            Self::Limit => "LMT",
            Self::Stop => "STP",
            Self::StopLimit => "STP LMT",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "MKT" | "MARKET" => Ok(Self::Market),
            "LMT" | "LIMIT" => Ok(Self::Limit),
            "STP" | "STOP" => Ok(Self::Stop),
            "STP LMT" | "STOP_LIMIT" | "STOP LIMIT" => Ok(Self::StopLimit),
            other => Err(OrderError::InvalidRequest(format!(
                "unrecognized order type: {other}"
            ))),
        }
    }
}

// =============================================================================
// OrderStatus
// =============================================================================

/// Order status in the local lifecycle.
///
/// ```text
/// Created ─► Submitted ─► Acknowledged ─► PartiallyFilled ─► Filled
///    │           │             │                 │
///    └───────────┴─────────────┴─────────────────┴─► Cancelled / Rejected
/// ```
///
/// `Filled`, `Cancelled` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Allocated locally, not yet handed to the transport.
    Created,
    /// Handed to the transport, awaiting broker acknowledgement.
    Submitted,
    /// Accepted by the broker and working.
    Acknowledged,
    /// Some quantity filled.
    PartiallyFilled,
    /// Entire quantity filled.
    Filled,
    /// Cancelled at the broker.
    Cancelled,
    /// Rejected locally on send failure or by the broker.
    Rejected,
}

impl OrderStatus {
    /// Returns true if the order is in a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    /// Returns true if the order is still working at the broker.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Acknowledged | Self::PartiallyFilled
        )
    }

    /// Returns true if `next` is a legal successor of this status.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Submitted | Self::Rejected)
                | (
                    Self::Submitted,
                    Self::Acknowledged | Self::Cancelled | Self::Rejected
                )
                | (
                    Self::Acknowledged,
                    Self::PartiallyFilled | Self::Filled | Self::Cancelled | Self::Rejected
                )
                | (
                    Self::PartiallyFilled,
                    Self::PartiallyFilled | Self::Filled | Self::Cancelled
                )
        )
    }

    /// Lowercase label used in logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Submitted => "submitted",
            Self::Acknowledged => "acknowledged",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
