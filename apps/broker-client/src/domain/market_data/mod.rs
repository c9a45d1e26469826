//! Market Data
//!
//! Ticks as delivered by the broker and the latest-value snapshot kept per
//! instrument. No history is retained.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Payload of a market data tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TickKind {
    /// Last trade.
    Trade {
        /// Trade price.
        price: Decimal,
        /// Trade size.
        size: Decimal,
    },
    /// Top of book.
    Quote {
        /// Best bid.
        bid: Decimal,
        /// Best ask.
        ask: Decimal,
        /// Size at the bid.
        bid_size: Decimal,
        /// Size at the ask.
        ask_size: Decimal,
    },
    /// Midpoint of the book.
    Midpoint {
        /// Midpoint price.
        price: Decimal,
    },
}

/// A market data update for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDataTick {
    /// Instrument symbol.
    pub instrument: String,
    /// Tick payload.
    pub kind: TickKind,
    /// Exchange time of the tick.
    pub timestamp: DateTime<Utc>,
}

impl MarketDataTick {
    /// Check the tick carries usable prices.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when the instrument is empty,
    /// a price is not positive, or the quote is crossed.
    pub fn validate(&self) -> Result<(), String> {
        if self.instrument.trim().is_empty() {
            return Err("tick has no instrument".to_string());
        }
        match self.kind {
            TickKind::Trade { price, size } => {
                if price <= Decimal::ZERO || size < Decimal::ZERO {
                    return Err(format!("invalid trade {size}@{price}"));
                }
            }
            TickKind::Quote { bid, ask, .. } => {
                if bid <= Decimal::ZERO || ask <= Decimal::ZERO {
                    return Err(format!("invalid quote {bid}/{ask}"));
                }
                if bid > ask {
                    return Err(format!("crossed quote {bid}/{ask}"));
                }
            }
            TickKind::Midpoint { price } => {
                if price <= Decimal::ZERO {
                    return Err(format!("invalid midpoint {price}"));
                }
            }
        }
        Ok(())
    }
}

/// Latest known prices for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    /// Instrument symbol.
    pub instrument: String,
    /// Last trade price.
    pub last_price: Option<Decimal>,
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Time of the most recent tick.
    pub timestamp: DateTime<Utc>,
}

impl MarketDataSnapshot {
    /// Snapshot built from a first tick.
    #[must_use]
    pub fn from_tick(tick: &MarketDataTick) -> Self {
        let mut snapshot = Self {
            instrument: tick.instrument.clone(),
            last_price: None,
            bid: None,
            ask: None,
            timestamp: tick.timestamp,
        };
        snapshot.update(tick);
        snapshot
    }

    /// Overwrite the fields carried by `tick`.
    ///
    /// Midpoint ticks only move the timestamp; the snapshot keeps the book
    /// they were derived from.
    pub fn update(&mut self, tick: &MarketDataTick) {
        match tick.kind {
            TickKind::Trade { price, .. } => self.last_price = Some(price),
            TickKind::Quote { bid, ask, .. } => {
                self.bid = Some(bid);
                self.ask = Some(ask);
            }
            TickKind::Midpoint { .. } => {}
        }
        self.timestamp = tick.timestamp;
    }

    /// Midpoint of the current quote.
    #[must_use]
    pub fn mid(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }
}
