//! Paper Gateway
//!
//! An in-memory [`BrokerTransport`] that behaves like a broker gateway
//! without a network: it acknowledges orders, fills marketable ones against
//! the last known price, streams ticks for subscribed instruments and answers
//! position requests. Test code and the demo binary drive prices and faults
//! through the driver methods.
//!
//! # Fill model
//!
//! - Market orders fill at the last price.
//! - Limit orders fill at the last price once it is at or through the limit.
//! - Stop orders trigger once the last price touches the stop and fill there;
//!   stop-limit orders additionally need the limit to be marketable.
//! - Bracket children only work after their parent is filled, and a filled
//!   child cancels its siblings.
//! - With `fill_chunk` set, a fill is split into executions of at most that
//!   size.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use rust_decimal::Decimal;

use crate::application::ports::{
    BrokerError, BrokerTransport, ExecutionReport, Handshake, InboundMessage, OrderStatusUpdate,
    OutboundRequest, PositionReport, TransportError,
};
use crate::domain::connection::ConnectionConfig;
use crate::domain::market_data::{MarketDataTick, TickKind};
use crate::domain::order::{OrderId, OrderRequest, OrderType, Side};
use crate::domain::position::PositionTracker;

/// Error codes the gateway emits.
mod codes {
    pub const DUPLICATE_ORDER_ID: i32 = 103;
    pub const ORDER_NOT_FOUND: i32 = 135;
    pub const NOT_CANCELLABLE: i32 = 161;
    pub const MARKET_DATA_FARM_OK: i32 = 2104;
}

// =============================================================================
// Settings
// =============================================================================

/// Paper gateway behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperSettings {
    /// Next valid order id reported in the handshake.
    pub next_valid_id: u64,
    /// Protocol version reported in the handshake.
    pub server_version: i32,
    /// Account named in position reports.
    pub account: String,
    /// Fill marketable orders automatically.
    pub auto_fill: bool,
    /// Maximum quantity per execution (`None` = fill in one execution).
    pub fill_chunk: Option<Decimal>,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            next_valid_id: 1,
            server_version: 176,
            account: "DU0000001".to_string(),
            auto_fill: true,
            fill_chunk: None,
        }
    }
}

// =============================================================================
// Gateway State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PaperStatus {
    /// Placed with `transmit = false`, waiting for the rest of the bracket.
    Held,
    Working,
    Filled,
    Cancelled,
    Inactive,
}

impl PaperStatus {
    const fn is_open(self) -> bool {
        matches!(self, Self::Held | Self::Working)
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    status: PaperStatus,
    filled: Decimal,
    notional: Decimal,
}

impl PaperOrder {
    fn remaining(&self) -> Decimal {
        self.request.quantity - self.filled
    }

    fn avg_price(&self) -> Decimal {
        if self.filled.is_zero() {
            Decimal::ZERO
        } else {
            self.notional.checked_div(self.filled).unwrap_or(Decimal::MAX)
        }
    }
}

#[derive(Debug, Default)]
struct Gateway {
    connected: bool,
    refuse_next: Option<String>,
    outbox: VecDeque<InboundMessage>,
    orders: BTreeMap<OrderId, PaperOrder>,
    prices: HashMap<String, Decimal>,
    subscriptions: HashSet<String>,
    positions: PositionTracker,
    requests: Vec<OutboundRequest>,
}

/// In-memory broker gateway.
#[derive(Debug)]
pub struct PaperGateway {
    settings: PaperSettings,
    inner: Mutex<Gateway>,
    ready: Condvar,
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new(PaperSettings::default())
    }
}

impl PaperGateway {
    /// Create a gateway.
    #[must_use]
    pub fn new(settings: PaperSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Gateway::default()),
            ready: Condvar::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Driver API
    // -------------------------------------------------------------------------

    /// Set the last trade price, stream it to subscribers and fill whatever
    /// became marketable.
    pub fn set_price(&self, instrument: &str, price: Decimal) {
        let mut gw = self.inner.lock();
        gw.prices.insert(instrument.to_string(), price);
        if gw.connected && gw.subscriptions.contains(instrument) {
            gw.outbox.push_back(trade_tick(instrument, price));
        }
        if self.settings.auto_fill {
            self.match_orders(&mut gw, instrument);
        }
        drop(gw);
        self.ready.notify_all();
    }

    /// Stream a quote to subscribers. Does not move the last price.
    pub fn push_quote(&self, instrument: &str, bid: Decimal, ask: Decimal) {
        let mut gw = self.inner.lock();
        if gw.connected && gw.subscriptions.contains(instrument) {
            gw.outbox.push_back(InboundMessage::Tick(MarketDataTick {
                instrument: instrument.to_string(),
                kind: TickKind::Quote {
                    bid,
                    ask,
                    bid_size: Decimal::ONE_HUNDRED,
                    ask_size: Decimal::ONE_HUNDRED,
                },
                timestamp: Utc::now(),
            }));
        }
        drop(gw);
        self.ready.notify_all();
    }

    /// Execute `quantity` of an open order at `price`, regardless of the fill
    /// model. Returns false if the order is unknown, not open, or the
    /// quantity exceeds what remains.
    pub fn fill(&self, order_id: OrderId, quantity: Decimal, price: Decimal) -> bool {
        let mut gw = self.inner.lock();
        let fillable = gw
            .orders
            .get(&order_id)
            .is_some_and(|o| o.status.is_open() && quantity > Decimal::ZERO && quantity <= o.remaining());
        if fillable {
            self.execute(&mut gw, order_id, quantity, price);
        }
        drop(gw);
        self.ready.notify_all();
        fillable
    }

    /// Reject an open order as the broker would (error 201, then `Inactive`).
    pub fn reject(&self, order_id: OrderId, reason: &str) -> bool {
        let mut gw = self.inner.lock();
        let Some(order) = gw.orders.get_mut(&order_id).filter(|o| o.status.is_open()) else {
            return false;
        };
        order.status = PaperStatus::Inactive;
        let update = status_update(order_id, order, "Inactive");
        gw.outbox.push_back(InboundMessage::Error(BrokerError {
            order_id: Some(order_id),
            code: BrokerError::ORDER_REJECTED,
            message: reason.to_string(),
        }));
        gw.outbox.push_back(update);
        drop(gw);
        self.ready.notify_all();
        true
    }

    /// Simulate the gateway closing the socket.
    pub fn drop_connection(&self, reason: &str) {
        let mut gw = self.inner.lock();
        if gw.connected {
            gw.connected = false;
            gw.outbox.push_back(InboundMessage::ConnectionClosed {
                reason: reason.to_string(),
            });
        }
        drop(gw);
        self.ready.notify_all();
    }

    /// Make the next handshake fail with `reason`.
    pub fn refuse_next_connection(&self, reason: &str) {
        self.inner.lock().refuse_next = Some(reason.to_string());
    }

    /// Queue an arbitrary inbound message.
    pub fn inject(&self, message: InboundMessage) {
        self.inner.lock().outbox.push_back(message);
        self.ready.notify_all();
    }

    /// Every request received so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.inner.lock().requests.clone()
    }

    /// Returns true while a session is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Instruments with an active market data subscription.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut subscriptions: Vec<_> = self.inner.lock().subscriptions.iter().cloned().collect();
        subscriptions.sort();
        subscriptions
    }

    // -------------------------------------------------------------------------
    // Request handling
    // -------------------------------------------------------------------------

    fn handle(&self, gw: &mut Gateway, request: &OutboundRequest) {
        match request {
            OutboundRequest::PlaceOrder {
                order_id,
                request,
                transmit,
            } => self.place(gw, *order_id, request, *transmit),
            OutboundRequest::ModifyOrder { order_id, request } => self.modify(gw, *order_id, request),
            OutboundRequest::CancelOrder { order_id } => cancel(gw, *order_id),
            OutboundRequest::GlobalCancel => {
                let open: Vec<_> = gw
                    .orders
                    .iter()
                    .filter(|(_, o)| o.status.is_open())
                    .map(|(id, _)| *id)
                    .collect();
                for order_id in open {
                    cancel(gw, order_id);
                }
            }
            OutboundRequest::RequestMarketData { instrument } => {
                gw.subscriptions.insert(instrument.clone());
                if let Some(price) = gw.prices.get(instrument).copied() {
                    gw.outbox.push_back(trade_tick(instrument, price));
                }
            }
            OutboundRequest::CancelMarketData { instrument } => {
                gw.subscriptions.remove(instrument);
            }
            OutboundRequest::RequestPositions => {
                let reports: Vec<_> = gw
                    .positions
                    .positions()
                    .map(|p| {
                        InboundMessage::Position(PositionReport {
                            account: self.settings.account.clone(),
                            instrument: p.instrument().to_string(),
                            quantity: p.net_quantity(),
                            avg_cost: p.avg_cost(),
                        })
                    })
                    .collect();
                gw.outbox.extend(reports);
            }
        }
    }

    fn place(&self, gw: &mut Gateway, order_id: OrderId, request: &OrderRequest, transmit: bool) {
        if gw.orders.contains_key(&order_id) {
            gw.outbox.push_back(order_error(
                order_id,
                codes::DUPLICATE_ORDER_ID,
                "Duplicate order id",
            ));
            return;
        }
        gw.orders.insert(
            order_id,
            PaperOrder {
                request: request.clone(),
                status: PaperStatus::Held,
                filled: Decimal::ZERO,
                notional: Decimal::ZERO,
            },
        );
        if !transmit {
            return;
        }

        // Transmitting releases everything held, in id order.
        let held: Vec<_> = gw
            .orders
            .iter()
            .filter(|(_, o)| o.status == PaperStatus::Held)
            .map(|(id, _)| *id)
            .collect();
        for id in held {
            if let Some(order) = gw.orders.get_mut(&id) {
                order.status = PaperStatus::Working;
                let ack = if order.request.parent_id.is_some() {
                    "PreSubmitted"
                } else {
                    "Submitted"
                };
                let update = status_update(id, order, ack);
                gw.outbox.push_back(update);
            }
        }
        if self.settings.auto_fill {
            self.match_orders(gw, &request.instrument);
        }
    }

    fn modify(&self, gw: &mut Gateway, order_id: OrderId, request: &OrderRequest) {
        let Some(order) = gw.orders.get_mut(&order_id).filter(|o| o.status.is_open()) else {
            gw.outbox.push_back(order_error(
                order_id,
                codes::ORDER_NOT_FOUND,
                "Can't find order to modify",
            ));
            return;
        };
        order.request = request.clone();
        let update = status_update(order_id, order, "Submitted");
        gw.outbox.push_back(update);
        if self.settings.auto_fill {
            self.match_orders(gw, &request.instrument);
        }
    }

    /// Fill every working order on `instrument` that the last price makes
    /// marketable.
    fn match_orders(&self, gw: &mut Gateway, instrument: &str) {
        let Some(last) = gw.prices.get(instrument).copied() else {
            return;
        };
        let candidates: Vec<_> = gw
            .orders
            .iter()
            .filter(|(_, o)| o.status == PaperStatus::Working && o.request.instrument == instrument)
            .map(|(id, _)| *id)
            .collect();

        for order_id in candidates {
            let Some(order) = gw.orders.get(&order_id) else {
                continue;
            };
            // A sibling may have been cancelled by an earlier fill in this pass.
            if order.status != PaperStatus::Working {
                continue;
            }
            let parent_done = order.request.parent_id.is_none_or(|parent| {
                gw.orders
                    .get(&parent)
                    .is_some_and(|p| p.status == PaperStatus::Filled)
            });
            if parent_done && is_marketable(&order.request, last) {
                let remaining = order.remaining();
                self.execute(gw, order_id, remaining, last);
            }
        }
    }

    /// Emit executions for `quantity` of an order, chunked if configured.
    fn execute(&self, gw: &mut Gateway, order_id: OrderId, quantity: Decimal, price: Decimal) {
        let chunk = self
            .settings
            .fill_chunk
            .filter(|c| *c > Decimal::ZERO)
            .unwrap_or(quantity);
        let mut left = quantity;

        while left > Decimal::ZERO {
            let Some(order) = gw.orders.get_mut(&order_id) else {
                return;
            };
            let size = left.min(chunk);
            left -= size;
            order.filled += size;
            order.notional = order.notional.saturating_add(size.saturating_mul(price));
            if order.remaining().is_zero() {
                order.status = PaperStatus::Filled;
            }

            let request = order.request.clone();
            let broker_status = if order.status == PaperStatus::Filled {
                "Filled"
            } else {
                "Submitted"
            };
            let update = status_update(order_id, order, broker_status);

            if let Err(err) =
                gw.positions
                    .on_fill(order_id, &request.instrument, request.side, size, price)
            {
                tracing::warn!(order_id = %order_id, error = %err, "Paper position not updated");
            }
            gw.outbox.push_back(InboundMessage::Execution(ExecutionReport {
                exec_id: uuid::Uuid::new_v4().to_string(),
                order_id,
                instrument: request.instrument.clone(),
                side: request.side,
                quantity: size,
                price,
                time: Utc::now(),
            }));
            gw.outbox.push_back(update);
        }

        let filled_child_of = gw
            .orders
            .get(&order_id)
            .filter(|o| o.status == PaperStatus::Filled)
            .and_then(|o| o.request.parent_id);
        if let Some(parent) = filled_child_of {
            let siblings: Vec<_> = gw
                .orders
                .iter()
                .filter(|(id, o)| {
                    **id != order_id && o.request.parent_id == Some(parent) && o.status.is_open()
                })
                .map(|(id, _)| *id)
                .collect();
            for sibling in siblings {
                cancel(gw, sibling);
            }
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

impl BrokerTransport for PaperGateway {
    fn connect(&self, config: &ConnectionConfig, _timeout: Duration) -> Result<Handshake, TransportError> {
        let mut gw = self.inner.lock();
        if let Some(reason) = gw.refuse_next.take() {
            return Err(TransportError::Rejected(reason));
        }
        if gw.connected {
            return Err(TransportError::Rejected(format!(
                "client id {} already connected",
                config.client_id
            )));
        }

        let next_order_id = gw
            .orders
            .keys()
            .next_back()
            .map_or(self.settings.next_valid_id, |id| {
                (id.get() + 1).max(self.settings.next_valid_id)
            });
        gw.connected = true;
        gw.outbox.clear();
        gw.outbox.push_back(InboundMessage::NextValidId(next_order_id));
        gw.outbox.push_back(InboundMessage::Error(BrokerError {
            order_id: None,
            code: codes::MARKET_DATA_FARM_OK,
            message: "Market data farm connection is OK:paper".to_string(),
        }));

        Ok(Handshake {
            next_order_id,
            server_version: self.settings.server_version,
        })
    }

    fn disconnect(&self) {
        let mut gw = self.inner.lock();
        gw.connected = false;
        gw.subscriptions.clear();
        drop(gw);
        self.ready.notify_all();
    }

    fn send(&self, request: &OutboundRequest) -> Result<(), TransportError> {
        let mut gw = self.inner.lock();
        if !gw.connected {
            return Err(TransportError::Closed);
        }
        gw.requests.push(request.clone());
        self.handle(&mut gw, request);
        drop(gw);
        self.ready.notify_all();
        Ok(())
    }

    fn read(&self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut gw = self.inner.lock();
        loop {
            if let Some(message) = gw.outbox.pop_front() {
                return Ok(Some(message));
            }
            if !gw.connected {
                return Err(TransportError::Closed);
            }
            if self.ready.wait_until(&mut gw, deadline).timed_out() {
                return Ok(gw.outbox.pop_front());
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn cancel(gw: &mut Gateway, order_id: OrderId) {
    let Some(order) = gw.orders.get_mut(&order_id) else {
        gw.outbox.push_back(order_error(
            order_id,
            codes::ORDER_NOT_FOUND,
            "Can't find order to cancel",
        ));
        return;
    };
    if !order.status.is_open() {
        gw.outbox.push_back(order_error(
            order_id,
            codes::NOT_CANCELLABLE,
            "Cancel attempted when order is not in a cancellable state",
        ));
        return;
    }
    order.status = PaperStatus::Cancelled;
    let update = status_update(order_id, order, "Cancelled");
    gw.outbox.push_back(update);
}

fn is_marketable(request: &OrderRequest, last: Decimal) -> bool {
    let through = |price: Option<Decimal>, buy_when_at_or_below: bool| {
        price.is_some_and(|p| if buy_when_at_or_below { last <= p } else { last >= p })
    };
    let buy = request.side == Side::Buy;
    match request.order_type {
        OrderType::Market => true,
        OrderType::Limit => through(request.limit_price, buy),
        OrderType::Stop => through(request.stop_price, !buy),
        OrderType::StopLimit => {
            through(request.stop_price, !buy) && through(request.limit_price, buy)
        }
    }
}

fn status_update(order_id: OrderId, order: &PaperOrder, status: &str) -> InboundMessage {
    InboundMessage::OrderStatus(OrderStatusUpdate {
        order_id,
        status: status.to_string(),
        filled: order.filled,
        remaining: order.remaining(),
        avg_fill_price: order.avg_price(),
    })
}

fn order_error(order_id: OrderId, code: i32, message: &str) -> InboundMessage {
    InboundMessage::Error(BrokerError {
        order_id: Some(order_id),
        code,
        message: message.to_string(),
    })
}

fn trade_tick(instrument: &str, price: Decimal) -> InboundMessage {
    InboundMessage::Tick(MarketDataTick {
        instrument: instrument.to_string(),
        kind: TickKind::Trade {
            price,
            size: Decimal::ONE_HUNDRED,
        },
        timestamp: Utc::now(),
    })
}
