//! Order Flow Integration Tests
//!
//! Drives orders through a client connected to the paper gateway and checks
//! what the strategy side observes in shared state.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal_macros::dec;

use broker_client::{
    BracketRequest, BrokerClient, ConnectionConfig, ConnectionSettings, OrderChanges, OrderError,
    OrderId, OrderRequest, OrderStatus, OutboundRequest, PaperGateway, PaperSettings, Side,
};

fn connected(auto_fill: bool) -> (BrokerClient, Arc<PaperGateway>) {
    let gateway = Arc::new(PaperGateway::new(PaperSettings {
        auto_fill,
        ..PaperSettings::default()
    }));
    let settings = ConnectionSettings {
        read_poll_interval: Duration::from_millis(10),
        ..ConnectionSettings::default()
    };
    let client = BrokerClient::new(gateway.clone(), settings);
    client
        .connection()
        .connect(ConnectionConfig::new("127.0.0.1", 7497, 7))
        .unwrap();
    (client, gateway)
}

fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn status_of(client: &BrokerClient, order_id: OrderId) -> Option<OrderStatus> {
    client.state().order(order_id).map(|o| o.status())
}

#[test]
fn partial_fills_accumulate_into_order_and_position() {
    let (client, gateway) = connected(false);

    let order_id = client
        .orders()
        .submit(OrderRequest::limit("AAPL", Side::Buy, dec!(100), dec!(101)))
        .unwrap();
    eventually("ack", || {
        status_of(&client, order_id) == Some(OrderStatus::Acknowledged)
    });

    assert!(gateway.fill(order_id, dec!(40), dec!(100)));
    eventually("partial fill", || {
        status_of(&client, order_id) == Some(OrderStatus::PartiallyFilled)
    });
    let partial = client.state().order(order_id).unwrap();
    assert_eq!(partial.filled_quantity(), dec!(40));
    assert_eq!(partial.remaining_quantity(), dec!(60));

    assert!(gateway.fill(order_id, dec!(60), dec!(101)));
    eventually("full fill", || {
        status_of(&client, order_id) == Some(OrderStatus::Filled)
    });

    let order = client.state().order(order_id).unwrap();
    assert_eq!(order.filled_quantity(), dec!(100));
    assert_eq!(order.avg_fill_price(), dec!(100.6));

    let position = client.state().position("AAPL").unwrap();
    assert_eq!(position.net_quantity(), dec!(100));
    assert_eq!(position.avg_cost(), dec!(100.6));
    assert_eq!(position.last_order_id(), Some(order_id));

    client.connection().disconnect();
}

#[test]
fn cancelling_a_filled_order_is_refused_without_a_request() {
    let (client, gateway) = connected(true);
    gateway.set_price("MSFT", dec!(410));

    let order_id = client
        .orders()
        .submit(OrderRequest::market("MSFT", Side::Sell, dec!(5)))
        .unwrap();
    eventually("fill", || {
        status_of(&client, order_id) == Some(OrderStatus::Filled)
    });
    let requests_before = gateway.requests().len();
    let before = client.state().order(order_id).unwrap();

    let err = client.orders().cancel(order_id).unwrap_err();
    assert_eq!(
        err,
        OrderError::TerminalState {
            order_id,
            status: OrderStatus::Filled,
        }
    );
    assert_eq!(gateway.requests().len(), requests_before);
    assert_eq!(client.state().order(order_id).unwrap(), before);

    let position = client.state().position("MSFT").unwrap();
    assert_eq!(position.net_quantity(), dec!(-5));

    client.connection().disconnect();
}

#[test]
fn ids_stay_unique_across_rejected_and_cancelled_orders() {
    let (client, gateway) = connected(false);
    let limit = || OrderRequest::limit("AAPL", Side::Buy, dec!(1), dec!(90));

    let rejected = client.orders().submit(limit()).unwrap();
    let cancelled = client.orders().submit(limit()).unwrap();
    eventually("acks", || {
        status_of(&client, cancelled) == Some(OrderStatus::Acknowledged)
    });

    assert!(gateway.reject(rejected, "Order size exceeds limit"));
    client.orders().cancel(cancelled).unwrap();
    eventually("terminal states", || {
        status_of(&client, rejected) == Some(OrderStatus::Rejected)
            && status_of(&client, cancelled) == Some(OrderStatus::Cancelled)
    });

    // An invalid request never consumes an id.
    let invalid = client
        .orders()
        .submit(OrderRequest::limit("AAPL", Side::Buy, dec!(0), dec!(90)));
    assert!(matches!(invalid, Err(OrderError::InvalidRequest(_))));

    let later: Vec<_> = (0..3)
        .map(|_| client.orders().submit(limit()).unwrap())
        .collect();

    let mut ids = HashSet::new();
    for id in [rejected, cancelled].into_iter().chain(later.iter().copied()) {
        assert!(ids.insert(id), "order id {id} reused");
    }
    assert!(later.iter().all(|id| *id > cancelled));

    client.connection().disconnect();
}

#[test]
fn broker_rejection_surfaces_in_state() {
    let (client, gateway) = connected(false);

    let order_id = client
        .orders()
        .submit(OrderRequest::stop("AAPL", Side::Sell, dec!(10), dec!(95)))
        .unwrap();
    assert!(gateway.reject(order_id, "Stop price too far from market"));
    eventually("rejection", || {
        status_of(&client, order_id) == Some(OrderStatus::Rejected)
    });

    let order = client.state().order(order_id).unwrap();
    assert!(order.last_error().unwrap().contains("201"));
    assert!(
        client
            .state()
            .recent_errors()
            .iter()
            .any(|e| e.code == 201 && e.order_id == Some(order_id))
    );
    assert!(client.state().open_orders().is_empty());

    client.connection().disconnect();
}

#[test]
fn bracket_exit_cancels_sibling() {
    let (client, gateway) = connected(true);
    gateway.set_price("AAPL", dec!(100));

    let ids = client
        .orders()
        .submit_bracket(&BracketRequest {
            instrument: "AAPL".to_string(),
            side: Side::Buy,
            quantity: dec!(10),
            entry_price: dec!(100),
            take_profit_price: dec!(105),
            stop_loss_price: dec!(95),
            outside_regular_hours: false,
        })
        .unwrap();
    assert_eq!(ids.take_profit.get(), ids.parent.get() + 1);
    assert_eq!(ids.stop_loss.get(), ids.parent.get() + 2);

    eventually("entry fill", || {
        status_of(&client, ids.parent) == Some(OrderStatus::Filled)
    });
    eventually("children working", || {
        status_of(&client, ids.take_profit) == Some(OrderStatus::Acknowledged)
            && status_of(&client, ids.stop_loss) == Some(OrderStatus::Acknowledged)
    });
    assert_eq!(
        client.state().position("AAPL").unwrap().net_quantity(),
        dec!(10)
    );

    gateway.set_price("AAPL", dec!(106));
    eventually("take profit", || {
        status_of(&client, ids.take_profit) == Some(OrderStatus::Filled)
            && status_of(&client, ids.stop_loss) == Some(OrderStatus::Cancelled)
    });

    let position = client.state().position("AAPL").unwrap();
    assert!(position.is_flat());
    assert_eq!(position.avg_cost(), dec!(0));

    client.connection().disconnect();
}

#[test]
fn inconsistent_bracket_is_refused_before_sending() {
    let (client, gateway) = connected(false);

    let result = client.orders().submit_bracket(&BracketRequest {
        instrument: "AAPL".to_string(),
        side: Side::Sell,
        quantity: dec!(10),
        entry_price: dec!(100),
        take_profit_price: dec!(105),
        stop_loss_price: dec!(110),
        outside_regular_hours: false,
    });

    assert!(matches!(result, Err(OrderError::InvalidRequest(_))));
    assert!(gateway.requests().is_empty());
    assert!(client.state().orders().is_empty());

    client.connection().disconnect();
}

#[test]
fn cancel_all_closes_every_open_order() {
    let (client, gateway) = connected(false);

    let first = client
        .orders()
        .submit(OrderRequest::limit("AAPL", Side::Buy, dec!(5), dec!(90)))
        .unwrap();
    let second = client
        .orders()
        .submit(OrderRequest::limit("MSFT", Side::Sell, dec!(3), dec!(500)))
        .unwrap();
    eventually("acks", || client.state().open_orders().len() == 2);

    client.orders().cancel_all().unwrap();
    assert_eq!(gateway.requests().last(), Some(&OutboundRequest::GlobalCancel));

    eventually("cancellations", || {
        status_of(&client, first) == Some(OrderStatus::Cancelled)
            && status_of(&client, second) == Some(OrderStatus::Cancelled)
    });
    assert!(client.state().open_orders().is_empty());

    client.connection().disconnect();
}

#[test]
fn modify_reprices_a_working_order() {
    let (client, gateway) = connected(false);

    let order_id = client
        .orders()
        .submit(OrderRequest::limit("AAPL", Side::Buy, dec!(10), dec!(95)))
        .unwrap();
    eventually("ack", || {
        status_of(&client, order_id) == Some(OrderStatus::Acknowledged)
    });

    client
        .orders()
        .modify(order_id, &OrderChanges::default().limit_price(dec!(99)))
        .unwrap();

    let order = client.state().order(order_id).unwrap();
    assert_eq!(order.limit_price(), Some(dec!(99)));
    assert_eq!(order.status(), OrderStatus::Acknowledged);
    match gateway.requests().last() {
        Some(OutboundRequest::ModifyOrder { order_id: sent, request }) => {
            assert_eq!(*sent, order_id);
            assert_eq!(request.limit_price, Some(dec!(99)));
            assert_eq!(request.quantity, dec!(10));
        }
        other => panic!("expected a modify request, got {other:?}"),
    }

    // Quantity cannot drop below what is already filled.
    assert!(gateway.fill(order_id, dec!(6), dec!(99)));
    eventually("partial fill", || {
        status_of(&client, order_id) == Some(OrderStatus::PartiallyFilled)
    });
    let err = client
        .orders()
        .modify(order_id, &OrderChanges::default().quantity(dec!(5)))
        .unwrap_err();
    assert!(matches!(err, OrderError::InvalidRequest(_)));

    client.connection().disconnect();
}

#[test]
fn orders_are_refused_while_disconnected() {
    let gateway = Arc::new(PaperGateway::default());
    let client = BrokerClient::new(gateway.clone(), ConnectionSettings::default());

    let err = client
        .orders()
        .submit(OrderRequest::market("AAPL", Side::Buy, dec!(1)))
        .unwrap_err();

    assert!(matches!(err, OrderError::Transport(_)));
    assert!(gateway.requests().is_empty());
}
