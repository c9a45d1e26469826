//! Session Lifecycle Integration Tests
//!
//! Connection loss, reconnects, strategy faults and shutdown, plus reads
//! racing the dispatch thread.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use broker_client::{
    BrokerClient, ConnectionConfig, ConnectionError, ConnectionSettings, ConnectionStatus,
    OrderError, OrderRequest, PaperGateway, PaperSettings, ReconnectConfig, ReconnectPolicy,
    RunnerError, RunnerSettings, Side, StrategyFault, StrategyRunner,
};

fn config() -> ConnectionConfig {
    ConnectionConfig::new("127.0.0.1", 7497, 3)
}

fn fast_settings() -> ConnectionSettings {
    ConnectionSettings {
        handshake_timeout: Duration::from_secs(1),
        read_poll_interval: Duration::from_millis(10),
        join_timeout: Duration::from_secs(1),
    }
}

fn client_with(settings: PaperSettings) -> (BrokerClient, Arc<PaperGateway>) {
    let gateway = Arc::new(PaperGateway::new(settings));
    let client = BrokerClient::new(gateway.clone(), fast_settings());
    (client, gateway)
}

fn runner(client: BrokerClient) -> StrategyRunner {
    StrategyRunner::new(
        client,
        config(),
        RunnerSettings {
            shutdown_timeout: Duration::from_secs(2),
        },
    )
}

fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn idle_until_cancelled(
    iterations: Arc<AtomicU64>,
) -> impl FnMut(&BrokerClient, &CancellationToken) -> anyhow::Result<()> + Send + 'static {
    move |_client: &BrokerClient, cancel: &CancellationToken| -> anyhow::Result<()> {
        while !cancel.is_cancelled() {
            iterations.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

#[test]
fn dropped_session_fails_without_stopping_strategy() {
    let (client, gateway) = client_with(PaperSettings::default());
    let runner = runner(client.clone());
    let iterations = Arc::new(AtomicU64::new(0));

    runner.launch(idle_until_cancelled(Arc::clone(&iterations))).unwrap();
    assert_eq!(client.state().connection_status(), ConnectionStatus::Connected);

    gateway.drop_connection("connection reset by peer");
    eventually("failed status", || {
        client.state().connection_status() == ConnectionStatus::Failed
    });
    assert!(runner.is_running());

    let err = client
        .orders()
        .submit(OrderRequest::market("AAPL", Side::Buy, dec!(1)))
        .unwrap_err();
    assert_eq!(
        err,
        OrderError::Transport(ConnectionError::NotConnected(ConnectionStatus::Failed))
    );

    let seen = iterations.load(Ordering::Relaxed);
    eventually("strategy still looping", || {
        iterations.load(Ordering::Relaxed) > seen
    });

    client.connection().reconnect().unwrap();
    assert_eq!(client.state().connection_status(), ConnectionStatus::Connected);
    assert_eq!(client.connection().health().reconnects, 1);
    assert_eq!(client.connection().health().sessions, 2);

    gateway.set_price("AAPL", dec!(187.5));
    let order_id = client
        .orders()
        .submit(OrderRequest::market("AAPL", Side::Buy, dec!(1)))
        .unwrap();
    eventually("fill on new session", || {
        client
            .state()
            .position("AAPL")
            .is_some_and(|p| p.last_order_id() == Some(order_id))
    });

    runner.stop().unwrap();
    assert!(!runner.is_running());
    assert!(!gateway.is_connected());
    assert_eq!(client.state().connection_status(), ConnectionStatus::Disconnected);
}

#[test]
fn backoff_reconnect_survives_refused_handshake() {
    let (client, gateway) = client_with(PaperSettings::default());
    client.connection().connect(config()).unwrap();

    gateway.drop_connection("gateway restarting");
    eventually("failed status", || {
        client.connection().status() == ConnectionStatus::Failed
    });
    gateway.refuse_next_connection("client id in use");

    let mut policy = ReconnectPolicy::new(ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        jitter_factor: 0.0,
        max_attempts: 5,
    });
    client
        .connection()
        .reconnect_with_backoff(&mut policy, &CancellationToken::new())
        .unwrap();

    assert!(client.connection().is_connected());
    assert_eq!(policy.attempt_count(), 0);
    let health = client.connection().health();
    assert_eq!(health.reconnects, 2);
    assert!(health.last_error.unwrap().contains("client id in use"));

    client.connection().disconnect();
}

#[test]
fn panicking_strategy_tears_everything_down() {
    let (client, gateway) = client_with(PaperSettings::default());
    let runner = runner(client.clone());

    let result = runner.start(
        |client: &BrokerClient, _cancel: &CancellationToken| -> anyhow::Result<()> {
            client.subscribe_market_data("AAPL")?;
            panic!("position limit breached");
        },
    );

    match result {
        Err(RunnerError::Strategy(StrategyFault::Panicked(message))) => {
            assert!(message.contains("position limit breached"));
        }
        other => panic!("expected a panic fault, got {other:?}"),
    }
    assert!(!runner.is_running());
    assert!(!gateway.is_connected());
    assert_eq!(client.state().connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(runner.stop(), Ok(()));

    // The runner can host a new strategy afterwards.
    runner
        .start(|client: &BrokerClient, _cancel: &CancellationToken| -> anyhow::Result<()> {
            anyhow::ensure!(client.connection().is_connected(), "not connected");
            Ok(())
        })
        .unwrap();
}

#[test]
fn market_data_and_positions_flow_to_state() {
    let (client, gateway) = client_with(PaperSettings::default());
    client.connection().connect(config()).unwrap();

    client.subscribe_market_data("SPY").unwrap();
    assert_eq!(gateway.subscriptions(), vec!["SPY".to_string()]);

    gateway.set_price("SPY", dec!(512.30));
    gateway.push_quote("SPY", dec!(512.29), dec!(512.31));
    eventually("quote", || {
        client
            .state()
            .market_data("SPY")
            .is_some_and(|s| s.bid.is_some() && s.ask.is_some())
    });
    let snapshot = client.state().market_data("SPY").unwrap();
    assert_eq!(snapshot.last_price, Some(dec!(512.30)));
    assert_eq!(snapshot.mid(), Some(dec!(512.30)));

    client
        .orders()
        .submit(OrderRequest::market("SPY", Side::Buy, dec!(4)))
        .unwrap();
    eventually("fill", || client.state().position("SPY").is_some());

    client.request_positions().unwrap();
    eventually("broker position", || {
        client.state().broker_position("SPY").is_some()
    });
    let reported = client.state().broker_position("SPY").unwrap();
    assert_eq!(reported.quantity, dec!(4));
    assert_eq!(reported.avg_cost, dec!(512.30));
    assert_eq!(reported.account, "DU0000001");

    client.unsubscribe_market_data("SPY").unwrap();
    assert!(gateway.subscriptions().is_empty());

    client.connection().disconnect();
}

#[test]
fn snapshots_never_split_a_fill() {
    let (client, gateway) = client_with(PaperSettings {
        auto_fill: false,
        ..PaperSettings::default()
    });
    client.connection().connect(config()).unwrap();

    let order_id = client
        .orders()
        .submit(OrderRequest::limit("QQQ", Side::Buy, dec!(200), dec!(440)))
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let state = client.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut checked = 0_u64;
                while !done.load(Ordering::Acquire) {
                    let snapshot = state.state().snapshot();
                    let filled: Decimal = snapshot
                        .orders
                        .iter()
                        .filter(|o| o.instrument() == "QQQ")
                        .map(broker_client::Order::filled_quantity)
                        .sum();
                    let net = snapshot
                        .positions
                        .iter()
                        .find(|p| p.instrument() == "QQQ")
                        .map_or(Decimal::ZERO, broker_client::Position::net_quantity);
                    assert_eq!(filled, net, "snapshot split a fill");
                    checked += 1;
                }
                checked
            })
        })
        .collect();

    for _ in 0..200 {
        assert!(gateway.fill(order_id, dec!(1), dec!(439.5)));
    }
    eventually("all fills applied", || {
        client
            .state()
            .position("QQQ")
            .is_some_and(|p| p.net_quantity() == dec!(200))
    });
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    let counters = client.dispatch_counters();
    assert_eq!(counters.dropped, 0);

    client.connection().disconnect();
}
