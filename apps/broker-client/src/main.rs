//! Broker Client Binary
//!
//! Runs a demo strategy against the in-memory paper gateway with a random-walk
//! price feed, and serves the health endpoint until interrupted.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin broker-client
//! ```
//!
//! # Environment Variables
//!
//! - `BROKER_HOST` / `BROKER_PORT` / `BROKER_CLIENT_ID`: session endpoint (default: 127.0.0.1:7497, id 1)
//! - `BROKER_HANDSHAKE_TIMEOUT_SECS`, `BROKER_READ_POLL_MS`, `BROKER_JOIN_TIMEOUT_SECS`
//! - `RUNNER_SHUTDOWN_TIMEOUT_SECS`: bound on strategy shutdown (default: 10)
//! - `BROKER_RECONNECT_*`: backoff used by the demo strategy after a dropped session
//! - `BROKER_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `BROKER_DEMO_INSTRUMENT`: instrument the demo trades (default: SPY)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::{Duration, Instant};

use broker_client::infrastructure::telemetry;
use broker_client::{
    BrokerClient, BrokerTransport, ClientConfig, ConnectionStatus, HealthServer, HealthServerState,
    OrderRequest, PaperGateway, PaperSettings, ReconnectConfig, ReconnectPolicy, Side, Strategy,
    StrategyRunner, init_metrics,
};
use rand::Rng;
use rust_decimal::Decimal;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Price the random walk starts from.
const START_PRICE: Decimal = Decimal::from_parts(50_000, 0, 0, false, 2);

/// Interval between simulated trades.
const PRICE_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init()?;

    tracing::info!("Starting Broker Client");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics()?;

    let config = ClientConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let gateway = Arc::new(PaperGateway::new(PaperSettings::default()));
    gateway.set_price(&config.demo_instrument, START_PRICE);

    let transport: Arc<dyn BrokerTransport> = gateway.clone();
    let client = BrokerClient::new(transport, config.session);

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        client.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn the simulated price feed
    let feed_gateway = Arc::clone(&gateway);
    let feed_instrument = config.demo_instrument.clone();
    let feed_shutdown = shutdown_token.clone();
    tokio::spawn(async move {
        run_price_walk(&feed_gateway, &feed_instrument, feed_shutdown).await;
    });

    let runner = Arc::new(StrategyRunner::new(
        client,
        config.connection.clone(),
        config.runner,
    ));
    let strategy = DemoStrategy::new(config.demo_instrument.clone(), config.reconnect.clone());

    let launching = Arc::clone(&runner);
    tokio::task::spawn_blocking(move || launching.launch(strategy)).await??;

    tracing::info!("Broker client ready");

    await_shutdown(shutdown_token).await;

    let stopping = Arc::clone(&runner);
    match tokio::task::spawn_blocking(move || stopping.stop()).await? {
        Ok(()) => tracing::info!("Strategy stopped"),
        Err(e) => tracing::error!(error = %e, "Strategy did not stop cleanly"),
    }

    tracing::info!("Broker client stopped");
    Ok(())
}

// =============================================================================
// Demo Strategy
// =============================================================================

/// Buys once the first price arrives, then reports market data and position
/// until cancelled. Re-establishes a dropped session with backoff.
struct DemoStrategy {
    instrument: String,
    reconnect: ReconnectConfig,
    report_every: Duration,
    entered: bool,
}

impl DemoStrategy {
    fn new(instrument: String, reconnect: ReconnectConfig) -> Self {
        Self {
            instrument,
            reconnect,
            report_every: Duration::from_secs(5),
            entered: false,
        }
    }

    fn resubscribe(&self, client: &BrokerClient) -> anyhow::Result<()> {
        client.subscribe_market_data(&self.instrument)?;
        client.request_positions()?;
        Ok(())
    }

    fn report(&self, client: &BrokerClient) {
        let state = client.state();
        let snapshot = state.market_data(&self.instrument);
        let position = state.position(&self.instrument);
        tracing::info!(
            instrument = %self.instrument,
            last = ?snapshot.as_ref().and_then(|s| s.last_price),
            bid = ?snapshot.as_ref().and_then(|s| s.bid),
            ask = ?snapshot.as_ref().and_then(|s| s.ask),
            position = %position.as_ref().map_or(Decimal::ZERO, |p| p.net_quantity()),
            avg_cost = %position.as_ref().map_or(Decimal::ZERO, |p| p.avg_cost()),
            open_orders = state.open_orders().len(),
            "Strategy report"
        );
    }
}

impl Strategy for DemoStrategy {
    fn name(&self) -> &str {
        "demo"
    }

    fn run(&mut self, client: &BrokerClient, cancel: &CancellationToken) -> anyhow::Result<()> {
        self.resubscribe(client)?;
        let mut last_report = Instant::now();

        while !cancel.is_cancelled() {
            if client.state().connection_status() == ConnectionStatus::Failed {
                tracing::warn!("Session lost, reconnecting");
                let mut policy = ReconnectPolicy::new(self.reconnect.clone());
                client
                    .connection()
                    .reconnect_with_backoff(&mut policy, cancel)?;
                self.resubscribe(client)?;
            }

            if !self.entered
                && client
                    .state()
                    .market_data(&self.instrument)
                    .is_some_and(|s| s.last_price.is_some())
            {
                let order_id = client.orders().submit(OrderRequest::market(
                    &*self.instrument,
                    Side::Buy,
                    Decimal::TEN,
                ))?;
                tracing::info!(order_id = %order_id, "Entry order submitted");
                self.entered = true;
            }

            if last_report.elapsed() >= self.report_every {
                self.report(client);
                last_report = Instant::now();
            }

            cancel_aware_sleep(cancel, Duration::from_millis(200));
        }

        self.report(client);
        Ok(())
    }
}

fn cancel_aware_sleep(cancel: &CancellationToken, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !cancel.is_cancelled() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
}

// =============================================================================
// Price Feed
// =============================================================================

/// Random walk of at most 10 basis points per step, with a one-cent quote
/// around each trade.
async fn run_price_walk(gateway: &PaperGateway, instrument: &str, shutdown: CancellationToken) {
    let mut price = START_PRICE;
    let mut interval = tokio::time::interval(PRICE_INTERVAL);
    let spread = Decimal::new(1, 2);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let step = rand::rng().random_range(-10_i64..=10);
        price = (price * (Decimal::ONE + Decimal::new(step, 4))).round_dp(2);
        price = price.max(spread);

        gateway.push_quote(instrument, price - spread, price + spread);
        gateway.set_price(instrument, price);
    }

    tracing::debug!("Price feed stopped");
}

// =============================================================================
// Process Plumbing
// =============================================================================

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ClientConfig) {
    tracing::info!(
        endpoint = %config.connection.endpoint(),
        client_id = config.connection.client_id,
        health_port = config.server.health_port,
        instrument = %config.demo_instrument,
        "Configuration loaded"
    );
    tracing::debug!(
        handshake_timeout_ms = config.session.handshake_timeout.as_millis(),
        read_poll_ms = config.session.read_poll_interval.as_millis(),
        shutdown_timeout_ms = config.runner.shutdown_timeout.as_millis(),
        reconnect_max_attempts = config.reconnect.max_attempts,
        "Session settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!("Graceful shutdown started");
}
