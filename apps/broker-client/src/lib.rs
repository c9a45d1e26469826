#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Broker Client - Strategy Runtime for Callback-Based Broker APIs
//!
//! Lets a strategy talk to a broker whose API pushes asynchronous callbacks,
//! without the strategy ever touching those callbacks directly. The broker's
//! network thread and the strategy thread only meet in [`SharedState`].
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Orders, positions, market data and connection types
//!   - `order`: Order state machine, requests and errors
//!   - `position`: Fill-derived position tracking
//!   - `market_data`: Ticks and per-instrument snapshots
//!   - `connection`: Session configuration and status
//!
//! - **Application**: The runtime itself
//!   - `ports`: The opaque broker transport
//!   - `services`: Connection lifecycle, dispatch, shared state, orders, strategy runner
//!
//! - **Infrastructure**: Adapters and ambient concerns
//!   - `config`: Environment configuration
//!   - `paper`: In-memory simulated gateway
//!   - `health`: Health check HTTP endpoint
//!   - `metrics` / `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!                  read thread                          strategy thread
//! Transport ──► EventDispatcher ──► SharedState ◄──── Strategy (read-only)
//!    ▲                                   ▲                  │
//!    │                                   │                  ▼
//!    └──────── ConnectionManager ◄── OrderManager ◄─────────┘
//!               (serialized sends)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core trading types with no I/O.
pub mod domain;

/// Application layer - Runtime services and the transport port.
pub mod application;

/// Infrastructure layer - Adapters and ambient concerns.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionConfig, ConnectionError, ConnectionStatus};
pub use domain::market_data::{MarketDataSnapshot, MarketDataTick, TickKind};
pub use domain::order::{
    Order, OrderChanges, OrderError, OrderId, OrderRequest, OrderStatus, OrderType, Side,
};
pub use domain::position::{Fill, Position, PositionTracker};

// Transport port
pub use application::ports::{
    BrokerError, BrokerTransport, ExecutionReport, Handshake, InboundMessage, OrderStatusUpdate,
    OutboundRequest, PositionReport, TransportError,
};

// Runtime services
pub use application::services::{
    BracketOrderIds, BracketRequest, BrokerClient, ConnectionHealth, ConnectionManager,
    ConnectionSettings, DispatchCounters, EventDispatcher, OrderIdSequence, OrderManager,
    ReconnectConfig, ReconnectPolicy, RunnerError, RunnerSettings, SharedState, StateCounts,
    StateSnapshot, Strategy, StrategyFault, StrategyRunner, TransportFault,
};

// Infrastructure
pub use infrastructure::config::{ClientConfig, ConfigError, ServerSettings};
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::metrics::init_metrics;
pub use infrastructure::paper::{PaperGateway, PaperSettings};
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
