//! Application Services
//!
//! The client runtime: shared state, the dispatch funnel, order handling,
//! the connection lifecycle and the strategy runner.

mod client;
mod connection;
mod dispatcher;
mod orders;
mod reconnect;
mod runner;
mod state;
mod worker;

pub use client::BrokerClient;
pub use connection::{ConnectionHealth, ConnectionManager, ConnectionSettings};
pub use dispatcher::{DispatchCounters, EventDispatcher, TransportFault};
pub use orders::{BracketOrderIds, BracketRequest, OrderIdSequence, OrderManager};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use runner::{RunnerError, RunnerSettings, Strategy, StrategyFault, StrategyRunner};
pub use state::{SharedState, StateCounts, StateSnapshot};
