//! Application Layer - The broker client runtime.
//!
//! Services that own the broker session, turn inbound broker messages into
//! shared state, and coordinate the strategy thread with the read thread.

/// Port interface for the broker transport.
pub mod ports;

/// Runtime services: connection, dispatch, state, orders and strategy runner.
pub mod services;
