//! Domain Layer - Core trading types and rules.
//!
//! Everything here is plain data plus the rules that govern it. Nothing in
//! this layer performs I/O or takes a lock.

/// Session configuration, status and errors.
pub mod connection;

/// Market data ticks and snapshots.
pub mod market_data;

/// Orders and the order state machine.
pub mod order;

/// Fill-derived positions.
pub mod position;
