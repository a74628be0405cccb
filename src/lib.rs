//! Multi-exchange order book aggregation and TWAP paper-trading engine.
//!
//! Connects to the public order-book feeds of several exchanges, normalizes
//! them into one canonical representation, merges per-symbol views across
//! exchanges, republishes merged views to WebSocket subscribers once per
//! tick, and simulates TWAP order execution against the live merged book.

pub mod aggregator;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod models;
pub mod server;

pub use error::{Result, TwapdError};
