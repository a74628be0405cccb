//! Crate-level error types.
//!
//! [`TwapdError`] unifies every error source (configuration, WebSocket,
//! JSON, HTTP, order validation) behind a single enum so callers can match
//! on the variant they care about while still using the `?` operator for
//! easy propagation.

use crate::exchange::ExchangeId;
use crate::models::order::OrderId;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TwapdError>;

/// Top-level error type returned by all public APIs.
#[derive(Debug, thiserror::Error)]
pub enum TwapdError {
    /// Configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A WebSocket operation (connect, send, receive) failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// A socket-level operation (bind, accept) failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An HTTP request (REST depth snapshot) failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// An exchange sent a payload that violates its own protocol:
    /// schema mismatch, checksum failure, or sequence gap.
    #[error("protocol error from {exchange}: {reason}")]
    Protocol {
        exchange: ExchangeId,
        reason: String,
    },

    /// An order submission was rejected during validation.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// The referenced order does not exist.
    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    /// An internal channel closed unexpectedly. The affected component
    /// shuts down; unrelated adapters, orders, and subscriptions keep
    /// running.
    #[error("internal channel closed: {0}")]
    ChannelClosed(&'static str),
}
