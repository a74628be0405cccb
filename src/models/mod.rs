//! Shared models: canonical book types, TWAP order types, and the
//! subscriber-facing WebSocket protocol.

pub mod book;
pub mod order;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::exchange::ExchangeId;
use crate::models::book::{MergedBook, PriceLevel};

/// Subscription control action requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// An inbound control frame on a subscriber connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub action: SubscriptionAction,
    pub symbol: String,
    pub exchanges: Vec<ExchangeId>,
}

/// An outbound frame pushed to a subscriber connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once when a connection is accepted.
    Welcome { message: String },
    /// Acknowledges a successful subscribe.
    SubscribeSuccess {
        message: String,
        symbol: String,
        exchanges: Vec<ExchangeId>,
    },
    /// Acknowledges a successful unsubscribe.
    UnsubscribeSuccess { message: String, symbol: String },
    /// A malformed or unprocessable request; the connection stays open.
    Error { error: String },
    /// Periodic merged book broadcast.
    OrderBookUpdate {
        symbol: String,
        exchanges: Vec<ExchangeId>,
        best_bid: Option<PriceLevel>,
        best_ask: Option<PriceLevel>,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        timestamp: String,
    },
}

impl ServerMessage {
    /// Builds a broadcast frame from a merged view.
    #[must_use]
    pub fn book_update(book: MergedBook, timestamp: String) -> Self {
        ServerMessage::OrderBookUpdate {
            symbol: book.symbol,
            exchanges: book.exchanges,
            best_bid: book.best_bid,
            best_ask: book.best_ask,
            bids: book.bids,
            asks: book.asks,
            timestamp,
        }
    }
}

/// Produces an ISO 8601 timestamp string from the current system time.
#[must_use]
pub fn iso_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let micros = now.subsec_micros();

    // Convert epoch seconds to date/time components
    let days = secs / 86400;
    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Civil date from days since epoch (algorithm from Howard Hinnant)
    let z = days as i64 + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z",
        y, m, d, hours, minutes, seconds, micros
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_request_deserializes() {
        let json = r#"{"action":"subscribe","symbol":"BTCUSD","exchanges":["binance","coinbase"]}"#;
        let req: ClientRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.action, SubscriptionAction::Subscribe);
        assert_eq!(req.symbol, "BTCUSD");
        assert_eq!(
            req.exchanges,
            vec![ExchangeId::Binance, ExchangeId::Coinbase]
        );
    }

    #[test]
    fn malformed_client_request_is_rejected() {
        let json = r#"{"action":"subscrib","symbol":"BTCUSD","exchanges":[]}"#;
        assert!(serde_json::from_str::<ClientRequest>(json).is_err());
    }

    #[test]
    fn iso_timestamp_format() {
        let ts = iso_timestamp();
        // Should look like "2024-01-15T12:00:00.000000Z"
        assert_eq!(ts.len(), 27);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn server_error_frame_serializes_with_type_tag() {
        let msg = ServerMessage::Error {
            error: "missing symbol".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"], "missing symbol");
    }
}
