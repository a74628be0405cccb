//! Coinbase level2 feed codec.
//!
//! Coinbase sends one full snapshot per subscription followed by `l2update`
//! diffs. The channel carries no gap-checkable sequence number, so resync
//! is a reconnect (which yields a fresh snapshot).

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;

use super::{Decoded, ExchangeId, FeedCodec, split_symbol};
use crate::error::{Result, TwapdError};
use crate::models::book::{BookUpdate, PriceLevel};

const WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

/// Codec for the Coinbase `level2_batch` channel.
pub struct CoinbaseCodec;

#[derive(Debug, Deserialize)]
struct Snapshot {
    product_id: String,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct L2Update {
    product_id: String,
    /// Each change is `[side, price, new_qty]`; qty 0 removes the level.
    changes: Vec<[String; 3]>,
}

impl CoinbaseCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn protocol(&self, reason: impl Into<String>) -> TwapdError {
        TwapdError::Protocol {
            exchange: ExchangeId::Coinbase,
            reason: reason.into(),
        }
    }

    /// Canonical `BTCUSD` to wire `BTC-USD`.
    fn wire_symbol(&self, canonical: &str) -> String {
        match split_symbol(canonical) {
            Some((base, quote)) => format!("{base}-{quote}"),
            None => canonical.to_string(),
        }
    }

    fn canonical_symbol(&self, wire: &str) -> String {
        wire.replace('-', "").to_uppercase()
    }

    fn parse_level(&self, price: &str, qty: &str) -> Result<PriceLevel> {
        let price = Decimal::from_str(price)
            .map_err(|e| self.protocol(format!("bad price {price:?}: {e}")))?;
        let qty = Decimal::from_str(qty)
            .map_err(|e| self.protocol(format!("bad qty {qty:?}: {e}")))?;
        Ok(PriceLevel::new(price, qty))
    }
}

impl Default for CoinbaseCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedCodec for CoinbaseCodec {
    fn id(&self) -> ExchangeId {
        ExchangeId::Coinbase
    }

    fn ws_url(&self, _symbols: &[String]) -> String {
        WS_URL.to_string()
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        let product_ids: Vec<String> = symbols.iter().map(|s| self.wire_symbol(s)).collect();
        vec![
            serde_json::json!({
                "type": "subscribe",
                "product_ids": product_ids,
                "channels": ["level2_batch"],
            })
            .to_string(),
        ]
    }

    fn decode(&mut self, text: &str) -> Result<Decoded> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| self.protocol(format!("invalid json: {e}")))?;

        match value.get("type").and_then(|t| t.as_str()) {
            Some("snapshot") => {
                let snapshot: Snapshot = serde_json::from_value(value)
                    .map_err(|e| self.protocol(format!("bad snapshot: {e}")))?;
                let bids = snapshot
                    .bids
                    .iter()
                    .map(|[p, q]| self.parse_level(p, q))
                    .collect::<Result<Vec<_>>>()?;
                let asks = snapshot
                    .asks
                    .iter()
                    .map(|[p, q]| self.parse_level(p, q))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Decoded::Updates(vec![BookUpdate::Snapshot {
                    exchange: ExchangeId::Coinbase,
                    symbol: self.canonical_symbol(&snapshot.product_id),
                    bids,
                    asks,
                    sequence: None,
                }]))
            }
            Some("l2update") => {
                let update: L2Update = serde_json::from_value(value)
                    .map_err(|e| self.protocol(format!("bad l2update: {e}")))?;
                let mut bids = Vec::new();
                let mut asks = Vec::new();
                for [side, price, qty] in &update.changes {
                    let level = self.parse_level(price, qty)?;
                    match side.as_str() {
                        "buy" => bids.push(level),
                        "sell" => asks.push(level),
                        other => {
                            return Err(self.protocol(format!("unknown change side {other:?}")));
                        }
                    }
                }
                Ok(Decoded::Updates(vec![BookUpdate::Diff {
                    exchange: ExchangeId::Coinbase,
                    symbol: self.canonical_symbol(&update.product_id),
                    bids,
                    asks,
                    sequence: None,
                }]))
            }
            Some("error") => {
                let reason = value
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unspecified");
                Err(self.protocol(format!("feed error: {reason}")))
            }
            // Subscription acks and heartbeats.
            Some(_) => Ok(Decoded::Ignore),
            None => Err(self.protocol("message without type field")),
        }
    }

    fn reset(&mut self) {
        // Stateless; the per-connection snapshot re-anchors the book.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn wire_symbol_inserts_dash() {
        let codec = CoinbaseCodec::new();
        assert_eq!(codec.wire_symbol("BTCUSD"), "BTC-USD");
        assert_eq!(codec.wire_symbol("ETHUSDT"), "ETH-USDT");
    }

    #[test]
    fn snapshot_decodes() {
        let mut codec = CoinbaseCodec::new();
        let text = r#"{
            "type": "snapshot",
            "product_id": "BTC-USD",
            "bids": [["50000.00", "1.2"], ["49999.00", "0.5"]],
            "asks": [["50001.00", "0.8"]]
        }"#;
        match codec.decode(text).unwrap() {
            Decoded::Updates(updates) => match &updates[0] {
                BookUpdate::Snapshot {
                    symbol,
                    bids,
                    asks,
                    sequence,
                    ..
                } => {
                    assert_eq!(symbol, "BTCUSD");
                    assert_eq!(bids.len(), 2);
                    assert_eq!(asks[0], PriceLevel::new(dec!(50001.00), dec!(0.8)));
                    assert!(sequence.is_none());
                }
                other => panic!("expected snapshot, got {other:?}"),
            },
            other => panic!("expected updates, got {other:?}"),
        }
    }

    #[test]
    fn l2update_splits_sides() {
        let mut codec = CoinbaseCodec::new();
        let text = r#"{
            "type": "l2update",
            "product_id": "BTC-USD",
            "changes": [["buy", "50000.00", "0"], ["sell", "50001.00", "2.5"]]
        }"#;
        match codec.decode(text).unwrap() {
            Decoded::Updates(updates) => match &updates[0] {
                BookUpdate::Diff { bids, asks, .. } => {
                    assert_eq!(bids[0].qty, Decimal::ZERO);
                    assert_eq!(asks[0].qty, dec!(2.5));
                }
                other => panic!("expected diff, got {other:?}"),
            },
            other => panic!("expected updates, got {other:?}"),
        }
    }

    #[test]
    fn subscription_ack_is_ignored() {
        let mut codec = CoinbaseCodec::new();
        let text = r#"{"type":"subscriptions","channels":[]}"#;
        assert!(matches!(codec.decode(text).unwrap(), Decoded::Ignore));
    }

    #[test]
    fn feed_error_is_a_protocol_error() {
        let mut codec = CoinbaseCodec::new();
        let text = r#"{"type":"error","message":"Failed to subscribe"}"#;
        let err = codec.decode(text).unwrap_err();
        assert!(err.to_string().contains("Failed to subscribe"));
    }

    #[test]
    fn unknown_side_is_rejected() {
        let mut codec = CoinbaseCodec::new();
        let text = r#"{
            "type": "l2update",
            "product_id": "BTC-USD",
            "changes": [["hold", "50000.00", "1"]]
        }"#;
        assert!(codec.decode(text).is_err());
    }
}
