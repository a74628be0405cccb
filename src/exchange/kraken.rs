//! Kraken WebSocket V2 book feed codec.
//!
//! Kraken sends one snapshot per subscription followed by incremental
//! updates, each carrying a CRC32 checksum over the top ten levels of both
//! sides. The codec mirrors the book locally so every message can be
//! verified; a checksum mismatch discards the mirror and forces a resync.
//! Downstream it always emits full snapshots, so the aggregator simply
//! replaces its copy.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use serde::Deserialize;

use super::{Decoded, ExchangeId, FeedCodec, split_symbol};
use crate::error::{Result, TwapdError};
use crate::models::book::{BookUpdate, PriceLevel};

const WS_URL: &str = "wss://ws.kraken.com/v2";

/// Book depth to subscribe with; also the span of the checksum.
const BOOK_DEPTH: usize = 10;

/// Codec for the Kraken v2 `book` channel.
pub struct KrakenCodec {
    books: HashMap<String, LocalBook>,
}

/// Local mirror of one symbol's book, kept only for checksum validation.
#[derive(Default)]
struct LocalBook {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

#[derive(Debug, Deserialize)]
struct BookMessage {
    channel: String,
    #[serde(rename = "type")]
    tpe: String,
    data: Vec<BookData>,
}

#[derive(Debug, Deserialize)]
struct BookData {
    symbol: String,
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
    checksum: u32,
}

#[derive(Debug, Deserialize)]
struct WireLevel {
    price: Decimal,
    qty: Decimal,
}

impl KrakenCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            books: HashMap::new(),
        }
    }

    fn protocol(&self, reason: impl Into<String>) -> TwapdError {
        TwapdError::Protocol {
            exchange: ExchangeId::Kraken,
            reason: reason.into(),
        }
    }

    /// Canonical `BTCUSD` to wire `BTC/USD`.
    fn wire_symbol(&self, canonical: &str) -> String {
        match split_symbol(canonical) {
            Some((base, quote)) => format!("{base}/{quote}"),
            None => canonical.to_string(),
        }
    }

    fn canonical_symbol(&self, wire: &str) -> String {
        wire.replace('/', "").to_uppercase()
    }
}

impl Default for KrakenCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBook {
    fn apply(&mut self, bids: &[WireLevel], asks: &[WireLevel]) {
        for level in bids {
            if level.qty.is_zero() {
                self.bids.remove(&level.price);
            } else {
                self.bids.insert(level.price, level.qty);
            }
        }
        for level in asks {
            if level.qty.is_zero() {
                self.asks.remove(&level.price);
            } else {
                self.asks.insert(level.price, level.qty);
            }
        }
        // The feed maintains a fixed-depth window; levels pushed beyond it
        // are silently dropped on the exchange side, so mirror that here.
        while self.bids.len() > BOOK_DEPTH {
            self.bids.pop_first();
        }
        while self.asks.len() > BOOK_DEPTH {
            self.asks.pop_last();
        }
    }

    /// CRC32 over the top ten asks (ascending) then top ten bids
    /// (descending), each level contributing its price and quantity with
    /// the decimal point and leading zeros removed.
    fn checksum(&self) -> u32 {
        let mut input = String::new();
        for (price, qty) in self.asks.iter().take(BOOK_DEPTH) {
            input.push_str(&checksum_field(*price));
            input.push_str(&checksum_field(*qty));
        }
        for (price, qty) in self.bids.iter().rev().take(BOOK_DEPTH) {
            input.push_str(&checksum_field(*price));
            input.push_str(&checksum_field(*qty));
        }
        crc32fast::hash(input.as_bytes())
    }

    fn top_bids(&self) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .take(BOOK_DEPTH)
            .map(|(p, q)| PriceLevel::new(*p, *q))
            .collect()
    }

    fn top_asks(&self) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .take(BOOK_DEPTH)
            .map(|(p, q)| PriceLevel::new(*p, *q))
            .collect()
    }
}

/// Formats one decimal for the checksum input: the value at its wire
/// precision with the decimal point removed and leading zeros stripped.
/// Trailing zeros are part of the pair's precision and must be kept, so
/// the parsed scale is never normalized away.
fn checksum_field(value: Decimal) -> String {
    let s = value.to_string().replace('.', "");
    let trimmed = s.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

impl FeedCodec for KrakenCodec {
    fn id(&self) -> ExchangeId {
        ExchangeId::Kraken
    }

    fn ws_url(&self, _symbols: &[String]) -> String {
        WS_URL.to_string()
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        let wire_symbols: Vec<String> = symbols.iter().map(|s| self.wire_symbol(s)).collect();
        vec![
            serde_json::json!({
                "method": "subscribe",
                "params": {
                    "channel": "book",
                    "symbol": wire_symbols,
                    "depth": BOOK_DEPTH,
                },
            })
            .to_string(),
        ]
    }

    fn decode(&mut self, text: &str) -> Result<Decoded> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| self.protocol(format!("invalid json: {e}")))?;

        match value.get("channel").and_then(|c| c.as_str()) {
            Some("book") => {}
            // Heartbeats, status, and method acks.
            Some(_) => return Ok(Decoded::Ignore),
            None => {
                if value.get("method").is_some() {
                    return Ok(Decoded::Ignore);
                }
                return Err(self.protocol("message without channel or method"));
            }
        }

        let message: BookMessage = serde_json::from_value(value)
            .map_err(|e| self.protocol(format!("bad book message: {e}")))?;
        debug_assert_eq!(message.channel, "book");

        let mut updates = Vec::new();
        for data in message.data {
            let symbol = self.canonical_symbol(&data.symbol);

            if message.tpe == "snapshot" {
                self.books.insert(symbol.clone(), LocalBook::default());
            }
            let Some(book) = self.books.get_mut(&symbol) else {
                // Update before any snapshot; wait for the snapshot.
                return Ok(Decoded::Ignore);
            };

            book.apply(&data.bids, &data.asks);

            if book.checksum() != data.checksum {
                self.books.remove(&symbol);
                return Ok(Decoded::Resync { symbol });
            }

            updates.push(BookUpdate::Snapshot {
                exchange: ExchangeId::Kraken,
                symbol,
                bids: book.top_bids(),
                asks: book.top_asks(),
                sequence: None,
            });
        }

        if updates.is_empty() {
            Ok(Decoded::Ignore)
        } else {
            Ok(Decoded::Updates(updates))
        }
    }

    fn reset(&mut self) {
        self.books.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    /// Computes the checksum the exchange would send for the given book.
    fn expected_checksum(bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> u32 {
        let mut book = LocalBook::default();
        for (p, q) in bids {
            book.bids.insert(*p, *q);
        }
        for (p, q) in asks {
            book.asks.insert(*p, *q);
        }
        book.checksum()
    }

    fn snapshot_msg(checksum: u32) -> String {
        format!(
            r#"{{"channel":"book","type":"snapshot","data":[{{"symbol":"BTC/USD",
                "bids":[{{"price":50000.0,"qty":1.5}}],
                "asks":[{{"price":50010.0,"qty":2.0}}],
                "checksum":{checksum},"timestamp":"2025-01-01T00:00:00Z"}}]}}"#
        )
    }

    #[test]
    fn checksum_field_keeps_wire_precision() {
        assert_eq!(checksum_field(dec!(45283.5)), "452835");
        assert_eq!(checksum_field(dec!(45283.0)), "452830");
        assert_eq!(checksum_field(dec!(0.30655323)), "30655323");
        assert_eq!(checksum_field(dec!(50000)), "50000");
        assert_eq!(checksum_field(dec!(0.050)), "50");
        assert_eq!(checksum_field(dec!(2.0)), "20");
        assert_eq!(checksum_field(dec!(0)), "0");
    }

    /// Fixed vector computed independently with zlib over the documented
    /// field encoding, covering quantities whose wire precision carries
    /// trailing zeros.
    #[test]
    fn checksum_matches_reference_vector() {
        let mut book = LocalBook::default();
        for (p, q) in [
            (dec!(0.05005), dec!(0.00000500)),
            (dec!(0.05010), dec!(0.00000500)),
            (dec!(0.05015), dec!(0.00000500)),
        ] {
            book.asks.insert(p, q);
        }
        for (p, q) in [
            (dec!(0.05000), dec!(0.00000500)),
            (dec!(0.04995), dec!(0.00000500)),
            (dec!(0.04990), dec!(0.00000500)),
        ] {
            book.bids.insert(p, q);
        }
        assert_eq!(book.checksum(), 1_463_915_741);
    }

    #[test]
    fn valid_snapshot_emits_book() {
        let checksum = expected_checksum(
            &[(dec!(50000.0), dec!(1.5))],
            &[(dec!(50010.0), dec!(2.0))],
        );
        let mut codec = KrakenCodec::new();
        match codec.decode(&snapshot_msg(checksum)).unwrap() {
            Decoded::Updates(updates) => match &updates[0] {
                BookUpdate::Snapshot {
                    symbol, bids, asks, ..
                } => {
                    assert_eq!(symbol, "BTCUSD");
                    assert_eq!(bids[0], PriceLevel::new(dec!(50000.0), dec!(1.5)));
                    assert_eq!(asks[0], PriceLevel::new(dec!(50010.0), dec!(2.0)));
                }
                other => panic!("expected snapshot, got {other:?}"),
            },
            other => panic!("expected updates, got {other:?}"),
        }
    }

    #[test]
    fn checksum_mismatch_requests_resync() {
        let mut codec = KrakenCodec::new();
        match codec.decode(&snapshot_msg(0xDEAD_BEEF)).unwrap() {
            Decoded::Resync { symbol } => assert_eq!(symbol, "BTCUSD"),
            other => panic!("expected resync, got {other:?}"),
        }
    }

    #[test]
    fn update_patches_book_and_validates() {
        let mut codec = KrakenCodec::new();
        let snap_checksum = expected_checksum(
            &[(dec!(50000.0), dec!(1.5))],
            &[(dec!(50010.0), dec!(2.0))],
        );
        codec.decode(&snapshot_msg(snap_checksum)).unwrap();

        // Remove the bid, add a new one.
        let new_checksum = expected_checksum(
            &[(dec!(49999.0), dec!(3.0))],
            &[(dec!(50010.0), dec!(2.0))],
        );
        let update = format!(
            r#"{{"channel":"book","type":"update","data":[{{"symbol":"BTC/USD",
                "bids":[{{"price":50000.0,"qty":0}},{{"price":49999.0,"qty":3.0}}],
                "asks":[],
                "checksum":{new_checksum},"timestamp":"2025-01-01T00:00:01Z"}}]}}"#
        );
        match codec.decode(&update).unwrap() {
            Decoded::Updates(updates) => match &updates[0] {
                BookUpdate::Snapshot { bids, .. } => {
                    assert_eq!(bids.len(), 1);
                    assert_eq!(bids[0].price, dec!(49999.0));
                }
                other => panic!("expected snapshot, got {other:?}"),
            },
            other => panic!("expected updates, got {other:?}"),
        }
    }

    #[test]
    fn update_before_snapshot_is_ignored() {
        let mut codec = KrakenCodec::new();
        let update = r#"{"channel":"book","type":"update","data":[{"symbol":"BTC/USD",
            "bids":[{"price":50000.0,"qty":1.0}],"asks":[],"checksum":1,
            "timestamp":"2025-01-01T00:00:00Z"}]}"#;
        assert!(matches!(codec.decode(update).unwrap(), Decoded::Ignore));
    }

    #[test]
    fn heartbeat_is_ignored() {
        let mut codec = KrakenCodec::new();
        let text = r#"{"channel":"heartbeat"}"#;
        assert!(matches!(codec.decode(text).unwrap(), Decoded::Ignore));
    }

    #[test]
    fn subscribe_frame_uses_wire_symbols() {
        let codec = KrakenCodec::new();
        let frames = codec.subscribe_frames(&["BTCUSD".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(value["method"], "subscribe");
        assert_eq!(value["params"]["channel"], "book");
        assert_eq!(value["params"]["symbol"][0], "BTC/USD");
        assert_eq!(value["params"]["depth"], 10);
    }

    #[test]
    fn depth_window_is_enforced() {
        let mut book = LocalBook::default();
        let bids: Vec<WireLevel> = (0..12)
            .map(|i| WireLevel {
                price: Decimal::from(50000 - i),
                qty: Decimal::ONE,
            })
            .collect();
        book.apply(&bids, &[]);
        assert_eq!(book.bids.len(), BOOK_DEPTH);
        // The lowest bids fell out of the window.
        assert!(!book.bids.contains_key(&Decimal::from(49989)));
        assert!(book.bids.contains_key(&Decimal::from(50000)));
    }
}
