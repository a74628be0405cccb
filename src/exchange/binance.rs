//! Binance diff-depth feed codec.
//!
//! Binance streams incremental depth updates carrying a first/final update
//! id pair (`U`/`u`). The book is anchored by a REST depth snapshot whose
//! `lastUpdateId` the stream must chain onto; any break in the chain
//! invalidates local state and forces a fresh snapshot.

use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;

use super::{Decoded, ExchangeId, FeedCodec};
use crate::error::{Result, TwapdError};
use crate::models::book::{BookUpdate, PriceLevel};

const WS_URL: &str = "wss://stream.binance.com:9443/stream";
const REST_URL: &str = "https://api.binance.com/api/v3";

/// Per-symbol sequence anchor from the most recent snapshot or diff.
#[derive(Debug, Clone, Copy)]
struct Anchor {
    last_update_id: u64,
    /// The first diff after a snapshot may overlap it; later diffs must
    /// chain exactly.
    snapshot_fresh: bool,
}

/// Codec for the Binance combined depth stream.
pub struct BinanceCodec {
    anchors: HashMap<String, Anchor>,
}

/// One `depthUpdate` event, possibly wrapped in a combined-stream envelope.
#[derive(Debug, Deserialize)]
struct DepthEvent {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[allow(dead_code)]
    stream: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

impl BinanceCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchors: HashMap::new(),
        }
    }

    fn protocol(&self, reason: impl Into<String>) -> TwapdError {
        TwapdError::Protocol {
            exchange: ExchangeId::Binance,
            reason: reason.into(),
        }
    }

    fn parse_levels(&self, raw: &[[String; 2]]) -> Result<Vec<PriceLevel>> {
        raw.iter()
            .map(|[price, qty]| {
                let price = Decimal::from_str(price)
                    .map_err(|e| self.protocol(format!("bad price {price:?}: {e}")))?;
                let qty = Decimal::from_str(qty)
                    .map_err(|e| self.protocol(format!("bad qty {qty:?}: {e}")))?;
                Ok(PriceLevel::new(price, qty))
            })
            .collect()
    }
}

impl Default for BinanceCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedCodec for BinanceCodec {
    fn id(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    fn ws_url(&self, symbols: &[String]) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@depth@100ms", s.to_lowercase()))
            .collect();
        format!("{WS_URL}?streams={}", streams.join("/"))
    }

    fn subscribe_frames(&self, _symbols: &[String]) -> Vec<String> {
        // Streams are selected in the connection URL; nothing to send.
        Vec::new()
    }

    fn decode(&mut self, text: &str) -> Result<Decoded> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| self.protocol(format!("invalid json: {e}")))?;

        // Combined-stream messages wrap the event in an envelope.
        let data = match serde_json::from_value::<StreamEnvelope>(value.clone()) {
            Ok(envelope) => envelope.data,
            Err(_) => value,
        };

        if data.get("e").is_none() {
            // Subscription acks and other control messages.
            return Ok(Decoded::Ignore);
        }

        let event: DepthEvent = serde_json::from_value(data)
            .map_err(|e| self.protocol(format!("bad depth event: {e}")))?;
        if event.event != "depthUpdate" {
            return Ok(Decoded::Ignore);
        }

        let symbol = event.symbol.to_uppercase();
        let Some(anchor) = self.anchors.get_mut(&symbol) else {
            // No snapshot anchor yet; events before the anchor are dropped.
            return Ok(Decoded::Ignore);
        };

        if event.final_update_id <= anchor.last_update_id {
            // Replay of state already covered by the snapshot.
            return Ok(Decoded::Ignore);
        }

        let contiguous = if anchor.snapshot_fresh {
            event.first_update_id <= anchor.last_update_id + 1
        } else {
            event.first_update_id == anchor.last_update_id + 1
        };
        if !contiguous {
            self.anchors.remove(&symbol);
            return Ok(Decoded::Resync { symbol });
        }

        anchor.last_update_id = event.final_update_id;
        anchor.snapshot_fresh = false;

        let bids = self.parse_levels(&event.bids)?;
        let asks = self.parse_levels(&event.asks)?;
        Ok(Decoded::Updates(vec![BookUpdate::Diff {
            exchange: ExchangeId::Binance,
            symbol,
            bids,
            asks,
            sequence: Some(event.final_update_id),
        }]))
    }

    fn snapshot_url(&self, symbol: &str) -> Option<String> {
        Some(format!(
            "{REST_URL}/depth?symbol={}&limit=100",
            symbol.to_uppercase()
        ))
    }

    fn decode_snapshot(&mut self, symbol: &str, body: &str) -> Result<BookUpdate> {
        let snapshot: DepthSnapshot = serde_json::from_str(body)
            .map_err(|e| self.protocol(format!("bad depth snapshot: {e}")))?;

        let symbol = symbol.to_uppercase();
        self.anchors.insert(
            symbol.clone(),
            Anchor {
                last_update_id: snapshot.last_update_id,
                snapshot_fresh: true,
            },
        );

        let bids = self.parse_levels(&snapshot.bids)?;
        let asks = self.parse_levels(&snapshot.asks)?;
        Ok(BookUpdate::Snapshot {
            exchange: ExchangeId::Binance,
            symbol,
            bids,
            asks,
            sequence: Some(snapshot.last_update_id),
        })
    }

    fn reset(&mut self) {
        self.anchors.clear();
    }
}
