//! Exchange feed adapters.
//!
//! Each supported exchange implements [`FeedCodec`]: a synchronous
//! translation layer between its native wire protocol and the canonical
//! [`BookUpdate`](crate::models::book::BookUpdate) schema. All network I/O
//! lives in [`adapter`], which drives any codec through the same
//! connect/subscribe/read/resync loop.

pub mod adapter;
pub mod binance;
pub mod coinbase;
pub mod kraken;

pub use adapter::FeedAdapter;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::book::BookUpdate;

/// Identifier of a supported exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Binance,
    Coinbase,
    Kraken,
}

impl ExchangeId {
    /// Every supported exchange, in registry order.
    pub const ALL: [ExchangeId; 3] = [
        ExchangeId::Binance,
        ExchangeId::Coinbase,
        ExchangeId::Kraken,
    ];

    /// Lowercase name used in config, logs, and client messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Coinbase => "coinbase",
            ExchangeId::Kraken => "kraken",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(ExchangeId::Binance),
            "coinbase" => Ok(ExchangeId::Coinbase),
            "kraken" => Ok(ExchangeId::Kraken),
            other => Err(format!("unknown exchange: {other}")),
        }
    }
}

/// Outcome of decoding one feed message.
#[derive(Debug)]
pub enum Decoded {
    /// Canonical updates to publish to the aggregator.
    Updates(Vec<BookUpdate>),
    /// The codec detected a consistency gap (sequence break, checksum
    /// mismatch) for this symbol; local state was discarded and the
    /// adapter must obtain a fresh full snapshot before resuming diffs.
    Resync { symbol: String },
    /// Heartbeat, subscription ack, or other non-book message.
    Ignore,
}

/// Translation between one exchange's wire protocol and the canonical
/// book schema. Implementations are stateful (sequence tracking, local
/// book mirrors) but perform no I/O. `Sync` because the owning adapter's
/// future is held across await points on a multi-threaded runtime.
pub trait FeedCodec: Send + Sync {
    /// Which exchange this codec speaks for.
    fn id(&self) -> ExchangeId;

    /// WebSocket endpoint to connect to for the given canonical symbols.
    fn ws_url(&self, symbols: &[String]) -> String;

    /// JSON frames to send right after connecting, in order.
    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String>;

    /// Decodes one text frame from the feed.
    ///
    /// # Errors
    ///
    /// Returns [`TwapdError::Protocol`](crate::TwapdError::Protocol) for a
    /// malformed or schema-violating payload; the adapter drops and counts
    /// it without forwarding anything downstream.
    fn decode(&mut self, text: &str) -> Result<Decoded>;

    /// REST endpoint serving a full depth snapshot for one symbol, if this
    /// exchange needs an out-of-band snapshot to anchor its diff stream.
    fn snapshot_url(&self, _symbol: &str) -> Option<String> {
        None
    }

    /// Decodes a REST snapshot body fetched from [`FeedCodec::snapshot_url`].
    ///
    /// # Errors
    ///
    /// Returns [`TwapdError::Protocol`](crate::TwapdError::Protocol) if the
    /// body does not match the expected schema.
    fn decode_snapshot(&mut self, symbol: &str, _body: &str) -> Result<BookUpdate> {
        Err(crate::TwapdError::Protocol {
            exchange: self.id(),
            reason: format!("no snapshot endpoint for {symbol}"),
        })
    }

    /// Discards all per-connection state (sequences, local book mirrors).
    /// Called before every connection attempt.
    fn reset(&mut self);
}

/// Builds the codec for one exchange.
///
/// The registry is explicit: adding an exchange means adding a variant to
/// [`ExchangeId`] and an arm here.
#[must_use]
pub fn build_codec(id: ExchangeId) -> Box<dyn FeedCodec> {
    match id {
        ExchangeId::Binance => Box::new(binance::BinanceCodec::new()),
        ExchangeId::Coinbase => Box::new(coinbase::CoinbaseCodec::new()),
        ExchangeId::Kraken => Box::new(kraken::KrakenCodec::new()),
    }
}

/// Known quote currencies, longest first so `BTCUSDT` maps to `BTC`+`USDT`
/// rather than `BTCUSD`+`T`.
const QUOTE_CURRENCIES: [&str; 6] = ["USDT", "USDC", "USD", "EUR", "GBP", "BTC"];

/// Splits a canonical symbol (`BTCUSD`, `ETHUSDT`) into base and quote.
///
/// Canonical symbols are the dash-less concatenated form; exchanges that
/// separate base and quote on the wire re-join them through this split.
#[must_use]
pub fn split_symbol(canonical: &str) -> Option<(&str, &str)> {
    for quote in QUOTE_CURRENCIES {
        if let Some(base) = canonical.strip_suffix(quote) {
            if !base.is_empty() {
                return Some((base, quote));
            }
        }
    }
    None
}
