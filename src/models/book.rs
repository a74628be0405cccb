//! Canonical order book types shared by every exchange adapter.
//!
//! Adapters translate exchange-native payloads into [`BookUpdate`] values;
//! everything downstream of the aggregator only ever sees these types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::ExchangeId;

/// A single price level: price and the quantity resting at it.
///
/// A quantity of zero in a diff means "remove this level".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

impl PriceLevel {
    #[must_use]
    pub fn new(price: Decimal, qty: Decimal) -> Self {
        Self { price, qty }
    }
}

/// Which side of the book a set of levels belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    /// Buy interest, best (highest) price first.
    Bids,
    /// Sell interest, best (lowest) price first.
    Asks,
}

/// Canonical message published by an adapter to the aggregator.
#[derive(Debug, Clone)]
pub enum BookUpdate {
    /// Full replacement of the (exchange, symbol) book.
    Snapshot {
        exchange: ExchangeId,
        symbol: String,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        sequence: Option<u64>,
    },
    /// Incremental patch. Levels with zero quantity are removed.
    Diff {
        exchange: ExchangeId,
        symbol: String,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        sequence: Option<u64>,
    },
    /// The feed connection dropped; every book from this exchange must be
    /// excluded from merged views until a fresh snapshot arrives.
    FeedDown { exchange: ExchangeId },
}

impl BookUpdate {
    /// The exchange this update originates from.
    #[must_use]
    pub fn exchange(&self) -> ExchangeId {
        match self {
            BookUpdate::Snapshot { exchange, .. }
            | BookUpdate::Diff { exchange, .. }
            | BookUpdate::FeedDown { exchange } => *exchange,
        }
    }
}

/// A price level with the exchange it rests on.
///
/// The execution engine walks these so that fills stay attributable to a
/// specific exchange; an order restricted to a subset of exchanges never
/// consumes liquidity it could not actually reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidityLevel {
    pub exchange: ExchangeId,
    pub price: Decimal,
    pub qty: Decimal,
}

/// A merged per-symbol view across a set of exchanges.
///
/// Derived on demand by the aggregator; levels at equal prices are summed
/// across exchanges and the depth is truncated to the requested maximum.
#[derive(Debug, Clone, Serialize)]
pub struct MergedBook {
    pub symbol: String,
    /// Exchanges whose books contributed (live, non-stale only).
    pub exchanges: Vec<ExchangeId>,
    pub best_bid: Option<PriceLevel>,
    pub best_ask: Option<PriceLevel>,
    /// Descending by price.
    pub bids: Vec<PriceLevel>,
    /// Ascending by price.
    pub asks: Vec<PriceLevel>,
}

impl MergedBook {
    /// Returns `true` if no live exchange contributed any level.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}
