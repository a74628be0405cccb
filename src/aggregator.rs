//! Authoritative per-symbol, per-exchange book state.
//!
//! The aggregator is the only component that mutates book state. All
//! adapters publish canonical updates into one bounded channel consumed by
//! [`Aggregator::run`]; the broker and execution engine only read. State
//! is locked per symbol, so a merge or best-price read never observes a
//! half-applied diff and updates to one symbol never block reads of
//! another.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use crate::exchange::ExchangeId;
use crate::models::book::{BookSide, BookUpdate, LiquidityLevel, MergedBook, PriceLevel};

/// Default window after which a silent exchange is excluded from merges.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(10);

/// One exchange's copy of one symbol's book.
struct ExchangeBook {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    received_at: Instant,
    /// Cleared when the exchange's feed drops; set again by any update.
    live: bool,
}

impl ExchangeBook {
    fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            received_at: Instant::now(),
            live: true,
        }
    }

    fn patch(side: &mut BTreeMap<Decimal, Decimal>, levels: &[PriceLevel]) {
        for level in levels {
            if level.qty.is_zero() {
                side.remove(&level.price);
            } else {
                side.insert(level.price, level.qty);
            }
        }
    }

    fn replace(&mut self, bids: &[PriceLevel], asks: &[PriceLevel]) {
        self.bids.clear();
        self.asks.clear();
        Self::patch(&mut self.bids, bids);
        Self::patch(&mut self.asks, asks);
    }
}

/// All exchange books for one symbol, guarded by one lock.
#[derive(Default)]
struct SymbolBooks {
    books: HashMap<ExchangeId, ExchangeBook>,
}

/// Single source of truth for live book state.
pub struct Aggregator {
    staleness_window: Duration,
    symbols: RwLock<HashMap<String, Arc<RwLock<SymbolBooks>>>>,
}

impl Aggregator {
    #[must_use]
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            staleness_window,
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Consumes canonical updates until every adapter has hung up.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<BookUpdate>) {
        while let Some(update) = rx.recv().await {
            self.apply(update).await;
        }
        info!("update channel closed, aggregator stopping");
    }

    /// Applies one canonical update.
    ///
    /// Snapshots replace the stored book, diffs patch it (zero quantity
    /// removes a level), and a feed-down marks every book from that
    /// exchange not-live until its next update.
    pub async fn apply(&self, update: BookUpdate) {
        match update {
            BookUpdate::Snapshot {
                exchange,
                symbol,
                bids,
                asks,
                ..
            } => {
                let entry = self.symbol_entry(&symbol).await;
                let mut books = entry.write().await;
                let book = books.books.entry(exchange).or_insert_with(ExchangeBook::new);
                book.replace(&bids, &asks);
                book.received_at = Instant::now();
                book.live = true;
                debug!(%exchange, %symbol, "applied snapshot");
            }
            BookUpdate::Diff {
                exchange,
                symbol,
                bids,
                asks,
                ..
            } => {
                let entry = self.symbol_entry(&symbol).await;
                let mut books = entry.write().await;
                let book = books.books.entry(exchange).or_insert_with(ExchangeBook::new);
                ExchangeBook::patch(&mut book.bids, &bids);
                ExchangeBook::patch(&mut book.asks, &asks);
                book.received_at = Instant::now();
                book.live = true;
            }
            BookUpdate::FeedDown { exchange } => {
                let symbols = self.symbols.read().await;
                for entry in symbols.values() {
                    let mut books = entry.write().await;
                    if let Some(book) = books.books.get_mut(&exchange) {
                        book.live = false;
                    }
                }
                info!(%exchange, "feed down, excluding from merged views");
            }
        }
    }

    async fn symbol_entry(&self, symbol: &str) -> Arc<RwLock<SymbolBooks>> {
        {
            let symbols = self.symbols.read().await;
            if let Some(entry) = symbols.get(symbol) {
                return Arc::clone(entry);
            }
        }
        let mut symbols = self.symbols.write().await;
        Arc::clone(symbols.entry(symbol.to_string()).or_default())
    }

    /// Returns a merged view of `symbol` across `exchanges`, excluding
    /// stale or downed feeds and truncated to `max_depth` levels per side.
    /// Levels at equal prices are summed. Pure read.
    pub async fn merged_view(
        &self,
        symbol: &str,
        exchanges: &[ExchangeId],
        max_depth: usize,
    ) -> MergedBook {
        let mut merged_bids: BTreeMap<Decimal, Decimal> = BTreeMap::new();
        let mut merged_asks: BTreeMap<Decimal, Decimal> = BTreeMap::new();
        let mut contributing = Vec::new();

        if let Some(entry) = self.symbols.read().await.get(symbol).cloned() {
            let books = entry.read().await;
            for exchange in exchanges {
                let Some(book) = books.books.get(exchange) else {
                    continue;
                };
                if !self.usable(book) {
                    continue;
                }
                contributing.push(*exchange);
                for (price, qty) in &book.bids {
                    *merged_bids.entry(*price).or_insert(Decimal::ZERO) += *qty;
                }
                for (price, qty) in &book.asks {
                    *merged_asks.entry(*price).or_insert(Decimal::ZERO) += *qty;
                }
            }
        }

        let bids: Vec<PriceLevel> = merged_bids
            .iter()
            .rev()
            .take(max_depth)
            .map(|(p, q)| PriceLevel::new(*p, *q))
            .collect();
        let asks: Vec<PriceLevel> = merged_asks
            .iter()
            .take(max_depth)
            .map(|(p, q)| PriceLevel::new(*p, *q))
            .collect();

        MergedBook {
            symbol: symbol.to_string(),
            exchanges: contributing,
            best_bid: bids.first().copied(),
            best_ask: asks.first().copied(),
            bids,
            asks,
        }
    }

    /// Returns all usable liquidity on one side of `symbol`'s book across
    /// `exchanges`, most favorable price first, with every level still
    /// attributed to its exchange. Pure read.
    pub async fn liquidity(
        &self,
        symbol: &str,
        exchanges: &[ExchangeId],
        side: BookSide,
    ) -> Vec<LiquidityLevel> {
        let mut levels = Vec::new();

        if let Some(entry) = self.symbols.read().await.get(symbol).cloned() {
            let books = entry.read().await;
            for exchange in exchanges {
                let Some(book) = books.books.get(exchange) else {
                    continue;
                };
                if !self.usable(book) {
                    continue;
                }
                let side_map = match side {
                    BookSide::Bids => &book.bids,
                    BookSide::Asks => &book.asks,
                };
                for (price, qty) in side_map {
                    levels.push(LiquidityLevel {
                        exchange: *exchange,
                        price: *price,
                        qty: *qty,
                    });
                }
            }
        }

        match side {
            // Hitting bids: highest price first.
            BookSide::Bids => levels.sort_by(|a, b| b.price.cmp(&a.price)),
            // Lifting asks: lowest price first.
            BookSide::Asks => levels.sort_by(|a, b| a.price.cmp(&b.price)),
        }
        levels
    }

    /// Most favorable available price/quantity on one side, or `None` when
    /// no live exchange offers liquidity.
    pub async fn best_price(
        &self,
        symbol: &str,
        exchanges: &[ExchangeId],
        side: BookSide,
    ) -> Option<LiquidityLevel> {
        self.liquidity(symbol, exchanges, side).await.first().copied()
    }

    /// Symbols with tracked book state, sorted.
    pub async fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.symbols.read().await.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Whether `exchange` currently contributes usable state for `symbol`.
    pub async fn exchange_is_live(&self, symbol: &str, exchange: ExchangeId) -> bool {
        let Some(entry) = self.symbols.read().await.get(symbol).cloned() else {
            return false;
        };
        let books = entry.read().await;
        books
            .books
            .get(&exchange)
            .is_some_and(|book| self.usable(book))
    }

    fn usable(&self, book: &ExchangeBook) -> bool {
        book.live && book.received_at.elapsed() <= self.staleness_window
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_STALENESS_WINDOW)
    }
}
