//! TWAP paper-trading execution engine.
//!
//! Each accepted order runs on its own task. The task wakes once per slice
//! interval, reads the prevailing merged liquidity from the aggregator, and
//! simulates fills against it without mutating any book. Orders never touch
//! each other and each sees whatever liquidity exists at its own slice
//! times.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::error::{Result, TwapdError};
use crate::exchange::ExchangeId;
use crate::models::book::LiquidityLevel;
use crate::models::iso_timestamp;
use crate::models::order::{
    Fill, OrderId, OrderSide, OrderStatus, Slice, SliceStatus, TwapOrder, TwapOrderRequest,
};

/// Default interval between slice executions.
pub const DEFAULT_SLICE_INTERVAL: Duration = Duration::from_secs(1);

/// Quantity precision for per-slice targets.
const QTY_SCALE: u32 = 8;

/// Longest accepted execution window. Bounds the slice schedule an order
/// can allocate and keeps the millisecond arithmetic far from overflow.
const MAX_DURATION_SECS: u64 = 86_400;

/// Called on every terminal transition. The default implementation logs;
/// a real deployment can write to a store instead.
pub trait PersistenceHook: Send + Sync {
    fn persist(&self, order: &TwapOrder);
}

/// Logs terminal orders through `tracing`.
pub struct LogPersistence;

impl PersistenceHook for LogPersistence {
    fn persist(&self, order: &TwapOrder) {
        info!(
            order = %order.id,
            status = ?order.status,
            executed = %order.executed_quantity,
            avg_price = %order.average_fill_price,
            "order reached terminal state"
        );
    }
}

/// Owns all order state and the per-order execution tasks.
pub struct TwapEngine {
    aggregator: Arc<Aggregator>,
    slice_interval: Duration,
    hook: Arc<dyn PersistenceHook>,
    next_id: AtomicU64,
    orders: Mutex<HashMap<OrderId, TwapOrder>>,
    cancels: Mutex<HashMap<OrderId, watch::Sender<bool>>>,
}

impl TwapEngine {
    #[must_use]
    pub fn new(aggregator: Arc<Aggregator>, slice_interval: Duration) -> Self {
        Self::with_hook(aggregator, slice_interval, Arc::new(LogPersistence))
    }

    #[must_use]
    pub fn with_hook(
        aggregator: Arc<Aggregator>,
        slice_interval: Duration,
        hook: Arc<dyn PersistenceHook>,
    ) -> Self {
        Self {
            aggregator,
            slice_interval,
            hook,
            next_id: AtomicU64::new(1),
            orders: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Validates and accepts a TWAP order, spawning its execution task.
    /// The first slice executes immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TwapdError::InvalidOrder`] when the request fails
    /// validation; nothing is recorded in that case.
    pub async fn submit(self: &Arc<Self>, request: TwapOrderRequest) -> Result<OrderId> {
        let exchanges = validate(&request)?;

        let id = format!("TWAP-{:06}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let slices = compute_slices(request.total_quantity, request.duration_secs, self.slice_interval);
        let order = TwapOrder {
            id: id.clone(),
            symbol: request.symbol,
            side: request.side,
            total_quantity: request.total_quantity,
            limit_price: request.limit_price,
            duration_secs: request.duration_secs,
            exchanges,
            slices,
            fills: Vec::new(),
            executed_quantity: Decimal::ZERO,
            average_fill_price: Decimal::ZERO,
            status: OrderStatus::Pending,
            created_at: iso_timestamp(),
        };
        info!(
            order = %id,
            symbol = %order.symbol,
            side = ?order.side,
            qty = %order.total_quantity,
            slices = order.slices.len(),
            "order accepted"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.orders.lock().await.insert(id.clone(), order);
        self.cancels.lock().await.insert(id.clone(), cancel_tx);

        let engine = Arc::clone(self);
        let task_id = id.clone();
        tokio::spawn(async move {
            engine.run_order(task_id, cancel_rx).await;
        });

        Ok(id)
    }

    /// Returns a snapshot of one order's full state.
    ///
    /// # Errors
    ///
    /// Returns [`TwapdError::OrderNotFound`] for an unknown id.
    pub async fn status(&self, id: &str) -> Result<TwapOrder> {
        self.orders
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TwapdError::OrderNotFound(id.to_string()))
    }

    /// Snapshots of every order the engine has seen, newest first.
    pub async fn orders(&self) -> Vec<TwapOrder> {
        let mut orders: Vec<TwapOrder> = self.orders.lock().await.values().cloned().collect();
        orders.sort_by(|a, b| b.id.cmp(&a.id));
        orders
    }

    /// Requests cancellation. The execution task observes the signal before
    /// its next slice; already-executed slices keep their fills.
    ///
    /// # Errors
    ///
    /// Returns [`TwapdError::OrderNotFound`] for an unknown id and
    /// [`TwapdError::InvalidOrder`] when the order is already terminal.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let orders = self.orders.lock().await;
        let order = orders
            .get(id)
            .ok_or_else(|| TwapdError::OrderNotFound(id.to_string()))?;
        if order.status.is_terminal() {
            return Err(TwapdError::InvalidOrder(format!(
                "order {id} is already terminal ({:?})",
                order.status
            )));
        }
        drop(orders);

        if let Some(cancel) = self.cancels.lock().await.get(id) {
            let _ = cancel.send(true);
        }
        info!(order = %id, "cancellation requested");
        Ok(())
    }

    async fn run_order(self: Arc<Self>, id: OrderId, mut cancel_rx: watch::Receiver<bool>) {
        let (symbol, side, limit, exchanges, duration_secs, slice_count) = {
            let mut orders = self.orders.lock().await;
            let Some(order) = orders.get_mut(&id) else {
                return;
            };
            order.status = OrderStatus::Running;
            (
                order.symbol.clone(),
                order.side,
                order.limit_price,
                order.exchanges.clone(),
                order.duration_secs,
                order.slices.len(),
            )
        };

        let start = Instant::now();
        let deadline = start + Duration::from_secs(duration_secs);
        let mut outcome = None;

        for index in 0..slice_count {
            if index > 0 {
                let wake = start + self.slice_interval * index as u32;
                tokio::select! {
                    () = tokio::time::sleep_until(wake) => {}
                    _ = cancel_rx.changed() => {}
                }
            }
            if *cancel_rx.borrow() {
                outcome = Some(OrderStatus::Cancelled);
                self.skip_remaining(&id, index).await;
                break;
            }
            if Instant::now() > deadline {
                warn!(order = %id, slice = index, "duration elapsed before all slices ran");
                outcome = Some(OrderStatus::Expired);
                self.skip_remaining(&id, index).await;
                break;
            }

            self.execute_slice(&id, index, &symbol, side, limit, &exchanges)
                .await;
        }

        self.finish(&id, outcome).await;
    }

    /// Fills one slice against current liquidity and records the result.
    async fn execute_slice(
        &self,
        id: &str,
        index: usize,
        symbol: &str,
        side: OrderSide,
        limit: Option<Decimal>,
        exchanges: &[ExchangeId],
    ) {
        let target = {
            let orders = self.orders.lock().await;
            match orders.get(id) {
                Some(order) => order.slices[index].target_qty,
                None => return,
            }
        };

        let levels = self
            .aggregator
            .liquidity(symbol, exchanges, side.consumes())
            .await;
        let taken = take_liquidity(&levels, side, limit, target);

        let mut orders = self.orders.lock().await;
        let Some(order) = orders.get_mut(id) else {
            return;
        };

        let mut executed = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        let timestamp = iso_timestamp();
        for (exchange, price, qty) in taken {
            executed += qty;
            notional += price * qty;
            order.fills.push(Fill {
                slice_index: index,
                exchange,
                price,
                qty,
                timestamp: timestamp.clone(),
            });
        }

        let slice = &mut order.slices[index];
        slice.executed_qty = executed;
        slice.status = if executed.is_zero() {
            SliceStatus::Skipped
        } else if executed == slice.target_qty {
            SliceStatus::Filled
        } else {
            SliceStatus::PartiallyFilled
        };
        if !executed.is_zero() {
            slice.avg_fill_price = notional / executed;
        }

        order.executed_quantity += executed;
        let total_notional: Decimal = order.fills.iter().map(|f| f.price * f.qty).sum();
        if !order.executed_quantity.is_zero() {
            order.average_fill_price = total_notional / order.executed_quantity;
        }
        debug!(
            order = %id,
            slice = index,
            executed = %executed,
            status = ?order.slices[index].status,
            "slice executed"
        );
    }

    /// Marks every slice from `from` onward as skipped.
    async fn skip_remaining(&self, id: &str, from: usize) {
        let mut orders = self.orders.lock().await;
        if let Some(order) = orders.get_mut(id) {
            for slice in order.slices.iter_mut().skip(from) {
                if slice.status == SliceStatus::Pending {
                    slice.status = SliceStatus::Skipped;
                }
            }
        }
    }

    /// Applies the terminal transition and fires the persistence hook.
    async fn finish(&self, id: &str, forced: Option<OrderStatus>) {
        let terminal = {
            let mut orders = self.orders.lock().await;
            let Some(order) = orders.get_mut(id) else {
                return;
            };
            order.status = forced.unwrap_or(if order.executed_quantity == order.total_quantity {
                OrderStatus::Completed
            } else {
                OrderStatus::PartiallyFilled
            });
            order.clone()
        };
        self.cancels.lock().await.remove(id);
        self.hook.persist(&terminal);
    }
}

/// Checks a request's parameters; returns the normalized exchange set.
fn validate(request: &TwapOrderRequest) -> Result<Vec<ExchangeId>> {
    if request.symbol.trim().is_empty() {
        return Err(TwapdError::InvalidOrder("symbol must not be empty".into()));
    }
    if request.total_quantity <= Decimal::ZERO {
        return Err(TwapdError::InvalidOrder(
            "total_quantity must be positive".into(),
        ));
    }
    if request.duration_secs == 0 {
        return Err(TwapdError::InvalidOrder(
            "duration_secs must be at least 1".into(),
        ));
    }
    if request.duration_secs > MAX_DURATION_SECS {
        return Err(TwapdError::InvalidOrder(format!(
            "duration_secs must be at most {MAX_DURATION_SECS}"
        )));
    }
    if let Some(limit) = request.limit_price {
        if limit <= Decimal::ZERO {
            return Err(TwapdError::InvalidOrder(
                "limit_price must be positive".into(),
            ));
        }
    }
    let mut exchanges = if request.exchanges.is_empty() {
        ExchangeId::ALL.to_vec()
    } else {
        request.exchanges.clone()
    };
    exchanges.sort_unstable();
    exchanges.dedup();
    Ok(exchanges)
}

/// Splits a total quantity into equal time slices. Rounding residue goes to
/// the final slice so the targets always sum to the total.
fn compute_slices(total: Decimal, duration_secs: u64, interval: Duration) -> Vec<Slice> {
    let interval_millis = interval.as_millis().max(1) as u64;
    let count = ((duration_secs * 1000) / interval_millis).max(1);
    let per = (total / Decimal::from(count))
        .round_dp_with_strategy(QTY_SCALE, RoundingStrategy::ToZero);

    let mut slices = Vec::with_capacity(count as usize);
    for index in 0..count {
        let offset_secs = (index * interval_millis) / 1000;
        let target = if index == count - 1 {
            total - per * Decimal::from(count - 1)
        } else {
            per
        };
        slices.push(Slice::new(offset_secs, target));
    }
    slices
}

/// Walks liquidity (already sorted most favorable first) and takes up to
/// `target`, stopping at the first level past the limit price.
fn take_liquidity(
    levels: &[LiquidityLevel],
    side: OrderSide,
    limit: Option<Decimal>,
    target: Decimal,
) -> Vec<(ExchangeId, Decimal, Decimal)> {
    let mut taken = Vec::new();
    let mut remaining = target;
    for level in levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        if let Some(limit) = limit {
            let breaches = match side {
                OrderSide::Buy => level.price > limit,
                OrderSide::Sell => level.price < limit,
            };
            if breaches {
                break;
            }
        }
        let qty = remaining.min(level.qty);
        if qty > Decimal::ZERO {
            taken.push((level.exchange, level.price, qty));
            remaining -= qty;
        }
    }
    taken
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::book::{BookUpdate, PriceLevel};
    use rust_decimal_macros::dec;

    fn request(qty: Decimal, duration_secs: u64) -> TwapOrderRequest {
        TwapOrderRequest {
            symbol: "BTCUSD".to_string(),
            side: OrderSide::Buy,
            total_quantity: qty,
            limit_price: None,
            duration_secs,
            exchanges: vec![],
        }
    }

    fn level(exchange: ExchangeId, price: Decimal, qty: Decimal) -> LiquidityLevel {
        LiquidityLevel {
            exchange,
            price,
            qty,
        }
    }

    async fn seed(aggregator: &Aggregator, exchange: ExchangeId, asks: Vec<PriceLevel>) {
        aggregator
            .apply(BookUpdate::Snapshot {
                exchange,
                symbol: "BTCUSD".to_string(),
                bids: vec![],
                asks,
                sequence: None,
            })
            .await;
    }

    async fn wait_terminal(engine: &TwapEngine, id: &str) -> TwapOrder {
        for _ in 0..200 {
            let order = engine.status(id).await.unwrap();
            if order.status.is_terminal() {
                return order;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("order {id} never reached a terminal state");
    }

    #[test]
    fn slice_targets_sum_to_total() {
        let slices = compute_slices(dec!(1), 3, Duration::from_secs(1));
        assert_eq!(slices.len(), 3);
        let sum: Decimal = slices.iter().map(|s| s.target_qty).sum();
        assert_eq!(sum, dec!(1));
        // Residue lands on the final slice.
        assert_eq!(slices[0].target_qty, dec!(0.33333333));
        assert_eq!(slices[2].target_qty, dec!(0.33333334));
    }

    #[test]
    fn one_second_order_gets_a_single_slice() {
        let slices = compute_slices(dec!(5), 1, Duration::from_secs(1));
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].target_qty, dec!(5));
        assert_eq!(slices[0].scheduled_offset_secs, 0);
    }

    #[test]
    fn take_liquidity_spans_exchanges_in_price_order() {
        let levels = vec![
            level(ExchangeId::Binance, dec!(100), dec!(2)),
            level(ExchangeId::Kraken, dec!(101), dec!(5)),
        ];
        let taken = take_liquidity(&levels, OrderSide::Buy, None, dec!(4));
        assert_eq!(
            taken,
            vec![
                (ExchangeId::Binance, dec!(100), dec!(2)),
                (ExchangeId::Kraken, dec!(101), dec!(2)),
            ]
        );
    }

    #[test]
    fn buy_limit_stops_at_first_level_above_it() {
        let levels = vec![
            level(ExchangeId::Binance, dec!(100), dec!(1)),
            level(ExchangeId::Kraken, dec!(102), dec!(5)),
        ];
        let taken = take_liquidity(&levels, OrderSide::Buy, Some(dec!(101)), dec!(4));
        assert_eq!(taken, vec![(ExchangeId::Binance, dec!(100), dec!(1))]);
    }

    #[test]
    fn sell_limit_stops_below_it() {
        let levels = vec![
            level(ExchangeId::Binance, dec!(100), dec!(1)),
            level(ExchangeId::Kraken, dec!(99), dec!(5)),
        ];
        let taken = take_liquidity(&levels, OrderSide::Sell, Some(dec!(100)), dec!(4));
        assert_eq!(taken, vec![(ExchangeId::Binance, dec!(100), dec!(1))]);
    }

    #[tokio::test]
    async fn rejects_invalid_requests() {
        let engine = Arc::new(TwapEngine::new(
            Arc::new(Aggregator::default()),
            DEFAULT_SLICE_INTERVAL,
        ));

        let mut bad = request(dec!(0), 10);
        assert!(matches!(
            engine.submit(bad.clone()).await,
            Err(TwapdError::InvalidOrder(_))
        ));

        bad = request(dec!(1), 0);
        assert!(engine.submit(bad).await.is_err());

        let mut bad = request(dec!(1), 10);
        bad.symbol = "  ".to_string();
        assert!(engine.submit(bad).await.is_err());

        let mut bad = request(dec!(1), 10);
        bad.limit_price = Some(dec!(-5));
        assert!(engine.submit(bad).await.is_err());

        assert!(engine.orders().await.is_empty());
    }

    #[tokio::test]
    async fn rejects_durations_past_the_window_cap() {
        let engine = Arc::new(TwapEngine::new(
            Arc::new(Aggregator::default()),
            DEFAULT_SLICE_INTERVAL,
        ));

        let bad = request(dec!(1), u64::MAX);
        assert!(matches!(
            engine.submit(bad).await,
            Err(TwapdError::InvalidOrder(_))
        ));

        let bad = request(dec!(1), MAX_DURATION_SECS + 1);
        assert!(matches!(
            engine.submit(bad).await,
            Err(TwapdError::InvalidOrder(_))
        ));
        assert!(engine.orders().await.is_empty());

        // The cap itself is accepted.
        let at_cap = request(dec!(1), MAX_DURATION_SECS);
        let id = engine.submit(at_cap).await.unwrap();
        engine.cancel(&id).await.unwrap();
    }

    #[tokio::test]
    async fn order_completes_against_ample_liquidity() {
        let aggregator = Arc::new(Aggregator::default());
        seed(
            &aggregator,
            ExchangeId::Binance,
            vec![PriceLevel::new(dec!(100), dec!(50))],
        )
        .await;
        let engine = Arc::new(TwapEngine::new(
            Arc::clone(&aggregator),
            Duration::from_millis(50),
        ));

        let id = engine.submit(request(dec!(1), 1)).await.unwrap();
        let order = wait_terminal(&engine, &id).await;

        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.executed_quantity, dec!(1));
        assert_eq!(order.average_fill_price, dec!(100));
        assert_eq!(order.percent_executed(), dec!(100));
        assert!(order.slices.iter().all(|s| s.status == SliceStatus::Filled));
        assert!(order.fills.iter().all(|f| f.exchange == ExchangeId::Binance));
    }

    #[tokio::test]
    async fn fills_are_attributed_across_exchanges() {
        let aggregator = Arc::new(Aggregator::default());
        seed(
            &aggregator,
            ExchangeId::Binance,
            vec![PriceLevel::new(dec!(100), dec!(0.4))],
        )
        .await;
        seed(
            &aggregator,
            ExchangeId::Kraken,
            vec![PriceLevel::new(dec!(101), dec!(10))],
        )
        .await;
        let engine = Arc::new(TwapEngine::new(
            Arc::clone(&aggregator),
            Duration::from_secs(1),
        ));

        let id = engine.submit(request(dec!(1), 1)).await.unwrap();
        let order = wait_terminal(&engine, &id).await;

        assert_eq!(order.status, OrderStatus::Completed);
        let binance_qty: Decimal = order
            .fills
            .iter()
            .filter(|f| f.exchange == ExchangeId::Binance)
            .map(|f| f.qty)
            .sum();
        let kraken_qty: Decimal = order
            .fills
            .iter()
            .filter(|f| f.exchange == ExchangeId::Kraken)
            .map(|f| f.qty)
            .sum();
        assert_eq!(binance_qty, dec!(0.4));
        assert_eq!(kraken_qty, dec!(0.6));
        // Weighted average: 0.4 * 100 + 0.6 * 101 over 1.
        assert_eq!(order.average_fill_price, dec!(100.6));
    }

    #[tokio::test]
    async fn restrictive_limit_skips_every_slice() {
        let aggregator = Arc::new(Aggregator::default());
        seed(
            &aggregator,
            ExchangeId::Binance,
            vec![PriceLevel::new(dec!(100), dec!(50))],
        )
        .await;
        let engine = Arc::new(TwapEngine::new(
            Arc::clone(&aggregator),
            Duration::from_millis(100),
        ));

        let mut req = request(dec!(1), 1);
        req.limit_price = Some(dec!(90));
        let id = engine.submit(req).await.unwrap();
        let order = wait_terminal(&engine, &id).await;

        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.executed_quantity, Decimal::ZERO);
        assert!(order.fills.is_empty());
        assert!(order.slices.iter().all(|s| s.status == SliceStatus::Skipped));
    }

    #[tokio::test]
    async fn cancel_stops_remaining_slices() {
        let aggregator = Arc::new(Aggregator::default());
        seed(
            &aggregator,
            ExchangeId::Binance,
            vec![PriceLevel::new(dec!(100), dec!(50))],
        )
        .await;
        let engine = Arc::new(TwapEngine::new(
            Arc::clone(&aggregator),
            Duration::from_millis(200),
        ));

        let id = engine.submit(request(dec!(10), 4)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.cancel(&id).await.unwrap();

        let order = wait_terminal(&engine, &id).await;
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order.executed_quantity < dec!(10));
        // The first slice ran before the cancel landed.
        assert!(order.executed_quantity > Decimal::ZERO);
        assert!(order.slices.iter().any(|s| s.status == SliceStatus::Skipped));
    }

    #[tokio::test]
    async fn cancel_of_terminal_order_is_rejected() {
        let aggregator = Arc::new(Aggregator::default());
        seed(
            &aggregator,
            ExchangeId::Binance,
            vec![PriceLevel::new(dec!(100), dec!(50))],
        )
        .await;
        let engine = Arc::new(TwapEngine::new(
            Arc::clone(&aggregator),
            Duration::from_millis(50),
        ));

        let id = engine.submit(request(dec!(1), 1)).await.unwrap();
        wait_terminal(&engine, &id).await;

        assert!(matches!(
            engine.cancel(&id).await,
            Err(TwapdError::InvalidOrder(_))
        ));
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let engine = Arc::new(TwapEngine::new(
            Arc::new(Aggregator::default()),
            DEFAULT_SLICE_INTERVAL,
        ));
        assert!(matches!(
            engine.status("TWAP-999999").await,
            Err(TwapdError::OrderNotFound(_))
        ));
        assert!(matches!(
            engine.cancel("TWAP-999999").await,
            Err(TwapdError::OrderNotFound(_))
        ));
    }
}
