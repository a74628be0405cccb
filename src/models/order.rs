//! TWAP order, slice, and fill models.
//!
//! A TWAP order splits its total quantity into equal time slices, each
//! executed independently against the prevailing merged book. The engine
//! owns all mutation; everything handed out is a clone.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::ExchangeId;
use crate::models::book::BookSide;

/// Unique order identifier assigned at submission.
pub type OrderId = String;

/// Direction of a TWAP order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The book side this order consumes liquidity from: a buy lifts asks,
    /// a sell hits bids.
    #[must_use]
    pub fn consumes(self) -> BookSide {
        match self {
            OrderSide::Buy => BookSide::Asks,
            OrderSide::Sell => BookSide::Bids,
        }
    }
}

/// Order submission parameters, as received from the external API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub total_quantity: Decimal,
    /// Max price for a buy, min price for a sell. `None` trades at any price.
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    pub duration_secs: u64,
    pub exchanges: Vec<ExchangeId>,
}

/// Execution state of a single time slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceStatus {
    /// Not yet reached its scheduled offset.
    Pending,
    /// Target quantity fully consumed.
    Filled,
    /// Some but not all of the target consumed.
    PartiallyFilled,
    /// Nothing consumed (no eligible liquidity) or never executed
    /// (cancellation or expiry).
    Skipped,
}

/// One time-bounded portion of a TWAP order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
    /// Offset from order start at which this slice executes.
    pub scheduled_offset_secs: u64,
    pub target_qty: Decimal,
    pub executed_qty: Decimal,
    /// Quantity-weighted fill price for this slice, zero if nothing filled.
    pub avg_fill_price: Decimal,
    pub status: SliceStatus,
}

impl Slice {
    #[must_use]
    pub fn new(scheduled_offset_secs: u64, target_qty: Decimal) -> Self {
        Self {
            scheduled_offset_secs,
            target_qty,
            executed_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            status: SliceStatus::Pending,
        }
    }
}

/// A single consumption of one exchange price level during a slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub slice_index: usize,
    pub exchange: ExchangeId,
    pub price: Decimal,
    pub qty: Decimal,
    pub timestamp: String,
}

/// Lifecycle of a TWAP order. Terminal states are final and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted, first slice not yet scheduled.
    Pending,
    /// Slices executing.
    Running,
    /// Every slice filled its target.
    Completed,
    /// At least one slice under-filled or was skipped.
    PartiallyFilled,
    /// Duration elapsed with slices still unprocessed.
    Expired,
    /// Explicitly cancelled; unexecuted slices were skipped.
    Cancelled,
}

impl OrderStatus {
    /// Terminal states can never transition again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed
                | OrderStatus::PartiallyFilled
                | OrderStatus::Expired
                | OrderStatus::Cancelled
        )
    }
}

/// Full state of a TWAP order, including per-slice detail and fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapOrder {
    pub id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub total_quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub duration_secs: u64,
    pub exchanges: Vec<ExchangeId>,
    pub slices: Vec<Slice>,
    pub fills: Vec<Fill>,
    pub executed_quantity: Decimal,
    /// Quantity-weighted average over every fill, zero if nothing filled.
    pub average_fill_price: Decimal,
    pub status: OrderStatus,
    pub created_at: String,
}

impl TwapOrder {
    /// Fraction of the total quantity executed so far, in percent.
    #[must_use]
    pub fn percent_executed(&self) -> Decimal {
        if self.total_quantity.is_zero() {
            return Decimal::ZERO;
        }
        self.executed_quantity / self.total_quantity * Decimal::ONE_HUNDRED
    }
}
