use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use bot_core::TradingSignal;

pub mod paper;

pub use paper::{FixedQuoteFeed, PaperBroker, QueueSignalSource};

// ---------------------------------------------------------------------------
// Unified broker types (broker-agnostic)
// ---------------------------------------------------------------------------

/// Account snapshot. Dollar fields arrive as strings on the wire (broker
/// convention); use the decimal/f64 accessors for math.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub id: String,
    pub currency: String,
    pub equity: String,
    pub buying_power: String,
    pub cash: String,
    pub trading_blocked: bool,
}

impl AccountSnapshot {
    /// Exact dollar amount as sent by the broker.
    pub fn equity_decimal(&self) -> Decimal {
        Decimal::from_str(&self.equity).unwrap_or_default()
    }
    pub fn buying_power_decimal(&self) -> Decimal {
        Decimal::from_str(&self.buying_power).unwrap_or_default()
    }
    /// Equity for sizing math, parsed through the exact wire amount.
    pub fn equity_f64(&self) -> f64 {
        self.equity_decimal().to_f64().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: String,
    pub side: String,
    pub avg_entry_price: String,
    pub current_price: String,
    pub unrealized_pl: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// A market-style order request. Either unit-denominated (`qty`) or
/// dollar-denominated (`notional`) for fractional fills; exactly one is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Option<f64>,
    pub notional: Option<f64>,
}

impl OrderRequest {
    pub fn buy(symbol: impl Into<String>, qty: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side: OrderSide::Buy,
            qty: Some(qty),
            notional: None,
        }
    }
    pub fn sell(symbol: impl Into<String>, qty: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side: OrderSide::Sell,
            qty: Some(qty),
            notional: None,
        }
    }
    pub fn notional(symbol: impl Into<String>, side: OrderSide, dollars: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            qty: None,
            notional: Some(dollars),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub filled_qty: Option<String>,
    pub filled_avg_price: Option<String>,
}

impl Order {
    pub fn filled_qty_f64(&self) -> Option<f64> {
        self.filled_qty.as_ref().and_then(|s| s.parse().ok())
    }
    pub fn filled_avg_price_f64(&self) -> Option<f64> {
        self.filled_avg_price.as_ref().and_then(|s| s.parse().ok())
    }
}

/// Market session snapshot from the broker clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketClock {
    pub is_open: bool,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

/// Option chain snapshot used by the gateway's quality filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionQuote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub open_interest: u64,
    pub delta: f64,
    pub expiry: Option<NaiveDate>,
    pub as_of: DateTime<Utc>,
}

impl OptionQuote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Bid/ask spread as a percentage of the mid price.
    pub fn spread_pct(&self) -> f64 {
        let mid = self.mid();
        if mid <= 0.0 {
            return f64::INFINITY;
        }
        (self.ask - self.bid) / mid * 100.0
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age_secs: i64) -> bool {
        (now - self.as_of).num_seconds() > max_age_secs
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Get account information (equity, buying power, cash).
    async fn get_account(&self) -> Result<AccountSnapshot>;

    /// Get a specific position by symbol (None if no position).
    async fn get_position(&self, symbol: &str) -> Result<Option<BrokerPosition>>;

    /// Submit a market-style order.
    async fn submit_order(&self, order: OrderRequest) -> Result<Order>;

    /// Get an order by ID (fill status / price).
    async fn get_order(&self, order_id: &str) -> Result<Order>;

    /// Cancel an order by ID.
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Market session clock.
    async fn get_clock(&self) -> Result<MarketClock>;

    /// Whether this is a paper/simulated account.
    fn is_paper(&self) -> bool;

    /// Broker name for logging.
    fn broker_name(&self) -> &str;
}

#[async_trait]
pub trait QuoteFeed: Send + Sync {
    async fn get_current_price(&self, symbol: &str) -> Result<f64>;

    async fn get_option_quote(&self, symbol: &str) -> Result<OptionQuote>;
}

/// Upstream producer of candidate signals. The orchestrator drains it once
/// per tick; drained signals are never re-delivered.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn drain_signals(&self) -> Result<Vec<TradingSignal>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorVerdict {
    pub confidence: f64,
    pub reasoning: String,
}

/// Neutral score substituted when the validator is unavailable or returns
/// garbage: never fail closed or open arbitrarily on an outage.
pub const NEUTRAL_AI_CONFIDENCE: f64 = 0.5;

/// External AI validation step (optional, gated by config).
#[async_trait]
pub trait TradeValidator: Send + Sync {
    async fn validate(&self, signal: &TradingSignal) -> Result<ValidatorVerdict>;

    /// Minimum validated confidence the gateway requires when
    /// `require_ai_analysis` is set.
    fn approval_threshold(&self) -> f64;
}

/// Upstream thesis check for open trades: reports whether the originating
/// signal has been invalidated. Failures default to "still valid" so a
/// flaky collaborator cannot force-close positions.
#[async_trait]
pub trait InvalidationCheck: Send + Sync {
    async fn is_invalidated(&self, signal_id: uuid::Uuid, symbol: &str) -> Result<bool>;
}
