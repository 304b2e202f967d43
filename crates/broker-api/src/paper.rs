use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use bot_core::TradingSignal;

use crate::{
    AccountSnapshot, BrokerClient, BrokerPosition, MarketClock, Order, OrderRequest, OrderStatus,
    OptionQuote, QuoteFeed, SignalSource,
};

/// Instant-fill simulated broker. Fills every market order at the last
/// price set via [`PaperBroker::set_price`]; used by tests and by the agent
/// when no live broker is configured.
pub struct PaperBroker {
    equity: Mutex<f64>,
    cash: Mutex<f64>,
    prices: Mutex<HashMap<String, f64>>,
    option_quotes: Mutex<HashMap<String, OptionQuote>>,
    orders: Mutex<HashMap<String, Order>>,
    clock: Mutex<MarketClock>,
}

impl PaperBroker {
    pub fn new(starting_equity: f64) -> Self {
        let now = Utc::now();
        Self {
            equity: Mutex::new(starting_equity),
            cash: Mutex::new(starting_equity),
            prices: Mutex::new(HashMap::new()),
            option_quotes: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            clock: Mutex::new(MarketClock {
                is_open: true,
                next_open: now + Duration::hours(18),
                next_close: now + Duration::hours(6),
            }),
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices
            .lock()
            .unwrap()
            .insert(symbol.to_string(), price);
    }

    pub fn set_clock(&self, clock: MarketClock) {
        *self.clock.lock().unwrap() = clock;
    }

    pub fn set_option_quote(&self, symbol: &str, quote: OptionQuote) {
        self.option_quotes
            .lock()
            .unwrap()
            .insert(symbol.to_string(), quote);
    }

    fn price_of(&self, symbol: &str) -> Result<f64> {
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no paper price for {}", symbol))
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn get_account(&self) -> Result<AccountSnapshot> {
        let equity = *self.equity.lock().unwrap();
        let cash = *self.cash.lock().unwrap();
        Ok(AccountSnapshot {
            id: "paper".to_string(),
            currency: "USD".to_string(),
            equity: format!("{equity:.2}"),
            buying_power: format!("{:.2}", cash * 2.0),
            cash: format!("{cash:.2}"),
            trading_blocked: false,
        })
    }

    async fn get_position(&self, _symbol: &str) -> Result<Option<BrokerPosition>> {
        // The pipeline tracks its own positions through the trade store;
        // the paper broker does not maintain a separate book.
        Ok(None)
    }

    async fn submit_order(&self, request: OrderRequest) -> Result<Order> {
        let price = self.price_of(&request.symbol)?;
        let qty = match (request.qty, request.notional) {
            (Some(q), _) => q,
            (None, Some(n)) => n / price,
            (None, None) => return Err(anyhow!("order has neither qty nor notional")),
        };

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4().to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            status: OrderStatus::Filled,
            submitted_at: now,
            filled_at: Some(now),
            filled_qty: Some(format!("{qty}")),
            filled_avg_price: Some(format!("{price}")),
        };
        self.orders
            .lock()
            .unwrap()
            .insert(order.id.clone(), order.clone());
        tracing::debug!(
            "Paper fill: {:?} {} x{:.4} @ ${:.2}",
            request.side,
            request.symbol,
            qty,
            price
        );
        Ok(order)
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown order {}", order_id))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut orders = self.orders.lock().unwrap();
        match orders.get_mut(order_id) {
            Some(order) if order.status != OrderStatus::Filled => {
                order.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(_) => Err(anyhow!("order {} already filled", order_id)),
            None => Err(anyhow!("unknown order {}", order_id)),
        }
    }

    async fn get_clock(&self) -> Result<MarketClock> {
        Ok(self.clock.lock().unwrap().clone())
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn broker_name(&self) -> &str {
        "paper"
    }
}

#[async_trait]
impl QuoteFeed for PaperBroker {
    async fn get_current_price(&self, symbol: &str) -> Result<f64> {
        self.price_of(symbol)
    }

    async fn get_option_quote(&self, symbol: &str) -> Result<OptionQuote> {
        self.option_quotes
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow!("no option quote for {}", symbol))
    }
}

/// Quote feed backed by a fixed price map. Shares a price book shape with
/// the paper broker so tests can drive both from one place.
#[derive(Default)]
pub struct FixedQuoteFeed {
    prices: Mutex<HashMap<String, f64>>,
    option_quotes: Mutex<HashMap<String, OptionQuote>>,
}

impl FixedQuoteFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices
            .lock()
            .unwrap()
            .insert(symbol.to_string(), price);
    }

    pub fn set_option_quote(&self, symbol: &str, quote: OptionQuote) {
        self.option_quotes
            .lock()
            .unwrap()
            .insert(symbol.to_string(), quote);
    }
}

#[async_trait]
impl QuoteFeed for FixedQuoteFeed {
    async fn get_current_price(&self, symbol: &str) -> Result<f64> {
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no quote for {}", symbol))
    }

    async fn get_option_quote(&self, symbol: &str) -> Result<OptionQuote> {
        self.option_quotes
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow!("no option quote for {}", symbol))
    }
}

/// Signal source backed by an in-memory queue. Draining consumes the
/// queued signals (read-once contract).
#[derive(Default)]
pub struct QueueSignalSource {
    queue: Mutex<Vec<TradingSignal>>,
}

impl QueueSignalSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, signal: TradingSignal) {
        self.queue.lock().unwrap().push(signal);
    }
}

#[async_trait]
impl SignalSource for QueueSignalSource {
    async fn drain_signals(&self) -> Result<Vec<TradingSignal>> {
        Ok(std::mem::take(&mut *self.queue.lock().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OrderSide;

    #[tokio::test]
    async fn paper_broker_fills_instantly() {
        let broker = PaperBroker::new(100_000.0);
        broker.set_price("AAPL", 150.0);

        let order = broker
            .submit_order(OrderRequest::buy("AAPL", 5.0))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_avg_price_f64(), Some(150.0));
        assert_eq!(order.filled_qty_f64(), Some(5.0));

        let fetched = broker.get_order(&order.id).await.unwrap();
        assert_eq!(fetched.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn account_dollar_strings_parse_through_exact_decimals() {
        use rust_decimal::Decimal;

        let broker = PaperBroker::new(100_000.10);
        let account = broker.get_account().await.unwrap();
        assert_eq!(account.equity_decimal(), Decimal::new(10_000_010, 2));
        assert_eq!(account.buying_power_decimal(), Decimal::new(20_000_020, 2));
        assert!((account.equity_f64() - 100_000.10).abs() < 1e-9);
    }

    #[tokio::test]
    async fn notional_orders_fill_fractional_qty() {
        let broker = PaperBroker::new(10_000.0);
        broker.set_price("AMZN", 200.0);

        let order = broker
            .submit_order(OrderRequest::notional("AMZN", OrderSide::Buy, 50.0))
            .await
            .unwrap();
        assert_eq!(order.filled_qty_f64(), Some(0.25));
    }

    #[tokio::test]
    async fn drained_signals_are_consumed() {
        use bot_core::Direction;

        let source = QueueSignalSource::new();
        source.push(TradingSignal::new("NVDA", Direction::Long, 500.0));

        assert_eq!(source.drain_signals().await.unwrap().len(), 1);
        assert!(source.drain_signals().await.unwrap().is_empty());
    }

    #[test]
    fn option_quote_spread_pct() {
        let quote = OptionQuote {
            symbol: "SPY".to_string(),
            bid: 2.40,
            ask: 2.60,
            open_interest: 500,
            delta: 0.45,
            expiry: None,
            as_of: Utc::now(),
        };
        assert!((quote.spread_pct() - 8.0).abs() < 1e-9);
        assert!(!quote.is_stale(Utc::now(), 60));
    }
}
