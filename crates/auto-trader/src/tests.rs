use std::sync::Arc;

use anyhow::{anyhow, Result};
use approx::assert_relative_eq;
use async_trait::async_trait;
use uuid::Uuid;

use bot_core::{
    BotConfig, BotStatus, CircuitBreakerLevel, Direction, ExecutionMode, ExitReason,
    MemoryTradeStore, TradeStatus, TradeStore, TradingSignal,
};
use broker_api::{
    AccountSnapshot, BrokerClient, BrokerPosition, FixedQuoteFeed, InvalidationCheck, MarketClock,
    Order, OrderRequest, OrderStatus, PaperBroker, QueueSignalSource, TradeValidator,
    ValidatorVerdict,
};

use crate::commands::TraderCommand;
use crate::config::AgentConfig;
use crate::trader::AutoTrader;

fn agent_config(mode: ExecutionMode) -> AgentConfig {
    AgentConfig {
        bot: BotConfig {
            execution_mode: mode,
            ..BotConfig::default()
        },
        tick_interval_seconds: 30,
        external_call_timeout_secs: 2,
        max_consecutive_errors: 2,
        backtest_max_concurrent: 3,
        backtest_slot_timeout_secs: 5,
        paper_starting_equity: 100_000.0,
        broker_base_url: "paper".to_string(),
    }
}

struct Rig {
    trader: AutoTrader,
    paper: Arc<PaperBroker>,
    signals: Arc<QueueSignalSource>,
    store: Arc<MemoryTradeStore>,
}

/// Full paper stack: the paper broker serves orders and quotes.
fn rig(mode: ExecutionMode) -> Rig {
    let config = agent_config(mode);
    let paper = Arc::new(PaperBroker::new(config.paper_starting_equity));
    let signals = Arc::new(QueueSignalSource::new());
    let store = Arc::new(MemoryTradeStore::new());
    let trader = AutoTrader::new(
        config,
        store.clone(),
        paper.clone(),
        paper.clone(),
        signals.clone(),
    );
    Rig {
        trader,
        paper,
        signals,
        store,
    }
}

/// Validator that either returns a scripted confidence or fails outright.
struct ScriptedValidator {
    verdict: Option<f64>,
}

#[async_trait]
impl TradeValidator for ScriptedValidator {
    async fn validate(&self, _signal: &TradingSignal) -> Result<ValidatorVerdict> {
        match self.verdict {
            Some(confidence) => Ok(ValidatorVerdict {
                confidence,
                reasoning: "scripted".to_string(),
            }),
            None => Err(anyhow!("validator offline")),
        }
    }

    fn approval_threshold(&self) -> f64 {
        0.60
    }
}

/// Paper broker variant whose orders rest until polled and whose fills
/// carry no average price.
struct NoAvgPriceBroker {
    inner: PaperBroker,
}

#[async_trait]
impl BrokerClient for NoAvgPriceBroker {
    async fn get_account(&self) -> Result<AccountSnapshot> {
        self.inner.get_account().await
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<BrokerPosition>> {
        self.inner.get_position(symbol).await
    }

    async fn submit_order(&self, request: OrderRequest) -> Result<Order> {
        let mut order = self.inner.submit_order(request).await?;
        order.status = OrderStatus::New;
        order.filled_avg_price = None;
        order.filled_qty = None;
        Ok(order)
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        let mut order = self.inner.get_order(order_id).await?;
        order.filled_avg_price = None;
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.inner.cancel_order(order_id).await
    }

    async fn get_clock(&self) -> Result<MarketClock> {
        self.inner.get_clock().await
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn broker_name(&self) -> &str {
        "no-avg-price"
    }
}

struct AlwaysInvalidated;

#[async_trait]
impl InvalidationCheck for AlwaysInvalidated {
    async fn is_invalidated(&self, _signal_id: Uuid, _symbol: &str) -> Result<bool> {
        Ok(true)
    }
}

fn long_signal(symbol: &str, entry: f64) -> TradingSignal {
    let mut signal = TradingSignal::new(symbol, Direction::Long, entry);
    signal.confidence = Some(0.90);
    signal.strategy = "breakout".to_string();
    signal
}

#[tokio::test]
async fn full_auto_signal_becomes_open_trade() {
    let rig = rig(ExecutionMode::FullAuto);
    rig.paper.set_price("AAPL", 150.0);
    rig.signals.push(long_signal("AAPL", 150.0));

    rig.trader.start().await.unwrap();
    rig.trader.tick().await.unwrap();

    let open = rig.store.open_trades().unwrap();
    assert_eq!(open.len(), 1);
    let trade = &open[0];
    assert_eq!(trade.symbol, "AAPL");
    // $500 stock cap at $150/share -> 3 whole shares
    assert_relative_eq!(trade.quantity, 3.0);
    assert_relative_eq!(trade.entry_price, 150.0);
    assert_eq!(trade.high_water_mark, Some(150.0));

    let snapshot = rig.trader.state_snapshot().await;
    assert_eq!(snapshot.state.open_positions_count, 1);
    assert_eq!(snapshot.state.daily_trades_count, 1);
    assert_eq!(snapshot.state.consecutive_errors, 0);
}

#[tokio::test]
async fn signal_only_mode_creates_no_trades() {
    let rig = rig(ExecutionMode::SignalOnly);
    rig.paper.set_price("NVDA", 500.0);
    rig.signals.push(long_signal("NVDA", 500.0));

    rig.trader.start().await.unwrap();
    rig.trader.tick().await.unwrap();

    assert!(rig.store.recent(10).unwrap().is_empty());
    let snapshot = rig.trader.state_snapshot().await;
    assert_eq!(snapshot.state.daily_trades_count, 0);
}

#[tokio::test]
async fn semi_auto_parks_trade_until_approval() {
    let rig = rig(ExecutionMode::SemiAuto);
    rig.paper.set_price("MSFT", 400.0);
    rig.signals.push(long_signal("MSFT", 400.0));

    rig.trader.start().await.unwrap();
    rig.trader.tick().await.unwrap();

    let pending = rig.store.pending_approval().unwrap();
    assert_eq!(pending.len(), 1);
    assert!(rig.store.open_trades().unwrap().is_empty());

    rig.trader
        .handle_command(TraderCommand::ApproveTrade {
            trade_id: pending[0].id,
        })
        .await;

    // Approval advances the same record through gate, sizing, and
    // submission; the paper broker fills instantly.
    let open = rig.store.open_trades().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, pending[0].id);
    assert_relative_eq!(open[0].quantity, 1.0); // $500 cap at $400/share

    let approved = rig.store.get(pending[0].id).unwrap().unwrap();
    assert_eq!(approved.status, TradeStatus::Open);
    assert_relative_eq!(approved.entry_price, 400.0);
}

#[tokio::test]
async fn approval_rejected_by_gate_cancels_parked_trade() {
    let rig = rig(ExecutionMode::SemiAuto);
    rig.paper.set_price("MSFT", 400.0);
    rig.signals.push(long_signal("MSFT", 400.0));

    rig.trader.start().await.unwrap();
    rig.trader.tick().await.unwrap();

    let pending = rig.store.pending_approval().unwrap();
    assert_eq!(pending.len(), 1);

    // Bot paused between park and approval: the gate rejects and the
    // parked trade ends cancelled, never opened under another id.
    rig.trader.handle_command(TraderCommand::Pause).await;
    rig.trader
        .handle_command(TraderCommand::ApproveTrade {
            trade_id: pending[0].id,
        })
        .await;

    let trade = rig.store.get(pending[0].id).unwrap().unwrap();
    assert_eq!(trade.status, TradeStatus::Cancelled);
    assert!(rig.store.open_trades().unwrap().is_empty());
    let snapshot = rig.trader.state_snapshot().await;
    assert_eq!(snapshot.state.consecutive_errors, 0);
}

#[tokio::test]
async fn semi_auto_rejection_cancels_parked_trade() {
    let rig = rig(ExecutionMode::SemiAuto);
    rig.paper.set_price("MSFT", 400.0);
    rig.signals.push(long_signal("MSFT", 400.0));

    rig.trader.start().await.unwrap();
    rig.trader.tick().await.unwrap();

    let pending = rig.store.pending_approval().unwrap();
    rig.trader
        .handle_command(TraderCommand::RejectTrade {
            trade_id: pending[0].id,
        })
        .await;

    let trade = rig.store.get(pending[0].id).unwrap().unwrap();
    assert_eq!(trade.status, TradeStatus::Cancelled);
    assert!(rig.store.open_trades().unwrap().is_empty());
}

#[tokio::test]
async fn gateway_rejection_is_not_an_error() {
    let rig = rig(ExecutionMode::FullAuto);
    rig.paper.set_price("AAPL", 150.0);
    let mut signal = long_signal("AAPL", 150.0);
    signal.confidence = Some(0.50); // below the 0.70 floor
    rig.signals.push(signal);

    rig.trader.start().await.unwrap();
    rig.trader.tick().await.unwrap();

    assert!(rig.store.recent(10).unwrap().is_empty());
    let snapshot = rig.trader.state_snapshot().await;
    assert_eq!(snapshot.state.consecutive_errors, 0);
}

#[tokio::test]
async fn stop_loss_closes_trade_and_books_pl_once() {
    let rig = rig(ExecutionMode::FullAuto);
    rig.paper.set_price("AAPL", 150.0);
    rig.signals.push(long_signal("AAPL", 150.0));

    rig.trader.start().await.unwrap();
    rig.trader.tick().await.unwrap();
    assert_eq!(rig.store.open_trades().unwrap().len(), 1);

    // Default 5% stop from $150 sits at $142.50
    rig.paper.set_price("AAPL", 142.0);
    rig.trader.tick().await.unwrap();

    let closed = rig.store.with_status(TradeStatus::Closed).unwrap();
    assert_eq!(closed.len(), 1);
    let trade = &closed[0];
    assert_eq!(trade.exit_reason, Some(ExitReason::StopLoss));
    assert_relative_eq!(trade.realized_pl.unwrap(), -24.0); // (142-150) * 3

    let snapshot = rig.trader.state_snapshot().await;
    assert_relative_eq!(snapshot.state.daily_pl, -24.0);
    assert_eq!(snapshot.state.daily_losses, 1);
    assert_eq!(snapshot.state.open_positions_count, 0);

    // Closed trades never re-enter the pass; P&L is booked exactly once
    rig.trader.tick().await.unwrap();
    let snapshot = rig.trader.state_snapshot().await;
    assert_relative_eq!(snapshot.state.daily_pl, -24.0);
    assert_eq!(snapshot.state.daily_losses, 1);
}

#[tokio::test]
async fn take_profit_books_a_win() {
    let rig = rig(ExecutionMode::FullAuto);
    rig.paper.set_price("AAPL", 150.0);
    rig.signals.push(long_signal("AAPL", 150.0));

    rig.trader.start().await.unwrap();
    rig.trader.tick().await.unwrap();

    // Default 10% target from $150 sits at $165
    rig.paper.set_price("AAPL", 166.0);
    rig.trader.tick().await.unwrap();

    let closed = rig.store.with_status(TradeStatus::Closed).unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, Some(ExitReason::TakeProfit));
    assert_relative_eq!(closed[0].realized_pl.unwrap(), 48.0); // (166-150) * 3

    let snapshot = rig.trader.state_snapshot().await;
    assert_eq!(snapshot.state.daily_wins, 1);
}

#[tokio::test]
async fn breaker_halts_after_heavy_loss_and_blocks_new_entries() {
    let rig = rig(ExecutionMode::FullAuto);
    rig.paper.set_price("AAPL", 150.0);
    rig.signals.push(long_signal("AAPL", 150.0));

    rig.trader.start().await.unwrap();
    rig.trader.tick().await.unwrap();

    // Shrink the loss basis so the $24 stop-out is a 12% daily loss
    rig.trader
        .handle_command(TraderCommand::ResetDaily {
            start_equity: 200.0,
        })
        .await;

    rig.paper.set_price("AAPL", 142.0);
    rig.trader.tick().await.unwrap();

    let snapshot = rig.trader.state_snapshot().await;
    assert_eq!(snapshot.state.circuit_breaker, CircuitBreakerLevel::Halted);

    // Halted breaker: the whole new-signal pass is skipped
    rig.paper.set_price("TSLA", 200.0);
    rig.signals.push(long_signal("TSLA", 200.0));
    rig.trader.tick().await.unwrap();

    assert!(rig.store.open_trades().unwrap().is_empty());
    assert!(rig
        .store
        .with_status(TradeStatus::PendingEntry)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn manual_close_command_exits_via_kill_switch() {
    let rig = rig(ExecutionMode::FullAuto);
    rig.paper.set_price("AAPL", 150.0);
    rig.signals.push(long_signal("AAPL", 150.0));

    rig.trader.start().await.unwrap();
    rig.trader.tick().await.unwrap();

    let open = rig.store.open_trades().unwrap();
    rig.trader
        .handle_command(TraderCommand::ManualClose {
            trade_id: open[0].id,
        })
        .await;

    // Kill switch outranks every other exit condition
    rig.trader.tick().await.unwrap();

    let trade = rig.store.get(open[0].id).unwrap().unwrap();
    assert_eq!(trade.status, TradeStatus::Closed);
    assert_eq!(trade.exit_reason, Some(ExitReason::KillSwitch));
    assert_relative_eq!(trade.realized_pl.unwrap(), 0.0);
}

#[tokio::test]
async fn quote_outage_keeps_trade_open_then_error_streak_pauses() {
    // Broker has prices (orders fill) but the quote feed has none, so
    // every monitor pass fails.
    let config = agent_config(ExecutionMode::FullAuto);
    let paper = Arc::new(PaperBroker::new(config.paper_starting_equity));
    let quotes = Arc::new(FixedQuoteFeed::new());
    let signals = Arc::new(QueueSignalSource::new());
    let store = Arc::new(MemoryTradeStore::new());
    let trader = AutoTrader::new(
        config,
        store.clone(),
        paper.clone(),
        quotes,
        signals.clone(),
    );

    paper.set_price("AAPL", 150.0);
    signals.push(long_signal("AAPL", 150.0));

    trader.start().await.unwrap();
    // Entry works: sizing falls back to the signal entry price when the
    // quote lookup fails, and the broker fills. The same tick's monitor
    // pass then fails on the missing quote.
    trader.tick().await.unwrap();

    let open = store.open_trades().unwrap();
    assert_eq!(open.len(), 1);
    let snapshot = trader.state_snapshot().await;
    assert_eq!(snapshot.state.consecutive_errors, 1);
    assert_eq!(snapshot.state.status, BotStatus::Running);

    // Second failed pass reaches the streak limit and pauses the bot;
    // the trade is never force-closed on missing data.
    trader.tick().await.unwrap();
    let snapshot = trader.state_snapshot().await;
    assert_eq!(snapshot.state.status, BotStatus::Paused);
    assert_eq!(store.open_trades().unwrap().len(), 1);
}

#[tokio::test]
async fn pause_and_resume_commands_gate_new_entries() {
    let rig = rig(ExecutionMode::FullAuto);
    rig.paper.set_price("AAPL", 150.0);

    rig.trader.start().await.unwrap();
    rig.trader.handle_command(TraderCommand::Pause).await;

    rig.signals.push(long_signal("AAPL", 150.0));
    rig.trader.tick().await.unwrap();
    assert!(rig.store.open_trades().unwrap().is_empty());

    rig.trader.handle_command(TraderCommand::Resume).await;
    rig.signals.push(long_signal("AAPL", 150.0));
    rig.trader.tick().await.unwrap();
    assert_eq!(rig.store.open_trades().unwrap().len(), 1);
}

#[tokio::test]
async fn exit_fill_without_avg_price_books_at_quote() {
    let config = agent_config(ExecutionMode::FullAuto);
    let paper = PaperBroker::new(config.paper_starting_equity);
    paper.set_price("AAPL", 150.0);
    let broker = Arc::new(NoAvgPriceBroker { inner: paper });
    let quotes = Arc::new(FixedQuoteFeed::new());
    quotes.set_price("AAPL", 150.0);
    let signals = Arc::new(QueueSignalSource::new());
    let store = Arc::new(MemoryTradeStore::new());
    let trader = AutoTrader::new(
        config,
        store.clone(),
        broker.clone(),
        quotes.clone(),
        signals.clone(),
    );

    signals.push(long_signal("AAPL", 150.0));
    trader.start().await.unwrap();

    // Entry order rests one tick, then resolves to a fill
    trader.tick().await.unwrap();
    assert_eq!(store.with_status(TradeStatus::PendingEntry).unwrap().len(), 1);
    trader.tick().await.unwrap();
    assert_eq!(store.open_trades().unwrap().len(), 1);

    // Price through the 5% stop; the exit order rests one tick too
    broker.inner.set_price("AAPL", 140.0);
    quotes.set_price("AAPL", 140.0);
    trader.tick().await.unwrap();
    assert_eq!(store.with_status(TradeStatus::PendingExit).unwrap().len(), 1);

    trader.tick().await.unwrap();
    let closed = store.with_status(TradeStatus::Closed).unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, Some(ExitReason::StopLoss));
    // Booked at the $140 quote, never silently at the entry price
    assert_relative_eq!(closed[0].realized_pl.unwrap(), -30.0); // (140-150) * 3
}

#[tokio::test]
async fn validator_outage_falls_back_to_neutral_and_gate_rejects() {
    let mut config = agent_config(ExecutionMode::FullAuto);
    config.bot.require_ai_analysis = true;
    let paper = Arc::new(PaperBroker::new(config.paper_starting_equity));
    let signals = Arc::new(QueueSignalSource::new());
    let store = Arc::new(MemoryTradeStore::new());
    let trader = AutoTrader::new(
        config,
        store.clone(),
        paper.clone(),
        paper.clone(),
        signals.clone(),
    )
    .with_validator(Arc::new(ScriptedValidator { verdict: None }));

    paper.set_price("AAPL", 150.0);
    signals.push(long_signal("AAPL", 150.0));

    trader.start().await.unwrap();
    trader.tick().await.unwrap();

    // Neutral 0.50 sits below the 0.60 validator threshold, so the gate
    // rejects; a validator outage is never an execution error.
    assert!(store.recent(10).unwrap().is_empty());
    let snapshot = trader.state_snapshot().await;
    assert_eq!(snapshot.state.consecutive_errors, 0);
}

#[tokio::test]
async fn confident_validator_verdict_clears_the_ai_gate() {
    let mut config = agent_config(ExecutionMode::FullAuto);
    config.bot.require_ai_analysis = true;
    let paper = Arc::new(PaperBroker::new(config.paper_starting_equity));
    let signals = Arc::new(QueueSignalSource::new());
    let store = Arc::new(MemoryTradeStore::new());
    let trader = AutoTrader::new(
        config,
        store.clone(),
        paper.clone(),
        paper.clone(),
        signals.clone(),
    )
    .with_validator(Arc::new(ScriptedValidator {
        verdict: Some(0.85),
    }));

    paper.set_price("AAPL", 150.0);
    signals.push(long_signal("AAPL", 150.0));

    trader.start().await.unwrap();
    trader.tick().await.unwrap();

    assert_eq!(store.open_trades().unwrap().len(), 1);
}

#[tokio::test]
async fn invalidated_signal_closes_position() {
    let config = agent_config(ExecutionMode::FullAuto);
    let paper = Arc::new(PaperBroker::new(config.paper_starting_equity));
    let signals = Arc::new(QueueSignalSource::new());
    let store = Arc::new(MemoryTradeStore::new());
    let trader = AutoTrader::new(
        config,
        store.clone(),
        paper.clone(),
        paper.clone(),
        signals.clone(),
    )
    .with_invalidation_check(Arc::new(AlwaysInvalidated));

    paper.set_price("AAPL", 150.0);
    signals.push(long_signal("AAPL", 150.0));

    trader.start().await.unwrap();
    // Price never moves, so no stop or target fires; the thesis check
    // alone forces the exit at break-even.
    trader.tick().await.unwrap();

    let closed = store.with_status(TradeStatus::Closed).unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, Some(ExitReason::SignalInvalidated));
    assert_relative_eq!(closed[0].realized_pl.unwrap(), 0.0);
}
