use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal::unix::SignalKind;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use uuid::Uuid;

mod commands;
mod config;
mod trader;
#[cfg(test)]
mod tests;

use backtest_runner::{BacktestPool, JobStatus};
use bot_core::{MemoryTradeStore, TradeStatus, TradeStore};
use broker_api::{BrokerClient, PaperBroker, QueueSignalSource};
use commands::TraderCommand;
use config::AgentConfig;
use trader::AutoTrader;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting TradeSentry auto-trader");

    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Execution mode: {:?}", config.bot.execution_mode);
    tracing::info!("  Sizing mode: {:?}", config.bot.sizing_mode);
    tracing::info!(
        "  Position caps: ${} stock / ${} option",
        config.bot.max_stock_position_usd,
        config.bot.max_option_position_usd
    );
    tracing::info!(
        "  Daily limits: {} trades, ${} loss cap",
        config.bot.max_trades_per_day,
        config.bot.max_daily_loss_usd
    );
    tracing::info!(
        "  Circuit breaker: warn {}% / pause {}% / halt {}%",
        config.bot.cb_warning_pct,
        config.bot.cb_pause_pct,
        config.bot.cb_halt_pct
    );
    tracing::info!("  Tick interval: {}s", config.tick_interval_seconds);

    // Safety gate: paper by default, live requires LIVE_TRADING_APPROVED=yes
    let live_requested = !config.broker_base_url.eq_ignore_ascii_case("paper");
    if live_requested {
        let approved = std::env::var("LIVE_TRADING_APPROVED")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        if !approved {
            tracing::error!(
                "BROKER_BASE_URL points to live trading ({}). \
                 Set LIVE_TRADING_APPROVED=yes to enable, or use \"paper\".",
                config.broker_base_url
            );
            std::process::exit(1);
        }
        tracing::warn!(
            "LIVE TRADING MODE — REAL MONEY AT RISK ({})",
            config.broker_base_url
        );
    }

    // Wire the paper stack. The broker/quote/signal traits are the seam for
    // a live integration.
    let paper = Arc::new(PaperBroker::new(config.paper_starting_equity));
    let broker: Arc<dyn BrokerClient> = paper.clone();
    let quotes = paper.clone();
    let signals = Arc::new(QueueSignalSource::new());
    let store = Arc::new(MemoryTradeStore::new());
    tracing::info!(
        "{} broker ready (paper: {})",
        broker.broker_name(),
        broker.is_paper()
    );

    let pool = Arc::new(
        BacktestPool::new(config.backtest_max_concurrent).with_acquire_timeout(
            Duration::from_secs(config.backtest_slot_timeout_secs),
        ),
    );
    tracing::info!(
        "Backtest pool ready ({} concurrent slots)",
        config.backtest_max_concurrent
    );

    let tick_interval = config.tick_interval_seconds;
    let trader = Arc::new(AutoTrader::new(
        config,
        store.clone(),
        broker,
        quotes,
        signals.clone(),
    ));
    trader.start().await?;

    // Command surface: operator console on stdin feeding the channel the
    // trader serves between ticks.
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<TraderCommand>(32);
    spawn_console(cmd_tx, store.clone(), pool);

    tracing::info!(
        "Ticking every {}s. Commands: pause resume approve <id> reject <id> \
         close <id> cb-reset status [json] backtest. Ctrl+C to stop.",
        tick_interval
    );

    let mut interval = time::interval(Duration::from_secs(tick_interval));
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = trader.tick().await {
                    tracing::error!("Tick failed: {}", e);
                }
            }
            Some(command) = cmd_rx.recv() => {
                trader.handle_command(command).await;
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, exiting gracefully...");
                let snapshot = trader.state_snapshot().await;
                tracing::info!(
                    "Final state: {:?}, daily P&L ${:.2}, {} trades today",
                    snapshot.state.status,
                    snapshot.state.daily_pl,
                    snapshot.state.daily_trades_count
                );
                break;
            }
        }
    }

    tracing::info!("Auto-trader shut down.");
    Ok(())
}

/// Minimal operator console: one command per stdin line.
fn spawn_console(
    cmd_tx: mpsc::Sender<TraderCommand>,
    store: Arc<MemoryTradeStore>,
    pool: Arc<BacktestPool>,
) {
    tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut parts = line.split_whitespace();
            let Some(verb) = parts.next() else { continue };
            let command = match (verb, parts.next()) {
                ("pause", _) => Some(TraderCommand::Pause),
                ("resume", _) => Some(TraderCommand::Resume),
                ("cb-reset", _) => Some(TraderCommand::ResetCircuitBreaker),
                ("approve", Some(id)) => parse_id(id).map(|trade_id| TraderCommand::ApproveTrade { trade_id }),
                ("reject", Some(id)) => parse_id(id).map(|trade_id| TraderCommand::RejectTrade { trade_id }),
                ("close", Some(id)) => parse_id(id).map(|trade_id| TraderCommand::ManualClose { trade_id }),
                ("status", as_json) => {
                    let (reply, rx) = oneshot::channel();
                    if cmd_tx.send(TraderCommand::Snapshot { reply }).await.is_ok() {
                        if let Ok(snapshot) = rx.await {
                            if as_json == Some("json") {
                                match serde_json::to_string_pretty(&snapshot) {
                                    Ok(json) => println!("{json}"),
                                    Err(e) => tracing::error!("Snapshot serialization failed: {}", e),
                                }
                            } else {
                                tracing::info!(
                                    "Status: {:?} | breaker {:?} | daily P&L ${:.2} | {} open, {} trades today, {} errors",
                                    snapshot.state.status,
                                    snapshot.state.circuit_breaker,
                                    snapshot.state.daily_pl,
                                    snapshot.state.open_positions_count,
                                    snapshot.state.daily_trades_count,
                                    snapshot.state.consecutive_errors
                                );
                            }
                        }
                    }
                    None
                }
                ("backtest", _) => {
                    run_history_replay(&pool, &store).await;
                    None
                }
                _ => {
                    tracing::warn!("Unknown command: {}", line.trim());
                    None
                }
            };
            if let Some(command) = command {
                if cmd_tx.send(command).await.is_err() {
                    break;
                }
            }
        }
    });
}

fn parse_id(s: &str) -> Option<Uuid> {
    match Uuid::parse_str(s) {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!("Invalid trade id: {}", s);
            None
        }
    }
}

/// Replay closed-trade history through the bounded pool: aggregate realized
/// P&L and win rate off the async runtime.
async fn run_history_replay(pool: &BacktestPool, store: &Arc<MemoryTradeStore>) {
    let closed = match store.with_status(TradeStatus::Closed) {
        Ok(closed) => closed,
        Err(e) => {
            tracing::error!("History replay failed to load trades: {}", e);
            return;
        }
    };

    let outcome = pool
        .run_to_outcome(move || {
            let total: f64 = closed.iter().filter_map(|t| t.realized_pl).sum();
            let wins = closed
                .iter()
                .filter(|t| t.realized_pl.unwrap_or(0.0) > 0.0)
                .count();
            tracing::info!(
                "History replay: {} closed trades, {} winners, net P&L ${:.2}",
                closed.len(),
                wins,
                total
            );
            Ok(())
        })
        .await;

    match outcome.status {
        JobStatus::Completed => {}
        JobStatus::Failed => tracing::warn!(
            "History replay {} failed: {}",
            outcome.id,
            outcome.error.as_deref().unwrap_or("unknown")
        ),
    }
}
