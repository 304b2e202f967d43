pub mod config;
pub mod signal;
pub mod state;
pub mod store;
pub mod trade;

pub use config::{BotConfig, ExecutionMode, SizingMode};
pub use signal::{AssetKind, Direction, OptionRight, TradingSignal};
pub use state::{BotState, BotStatus, CircuitBreakerLevel};
pub use store::{MemoryTradeStore, TradeStore};
pub use trade::{ExecutedTrade, ExitReason, TradeStatus};
