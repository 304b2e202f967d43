use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

/// What is actually being traded: shares, or an option contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AssetKind {
    Stock,
    Option {
        strike: f64,
        expiry: NaiveDate,
        right: OptionRight,
    },
}

impl AssetKind {
    pub fn is_option(&self) -> bool {
        matches!(self, AssetKind::Option { .. })
    }

    /// Contract multiplier: 100 for options, 1 for shares.
    pub fn multiplier(&self) -> f64 {
        if self.is_option() {
            100.0
        } else {
            1.0
        }
    }
}

/// Candidate trade signal produced by the upstream screening pipeline.
/// Immutable once read; consumed exactly once per evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub asset: AssetKind,
    pub entry_price: f64,
    pub entry_zone: Option<(f64, f64)>,
    pub stop_loss: Option<f64>,
    pub targets: Vec<f64>,
    pub confidence: Option<f64>,
    /// Confidence assigned by the external AI validation step, if it ran.
    pub ai_confidence: Option<f64>,
    pub strategy: String,
    pub timeframe: String,
    pub generated_at: DateTime<Utc>,
}

impl TradingSignal {
    pub fn new(symbol: impl Into<String>, direction: Direction, entry_price: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            direction,
            asset: AssetKind::Stock,
            entry_price,
            entry_zone: None,
            stop_loss: None,
            targets: Vec::new(),
            confidence: None,
            ai_confidence: None,
            strategy: "manual".to_string(),
            timeframe: "daily".to_string(),
            generated_at: Utc::now(),
        }
    }
}
