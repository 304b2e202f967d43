use serde::{Deserialize, Serialize};

use bot_core::{AssetKind, BotConfig, SizingMode, TradingSignal};

/// Budget-capped position sizing
///
/// Derives a dollar budget from the configured sizing mode, clamps it to the
/// per-asset-type cap, then converts to units:
///   fixed_dollar:   budget = per-asset cap
///   pct_portfolio:  budget = equity * alloc_pct
///   risk_based:     budget = (equity * risk_pct / stop_distance) * price
///
/// The cap is applied BEFORE unit sizing. For risk_based this means the
/// realized dollar risk can land below the nominal risk target whenever the
/// uncapped budget would have exceeded the cap; the cap always wins, and the
/// share count is not recomputed afterwards.
///
/// "Too small to size" is a first-class rejection, never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeDecision {
    /// Shares (possibly fractional) or whole option contracts.
    pub quantity: f64,
    /// Dollar value of the sized position.
    pub notional: f64,
    /// True when the order should be submitted dollar-denominated
    /// (fractional share sizing).
    pub is_notional_order: bool,
    pub capped: bool,
    pub cap_reason: Option<String>,
    pub rejected: bool,
    pub reject_reason: Option<String>,
}

impl SizeDecision {
    fn reject(reason: impl Into<String>) -> Self {
        Self {
            quantity: 0.0,
            notional: 0.0,
            is_notional_order: false,
            capped: false,
            cap_reason: None,
            rejected: true,
            reject_reason: Some(reason.into()),
        }
    }
}

/// Minimum fractional share quantity worth submitting.
const MIN_FRACTIONAL_SHARES: f64 = 0.001;

/// Size a position for an approved signal.
///
/// `premium` is the option premium per share (contract cost = premium * 100)
/// and is required for option signals.
pub fn size_position(
    signal: &TradingSignal,
    config: &BotConfig,
    equity: f64,
    current_price: f64,
    asset: &AssetKind,
    premium: Option<f64>,
) -> SizeDecision {
    if current_price <= 0.0 {
        return SizeDecision::reject(format!(
            "invalid current price {current_price} for {}",
            signal.symbol
        ));
    }

    let cap = config.position_cap_usd(asset.is_option());
    let (raw_budget, mode_desc) = derive_budget(signal, config, equity, current_price, cap);

    let (budget, capped, cap_reason) = if raw_budget > cap {
        (
            cap,
            true,
            Some(format!(
                "{mode_desc} budget ${raw_budget:.2} clamped to ${cap:.2} cap"
            )),
        )
    } else {
        (raw_budget, false, None)
    };

    let mut decision = match asset {
        AssetKind::Stock => size_stock(budget, current_price),
        AssetKind::Option { .. } => size_option(budget, premium),
    };
    decision.capped = capped;
    decision.cap_reason = cap_reason;

    if decision.rejected {
        tracing::debug!(
            "Sizing rejected for {}: {}",
            signal.symbol,
            decision.reject_reason.as_deref().unwrap_or("?")
        );
    }
    decision
}

/// Dollar budget before cap enforcement, plus a label for diagnostics.
fn derive_budget(
    signal: &TradingSignal,
    config: &BotConfig,
    equity: f64,
    current_price: f64,
    cap: f64,
) -> (f64, &'static str) {
    match config.sizing_mode {
        SizingMode::FixedDollar => (cap, "fixed_dollar"),
        SizingMode::PctPortfolio => (equity * config.portfolio_alloc_pct / 100.0, "pct_portfolio"),
        SizingMode::RiskBased => {
            let risk_amount = equity * config.risk_per_trade_pct / 100.0;
            let stop_distance = match signal.stop_loss {
                Some(stop) if stop > 0.0 => (signal.entry_price - stop).abs(),
                _ => signal.entry_price * config.stop_loss_pct / 100.0,
            };
            if stop_distance <= 0.0 {
                // Stop sits exactly on the entry: no usable distance,
                // fall back to fixed dollar.
                return (cap, "risk_based(fallback=fixed_dollar)");
            }
            (risk_amount / stop_distance * current_price, "risk_based")
        }
    }
}

fn size_stock(budget: f64, price: f64) -> SizeDecision {
    let shares = budget / price;

    if shares < MIN_FRACTIONAL_SHARES {
        return SizeDecision::reject(format!(
            "budget ${budget:.2} sizes to {shares:.6} shares @ ${price:.2}, below minimum {MIN_FRACTIONAL_SHARES}"
        ));
    }

    if shares < 1.0 {
        // Fractional position: submit dollar-denominated at the full budget.
        return SizeDecision {
            quantity: shares,
            notional: budget,
            is_notional_order: true,
            capped: false,
            cap_reason: None,
            rejected: false,
            reject_reason: None,
        };
    }

    // Bracket-style orders need integral quantity: floor non-whole counts.
    let whole = shares.floor();
    SizeDecision {
        quantity: whole,
        notional: whole * price,
        is_notional_order: false,
        capped: false,
        cap_reason: None,
        rejected: false,
        reject_reason: None,
    }
}

fn size_option(budget: f64, premium: Option<f64>) -> SizeDecision {
    let premium = match premium {
        Some(p) if p > 0.0 => p,
        _ => return SizeDecision::reject("option premium missing or non-positive"),
    };

    let contract_cost = premium * 100.0;
    let contracts = (budget / contract_cost).floor();
    if contracts < 1.0 {
        return SizeDecision::reject(format!(
            "budget ${budget:.2} below one contract cost ${contract_cost:.2}"
        ));
    }

    SizeDecision {
        quantity: contracts,
        notional: contracts * contract_cost,
        is_notional_order: false,
        capped: false,
        cap_reason: None,
        rejected: false,
        reject_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    use bot_core::{Direction, OptionRight};

    use super::*;

    fn signal(entry: f64, stop: Option<f64>) -> TradingSignal {
        let mut s = TradingSignal::new("AAPL", Direction::Long, entry);
        s.stop_loss = stop;
        s
    }

    fn config(mode: SizingMode) -> BotConfig {
        BotConfig {
            sizing_mode: mode,
            max_stock_position_usd: 500.0,
            max_option_position_usd: 1_000.0,
            portfolio_alloc_pct: 5.0,
            risk_per_trade_pct: 1.0,
            stop_loss_pct: 5.0,
            ..BotConfig::default()
        }
    }

    #[test]
    fn fixed_dollar_whole_shares() {
        // cap=$500, price=$100 -> 5 whole shares, $500 notional
        let d = size_position(
            &signal(100.0, None),
            &config(SizingMode::FixedDollar),
            100_000.0,
            100.0,
            &AssetKind::Stock,
            None,
        );
        assert!(!d.rejected);
        assert!(!d.is_notional_order);
        assert_relative_eq!(d.quantity, 5.0);
        assert_relative_eq!(d.notional, 500.0);
    }

    #[test]
    fn risk_based_budget_capped_before_sizing() {
        // equity=$100k, risk=1% -> $1,000; entry=$100, stop=$95 -> distance $5
        // uncapped budget = 1000/5*100 = $20,000 -> capped to $500 -> 5 shares
        let d = size_position(
            &signal(100.0, Some(95.0)),
            &config(SizingMode::RiskBased),
            100_000.0,
            100.0,
            &AssetKind::Stock,
            None,
        );
        assert!(!d.rejected);
        assert!(d.capped);
        assert_relative_eq!(d.quantity, 5.0);
        assert_relative_eq!(d.notional, 500.0);
    }

    #[test]
    fn risk_based_falls_back_to_default_stop_pct() {
        // No stop on the signal: distance = entry * 5% = $5, same as above
        let d = size_position(
            &signal(100.0, None),
            &config(SizingMode::RiskBased),
            100_000.0,
            100.0,
            &AssetKind::Stock,
            None,
        );
        assert!(!d.rejected);
        assert!(d.capped);
        assert_relative_eq!(d.quantity, 5.0);
    }

    #[test]
    fn pct_portfolio_budget() {
        // 5% of $8,000 = $400 @ $100 -> 4 shares, uncapped
        let d = size_position(
            &signal(100.0, None),
            &config(SizingMode::PctPortfolio),
            8_000.0,
            100.0,
            &AssetKind::Stock,
            None,
        );
        assert!(!d.capped);
        assert_relative_eq!(d.quantity, 4.0);
    }

    #[test]
    fn fractional_sizes_as_notional_order() {
        // cap=$500, price=$1,000 -> 0.5 shares -> notional order at full budget
        let d = size_position(
            &signal(1_000.0, None),
            &config(SizingMode::FixedDollar),
            100_000.0,
            1_000.0,
            &AssetKind::Stock,
            None,
        );
        assert!(!d.rejected);
        assert!(d.is_notional_order);
        assert_relative_eq!(d.quantity, 0.5);
        assert_relative_eq!(d.notional, 500.0);
    }

    #[test]
    fn non_integer_share_count_floors() {
        // cap=$500, price=$150 -> 3.33 shares -> 3 whole shares
        let d = size_position(
            &signal(150.0, None),
            &config(SizingMode::FixedDollar),
            100_000.0,
            150.0,
            &AssetKind::Stock,
            None,
        );
        assert_relative_eq!(d.quantity, 3.0);
        assert_relative_eq!(d.notional, 450.0);
        assert!(!d.is_notional_order);
    }

    #[test]
    fn dust_budget_rejected() {
        let d = size_position(
            &signal(100_000.0, None),
            &config(SizingMode::FixedDollar),
            100.0,
            100_000_000.0,
            &AssetKind::Stock,
            None,
        );
        assert!(d.rejected);
        assert!(d.reject_reason.unwrap().contains("below minimum"));
    }

    #[test]
    fn option_contracts_floor() {
        let asset = AssetKind::Option {
            strike: 450.0,
            expiry: NaiveDate::from_ymd_opt(2027, 1, 15).unwrap(),
            right: OptionRight::Call,
        };
        // budget $1,000 / ($2.50 * 100) = 4 contracts
        let d = size_position(
            &signal(2.50, None),
            &config(SizingMode::FixedDollar),
            100_000.0,
            2.50,
            &asset,
            Some(2.50),
        );
        assert!(!d.rejected);
        assert_relative_eq!(d.quantity, 4.0);
        assert_relative_eq!(d.notional, 1_000.0);
    }

    #[test]
    fn option_without_premium_rejected() {
        let asset = AssetKind::Option {
            strike: 450.0,
            expiry: NaiveDate::from_ymd_opt(2027, 1, 15).unwrap(),
            right: OptionRight::Put,
        };
        let d = size_position(
            &signal(2.50, None),
            &config(SizingMode::FixedDollar),
            100_000.0,
            2.50,
            &asset,
            None,
        );
        assert!(d.rejected);
    }

    #[test]
    fn expensive_option_rejected() {
        let asset = AssetKind::Option {
            strike: 450.0,
            expiry: NaiveDate::from_ymd_opt(2027, 1, 15).unwrap(),
            right: OptionRight::Call,
        };
        // One contract costs $1,500 against a $1,000 cap
        let d = size_position(
            &signal(15.0, None),
            &config(SizingMode::FixedDollar),
            100_000.0,
            15.0,
            &asset,
            Some(15.0),
        );
        assert!(d.rejected);
    }

    #[test]
    fn notional_never_exceeds_cap() {
        for price in [0.37, 1.0, 42.5, 99.99, 100.0, 150.0, 1_000.0, 9_999.0] {
            for mode in [
                SizingMode::FixedDollar,
                SizingMode::PctPortfolio,
                SizingMode::RiskBased,
            ] {
                let d = size_position(
                    &signal(price, Some(price * 0.95)),
                    &config(mode),
                    1_000_000.0,
                    price,
                    &AssetKind::Stock,
                    None,
                );
                if !d.rejected {
                    assert!(
                        d.notional <= 500.0 + 1e-9,
                        "notional {} exceeds cap at price {} mode {:?}",
                        d.notional,
                        price,
                        mode
                    );
                }
            }
        }
    }
}
