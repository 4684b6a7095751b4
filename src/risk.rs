// =============================================================================
// Risk Engine — pre-trade gate and position sizing
// =============================================================================
//
// Every candidate entry passes through `evaluate` before an order may be
// placed. The gate checks, in order:
//
//   1. Capital floor — below the minimum viable capital nothing trades.
//   2. Tier position cap — STARTER/ADVANCED/ELITE allow {3, 4, 6} open
//      positions (the global hard cap of 8 is enforced separately by the
//      cleanup pass).
//   3. Sizing — risk budget scaled by signal confidence, bounded by the
//      per-position equity share and the tier's dollar cap.
//   4. Minimum notional for the venue.
//   5. Profitability guard — expected R after round-trip fees must clear the
//      configured minimum.
//   6. Expected value at the current win-rate estimate must be positive.
//
// Tiers latch upward only: an account that reaches ADVANCED never drops back
// to STARTER on a drawdown.
// =============================================================================

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::types::Signal;

/// Clamp range for signal confidence inside the risk multiplier, keeping the
/// effective budget within 0.78x..1.20x of the tier base risk.
const CONFIDENCE_FLOOR: f64 = 0.4;

// ---------------------------------------------------------------------------
// Capital tiers
// ---------------------------------------------------------------------------

/// Capital tier of an account. Transitions latch upward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum CapitalTier {
    Starter,
    Advanced,
    Elite,
}

impl CapitalTier {
    /// Tier an equity level qualifies for (before latching).
    pub fn for_equity(equity_usd: f64) -> Self {
        if equity_usd >= 10_000.0 {
            Self::Elite
        } else if equity_usd >= 2_500.0 {
            Self::Advanced
        } else {
            Self::Starter
        }
    }

    /// Maximum concurrent positions for the tier.
    pub fn max_positions(&self) -> usize {
        match self {
            Self::Starter => 3,
            Self::Advanced => 4,
            Self::Elite => 6,
        }
    }

    /// Base per-trade risk as a fraction of equity.
    pub fn base_risk_pct(&self) -> f64 {
        match self {
            Self::Starter | Self::Advanced => 0.04,
            Self::Elite => 0.05,
        }
    }

    /// Hard dollar cap on a single position.
    pub fn position_cap_usd(&self) -> f64 {
        match self {
            Self::Starter => 250.0,
            Self::Advanced => 1_000.0,
            Self::Elite => 5_000.0,
        }
    }
}

impl std::fmt::Display for CapitalTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starter => write!(f, "STARTER"),
            Self::Advanced => write!(f, "ADVANCED"),
            Self::Elite => write!(f, "ELITE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Reason the gate refused an entry. Guards return a reason code; they never
/// panic and are never used for control flow via unwinding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RiskRejection {
    InsufficientEquity { equity: f64, floor: f64 },
    BelowMinNotional { size_usd: f64, min_notional: f64 },
    OverPositionCap { open: usize, cap: usize },
    Unprofitable { expected_r: f64, min_r: f64 },
    RiskOfRuin { expected_value: f64 },
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientEquity { equity, floor } => {
                write!(f, "INSUFFICIENT_EQUITY ({equity:.2} < {floor:.2})")
            }
            Self::BelowMinNotional { size_usd, min_notional } => {
                write!(f, "BELOW_MIN_NOTIONAL ({size_usd:.2} < {min_notional:.2})")
            }
            Self::OverPositionCap { open, cap } => {
                write!(f, "OVER_POSITION_CAP ({open} >= {cap})")
            }
            Self::Unprofitable { expected_r, min_r } => {
                write!(f, "UNPROFITABLE (R {expected_r:.2} < {min_r:.2})")
            }
            Self::RiskOfRuin { expected_value } => {
                write!(f, "RISK_OF_RUIN (EV {expected_value:.4})")
            }
        }
    }
}

/// Approved entry with its sizing.
#[derive(Debug, Clone, Serialize)]
pub struct TradePlan {
    pub size_usd: f64,
    /// Effective risk budget used, fractional of equity.
    pub risk_pct: f64,
    pub tier: CapitalTier,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Static gate parameters.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Below this equity nothing trades.
    pub min_viable_capital_usd: f64,
    /// Per-position share of equity, fractional.
    pub max_position_pct: f64,
    /// Minimum fee-adjusted expected R.
    pub min_expected_r: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_viable_capital_usd: 25.0,
            max_position_pct: 0.25,
            min_expected_r: 1.8,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct WinRateTracker {
    wins: u32,
    losses: u32,
}

impl WinRateTracker {
    /// Laplace-smoothed estimate anchored at 0.55 with no history.
    fn estimate(&self) -> f64 {
        let total = self.wins + self.losses;
        if total == 0 {
            return 0.55;
        }
        (self.wins as f64 + 1.0) / (total as f64 + 2.0)
    }
}

/// Per-account risk gate.
pub struct RiskEngine {
    config: RiskConfig,
    tier: RwLock<CapitalTier>,
    win_rate: RwLock<WinRateTracker>,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            tier: RwLock::new(CapitalTier::Starter),
            win_rate: RwLock::new(WinRateTracker { wins: 0, losses: 0 }),
        }
    }

    /// Current tier after latching.
    pub fn tier(&self) -> CapitalTier {
        *self.tier.read()
    }

    /// Current win-rate estimate in (0, 1).
    pub fn win_rate(&self) -> f64 {
        self.win_rate.read().estimate()
    }

    /// Record a realized trade outcome for the win-rate estimate.
    pub fn record_outcome(&self, pnl_usd: f64) {
        let mut tracker = self.win_rate.write();
        if pnl_usd >= 0.0 {
            tracker.wins += 1;
        } else {
            tracker.losses += 1;
        }
        debug!(
            wins = tracker.wins,
            losses = tracker.losses,
            estimate = tracker.estimate(),
            "trade outcome recorded"
        );
    }

    /// Gate a candidate entry. Returns the approved sizing or the first
    /// rejection encountered, in priority order.
    pub fn evaluate(
        &self,
        equity_usd: f64,
        open_positions: usize,
        signal: &Signal,
        fee_rate: f64,
        min_notional: f64,
    ) -> Result<TradePlan, RiskRejection> {
        // ── 1. Capital floor ─────────────────────────────────────────────
        if equity_usd < self.config.min_viable_capital_usd {
            return Err(RiskRejection::InsufficientEquity {
                equity: equity_usd,
                floor: self.config.min_viable_capital_usd,
            });
        }

        // ── 2. Tier (latched upward) ─────────────────────────────────────
        let tier = {
            let mut current = self.tier.write();
            let qualified = CapitalTier::for_equity(equity_usd);
            if qualified > *current {
                info!(from = %current, to = %qualified, equity_usd, "capital tier promoted");
                *current = qualified;
            }
            *current
        };

        if open_positions >= tier.max_positions() {
            return Err(RiskRejection::OverPositionCap {
                open: open_positions,
                cap: tier.max_positions(),
            });
        }

        // ── 3. Sizing ────────────────────────────────────────────────────
        let confidence = signal.confidence.clamp(CONFIDENCE_FLOOR, 1.0);
        let risk_pct = tier.base_risk_pct() * (0.5 + confidence * 0.7);

        let stop_pct = signal.suggested_stop_pct.max(1e-6);
        let size_usd = (equity_usd * risk_pct / stop_pct)
            .min(equity_usd * self.config.max_position_pct)
            .min(tier.position_cap_usd());

        // ── 4. Venue minimum ─────────────────────────────────────────────
        if size_usd < min_notional {
            return Err(RiskRejection::BelowMinNotional {
                size_usd,
                min_notional,
            });
        }

        // ── 5. Profitability guard (fee-aware) ───────────────────────────
        let avg_target = if signal.targets.is_empty() {
            2.0 * stop_pct
        } else {
            signal.targets.iter().sum::<f64>() / signal.targets.len() as f64
        };
        let round_trip_fees = 2.0 * fee_rate;
        let net_target = avg_target - round_trip_fees;
        let net_stop = stop_pct + round_trip_fees;
        let expected_r = if net_stop > f64::EPSILON {
            net_target / net_stop
        } else {
            0.0
        };

        if expected_r < self.config.min_expected_r {
            warn!(
                symbol = %signal.symbol,
                expected_r,
                min_r = self.config.min_expected_r,
                "entry rejected by profitability guard"
            );
            return Err(RiskRejection::Unprofitable {
                expected_r,
                min_r: self.config.min_expected_r,
            });
        }

        // ── 6. Expected value at the current win rate ────────────────────
        let p = self.win_rate();
        let expected_value = p * net_target - (1.0 - p) * net_stop;
        if expected_value <= 0.0 {
            warn!(
                symbol = %signal.symbol,
                expected_value,
                win_rate = p,
                "entry rejected: negative expected value"
            );
            return Err(RiskRejection::RiskOfRuin { expected_value });
        }

        debug!(
            symbol = %signal.symbol,
            size_usd,
            risk_pct,
            tier = %tier,
            expected_r,
            "entry approved"
        );

        Ok(TradePlan {
            size_usd,
            risk_pct,
            tier,
        })
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("tier", &*self.tier.read())
            .field("win_rate", &self.win_rate())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Regime, Side};

    fn signal(stop: f64, targets: Vec<f64>, confidence: f64) -> Signal {
        Signal {
            symbol: "BTC-USD".into(),
            side: Side::Long,
            score: 75.0,
            suggested_stop_pct: stop,
            targets,
            reason: "test".into(),
            regime: Regime::Trending,
            confidence,
        }
    }

    #[test]
    fn capital_floor_rejects_tiny_accounts() {
        let engine = RiskEngine::new(RiskConfig::default());
        let sig = signal(0.015, vec![0.03, 0.045], 0.8);
        let err = engine.evaluate(10.0, 0, &sig, 0.001, 1.0).unwrap_err();
        assert!(matches!(err, RiskRejection::InsufficientEquity { .. }));
    }

    #[test]
    fn sizing_respects_all_three_bounds() {
        let engine = RiskEngine::new(RiskConfig::default());
        let sig = signal(0.015, vec![0.03, 0.045], 1.0);

        // equity 1000, risk = 0.04 * 1.2 = 0.048 -> raw 3200, but capped at
        // 25% of equity (250) which also stays under the STARTER cap (250).
        let plan = engine.evaluate(1_000.0, 0, &sig, 0.001, 1.0).unwrap();
        assert!((plan.size_usd - 250.0).abs() < 1e-9);
        assert!((plan.risk_pct - 0.048).abs() < 1e-12);
    }

    #[test]
    fn confidence_multiplier_range() {
        // Confidence clamps to [0.4, 1.0] so the multiplier spans
        // 0.78x..1.20x of base risk.
        let engine = RiskEngine::new(RiskConfig::default());

        let low = signal(0.015, vec![0.03, 0.045], 0.0);
        let plan = engine.evaluate(1_000.0, 0, &low, 0.0, 1.0).unwrap();
        assert!((plan.risk_pct - 0.04 * 0.78).abs() < 1e-12);

        let high = signal(0.015, vec![0.03, 0.045], 1.0);
        let plan = engine.evaluate(1_000.0, 0, &high, 0.0, 1.0).unwrap();
        assert!((plan.risk_pct - 0.04 * 1.20).abs() < 1e-12);
    }

    #[test]
    fn min_notional_rejection() {
        let engine = RiskEngine::new(RiskConfig::default());
        let sig = signal(0.015, vec![0.03, 0.045], 0.8);
        // Equity 30: size caps at 25% = 7.50, below a $10 venue minimum.
        let err = engine.evaluate(30.0, 0, &sig, 0.001, 10.0).unwrap_err();
        assert!(matches!(err, RiskRejection::BelowMinNotional { .. }));
    }

    #[test]
    fn tier_position_caps() {
        let engine = RiskEngine::new(RiskConfig::default());
        let sig = signal(0.015, vec![0.03, 0.045], 0.8);

        // STARTER allows 3.
        let err = engine.evaluate(1_000.0, 3, &sig, 0.001, 1.0).unwrap_err();
        assert_eq!(err, RiskRejection::OverPositionCap { open: 3, cap: 3 });

        // ELITE allows 6.
        let plan = engine.evaluate(20_000.0, 5, &sig, 0.001, 1.0);
        assert!(plan.is_ok());
        let err = engine.evaluate(20_000.0, 6, &sig, 0.001, 1.0).unwrap_err();
        assert_eq!(err, RiskRejection::OverPositionCap { open: 6, cap: 6 });
    }

    #[test]
    fn tier_latches_upward_only() {
        let engine = RiskEngine::new(RiskConfig::default());
        let sig = signal(0.015, vec![0.03, 0.045], 0.8);

        let _ = engine.evaluate(20_000.0, 0, &sig, 0.001, 1.0).unwrap();
        assert_eq!(engine.tier(), CapitalTier::Elite);

        // Drawdown to STARTER equity does not demote the tier.
        let _ = engine.evaluate(500.0, 0, &sig, 0.001, 1.0).unwrap();
        assert_eq!(engine.tier(), CapitalTier::Elite);
    }

    #[test]
    fn profitability_guard_rejects_thin_targets() {
        let engine = RiskEngine::new(RiskConfig::default());
        // avg target 0.0225 against stop 0.02 -> R well under 1.8.
        let sig = signal(0.02, vec![0.02, 0.025], 0.8);
        let err = engine.evaluate(1_000.0, 0, &sig, 0.001, 1.0).unwrap_err();
        assert!(matches!(err, RiskRejection::Unprofitable { .. }));
    }

    #[test]
    fn fees_can_flip_profitability() {
        let engine = RiskEngine::new(RiskConfig::default());
        // R = 0.036/0.018 = 2.0 without fees; heavy fees push it under 1.8.
        let sig = signal(0.018, vec![0.036], 0.8);
        assert!(engine.evaluate(1_000.0, 0, &sig, 0.0, 1.0).is_ok());
        let err = engine.evaluate(1_000.0, 0, &sig, 0.004, 1.0).unwrap_err();
        assert!(matches!(err, RiskRejection::Unprofitable { .. }));
    }

    #[test]
    fn losing_streak_trips_risk_of_ruin() {
        let engine = RiskEngine::new(RiskConfig::default());
        for _ in 0..20 {
            engine.record_outcome(-5.0);
        }
        // Expected R still clears 1.8, but the win-rate estimate makes the
        // expected value negative.
        let sig = signal(0.015, vec![0.03, 0.045], 0.8);
        let err = engine.evaluate(1_000.0, 0, &sig, 0.001, 1.0).unwrap_err();
        assert!(matches!(err, RiskRejection::RiskOfRuin { .. }));
    }

    #[test]
    fn default_win_rate_without_history() {
        let engine = RiskEngine::new(RiskConfig::default());
        assert!((engine.win_rate() - 0.55).abs() < 1e-12);
        engine.record_outcome(10.0);
        engine.record_outcome(-5.0);
        assert!((engine.win_rate() - 0.5).abs() < 1e-12);
    }
}
