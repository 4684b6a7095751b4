// =============================================================================
// Exit Engine — priority-ordered exit rules for every open position
// =============================================================================
//
// Evaluated once per cycle per position. Rules are checked in strict priority
// order and the first match wins:
//
//   1. SMALL_POSITION      — notional under the $1 viability floor, exit all
//   2. STOP_CATASTROPHIC   — pnl <= -5%, exit all
//   3. STOP_LOSS           — pnl <= threshold OR pnl <= loss floor (OR, never
//                            AND), guarded: never fires while pnl >= 0
//   4. LOSING_TIME_LIMIT   — losing for >= 30 minutes, exit all (warn at 5)
//   5. PROFIT_TIER_k       — tiered partial take-profit, fee-aware per venue
//   6. TRAILING_STOP       — residual after partials crosses the ratcheted
//                            trail, exit remainder
//   7. PROFITABLE_MAX_HOLD — in profit and >= 8 hours old, exit all
//   8. EMERGENCY_HOLD      — >= 12 hours old regardless of pnl, exit all
//   9. FORCED_DRAIN        — over the concurrent-position cap, smallest and
//                            worst ranked first, at most 3 per cycle
//
// Everything here is FRACTIONAL (0.02 = 2%). Partial tier exits leave the
// position open; only fraction-1.0 rules clear it. Positions inside an
// unsellable cool-down are skipped entirely.
// =============================================================================

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::broker::BrokerKind;
use crate::error::SafetyViolation;
use crate::position::TrackedPosition;
use crate::types::Side;

// ---------------------------------------------------------------------------
// Intent model
// ---------------------------------------------------------------------------

/// Why a position (or part of one) is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    SmallPosition,
    StopCatastrophic,
    StopLoss,
    LosingTimeLimit,
    ProfitTier(usize),
    TrailingStop,
    ProfitableMaxHold,
    EmergencyHold,
    ForcedDrain,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SmallPosition => write!(f, "SMALL_POSITION"),
            Self::StopCatastrophic => write!(f, "STOP_CATASTROPHIC"),
            Self::StopLoss => write!(f, "STOP_LOSS"),
            Self::LosingTimeLimit => write!(f, "LOSING_TIME_LIMIT"),
            Self::ProfitTier(k) => write!(f, "PROFIT_TIER_{k}"),
            Self::TrailingStop => write!(f, "TRAILING_STOP"),
            Self::ProfitableMaxHold => write!(f, "PROFITABLE_MAX_HOLD"),
            Self::EmergencyHold => write!(f, "EMERGENCY_HOLD"),
            Self::ForcedDrain => write!(f, "FORCED_DRAIN"),
        }
    }
}

/// An instruction to close `fraction` of the remaining quantity.
#[derive(Debug, Clone, Serialize)]
pub struct ExitIntent {
    pub symbol: String,
    /// Fraction of the remaining quantity to close, in (0, 1].
    pub fraction: f64,
    pub reason: ExitReason,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Exit rule thresholds. All pnl values fractional, all negative thresholds
/// genuinely negative.
#[derive(Debug, Clone)]
pub struct ExitConfig {
    /// Positions under this notional are closed outright.
    pub min_viable_usd: f64,
    pub catastrophic_stop: f64,
    pub stop_loss_threshold: f64,
    pub min_loss_floor: f64,
    pub losing_age_limit_mins: i64,
    pub losing_age_warn_mins: i64,
    pub profitable_max_hold_hours: i64,
    pub emergency_max_hold_hours: i64,
    /// ATR multiple used for the trailing-stop distance.
    pub trail_atr_mult: f64,
    /// Maximum forced-drain exits scheduled per cycle.
    pub max_drain_per_cycle: usize,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            min_viable_usd: 1.0,
            catastrophic_stop: -0.05,
            stop_loss_threshold: -0.015,
            min_loss_floor: -0.0005,
            losing_age_limit_mins: 30,
            losing_age_warn_mins: 5,
            profitable_max_hold_hours: 8,
            emergency_max_hold_hours: 12,
            trail_atr_mult: 1.5,
            max_drain_per_cycle: 3,
        }
    }
}

/// Per-venue profit tiers `(pnl threshold, fraction of remaining)`,
/// ascending. Wider venues pay higher fees, so their tiers start later.
pub fn profit_tiers(kind: BrokerKind) -> &'static [(f64, f64)] {
    match kind {
        BrokerKind::Coinbase => &[
            (0.025, 0.10),
            (0.030, 0.15),
            (0.040, 0.25),
            (0.050, 0.50),
        ],
        // Kraken tiers are the reference ladder; the cheaper venues share it.
        _ => &[
            (0.020, 0.10),
            (0.025, 0.15),
            (0.030, 0.25),
            (0.040, 0.50),
        ],
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Stateless evaluator bound to one venue's tier ladder.
pub struct ExitEngine {
    config: ExitConfig,
    tiers: &'static [(f64, f64)],
}

impl ExitEngine {
    pub fn new(kind: BrokerKind, config: ExitConfig) -> Self {
        Self {
            config,
            tiers: profit_tiers(kind),
        }
    }

    /// Evaluate one position. Returns the highest-priority matching intent,
    /// or `None` when the position should be left alone this cycle.
    pub fn evaluate(
        &self,
        pos: &TrackedPosition,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> Option<ExitIntent> {
        if current_price <= 0.0 {
            return None;
        }
        if pos.is_unsellable(now) {
            debug!(symbol = %pos.symbol, "position in unsellable cool-down; skipping");
            return None;
        }

        let pnl = pos.side.direction() * (current_price - pos.entry_price) / pos.entry_price;
        let notional = pos.qty * current_price;
        let age = pos.age(now);

        let full = |reason| {
            Some(ExitIntent {
                symbol: pos.symbol.clone(),
                fraction: 1.0,
                reason,
            })
        };

        // ── 1. Dust / viability floor ────────────────────────────────────
        if notional < self.config.min_viable_usd {
            return full(ExitReason::SmallPosition);
        }

        // ── 2. Catastrophic stop ─────────────────────────────────────────
        if pnl <= self.config.catastrophic_stop {
            return full(ExitReason::StopCatastrophic);
        }

        // ── 3. Standard stop (OR of threshold and floor) ─────────────────
        if pnl <= self.config.stop_loss_threshold || pnl <= self.config.min_loss_floor {
            // Inversion guard: a stop must never close a profitable
            // position. Matching here with pnl >= 0 means a threshold is
            // carrying the wrong sign or the wrong unit.
            if pnl >= 0.0 {
                let violation = SafetyViolation::ProfitabilityGuardTripped { pnl };
                error!(
                    symbol = %pos.symbol,
                    threshold = self.config.stop_loss_threshold,
                    "{violation}; refusing to exit"
                );
                return None;
            }
            return full(ExitReason::StopLoss);
        }

        // ── 4. Losing-trade time limit ───────────────────────────────────
        if pnl < 0.0 {
            if age >= ChronoDuration::minutes(self.config.losing_age_limit_mins) {
                return full(ExitReason::LosingTimeLimit);
            }
            if age >= ChronoDuration::minutes(self.config.losing_age_warn_mins) {
                warn!(
                    symbol = %pos.symbol,
                    pnl,
                    age_mins = age.num_minutes(),
                    limit_mins = self.config.losing_age_limit_mins,
                    "position losing and aging toward the time limit"
                );
            }
        }

        // ── 5. Tiered partial profit ─────────────────────────────────────
        for (index, &(threshold, fraction)) in self.tiers.iter().enumerate() {
            if pnl >= threshold && !pos.tiers_taken.contains(&index) {
                return Some(ExitIntent {
                    symbol: pos.symbol.clone(),
                    fraction,
                    reason: ExitReason::ProfitTier(index),
                });
            }
        }

        // ── 6. Trailing stop on the residual after partials ──────────────
        if !pos.partial_exits.is_empty() {
            if let Some(trail) = pos.trailing_stop {
                let crossed = match pos.side {
                    Side::Long => current_price <= trail,
                    Side::Short => current_price >= trail,
                };
                if crossed {
                    return full(ExitReason::TrailingStop);
                }
            }
        }

        // ── 7. Profitable max hold ───────────────────────────────────────
        if pnl >= 0.0 && age >= ChronoDuration::hours(self.config.profitable_max_hold_hours) {
            return full(ExitReason::ProfitableMaxHold);
        }

        // ── 8. Emergency hold backstop ───────────────────────────────────
        if age >= ChronoDuration::hours(self.config.emergency_max_hold_hours) {
            return full(ExitReason::EmergencyHold);
        }

        None
    }

    /// Trailing-stop distance fallback when no fresh ATR is available:
    /// half the catastrophic threshold.
    fn default_trail_distance(&self) -> f64 {
        -self.config.catastrophic_stop / 2.0
    }

    /// Trailing-stop level the account loop should ratchet into the tracker
    /// after a cycle in which the position has taken at least one partial.
    pub fn trailing_candidate(
        &self,
        pos: &TrackedPosition,
        current_price: f64,
        atr_frac: Option<f64>,
    ) -> Option<f64> {
        if pos.partial_exits.is_empty() || current_price <= 0.0 {
            return None;
        }
        let distance =
            self.config.trail_atr_mult * atr_frac.unwrap_or_else(|| self.default_trail_distance());
        let level = match pos.side {
            Side::Long => current_price * (1.0 - distance),
            Side::Short => current_price * (1.0 + distance),
        };
        Some(level)
    }

    /// Rank positions beyond the concurrent cap for forced drain: smallest
    /// notional first, then worst pnl. At most `max_drain_per_cycle` intents
    /// per call; the rest wait for the next cycle.
    pub fn forced_drain(
        &self,
        positions: &[(TrackedPosition, f64)],
        max_concurrent: usize,
    ) -> Vec<ExitIntent> {
        if positions.len() <= max_concurrent {
            return Vec::new();
        }
        let excess = positions.len() - max_concurrent;

        let mut ranked: Vec<&(TrackedPosition, f64)> = positions.iter().collect();
        ranked.sort_by(|(a, pa), (b, pb)| {
            let size_a = a.qty * pa;
            let size_b = b.qty * pb;
            let pnl_a = a.side.direction() * (pa - a.entry_price) / a.entry_price;
            let pnl_b = b.side.direction() * (pb - b.entry_price) / b.entry_price;
            size_a
                .total_cmp(&size_b)
                .then(pnl_a.total_cmp(&pnl_b))
        });

        ranked
            .into_iter()
            .take(excess.min(self.config.max_drain_per_cycle))
            .map(|(pos, _)| ExitIntent {
                symbol: pos.symbol.clone(),
                fraction: 1.0,
                reason: ExitReason::ForcedDrain,
            })
            .collect()
    }
}

impl std::fmt::Debug for ExitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitEngine")
            .field("tiers", &self.tiers.len())
            .field("stop_loss_threshold", &self.config.stop_loss_threshold)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ExitEngine {
        ExitEngine::new(BrokerKind::Kraken, ExitConfig::default())
    }

    fn position(entry: f64, qty: f64, age_mins: i64) -> TrackedPosition {
        TrackedPosition {
            symbol: "BTC-USD".into(),
            side: Side::Long,
            qty,
            entry_price: entry,
            opened_at: Utc::now() - ChronoDuration::minutes(age_mins),
            size_usd: entry * qty,
            max_favorable_pct: 0.0,
            partial_exits: Vec::new(),
            trailing_stop: None,
            tiers_taken: Vec::new(),
            adopted: false,
            sell_failures: 0,
            unsellable_until: None,
        }
    }

    #[test]
    fn small_position_exits_fully() {
        let pos = position(100.0, 0.005, 1); // $0.50 notional
        let intent = engine().evaluate(&pos, 100.0, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::SmallPosition);
        assert_eq!(intent.fraction, 1.0);
    }

    #[test]
    fn catastrophic_stop_at_exact_threshold() {
        let pos = position(100.0, 1.0, 1);
        let intent = engine().evaluate(&pos, 95.0, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::StopCatastrophic);
    }

    #[test]
    fn standard_stop_fires_exactly_at_threshold() {
        let pos = position(100.0, 1.0, 1);
        // pnl exactly -0.015.
        let intent = engine().evaluate(&pos, 98.5, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::StopLoss);
        assert_eq!(intent.fraction, 1.0);
    }

    #[test]
    fn loss_floor_fires_without_threshold() {
        // -0.1% loss: above the -1.5% threshold but through the -0.05% floor.
        // OR semantics mean the floor alone is enough.
        let pos = position(100.0, 1.0, 1);
        let intent = engine().evaluate(&pos, 99.9, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::StopLoss);
    }

    #[test]
    fn stop_never_fires_in_profit() {
        // Corrupt config carrying a positive threshold (percentage leak):
        // the guard must refuse to stop a break-even/profitable position.
        let config = ExitConfig {
            stop_loss_threshold: 0.015,
            ..ExitConfig::default()
        };
        let engine = ExitEngine::new(BrokerKind::Kraken, config);
        let pos = position(100.0, 1.0, 1);
        assert!(engine.evaluate(&pos, 100.0, Utc::now()).is_none());
    }

    #[test]
    fn losing_time_limit_at_exact_boundary() {
        // Loss of 0.03% sits between the floor and zero, so only the clock
        // can close it.
        let pos = position(100.0, 1.0, 30);
        let intent = engine().evaluate(&pos, 99.97, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::LosingTimeLimit);
    }

    #[test]
    fn young_small_loss_is_left_alone() {
        let pos = position(100.0, 1.0, 10);
        assert!(engine().evaluate(&pos, 99.97, Utc::now()).is_none());
    }

    #[test]
    fn kraken_tier_ladder_walks_in_order() {
        let engine = engine();
        let mut pos = position(50_000.0, 0.001, 5);

        // +1.0%: below the first tier.
        assert!(engine.evaluate(&pos, 50_500.0, Utc::now()).is_none());

        // +2.0%: tier 0 at 10%.
        let intent = engine.evaluate(&pos, 51_000.0, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::ProfitTier(0));
        assert!((intent.fraction - 0.10).abs() < 1e-12);
        pos.tiers_taken.push(0);
        pos.partial_exits.push(crate::position::PartialExit {
            price: 51_000.0,
            qty: 0.0001,
            fraction: 0.10,
            pnl_usd: 0.0,
            ts: Utc::now(),
        });

        // +2.5%: tier 1 at 15%.
        let intent = engine.evaluate(&pos, 51_250.0, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::ProfitTier(1));
        assert!((intent.fraction - 0.15).abs() < 1e-12);
        pos.tiers_taken.push(1);

        // +3.0%: tier 2 at 25%.
        let intent = engine.evaluate(&pos, 51_500.0, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::ProfitTier(2));
        assert!((intent.fraction - 0.25).abs() < 1e-12);
        pos.tiers_taken.push(2);

        // +4.0%: tier 3 at 50% of remaining.
        let intent = engine.evaluate(&pos, 52_000.0, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::ProfitTier(3));
        assert!((intent.fraction - 0.50).abs() < 1e-12);
    }

    #[test]
    fn coinbase_tiers_are_wider() {
        let engine = ExitEngine::new(BrokerKind::Coinbase, ExitConfig::default());
        let pos = position(100.0, 1.0, 5);

        // +2.0% triggers nothing on Coinbase (first tier 2.5%).
        assert!(engine.evaluate(&pos, 102.0, Utc::now()).is_none());
        let intent = engine.evaluate(&pos, 102.5, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::ProfitTier(0));
    }

    #[test]
    fn skipped_tier_catches_up_from_lowest() {
        // Price gaps straight to +4.1%: the lowest untaken tier fires first.
        let pos = position(100.0, 1.0, 5);
        let intent = engine().evaluate(&pos, 104.1, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::ProfitTier(0));
    }

    #[test]
    fn trailing_stop_closes_residual() {
        let mut pos = position(100.0, 1.0, 5);
        pos.tiers_taken = vec![0, 1, 2, 3];
        pos.partial_exits.push(crate::position::PartialExit {
            price: 104.0,
            qty: 0.5,
            fraction: 0.5,
            pnl_usd: 2.0,
            ts: Utc::now(),
        });
        pos.trailing_stop = Some(103.0);

        // Above the trail: hold.
        assert!(engine().evaluate(&pos, 103.5, Utc::now()).is_none());

        // Crossing the trail closes the remainder.
        let intent = engine().evaluate(&pos, 102.9, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::TrailingStop);
        assert_eq!(intent.fraction, 1.0);
    }

    #[test]
    fn trailing_candidate_uses_atr_distance() {
        let mut pos = position(100.0, 1.0, 5);
        pos.partial_exits.push(crate::position::PartialExit {
            price: 104.0,
            qty: 0.5,
            fraction: 0.5,
            pnl_usd: 2.0,
            ts: Utc::now(),
        });

        let level = engine().trailing_candidate(&pos, 104.0, Some(0.01)).unwrap();
        // 104 * (1 - 1.5 * 0.01)
        assert!((level - 104.0 * 0.985).abs() < 1e-9);

        // No partials yet: no trail.
        let fresh = position(100.0, 1.0, 5);
        assert!(engine().trailing_candidate(&fresh, 104.0, Some(0.01)).is_none());
    }

    #[test]
    fn profitable_max_hold_after_eight_hours() {
        let pos = position(100.0, 1.0, 8 * 60);
        let intent = engine().evaluate(&pos, 101.0, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::ProfitableMaxHold);
    }

    #[test]
    fn emergency_hold_backstop() {
        // Raise the losing-time limit so the backstop is the rule that fires.
        let config = ExitConfig {
            losing_age_limit_mins: 48 * 60,
            ..ExitConfig::default()
        };
        let engine = ExitEngine::new(BrokerKind::Kraken, config);
        let pos = position(100.0, 1.0, 12 * 60);
        let intent = engine.evaluate(&pos, 99.98, Utc::now()).unwrap();
        assert_eq!(intent.reason, ExitReason::EmergencyHold);
    }

    #[test]
    fn unsellable_positions_are_skipped() {
        let mut pos = position(100.0, 1.0, 60);
        pos.unsellable_until = Some(Utc::now() + ChronoDuration::hours(12));
        // Deep loss, but parked.
        assert!(engine().evaluate(&pos, 90.0, Utc::now()).is_none());
    }

    #[test]
    fn forced_drain_ranks_smallest_then_worst() {
        let engine = engine();
        let mut positions = Vec::new();
        // Ten positions: $3, $5, then eight at $100.
        positions.push((position(3.0, 1.0, 5), 3.0));
        positions.push((position(5.0, 1.0, 5), 5.0));
        for _ in 0..8 {
            positions.push((position(100.0, 1.0, 5), 100.0));
        }

        let intents = engine.forced_drain(&positions, 8);
        assert_eq!(intents.len(), 2);
        assert!(intents.iter().all(|i| i.reason == ExitReason::ForcedDrain));
        assert!(intents.iter().all(|i| i.fraction == 1.0));
    }

    #[test]
    fn forced_drain_caps_at_three_per_cycle() {
        let engine = engine();
        let positions: Vec<_> = (0..14)
            .map(|i| (position(10.0 + i as f64, 1.0, 5), 10.0 + i as f64))
            .collect();
        let intents = engine.forced_drain(&positions, 8);
        assert_eq!(intents.len(), 3);
    }

    #[test]
    fn forced_drain_noop_under_cap() {
        let engine = engine();
        let positions: Vec<_> = (0..8)
            .map(|_| (position(100.0, 1.0, 5), 100.0))
            .collect();
        assert!(engine.forced_drain(&positions, 8).is_empty());
    }
}
