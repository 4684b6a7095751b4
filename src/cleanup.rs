// =============================================================================
// Forced Cleanup — position-cap enforcement and dust removal
// =============================================================================
//
// Runs at startup (cycle 0) and every `cleanup_interval_cycles` thereafter,
// plus optionally every N completed trades. One pass:
//
//   1. Fetch live positions from the broker — the broker is the source of
//      truth — and adopt anything the tracker does not know.
//   2. Classify each tracked position as DUST (notional under the dust
//      threshold), EXCESS (beyond the concurrent-position cap, ranked
//      smallest notional first then worst pnl), or KEEP.
//   3. Close DUST unconditionally, then EXCESS, inside a wall-clock budget
//      (20s at startup, 10s mid-cycle, 5s otherwise). On exhaustion the pass
//      pauses and the remainder waits for the next cycle.
//   4. If the post-pass count still exceeds the cap, emit a SAFETY VIOLATION
//      log line.
//
// Guarantee: open_count <= max_cap is eventually consistent with a bounded
// correction window of one cleanup interval.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerAdapter;
use crate::config::CapConfig;
use crate::error::{BrokerError, SafetyViolation};
use crate::journal::{JournalRecord, TradeJournal};
use crate::position::{PositionTracker, TrackedPosition};
use crate::types::{MarketOrderRequest, Side};

/// Wall-clock budget for one cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupBudget {
    Startup,
    MidCycle,
    Default,
}

impl CleanupBudget {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Startup => Duration::from_secs(20),
            Self::MidCycle => Duration::from_secs(10),
            Self::Default => Duration::from_secs(5),
        }
    }
}

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub adopted: usize,
    pub dust_closed: usize,
    pub excess_closed: usize,
    pub remaining: usize,
    pub budget_exhausted: bool,
    pub safety_violation: bool,
}

/// Classification of one position within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Dust,
    Excess,
    Keep,
}

/// Classify tracked positions given current prices. Pure; exposed for tests.
fn classify(
    positions: &[(TrackedPosition, f64)],
    cap: &CapConfig,
) -> Vec<(String, Class)> {
    // Dust first.
    let mut classes: Vec<(String, Class, f64, f64)> = positions
        .iter()
        .map(|(pos, price)| {
            let notional = pos.qty * price;
            let pnl = pos.side.direction() * (price - pos.entry_price) / pos.entry_price;
            let class = if notional <= cap.dust_threshold_usd {
                Class::Dust
            } else {
                Class::Keep
            };
            (pos.symbol.clone(), class, notional, pnl)
        })
        .collect();

    // Excess: beyond the cap after dust is excluded, smallest notional
    // first, then worst pnl.
    let kept: Vec<usize> = classes
        .iter()
        .enumerate()
        .filter(|(_, (_, class, _, _))| *class == Class::Keep)
        .map(|(i, _)| i)
        .collect();

    if kept.len() > cap.max_concurrent_positions {
        let excess_count = kept.len() - cap.max_concurrent_positions;
        let mut ranked = kept;
        ranked.sort_by(|&a, &b| {
            classes[a]
                .2
                .total_cmp(&classes[b].2)
                .then(classes[a].3.total_cmp(&classes[b].3))
        });
        for &index in ranked.iter().take(excess_count) {
            classes[index].1 = Class::Excess;
        }
    }

    classes
        .into_iter()
        .map(|(symbol, class, _, _)| (symbol, class))
        .collect()
}

/// Run one cleanup pass for one account.
pub async fn run_forced_cleanup(
    adapter: &dyn BrokerAdapter,
    tracker: &PositionTracker,
    cap: &CapConfig,
    budget: CleanupBudget,
    journal: &TradeJournal,
) -> Result<CleanupReport, BrokerError> {
    let deadline = Instant::now() + budget.duration();
    let account_id = tracker.account_id().to_string();
    let broker = adapter.kind().to_string();

    info!(
        account = %account_id,
        budget_secs = budget.duration().as_secs(),
        "forced cleanup pass started"
    );

    // ── 1. Broker is the source of truth ─────────────────────────────────
    let broker_positions = adapter.get_positions().await?;

    let mut prices: HashMap<String, f64> = HashMap::new();
    for raw in &broker_positions {
        if let Ok(price) = adapter.get_current_price(&raw.symbol).await {
            prices.insert(raw.symbol.clone(), price);
        }
    }
    let adopted = tracker.adopt_existing(&broker_positions, &prices);

    // ── 2. Classify ──────────────────────────────────────────────────────
    let mut priced: Vec<(TrackedPosition, f64)> = Vec::new();
    for pos in tracker.open_positions() {
        let price = match prices.get(&pos.symbol) {
            Some(&p) => p,
            None => match adapter.get_current_price(&pos.symbol).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(symbol = %pos.symbol, error = %e, "no price; skipping this pass");
                    continue;
                }
            },
        };
        priced.push((pos, price));
    }

    let classes = classify(&priced, cap);
    let price_of: HashMap<String, f64> = priced
        .iter()
        .map(|(pos, price)| (pos.symbol.clone(), *price))
        .collect();

    // ── 3. Close dust, then excess, inside the budget ────────────────────
    let mut dust_closed = 0usize;
    let mut excess_closed = 0usize;
    let mut budget_exhausted = false;

    let mut ordered: Vec<(&String, Class)> = Vec::new();
    for (symbol, class) in &classes {
        if *class == Class::Dust {
            ordered.push((symbol, Class::Dust));
        }
    }
    for (symbol, class) in &classes {
        if *class == Class::Excess {
            ordered.push((symbol, Class::Excess));
        }
    }

    for (symbol, class) in ordered {
        if Instant::now() >= deadline {
            warn!(account = %account_id, "cleanup budget exhausted; resuming next cycle");
            budget_exhausted = true;
            break;
        }

        let Some(pos) = tracker.get(symbol) else { continue };
        let price = price_of.get(symbol).copied().unwrap_or(0.0);
        let reason = match class {
            Class::Dust => "CLEANUP_DUST",
            Class::Excess => "FORCED_DRAIN",
            Class::Keep => continue,
        };

        match close_full(adapter, tracker, journal, &account_id, &broker, &pos, price, reason)
            .await
        {
            Ok(()) => match class {
                Class::Dust => dust_closed += 1,
                Class::Excess => excess_closed += 1,
                Class::Keep => {}
            },
            Err(e) => {
                warn!(symbol, error = %e, "cleanup close failed");
                tracker.mark_sell_failure(symbol);
                journal.record(JournalRecord::error(
                    &account_id,
                    &broker,
                    Some(symbol),
                    &e.class().to_string(),
                    &e.to_string(),
                ));
            }
        }
    }

    // ── 4. Post-pass audit ───────────────────────────────────────────────
    let remaining = tracker.open_count();
    let safety_violation = remaining > cap.max_concurrent_positions && !budget_exhausted;
    if safety_violation {
        let violation = SafetyViolation::PositionCapExceeded {
            count: remaining,
            cap: cap.max_concurrent_positions,
        };
        error!(account = %account_id, "SAFETY VIOLATION: {violation}");
    }

    let report = CleanupReport {
        adopted,
        dust_closed,
        excess_closed,
        remaining,
        budget_exhausted,
        safety_violation,
    };
    info!(
        account = %account_id,
        adopted = report.adopted,
        dust_closed = report.dust_closed,
        excess_closed = report.excess_closed,
        remaining = report.remaining,
        "forced cleanup pass finished"
    );
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
async fn close_full(
    adapter: &dyn BrokerAdapter,
    tracker: &PositionTracker,
    journal: &TradeJournal,
    account_id: &str,
    broker: &str,
    pos: &TrackedPosition,
    price: f64,
    reason: &str,
) -> Result<(), BrokerError> {
    let request = MarketOrderRequest {
        client_id: format!("cleanup-{}-{}", pos.symbol, Uuid::new_v4()),
        symbol: pos.symbol.clone(),
        side: match pos.side {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        },
        qty: Some(pos.qty),
        notional_usd: None,
    };
    let order = adapter.place_market(&request).await?;

    let fill_price = order.avg_fill_price().unwrap_or(price);
    if let Some(exit) = tracker.record_exit(&pos.symbol, fill_price, 1.0, adapter.fee_rate()) {
        journal.record(JournalRecord::exit(
            account_id,
            broker,
            &pos.symbol,
            exit.qty,
            fill_price,
            exit.pnl_usd,
            exit.pnl_pct,
            reason,
        ));
    }
    tracker.clear_sell_failures(&pos.symbol);
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn position(symbol: &str, entry: f64, qty: f64) -> TrackedPosition {
        TrackedPosition {
            symbol: symbol.into(),
            side: Side::Long,
            qty,
            entry_price: entry,
            opened_at: Utc::now(),
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
    fn dust_classified_at_and_below_threshold() {
        let cap = CapConfig::default();
        // Exactly at the threshold is still dust; just above is not.
        let positions = vec![
            (position("DUST-USD", 0.0005, 1.0), 0.0005),
            (position("EDGE-USD", 0.001, 1.0), 0.001),
            (position("KEEP-USD", 0.002, 1.0), 0.002),
        ];
        let classes = classify(&positions, &cap);
        assert_eq!(classes[0], ("DUST-USD".to_string(), Class::Dust));
        assert_eq!(classes[1], ("EDGE-USD".to_string(), Class::Dust));
        assert_eq!(classes[2], ("KEEP-USD".to_string(), Class::Keep));
    }

    #[test]
    fn excess_ranked_smallest_first() {
        let cap = CapConfig::default(); // cap 8
        let mut positions = vec![
            (position("A-USD", 3.0, 1.0), 3.0),
            (position("B-USD", 5.0, 1.0), 5.0),
        ];
        for i in 0..8 {
            let sym = format!("BIG{i}-USD");
            positions.push((position(&sym, 100.0, 1.0), 100.0));
        }

        let classes = classify(&positions, &cap);
        let excess: Vec<&String> = classes
            .iter()
            .filter(|(_, c)| *c == Class::Excess)
            .map(|(s, _)| s)
            .collect();
        assert_eq!(excess.len(), 2);
        assert!(excess.contains(&&"A-USD".to_string()));
        assert!(excess.contains(&&"B-USD".to_string()));
    }

    #[test]
    fn excess_ties_break_on_worst_pnl() {
        let cap = CapConfig {
            max_concurrent_positions: 2,
            ..CapConfig::default()
        };
        // Three equal-notional positions; the deepest loser drains first.
        let winner = position("WIN-USD", 100.0, 1.0);
        let loser = position("LOSE-USD", 110.0, 1.0); // entry above price
        let flat = position("FLAT-USD", 100.0, 1.0);
        let positions = vec![
            (winner, 100.0),
            (loser, 100.0),
            (flat, 100.0),
        ];

        let classes = classify(&positions, &cap);
        let excess: Vec<&String> = classes
            .iter()
            .filter(|(_, c)| *c == Class::Excess)
            .map(|(s, _)| s)
            .collect();
        assert_eq!(excess, vec![&"LOSE-USD".to_string()]);
    }

    #[test]
    fn under_cap_nothing_is_excess() {
        let cap = CapConfig::default();
        let positions: Vec<_> = (0..5)
            .map(|i| (position(&format!("P{i}-USD"), 50.0, 1.0), 50.0))
            .collect();
        let classes = classify(&positions, &cap);
        assert!(classes.iter().all(|(_, c)| *c == Class::Keep));
    }

    #[test]
    fn budget_durations() {
        assert_eq!(CleanupBudget::Startup.duration(), Duration::from_secs(20));
        assert_eq!(CleanupBudget::MidCycle.duration(), Duration::from_secs(10));
        assert_eq!(CleanupBudget::Default.duration(), Duration::from_secs(5));
    }
}
