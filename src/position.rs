// =============================================================================
// Position Tracker — per-account record of open positions
// =============================================================================
//
// One tracker per (account, broker) pair, accessed only from its owning
// account loop. Tracks entry price (weighted-average on adds), remaining
// quantity, partial-exit history, trailing-stop state, and the adoption flag
// for positions discovered on the broker without a known entry.
//
// Life-cycle:
//   track_entry  -> position exists (or quantity added, entry re-averaged)
//   record_exit  -> quantity reduced; fraction 1.0 deletes the record
//   adopt_existing -> unknown broker positions seeded at current * 1.01,
//                     which forces an immediate aggressive-exit posture
//
// All PnL values are FRACTIONAL (0.04 = 4%). A sanity check flags any
// computed |pnl| >= 1.0 as probable unit drift.
//
// Thread-safety: parking_lot::RwLock; snapshots persisted with the atomic
// tmp + rename pattern.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{RawPosition, Side};

/// Consecutive sell rejections after which a position is parked.
const UNSELLABLE_AFTER_FAILURES: u32 = 3;
/// Cool-down before an unsellable position is re-attempted.
const UNSELLABLE_COOLDOWN_HOURS: i64 = 24;
/// Premium applied to adopted positions with unknown entry price.
const ADOPTED_ENTRY_PREMIUM: f64 = 1.01;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// One partial exit taken against a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialExit {
    pub price: f64,
    pub qty: f64,
    /// Fraction of the then-remaining quantity that was closed.
    pub fraction: f64,
    pub pnl_usd: f64,
    pub ts: DateTime<Utc>,
}

/// A tracked open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub symbol: String,
    pub side: Side,
    /// Remaining open quantity. Never negative; zero deletes the record.
    pub qty: f64,
    /// Weighted-average entry price across all adds.
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    /// Notional at entry, maintained across adds and partial exits.
    pub size_usd: f64,
    /// Best favorable excursion seen, fractional.
    #[serde(default)]
    pub max_favorable_pct: f64,
    #[serde(default)]
    pub partial_exits: Vec<PartialExit>,
    /// Trailing stop price on the residual after a partial exit.
    #[serde(default)]
    pub trailing_stop: Option<f64>,
    /// Profit tiers already taken (indices into the broker tier table).
    #[serde(default)]
    pub tiers_taken: Vec<usize>,
    /// True when the entry price was synthesized during adoption.
    #[serde(default)]
    pub adopted: bool,
    #[serde(default)]
    pub sell_failures: u32,
    #[serde(default)]
    pub unsellable_until: Option<DateTime<Utc>>,
}

impl TrackedPosition {
    /// Age of the position at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.opened_at
    }

    /// True while the position is parked after repeated sell rejections.
    pub fn is_unsellable(&self, now: DateTime<Utc>) -> bool {
        self.unsellable_until.is_some_and(|until| now < until)
    }
}

/// Fractional and dollar PnL at a given price.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PnL {
    /// Fractional: 0.04 means +4%.
    pub pct: f64,
    pub usd: f64,
}

/// Result of `record_exit`.
#[derive(Debug, Clone, Serialize)]
pub struct RealizedExit {
    pub symbol: String,
    pub qty: f64,
    pub price: f64,
    pub fraction: f64,
    pub pnl_usd: f64,
    /// Fractional PnL of the exited quantity, net of fees.
    pub pnl_pct: f64,
    /// True when the position is now fully closed and deleted.
    pub closed: bool,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Per-account position store with optional JSON snapshot persistence.
pub struct PositionTracker {
    account_id: String,
    positions: RwLock<HashMap<String, TrackedPosition>>,
    snapshot_path: Option<PathBuf>,
}

impl PositionTracker {
    /// In-memory tracker (tests, dry-run).
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            positions: RwLock::new(HashMap::new()),
            snapshot_path: None,
        }
    }

    /// Tracker persisted to `{datadir}/positions_{account}.json`. An existing
    /// snapshot is loaded so positions survive restarts.
    pub fn with_persistence(account_id: impl Into<String>, datadir: &Path) -> Result<Self> {
        let account_id = account_id.into();
        let path = datadir.join(format!("positions_{account_id}.json"));

        let positions = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let loaded: HashMap<String, TrackedPosition> = serde_json::from_str(&content)
                    .with_context(|| format!("corrupt position snapshot {}", path.display()))?;
                info!(
                    account = %account_id,
                    count = loaded.len(),
                    "position snapshot loaded"
                );
                loaded
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read position snapshot {}", path.display())
                })
            }
        };

        Ok(Self {
            account_id,
            positions: RwLock::new(positions),
            snapshot_path: Some(path),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    // -------------------------------------------------------------------------
    // Entries
    // -------------------------------------------------------------------------

    /// Record a fill that opens or adds to a position. Adds to an existing
    /// same-side position re-average the entry price by quantity.
    pub fn track_entry(&self, symbol: &str, side: Side, price: f64, qty: f64) {
        if price <= 0.0 || qty <= 0.0 {
            warn!(symbol, price, qty, "ignoring entry with non-positive price/qty");
            return;
        }

        let mut positions = self.positions.write();
        match positions.get_mut(symbol) {
            Some(pos) if pos.side == side => {
                let combined_qty = pos.qty + qty;
                pos.entry_price = (pos.entry_price * pos.qty + price * qty) / combined_qty;
                pos.qty = combined_qty;
                pos.size_usd += price * qty;
                info!(
                    account = %self.account_id,
                    symbol,
                    qty,
                    new_qty = pos.qty,
                    avg_entry = pos.entry_price,
                    "position add tracked (entry re-averaged)"
                );
            }
            Some(pos) => {
                warn!(
                    account = %self.account_id,
                    symbol,
                    existing_side = %pos.side,
                    incoming_side = %side,
                    "opposite-side entry ignored; close the position first"
                );
            }
            None => {
                positions.insert(
                    symbol.to_string(),
                    TrackedPosition {
                        symbol: symbol.to_string(),
                        side,
                        qty,
                        entry_price: price,
                        opened_at: Utc::now(),
                        size_usd: price * qty,
                        max_favorable_pct: 0.0,
                        partial_exits: Vec::new(),
                        trailing_stop: None,
                        tiers_taken: Vec::new(),
                        adopted: false,
                        sell_failures: 0,
                        unsellable_until: None,
                    },
                );
                info!(
                    account = %self.account_id,
                    symbol,
                    side = %side,
                    price,
                    qty,
                    size_usd = price * qty,
                    "position opened"
                );
            }
        }
        drop(positions);
        self.save_best_effort();
    }

    // -------------------------------------------------------------------------
    // Exits
    // -------------------------------------------------------------------------

    /// Record an exit of `fraction` of the remaining quantity at `price`.
    /// Fees on the exited notional are charged at `fee_rate` on both legs.
    ///
    /// `fraction >= 1.0` fully closes and deletes the record; a subsequent
    /// call for the same symbol is a no-op returning `None`.
    pub fn record_exit(
        &self,
        symbol: &str,
        price: f64,
        fraction: f64,
        fee_rate: f64,
    ) -> Option<RealizedExit> {
        if !(0.0..=1.0).contains(&fraction) || fraction == 0.0 || price <= 0.0 {
            warn!(symbol, price, fraction, "ignoring exit with invalid parameters");
            return None;
        }

        let mut positions = self.positions.write();
        let pos = positions.get_mut(symbol)?;

        let exit_qty = pos.qty * fraction;
        let direction = pos.side.direction();
        let gross_pct = direction * (price - pos.entry_price) / pos.entry_price;
        // Round-trip fees on the exited notional.
        let net_pct = gross_pct - 2.0 * fee_rate;
        let pnl_usd = net_pct * pos.entry_price * exit_qty;

        pos.partial_exits.push(PartialExit {
            price,
            qty: exit_qty,
            fraction,
            pnl_usd,
            ts: Utc::now(),
        });

        let closed = fraction >= 1.0 - f64::EPSILON;
        if closed {
            positions.remove(symbol);
        } else {
            pos.qty -= exit_qty;
            pos.size_usd *= 1.0 - fraction;
        }

        drop(positions);
        self.save_best_effort();

        info!(
            account = %self.account_id,
            symbol,
            price,
            fraction,
            pnl_usd,
            pnl_pct = net_pct,
            closed,
            "exit recorded"
        );

        Some(RealizedExit {
            symbol: symbol.to_string(),
            qty: exit_qty,
            price,
            fraction,
            pnl_usd,
            pnl_pct: net_pct,
            closed,
        })
    }

    // -------------------------------------------------------------------------
    // PnL
    // -------------------------------------------------------------------------

    /// Fractional and dollar PnL of `symbol` at `current_price`.
    ///
    /// A |pct| >= 1.0 almost always means a percentage-formatted value leaked
    /// into a fractional field somewhere upstream; it is flagged loudly.
    pub fn pnl(&self, symbol: &str, current_price: f64) -> Option<PnL> {
        if current_price <= 0.0 {
            return None;
        }
        let positions = self.positions.read();
        let pos = positions.get(symbol)?;

        let pct = pos.side.direction() * (current_price - pos.entry_price) / pos.entry_price;
        debug_assert!(
            pct.abs() < 1.0,
            "pnl {pct} for {symbol} outside sanity bounds; unit drift?"
        );
        if pct.abs() >= 1.0 {
            warn!(
                account = %self.account_id,
                symbol,
                pnl_pct = pct,
                "pnl outside sanity bounds; check for unit drift"
            );
        }

        Some(PnL {
            pct,
            usd: pct * pos.entry_price * pos.qty,
        })
    }

    /// Update the favorable-excursion high-water mark for `symbol`.
    pub fn observe_price(&self, symbol: &str, current_price: f64) {
        if current_price <= 0.0 {
            return;
        }
        let mut positions = self.positions.write();
        if let Some(pos) = positions.get_mut(symbol) {
            let pct = pos.side.direction() * (current_price - pos.entry_price) / pos.entry_price;
            if pct > pos.max_favorable_pct {
                pos.max_favorable_pct = pct;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Adoption
    // -------------------------------------------------------------------------

    /// Reconcile broker-reported positions into the tracker. Symbols the
    /// tracker does not know are adopted with a synthetic entry of
    /// `current_price * 1.01`, which makes every exit rule see them as
    /// slightly under water and manage them aggressively.
    ///
    /// Returns the number of positions adopted.
    pub fn adopt_existing(
        &self,
        broker_positions: &[RawPosition],
        current_prices: &HashMap<String, f64>,
    ) -> usize {
        let mut adopted = 0;
        let mut positions = self.positions.write();

        for raw in broker_positions {
            if raw.qty <= 0.0 || positions.contains_key(&raw.symbol) {
                continue;
            }

            let entry_price = match raw.entry_price {
                Some(p) if p > 0.0 => p,
                _ => {
                    let Some(&price) = current_prices.get(&raw.symbol) else {
                        debug!(symbol = %raw.symbol, "no price for broker position; skipping adoption");
                        continue;
                    };
                    price * ADOPTED_ENTRY_PREMIUM
                }
            };

            let synthetic = raw.entry_price.is_none();
            positions.insert(
                raw.symbol.clone(),
                TrackedPosition {
                    symbol: raw.symbol.clone(),
                    side: Side::Long,
                    qty: raw.qty,
                    entry_price,
                    opened_at: Utc::now(),
                    size_usd: entry_price * raw.qty,
                    max_favorable_pct: 0.0,
                    partial_exits: Vec::new(),
                    trailing_stop: None,
                    tiers_taken: Vec::new(),
                    adopted: synthetic,
                    sell_failures: 0,
                    unsellable_until: None,
                },
            );
            adopted += 1;

            info!(
                account = %self.account_id,
                symbol = %raw.symbol,
                qty = raw.qty,
                entry_price,
                synthetic_entry = synthetic,
                "broker position adopted"
            );
        }

        drop(positions);
        if adopted > 0 {
            self.save_best_effort();
        }
        adopted
    }

    // -------------------------------------------------------------------------
    // Unsellable handling
    // -------------------------------------------------------------------------

    /// Record a sell rejection. Three consecutive rejections park the
    /// position for 24 hours. Returns the new failure count.
    pub fn mark_sell_failure(&self, symbol: &str) -> u32 {
        let mut positions = self.positions.write();
        let Some(pos) = positions.get_mut(symbol) else {
            return 0;
        };
        pos.sell_failures += 1;
        if pos.sell_failures >= UNSELLABLE_AFTER_FAILURES && pos.unsellable_until.is_none() {
            let until = Utc::now() + ChronoDuration::hours(UNSELLABLE_COOLDOWN_HOURS);
            pos.unsellable_until = Some(until);
            warn!(
                account = %self.account_id,
                symbol,
                failures = pos.sell_failures,
                until = %until,
                "position marked UNSELLABLE; cooling down"
            );
        }
        pos.sell_failures
    }

    /// Clear the failure counter after a successful sell.
    pub fn clear_sell_failures(&self, symbol: &str) {
        let mut positions = self.positions.write();
        if let Some(pos) = positions.get_mut(symbol) {
            pos.sell_failures = 0;
            pos.unsellable_until = None;
        }
    }

    // -------------------------------------------------------------------------
    // Exit-state bookkeeping
    // -------------------------------------------------------------------------

    /// Record that profit tier `index` has been taken for `symbol`.
    pub fn note_tier_taken(&self, symbol: &str, index: usize) {
        let mut positions = self.positions.write();
        if let Some(pos) = positions.get_mut(symbol) {
            if !pos.tiers_taken.contains(&index) {
                pos.tiers_taken.push(index);
            }
        }
    }

    /// Ratchet the trailing stop for `symbol` upward (never loosened).
    pub fn ratchet_trailing_stop(&self, symbol: &str, stop_price: f64) {
        let mut positions = self.positions.write();
        if let Some(pos) = positions.get_mut(symbol) {
            let tightened = match (pos.side, pos.trailing_stop) {
                (Side::Long, Some(existing)) => stop_price.max(existing),
                (Side::Short, Some(existing)) => stop_price.min(existing),
                (_, None) => stop_price,
            };
            pos.trailing_stop = Some(tightened);
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, symbol: &str) -> Option<TrackedPosition> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn open_positions(&self) -> Vec<TrackedPosition> {
        self.positions.read().values().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.positions.read().len()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Persist the snapshot (atomic tmp + rename). No-op without a path.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let content = {
            let positions = self.positions.read();
            serde_json::to_string_pretty(&*positions)
                .context("failed to serialise position snapshot")?
        };

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write tmp snapshot {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename snapshot to {}", path.display()))?;
        Ok(())
    }

    fn save_best_effort(&self) {
        if let Err(e) = self.save() {
            warn!(account = %self.account_id, error = %e, "position snapshot save failed");
        }
    }
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("account_id", &self.account_id)
            .field("open_positions", &self.positions.read().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_then_full_exit_matches_price_move_minus_fees() {
        let tracker = PositionTracker::new("t1");
        tracker.track_entry("BTC-USD", Side::Long, 50_000.0, 0.001);

        let exit = tracker.record_exit("BTC-USD", 51_000.0, 1.0, 0.0036).unwrap();
        let expected = (51_000.0 - 50_000.0) / 50_000.0 - 2.0 * 0.0036;
        assert!((exit.pnl_pct - expected).abs() < 1e-12);
        assert!(exit.closed);

        // Subsequent exit is a no-op.
        assert!(tracker.record_exit("BTC-USD", 51_000.0, 1.0, 0.0036).is_none());
        assert_eq!(tracker.open_count(), 0);
    }

    #[test]
    fn adds_reaverage_entry_price() {
        let tracker = PositionTracker::new("t1");
        tracker.track_entry("ETH-USD", Side::Long, 3_000.0, 1.0);
        tracker.track_entry("ETH-USD", Side::Long, 3_300.0, 2.0);

        let pos = tracker.get("ETH-USD").unwrap();
        assert!((pos.qty - 3.0).abs() < 1e-12);
        assert!((pos.entry_price - 3_200.0).abs() < 1e-9);
    }

    #[test]
    fn partial_exit_reduces_quantity_and_keeps_record() {
        let tracker = PositionTracker::new("t1");
        tracker.track_entry("SOL-USD", Side::Long, 100.0, 10.0);

        let exit = tracker.record_exit("SOL-USD", 104.0, 0.25, 0.0).unwrap();
        assert!(!exit.closed);
        assert!((exit.qty - 2.5).abs() < 1e-12);

        let pos = tracker.get("SOL-USD").unwrap();
        assert!((pos.qty - 7.5).abs() < 1e-12);
        assert_eq!(pos.partial_exits.len(), 1);
    }

    #[test]
    fn pnl_is_fractional() {
        let tracker = PositionTracker::new("t1");
        tracker.track_entry("BTC-USD", Side::Long, 50_000.0, 0.001);

        let pnl = tracker.pnl("BTC-USD", 52_000.0).unwrap();
        assert!((pnl.pct - 0.04).abs() < 1e-12, "expected 0.04, got {}", pnl.pct);
        assert!((pnl.usd - 2.0).abs() < 1e-9);
    }

    #[test]
    fn short_pnl_sign() {
        let tracker = PositionTracker::new("t1");
        tracker.track_entry("ETH-USD", Side::Short, 3_000.0, 1.0);

        let pnl = tracker.pnl("ETH-USD", 2_910.0).unwrap();
        assert!((pnl.pct - 0.03).abs() < 1e-12);
    }

    #[test]
    fn adoption_seeds_aggressive_entry() {
        let tracker = PositionTracker::new("t1");
        let broker = vec![RawPosition {
            symbol: "DOGE-USD".into(),
            qty: 1000.0,
            entry_price: None,
        }];
        let prices = HashMap::from([("DOGE-USD".to_string(), 0.10)]);

        assert_eq!(tracker.adopt_existing(&broker, &prices), 1);

        let pos = tracker.get("DOGE-USD").unwrap();
        assert!(pos.adopted);
        assert!((pos.entry_price - 0.101).abs() < 1e-12);

        // At the observed price the adopted position reads slightly negative.
        let pnl = tracker.pnl("DOGE-USD", 0.10).unwrap();
        assert!(pnl.pct < 0.0);
    }

    #[test]
    fn adoption_skips_known_symbols() {
        let tracker = PositionTracker::new("t1");
        tracker.track_entry("BTC-USD", Side::Long, 50_000.0, 0.001);

        let broker = vec![RawPosition {
            symbol: "BTC-USD".into(),
            qty: 0.001,
            entry_price: None,
        }];
        let prices = HashMap::from([("BTC-USD".to_string(), 50_000.0)]);
        assert_eq!(tracker.adopt_existing(&broker, &prices), 0);

        let pos = tracker.get("BTC-USD").unwrap();
        assert!(!pos.adopted);
    }

    #[test]
    fn three_sell_failures_park_the_position() {
        let tracker = PositionTracker::new("t1");
        tracker.track_entry("XRP-USD", Side::Long, 0.5, 100.0);

        assert_eq!(tracker.mark_sell_failure("XRP-USD"), 1);
        assert_eq!(tracker.mark_sell_failure("XRP-USD"), 2);
        assert_eq!(tracker.mark_sell_failure("XRP-USD"), 3);

        let pos = tracker.get("XRP-USD").unwrap();
        assert!(pos.is_unsellable(Utc::now()));
        assert!(!pos.is_unsellable(Utc::now() + ChronoDuration::hours(25)));

        tracker.clear_sell_failures("XRP-USD");
        let pos = tracker.get("XRP-USD").unwrap();
        assert!(!pos.is_unsellable(Utc::now()));
    }

    #[test]
    fn trailing_stop_only_ratchets() {
        let tracker = PositionTracker::new("t1");
        tracker.track_entry("BTC-USD", Side::Long, 50_000.0, 0.001);

        tracker.ratchet_trailing_stop("BTC-USD", 50_500.0);
        tracker.ratchet_trailing_stop("BTC-USD", 50_200.0); // looser — ignored
        tracker.ratchet_trailing_stop("BTC-USD", 50_900.0);

        let pos = tracker.get("BTC-USD").unwrap();
        assert!((pos.trailing_stop.unwrap() - 50_900.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();

        {
            let tracker = PositionTracker::with_persistence("acct", dir.path()).unwrap();
            tracker.track_entry("BTC-USD", Side::Long, 50_000.0, 0.002);
            tracker.record_exit("BTC-USD", 51_000.0, 0.5, 0.0).unwrap();
        }

        let reloaded = PositionTracker::with_persistence("acct", dir.path()).unwrap();
        let pos = reloaded.get("BTC-USD").unwrap();
        assert!((pos.qty - 0.001).abs() < 1e-12);
        assert_eq!(pos.partial_exits.len(), 1);
    }

    #[test]
    fn observe_price_tracks_max_favorable() {
        let tracker = PositionTracker::new("t1");
        tracker.track_entry("BTC-USD", Side::Long, 50_000.0, 0.001);

        tracker.observe_price("BTC-USD", 51_000.0);
        tracker.observe_price("BTC-USD", 50_500.0); // retrace — high-water holds

        let pos = tracker.get("BTC-USD").unwrap();
        assert!((pos.max_favorable_pct - 0.02).abs() < 1e-12);
    }
}
