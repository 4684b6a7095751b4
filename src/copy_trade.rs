// =============================================================================
// Copy-Trade Bus — master fills fanned out to scaled follower orders
// =============================================================================
//
// The bus breaks the cycle between account loops: the master publishes fill
// events into a broadcast channel and never knows who is listening; each
// follower runs its own task consuming value copies of the events.
//
// Scaling uses MASTER EQUITY CAPTURED AT FILL TIME (never current equity):
//
//   scale             = follower_equity / master_equity_at_fill
//   follower_size_usd = min(master_size_usd * scale,
//                           follower_equity * MAX_USER_RISK)
//
// The idempotency key derives from (master_order_id, follower_id), so a
// redelivered event can never double-fill a follower. Follower failures are
// isolated: one follower's error is journaled and never blocks the others.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::broker::{BrokerAdapter, BrokerKind};
use crate::journal::{JournalRecord, TradeJournal};
use crate::types::{MarketOrderRequest, Side};

/// Hard per-event cap on follower exposure, fractional of follower equity.
pub const MAX_USER_RISK: f64 = 0.10;

/// Broadcast channel depth. Slow followers that fall further behind than
/// this lose oldest events (logged as lagged).
const BUS_CAPACITY: usize = 64;

/// A master fill, published as a value copy to every follower.
#[derive(Debug, Clone, Serialize)]
pub struct CopyEvent {
    pub master_order_id: String,
    pub broker: BrokerKind,
    pub symbol: String,
    pub side: Side,
    pub size_usd: f64,
    /// Scale basis: master equity at the moment of the fill.
    pub master_equity_at_fill: f64,
    pub ts: DateTime<Utc>,
}

/// Publish/subscribe hub owned by the supervisor.
pub struct CopyTradeBus {
    tx: broadcast::Sender<CopyEvent>,
}

impl CopyTradeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish a master fill. A bus with no followers is not an error.
    pub fn publish(&self, event: CopyEvent) {
        debug!(
            master_order_id = %event.master_order_id,
            symbol = %event.symbol,
            size_usd = event.size_usd,
            master_equity = event.master_equity_at_fill,
            "copy event published"
        );
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CopyEvent> {
        self.tx.subscribe()
    }

    pub fn follower_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for CopyTradeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CopyTradeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyTradeBus")
            .field("followers", &self.follower_count())
            .finish()
    }
}

/// Capital-proportional follower sizing with the per-user risk cap.
pub fn follower_size_usd(
    master_size_usd: f64,
    master_equity_at_fill: f64,
    follower_equity: f64,
) -> f64 {
    if master_equity_at_fill <= 0.0 || follower_equity <= 0.0 || master_size_usd <= 0.0 {
        return 0.0;
    }
    let scale = follower_equity / master_equity_at_fill;
    (master_size_usd * scale).min(follower_equity * MAX_USER_RISK)
}

/// Idempotency key for a follower order copying a master fill.
pub fn copy_client_id(master_order_id: &str, follower_id: &str) -> String {
    format!("copy-{master_order_id}-{follower_id}")
}

/// Long-running follower task. Consumes bus events for this follower's
/// broker and mirrors them at scale. Spawned once per enabled follower; the
/// follower's independent scan loop stays disabled while this runs.
pub async fn run_follower(
    adapter: Arc<dyn BrokerAdapter>,
    journal: Arc<TradeJournal>,
    mut events: broadcast::Receiver<CopyEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let follower_id = adapter.account_id().to_string();
    info!(follower = %follower_id, broker = %adapter.kind(), "copy-trade follower started");

    loop {
        let event = tokio::select! {
            received = events.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(follower = %follower_id, missed, "follower lagged; copy events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        };

        if event.broker != adapter.kind() {
            continue;
        }

        if let Err(e) = mirror_fill(adapter.as_ref(), &journal, &follower_id, &event).await {
            // Isolation: log and journal, never propagate.
            warn!(
                follower = %follower_id,
                symbol = %event.symbol,
                error = %e,
                "follower copy order failed"
            );
            journal.record(JournalRecord::error(
                &follower_id,
                &adapter.kind().to_string(),
                Some(&event.symbol),
                &e.class().to_string(),
                &e.to_string(),
            ));
        }
    }

    info!(follower = %follower_id, "copy-trade follower stopped");
}

async fn mirror_fill(
    adapter: &dyn BrokerAdapter,
    journal: &TradeJournal,
    follower_id: &str,
    event: &CopyEvent,
) -> Result<(), crate::error::BrokerError> {
    let balance = adapter.get_balance("USD").await?;
    let size_usd = follower_size_usd(event.size_usd, event.master_equity_at_fill, balance.total);

    if size_usd < adapter.min_notional() {
        debug!(
            follower = %follower_id,
            symbol = %event.symbol,
            size_usd,
            min_notional = adapter.min_notional(),
            "scaled copy order below venue minimum; skipped"
        );
        return Ok(());
    }

    let request = MarketOrderRequest {
        client_id: copy_client_id(&event.master_order_id, follower_id),
        symbol: event.symbol.clone(),
        side: event.side,
        qty: None,
        notional_usd: Some(size_usd),
    };
    let order = adapter.place_market(&request).await?;

    info!(
        follower = %follower_id,
        symbol = %event.symbol,
        side = %event.side,
        size_usd,
        order_id = %order.broker_order_id,
        "follower copy order placed"
    );
    journal.record(JournalRecord::copy_fill(
        follower_id,
        &adapter.kind().to_string(),
        &event.symbol,
        event.side,
        size_usd,
        &format!("copy of master order {}", event.master_order_id),
    ));
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_scaling_small_follower() {
        // Master $10,000 places $500 (5%). Follower with $100 mirrors $5.
        let size = follower_size_usd(500.0, 10_000.0, 100.0);
        assert!((size - 5.0).abs() < 1e-12);
    }

    #[test]
    fn proportional_scaling_large_follower() {
        // Follower with $2,000 mirrors $100 — well under the 10% cap.
        let size = follower_size_usd(500.0, 10_000.0, 2_000.0);
        assert!((size - 100.0).abs() < 1e-12);
    }

    #[test]
    fn risk_cap_binds_oversized_scaling() {
        // Master goes all-in with 50% of equity; follower exposure is capped
        // at 10% of follower equity.
        let size = follower_size_usd(5_000.0, 10_000.0, 100.0);
        assert!((size - 10.0).abs() < 1e-12);
    }

    #[test]
    fn scaling_invariant_never_exceeds_cap() {
        for follower_equity in [10.0, 100.0, 1_000.0, 50_000.0] {
            for master_size in [10.0, 500.0, 9_000.0] {
                let size = follower_size_usd(master_size, 10_000.0, follower_equity);
                assert!(
                    size <= follower_equity * MAX_USER_RISK + 1e-9,
                    "size {size} exceeds cap for equity {follower_equity}"
                );
            }
        }
    }

    #[test]
    fn degenerate_inputs_size_zero() {
        assert_eq!(follower_size_usd(500.0, 0.0, 100.0), 0.0);
        assert_eq!(follower_size_usd(500.0, 10_000.0, 0.0), 0.0);
        assert_eq!(follower_size_usd(0.0, 10_000.0, 100.0), 0.0);
    }

    #[test]
    fn client_id_derives_from_master_order_and_follower() {
        let a = copy_client_id("ord-1", "kraken_daivon");
        let b = copy_client_id("ord-1", "kraken_daivon");
        let c = copy_client_id("ord-2", "kraken_daivon");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.contains("ord-1") && a.contains("kraken_daivon"));
    }

    #[tokio::test]
    async fn bus_delivers_value_copies_to_subscribers() {
        let bus = CopyTradeBus::new();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.publish(CopyEvent {
            master_order_id: "ord-7".into(),
            broker: BrokerKind::Kraken,
            symbol: "BTC-USD".into(),
            side: Side::Long,
            size_usd: 500.0,
            master_equity_at_fill: 10_000.0,
            ts: Utc::now(),
        });

        let a = rx_a.recv().await.unwrap();
        let b = rx_b.recv().await.unwrap();
        assert_eq!(a.master_order_id, "ord-7");
        assert_eq!(b.size_usd, 500.0);
        assert!((a.master_equity_at_fill - 10_000.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn publish_without_followers_is_fine() {
        let bus = CopyTradeBus::new();
        bus.publish(CopyEvent {
            master_order_id: "ord-8".into(),
            broker: BrokerKind::Coinbase,
            symbol: "ETH-USD".into(),
            side: Side::Long,
            size_usd: 50.0,
            master_equity_at_fill: 1_000.0,
            ts: Utc::now(),
        });
        assert_eq!(bus.follower_count(), 0);
    }
}
