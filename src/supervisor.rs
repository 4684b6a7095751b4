// =============================================================================
// Supervisor — broker connection ordering, loop spawning, global cleanup
// =============================================================================
//
// Owns every per-process singleton and passes them down by reference; no
// module-level mutable state exists anywhere in the engine. Startup order:
//
//   1. Build adapters for MASTER accounts in broker priority order
//      (Coinbase, Kraken, OKX, Binance, Alpaca) and connect them. An
//      invalid-credential failure here is unrecoverable: the process exits
//      non-zero rather than trade with a partial roster.
//   2. Run the cycle-0 forced cleanup for every connected account (restart
//      reconciliation) under the startup budget.
//   3. Spawn account loops for masters, then wire followers: a USER account
//      on a broker with a connected MASTER gets a copy-trade task, never an
//      independent loop (unless MULTI_BROKER_INDEPENDENT).
//   4. Spawn the global cleanup timer, gated by the kill switch.
//   5. Watch for LIVE_PENDING_CONFIRMATION and confirm once brokers
//      re-verify.
//
// Shutdown is cooperative: one watch channel fans out to every task.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::account_loop::{AccountLoop, LoopConfig, LoopStatus};
use crate::app_state::{AccountHandle, EngineShared};
use crate::broker::{
    alpaca::AlpacaAdapter, binance::BinanceAdapter, coinbase::CoinbaseAdapter,
    kraken::KrakenAdapter, okx::OkxAdapter, BrokerAdapter, BrokerKind, IdempotencyMap,
};
use crate::cleanup::{run_forced_cleanup, CleanupBudget};
use crate::config::{AccountSpec, EngineConfig};
use crate::copy_trade::{run_follower, CopyTradeBus};
use crate::error::ErrorClass;
use crate::exit::ExitEngine;
use crate::nonce::NonceStore;
use crate::position::PositionTracker;
use crate::rate_limiter::RateLimiter;
use crate::risk::RiskEngine;
use crate::types::AccountRole;

/// Global cap on concurrent outbound broker calls across all accounts.
const GLOBAL_CONCURRENCY: usize = 8;
/// Poll interval for the live-confirmation watcher.
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Everything one running account needs, kept for the cleanup timer.
struct ManagedAccount {
    adapter: Arc<dyn BrokerAdapter>,
    tracker: Arc<PositionTracker>,
}

pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    /// Bring the engine up. Returns once all tasks are spawned.
    pub async fn start(shared: Arc<EngineShared>) -> Result<Self> {
        let config = shared.config.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let limiter = Arc::new(RateLimiter::new(GLOBAL_CONCURRENCY));
        let bus = Arc::new(CopyTradeBus::new());

        std::fs::create_dir_all(&config.datadir)
            .with_context(|| format!("failed to create data dir {}", config.datadir.display()))?;

        let mut managed: Vec<ManagedAccount> = Vec::new();
        let mut master_adapters: Vec<Arc<dyn BrokerAdapter>> = Vec::new();

        // ── 1. Masters, in priority order ────────────────────────────────
        for spec in config.masters() {
            let adapter = build_adapter(spec, &config, limiter.clone())?;

            match adapter.connect().await {
                Ok(identity) => {
                    info!(
                        account = %identity.account_id,
                        label = %identity.label,
                        "master broker connected"
                    );
                }
                Err(e) if e.class() == ErrorClass::Fatal => {
                    return Err(anyhow::anyhow!(e)).context(format!(
                        "authentication failed for master account {}",
                        spec.account_id()
                    ));
                }
                Err(e) => {
                    warn!(
                        account = %spec.account_id(),
                        error = %e,
                        "master broker connect failed; account skipped this run"
                    );
                    continue;
                }
            }

            let tracker = Arc::new(
                PositionTracker::with_persistence(spec.account_id(), &config.datadir)
                    .context("failed to open position snapshot")?,
            );

            // ── 2. Restart reconciliation (cycle 0) ──────────────────────
            if let Err(e) = run_forced_cleanup(
                adapter.as_ref(),
                &tracker,
                &config.cap,
                CleanupBudget::Startup,
                &shared.journal,
            )
            .await
            {
                warn!(account = %spec.account_id(), error = %e, "startup cleanup failed");
            }

            master_adapters.push(adapter.clone());
            managed.push(ManagedAccount {
                adapter: adapter.clone(),
                tracker: tracker.clone(),
            });
            spawn_account_loop(
                &shared,
                spec,
                adapter,
                tracker,
                Some(bus.clone()),
                &config,
                shutdown_rx.clone(),
            );
        }

        // ── 3. Followers ─────────────────────────────────────────────────
        let master_brokers: Vec<BrokerKind> =
            master_adapters.iter().map(|a| a.kind()).collect();

        for spec in config
            .accounts
            .iter()
            .filter(|a| a.role == AccountRole::User)
        {
            let adapter = build_adapter(spec, &config, limiter.clone())?;
            if let Err(e) = adapter.connect().await {
                warn!(
                    account = %spec.account_id(),
                    error = %e,
                    "follower broker connect failed; account skipped this run"
                );
                continue;
            }

            let driven_by_master =
                master_brokers.contains(&spec.broker) && !config.multi_broker_independent;

            if driven_by_master {
                // Copy-trade only; the independent loop stays disabled so a
                // follower never generates duplicate intents.
                info!(
                    account = %spec.account_id(),
                    broker = %spec.broker,
                    "follower wired to copy-trade bus"
                );
                tokio::spawn(run_follower(
                    adapter.clone(),
                    shared.journal.clone(),
                    bus.subscribe(),
                    shutdown_rx.clone(),
                ));
                managed.push(ManagedAccount {
                    adapter,
                    tracker: Arc::new(
                        PositionTracker::with_persistence(spec.account_id(), &config.datadir)
                            .context("failed to open position snapshot")?,
                    ),
                });
            } else {
                let tracker = Arc::new(
                    PositionTracker::with_persistence(spec.account_id(), &config.datadir)
                        .context("failed to open position snapshot")?,
                );
                managed.push(ManagedAccount {
                    adapter: adapter.clone(),
                    tracker: tracker.clone(),
                });
                spawn_account_loop(
                    &shared,
                    spec,
                    adapter,
                    tracker,
                    None,
                    &config,
                    shutdown_rx.clone(),
                );
            }
        }

        // ── 4. Global cleanup timer ──────────────────────────────────────
        spawn_cleanup_timer(&shared, managed, &config, shutdown_rx.clone());

        // ── 5. Live-confirmation watcher ─────────────────────────────────
        spawn_confirmation_watcher(&shared, master_adapters, shutdown_rx);

        // Dry-run mode is an explicit user action expressed through config.
        if config.dry_run {
            if let Err(e) = shared.state_machine.start_dry_run("DRY_RUN_MODE set") {
                warn!(error = %e, "could not enter dry-run mode");
            }
        }

        info!("supervisor startup complete");
        Ok(Self { shutdown_tx })
    }

    /// Signal every task to stop at its next suspension point.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

/// Build the adapter for one account spec. Kraken accounts get their
/// per-account NonceStore here; every adapter gets a persisted idempotency
/// map.
fn build_adapter(
    spec: &AccountSpec,
    config: &EngineConfig,
    limiter: Arc<RateLimiter>,
) -> Result<Arc<dyn BrokerAdapter>> {
    let account_id = spec.account_id();
    let orders = IdempotencyMap::persisted(&config.datadir, &account_id);

    let adapter: Arc<dyn BrokerAdapter> = match spec.broker {
        BrokerKind::Coinbase => Arc::new(CoinbaseAdapter::new(
            account_id,
            spec.credentials.clone(),
            limiter,
            config.allow_consumer_usd,
            orders,
        )),
        BrokerKind::Kraken => {
            let nonces = Arc::new(
                NonceStore::open(&config.datadir, spec.role, &account_id)
                    .context("failed to open nonce store")?,
            );
            Arc::new(KrakenAdapter::new(
                account_id,
                spec.credentials.clone(),
                limiter,
                nonces,
                orders,
            ))
        }
        BrokerKind::Okx => Arc::new(OkxAdapter::new(
            account_id,
            spec.credentials.clone(),
            limiter,
            orders,
        )),
        BrokerKind::Binance => Arc::new(BinanceAdapter::new(
            account_id,
            spec.credentials.clone(),
            limiter,
            orders,
        )),
        BrokerKind::Alpaca => Arc::new(AlpacaAdapter::new(
            account_id,
            spec.credentials.clone(),
            limiter,
            orders,
        )),
    };
    Ok(adapter)
}

fn spawn_account_loop(
    shared: &Arc<EngineShared>,
    spec: &AccountSpec,
    adapter: Arc<dyn BrokerAdapter>,
    tracker: Arc<PositionTracker>,
    bus: Option<Arc<CopyTradeBus>>,
    config: &EngineConfig,
    shutdown: watch::Receiver<bool>,
) {
    let status = LoopStatus::new();
    let equity = Arc::new(RwLock::new(0.0));

    shared.register_account(Arc::new(AccountHandle {
        account_id: spec.account_id(),
        broker: spec.broker,
        role: spec.role,
        tracker: tracker.clone(),
        status: status.clone(),
        equity_usd: equity.clone(),
    }));

    let account_loop = AccountLoop::new(
        spec.role,
        adapter,
        tracker,
        Arc::new(RiskEngine::new(config.risk.clone())),
        ExitEngine::new(spec.broker, config.exit.clone()),
        bus,
        shared.journal.clone(),
        shared.state_machine.clone(),
        shared.kill_switch.clone(),
        LoopConfig {
            cycle_interval: Duration::from_secs(config.cycle_interval_secs),
            market_batch_size: config.market_batch_size,
            cap: config.cap.clone(),
            dry_run: config.dry_run,
        },
        status,
        equity,
    );

    tokio::spawn(account_loop.run(shutdown));
}

/// Periodic forced cleanup across every managed account, skipped while the
/// kill switch is engaged (no new orders once halted).
fn spawn_cleanup_timer(
    shared: &Arc<EngineShared>,
    managed: Vec<ManagedAccount>,
    config: &EngineConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval_secs = config.cycle_interval_secs * config.cap.cleanup_interval_cycles;
    let cap = config.cap.clone();
    let shared = shared.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(60)));
        ticker.tick().await; // First tick fires immediately; cycle 0 already ran.

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            if shared.kill_switch.is_engaged() {
                warn!("cleanup timer: kill switch engaged; skipping pass");
                continue;
            }

            for account in &managed {
                match run_forced_cleanup(
                    account.adapter.as_ref(),
                    &account.tracker,
                    &cap,
                    CleanupBudget::MidCycle,
                    &shared.journal,
                )
                .await
                {
                    Ok(report) if report.safety_violation => {
                        error!(
                            account = %account.tracker.account_id(),
                            remaining = report.remaining,
                            "cleanup pass left account above the position cap"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(
                        account = %account.tracker.account_id(),
                        error = %e,
                        "cleanup pass failed"
                    ),
                }
            }
        }
    });
}

/// Completes the resume protocol: when the API moves the engine to
/// LIVE_PENDING_CONFIRMATION, re-verify broker connectivity and confirm.
fn spawn_confirmation_watcher(
    shared: &Arc<EngineShared>,
    masters: Vec<Arc<dyn BrokerAdapter>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let shared = shared.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(CONFIRM_POLL_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }

            if shared.state_machine.mode()
                != crate::state_machine::EngineMode::LivePendingConfirmation
            {
                continue;
            }

            // Live capital must be explicitly verified before any
            // confirmation can succeed.
            if !shared.config.live_capital_verified {
                warn!("LIVE_CAPITAL_VERIFIED is not set; refusing to confirm live trading");
                continue;
            }

            let mut all_ok = !masters.is_empty();
            for adapter in &masters {
                if let Err(e) = adapter.connect().await {
                    warn!(
                        account = %adapter.account_id(),
                        error = %e,
                        "broker re-verification failed; staying pending"
                    );
                    all_ok = false;
                    break;
                }
            }

            if all_ok {
                match shared.state_machine.confirm_live("brokers re-verified") {
                    Ok(()) => info!("engine is LIVE_ACTIVE"),
                    Err(e) => warn!(error = %e, "live confirmation denied"),
                }
            }
        }
    });
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Credentials;
    use std::collections::HashMap;

    fn spec(broker: BrokerKind, role: AccountRole, user_id: Option<&str>) -> AccountSpec {
        AccountSpec {
            broker,
            role,
            user_id: user_id.map(|s| s.to_string()),
            credentials: Credentials {
                api_key: "k".into(),
                api_secret: "s".into(),
                passphrase: Some("p".into()),
                paper: false,
            },
        }
    }

    fn config(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::from_vars(&HashMap::new()).unwrap();
        config.datadir = dir.to_path_buf();
        config
    }

    #[test]
    fn kraken_adapter_gets_a_nonce_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let limiter = Arc::new(RateLimiter::new(2));

        let adapter = build_adapter(
            &spec(BrokerKind::Kraken, AccountRole::Master, None),
            &config,
            limiter,
        )
        .unwrap();
        assert_eq!(adapter.kind(), BrokerKind::Kraken);
        assert!(dir.path().join("nonce_master_kraken_master.txt").exists());
    }

    #[test]
    fn every_broker_kind_builds() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let limiter = Arc::new(RateLimiter::new(2));

        for kind in BrokerKind::ALL {
            let adapter = build_adapter(
                &spec(kind, AccountRole::User, Some("daivon")),
                &config,
                limiter.clone(),
            )
            .unwrap();
            assert_eq!(adapter.kind(), kind);
        }
    }

    #[test]
    fn distinct_accounts_get_distinct_nonce_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let limiter = Arc::new(RateLimiter::new(2));

        build_adapter(
            &spec(BrokerKind::Kraken, AccountRole::Master, None),
            &config,
            limiter.clone(),
        )
        .unwrap();
        build_adapter(
            &spec(BrokerKind::Kraken, AccountRole::User, Some("daivon")),
            &config,
            limiter,
        )
        .unwrap();

        assert!(dir.path().join("nonce_master_kraken_master.txt").exists());
        assert!(dir.path().join("nonce_user_kraken_daivon.txt").exists());
    }
}
