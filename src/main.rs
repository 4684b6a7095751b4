// =============================================================================
// APEX Trading Engine — Main Entry Point
// =============================================================================
//
// The engine always boots OFF, whatever state was persisted. Live trading
// requires the explicit confirmation protocol through the API (or DRY_RUN
// mode via configuration). Exit codes: 0 on a clean shutdown, non-zero on
// unrecoverable supervisor failure (invalid credentials, corrupt state
// file, corrupt nonce store).
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod account_loop;
mod api;
mod app_state;
mod broker;
mod cleanup;
mod config;
mod copy_trade;
mod error;
mod exit;
mod indicators;
mod journal;
mod kill_switch;
mod nonce;
mod position;
mod rate_limiter;
mod risk;
mod state_machine;
mod strategy;
mod supervisor;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::EngineShared;
use crate::config::EngineConfig;
use crate::journal::TradeJournal;
use crate::kill_switch::KillSwitch;
use crate::state_machine::StateMachine;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("APEX trading engine starting up");

    let config = EngineConfig::from_env().context("failed to load configuration")?;
    std::fs::create_dir_all(&config.datadir)
        .with_context(|| format!("failed to create data dir {}", config.datadir.display()))?;

    // ── 2. Safety singletons ─────────────────────────────────────────────
    // A corrupt state file is unrecoverable by design: exit non-zero and
    // let an operator look at it rather than guess a mode.
    let state_machine = Arc::new(
        StateMachine::load(&config.datadir).context("failed to load engine state")?,
    );
    let kill_switch = Arc::new(KillSwitch::new(&config.datadir));
    let journal = Arc::new(TradeJournal::open(&config.datadir).context("failed to open journal")?);

    if kill_switch.is_engaged() {
        warn!("kill switch engaged at boot; engine will not trade until it is cleared");
        let _ = state_machine.emergency_stop("kill switch engaged at boot");
    }

    let shared = Arc::new(EngineShared::new(
        config.clone(),
        state_machine.clone(),
        kill_switch,
        journal,
    ));

    // ── 3. API server ────────────────────────────────────────────────────
    let api_shared = shared.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_shared);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    // ── 4. Supervisor: brokers, loops, cleanup ───────────────────────────
    let supervisor = Supervisor::start(shared.clone())
        .await
        .context("supervisor startup failed")?;

    info!("all subsystems running; ctrl-c to stop");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received; stopping");

    supervisor.shutdown();
    // Loops exit at their next suspension point; give them a moment.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    for handle in shared.accounts() {
        if let Err(e) = handle.tracker.save() {
            error!(account = %handle.account_id, error = %e, "failed to persist positions");
        }
    }

    info!("APEX engine shut down complete");
    Ok(())
}
