// =============================================================================
// Shared Engine State — the view the HTTP API serves
// =============================================================================
//
// Ties the per-process singletons (state machine, kill switch, journal)
// together with one handle per running account. Nothing here owns trading
// logic; account loops own their trackers, and this module only reads.
//
// The snapshot builder produces the JSON payloads for the read-only
// endpoints: engine mode, per-account liveness, open positions, and
// aggregate PnL.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::account_loop::{LoopPhase, LoopStatus};
use crate::broker::BrokerKind;
use crate::config::EngineConfig;
use crate::journal::{JournalStats, TradeJournal};
use crate::kill_switch::KillSwitch;
use crate::position::{PositionTracker, TrackedPosition};
use crate::state_machine::StateMachine;
use crate::types::AccountRole;

/// One running account, registered by the supervisor.
pub struct AccountHandle {
    pub account_id: String,
    pub broker: BrokerKind,
    pub role: AccountRole,
    pub tracker: Arc<PositionTracker>,
    pub status: Arc<LoopStatus>,
    /// Updated by the account loop each tick.
    pub equity_usd: Arc<RwLock<f64>>,
}

/// Process-wide shared state.
pub struct EngineShared {
    pub config: EngineConfig,
    pub state_machine: Arc<StateMachine>,
    pub kill_switch: Arc<KillSwitch>,
    pub journal: Arc<TradeJournal>,
    accounts: RwLock<Vec<Arc<AccountHandle>>>,
    start_time: std::time::Instant,
}

impl EngineShared {
    pub fn new(
        config: EngineConfig,
        state_machine: Arc<StateMachine>,
        kill_switch: Arc<KillSwitch>,
        journal: Arc<TradeJournal>,
    ) -> Self {
        Self {
            config,
            state_machine,
            kill_switch,
            journal,
            accounts: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn register_account(&self, handle: Arc<AccountHandle>) {
        self.accounts.write().push(handle);
    }

    pub fn accounts(&self) -> Vec<Arc<AccountHandle>> {
        self.accounts.read().clone()
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn build_snapshot(&self) -> StateSnapshot {
        let engine_state = self.state_machine.snapshot();
        let accounts: Vec<AccountSnapshot> = self
            .accounts()
            .iter()
            .map(|handle| AccountSnapshot {
                account_id: handle.account_id.clone(),
                broker: handle.broker.to_string(),
                role: handle.role.to_string(),
                phase: handle.status.phase(),
                last_tick_age_secs: handle.status.last_tick_age_secs(),
                cycles: handle.status.cycles(),
                equity_usd: *handle.equity_usd.read(),
                open_positions: handle.tracker.open_count(),
            })
            .collect();

        StateSnapshot {
            mode: engine_state.mode.to_string(),
            mode_reason: engine_state.reason,
            last_transition_at: engine_state.last_transition_at.to_rfc3339(),
            kill_switch_engaged: self.kill_switch.is_engaged(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            dry_run: self.config.dry_run,
            accounts,
        }
    }

    pub fn all_positions(&self) -> Vec<PositionView> {
        self.accounts()
            .iter()
            .flat_map(|handle| {
                let account_id = handle.account_id.clone();
                let broker = handle.broker.to_string();
                handle
                    .tracker
                    .open_positions()
                    .into_iter()
                    .map(move |pos| PositionView {
                        account_id: account_id.clone(),
                        broker: broker.clone(),
                        position: pos,
                    })
            })
            .collect()
    }

    pub fn pnl_snapshot(&self) -> PnlSnapshot {
        PnlSnapshot {
            stats: self.journal.stats(),
            open_positions: self.all_positions().len(),
        }
    }
}

impl std::fmt::Debug for EngineShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShared")
            .field("mode", &self.state_machine.mode())
            .field("accounts", &self.accounts.read().len())
            .finish()
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub mode: String,
    pub mode_reason: String,
    pub last_transition_at: String,
    pub kill_switch_engaged: bool,
    pub uptime_secs: u64,
    pub dry_run: bool,
    pub accounts: Vec<AccountSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub broker: String,
    pub role: String,
    pub phase: LoopPhase,
    pub last_tick_age_secs: Option<u64>,
    pub cycles: u64,
    pub equity_usd: f64,
    pub open_positions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    pub account_id: String,
    pub broker: String,
    #[serde(flatten)]
    pub position: TrackedPosition,
}

#[derive(Debug, Clone, Serialize)]
pub struct PnlSnapshot {
    #[serde(flatten)]
    pub stats: JournalStats,
    pub open_positions: usize,
}
