// =============================================================================
// Engine State Machine — gated mode transitions with atomic persistence
// =============================================================================
//
// Legal transitions, and only these:
//
//   OFF -> DRY_RUN                      (explicit user action)
//   OFF -> LIVE_PENDING_CONFIRMATION    (requires risk acknowledgement)
//   LIVE_PENDING_CONFIRMATION -> LIVE_ACTIVE  (confirmation + broker connect)
//   any -> EMERGENCY_STOP               (immediate)
//   EMERGENCY_STOP -> OFF               (manual reset only)
//
// Invalid transitions leave the state unchanged and return a typed denial.
//
// COLD-START RULE: whatever mode was persisted, the engine boots OFF. The
// resume protocol (with a fresh risk acknowledgement) is the only way back
// into live trading. Every transition is persisted with the atomic
// tmp + rename pattern before it is visible to callers.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Engine operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineMode {
    Off,
    DryRun,
    LivePendingConfirmation,
    LiveActive,
    EmergencyStop,
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "OFF"),
            Self::DryRun => write!(f, "DRY_RUN"),
            Self::LivePendingConfirmation => write!(f, "LIVE_PENDING_CONFIRMATION"),
            Self::LiveActive => write!(f, "LIVE_ACTIVE"),
            Self::EmergencyStop => write!(f, "EMERGENCY_STOP"),
        }
    }
}

/// Persisted engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub mode: EngineMode,
    pub last_transition_at: DateTime<Utc>,
    pub reason: String,
}

/// A transition the table does not allow. The state is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("state transition denied: {from} -> {to} ({detail})")]
pub struct TransitionDenied {
    pub from: EngineMode,
    pub to: EngineMode,
    pub detail: String,
}

/// The gated state machine. All mode changes go through the methods below;
/// there is no way to set a mode directly.
pub struct StateMachine {
    path: PathBuf,
    state: RwLock<EngineState>,
}

impl StateMachine {
    /// Load from `{datadir}/engine_state.json`, then force OFF regardless of
    /// what was persisted (cold-start rule). A corrupt state file is a fatal
    /// error; the supervisor exits non-zero rather than guess.
    pub fn load(datadir: &Path) -> Result<Self> {
        let path = datadir.join("engine_state.json");

        let prior_mode = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let prior: EngineState = serde_json::from_str(&content)
                    .with_context(|| format!("corrupt engine state file {}", path.display()))?;
                Some(prior.mode)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read engine state {}", path.display()))
            }
        };

        if let Some(mode) = prior_mode {
            if mode != EngineMode::Off {
                warn!(
                    prior_mode = %mode,
                    "persisted engine mode discarded on cold start; booting OFF"
                );
            }
        }

        let machine = Self {
            path,
            state: RwLock::new(EngineState {
                mode: EngineMode::Off,
                last_transition_at: Utc::now(),
                reason: match prior_mode {
                    Some(m) => format!("cold start (prior mode {m})"),
                    None => "cold start".to_string(),
                },
            }),
        };
        machine.persist()?;

        info!(mode = %EngineMode::Off, "engine state machine initialised");
        Ok(machine)
    }

    pub fn mode(&self) -> EngineMode {
        self.state.read().mode
    }

    pub fn snapshot(&self) -> EngineState {
        self.state.read().clone()
    }

    /// True when new entries may be placed. Anything else is managing-only
    /// at best.
    pub fn entries_allowed(&self) -> bool {
        matches!(self.mode(), EngineMode::LiveActive | EngineMode::DryRun)
    }

    // -------------------------------------------------------------------------
    // Gated transitions
    // -------------------------------------------------------------------------

    /// OFF -> DRY_RUN.
    pub fn start_dry_run(&self, reason: &str) -> Result<(), TransitionDenied> {
        self.apply(EngineMode::DryRun, reason)
    }

    /// OFF -> LIVE_PENDING_CONFIRMATION. Refused without an explicit risk
    /// acknowledgement.
    pub fn request_live(&self, risk_acknowledged: bool, reason: &str) -> Result<(), TransitionDenied> {
        if !risk_acknowledged {
            let from = self.mode();
            return Err(TransitionDenied {
                from,
                to: EngineMode::LivePendingConfirmation,
                detail: "risk acknowledgement required".to_string(),
            });
        }
        self.apply(EngineMode::LivePendingConfirmation, reason)
    }

    /// LIVE_PENDING_CONFIRMATION -> LIVE_ACTIVE, after broker connect.
    pub fn confirm_live(&self, reason: &str) -> Result<(), TransitionDenied> {
        self.apply(EngineMode::LiveActive, reason)
    }

    /// any -> EMERGENCY_STOP. Idempotent.
    pub fn emergency_stop(&self, reason: &str) -> Result<(), TransitionDenied> {
        self.apply(EngineMode::EmergencyStop, reason)
    }

    /// EMERGENCY_STOP -> OFF. Manual reset only.
    pub fn reset(&self, reason: &str) -> Result<(), TransitionDenied> {
        self.apply(EngineMode::Off, reason)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn legal(from: EngineMode, to: EngineMode) -> bool {
        use EngineMode::*;
        matches!(
            (from, to),
            (Off, DryRun)
                | (Off, LivePendingConfirmation)
                | (LivePendingConfirmation, LiveActive)
                | (_, EmergencyStop)
                | (EmergencyStop, Off)
        )
    }

    fn apply(&self, to: EngineMode, reason: &str) -> Result<(), TransitionDenied> {
        let mut state = self.state.write();
        let from = state.mode;

        if !Self::legal(from, to) {
            warn!(from = %from, to = %to, reason, "illegal state transition denied");
            return Err(TransitionDenied {
                from,
                to,
                detail: "not in the legal transition table".to_string(),
            });
        }

        state.mode = to;
        state.last_transition_at = Utc::now();
        state.reason = reason.to_string();
        let snapshot = state.clone();
        drop(state);

        info!(from = %from, to = %to, reason, "engine state transition");

        // Persist after the in-memory change; a write failure rolls back so
        // memory and disk never disagree on a live mode.
        if let Err(e) = self.persist_state(&snapshot) {
            warn!(error = %e, "failed to persist engine state; rolling back");
            let mut state = self.state.write();
            state.mode = from;
            return Err(TransitionDenied {
                from,
                to,
                detail: format!("persistence failed: {e}"),
            });
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let snapshot = self.state.read().clone();
        self.persist_state(&snapshot)
    }

    /// Atomic write: tmp + rename.
    fn persist_state(&self, state: &EngineState) -> Result<()> {
        let content =
            serde_json::to_string_pretty(state).context("failed to serialise engine state")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write tmp state {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename state to {}", self.path.display()))?;
        Ok(())
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("mode", &self.state.read().mode)
            .field("path", &self.path)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> (tempfile::TempDir, StateMachine) {
        let dir = tempfile::tempdir().unwrap();
        let machine = StateMachine::load(dir.path()).unwrap();
        (dir, machine)
    }

    #[test]
    fn boots_off() {
        let (_dir, machine) = machine();
        assert_eq!(machine.mode(), EngineMode::Off);
        assert!(!machine.entries_allowed());
    }

    #[test]
    fn full_live_path() {
        let (_dir, machine) = machine();
        machine.request_live(true, "operator go-live").unwrap();
        assert_eq!(machine.mode(), EngineMode::LivePendingConfirmation);
        machine.confirm_live("brokers connected").unwrap();
        assert_eq!(machine.mode(), EngineMode::LiveActive);
        assert!(machine.entries_allowed());
    }

    #[test]
    fn live_requires_risk_acknowledgement() {
        let (_dir, machine) = machine();
        let err = machine.request_live(false, "go-live").unwrap_err();
        assert_eq!(err.to, EngineMode::LivePendingConfirmation);
        assert_eq!(machine.mode(), EngineMode::Off);
    }

    #[test]
    fn invalid_transition_leaves_state_unchanged() {
        let (_dir, machine) = machine();
        // OFF -> LIVE_ACTIVE directly is illegal.
        assert!(machine.confirm_live("skip confirmation").is_err());
        assert_eq!(machine.mode(), EngineMode::Off);

        // DRY_RUN -> LIVE_PENDING is illegal too.
        machine.start_dry_run("test").unwrap();
        assert!(machine.request_live(true, "from dry run").is_err());
        assert_eq!(machine.mode(), EngineMode::DryRun);
    }

    #[test]
    fn emergency_stop_from_anywhere_then_manual_reset() {
        let (_dir, machine) = machine();
        machine.start_dry_run("test").unwrap();
        machine.emergency_stop("kill switch").unwrap();
        assert_eq!(machine.mode(), EngineMode::EmergencyStop);

        // Only OFF is reachable from EMERGENCY_STOP.
        assert!(machine.start_dry_run("escape").is_err());
        machine.reset("manual reset").unwrap();
        assert_eq!(machine.mode(), EngineMode::Off);
    }

    #[test]
    fn cold_start_discards_persisted_live_mode() {
        let dir = tempfile::tempdir().unwrap();
        {
            let machine = StateMachine::load(dir.path()).unwrap();
            machine.request_live(true, "go").unwrap();
            machine.confirm_live("connected").unwrap();
            assert_eq!(machine.mode(), EngineMode::LiveActive);
        }

        // Simulated restart: whatever was persisted, we boot OFF.
        let machine = StateMachine::load(dir.path()).unwrap();
        assert_eq!(machine.mode(), EngineMode::Off);
        assert!(machine.snapshot().reason.contains("LIVE_ACTIVE"));
    }

    #[test]
    fn corrupt_state_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("engine_state.json"), "{not json").unwrap();
        assert!(StateMachine::load(dir.path()).is_err());
    }

    #[test]
    fn off_is_not_reachable_from_dry_run() {
        // The table is exhaustive: DRY_RUN can only leave via EMERGENCY_STOP.
        let (_dir, machine) = machine();
        machine.start_dry_run("test").unwrap();
        assert!(machine.reset("stop dry run").is_err());
        assert_eq!(machine.mode(), EngineMode::DryRun);
    }
}
