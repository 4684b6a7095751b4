// =============================================================================
// Kill Switch — file-, env-, and API-triggered emergency halt
// =============================================================================
//
// Three independent triggers, any of which engages the switch:
//
//   file — `{datadir}/EMERGENCY_STOP` sentinel exists
//   env  — `APEX_KILL_SWITCH` set to 1/true/yes
//   API  — `engage()` called (POST /api/v1/control/kill)
//
// Account loops re-check `is_engaged` at the top of every tick, so a trip
// takes effect within one cycle. In-flight broker calls are allowed to
// complete; no new orders are placed once engaged.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

/// Environment variable that forces the switch on.
const KILL_ENV_VAR: &str = "APEX_KILL_SWITCH";
/// Sentinel file name under the data dir.
const SENTINEL_FILE: &str = "EMERGENCY_STOP";

pub struct KillSwitch {
    sentinel_path: PathBuf,
    engaged: AtomicBool,
}

impl KillSwitch {
    /// Create the switch for `datadir`. A sentinel left behind by a previous
    /// run engages it immediately.
    pub fn new(datadir: &Path) -> Self {
        let sentinel_path = datadir.join(SENTINEL_FILE);
        let pre_engaged = sentinel_path.exists();
        if pre_engaged {
            warn!(
                path = %sentinel_path.display(),
                "EMERGENCY_STOP sentinel present at startup; kill switch engaged"
            );
        }
        Self {
            sentinel_path,
            engaged: AtomicBool::new(pre_engaged),
        }
    }

    /// True when any trigger is active. Checked at every loop suspension
    /// point.
    pub fn is_engaged(&self) -> bool {
        if self.engaged.load(Ordering::SeqCst) {
            return true;
        }
        if env_flag_set() {
            return true;
        }
        if self.sentinel_path.exists() {
            // Latch so later checks are cheap even if the file is removed.
            self.engaged.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Engage via the API. Writes the sentinel so the halt survives a
    /// restart until an operator clears it.
    pub fn engage(&self, reason: &str) {
        self.engaged.store(true, Ordering::SeqCst);
        if let Err(e) = std::fs::write(&self.sentinel_path, reason) {
            warn!(
                error = %e,
                path = %self.sentinel_path.display(),
                "failed to write EMERGENCY_STOP sentinel"
            );
        }
        warn!(reason, "kill switch ENGAGED");
    }

    /// Manual reset: remove the sentinel and clear the latch. The state
    /// machine still requires its own EMERGENCY_STOP -> OFF reset.
    pub fn clear(&self) {
        if self.sentinel_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.sentinel_path) {
                warn!(error = %e, "failed to remove EMERGENCY_STOP sentinel");
                return;
            }
        }
        self.engaged.store(false, Ordering::SeqCst);
        info!("kill switch cleared");
    }
}

fn env_flag_set() -> bool {
    std::env::var(KILL_ENV_VAR)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch")
            .field("engaged", &self.engaged.load(Ordering::SeqCst))
            .field("sentinel_path", &self.sentinel_path)
            .finish()
    }
}
