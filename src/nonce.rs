// =============================================================================
// NonceStore — per-account persistent monotonic counter
// =============================================================================
//
// Kraken-style APIs require a strictly increasing nonce per API key. Two
// rules keep this safe across restarts and concurrent tasks:
//
//   1. The value is persisted (tmp + rename + fsync) BEFORE it is released
//      to the caller. A crash after persistence burns a nonce; a crash
//      before persistence re-issues nothing.
//   2. All access goes through one mutex per store, and each account owns
//      exactly one store. The file name embeds the account identity and is
//      asserted at open so two accounts can never share a counter.
//
// Values start at the current epoch milliseconds so a lost file still
// resumes above everything previously issued.
// =============================================================================

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::types::AccountRole;

/// File-backed strictly monotonic nonce counter for one account.
pub struct NonceStore {
    account_id: String,
    path: PathBuf,
    last_issued: Mutex<u64>,
}

impl NonceStore {
    /// Open (or create) the nonce file for `(role, account_id)` under
    /// `datadir`. The path is `{datadir}/nonce_{role}_{account_id}.txt`.
    pub fn open(datadir: &Path, role: AccountRole, account_id: &str) -> Result<Self> {
        ensure!(
            !account_id.is_empty(),
            "nonce store requires a non-empty account id"
        );

        let file_name = format!("nonce_{role}_{account_id}.txt");
        let path = datadir.join(&file_name);

        // The file name must identify the account it serves. This assertion
        // is the last line of defense against two accounts sharing a counter.
        assert!(
            file_name.contains(account_id),
            "nonce file name {file_name} does not embed account id {account_id}"
        );

        fs::create_dir_all(datadir)
            .with_context(|| format!("failed to create data dir {}", datadir.display()))?;

        let (last, fresh) = match fs::read_to_string(&path) {
            Ok(content) => (
                content
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("corrupt nonce file {}", path.display()))?,
                false,
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (0, true),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read nonce file {}", path.display()))
            }
        };

        info!(
            account = account_id,
            path = %path.display(),
            last_issued = last,
            "nonce store opened"
        );

        let store = Self {
            account_id: account_id.to_string(),
            path,
            last_issued: Mutex::new(last),
        };
        if fresh {
            store.persist(last)?;
        }
        Ok(store)
    }

    /// Issue the next nonce: `max(previous + 1, now_ms)`, persisted with
    /// fsync before the value is returned.
    pub fn next(&self) -> Result<u64> {
        let mut last = self.last_issued.lock();

        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let next = (*last + 1).max(now_ms);

        // A non-advancing nonce means the clock or the counter is corrupt.
        // Fail closed rather than send a duplicate to the venue.
        ensure!(
            next > *last,
            "nonce for account {} failed to advance ({} -> {})",
            self.account_id,
            *last,
            next
        );

        self.persist(next)?;
        *last = next;

        debug!(account = %self.account_id, nonce = next, "nonce issued");
        Ok(next)
    }

    /// Atomic write (tmp + rename) with fsync on the tmp file.
    fn persist(&self, value: u64) -> Result<()> {
        let tmp = self.path.with_extension("txt.tmp");

        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create tmp nonce file {}", tmp.display()))?;
        file.write_all(value.to_string().as_bytes())
            .context("failed to write nonce value")?;
        file.sync_all().context("failed to fsync nonce file")?;

        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename nonce file to {}", self.path.display()))?;
        Ok(())
    }
}

impl std::fmt::Debug for NonceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceStore")
            .field("account_id", &self.account_id)
            .field("path", &self.path)
            .field("last_issued", &*self.last_issued.lock())
            .finish()
    }
}
