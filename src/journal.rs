// =============================================================================
// Trade Journal — append-only jsonl event log with aggregate statistics
// =============================================================================
//
// Every trade event (entries, exits, copy fills, errors) is appended as one
// JSON line to `{datadir}/trade_journal.jsonl` and mirrored into an in-memory
// ring buffer for the API. The file is the durable record; the ring buffer
// exists so `GET /api/v1/trades` never touches the disk on the hot path.
// =============================================================================

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::Side;

/// Ring buffer capacity for the API view.
const RECENT_CAPACITY: usize = 500;

/// Kind of journaled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalKind {
    Entry,
    Exit,
    CopyFill,
    Error,
}

/// One journaled event. Fields irrelevant to the kind stay `None` and are
/// omitted from the serialized line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub ts: DateTime<Utc>,
    pub account_id: String,
    pub broker: String,
    pub kind: JournalKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_usd: Option<f64>,
    /// Fractional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
}

impl JournalRecord {
    fn base(account_id: &str, broker: &str, kind: JournalKind) -> Self {
        Self {
            ts: Utc::now(),
            account_id: account_id.to_string(),
            broker: broker.to_string(),
            kind,
            symbol: None,
            side: None,
            qty: None,
            price: None,
            pnl_usd: None,
            pnl_pct: None,
            reason: None,
            error_class: None,
        }
    }

    pub fn entry(
        account_id: &str,
        broker: &str,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
            side: Some(side),
            qty: Some(qty),
            price: Some(price),
            ..Self::base(account_id, broker, JournalKind::Entry)
        }
    }

    pub fn exit(
        account_id: &str,
        broker: &str,
        symbol: &str,
        qty: f64,
        price: f64,
        pnl_usd: f64,
        pnl_pct: f64,
        reason: &str,
    ) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
            qty: Some(qty),
            price: Some(price),
            pnl_usd: Some(pnl_usd),
            pnl_pct: Some(pnl_pct),
            reason: Some(reason.to_string()),
            ..Self::base(account_id, broker, JournalKind::Exit)
        }
    }

    pub fn copy_fill(
        follower_id: &str,
        broker: &str,
        symbol: &str,
        side: Side,
        notional_usd: f64,
        reason: &str,
    ) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
            side: Some(side),
            price: None,
            qty: None,
            pnl_usd: Some(notional_usd),
            reason: Some(reason.to_string()),
            ..Self::base(follower_id, broker, JournalKind::CopyFill)
        }
    }

    pub fn error(
        account_id: &str,
        broker: &str,
        symbol: Option<&str>,
        class: &str,
        cause: &str,
    ) -> Self {
        Self {
            symbol: symbol.map(|s| s.to_string()),
            reason: Some(cause.to_string()),
            error_class: Some(class.to_string()),
            ..Self::base(account_id, broker, JournalKind::Error)
        }
    }
}

/// Aggregate PnL statistics over journaled exits.
#[derive(Debug, Clone, Serialize)]
pub struct JournalStats {
    pub total_trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub net_pnl_usd: f64,
    pub profit_factor: f64,
}

/// Append-only journal.
pub struct TradeJournal {
    file: Mutex<File>,
    recent: Mutex<VecDeque<JournalRecord>>,
}

impl TradeJournal {
    /// Open (append) `{datadir}/trade_journal.jsonl`.
    pub fn open(datadir: &Path) -> Result<Self> {
        let path = datadir.join("trade_journal.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open trade journal {}", path.display()))?;

        Ok(Self {
            file: Mutex::new(file),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        })
    }

    /// Append one record. Serialization or write failures are logged, never
    /// propagated — journaling must not break trading.
    pub fn record(&self, record: JournalRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => {
                let mut file = self.file.lock();
                if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
                    warn!(error = %e, "trade journal write failed");
                }
            }
            Err(e) => warn!(error = %e, "trade journal serialisation failed"),
        }

        let mut recent = self.recent.lock();
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    /// Most recent `n` records, newest first.
    pub fn recent(&self, n: usize) -> Vec<JournalRecord> {
        let recent = self.recent.lock();
        recent.iter().rev().take(n).cloned().collect()
    }

    /// Aggregate statistics over the in-memory exit records.
    pub fn stats(&self) -> JournalStats {
        let recent = self.recent.lock();
        let exits: Vec<&JournalRecord> = recent
            .iter()
            .filter(|r| r.kind == JournalKind::Exit)
            .collect();

        let total_trades = exits.len();
        let wins = exits
            .iter()
            .filter(|r| r.pnl_usd.unwrap_or(0.0) > 0.0)
            .count();
        let net_pnl_usd: f64 = exits.iter().filter_map(|r| r.pnl_usd).sum();
        let gross_profit: f64 = exits
            .iter()
            .filter_map(|r| r.pnl_usd)
            .filter(|&p| p > 0.0)
            .sum();
        let gross_loss: f64 = exits
            .iter()
            .filter_map(|r| r.pnl_usd)
            .filter(|&p| p < 0.0)
            .map(f64::abs)
            .sum();

        let win_rate = if total_trades > 0 {
            wins as f64 / total_trades as f64
        } else {
            0.0
        };
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        JournalStats {
            total_trades,
            wins,
            win_rate,
            net_pnl_usd,
            profit_factor,
        }
    }
}

impl std::fmt::Debug for TradeJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeJournal")
            .field("recent_records", &self.recent.lock().len())
            .finish()
    }
}
