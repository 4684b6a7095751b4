// =============================================================================
// Engine Configuration — env-driven, loaded once at startup
// =============================================================================
//
// Credentials follow the `{BROKER}_{ROLE}[_{USER_ID}]_API_KEY` convention:
//
//   KRAKEN_MASTER_API_KEY / KRAKEN_MASTER_API_SECRET
//   KRAKEN_USER_DAIVON_API_KEY / ...
//   COINBASE_MASTER_PASSPHRASE (optional per venue)
//   ALPACA_MASTER_PAPER=true
//
// Engine flags: LIVE_CAPITAL_VERIFIED, DRY_RUN_MODE, ALLOW_CONSUMER_USD,
// MULTI_BROKER_INDEPENDENT, FORCED_CLEANUP_INTERVAL,
// FORCED_CLEANUP_AFTER_N_TRADES, APEX_DATA_DIR, APEX_BIND_ADDR.
//
// LEGACY UNITS: threshold overrides read from the environment are normalized
// to fractional form. A value with magnitude >= 1.0 is assumed to be
// percentage-formatted (the historical convention) and is divided by 100
// with a warning.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::broker::{BrokerKind, Credentials};
use crate::exit::ExitConfig;
use crate::risk::RiskConfig;
use crate::types::AccountRole;

// ---------------------------------------------------------------------------
// Cap / cleanup configuration
// ---------------------------------------------------------------------------

/// Position-cap and cleanup parameters.
#[derive(Debug, Clone)]
pub struct CapConfig {
    /// Hard cap on concurrent open positions per account.
    pub max_concurrent_positions: usize,
    /// Below this notional a holding is dust and is closed unconditionally.
    pub dust_threshold_usd: f64,
    /// Cleanup cadence in scan cycles.
    pub cleanup_interval_cycles: u64,
    /// Optional extra cleanup trigger every N completed trades.
    pub cleanup_after_n_trades: Option<u64>,
}

impl Default for CapConfig {
    fn default() -> Self {
        Self {
            max_concurrent_positions: 8,
            dust_threshold_usd: 0.001,
            cleanup_interval_cycles: 6,
            cleanup_after_n_trades: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Account specification
// ---------------------------------------------------------------------------

/// One (account, broker) pair discovered from the environment.
#[derive(Debug, Clone)]
pub struct AccountSpec {
    pub broker: BrokerKind,
    pub role: AccountRole,
    /// Present for USER accounts only (lower-cased).
    pub user_id: Option<String>,
    pub credentials: Credentials,
}

impl AccountSpec {
    /// Stable account identifier used in file names, rate-limit keys, and
    /// journal records. Always embeds the broker; user accounts embed their
    /// user id.
    pub fn account_id(&self) -> String {
        match (&self.role, &self.user_id) {
            (AccountRole::Master, _) => format!("{}_master", self.broker),
            (AccountRole::User, Some(id)) => format!("{}_{id}", self.broker),
            (AccountRole::User, None) => format!("{}_user", self.broker),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

/// Immutable top-level configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub datadir: PathBuf,
    pub bind_addr: String,
    pub dry_run: bool,
    pub live_capital_verified: bool,
    pub allow_consumer_usd: bool,
    /// When true, USER accounts run independent loops even on brokers where
    /// a MASTER is connected (copy-trade disabled for them).
    pub multi_broker_independent: bool,
    /// Scan cycle interval in seconds.
    pub cycle_interval_secs: u64,
    /// Markets scanned per cycle (the batch rotates through the universe).
    pub market_batch_size: usize,
    pub cap: CapConfig,
    pub risk: RiskConfig,
    pub exit: ExitConfig,
    pub accounts: Vec<AccountSpec>,
}

impl EngineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Pure loader over a variable map (testable without process state).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let datadir = PathBuf::from(
            vars.get("APEX_DATA_DIR")
                .cloned()
                .unwrap_or_else(|| "./data".to_string()),
        );
        let bind_addr = vars
            .get("APEX_BIND_ADDR")
            .cloned()
            .unwrap_or_else(|| "0.0.0.0:3001".to_string());

        let dry_run = bool_var(vars, "DRY_RUN_MODE");
        let live_capital_verified = bool_var(vars, "LIVE_CAPITAL_VERIFIED");
        let allow_consumer_usd = bool_var(vars, "ALLOW_CONSUMER_USD");
        let multi_broker_independent = bool_var(vars, "MULTI_BROKER_INDEPENDENT");

        let mut cap = CapConfig::default();
        if let Some(v) = vars.get("FORCED_CLEANUP_INTERVAL") {
            cap.cleanup_interval_cycles = v
                .parse()
                .map_err(|_| anyhow::anyhow!("FORCED_CLEANUP_INTERVAL is not an integer: {v}"))?;
        }
        if let Some(v) = vars.get("FORCED_CLEANUP_AFTER_N_TRADES") {
            cap.cleanup_after_n_trades = Some(
                v.parse().map_err(|_| {
                    anyhow::anyhow!("FORCED_CLEANUP_AFTER_N_TRADES is not an integer: {v}")
                })?,
            );
        }

        let mut exit = ExitConfig::default();
        if let Some(v) = fraction_var(vars, "APEX_STOP_LOSS_THRESHOLD") {
            // Stops are losses: stored negative whichever sign arrives.
            exit.stop_loss_threshold = -v.abs();
        }

        let mut risk = RiskConfig::default();
        if let Some(v) = vars.get("APEX_MIN_VIABLE_CAPITAL_USD") {
            risk.min_viable_capital_usd = v
                .parse()
                .map_err(|_| anyhow::anyhow!("APEX_MIN_VIABLE_CAPITAL_USD is not a number: {v}"))?;
        }

        let accounts = discover_accounts(vars)?;
        if accounts.is_empty() {
            warn!("no broker credentials found in environment; engine will idle");
        }

        let config = Self {
            datadir,
            bind_addr,
            dry_run,
            live_capital_verified,
            allow_consumer_usd,
            multi_broker_independent,
            cycle_interval_secs: 150,
            market_batch_size: 100,
            cap,
            risk,
            exit,
            accounts,
        };

        info!(
            accounts = config.accounts.len(),
            dry_run = config.dry_run,
            datadir = %config.datadir.display(),
            "engine configuration loaded"
        );
        Ok(config)
    }

    /// Master accounts, in broker connection priority order.
    pub fn masters(&self) -> Vec<&AccountSpec> {
        let mut masters: Vec<&AccountSpec> = self
            .accounts
            .iter()
            .filter(|a| a.role == AccountRole::Master)
            .collect();
        masters.sort_by_key(|a| priority(a.broker));
        masters
    }

    /// Follower accounts on the given broker.
    pub fn followers_on(&self, broker: BrokerKind) -> Vec<&AccountSpec> {
        self.accounts
            .iter()
            .filter(|a| a.role == AccountRole::User && a.broker == broker)
            .collect()
    }
}

fn priority(kind: BrokerKind) -> usize {
    BrokerKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(usize::MAX)
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn bool_var(vars: &HashMap<String, String>, name: &str) -> bool {
    vars.get(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Read a fractional threshold, converting legacy percentage-formatted
/// values (|v| >= 1.0) with a warning.
fn fraction_var(vars: &HashMap<String, String>, name: &str) -> Option<f64> {
    let raw: f64 = vars.get(name)?.parse().ok()?;
    Some(normalize_fraction(name, raw))
}

/// Canonicalize a threshold to fractional form. `1.5` (legacy percent) and
/// `0.015` both come out as `0.015`.
pub fn normalize_fraction(name: &str, value: f64) -> f64 {
    if value.abs() >= 1.0 {
        warn!(
            var = name,
            raw = value,
            converted = value / 100.0,
            "legacy percentage-formatted value converted to fractional"
        );
        value / 100.0
    } else {
        value
    }
}

/// Scan the variable map for `{BROKER}_{ROLE}[_{USER}]_API_KEY` entries and
/// assemble complete account specs.
fn discover_accounts(vars: &HashMap<String, String>) -> Result<Vec<AccountSpec>> {
    let mut accounts = Vec::new();

    for broker in BrokerKind::ALL {
        let prefix = broker.env_prefix();

        // Master: {PREFIX}_MASTER_API_KEY.
        if let Some(spec) = assemble(vars, broker, AccountRole::Master, None)? {
            accounts.push(spec);
        }

        // Users: {PREFIX}_USER_{ID}_API_KEY.
        let user_prefix = format!("{prefix}_USER_");
        let mut user_ids: Vec<String> = vars
            .keys()
            .filter_map(|k| {
                k.strip_prefix(&user_prefix)?
                    .strip_suffix("_API_KEY")
                    .map(|id| id.to_string())
            })
            .collect();
        user_ids.sort();

        for user_id in user_ids {
            if let Some(spec) = assemble(vars, broker, AccountRole::User, Some(&user_id))? {
                accounts.push(spec);
            }
        }
    }

    Ok(accounts)
}

fn assemble(
    vars: &HashMap<String, String>,
    broker: BrokerKind,
    role: AccountRole,
    user_id: Option<&str>,
) -> Result<Option<AccountSpec>> {
    let stem = match (role, user_id) {
        (AccountRole::Master, _) => format!("{}_MASTER", broker.env_prefix()),
        (AccountRole::User, Some(id)) => format!("{}_USER_{id}", broker.env_prefix()),
        (AccountRole::User, None) => return Ok(None),
    };

    let Some(api_key) = vars.get(&format!("{stem}_API_KEY")) else {
        return Ok(None);
    };
    let Some(api_secret) = vars.get(&format!("{stem}_API_SECRET")) else {
        bail!("{stem}_API_KEY is set but {stem}_API_SECRET is missing");
    };

    Ok(Some(AccountSpec {
        broker,
        role,
        user_id: user_id.map(|id| id.to_ascii_lowercase()),
        credentials: Credentials {
            api_key: api_key.clone(),
            api_secret: api_secret.clone(),
            passphrase: vars.get(&format!("{stem}_PASSPHRASE")).cloned(),
            paper: vars
                .get(&format!("{stem}_PAPER"))
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        },
    }))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_without_any_env() {
        let config = EngineConfig::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.cap.max_concurrent_positions, 8);
        assert!((config.cap.dust_threshold_usd - 0.001).abs() < 1e-12);
        assert_eq!(config.cap.cleanup_interval_cycles, 6);
        assert_eq!(config.cycle_interval_secs, 150);
        assert_eq!(config.market_batch_size, 100);
        assert!(!config.dry_run);
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn discovers_master_and_user_accounts() {
        let config = EngineConfig::from_vars(&vars(&[
            ("KRAKEN_MASTER_API_KEY", "mk"),
            ("KRAKEN_MASTER_API_SECRET", "ms"),
            ("KRAKEN_USER_DAIVON_API_KEY", "uk"),
            ("KRAKEN_USER_DAIVON_API_SECRET", "us"),
            ("COINBASE_MASTER_API_KEY", "ck"),
            ("COINBASE_MASTER_API_SECRET", "cs"),
            ("COINBASE_MASTER_PASSPHRASE", "cp"),
        ]))
        .unwrap();

        assert_eq!(config.accounts.len(), 3);

        let kraken_user = config
            .accounts
            .iter()
            .find(|a| a.role == AccountRole::User)
            .unwrap();
        assert_eq!(kraken_user.broker, BrokerKind::Kraken);
        assert_eq!(kraken_user.user_id.as_deref(), Some("daivon"));
        assert_eq!(kraken_user.account_id(), "kraken_daivon");

        let coinbase = config
            .accounts
            .iter()
            .find(|a| a.broker == BrokerKind::Coinbase)
            .unwrap();
        assert_eq!(coinbase.account_id(), "coinbase_master");
        assert!(coinbase.credentials.passphrase.is_some());
    }

    #[test]
    fn missing_secret_is_an_error() {
        let result = EngineConfig::from_vars(&vars(&[("KRAKEN_MASTER_API_KEY", "mk")]));
        assert!(result.is_err());
    }

    #[test]
    fn masters_ordered_by_connection_priority() {
        let config = EngineConfig::from_vars(&vars(&[
            ("BINANCE_MASTER_API_KEY", "bk"),
            ("BINANCE_MASTER_API_SECRET", "bs"),
            ("COINBASE_MASTER_API_KEY", "ck"),
            ("COINBASE_MASTER_API_SECRET", "cs"),
            ("KRAKEN_MASTER_API_KEY", "kk"),
            ("KRAKEN_MASTER_API_SECRET", "ks"),
        ]))
        .unwrap();

        let order: Vec<BrokerKind> = config.masters().iter().map(|a| a.broker).collect();
        assert_eq!(
            order,
            vec![BrokerKind::Coinbase, BrokerKind::Kraken, BrokerKind::Binance]
        );
    }

    #[test]
    fn followers_on_filters_by_broker() {
        let config = EngineConfig::from_vars(&vars(&[
            ("KRAKEN_MASTER_API_KEY", "mk"),
            ("KRAKEN_MASTER_API_SECRET", "ms"),
            ("KRAKEN_USER_A_API_KEY", "ak"),
            ("KRAKEN_USER_A_API_SECRET", "as"),
            ("KRAKEN_USER_B_API_KEY", "bk"),
            ("KRAKEN_USER_B_API_SECRET", "bs"),
            ("OKX_USER_C_API_KEY", "ok"),
            ("OKX_USER_C_API_SECRET", "os"),
        ]))
        .unwrap();

        assert_eq!(config.followers_on(BrokerKind::Kraken).len(), 2);
        assert_eq!(config.followers_on(BrokerKind::Okx).len(), 1);
        assert_eq!(config.followers_on(BrokerKind::Binance).len(), 0);
    }

    #[test]
    fn engine_flags_parse() {
        let config = EngineConfig::from_vars(&vars(&[
            ("DRY_RUN_MODE", "true"),
            ("LIVE_CAPITAL_VERIFIED", "1"),
            ("MULTI_BROKER_INDEPENDENT", "yes"),
            ("FORCED_CLEANUP_INTERVAL", "12"),
            ("FORCED_CLEANUP_AFTER_N_TRADES", "25"),
        ]))
        .unwrap();

        assert!(config.dry_run);
        assert!(config.live_capital_verified);
        assert!(config.multi_broker_independent);
        assert!(!config.allow_consumer_usd);
        assert_eq!(config.cap.cleanup_interval_cycles, 12);
        assert_eq!(config.cap.cleanup_after_n_trades, Some(25));
    }

    #[test]
    fn legacy_percentage_values_are_converted() {
        // 1.5 means 1.5% in the legacy convention.
        assert!((normalize_fraction("X", 1.5) - 0.015).abs() < 1e-12);
        assert!((normalize_fraction("X", -1.5) + 0.015).abs() < 1e-12);
        // Already-fractional values pass through.
        assert!((normalize_fraction("X", 0.015) - 0.015).abs() < 1e-12);

        let config = EngineConfig::from_vars(&vars(&[("APEX_STOP_LOSS_THRESHOLD", "1.5")]))
            .unwrap();
        assert!((config.exit.stop_loss_threshold + 0.015).abs() < 1e-12);

        // Fractional input, either sign, lands negative.
        let config = EngineConfig::from_vars(&vars(&[("APEX_STOP_LOSS_THRESHOLD", "0.02")]))
            .unwrap();
        assert!((config.exit.stop_loss_threshold + 0.02).abs() < 1e-12);
    }
}
