// =============================================================================
// Broker Adapters — one uniform contract per exchange
// =============================================================================
//
// The engine speaks one canonical dialect: `BASE-QUOTE` symbols, fractional
// fees, USD notionals, typed errors. Everything venue-specific — symbol
// format, signing, nonce discipline, minimum order rules, response shapes —
// lives inside the adapter for that venue and never leaks into the engine.
//
// Idempotency: `place_market` keyed by `client_id` MUST return the existing
// order when retried. Venues without a client-id field get a local
// (client_id -> order) map inside the adapter.
//
// Retry policy: 429/5xx/transport failures retry with exponential backoff and
// jitter (base 1.5-5s, 3 attempts); 403 temp-blocks back off harder (20s cap).
// =============================================================================

pub mod alpaca;
pub mod binance;
pub mod coinbase;
pub mod kraken;
pub mod okx;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::types::{
    AccountIdentity, Balance, Candle, MarketOrderRequest, Order, RawPosition, Timeframe,
};

/// Supported venues, in supervisor connection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerKind {
    Coinbase,
    Kraken,
    Okx,
    Binance,
    Alpaca,
}

impl BrokerKind {
    /// All venues in connection priority order.
    pub const ALL: [BrokerKind; 5] = [
        Self::Coinbase,
        Self::Kraken,
        Self::Okx,
        Self::Binance,
        Self::Alpaca,
    ];

    /// Taker fee rate, fractional.
    pub fn fee_rate(&self) -> f64 {
        match self {
            Self::Coinbase => 0.006,
            Self::Kraken => 0.0036,
            Self::Okx => 0.001,
            Self::Binance => 0.001,
            Self::Alpaca => 0.0,
        }
    }

    /// Minimum order notional in USD.
    pub fn min_notional(&self) -> f64 {
        match self {
            Self::Coinbase => 1.0,
            Self::Kraken => 0.5,
            Self::Okx => 1.0,
            Self::Binance => 5.0,
            Self::Alpaca => 1.0,
        }
    }

    /// Capabilities of the venue.
    pub fn supports_short(&self) -> bool {
        matches!(self, Self::Okx | Self::Binance)
    }

    /// Environment-variable prefix for credentials.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Self::Coinbase => "COINBASE",
            Self::Kraken => "KRAKEN",
            Self::Okx => "OKX",
            Self::Binance => "BINANCE",
            Self::Alpaca => "ALPACA",
        }
    }
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coinbase => write!(f, "coinbase"),
            Self::Kraken => write!(f, "kraken"),
            Self::Okx => write!(f, "okx"),
            Self::Binance => write!(f, "binance"),
            Self::Alpaca => write!(f, "alpaca"),
        }
    }
}

/// Immutable credentials handle. Injected at connect time, never logged.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
    pub paper: bool,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("paper", &self.paper)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// The adapter contract
// ---------------------------------------------------------------------------

/// Uniform async contract over an exchange login.
///
/// All percentage-like outputs are fractional; all symbols canonical
/// `BASE-QUOTE`. Implementations route every outgoing call through the shared
/// [`crate::rate_limiter::RateLimiter`] keyed `(account_id, endpoint)`.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn kind(&self) -> BrokerKind;

    fn account_id(&self) -> &str;

    /// Verify credentials and return the venue-side identity.
    async fn connect(&self) -> Result<AccountIdentity, BrokerError>;

    /// Balance in the given quote currency (e.g. "USD").
    async fn get_balance(&self, quote: &str) -> Result<Balance, BrokerError>;

    /// Open positions / non-quote holdings, dust-filtered so counts agree
    /// with the cap enforcer. Entry price is not guaranteed.
    async fn get_positions(&self) -> Result<Vec<RawPosition>, BrokerError>;

    /// Up to `n` most recent candles, oldest first. May return fewer.
    async fn get_candles(
        &self,
        symbol: &str,
        tf: Timeframe,
        n: usize,
    ) -> Result<Vec<Candle>, BrokerError>;

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError>;

    /// Tradable canonical symbols.
    async fn get_products(&self) -> Result<Vec<String>, BrokerError>;

    /// Place a market order. Idempotent on `request.client_id`.
    async fn place_market(&self, request: &MarketOrderRequest) -> Result<Order, BrokerError>;

    async fn cancel(&self, order_ref: &str) -> Result<(), BrokerError>;

    fn fee_rate(&self) -> f64 {
        self.kind().fee_rate()
    }

    fn min_notional(&self) -> f64 {
        self.kind().min_notional()
    }
}

// ---------------------------------------------------------------------------
// Shared retry helper
// ---------------------------------------------------------------------------

/// Maximum retry attempts for transient failures.
const MAX_RETRIES: u32 = 3;
/// Backoff cap for ordinary transient failures.
const BACKOFF_CAP: Duration = Duration::from_secs(5);
/// Backoff cap for 403 temp-blocks, which venues hold longer.
const BLOCKED_BACKOFF_CAP: Duration = Duration::from_secs(20);

/// Run `op` with exponential backoff + jitter on transient failures.
/// Non-transient errors return immediately.
pub async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BrokerError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                let cap = if matches!(err, BrokerError::TempAuthBlocked) {
                    BLOCKED_BACKOFF_CAP
                } else {
                    BACKOFF_CAP
                };
                let base_ms = 1_500u64.saturating_mul(1u64 << attempt);
                let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 3);
                let delay = Duration::from_millis(base_ms + jitter_ms).min(cap);

                warn!(
                    label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient broker failure; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                debug!(label, error = %err, class = %err.class(), "broker call failed");
                return Err(err);
            }
        }
    }
}

/// Split a canonical `BASE-QUOTE` symbol.
pub fn split_symbol(symbol: &str) -> Result<(&str, &str), BrokerError> {
    symbol
        .split_once('-')
        .ok_or_else(|| BrokerError::UnknownSymbol(symbol.to_string()))
}

/// Candle responses are cached for one scan cycle.
pub const CANDLE_CACHE_TTL: Duration = Duration::from_secs(150);
/// Product lists barely change; cached for an hour.
pub const PRODUCT_CACHE_TTL: Duration = Duration::from_secs(3_600);
/// Dust filter applied inside `get_positions` so counts agree with the
/// cap enforcer.
pub const DUST_FILTER_USD: f64 = 0.001;

/// Minimum interval between public (unauthenticated) calls per account.
pub const PUBLIC_MIN_INTERVAL: Duration = Duration::from_millis(1_000);
/// Minimum interval between private (signed) calls per account.
pub const PRIVATE_MIN_INTERVAL: Duration = Duration::from_millis(1_500);

// ---------------------------------------------------------------------------
// Idempotency map
// ---------------------------------------------------------------------------

/// Client-id -> order map backing `place_market` idempotency for venues
/// without a native client-id field. Optionally persisted to
/// `{datadir}/orders_{account}.json` (atomic tmp + rename) so retries across
/// a restart still return the original order.
pub struct IdempotencyMap {
    path: Option<std::path::PathBuf>,
    orders: parking_lot::Mutex<std::collections::HashMap<String, Order>>,
}

impl IdempotencyMap {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            orders: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn persisted(datadir: &std::path::Path, account_id: &str) -> Self {
        let path = datadir.join(format!("orders_{account_id}.json"));
        let orders = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            path: Some(path),
            orders: parking_lot::Mutex::new(orders),
        }
    }

    /// Existing order for this client id, if any.
    pub fn get(&self, client_id: &str) -> Option<Order> {
        self.orders.lock().get(client_id).cloned()
    }

    /// Record a placed order under its client id.
    pub fn insert(&self, order: Order) {
        let mut orders = self.orders.lock();
        orders.insert(order.client_id.clone(), order);
        if let Some(path) = &self.path {
            if let Ok(content) = serde_json::to_string(&*orders) {
                let tmp = path.with_extension("json.tmp");
                if std::fs::write(&tmp, &content).is_ok() {
                    let _ = std::fs::rename(&tmp, path);
                }
            }
        }
    }
}

impl std::fmt::Debug for IdempotencyMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyMap")
            .field("orders", &self.orders.lock().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn split_symbol_canonical() {
        assert_eq!(split_symbol("BTC-USD").unwrap(), ("BTC", "USD"));
        assert!(split_symbol("BTCUSD").is_err());
    }

    #[test]
    fn fee_and_notional_tables_sane() {
        for kind in BrokerKind::ALL {
            assert!(kind.fee_rate() < 0.01, "{kind} fee out of range");
            assert!(kind.min_notional() > 0.0);
        }
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let creds = Credentials {
            api_key: "key-material".into(),
            api_secret: "secret-material".into(),
            passphrase: Some("phrase".into()),
            paper: false,
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("key-material"));
        assert!(!rendered.contains("secret-material"));
        assert!(!rendered.contains("phrase"));
    }

    #[tokio::test]
    async fn backoff_retries_transient_then_succeeds() {
        tokio::time::pause();
        let calls = AtomicU32::new(0);

        let fut = with_backoff("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BrokerError::Network("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        });
        // Paused clock: sleeps auto-advance.
        let result = fut.await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_does_not_retry_business_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::InsufficientFunds) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idempotency_map_survives_reload() {
        use crate::types::{OrderState, Side};

        let dir = tempfile::tempdir().unwrap();
        let order = Order {
            client_id: "apex-1".into(),
            broker_order_id: "venue-9".into(),
            symbol: "BTC-USD".into(),
            side: Side::Long,
            qty: 0.001,
            notional_usd: 50.0,
            state: OrderState::Filled,
            fills: Vec::new(),
            fees_usd: 0.18,
        };

        {
            let map = IdempotencyMap::persisted(dir.path(), "kraken_master");
            assert!(map.get("apex-1").is_none());
            map.insert(order.clone());
            assert_eq!(map.get("apex-1").unwrap().broker_order_id, "venue-9");
        }

        // Restart: the same client id resolves to the original order.
        let map = IdempotencyMap::persisted(dir.path(), "kraken_master");
        assert_eq!(map.get("apex-1").unwrap().broker_order_id, "venue-9");
    }

    #[tokio::test]
    async fn backoff_gives_up_after_max_retries() {
        tokio::time::pause();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::Network("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4); // initial + 3 retries
    }
}
