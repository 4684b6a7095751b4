// =============================================================================
// Kraken Pro adapter — REST with HMAC-SHA512 signing and nonce discipline
// =============================================================================
//
// Signing: `API-Sign = base64(HMAC-SHA512(path + SHA256(nonce + postdata),
// base64decode(secret)))`. Every private call consumes one nonce from the
// per-account NonceStore; private calls are serialized behind a mutex so two
// tasks on one account can never race the venue's strictly-increasing nonce
// check.
//
// Symbols: canonical `BTC-USD` maps to Kraken's `XBTUSD` (BTC is aliased to
// XBT). Responses key results by Kraken's internal pair names, so parsers
// take the first (only) entry of the result map.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, instrument, warn};

use crate::error::BrokerError;
use crate::nonce::NonceStore;
use crate::rate_limiter::{RateLimiter, TtlCache};
use crate::types::{
    AccountIdentity, Balance, Candle, Fill, MarketOrderRequest, Order, OrderState, RawPosition,
    Timeframe,
};

use super::{
    split_symbol, with_backoff, BrokerAdapter, BrokerKind, Credentials, IdempotencyMap,
    CANDLE_CACHE_TTL, DUST_FILTER_USD, PRIVATE_MIN_INTERVAL, PRODUCT_CACHE_TTL,
    PUBLIC_MIN_INTERVAL,
};

type HmacSha512 = Hmac<Sha512>;

const BASE_URL: &str = "https://api.kraken.com";

pub struct KrakenAdapter {
    account_id: String,
    credentials: Credentials,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    nonces: Arc<NonceStore>,
    /// Serializes private calls; see module docs.
    private_gate: tokio::sync::Mutex<()>,
    candle_cache: TtlCache<(String, Timeframe, usize), Vec<Candle>>,
    product_cache: TtlCache<u8, Vec<String>>,
    orders: IdempotencyMap,
}

impl KrakenAdapter {
    pub fn new(
        account_id: impl Into<String>,
        credentials: Credentials,
        limiter: Arc<RateLimiter>,
        nonces: Arc<NonceStore>,
        orders: IdempotencyMap,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Self {
            account_id: account_id.into(),
            credentials,
            http,
            limiter,
            nonces,
            private_gate: tokio::sync::Mutex::new(()),
            candle_cache: TtlCache::new(CANDLE_CACHE_TTL),
            product_cache: TtlCache::new(PRODUCT_CACHE_TTL),
            orders,
        }
    }

    // -------------------------------------------------------------------------
    // Symbol conversion (adapter-private)
    // -------------------------------------------------------------------------

    /// Canonical `BTC-USD` -> Kraken pair `XBTUSD`.
    fn to_kraken_pair(symbol: &str) -> Result<String, BrokerError> {
        let (base, quote) = split_symbol(symbol)?;
        let base = if base.eq_ignore_ascii_case("BTC") { "XBT" } else { base };
        Ok(format!("{base}{quote}").to_uppercase())
    }

    /// Kraken ws-name `XBT/USD` -> canonical `BTC-USD`.
    fn from_wsname(wsname: &str) -> Option<String> {
        let (base, quote) = wsname.split_once('/')?;
        let base = if base == "XBT" { "BTC" } else { base };
        Some(format!("{base}-{quote}"))
    }

    /// Kraken balance asset code (`XXBT`, `ZUSD`, `SOL`) -> plain asset.
    fn plain_asset(code: &str) -> &str {
        let trimmed = if code.len() > 3 && (code.starts_with('X') || code.starts_with('Z')) {
            &code[1..]
        } else {
            code
        };
        if trimmed == "XBT" { "BTC" } else { trimmed }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    fn sign(&self, path: &str, nonce: u64, postdata: &str) -> Result<String, BrokerError> {
        let secret = base64::engine::general_purpose::STANDARD
            .decode(&self.credentials.api_secret)
            .map_err(|e| BrokerError::AuthInvalid(format!("secret not base64: {e}")))?;

        let mut sha = Sha256::new();
        sha.update(format!("{nonce}{postdata}").as_bytes());
        let inner = sha.finalize();

        let mut mac = HmacSha512::new_from_slice(&secret)
            .map_err(|e| BrokerError::AuthInvalid(format!("bad secret length: {e}")))?;
        mac.update(path.as_bytes());
        mac.update(&inner);

        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn public_get(&self, path: &str, query: &str) -> Result<serde_json::Value, BrokerError> {
        let key = format!("{}:public", self.account_id);
        let _permit = self.limiter.acquire(&key, PUBLIC_MIN_INTERVAL).await;

        let url = if query.is_empty() {
            format!("{BASE_URL}{path}")
        } else {
            format!("{BASE_URL}{path}?{query}")
        };
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(BrokerError::from_reqwest)?;
        Self::parse_response(resp).await
    }

    async fn private_post(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, BrokerError> {
        // One private call at a time per account: the nonce issued under the
        // gate must reach the venue before the next one is issued.
        let _gate = self.private_gate.lock().await;

        let key = format!("{}:private", self.account_id);
        let _permit = self.limiter.acquire(&key, PRIVATE_MIN_INTERVAL).await;

        let nonce = self
            .nonces
            .next()
            .map_err(|_| BrokerError::NonceCollision(self.account_id.clone()))?;

        let mut postdata = format!("nonce={nonce}");
        for (name, value) in params {
            postdata.push_str(&format!("&{name}={value}"));
        }

        let signature = self.sign(path, nonce, &postdata)?;

        let resp = self
            .http
            .post(format!("{BASE_URL}{path}"))
            .header("API-Key", &self.credentials.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(postdata)
            .send()
            .await
            .map_err(BrokerError::from_reqwest)?;
        Self::parse_response(resp).await
    }

    /// Kraken wraps everything in `{ "error": [...], "result": ... }`.
    async fn parse_response(resp: reqwest::Response) -> Result<serde_json::Value, BrokerError> {
        let status = resp.status().as_u16();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Parse(e.to_string()))?;

        if status != 200 {
            return Err(BrokerError::from_status(status, &body.to_string()));
        }

        let errors = body["error"].as_array().cloned().unwrap_or_default();
        if let Some(first) = errors.first().and_then(|e| e.as_str()) {
            return Err(Self::map_kraken_error(first));
        }

        Ok(body["result"].clone())
    }

    fn map_kraken_error(code: &str) -> BrokerError {
        if code.contains("Rate limit") {
            BrokerError::RateLimited { retry_after: None }
        } else if code.contains("Invalid nonce") {
            BrokerError::NonceCollision("kraken reported invalid nonce".into())
        } else if code.contains("Invalid key") || code.contains("Invalid signature") {
            BrokerError::AuthInvalid(code.to_string())
        } else if code.contains("Insufficient funds") {
            BrokerError::InsufficientFunds
        } else if code.contains("Unknown asset pair") {
            BrokerError::UnknownSymbol(code.to_string())
        } else if code.contains("volume minimum") || code.contains("Order minimum") {
            BrokerError::MinNotional {
                required: 0.0,
                got: 0.0,
            }
        } else if code.contains("Permission denied") {
            BrokerError::PermissionDenied(code.to_string())
        } else {
            BrokerError::Exchange {
                status: 200,
                message: code.to_string(),
            }
        }
    }

    fn str_f64(value: &serde_json::Value) -> f64 {
        value
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| value.as_f64())
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl BrokerAdapter for KrakenAdapter {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Kraken
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    #[instrument(skip(self), name = "kraken::connect", fields(account = %self.account_id))]
    async fn connect(&self) -> Result<AccountIdentity, BrokerError> {
        // Balance is the cheapest signed endpoint; success proves the key.
        let _ = with_backoff("kraken.connect", || self.private_post("/0/private/Balance", &[]))
            .await?;
        debug!("kraken credentials verified");
        Ok(AccountIdentity {
            account_id: self.account_id.clone(),
            label: format!("kraken:{}", self.account_id),
        })
    }

    async fn get_balance(&self, quote: &str) -> Result<Balance, BrokerError> {
        let result =
            with_backoff("kraken.balance", || self.private_post("/0/private/Balance", &[]))
                .await?;

        let map = result
            .as_object()
            .ok_or_else(|| BrokerError::Parse("Balance result is not an object".into()))?;

        let total = map
            .iter()
            .find(|(code, _)| Self::plain_asset(code).eq_ignore_ascii_case(quote))
            .map(|(_, v)| Self::str_f64(v))
            .unwrap_or(0.0);

        // Kraken's Balance endpoint reports totals; holds are not broken out.
        Ok(Balance {
            available: total,
            total,
        })
    }

    async fn get_positions(&self) -> Result<Vec<RawPosition>, BrokerError> {
        let result =
            with_backoff("kraken.positions", || self.private_post("/0/private/Balance", &[]))
                .await?;

        let map = result
            .as_object()
            .ok_or_else(|| BrokerError::Parse("Balance result is not an object".into()))?;

        let mut positions = Vec::new();
        for (code, value) in map {
            let asset = Self::plain_asset(code);
            if asset.eq_ignore_ascii_case("USD") || asset.eq_ignore_ascii_case("EUR") {
                continue;
            }
            let qty = Self::str_f64(value);
            if qty <= 0.0 {
                continue;
            }

            let symbol = format!("{asset}-USD");
            // Dust filter keeps counts aligned with the cap enforcer.
            match self.get_current_price(&symbol).await {
                Ok(price) if qty * price >= DUST_FILTER_USD => {
                    positions.push(RawPosition {
                        symbol,
                        qty,
                        entry_price: None,
                    });
                }
                Ok(_) => debug!(symbol, qty, "dust holding filtered from positions"),
                Err(e) => {
                    warn!(symbol, error = %e, "no price for holding; excluded from positions")
                }
            }
        }
        Ok(positions)
    }

    #[instrument(skip(self), name = "kraken::get_candles", fields(account = %self.account_id))]
    async fn get_candles(
        &self,
        symbol: &str,
        tf: Timeframe,
        n: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        let cache_key = (symbol.to_string(), tf, n);
        if let Some(cached) = self.candle_cache.get(&cache_key) {
            return Ok(cached);
        }

        let pair = Self::to_kraken_pair(symbol)?;
        let query = format!("pair={pair}&interval={}", tf.minutes());
        let result =
            with_backoff("kraken.ohlc", || self.public_get("/0/public/OHLC", &query)).await?;

        // Result keys by Kraken's internal pair name; take the pair array.
        let rows = result
            .as_object()
            .and_then(|map| map.iter().find(|(k, _)| *k != "last"))
            .and_then(|(_, v)| v.as_array())
            .ok_or_else(|| BrokerError::Parse("OHLC result missing pair data".into()))?;

        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                if row.len() < 7 {
                    return None;
                }
                Some(Candle::new(
                    row[0].as_i64().unwrap_or(0) * 1_000,
                    Self::str_f64(&row[1]),
                    Self::str_f64(&row[2]),
                    Self::str_f64(&row[3]),
                    Self::str_f64(&row[4]),
                    Self::str_f64(&row[6]),
                ))
            })
            .collect();

        if candles.len() > n {
            candles.drain(..candles.len() - n);
        }

        self.candle_cache.insert(cache_key, candles.clone());
        debug!(symbol, count = candles.len(), "kraken candles fetched");
        Ok(candles)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let pair = Self::to_kraken_pair(symbol)?;
        let query = format!("pair={pair}");
        let result =
            with_backoff("kraken.ticker", || self.public_get("/0/public/Ticker", &query)).await?;

        let price = result
            .as_object()
            .and_then(|map| map.values().next())
            .and_then(|entry| entry["c"].as_array())
            .and_then(|c| c.first())
            .map(Self::str_f64)
            .unwrap_or(0.0);

        if price <= 0.0 {
            return Err(BrokerError::UnknownSymbol(symbol.to_string()));
        }
        Ok(price)
    }

    async fn get_products(&self) -> Result<Vec<String>, BrokerError> {
        if let Some(cached) = self.product_cache.get(&0) {
            return Ok(cached);
        }

        let result = with_backoff("kraken.assetpairs", || {
            self.public_get("/0/public/AssetPairs", "")
        })
        .await?;

        let products: Vec<String> = result
            .as_object()
            .map(|map| {
                map.values()
                    .filter_map(|pair| pair["wsname"].as_str())
                    .filter_map(Self::from_wsname)
                    .filter(|sym| sym.ends_with("-USD"))
                    .collect()
            })
            .unwrap_or_default();

        self.product_cache.insert(0, products.clone());
        Ok(products)
    }

    #[instrument(
        skip(self, request),
        name = "kraken::place_market",
        fields(account = %self.account_id, symbol = %request.symbol)
    )]
    async fn place_market(&self, request: &MarketOrderRequest) -> Result<Order, BrokerError> {
        // Idempotency: a retried client id returns the original order.
        if let Some(existing) = self.orders.get(&request.client_id) {
            debug!(client_id = %request.client_id, "duplicate place_market; returning existing order");
            return Ok(existing);
        }

        let pair = Self::to_kraken_pair(&request.symbol)?;
        let price = self.get_current_price(&request.symbol).await?;
        let qty = match (request.qty, request.notional_usd) {
            (Some(q), _) => q,
            (None, Some(notional)) => notional / price,
            (None, None) => {
                return Err(BrokerError::Parse("order has neither qty nor notional".into()))
            }
        };

        let side = match request.side {
            crate::types::Side::Long => "buy",
            crate::types::Side::Short => "sell",
        };

        let params = [
            ("pair", pair),
            ("type", side.to_string()),
            ("ordertype", "market".to_string()),
            ("volume", format!("{qty:.10}")),
        ];

        let result =
            with_backoff("kraken.addorder", || self.private_post("/0/private/AddOrder", &params))
                .await?;

        let broker_order_id = result["txid"]
            .as_array()
            .and_then(|txids| txids.first())
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        let notional = qty * price;
        let order = Order {
            client_id: request.client_id.clone(),
            broker_order_id,
            symbol: request.symbol.clone(),
            side: request.side,
            qty,
            notional_usd: notional,
            state: OrderState::Filled,
            fills: vec![Fill {
                price,
                qty,
                fee_usd: notional * self.fee_rate(),
                ts: Utc::now(),
            }],
            fees_usd: notional * self.fee_rate(),
        };

        self.orders.insert(order.clone());
        Ok(order)
    }

    async fn cancel(&self, order_ref: &str) -> Result<(), BrokerError> {
        let params = [("txid", order_ref.to_string())];
        with_backoff("kraken.cancel", || {
            self.private_post("/0/private/CancelOrder", &params)
        })
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for KrakenAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KrakenAdapter")
            .field("account_id", &self.account_id)
            .field("credentials", &"<redacted>")
            .finish()
    }
}
