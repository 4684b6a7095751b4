// =============================================================================
// Coinbase Advanced adapter — REST with CB-ACCESS HMAC-SHA256 signing
// =============================================================================
//
// Signing: `CB-ACCESS-SIGN = hex(HMAC-SHA256(timestamp + method + path +
// body))` with the epoch-seconds timestamp echoed in CB-ACCESS-TIMESTAMP.
//
// Coinbase product ids already match the engine's canonical `BASE-QUOTE`
// form, so symbol conversion is the identity. The venue accepts a native
// `client_order_id`, which carries the idempotency key end-to-end; the local
// map is kept as well so a same-process retry never even reaches the wire.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::error::BrokerError;
use crate::rate_limiter::{RateLimiter, TtlCache};
use crate::types::{
    AccountIdentity, Balance, Candle, Fill, MarketOrderRequest, Order, OrderState, RawPosition,
    Timeframe,
};

use super::{
    with_backoff, BrokerAdapter, BrokerKind, Credentials, IdempotencyMap, CANDLE_CACHE_TTL,
    DUST_FILTER_USD, PRIVATE_MIN_INTERVAL, PRODUCT_CACHE_TTL,
};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://api.coinbase.com";

pub struct CoinbaseAdapter {
    account_id: String,
    credentials: Credentials,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    /// When set, consumer USD wallet balances count toward trading equity
    /// alongside USDC.
    allow_consumer_usd: bool,
    candle_cache: TtlCache<(String, Timeframe, usize), Vec<Candle>>,
    product_cache: TtlCache<u8, Vec<String>>,
    orders: IdempotencyMap,
}

impl CoinbaseAdapter {
    pub fn new(
        account_id: impl Into<String>,
        credentials: Credentials,
        limiter: Arc<RateLimiter>,
        allow_consumer_usd: bool,
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
            allow_consumer_usd,
            candle_cache: TtlCache::new(CANDLE_CACHE_TTL),
            product_cache: TtlCache::new(PRODUCT_CACHE_TTL),
            orders,
        }
    }

    fn granularity(tf: Timeframe) -> &'static str {
        match tf {
            Timeframe::M1 => "ONE_MINUTE",
            Timeframe::M5 => "FIVE_MINUTE",
            Timeframe::M15 => "FIFTEEN_MINUTE",
            Timeframe::H1 => "ONE_HOUR",
        }
    }

    fn sign(&self, timestamp: i64, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, BrokerError> {
        let key = format!("{}:rest", self.account_id);
        let _permit = self.limiter.acquire(&key, PRIVATE_MIN_INTERVAL).await;

        let timestamp = Utc::now().timestamp();
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        // The signature covers the path without the query string.
        let signature = self.sign(timestamp, method.as_str(), path, &body_str);

        let url = match query {
            Some(q) => format!("{BASE_URL}{path}?{q}"),
            None => format!("{BASE_URL}{path}"),
        };

        let mut req = self
            .http
            .request(method, &url)
            .header("CB-ACCESS-KEY", &self.credentials.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp.to_string());
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req.send().await.map_err(BrokerError::from_reqwest)?;
        let status = resp.status().as_u16();
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Parse(e.to_string()))?;

        if !(200..300).contains(&status) {
            let message = value["message"]
                .as_str()
                .unwrap_or(&value.to_string())
                .to_string();
            return Err(match status {
                400 if message.contains("INSUFFICIENT_FUND") => BrokerError::InsufficientFunds,
                404 => BrokerError::UnknownSymbol(message),
                s => BrokerError::from_status(s, &message),
            });
        }
        Ok(value)
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
impl BrokerAdapter for CoinbaseAdapter {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Coinbase
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    #[instrument(skip(self), name = "coinbase::connect", fields(account = %self.account_id))]
    async fn connect(&self) -> Result<AccountIdentity, BrokerError> {
        let value = with_backoff("coinbase.connect", || {
            self.request(reqwest::Method::GET, "/api/v3/brokerage/accounts", None, None)
        })
        .await?;

        let uuid = value["accounts"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|a| a["uuid"].as_str())
            .unwrap_or("unknown")
            .to_string();

        debug!(venue_account = %uuid, "coinbase credentials verified");
        Ok(AccountIdentity {
            account_id: self.account_id.clone(),
            label: format!("coinbase:{uuid}"),
        })
    }

    async fn get_balance(&self, quote: &str) -> Result<Balance, BrokerError> {
        let value = with_backoff("coinbase.accounts", || {
            self.request(reqwest::Method::GET, "/api/v3/brokerage/accounts", None, None)
        })
        .await?;

        let accounts = value["accounts"]
            .as_array()
            .ok_or_else(|| BrokerError::Parse("accounts response missing array".into()))?;

        // "USD" equity means the USDC trading wallet, plus the consumer USD
        // wallet when enabled. Other quotes match exactly.
        let counts = |currency: &str| -> bool {
            if quote.eq_ignore_ascii_case("USD") {
                currency == "USDC" || (self.allow_consumer_usd && currency == "USD")
            } else {
                currency == quote
            }
        };

        let mut balance = Balance {
            available: 0.0,
            total: 0.0,
        };
        for account in accounts {
            let currency = account["currency"].as_str().unwrap_or_default();
            if counts(currency) {
                let available = Self::str_f64(&account["available_balance"]["value"]);
                let hold = Self::str_f64(&account["hold"]["value"]);
                balance.available += available;
                balance.total += available + hold;
            }
        }
        Ok(balance)
    }

    async fn get_positions(&self) -> Result<Vec<RawPosition>, BrokerError> {
        let value = with_backoff("coinbase.accounts", || {
            self.request(reqwest::Method::GET, "/api/v3/brokerage/accounts", None, None)
        })
        .await?;

        let accounts = value["accounts"]
            .as_array()
            .ok_or_else(|| BrokerError::Parse("accounts response missing array".into()))?;

        let mut positions = Vec::new();
        for account in accounts {
            let currency = account["currency"].as_str().unwrap_or_default();
            if currency.is_empty() || currency == "USD" || currency == "USDC" {
                continue;
            }
            let qty = Self::str_f64(&account["available_balance"]["value"]);
            if qty <= 0.0 {
                continue;
            }

            let symbol = format!("{currency}-USD");
            match self.get_current_price(&symbol).await {
                Ok(price) if qty * price >= DUST_FILTER_USD => positions.push(RawPosition {
                    symbol,
                    qty,
                    entry_price: None,
                }),
                Ok(_) => debug!(symbol, qty, "dust holding filtered from positions"),
                Err(_) => debug!(symbol, "holding has no USD product; skipped"),
            }
        }
        Ok(positions)
    }

    #[instrument(skip(self), name = "coinbase::get_candles", fields(account = %self.account_id))]
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

        let end = Utc::now().timestamp();
        let start = end - (n as i64) * (tf.minutes() as i64) * 60;
        let path = format!("/api/v3/brokerage/products/{symbol}/candles");
        let query = format!(
            "start={start}&end={end}&granularity={}",
            Self::granularity(tf)
        );

        let value = with_backoff("coinbase.candles", || {
            self.request(reqwest::Method::GET, &path, Some(&query), None)
        })
        .await?;

        let mut candles: Vec<Candle> = value["candles"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        Some(Candle::new(
                            Self::str_f64(&row["start"]) as i64 * 1_000,
                            Self::str_f64(&row["open"]),
                            Self::str_f64(&row["high"]),
                            Self::str_f64(&row["low"]),
                            Self::str_f64(&row["close"]),
                            Self::str_f64(&row["volume"]),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        // Coinbase returns newest first; the engine wants oldest first.
        candles.sort_by_key(|c| c.open_time);
        if candles.len() > n {
            candles.drain(..candles.len() - n);
        }

        self.candle_cache.insert(cache_key, candles.clone());
        debug!(symbol, count = candles.len(), "coinbase candles fetched");
        Ok(candles)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let path = format!("/api/v3/brokerage/products/{symbol}");
        let value = with_backoff("coinbase.product", || {
            self.request(reqwest::Method::GET, &path, None, None)
        })
        .await?;

        let price = Self::str_f64(&value["price"]);
        if price <= 0.0 {
            return Err(BrokerError::UnknownSymbol(symbol.to_string()));
        }
        Ok(price)
    }

    async fn get_products(&self) -> Result<Vec<String>, BrokerError> {
        if let Some(cached) = self.product_cache.get(&0) {
            return Ok(cached);
        }

        let value = with_backoff("coinbase.products", || {
            self.request(reqwest::Method::GET, "/api/v3/brokerage/products", None, None)
        })
        .await?;

        let products: Vec<String> = value["products"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter(|p| p["quote_currency_id"].as_str() == Some("USD"))
                    .filter(|p| p["status"].as_str() == Some("online"))
                    .filter_map(|p| p["product_id"].as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        self.product_cache.insert(0, products.clone());
        Ok(products)
    }

    #[instrument(
        skip(self, request),
        name = "coinbase::place_market",
        fields(account = %self.account_id, symbol = %request.symbol)
    )]
    async fn place_market(&self, request: &MarketOrderRequest) -> Result<Order, BrokerError> {
        if let Some(existing) = self.orders.get(&request.client_id) {
            debug!(client_id = %request.client_id, "duplicate place_market; returning existing order");
            return Ok(existing);
        }

        let price = self.get_current_price(&request.symbol).await?;
        let (qty, notional) = match (request.qty, request.notional_usd) {
            (Some(q), _) => (q, q * price),
            (None, Some(v)) => (v / price, v),
            (None, None) => {
                return Err(BrokerError::Parse("order has neither qty nor notional".into()))
            }
        };

        // Market buys size by quote, sells by base.
        let configuration = match request.side {
            crate::types::Side::Long => serde_json::json!({
                "market_market_ioc": { "quote_size": format!("{notional:.2}") }
            }),
            crate::types::Side::Short => serde_json::json!({
                "market_market_ioc": { "base_size": format!("{qty:.10}") }
            }),
        };

        let body = serde_json::json!({
            "client_order_id": request.client_id,
            "product_id": request.symbol,
            "side": match request.side {
                crate::types::Side::Long => "BUY",
                crate::types::Side::Short => "SELL",
            },
            "order_configuration": configuration,
        });

        let value = with_backoff("coinbase.order", || {
            self.request(
                reqwest::Method::POST,
                "/api/v3/brokerage/orders",
                None,
                Some(body.clone()),
            )
        })
        .await?;

        if value["success"].as_bool() == Some(false) {
            let reason = value["error_response"]["error"]
                .as_str()
                .unwrap_or("order rejected")
                .to_string();
            return Err(match reason.as_str() {
                r if r.contains("INSUFFICIENT_FUND") => BrokerError::InsufficientFunds,
                r if r.contains("MINIMUM") => BrokerError::MinNotional {
                    required: self.min_notional(),
                    got: notional,
                },
                _ => BrokerError::Exchange {
                    status: 200,
                    message: reason,
                },
            });
        }

        let broker_order_id = value["success_response"]["order_id"]
            .as_str()
            .or_else(|| value["order_id"].as_str())
            .unwrap_or_default()
            .to_string();

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
        let body = serde_json::json!({ "order_ids": [order_ref] });
        with_backoff("coinbase.cancel", || {
            self.request(
                reqwest::Method::POST,
                "/api/v3/brokerage/orders/batch_cancel",
                None,
                Some(body.clone()),
            )
        })
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for CoinbaseAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinbaseAdapter")
            .field("account_id", &self.account_id)
            .field("credentials", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> CoinbaseAdapter {
        CoinbaseAdapter::new(
            "coinbase_master",
            Credentials {
                api_key: "key".into(),
                api_secret: "secret".into(),
                passphrase: None,
                paper: false,
            },
            Arc::new(RateLimiter::new(4)),
            false,
            IdempotencyMap::in_memory(),
        )
    }

    #[test]
    fn granularity_strings() {
        assert_eq!(CoinbaseAdapter::granularity(Timeframe::M1), "ONE_MINUTE");
        assert_eq!(CoinbaseAdapter::granularity(Timeframe::M5), "FIVE_MINUTE");
        assert_eq!(
            CoinbaseAdapter::granularity(Timeframe::M15),
            "FIFTEEN_MINUTE"
        );
        assert_eq!(CoinbaseAdapter::granularity(Timeframe::H1), "ONE_HOUR");
    }

    #[test]
    fn signature_covers_timestamp_method_path_body() {
        let adapter = adapter();
        let a = adapter.sign(1_700_000_000, "GET", "/api/v3/brokerage/accounts", "");
        let b = adapter.sign(1_700_000_000, "GET", "/api/v3/brokerage/accounts", "");
        assert_eq!(a, b);
        // Hex-encoded SHA-256 output.
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let c = adapter.sign(1_700_000_001, "GET", "/api/v3/brokerage/accounts", "");
        assert_ne!(a, c);
        let d = adapter.sign(1_700_000_000, "POST", "/api/v3/brokerage/accounts", "");
        assert_ne!(a, d);
    }

    #[test]
    fn str_f64_accepts_both_shapes() {
        assert_eq!(CoinbaseAdapter::str_f64(&serde_json::json!("1.5")), 1.5);
        assert_eq!(CoinbaseAdapter::str_f64(&serde_json::json!(1.5)), 1.5);
        assert_eq!(CoinbaseAdapter::str_f64(&serde_json::json!(null)), 0.0);
    }
}
