// =============================================================================
// OKX adapter — REST v5 with base64 HMAC-SHA256 signing and passphrase
// =============================================================================
//
// Signing: `OK-ACCESS-SIGN = base64(HMAC-SHA256(timestamp + method + path +
// body))` where the timestamp is ISO-8601 with milliseconds. The API
// passphrase travels in its own header. All v5 responses share the
// `{ code, msg, data }` envelope; any non-zero code is an error even on
// HTTP 200.
//
// Symbols: canonical `BTC-USD` maps to instId `BTC-USDT` (the USDT spot
// book). Client order ids must be alphanumeric on OKX, so the idempotency
// key is sanitized before it goes on the wire; the unsanitized key still
// keys the local map.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
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
    split_symbol, with_backoff, BrokerAdapter, BrokerKind, Credentials, IdempotencyMap,
    CANDLE_CACHE_TTL, DUST_FILTER_USD, PRIVATE_MIN_INTERVAL, PRODUCT_CACHE_TTL,
    PUBLIC_MIN_INTERVAL,
};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://www.okx.com";

pub struct OkxAdapter {
    account_id: String,
    credentials: Credentials,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    candle_cache: TtlCache<(String, Timeframe, usize), Vec<Candle>>,
    product_cache: TtlCache<u8, Vec<String>>,
    orders: IdempotencyMap,
}

impl OkxAdapter {
    pub fn new(
        account_id: impl Into<String>,
        credentials: Credentials,
        limiter: Arc<RateLimiter>,
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
            candle_cache: TtlCache::new(CANDLE_CACHE_TTL),
            product_cache: TtlCache::new(PRODUCT_CACHE_TTL),
            orders,
        }
    }

    /// Canonical `BTC-USD` -> instId `BTC-USDT`.
    fn to_inst_id(symbol: &str) -> Result<String, BrokerError> {
        let (base, quote) = split_symbol(symbol)?;
        let quote = if quote.eq_ignore_ascii_case("USD") { "USDT" } else { quote };
        Ok(format!("{base}-{quote}").to_uppercase())
    }

    /// instId `BTC-USDT` -> canonical `BTC-USD`.
    fn from_inst_id(inst_id: &str) -> Option<String> {
        let (base, quote) = inst_id.split_once('-')?;
        if quote != "USDT" {
            return None;
        }
        Some(format!("{base}-USD"))
    }

    fn bar(tf: Timeframe) -> &'static str {
        match tf {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1H",
        }
    }

    /// OKX client order ids are alphanumeric, max 32 chars.
    fn sanitize_cl_ord_id(client_id: &str) -> String {
        client_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(32)
            .collect()
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    async fn public_get(&self, path_and_query: &str) -> Result<serde_json::Value, BrokerError> {
        let key = format!("{}:public", self.account_id);
        let _permit = self.limiter.acquire(&key, PUBLIC_MIN_INTERVAL).await;

        let resp = self
            .http
            .get(format!("{BASE_URL}{path_and_query}"))
            .send()
            .await
            .map_err(BrokerError::from_reqwest)?;
        Self::parse_response(resp).await
    }

    async fn private_call(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, BrokerError> {
        let key = format!("{}:private", self.account_id);
        let _permit = self.limiter.acquire(&key, PRIVATE_MIN_INTERVAL).await;

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let body_str = body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), path_and_query, &body_str);

        let passphrase = self
            .credentials
            .passphrase
            .clone()
            .ok_or_else(|| BrokerError::AuthInvalid("okx requires a passphrase".into()))?;

        let mut req = self
            .http
            .request(method, format!("{BASE_URL}{path_and_query}"))
            .header("OK-ACCESS-KEY", &self.credentials.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", passphrase);
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req.send().await.map_err(BrokerError::from_reqwest)?;
        Self::parse_response(resp).await
    }

    /// OKX responds 200 with `{ code, msg, data }`; non-zero codes are
    /// errors.
    async fn parse_response(resp: reqwest::Response) -> Result<serde_json::Value, BrokerError> {
        let status = resp.status().as_u16();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Parse(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(BrokerError::from_status(status, &body.to_string()));
        }

        let code = body["code"].as_str().unwrap_or("0");
        if code != "0" {
            let msg = body["msg"].as_str().unwrap_or_default().to_string();
            return Err(match code {
                "50011" => BrokerError::RateLimited { retry_after: None },
                "50111" | "50113" => BrokerError::AuthInvalid(msg),
                "51008" => BrokerError::InsufficientFunds,
                "51001" => BrokerError::UnknownSymbol(msg),
                "51020" => BrokerError::MinNotional {
                    required: 0.0,
                    got: 0.0,
                },
                _ => BrokerError::Exchange {
                    status: 200,
                    message: format!("okx code {code}: {msg}"),
                },
            });
        }
        Ok(body["data"].clone())
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
impl BrokerAdapter for OkxAdapter {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Okx
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    #[instrument(skip(self), name = "okx::connect", fields(account = %self.account_id))]
    async fn connect(&self) -> Result<AccountIdentity, BrokerError> {
        let _ = with_backoff("okx.connect", || {
            self.private_call(reqwest::Method::GET, "/api/v5/account/balance", None)
        })
        .await?;
        debug!("okx credentials verified");
        Ok(AccountIdentity {
            account_id: self.account_id.clone(),
            label: format!("okx:{}", self.account_id),
        })
    }

    async fn get_balance(&self, quote: &str) -> Result<Balance, BrokerError> {
        let ccy = if quote.eq_ignore_ascii_case("USD") { "USDT" } else { quote };
        let data = with_backoff("okx.balance", || {
            self.private_call(reqwest::Method::GET, "/api/v5/account/balance", None)
        })
        .await?;

        let details = data
            .as_array()
            .and_then(|d| d.first())
            .and_then(|d| d["details"].as_array())
            .cloned()
            .unwrap_or_default();

        for detail in &details {
            if detail["ccy"].as_str() == Some(ccy) {
                return Ok(Balance {
                    available: Self::str_f64(&detail["availBal"]),
                    total: Self::str_f64(&detail["eq"]),
                });
            }
        }
        Ok(Balance {
            available: 0.0,
            total: 0.0,
        })
    }

    async fn get_positions(&self) -> Result<Vec<RawPosition>, BrokerError> {
        let data = with_backoff("okx.balance", || {
            self.private_call(reqwest::Method::GET, "/api/v5/account/balance", None)
        })
        .await?;

        let details = data
            .as_array()
            .and_then(|d| d.first())
            .and_then(|d| d["details"].as_array())
            .cloned()
            .unwrap_or_default();

        let mut positions = Vec::new();
        for detail in &details {
            let ccy = detail["ccy"].as_str().unwrap_or_default();
            if ccy.is_empty() || ccy == "USDT" || ccy == "USDC" {
                continue;
            }
            let qty = Self::str_f64(&detail["availBal"]);
            if qty <= 0.0 {
                continue;
            }

            let symbol = format!("{ccy}-USD");
            match self.get_current_price(&symbol).await {
                Ok(price) if qty * price >= DUST_FILTER_USD => positions.push(RawPosition {
                    symbol,
                    qty,
                    entry_price: None,
                }),
                Ok(_) => debug!(symbol, qty, "dust holding filtered from positions"),
                Err(_) => debug!(symbol, "no USDT book for asset; skipped"),
            }
        }
        Ok(positions)
    }

    #[instrument(skip(self), name = "okx::get_candles", fields(account = %self.account_id))]
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

        let inst_id = Self::to_inst_id(symbol)?;
        let path = format!(
            "/api/v5/market/candles?instId={inst_id}&bar={}&limit={n}",
            Self::bar(tf)
        );
        let data = with_backoff("okx.candles", || self.public_get(&path)).await?;

        // Rows are [ts, o, h, l, c, vol, ...], newest first.
        let mut candles: Vec<Candle> = data
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let row = row.as_array()?;
                        if row.len() < 6 {
                            return None;
                        }
                        Some(Candle::new(
                            row[0].as_str()?.parse().ok()?,
                            Self::str_f64(&row[1]),
                            Self::str_f64(&row[2]),
                            Self::str_f64(&row[3]),
                            Self::str_f64(&row[4]),
                            Self::str_f64(&row[5]),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        candles.sort_by_key(|c| c.open_time);
        self.candle_cache.insert(cache_key, candles.clone());
        debug!(symbol, count = candles.len(), "okx candles fetched");
        Ok(candles)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let inst_id = Self::to_inst_id(symbol)?;
        let path = format!("/api/v5/market/ticker?instId={inst_id}");
        let data = with_backoff("okx.ticker", || self.public_get(&path)).await?;

        let price = data
            .as_array()
            .and_then(|d| d.first())
            .map(|t| Self::str_f64(&t["last"]))
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

        let data = with_backoff("okx.instruments", || {
            self.public_get("/api/v5/public/instruments?instType=SPOT")
        })
        .await?;

        let products: Vec<String> = data
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter(|i| i["state"].as_str() == Some("live"))
                    .filter_map(|i| i["instId"].as_str())
                    .filter_map(Self::from_inst_id)
                    .collect()
            })
            .unwrap_or_default();

        self.product_cache.insert(0, products.clone());
        Ok(products)
    }

    #[instrument(
        skip(self, request),
        name = "okx::place_market",
        fields(account = %self.account_id, symbol = %request.symbol)
    )]
    async fn place_market(&self, request: &MarketOrderRequest) -> Result<Order, BrokerError> {
        if let Some(existing) = self.orders.get(&request.client_id) {
            debug!(client_id = %request.client_id, "duplicate place_market; returning existing order");
            return Ok(existing);
        }

        let inst_id = Self::to_inst_id(&request.symbol)?;
        let price = self.get_current_price(&request.symbol).await?;
        let (qty, notional) = match (request.qty, request.notional_usd) {
            (Some(q), _) => (q, q * price),
            (None, Some(v)) => (v / price, v),
            (None, None) => {
                return Err(BrokerError::Parse("order has neither qty nor notional".into()))
            }
        };

        let body = serde_json::json!({
            "instId": inst_id,
            "tdMode": "cash",
            "clOrdId": Self::sanitize_cl_ord_id(&request.client_id),
            "side": match request.side {
                crate::types::Side::Long => "buy",
                crate::types::Side::Short => "sell",
            },
            "ordType": "market",
            "sz": format!("{qty:.10}"),
        });

        let data = with_backoff("okx.order", || {
            self.private_call(reqwest::Method::POST, "/api/v5/trade/order", Some(body.clone()))
        })
        .await?;

        let broker_order_id = data
            .as_array()
            .and_then(|d| d.first())
            .and_then(|o| o["ordId"].as_str())
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
        // order_ref format: "instId:ordId".
        let (symbol, ord_id) = order_ref
            .split_once(':')
            .ok_or_else(|| BrokerError::NotFound(format!("bad order ref {order_ref}")))?;
        let body = serde_json::json!({
            "instId": Self::to_inst_id(symbol)?,
            "ordId": ord_id,
        });
        with_backoff("okx.cancel", || {
            self.private_call(
                reqwest::Method::POST,
                "/api/v5/trade/cancel-order",
                Some(body.clone()),
            )
        })
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for OkxAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxAdapter")
            .field("account_id", &self.account_id)
            .field("credentials", &"<redacted>")
            .finish()
    }
}
