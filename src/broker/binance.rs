// =============================================================================
// Binance adapter — REST with HMAC-SHA256 signed query strings
// =============================================================================
//
// Signed requests append `timestamp`, a 5000 ms `recvWindow` (tolerating
// minor clock drift against Binance's servers), and
// `signature = hex(HMAC-SHA256(query))`. The API key travels in the
// X-MBX-APIKEY header, never in the query.
//
// Symbols: canonical `BTC-USD` maps to `BTCUSDT` (USD spot liquidity on
// Binance is the USDT book). The venue accepts `newClientOrderId`, carrying
// the idempotency key end-to-end.
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
    split_symbol, with_backoff, BrokerAdapter, BrokerKind, Credentials, IdempotencyMap,
    CANDLE_CACHE_TTL, DUST_FILTER_USD, PRIVATE_MIN_INTERVAL, PRODUCT_CACHE_TTL,
    PUBLIC_MIN_INTERVAL,
};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://api.binance.com";
/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5_000;

pub struct BinanceAdapter {
    account_id: String,
    credentials: Credentials,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    candle_cache: TtlCache<(String, Timeframe, usize), Vec<Candle>>,
    product_cache: TtlCache<u8, Vec<String>>,
    orders: IdempotencyMap,
}

impl BinanceAdapter {
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

    /// Canonical `BTC-USD` -> `BTCUSDT`.
    fn to_binance_symbol(symbol: &str) -> Result<String, BrokerError> {
        let (base, quote) = split_symbol(symbol)?;
        let quote = if quote.eq_ignore_ascii_case("USD") { "USDT" } else { quote };
        Ok(format!("{base}{quote}").to_uppercase())
    }

    /// `BTCUSDT` -> canonical `BTC-USD`.
    fn from_binance_symbol(symbol: &str) -> Option<String> {
        let base = symbol.strip_suffix("USDT")?;
        if base.is_empty() {
            return None;
        }
        Some(format!("{base}-USD"))
    }

    fn interval(tf: Timeframe) -> &'static str {
        match tf {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let signature = self.sign(&base);
        format!("{base}&signature={signature}")
    }

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

    async fn signed_call(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value, BrokerError> {
        let key = format!("{}:signed", self.account_id);
        let _permit = self.limiter.acquire(&key, PRIVATE_MIN_INTERVAL).await;

        let url = format!("{BASE_URL}{path}?{}", self.signed_query(params));
        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.credentials.api_key)
            .send()
            .await
            .map_err(BrokerError::from_reqwest)?;
        Self::parse_response(resp).await
    }

    async fn parse_response(resp: reqwest::Response) -> Result<serde_json::Value, BrokerError> {
        let status = resp.status().as_u16();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Parse(e.to_string()))?;

        if !(200..300).contains(&status) {
            // Binance error payloads carry a numeric `code` + `msg`.
            let code = body["code"].as_i64().unwrap_or(0);
            let msg = body["msg"].as_str().unwrap_or_default().to_string();
            return Err(match code {
                -1013 => BrokerError::MinNotional {
                    required: 0.0,
                    got: 0.0,
                },
                -2010 => BrokerError::InsufficientFunds,
                -1121 => BrokerError::UnknownSymbol(msg),
                -2014 | -2015 => BrokerError::AuthInvalid(msg),
                _ => BrokerError::from_status(status, &msg),
            });
        }
        Ok(body)
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
impl BrokerAdapter for BinanceAdapter {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Binance
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    #[instrument(skip(self), name = "binance::connect", fields(account = %self.account_id))]
    async fn connect(&self) -> Result<AccountIdentity, BrokerError> {
        let account = with_backoff("binance.connect", || {
            self.signed_call(reqwest::Method::GET, "/api/v3/account", "")
        })
        .await?;

        let account_type = account["accountType"].as_str().unwrap_or("SPOT").to_string();
        debug!(account_type, "binance credentials verified");
        Ok(AccountIdentity {
            account_id: self.account_id.clone(),
            label: format!("binance:{account_type}"),
        })
    }

    async fn get_balance(&self, quote: &str) -> Result<Balance, BrokerError> {
        let asset = if quote.eq_ignore_ascii_case("USD") { "USDT" } else { quote };
        let account = with_backoff("binance.account", || {
            self.signed_call(reqwest::Method::GET, "/api/v3/account", "")
        })
        .await?;

        let balances = account["balances"]
            .as_array()
            .ok_or_else(|| BrokerError::Parse("account response missing balances".into()))?;

        for balance in balances {
            if balance["asset"].as_str() == Some(asset) {
                let free = Self::str_f64(&balance["free"]);
                let locked = Self::str_f64(&balance["locked"]);
                return Ok(Balance {
                    available: free,
                    total: free + locked,
                });
            }
        }
        Ok(Balance {
            available: 0.0,
            total: 0.0,
        })
    }

    async fn get_positions(&self) -> Result<Vec<RawPosition>, BrokerError> {
        let account = with_backoff("binance.account", || {
            self.signed_call(reqwest::Method::GET, "/api/v3/account", "")
        })
        .await?;

        let balances = account["balances"]
            .as_array()
            .ok_or_else(|| BrokerError::Parse("account response missing balances".into()))?;

        let mut positions = Vec::new();
        for balance in balances {
            let asset = balance["asset"].as_str().unwrap_or_default();
            if asset.is_empty() || asset == "USDT" || asset == "USDC" || asset == "BUSD" {
                continue;
            }
            let qty = Self::str_f64(&balance["free"]) + Self::str_f64(&balance["locked"]);
            if qty <= 0.0 {
                continue;
            }

            let symbol = format!("{asset}-USD");
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

    #[instrument(skip(self), name = "binance::get_candles", fields(account = %self.account_id))]
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

        let venue_symbol = Self::to_binance_symbol(symbol)?;
        let query = format!(
            "symbol={venue_symbol}&interval={}&limit={n}",
            Self::interval(tf)
        );
        let body =
            with_backoff("binance.klines", || self.public_get("/api/v3/klines", &query)).await?;

        let rows = body
            .as_array()
            .ok_or_else(|| BrokerError::Parse("klines response is not an array".into()))?;

        let candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                if row.len() < 6 {
                    return None;
                }
                Some(Candle::new(
                    row[0].as_i64().unwrap_or(0),
                    Self::str_f64(&row[1]),
                    Self::str_f64(&row[2]),
                    Self::str_f64(&row[3]),
                    Self::str_f64(&row[4]),
                    Self::str_f64(&row[5]),
                ))
            })
            .collect();

        self.candle_cache.insert(cache_key, candles.clone());
        debug!(symbol, count = candles.len(), "binance klines fetched");
        Ok(candles)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let venue_symbol = Self::to_binance_symbol(symbol)?;
        let query = format!("symbol={venue_symbol}");
        let body = with_backoff("binance.ticker", || {
            self.public_get("/api/v3/ticker/price", &query)
        })
        .await?;

        let price = Self::str_f64(&body["price"]);
        if price <= 0.0 {
            return Err(BrokerError::UnknownSymbol(symbol.to_string()));
        }
        Ok(price)
    }

    async fn get_products(&self) -> Result<Vec<String>, BrokerError> {
        if let Some(cached) = self.product_cache.get(&0) {
            return Ok(cached);
        }

        let body = with_backoff("binance.exchangeinfo", || {
            self.public_get("/api/v3/exchangeInfo", "")
        })
        .await?;

        let products: Vec<String> = body["symbols"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter(|s| s["status"].as_str() == Some("TRADING"))
                    .filter(|s| s["quoteAsset"].as_str() == Some("USDT"))
                    .filter_map(|s| s["symbol"].as_str())
                    .filter_map(Self::from_binance_symbol)
                    .collect()
            })
            .unwrap_or_default();

        self.product_cache.insert(0, products.clone());
        Ok(products)
    }

    #[instrument(
        skip(self, request),
        name = "binance::place_market",
        fields(account = %self.account_id, symbol = %request.symbol)
    )]
    async fn place_market(&self, request: &MarketOrderRequest) -> Result<Order, BrokerError> {
        if let Some(existing) = self.orders.get(&request.client_id) {
            debug!(client_id = %request.client_id, "duplicate place_market; returning existing order");
            return Ok(existing);
        }

        let venue_symbol = Self::to_binance_symbol(&request.symbol)?;
        let side = match request.side {
            crate::types::Side::Long => "BUY",
            crate::types::Side::Short => "SELL",
        };

        let mut params = format!(
            "symbol={venue_symbol}&side={side}&type=MARKET&newClientOrderId={}",
            request.client_id
        );
        let price = self.get_current_price(&request.symbol).await?;
        let (qty, notional) = match (request.qty, request.notional_usd) {
            (Some(q), _) => {
                params.push_str(&format!("&quantity={q}"));
                (q, q * price)
            }
            (None, Some(v)) => {
                params.push_str(&format!("&quoteOrderQty={v:.2}"));
                (v / price, v)
            }
            (None, None) => {
                return Err(BrokerError::Parse("order has neither qty nor notional".into()))
            }
        };

        let body = with_backoff("binance.order", || {
            self.signed_call(reqwest::Method::POST, "/api/v3/order", &params)
        })
        .await?;

        let broker_order_id = body["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .unwrap_or_default();
        let executed_qty = Self::str_f64(&body["executedQty"]);
        let fill_qty = if executed_qty > 0.0 { executed_qty } else { qty };

        let order = Order {
            client_id: request.client_id.clone(),
            broker_order_id,
            symbol: request.symbol.clone(),
            side: request.side,
            qty: fill_qty,
            notional_usd: notional,
            state: OrderState::Filled,
            fills: vec![Fill {
                price,
                qty: fill_qty,
                fee_usd: notional * self.fee_rate(),
                ts: Utc::now(),
            }],
            fees_usd: notional * self.fee_rate(),
        };

        self.orders.insert(order.clone());
        Ok(order)
    }

    async fn cancel(&self, order_ref: &str) -> Result<(), BrokerError> {
        // order_ref format: "SYMBOL:orderId" for Binance cancels.
        let (symbol, order_id) = order_ref
            .split_once(':')
            .ok_or_else(|| BrokerError::NotFound(format!("bad order ref {order_ref}")))?;
        let venue_symbol = Self::to_binance_symbol(symbol)?;
        let params = format!("symbol={venue_symbol}&orderId={order_id}");
        with_backoff("binance.cancel", || {
            self.signed_call(reqwest::Method::DELETE, "/api/v3/order", &params)
        })
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("account_id", &self.account_id)
            .field("credentials", &"<redacted>")
            .finish()
    }
}
