// =============================================================================
// Alpaca adapter — equities REST with header auth and paper-trading support
// =============================================================================
//
// Alpaca authenticates with plain key headers (APCA-API-KEY-ID /
// APCA-API-SECRET-KEY); there is no request signing. The `paper` credential
// flag swaps the trading host for the paper endpoint, which is how dry-run
// accounts exercise the full order path without real fills.
//
// Unlike the crypto venues, Alpaca reports positions WITH their average
// entry price, so adopted positions on this venue keep their true basis.
// Canonical `AAPL-USD` maps to the bare ticker `AAPL`; market data comes
// from the separate data host.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
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
};

const LIVE_URL: &str = "https://api.alpaca.markets";
const PAPER_URL: &str = "https://paper-api.alpaca.markets";
const DATA_URL: &str = "https://data.alpaca.markets";

pub struct AlpacaAdapter {
    account_id: String,
    credentials: Credentials,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    trading_url: &'static str,
    candle_cache: TtlCache<(String, Timeframe, usize), Vec<Candle>>,
    product_cache: TtlCache<u8, Vec<String>>,
    orders: IdempotencyMap,
}

impl AlpacaAdapter {
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

        let trading_url = if credentials.paper { PAPER_URL } else { LIVE_URL };

        Self {
            account_id: account_id.into(),
            credentials,
            http,
            limiter,
            trading_url,
            candle_cache: TtlCache::new(CANDLE_CACHE_TTL),
            product_cache: TtlCache::new(PRODUCT_CACHE_TTL),
            orders,
        }
    }

    /// Canonical `AAPL-USD` -> Alpaca ticker `AAPL`.
    fn to_ticker(symbol: &str) -> Result<String, BrokerError> {
        let (base, _quote) = split_symbol(symbol)?;
        Ok(base.to_uppercase())
    }

    fn timeframe(tf: Timeframe) -> &'static str {
        match tf {
            Timeframe::M1 => "1Min",
            Timeframe::M5 => "5Min",
            Timeframe::M15 => "15Min",
            Timeframe::H1 => "1Hour",
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: String,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, BrokerError> {
        let key = format!("{}:rest", self.account_id);
        let _permit = self.limiter.acquire(&key, PRIVATE_MIN_INTERVAL).await;

        let mut req = self
            .http
            .request(method, &url)
            .header("APCA-API-KEY-ID", &self.credentials.api_key)
            .header("APCA-API-SECRET-KEY", &self.credentials.api_secret);
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req.send().await.map_err(BrokerError::from_reqwest)?;
        let status = resp.status().as_u16();

        if status == 204 {
            return Ok(serde_json::Value::Null);
        }

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
                403 if message.contains("insufficient") => BrokerError::InsufficientFunds,
                422 => BrokerError::UnknownSymbol(message),
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
impl BrokerAdapter for AlpacaAdapter {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Alpaca
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    #[instrument(skip(self), name = "alpaca::connect", fields(account = %self.account_id))]
    async fn connect(&self) -> Result<AccountIdentity, BrokerError> {
        let account = with_backoff("alpaca.connect", || {
            self.request(
                reqwest::Method::GET,
                format!("{}/v2/account", self.trading_url),
                None,
            )
        })
        .await?;

        let number = account["account_number"].as_str().unwrap_or("unknown").to_string();
        debug!(account_number = %number, paper = self.credentials.paper, "alpaca credentials verified");
        Ok(AccountIdentity {
            account_id: self.account_id.clone(),
            label: format!("alpaca:{number}"),
        })
    }

    async fn get_balance(&self, _quote: &str) -> Result<Balance, BrokerError> {
        let account = with_backoff("alpaca.account", || {
            self.request(
                reqwest::Method::GET,
                format!("{}/v2/account", self.trading_url),
                None,
            )
        })
        .await?;

        Ok(Balance {
            available: Self::str_f64(&account["cash"]),
            total: Self::str_f64(&account["equity"]),
        })
    }

    async fn get_positions(&self) -> Result<Vec<RawPosition>, BrokerError> {
        let value = with_backoff("alpaca.positions", || {
            self.request(
                reqwest::Method::GET,
                format!("{}/v2/positions", self.trading_url),
                None,
            )
        })
        .await?;

        let positions = value
            .as_array()
            .ok_or_else(|| BrokerError::Parse("positions response is not an array".into()))?;

        Ok(positions
            .iter()
            .filter_map(|p| {
                let ticker = p["symbol"].as_str()?;
                let qty = Self::str_f64(&p["qty"]);
                let market_value = Self::str_f64(&p["market_value"]).abs();
                if qty <= 0.0 || market_value < DUST_FILTER_USD {
                    return None;
                }
                Some(RawPosition {
                    symbol: format!("{ticker}-USD"),
                    qty,
                    // Alpaca reports the true average entry.
                    entry_price: Some(Self::str_f64(&p["avg_entry_price"]))
                        .filter(|&p| p > 0.0),
                })
            })
            .collect())
    }

    #[instrument(skip(self), name = "alpaca::get_candles", fields(account = %self.account_id))]
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

        let ticker = Self::to_ticker(symbol)?;
        let url = format!(
            "{DATA_URL}/v2/stocks/{ticker}/bars?timeframe={}&limit={n}",
            Self::timeframe(tf)
        );
        let value = with_backoff("alpaca.bars", || {
            self.request(reqwest::Method::GET, url.clone(), None)
        })
        .await?;

        let candles: Vec<Candle> = value["bars"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|bar| {
                        let ts = bar["t"]
                            .as_str()
                            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())?
                            .timestamp_millis();
                        Some(Candle::new(
                            ts,
                            Self::str_f64(&bar["o"]),
                            Self::str_f64(&bar["h"]),
                            Self::str_f64(&bar["l"]),
                            Self::str_f64(&bar["c"]),
                            Self::str_f64(&bar["v"]),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.candle_cache.insert(cache_key, candles.clone());
        debug!(symbol, count = candles.len(), "alpaca bars fetched");
        Ok(candles)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let ticker = Self::to_ticker(symbol)?;
        let url = format!("{DATA_URL}/v2/stocks/{ticker}/trades/latest");
        let value = with_backoff("alpaca.latest", || {
            self.request(reqwest::Method::GET, url.clone(), None)
        })
        .await?;

        let price = Self::str_f64(&value["trade"]["p"]);
        if price <= 0.0 {
            return Err(BrokerError::UnknownSymbol(symbol.to_string()));
        }
        Ok(price)
    }

    async fn get_products(&self) -> Result<Vec<String>, BrokerError> {
        if let Some(cached) = self.product_cache.get(&0) {
            return Ok(cached);
        }

        let url = format!(
            "{}/v2/assets?status=active&asset_class=us_equity",
            self.trading_url
        );
        let value = with_backoff("alpaca.assets", || {
            self.request(reqwest::Method::GET, url.clone(), None)
        })
        .await?;

        let products: Vec<String> = value
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter(|a| a["tradable"].as_bool() == Some(true))
                    .filter_map(|a| a["symbol"].as_str())
                    .map(|t| format!("{t}-USD"))
                    .collect()
            })
            .unwrap_or_default();

        self.product_cache.insert(0, products.clone());
        Ok(products)
    }

    #[instrument(
        skip(self, request),
        name = "alpaca::place_market",
        fields(account = %self.account_id, symbol = %request.symbol)
    )]
    async fn place_market(&self, request: &MarketOrderRequest) -> Result<Order, BrokerError> {
        if let Some(existing) = self.orders.get(&request.client_id) {
            debug!(client_id = %request.client_id, "duplicate place_market; returning existing order");
            return Ok(existing);
        }

        let ticker = Self::to_ticker(&request.symbol)?;
        let mut body = serde_json::json!({
            "symbol": ticker,
            "side": match request.side {
                crate::types::Side::Long => "buy",
                crate::types::Side::Short => "sell",
            },
            "type": "market",
            "time_in_force": "day",
            "client_order_id": request.client_id,
        });
        match (request.qty, request.notional_usd) {
            (Some(q), _) => body["qty"] = serde_json::json!(format!("{q}")),
            (None, Some(v)) => body["notional"] = serde_json::json!(format!("{v:.2}")),
            (None, None) => {
                return Err(BrokerError::Parse("order has neither qty nor notional".into()))
            }
        }

        let value = with_backoff("alpaca.order", || {
            self.request(
                reqwest::Method::POST,
                format!("{}/v2/orders", self.trading_url),
                Some(body.clone()),
            )
        })
        .await?;

        let broker_order_id = value["id"].as_str().unwrap_or_default().to_string();
        let filled_price = Self::str_f64(&value["filled_avg_price"]);
        let price = if filled_price > 0.0 {
            filled_price
        } else {
            self.get_current_price(&request.symbol).await?
        };
        let qty = request.qty.unwrap_or_else(|| {
            request.notional_usd.map(|v| v / price).unwrap_or(0.0)
        });
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
                fee_usd: 0.0,
                ts: Utc::now(),
            }],
            fees_usd: 0.0,
        };

        self.orders.insert(order.clone());
        Ok(order)
    }

    async fn cancel(&self, order_ref: &str) -> Result<(), BrokerError> {
        with_backoff("alpaca.cancel", || {
            self.request(
                reqwest::Method::DELETE,
                format!("{}/v2/orders/{order_ref}", self.trading_url),
                None,
            )
        })
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for AlpacaAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaAdapter")
            .field("account_id", &self.account_id)
            .field("paper", &self.credentials.paper)
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

    fn adapter(paper: bool) -> AlpacaAdapter {
        AlpacaAdapter::new(
            "alpaca_master",
            Credentials {
                api_key: "key".into(),
                api_secret: "secret".into(),
                passphrase: None,
                paper,
            },
            Arc::new(RateLimiter::new(4)),
            IdempotencyMap::in_memory(),
        )
    }

    #[test]
    fn ticker_conversion() {
        assert_eq!(AlpacaAdapter::to_ticker("AAPL-USD").unwrap(), "AAPL");
        assert_eq!(AlpacaAdapter::to_ticker("tsla-USD").unwrap(), "TSLA");
        assert!(AlpacaAdapter::to_ticker("AAPL").is_err());
    }

    #[test]
    fn paper_flag_selects_paper_host() {
        assert_eq!(adapter(true).trading_url, PAPER_URL);
        assert_eq!(adapter(false).trading_url, LIVE_URL);
    }

    #[test]
    fn timeframe_strings() {
        assert_eq!(AlpacaAdapter::timeframe(Timeframe::M1), "1Min");
        assert_eq!(AlpacaAdapter::timeframe(Timeframe::M5), "5Min");
        assert_eq!(AlpacaAdapter::timeframe(Timeframe::M15), "15Min");
        assert_eq!(AlpacaAdapter::timeframe(Timeframe::H1), "1Hour");
    }

    #[test]
    fn alpaca_charges_no_fees() {
        assert_eq!(adapter(false).fee_rate(), 0.0);
    }
}
