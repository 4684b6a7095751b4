// =============================================================================
// Shared types used across the APEX trading engine
// =============================================================================
//
// UNIT CONVENTION: every percentage-like quantity in this codebase is a
// FRACTION (0.02 = 2%). Config loaders convert legacy percentage-formatted
// values at the boundary; nothing past the boundary ever holds "2.0 = 2%".
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a trade or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for longs, -1.0 for shorts. Multiplying a raw price move by this
    /// yields a signed PnL contribution.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Role of an account within the engine.
///
/// A `User` account on a broker where a connected `Master` drives it via
/// copy-trade never runs its own independent scan loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountRole {
    Master,
    User,
}

impl std::fmt::Display for AccountRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::User => write!(f, "user"),
        }
    }
}

/// Supported candle timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
}

impl Timeframe {
    pub fn minutes(&self) -> u32 {
        match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::H1 => 60,
        }
    }

    /// The timeframe 5x larger, used for multi-timeframe RSI agreement.
    pub fn times_five(&self) -> Timeframe {
        match self {
            Self::M1 => Self::M5,
            Self::M5 => Self::M15,
            _ => Self::H1,
        }
    }

    /// The timeframe 15x larger, used for multi-timeframe RSI agreement.
    pub fn times_fifteen(&self) -> Timeframe {
        match self {
            Self::M1 => Self::M15,
            _ => Self::H1,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::M1 => write!(f, "1m"),
            Self::M5 => write!(f, "5m"),
            Self::M15 => write!(f, "15m"),
            Self::H1 => write!(f, "1h"),
        }
    }
}

/// A single OHLCV candle. Immutable once fetched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in milliseconds since the UNIX epoch.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Market regime classification used to modulate risk and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Trending,
    Ranging,
    Volatile,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trending => write!(f, "TRENDING"),
            Self::Ranging => write!(f, "RANGING"),
            Self::Volatile => write!(f, "VOLATILE"),
        }
    }
}

/// An entry signal produced by the strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    /// Composite entry score in [0, 100].
    pub score: f64,
    /// Suggested stop distance as a fraction of entry price.
    pub suggested_stop_pct: f64,
    /// Profit targets as fractions of entry price, ascending.
    pub targets: Vec<f64>,
    pub reason: String,
    pub regime: Regime,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
}

/// Lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Filled,
    Partial,
    Rejected,
    Canceled,
}

impl OrderState {
    /// Terminal states are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Rejected | Self::Canceled)
    }
}

/// A single fill against an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub price: f64,
    pub qty: f64,
    pub fee_usd: f64,
    pub ts: DateTime<Utc>,
}

/// An order as tracked by the engine. `client_id` is the idempotency key:
/// retrying `place_market` with the same id returns the same order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_id: String,
    pub broker_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub notional_usd: f64,
    pub state: OrderState,
    pub fills: Vec<Fill>,
    pub fees_usd: f64,
}

impl Order {
    /// Volume-weighted average fill price, or `None` if nothing filled.
    pub fn avg_fill_price(&self) -> Option<f64> {
        let total_qty: f64 = self.fills.iter().map(|f| f.qty).sum();
        if total_qty <= 0.0 {
            return None;
        }
        let weighted: f64 = self.fills.iter().map(|f| f.price * f.qty).sum();
        Some(weighted / total_qty)
    }
}

/// Request for a market order. Exactly one of `qty` / `notional_usd` needs to
/// be set; adapters translate to whatever the venue accepts.
#[derive(Debug, Clone)]
pub struct MarketOrderRequest {
    /// Idempotency key. Adapters MUST return the existing order when the
    /// same id is retried.
    pub client_id: String,
    /// Canonical `BASE-QUOTE` symbol, e.g. `BTC-USD`.
    pub symbol: String,
    pub side: Side,
    pub qty: Option<f64>,
    pub notional_usd: Option<f64>,
}

/// A position as reported by a broker. Entry price is not guaranteed; the
/// tracker adopts such positions with a synthetic aggressive entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPosition {
    pub symbol: String,
    pub qty: f64,
    pub entry_price: Option<f64>,
}

/// Balance snapshot in the quote currency.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Balance {
    pub available: f64,
    pub total: f64,
}

/// Exchange login identity returned by `connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub account_id: String,
    pub label: String,
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn side_direction_signs() {
        assert_eq!(Side::Long.direction(), 1.0);
        assert_eq!(Side::Short.direction(), -1.0);
    }

    #[test]
    fn timeframe_multiples() {
        assert_eq!(Timeframe::M1.times_five(), Timeframe::M5);
        assert_eq!(Timeframe::M1.times_fifteen(), Timeframe::M15);
        assert_eq!(Timeframe::M5.times_five(), Timeframe::M15);
    }

    #[test]
    fn order_state_terminality() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Rejected.is_terminal());
        assert!(OrderState::Canceled.is_terminal());
        assert!(!OrderState::Pending.is_terminal());
        assert!(!OrderState::Partial.is_terminal());
    }

    #[test]
    fn avg_fill_price_weighted() {
        let order = Order {
            client_id: "c1".into(),
            broker_order_id: "b1".into(),
            symbol: "BTC-USD".into(),
            side: Side::Long,
            qty: 3.0,
            notional_usd: 0.0,
            state: OrderState::Filled,
            fills: vec![
                Fill {
                    price: 100.0,
                    qty: 1.0,
                    fee_usd: 0.0,
                    ts: Utc::now(),
                },
                Fill {
                    price: 106.0,
                    qty: 2.0,
                    fee_usd: 0.0,
                    ts: Utc::now(),
                },
            ],
            fees_usd: 0.0,
        };
        assert!((order.avg_fill_price().unwrap() - 104.0).abs() < 1e-12);
    }

    #[test]
    fn avg_fill_price_none_without_fills() {
        let order = Order {
            client_id: "c1".into(),
            broker_order_id: "b1".into(),
            symbol: "BTC-USD".into(),
            side: Side::Long,
            qty: 1.0,
            notional_usd: 0.0,
            state: OrderState::Pending,
            fills: Vec::new(),
            fees_usd: 0.0,
        };
        assert!(order.avg_fill_price().is_none());
    }
}
