// =============================================================================
// Error taxonomy — typed broker failures and engine-level classification
// =============================================================================
//
// Four classes drive recovery policy in the account loop:
//
//   Transient — retry with backoff (network, rate limit, 5xx, 403 block).
//   Business  — surface and skip the symbol this cycle; never blind-retry.
//   Logic     — something the engine believes impossible happened; trigger
//               EMERGENCY_STOP.
//   Fatal     — halt this account's loop; other accounts continue.
// =============================================================================

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Recovery class of a failure. See module docs for the policy per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorClass {
    Transient,
    Business,
    Logic,
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "TRANSIENT"),
            Self::Business => write!(f, "BUSINESS"),
            Self::Logic => write!(f, "LOGIC"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Typed failure returned by every [`crate::broker::BrokerAdapter`] operation.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// 403 from a venue that temporarily blocks a key. Retried with a longer
    /// backoff cap than ordinary rate limits.
    #[error("temporarily blocked by venue (403)")]
    TempAuthBlocked,

    #[error("exchange returned {status}: {message}")]
    Exchange { status: u16, message: String },

    #[error("authentication failed: {0}")]
    AuthInvalid(String),

    #[error("order below minimum notional: {got:.4} < {required:.4} USD")]
    MinNotional { required: f64, got: f64 },

    #[error("insufficient funds for order")]
    InsufficientFunds,

    #[error("unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The venue rejected a sell repeatedly; the position enters a cool-down.
    #[error("position unsellable: {0}")]
    Unsellable(String),

    /// Two calls on one account observed equal nonces. Fail closed.
    #[error("nonce collision on account {0}")]
    NonceCollision(String),

    #[error("response parse error: {0}")]
    Parse(String),
}

impl BrokerError {
    /// Map this failure into its recovery class.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network(_) | Self::RateLimited { .. } | Self::TempAuthBlocked => {
                ErrorClass::Transient
            }
            // 5xx from the venue is transient; anything else the venue chose
            // to reject is a business condition.
            Self::Exchange { status, .. } if *status >= 500 => ErrorClass::Transient,
            Self::Exchange { .. }
            | Self::MinNotional { .. }
            | Self::InsufficientFunds
            | Self::UnknownSymbol(_)
            | Self::PermissionDenied(_)
            | Self::NotFound(_)
            | Self::Unsellable(_)
            | Self::Parse(_) => ErrorClass::Business,
            Self::NonceCollision(_) => ErrorClass::Logic,
            Self::AuthInvalid(_) => ErrorClass::Fatal,
        }
    }

    /// True when the account loop should retry this call with backoff.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Classify a transport-level reqwest failure.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Network(err.to_string())
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }

    /// Classify an HTTP status + body returned by a venue, for adapters that
    /// have no venue-specific mapping for it.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => Self::RateLimited { retry_after: None },
            403 => Self::TempAuthBlocked,
            401 => Self::AuthInvalid(body.to_string()),
            404 => Self::NotFound(body.to_string()),
            s => Self::Exchange {
                status: s,
                message: body.chars().take(300).collect(),
            },
        }
    }
}

/// Engine-internal logic violations that are not tied to a broker call.
/// All of these classify as `Logic`.
#[derive(Debug, Error)]
pub enum SafetyViolation {
    #[error("profitability guard tripped: stop rule matched at pnl {pnl:.4} >= 0")]
    ProfitabilityGuardTripped { pnl: f64 },

    #[error("position count {count} exceeds hard cap {cap} after cleanup")]
    PositionCapExceeded { count: usize, cap: usize },
}
