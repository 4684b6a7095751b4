// =============================================================================
// Bearer Token Authentication — Axum extractor
// =============================================================================
//
// Validates `Authorization: Bearer <token>` against the `APEX_ADMIN_TOKEN`
// environment variable. Comparison is constant-time. The token is read per
// request so rotation does not require a restart.
//
// With no token configured, every authenticated endpoint rejects; the
// control surface never falls open.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Environment variable holding the expected admin token.
const TOKEN_ENV_VAR: &str = "APEX_ADMIN_TOKEN";

/// Compare two byte slices in constant time. Every byte is examined even
/// after a mismatch so timing reveals nothing about the mismatch position.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Extractor yielding the validated token, or a 403 before the handler runs.
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var(TOKEN_ENV_VAR).unwrap_or_default();
        if expected.is_empty() {
            warn!("APEX_ADMIN_TOKEN is not set; rejecting authenticated request");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "server authentication not configured",
            });
        }

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "missing or invalid authorization token",
                });
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "invalid authorization token",
            });
        }

        Ok(AuthBearer(token.to_string()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_slices_match() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn different_slices_do_not_match() {
        assert!(!constant_time_eq(b"token", b"other"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }
}
