//! Structured failure vocabulary for the request-serving plane.
//!
//! Every variant carries enough context for the session layer to produce a
//! client-facing error frame without string-matching the message: typed
//! variants, `From` conversions from component-local error types, and a
//! single mapping function ([`GatewayError::into_client_frame`]) rather
//! than scattering error-code literals across call sites.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scope of an upstream quota violation. Distinct from the per-principal
/// daily ceiling enforced by [`crate::rate_limit::RateLimiter`] — this
/// describes a provider-side (hourly/weekly) quota that the upstream
/// inference node itself reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Hourly,
    Weekly,
    Both,
}

impl RateLimitScope {
    /// Hourly scope implies retry ~3600s; otherwise ~86400s.
    pub fn default_retry_after_seconds(self) -> u64 {
        match self {
            RateLimitScope::Hourly => 3600,
            RateLimitScope::Weekly | RateLimitScope::Both => 86_400,
        }
    }
}

/// Public failure vocabulary.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("quota exceeded ({scope:?}): {used}/{limit}")]
    QuotaExceeded {
        scope: RateLimitScope,
        used: u64,
        limit: u64,
        retry_after_seconds: u64,
    },

    #[error("all provider keys exhausted, retry after {retry_after_seconds}s")]
    KeysExhausted {
        reset_time: chrono::DateTime<chrono::Utc>,
        total_keys: u32,
        keys_in_cooldown: u32,
        retry_after_seconds: u64,
    },

    #[error("rate limited: {limit} requests/day")]
    RateLimited { limit: u64, retry_after_seconds: u64 },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("no node available")]
    NoNodeAvailable,

    /// Never mapped to a generic error event; surfaces as its own `aborted`
    /// terminal frame.
    #[error("aborted")]
    Aborted,

    /// Internal; the outer layer surfaces only a generic message and logs
    /// `cause` itself. `cause` is intentionally excluded from `Display` so
    /// it can never leak into an outbound frame by accident.
    #[error("upstream failure")]
    Upstream {
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },
}

impl GatewayError {
    pub fn keys_exhausted_display_message(&self, lang: &str) -> Option<String> {
        match self {
            GatewayError::KeysExhausted {
                retry_after_seconds,
                ..
            } => Some(match lang {
                "ko" => format!(
                    "사용 가능한 키가 모두 소진되었습니다. {retry_after_seconds}초 후 다시 시도해주세요."
                ),
                _ => format!(
                    "All provider keys are currently exhausted. Please retry in {retry_after_seconds}s."
                ),
            }),
            _ => None,
        }
    }

    /// Map to the client-visible error frame fields: a stable
    /// `errorType` tag, a safe-to-show `message`, and an optional
    /// `retryAfter`. `Upstream` and any future non-exhaustive variant are
    /// folded into a single generic message — internal detail never reaches
    /// the wire.
    pub fn into_client_frame(self) -> ClientErrorFrame {
        match self {
            GatewayError::QuotaExceeded {
                scope,
                retry_after_seconds,
                ..
            } => ClientErrorFrame {
                error_type: "quota_exceeded".into(),
                message: format!("{scope:?} quota exceeded"),
                retry_after: Some(retry_after_seconds),
            },
            GatewayError::KeysExhausted {
                retry_after_seconds,
                ..
            } => ClientErrorFrame {
                error_type: "keys_exhausted".into(),
                message: self
                    .keys_exhausted_display_message("en")
                    .unwrap_or_else(|| "keys exhausted".into()),
                retry_after: Some(retry_after_seconds),
            },
            GatewayError::RateLimited {
                limit,
                retry_after_seconds,
            } => ClientErrorFrame {
                error_type: "rate_limited".into(),
                message: format!("일일 채팅 제한 초과 ({limit}회/일)"),
                retry_after: Some(retry_after_seconds),
            },
            GatewayError::InvalidRequest { message } => ClientErrorFrame {
                error_type: "invalid_request".into(),
                message,
                retry_after: None,
            },
            GatewayError::NoNodeAvailable => ClientErrorFrame {
                error_type: "no_node_available".into(),
                message: "사용 가능한 노드가 없습니다".into(),
                retry_after: None,
            },
            GatewayError::Aborted => ClientErrorFrame {
                error_type: "aborted".into(),
                message: "aborted".into(),
                retry_after: None,
            },
            GatewayError::Upstream { cause } => {
                if let Some(cause) = cause {
                    tracing::error!(cause, "upstream failure mapped to generic client message");
                }
                ClientErrorFrame {
                    error_type: "internal_error".into(),
                    message: "처리 중 오류가 발생했습니다".into(),
                    retry_after: None,
                }
            }
        }
    }
}

/// The shape an error takes once it crosses into an outbound `error` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientErrorFrame {
    pub error_type: String,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl From<anyhow::Error> for GatewayError {
    fn from(e: anyhow::Error) -> Self {
        GatewayError::Upstream {
            cause: Some(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_never_maps_to_internal_error_type() {
        let frame = GatewayError::Aborted.into_client_frame();
        assert_eq!(frame.error_type, "aborted");
    }

    #[test]
    fn upstream_hides_cause_from_client_frame() {
        let frame = GatewayError::Upstream {
            cause: Some("postgres: connection refused at 10.0.0.5:5432".into()),
        }
        .into_client_frame();
        assert_eq!(frame.error_type, "internal_error");
        assert!(!frame.message.contains("postgres"));
        assert!(!frame.message.contains("10.0.0.5"));
    }

    #[test]
    fn quota_exceeded_carries_retry_after() {
        let frame = GatewayError::QuotaExceeded {
            scope: RateLimitScope::Hourly,
            used: 150,
            limit: 150,
            retry_after_seconds: 3600,
        }
        .into_client_frame();
        assert_eq!(frame.error_type, "quota_exceeded");
        assert_eq!(frame.retry_after, Some(3600));
    }

    #[test]
    fn rate_limited_message_is_korean_daily_limit_text() {
        let frame = GatewayError::RateLimited {
            limit: 100,
            retry_after_seconds: 86_400,
        }
        .into_client_frame();
        assert_eq!(frame.message, "일일 채팅 제한 초과 (100회/일)");
    }

    #[test]
    fn no_node_available_message_is_korean() {
        let frame = GatewayError::NoNodeAvailable.into_client_frame();
        assert!(frame.message.contains("사용 가능한 노드가 없습니다"));
    }

    #[test]
    fn keys_exhausted_display_message_localizes() {
        let err = GatewayError::KeysExhausted {
            reset_time: chrono::Utc::now(),
            total_keys: 4,
            keys_in_cooldown: 4,
            retry_after_seconds: 120,
        };
        assert!(err.keys_exhausted_display_message("ko").unwrap().contains("120초"));
        assert!(err.keys_exhausted_display_message("en").unwrap().contains("120s"));
    }
}
