//! Authentication contract.
//!
//! Token verification itself is an external collaborator: this module only
//! defines the contract (`TokenVerifier::verify`) and the resulting
//! principal shape. Deployments plug in their own verifier.

use async_trait::async_trait;

use crate::rate_limit::{Role, Tier};

/// Resolved identity of a connection.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Option<String>,
    pub role: Role,
    pub tier: Tier,
}

impl Principal {
    /// The unauthenticated default.
    pub fn guest() -> Self {
        Self {
            user_id: None,
            role: Role::Guest,
            tier: Tier::Free,
        }
    }

    /// The quota/rate key for this principal:
    /// authenticated user id, else a caller-supplied anonymous session id,
    /// else the constant `"guest"`.
    pub fn principal_key<'a>(&'a self, anon_session_id: Option<&'a str>) -> &'a str {
        self.user_id
            .as_deref()
            .or(anon_session_id)
            .unwrap_or("guest")
    }
}

/// `verifyToken`: resolves a bearer token to a principal, or
/// `None` if it doesn't resolve — never an error, since an unresolvable
/// token degrades to guest rather than rejecting the connection.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Principal>;
}

/// Token sources, in priority order: a cookie named
/// `auth_token`, then an `Authorization: Bearer <t>` header.
pub fn extract_bearer_token(cookie_header: Option<&str>, authorization_header: Option<&str>) -> Option<String> {
    if let Some(cookies) = cookie_header {
        for pair in cookies.split(';') {
            let pair = pair.trim();
            if let Some(value) = pair.strip_prefix("auth_token=") {
                return Some(value.to_string());
            }
        }
    }
    authorization_header
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_key_prefers_user_id() {
        let principal = Principal {
            user_id: Some("u1".into()),
            role: Role::User,
            tier: Tier::Free,
        };
        assert_eq!(principal.principal_key(Some("anon-1")), "u1");
    }

    #[test]
    fn principal_key_falls_back_to_anon_session_id() {
        let principal = Principal::guest();
        assert_eq!(principal.principal_key(Some("anon-1")), "anon-1");
    }

    #[test]
    fn principal_key_falls_back_to_guest_constant() {
        let principal = Principal::guest();
        assert_eq!(principal.principal_key(None), "guest");
    }

    #[test]
    fn cookie_token_is_preferred_over_header() {
        let token = extract_bearer_token(Some("foo=bar; auth_token=cookie-tok"), Some("Bearer header-tok"));
        assert_eq!(token.as_deref(), Some("cookie-tok"));
    }

    #[test]
    fn falls_back_to_authorization_header() {
        let token = extract_bearer_token(None, Some("Bearer header-tok"));
        assert_eq!(token.as_deref(), Some("header-tok"));
    }

    #[test]
    fn missing_both_sources_yields_none() {
        assert!(extract_bearer_token(None, None).is_none());
    }
}
