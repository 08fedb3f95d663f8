//! Daily per-principal rate limiting.
//!
//! A `moka` in-process cache is the hot path; a durable store is
//! authoritative on cold start and is the thing a restart-safe deployment
//! actually depends on. Durable failures degrade to cache-only mode
//! silently — callers never see a storage error surface as a request
//! failure.

mod limiter;
mod store;

pub use limiter::RateLimiter;
pub use store::{RateLimitEntry, RateLimitStore, SqliteRateLimitStore};

use serde::{Deserialize, Serialize};

/// Coarse authorization class derived from the auth token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
    Guest,
}

/// Tool-access class, independent of role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

/// Daily ceiling for a given role/tier pair. `None` means unbounded.
pub fn daily_limit(role: Role, tier: Tier) -> Option<u64> {
    match (role, tier) {
        (Role::Admin, _) => None,
        (_, Tier::Enterprise) => None,
        (_, Tier::Pro) => Some(1000),
        (Role::Guest, _) => Some(20),
        (_, Tier::Free) => Some(100),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_is_always_unbounded() {
        assert_eq!(daily_limit(Role::Admin, Tier::Free), None);
        assert_eq!(daily_limit(Role::Admin, Tier::Pro), None);
    }

    #[test]
    fn enterprise_is_always_unbounded() {
        assert_eq!(daily_limit(Role::User, Tier::Enterprise), None);
        assert_eq!(daily_limit(Role::Guest, Tier::Enterprise), None);
    }

    #[test]
    fn pro_limit_is_1000() {
        assert_eq!(daily_limit(Role::User, Tier::Pro), Some(1000));
    }

    #[test]
    fn free_or_user_limit_is_100() {
        assert_eq!(daily_limit(Role::User, Tier::Free), Some(100));
    }

    #[test]
    fn guest_limit_is_20() {
        // Guest sessions only ever pair with Tier::Free in practice (the
        // auth fallback always resolves unauthenticated principals to
        // {role: guest, tier: free} — see session::types::Principal::guest).
        assert_eq!(daily_limit(Role::Guest, Tier::Free), Some(20));
    }

    #[test]
    fn tier_outranks_guest_role_for_elevated_tiers() {
        // An unreachable combination in this system (guest principals are
        // always Tier::Free), but the precedence is: admin/enterprise first,
        // then pro, then the free/user/guest tier.
        assert_eq!(daily_limit(Role::Guest, Tier::Pro), Some(1000));
    }
}
