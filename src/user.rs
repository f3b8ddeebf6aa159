use chrono::Utc;

use crate::discourse::{CurrentUser, ForumApi, UserLookup};
use crate::storage::Store;

const CACHE_KEY: &str = "current_user";
const BACKOFF_KEY: &str = "session_429_until";
const BACKOFF_MS: i64 = 30 * 60 * 1000;

/// Resolve the logged-in user, tolerating endpoint unavailability.
///
/// Order: cached value in the store, then the session endpoint. A 429 from
/// the session endpoint sets a 30-minute backoff so repeated syncs don't
/// hammer it; within the backoff window only the cache is consulted.
pub fn resolve_current_user(api: &dyn ForumApi, store: &Store) -> Option<CurrentUser> {
    let cached: Option<CurrentUser> = store.get(CACHE_KEY, None);
    if let Some(user) = cached.clone() {
        return Some(user);
    }

    let now = Utc::now().timestamp_millis();
    let backoff_until: i64 = store.get(BACKOFF_KEY, 0);
    if backoff_until > now {
        tracing::debug!("session endpoint in backoff, skipping user lookup");
        return None;
    }

    match api.current_user() {
        Ok(UserLookup::Found(user)) => {
            if let Err(err) = store.set(CACHE_KEY, &Some(user.clone())) {
                tracing::debug!("failed to cache current user: {err:#}");
            }
            Some(user)
        }
        Ok(UserLookup::Anonymous) => None,
        Ok(UserLookup::RateLimited) => {
            tracing::warn!("session endpoint rate limited, backing off 30 minutes");
            let _ = store.set(BACKOFF_KEY, &(now + BACKOFF_MS));
            None
        }
        Err(err) => {
            tracing::debug!("user lookup failed: {err:#}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockApi;

    #[test]
    fn found_user_is_cached() {
        let store = Store::open_in_memory().unwrap();
        let api = MockApi::default();
        *api.user.lock() = UserLookup::Found(CurrentUser {
            username: "lurker".into(),
            trust_level: Some(2),
        });

        let user = resolve_current_user(&api, &store).unwrap();
        assert_eq!(user.username, "lurker");

        // Second resolve hits the cache even if the endpoint degrades.
        *api.user.lock() = UserLookup::RateLimited;
        let user = resolve_current_user(&api, &store).unwrap();
        assert_eq!(user.trust_level, Some(2));
    }

    #[test]
    fn rate_limit_sets_backoff() {
        let store = Store::open_in_memory().unwrap();
        let api = MockApi::default();
        *api.user.lock() = UserLookup::RateLimited;

        assert!(resolve_current_user(&api, &store).is_none());
        let until: i64 = store.get(BACKOFF_KEY, 0);
        assert!(until > Utc::now().timestamp_millis());

        // While backed off, the endpoint is not consulted again.
        *api.user.lock() = UserLookup::Found(CurrentUser {
            username: "late".into(),
            trust_level: None,
        });
        assert!(resolve_current_user(&api, &store).is_none());
    }

    #[test]
    fn anonymous_yields_none() {
        let store = Store::open_in_memory().unwrap();
        let api = MockApi::default();
        assert!(resolve_current_user(&api, &store).is_none());
    }
}
