//! Fixed-window, in-memory rate limiting
//!
//! Per-process counters are acceptable for the single-instance
//! deployment this service targets. Auth routes are keyed by client IP,
//! general API routes by caller identity, lifecycle operations by owner.

use crate::config::RateLimitSettings;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Route groups with independent limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Auth,
    Api,
    Lifecycle,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::Auth => "auth",
            Scope::Api => "api",
            Scope::Lifecycle => "lifecycle",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    count: u64,
    window_start: Instant,
}

pub struct RateLimiter {
    settings: RateLimitSettings,
    store: Mutex<HashMap<String, Entry>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            store: Mutex::new(HashMap::new()),
        }
    }

    fn limits(&self, scope: Scope) -> (u64, Duration) {
        match scope {
            Scope::Auth => (self.settings.auth_max, self.settings.auth_window),
            Scope::Api => (self.settings.api_max, self.settings.api_window),
            Scope::Lifecycle => (self.settings.lifecycle_max, self.settings.lifecycle_window),
        }
    }

    /// Check and count a request. Returns `Err(retry_after_secs)` when
    /// the window is exhausted.
    pub fn check(&self, scope: Scope, key: &str) -> Result<(), u64> {
        let (max, window) = self.limits(scope);
        let store_key = format!("{}:{}", scope.as_str(), key);
        let now = Instant::now();

        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());

        // Opportunistically drop entries whose window has long passed
        if store.len() > 10_000 {
            store.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
        }

        match store.get_mut(&store_key) {
            Some(entry) => {
                let elapsed = now.duration_since(entry.window_start);
                if elapsed >= window {
                    entry.count = 1;
                    entry.window_start = now;
                    Ok(())
                } else if entry.count >= max {
                    let retry_after = (window - elapsed).as_secs() + 1;
                    Err(retry_after)
                } else {
                    entry.count += 1;
                    Ok(())
                }
            }
            None => {
                store.insert(
                    store_key,
                    Entry {
                        count: 1,
                        window_start: now,
                    },
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_settings() -> RateLimitSettings {
        RateLimitSettings {
            auth_max: 2,
            auth_window: Duration::from_secs(60),
            api_max: 3,
            api_window: Duration::from_secs(60),
            lifecycle_max: 1,
            lifecycle_window: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_allows_up_to_max() {
        let limiter = RateLimiter::new(tight_settings());
        assert!(limiter.check(Scope::Auth, "1.2.3.4").is_ok());
        assert!(limiter.check(Scope::Auth, "1.2.3.4").is_ok());
        assert!(limiter.check(Scope::Auth, "1.2.3.4").is_err());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(tight_settings());
        assert!(limiter.check(Scope::Auth, "1.2.3.4").is_ok());
        assert!(limiter.check(Scope::Auth, "1.2.3.4").is_ok());
        assert!(limiter.check(Scope::Auth, "5.6.7.8").is_ok());
    }

    #[test]
    fn test_scopes_are_independent() {
        let limiter = RateLimiter::new(tight_settings());
        assert!(limiter.check(Scope::Lifecycle, "user-1").is_ok());
        assert!(limiter.check(Scope::Lifecycle, "user-1").is_err());
        assert!(limiter.check(Scope::Api, "user-1").is_ok());
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimiter::new(tight_settings());
        assert!(limiter.check(Scope::Lifecycle, "user-1").is_ok());
        assert!(limiter.check(Scope::Lifecycle, "user-1").is_err());
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.check(Scope::Lifecycle, "user-1").is_ok());
    }

    #[test]
    fn test_retry_after_is_positive() {
        let limiter = RateLimiter::new(tight_settings());
        let _ = limiter.check(Scope::Auth, "k");
        let _ = limiter.check(Scope::Auth, "k");
        let retry_after = limiter.check(Scope::Auth, "k").unwrap_err();
        assert!(retry_after >= 1);
        assert!(retry_after <= 61);
    }
}
