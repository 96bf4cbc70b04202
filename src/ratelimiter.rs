//! Per-route and global REST rate limiter.
//!
//! Updates are short and infrequent relative to reads, so a single
//! reader-writer lock over a plain map is the right tool — no need for a
//! sharded or lock-free structure at this call volume.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Record {
    remaining: i64,
    reset_at: Instant,
}

impl Record {
    fn is_active(&self, now: Instant) -> bool {
        self.reset_at > now
    }
}

struct Inner {
    global: Option<Record>,
    routes: HashMap<String, Record>,
}

pub struct RateLimiter {
    inner: RwLock<Inner>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                global: None,
                routes: HashMap::new(),
            }),
        }
    }

    /// Record a limit update from a response. `remaining <= 0` with a
    /// positive `reset_after` means the route (or the whole client, if
    /// `global`) must wait before its next call.
    pub fn update_limit(&self, route: &str, remaining: i64, reset_after: Duration, global: bool) {
        let record = Record {
            remaining,
            reset_at: Instant::now() + reset_after,
        };
        let mut inner = self.inner.write().unwrap();
        if global {
            inner.global = Some(record);
        } else {
            inner.routes.insert(route.to_string(), record);
        }
    }

    pub fn is_rate_limited(&self, route: &str) -> bool {
        let now = Instant::now();
        let inner = self.inner.read().unwrap();
        if inner.global.is_some_and(|g| g.is_active(now)) {
            return true;
        }
        inner
            .routes
            .get(route)
            .is_some_and(|r| r.is_active(now) && r.remaining <= 0)
    }

    pub fn retry_after(&self, route: &str) -> Duration {
        let now = Instant::now();
        let inner = self.inner.read().unwrap();
        let global_wait = inner
            .global
            .filter(|g| g.is_active(now))
            .map(|g| g.reset_at - now);
        let route_wait = inner
            .routes
            .get(route)
            .filter(|r| r.is_active(now) && r.remaining <= 0)
            .map(|r| r.reset_at - now);
        global_wait
            .into_iter()
            .chain(route_wait)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_is_rate_limited_until_reset() {
        let rl = RateLimiter::new();
        rl.update_limit("POST/x", 0, Duration::from_millis(200), false);
        assert!(rl.is_rate_limited("POST/x"));
        assert!(rl.retry_after("POST/x") <= Duration::from_millis(200));
    }

    #[test]
    fn unrelated_route_is_unaffected() {
        let rl = RateLimiter::new();
        rl.update_limit("POST/x", 0, Duration::from_millis(200), false);
        assert!(!rl.is_rate_limited("GET/y"));
        assert_eq!(rl.retry_after("GET/y"), Duration::ZERO);
    }

    #[test]
    fn global_limit_blocks_every_route() {
        let rl = RateLimiter::new();
        rl.update_limit("anything", 0, Duration::from_millis(200), true);
        assert!(rl.is_rate_limited("GET/y"));
    }

    #[test]
    fn positive_remaining_is_not_rate_limited() {
        let rl = RateLimiter::new();
        rl.update_limit("POST/x", 5, Duration::from_millis(200), false);
        assert!(!rl.is_rate_limited("POST/x"));
    }
}
