//! Per-IP token-bucket rate limiter.
//!
//! Each client IP owns a bucket that refills lazily at
//! `requests_per_window / window_seconds` tokens per second, capped at
//! `requests_per_window + burst`. A request is admitted iff at least one
//! whole token is available. Entries untouched for more than one window
//! are evicted by the maintenance sweep.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::RateLimitConfig;

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Whole tokens left after this check.
    pub remaining: u64,
    pub limit: u64,
    /// Unix timestamp when the current window rolls over.
    pub reset_at: i64,
    /// Seconds to wait before retrying; 0 when allowed.
    pub retry_after: u64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    window_start: Instant,
    /// Requests seen in the current window (observability only).
    count: u64,
    last_seen: Instant,
}

impl Bucket {
    fn new(now: Instant, cap: f64) -> Self {
        Self {
            tokens: cap,
            last_refill: now,
            window_start: now,
            count: 0,
            last_seen: now,
        }
    }

    fn refill(&mut self, now: Instant, rate_per_sec: f64, cap: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * rate_per_sec).min(cap);
            self.last_refill = now;
        }
    }
}

#[derive(Debug, Default)]
pub struct RateLimitStats {
    pub total_checks: u64,
    pub allowed: u64,
    pub denied: u64,
    pub tracked_ips: usize,
}

pub struct RateLimiter {
    cfg: RateLimitConfig,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
    counters: Mutex<(u64, u64, u64)>, // (checks, allowed, denied)
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            buckets: Mutex::new(HashMap::new()),
            counters: Mutex::new((0, 0, 0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled
    }

    fn rate_per_sec(&self) -> f64 {
        self.cfg.requests_per_window as f64 / self.cfg.window_seconds.max(1) as f64
    }

    fn cap(&self) -> f64 {
        (self.cfg.requests_per_window + self.cfg.burst) as f64
    }

    /// Check and consume one token for `ip`.
    pub fn check(&self, ip: IpAddr) -> RateLimitResult {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> RateLimitResult {
        if !self.cfg.enabled {
            return RateLimitResult {
                allowed: true,
                remaining: self.cfg.requests_per_window,
                limit: self.cfg.requests_per_window,
                reset_at: unix_now() + self.cfg.window_seconds as i64,
                retry_after: 0,
            };
        }

        let rate = self.rate_per_sec();
        let cap = self.cap();
        let window = Duration::from_secs(self.cfg.window_seconds);

        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        let bucket = buckets
            .entry(ip)
            .or_insert_with(|| Bucket::new(now, cap));

        bucket.refill(now, rate, cap);
        bucket.last_seen = now;
        if now.saturating_duration_since(bucket.window_start) >= window {
            bucket.window_start = now;
            bucket.count = 0;
        }
        bucket.count += 1;

        let window_elapsed = now.saturating_duration_since(bucket.window_start);
        let reset_at = unix_now() + (window.saturating_sub(window_elapsed)).as_secs() as i64;

        let result = if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitResult {
                allowed: true,
                remaining: bucket.tokens as u64,
                limit: self.cfg.requests_per_window,
                reset_at,
                retry_after: 0,
            }
        } else {
            // Seconds until one whole token accrues, rounded up.
            let deficit = 1.0 - bucket.tokens;
            let retry_after = (deficit / rate).ceil() as u64;
            RateLimitResult {
                allowed: false,
                remaining: 0,
                limit: self.cfg.requests_per_window,
                reset_at,
                retry_after: retry_after.max(1),
            }
        };
        drop(buckets);

        let mut c = self.counters.lock().expect("rate limiter poisoned");
        c.0 += 1;
        if result.allowed {
            c.1 += 1;
        } else {
            c.2 += 1;
        }
        result
    }

    /// Evict buckets untouched for more than one window. Called from the
    /// maintenance task.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) {
        let window = Duration::from_secs(self.cfg.window_seconds);
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) <= window);
    }

    pub fn reset_ip(&self, ip: IpAddr) {
        self.buckets
            .lock()
            .expect("rate limiter poisoned")
            .remove(&ip);
    }

    pub fn stats(&self) -> RateLimitStats {
        let c = self.counters.lock().expect("rate limiter poisoned");
        let tracked = self.buckets.lock().expect("rate limiter poisoned").len();
        RateLimitStats {
            total_checks: c.0,
            allowed: c.1,
            denied: c.2,
            tracked_ips: tracked,
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_window: u64, window: u64, burst: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            requests_per_window: per_window,
            window_seconds: window,
            burst,
        })
    }

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn disabled_always_allows() {
        let rl = RateLimiter::new(RateLimitConfig {
            enabled: false,
            requests_per_window: 1,
            window_seconds: 60,
            burst: 0,
        });
        for _ in 0..100 {
            assert!(rl.check(ip()).allowed);
        }
    }

    #[test]
    fn burst_of_limit_plus_burst_then_denied() {
        // 100/60s + burst 20: 120 immediate requests pass, the 121st fails.
        let rl = limiter(100, 60, 20);
        let now = Instant::now();
        for i in 0..120 {
            let r = rl.check_at(ip(), now);
            assert!(r.allowed, "request {i} should be allowed");
        }
        let denied = rl.check_at(ip(), now);
        assert!(!denied.allowed);
        assert!(denied.retry_after >= 1);
        assert_eq!(denied.remaining, 0);
    }

    #[test]
    fn arrival_at_or_below_rate_never_denied() {
        // 10 tokens/sec; one request every 100 ms stays at the refill rate.
        let rl = limiter(10, 1, 0);
        let start = Instant::now();
        for i in 0..200u64 {
            let t = start + Duration::from_millis(100 * i);
            assert!(rl.check_at(ip(), t).allowed, "request {i} denied");
        }
    }

    #[test]
    fn sustained_overrate_accumulates_denials() {
        // 10/sec bucket hit 30 times per second: denials grow every second.
        let rl = limiter(10, 1, 0);
        let start = Instant::now();
        let mut denials_per_sec = Vec::new();
        for sec in 0..3u64 {
            let mut denied = 0;
            for i in 0..30u64 {
                let t = start + Duration::from_secs(sec) + Duration::from_millis(i * 33);
                if !rl.check_at(ip(), t).allowed {
                    denied += 1;
                }
            }
            denials_per_sec.push(denied);
        }
        assert!(denials_per_sec.iter().all(|&d| d > 0));
        assert!(denials_per_sec.iter().sum::<u64>() >= 45);
    }

    #[test]
    fn refill_restores_tokens() {
        let rl = limiter(60, 60, 0); // 1 token/sec
        let now = Instant::now();
        for _ in 0..60 {
            assert!(rl.check_at(ip(), now).allowed);
        }
        assert!(!rl.check_at(ip(), now).allowed);
        // Two seconds later two tokens have accrued.
        let later = now + Duration::from_secs(2);
        assert!(rl.check_at(ip(), later).allowed);
        assert!(rl.check_at(ip(), later).allowed);
        assert!(!rl.check_at(ip(), later).allowed);
    }

    #[test]
    fn buckets_are_per_ip() {
        let rl = limiter(1, 60, 0);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let now = Instant::now();
        assert!(rl.check_at(a, now).allowed);
        assert!(!rl.check_at(a, now).allowed);
        assert!(rl.check_at(b, now).allowed);
    }

    #[test]
    fn sweep_evicts_idle_entries() {
        let rl = limiter(10, 1, 0);
        let now = Instant::now();
        rl.check_at(ip(), now);
        assert_eq!(rl.stats().tracked_ips, 1);
        rl.sweep_at(now + Duration::from_secs(5));
        assert_eq!(rl.stats().tracked_ips, 0);
    }
}
