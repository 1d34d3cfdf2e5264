//! In-process gateway counters exposed as `GET /stats`.
//!
//! All counters are `AtomicU64` incremented inline — no external library,
//! no locks on the hot path. Latency is accumulated as `{sum, min, max,
//! count}`; rates and averages are derived by the caller.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Latency accumulator. `min`/`max` use compare-free `fetch_min`/`fetch_max`;
/// a snapshot with `count == 0` reports zeros.
#[derive(Debug)]
pub struct LatencyStat {
    sum_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
    count: AtomicU64,
}

impl LatencyStat {
    pub fn new() -> Self {
        Self {
            sum_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, elapsed_ms: u64) {
        self.sum_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.min_ms.fetch_min(elapsed_ms, Ordering::Relaxed);
        self.max_ms.fetch_max(elapsed_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Value {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_ms.load(Ordering::Relaxed);
        let min = self.min_ms.load(Ordering::Relaxed);
        let max = self.max_ms.load(Ordering::Relaxed);
        json!({
            "count": count,
            "sum_ms": sum,
            "min_ms": if count == 0 { 0 } else { min },
            "max_ms": max,
            "avg_ms": if count == 0 { 0 } else { sum / count },
        })
    }
}

impl Default for LatencyStat {
    fn default() -> Self {
        Self::new()
    }
}

/// Gateway-wide counters shared across all connections and tasks.
#[derive(Debug, Default)]
pub struct GatewayStats {
    // HTTP pipeline
    pub requests_total: AtomicU64,
    pub requests_2xx: AtomicU64,
    pub requests_4xx: AtomicU64,
    pub requests_5xx: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    /// Currently-open client connections (gauge).
    pub active_connections: AtomicU64,
    pub connections_total: AtomicU64,
    pub connections_rejected: AtomicU64,

    // Admission
    pub ip_denied: AtomicU64,
    pub rate_limited: AtomicU64,
    pub auth_failures: AtomicU64,

    // WebSocket hub
    pub ws_connections: AtomicU64,
    pub ws_messages_in: AtomicU64,
    pub ws_messages_out: AtomicU64,

    // Video pipeline
    pub video_frames_sent: AtomicU64,
    pub video_bytes_sent: AtomicU64,
    pub video_frames_dropped: AtomicU64,

    pub request_latency: LatencyStat,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_response(&self, status: u16, elapsed_ms: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        match status {
            200..=299 => self.requests_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.requests_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => self.requests_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        self.request_latency.record(elapsed_ms);
    }

    /// A coherent copy of every counter. Individual loads are relaxed; the
    /// snapshot is consistent enough for monitoring (counters only grow).
    pub fn snapshot(&self) -> Value {
        json!({
            "requests": {
                "total": self.requests_total.load(Ordering::Relaxed),
                "ok": self.requests_2xx.load(Ordering::Relaxed),
                "client_error": self.requests_4xx.load(Ordering::Relaxed),
                "server_error": self.requests_5xx.load(Ordering::Relaxed),
                "latency": self.request_latency.snapshot(),
            },
            "connections": {
                "active": self.active_connections.load(Ordering::Relaxed),
                "total": self.connections_total.load(Ordering::Relaxed),
                "rejected": self.connections_rejected.load(Ordering::Relaxed),
            },
            "bytes": {
                "in": self.bytes_in.load(Ordering::Relaxed),
                "out": self.bytes_out.load(Ordering::Relaxed),
            },
            "admission": {
                "ip_denied": self.ip_denied.load(Ordering::Relaxed),
                "rate_limited": self.rate_limited.load(Ordering::Relaxed),
                "auth_failures": self.auth_failures.load(Ordering::Relaxed),
            },
            "websocket": {
                "connections": self.ws_connections.load(Ordering::Relaxed),
                "messages_in": self.ws_messages_in.load(Ordering::Relaxed),
                "messages_out": self.ws_messages_out.load(Ordering::Relaxed),
            },
            "video": {
                "frames_sent": self.video_frames_sent.load(Ordering::Relaxed),
                "bytes_sent": self.video_bytes_sent.load(Ordering::Relaxed),
                "frames_dropped": self.video_frames_dropped.load(Ordering::Relaxed),
            },
        })
    }
}

/// Uptime helper used by `/health` and `/stats`.
pub fn uptime_seconds(started_at: Instant) -> u64 {
    started_at.elapsed().as_secs()
}
