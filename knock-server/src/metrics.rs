//! Lightweight Prometheus-compatible metrics for the knock server.
//!
//! Uses atomic counters for lock-free instrumentation. Every rejected
//! handshake and every dropped connection is counted even when its log line
//! is at a low level.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight Prometheus-compatible metrics for the knock server.
pub struct Metrics {
    /// Handshakes that produced a grant (counter)
    pub handshakes_accepted_total: AtomicU64,
    /// Handshakes rejected for any reason (counter)
    pub handshakes_rejected_total: AtomicU64,
    /// Datagrams that failed decryption (counter)
    pub decrypt_failures_total: AtomicU64,
    /// Duplicate nonces seen, possible replay attacks (counter)
    pub replays_detected_total: AtomicU64,
    /// Connections admitted and proxied (counter)
    pub connections_admitted_total: AtomicU64,
    /// Unauthorized connections dropped (counter)
    pub connections_dropped_total: AtomicU64,
    /// Authorized connections refused by max_connections (counter)
    pub connections_limited_total: AtomicU64,
    /// Backend dial failures (counter)
    pub dial_failures_total: AtomicU64,
    /// Currently proxied connections (gauge)
    pub active_connections: AtomicU64,
    /// Bytes copied in both directions (counter)
    pub bytes_forwarded_total: AtomicU64,
    /// Server start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            handshakes_accepted_total: AtomicU64::new(0),
            handshakes_rejected_total: AtomicU64::new(0),
            decrypt_failures_total: AtomicU64::new(0),
            replays_detected_total: AtomicU64::new(0),
            connections_admitted_total: AtomicU64::new(0),
            connections_dropped_total: AtomicU64::new(0),
            connections_limited_total: AtomicU64::new(0),
            dial_failures_total: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            bytes_forwarded_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP knock_handshakes_accepted_total Handshakes that produced a grant\n\
             # TYPE knock_handshakes_accepted_total counter\n\
             knock_handshakes_accepted_total {}\n\
             # HELP knock_handshakes_rejected_total Handshakes rejected for any reason\n\
             # TYPE knock_handshakes_rejected_total counter\n\
             knock_handshakes_rejected_total {}\n\
             # HELP knock_decrypt_failures_total Datagrams that failed decryption\n\
             # TYPE knock_decrypt_failures_total counter\n\
             knock_decrypt_failures_total {}\n\
             # HELP knock_replays_detected_total Duplicate handshake nonces\n\
             # TYPE knock_replays_detected_total counter\n\
             knock_replays_detected_total {}\n\
             # HELP knock_connections_admitted_total Connections admitted and proxied\n\
             # TYPE knock_connections_admitted_total counter\n\
             knock_connections_admitted_total {}\n\
             # HELP knock_connections_dropped_total Unauthorized connections dropped\n\
             # TYPE knock_connections_dropped_total counter\n\
             knock_connections_dropped_total {}\n\
             # HELP knock_connections_limited_total Connections refused by max_connections\n\
             # TYPE knock_connections_limited_total counter\n\
             knock_connections_limited_total {}\n\
             # HELP knock_dial_failures_total Backend dial failures\n\
             # TYPE knock_dial_failures_total counter\n\
             knock_dial_failures_total {}\n\
             # HELP knock_active_connections Currently proxied connections\n\
             # TYPE knock_active_connections gauge\n\
             knock_active_connections {}\n\
             # HELP knock_bytes_forwarded_total Bytes copied in both directions\n\
             # TYPE knock_bytes_forwarded_total counter\n\
             knock_bytes_forwarded_total {}\n\
             # HELP knock_uptime_seconds Server uptime in seconds\n\
             # TYPE knock_uptime_seconds gauge\n\
             knock_uptime_seconds {}\n",
            self.handshakes_accepted_total.load(Ordering::Relaxed),
            self.handshakes_rejected_total.load(Ordering::Relaxed),
            self.decrypt_failures_total.load(Ordering::Relaxed),
            self.replays_detected_total.load(Ordering::Relaxed),
            self.connections_admitted_total.load(Ordering::Relaxed),
            self.connections_dropped_total.load(Ordering::Relaxed),
            self.connections_limited_total.load(Ordering::Relaxed),
            self.dial_failures_total.load(Ordering::Relaxed),
            self.active_connections.load(Ordering::Relaxed),
            self.bytes_forwarded_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
