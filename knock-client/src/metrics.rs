//! Prometheus-compatible counters for the knock client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    /// Handshake datagrams sent (counter)
    pub handshakes_sent_total: AtomicU64,
    /// Handshakes that failed to resolve, seal or send (counter)
    pub handshake_failures_total: AtomicU64,
    /// Client start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            handshakes_sent_total: AtomicU64::new(0),
            handshake_failures_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        format!(
            "# HELP knock_client_handshakes_sent_total Handshake datagrams sent\n\
             # TYPE knock_client_handshakes_sent_total counter\n\
             knock_client_handshakes_sent_total {}\n\
             # HELP knock_client_handshake_failures_total Handshakes that could not be sent\n\
             # TYPE knock_client_handshake_failures_total counter\n\
             knock_client_handshake_failures_total {}\n\
             # HELP knock_client_uptime_seconds Client uptime in seconds\n\
             # TYPE knock_client_uptime_seconds gauge\n\
             knock_client_uptime_seconds {}\n",
            self.handshakes_sent_total.load(Ordering::Relaxed),
            self.handshake_failures_total.load(Ordering::Relaxed),
            self.start_time.elapsed().as_secs(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_format() {
        let m = Metrics::new();
        m.handshakes_sent_total.fetch_add(7, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("knock_client_handshakes_sent_total 7"));
        assert!(output.contains("knock_client_handshake_failures_total 0"));
        assert!(output.contains("# TYPE knock_client_uptime_seconds gauge"));
    }
}
