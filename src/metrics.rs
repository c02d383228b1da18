//! Lightweight Prometheus-compatible metrics for the ingest server.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight Prometheus-compatible metrics for the ingest server.
pub struct Metrics {
    /// Connections currently handshaking or serving (gauge)
    pub active_connections: AtomicU64,
    /// Total connections accepted (counter)
    pub connections_accepted_total: AtomicU64,
    /// Total handshakes that reached Established (counter)
    pub handshakes_completed_total: AtomicU64,
    /// Total handshakes that failed (counter)
    pub handshakes_failed_total: AtomicU64,
    /// Total accept calls that failed (counter)
    pub accept_errors_total: AtomicU64,
    /// Total connections dropped because no worker could be spawned (counter)
    pub spawn_failures_total: AtomicU64,
    /// Total payload bytes received after the handshake (counter)
    pub bytes_received_total: AtomicU64,
    /// Server start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            connections_accepted_total: AtomicU64::new(0),
            handshakes_completed_total: AtomicU64::new(0),
            handshakes_failed_total: AtomicU64::new(0),
            accept_errors_total: AtomicU64::new(0),
            spawn_failures_total: AtomicU64::new(0),
            bytes_received_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP avserv_active_connections Connections currently handshaking or serving\n\
             # TYPE avserv_active_connections gauge\n\
             avserv_active_connections {}\n\
             # HELP avserv_connections_accepted_total Total connections accepted\n\
             # TYPE avserv_connections_accepted_total counter\n\
             avserv_connections_accepted_total {}\n\
             # HELP avserv_handshakes_completed_total Total handshakes established\n\
             # TYPE avserv_handshakes_completed_total counter\n\
             avserv_handshakes_completed_total {}\n\
             # HELP avserv_handshakes_failed_total Total handshakes failed\n\
             # TYPE avserv_handshakes_failed_total counter\n\
             avserv_handshakes_failed_total {}\n\
             # HELP avserv_accept_errors_total Total accept failures\n\
             # TYPE avserv_accept_errors_total counter\n\
             avserv_accept_errors_total {}\n\
             # HELP avserv_spawn_failures_total Total connections dropped for lack of a worker\n\
             # TYPE avserv_spawn_failures_total counter\n\
             avserv_spawn_failures_total {}\n\
             # HELP avserv_bytes_received_total Total payload bytes received\n\
             # TYPE avserv_bytes_received_total counter\n\
             avserv_bytes_received_total {}\n\
             # HELP avserv_uptime_seconds Server uptime in seconds\n\
             # TYPE avserv_uptime_seconds gauge\n\
             avserv_uptime_seconds {}\n",
            self.active_connections.load(Ordering::Relaxed),
            self.connections_accepted_total.load(Ordering::Relaxed),
            self.handshakes_completed_total.load(Ordering::Relaxed),
            self.handshakes_failed_total.load(Ordering::Relaxed),
            self.accept_errors_total.load(Ordering::Relaxed),
            self.spawn_failures_total.load(Ordering::Relaxed),
            self.bytes_received_total.load(Ordering::Relaxed),
            uptime,
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
        m.handshakes_completed_total.fetch_add(5, Ordering::Relaxed);
        m.bytes_received_total.fetch_add(1024, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("avserv_handshakes_completed_total 5"));
        assert!(output.contains("avserv_bytes_received_total 1024"));
        assert!(output.contains("avserv_active_connections 0"));
        assert!(output.contains("# TYPE avserv_uptime_seconds gauge"));
    }

    #[test]
    fn test_metrics_default_zero() {
        let m = Metrics::default();
        assert_eq!(m.active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(m.connections_accepted_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.handshakes_completed_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.handshakes_failed_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.accept_errors_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.spawn_failures_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.bytes_received_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_metrics_counter_increments() {
        let m = Metrics::new();
        m.connections_accepted_total.fetch_add(3, Ordering::Relaxed);
        m.handshakes_failed_total.fetch_add(2, Ordering::Relaxed);
        m.accept_errors_total.fetch_add(1, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("avserv_connections_accepted_total 3"));
        assert!(output.contains("avserv_handshakes_failed_total 2"));
        assert!(output.contains("avserv_accept_errors_total 1"));
    }

    #[test]
    fn test_metrics_render_prometheus_format() {
        let m = Metrics::new();
        let output = m.render();
        for name in [
            "avserv_connections_accepted_total",
            "avserv_handshakes_completed_total",
            "avserv_handshakes_failed_total",
            "avserv_accept_errors_total",
            "avserv_spawn_failures_total",
            "avserv_bytes_received_total",
        ] {
            assert!(output.contains(&format!("# HELP {}", name)));
            assert!(output.contains(&format!("# TYPE {} counter", name)));
        }
        assert!(output.contains("# TYPE avserv_active_connections gauge"));
        assert!(output
            .lines()
            .any(|l| l.starts_with("avserv_uptime_seconds ")));
    }
}
