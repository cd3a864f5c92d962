//! Lightweight Prometheus-compatible metrics for the session layer.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format; the daemon logs the rendering periodically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared by the coordinator, the dialer and the reactor.
pub struct Metrics {
    /// TCP sessions created (counter)
    pub tcp_sessions_total: AtomicU64,
    /// UDP sessions created (counter)
    pub udp_sessions_total: AtomicU64,
    /// Creations refused because the key was already live (counter)
    pub duplicate_sessions_total: AtomicU64,
    /// Creations refused because the directory was full (counter)
    pub refused_sessions_total: AtomicU64,
    /// Sessions abandoned after connect failures (counter)
    pub connect_failures_total: AtomicU64,
    /// Sockets the protector could not mark (counter)
    pub protect_failures_total: AtomicU64,
    /// Client segments dropped as retransmitted duplicates (counter)
    pub duplicate_segments_total: AtomicU64,
    /// Payload bytes written to real sockets (counter)
    pub bytes_to_remote_total: AtomicU64,
    /// Payload bytes read from real sockets (counter)
    pub bytes_from_remote_total: AtomicU64,
    /// Sessions torn down (counter)
    pub closed_sessions_total: AtomicU64,
    /// Live sessions (gauge)
    pub active_sessions: AtomicU64,
    /// Start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            tcp_sessions_total: AtomicU64::new(0),
            udp_sessions_total: AtomicU64::new(0),
            duplicate_sessions_total: AtomicU64::new(0),
            refused_sessions_total: AtomicU64::new(0),
            connect_failures_total: AtomicU64::new(0),
            protect_failures_total: AtomicU64::new(0),
            duplicate_segments_total: AtomicU64::new(0),
            bytes_to_remote_total: AtomicU64::new(0),
            bytes_from_remote_total: AtomicU64::new(0),
            closed_sessions_total: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP vpn_collector_tcp_sessions_total Total TCP sessions created\n\
             # TYPE vpn_collector_tcp_sessions_total counter\n\
             vpn_collector_tcp_sessions_total {}\n\
             # HELP vpn_collector_udp_sessions_total Total UDP sessions created\n\
             # TYPE vpn_collector_udp_sessions_total counter\n\
             vpn_collector_udp_sessions_total {}\n\
             # HELP vpn_collector_duplicate_sessions_total Creations refused for an existing key\n\
             # TYPE vpn_collector_duplicate_sessions_total counter\n\
             vpn_collector_duplicate_sessions_total {}\n\
             # HELP vpn_collector_refused_sessions_total Creations refused at the session limit\n\
             # TYPE vpn_collector_refused_sessions_total counter\n\
             vpn_collector_refused_sessions_total {}\n\
             # HELP vpn_collector_connect_failures_total Sessions abandoned after \
             connect failures\n\
             # TYPE vpn_collector_connect_failures_total counter\n\
             vpn_collector_connect_failures_total {}\n\
             # HELP vpn_collector_protect_failures_total Sockets that could not be protected\n\
             # TYPE vpn_collector_protect_failures_total counter\n\
             vpn_collector_protect_failures_total {}\n\
             # HELP vpn_collector_duplicate_segments_total Client segments dropped as duplicates\n\
             # TYPE vpn_collector_duplicate_segments_total counter\n\
             vpn_collector_duplicate_segments_total {}\n\
             # HELP vpn_collector_bytes_to_remote_total Payload bytes written to real sockets\n\
             # TYPE vpn_collector_bytes_to_remote_total counter\n\
             vpn_collector_bytes_to_remote_total {}\n\
             # HELP vpn_collector_bytes_from_remote_total Payload bytes read from real sockets\n\
             # TYPE vpn_collector_bytes_from_remote_total counter\n\
             vpn_collector_bytes_from_remote_total {}\n\
             # HELP vpn_collector_closed_sessions_total Sessions torn down\n\
             # TYPE vpn_collector_closed_sessions_total counter\n\
             vpn_collector_closed_sessions_total {}\n\
             # HELP vpn_collector_active_sessions Live sessions\n\
             # TYPE vpn_collector_active_sessions gauge\n\
             vpn_collector_active_sessions {}\n\
             # HELP vpn_collector_uptime_seconds Collector uptime in seconds\n\
             # TYPE vpn_collector_uptime_seconds gauge\n\
             vpn_collector_uptime_seconds {}\n",
            self.tcp_sessions_total.load(Ordering::Relaxed),
            self.udp_sessions_total.load(Ordering::Relaxed),
            self.duplicate_sessions_total.load(Ordering::Relaxed),
            self.refused_sessions_total.load(Ordering::Relaxed),
            self.connect_failures_total.load(Ordering::Relaxed),
            self.protect_failures_total.load(Ordering::Relaxed),
            self.duplicate_segments_total.load(Ordering::Relaxed),
            self.bytes_to_remote_total.load(Ordering::Relaxed),
            self.bytes_from_remote_total.load(Ordering::Relaxed),
            self.closed_sessions_total.load(Ordering::Relaxed),
            self.active_sessions.load(Ordering::Relaxed),
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
        m.tcp_sessions_total.fetch_add(3, Ordering::Relaxed);
        m.bytes_to_remote_total.fetch_add(8192, Ordering::Relaxed);
        m.active_sessions.store(2, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("vpn_collector_tcp_sessions_total 3"));
        assert!(output.contains("vpn_collector_bytes_to_remote_total 8192"));
        assert!(output.contains("vpn_collector_active_sessions 2"));
        assert!(output.contains("vpn_collector_refused_sessions_total 0"));
    }

    #[test]
    fn test_metrics_default_zero() {
        let m = Metrics::default();
        assert_eq!(m.udp_sessions_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.duplicate_segments_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.closed_sessions_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_metrics_render_prometheus_format() {
        let m = Metrics::new();
        let output = m.render();
        assert!(output.contains("# TYPE vpn_collector_active_sessions gauge"));
        assert!(output.contains("# TYPE vpn_collector_connect_failures_total counter"));
        assert!(output
            .lines()
            .any(|l| l.starts_with("vpn_collector_uptime_seconds ")));
    }
}
