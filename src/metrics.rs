//! Metrics surface (C9): atomic counters/gauges, exposed over `GET /metrics` in a
//! Prometheus-like line format.
//!
//! Grounded on `yuanjiao014278andrewjones-nexus-sdk`'s `toolkit-rust/src/runtime.rs`
//! (`warp::serve(routes).run(addr)`, `warp::get().and(warp::path(...))` route composition) —
//! simplified from that crate's multi-route tool bootstrap to the single `/metrics` route the
//! spec calls for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use warp::Filter;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide metrics, constructed once by `Server::new` and shared via `Arc`.
#[derive(Debug, Default)]
pub struct Metrics {
    pub frames_received_handshake: Counter,
    pub frames_received_secure: Counter,
    pub frames_sent_handshake: Counter,
    pub frames_sent_secure: Counter,
    pub decrypt_failures: Counter,
    pub replay_rejections: Counter,
    pub retransmissions: Counter,
    pub retries_exhausted: Counter,
    pub ai_requests: Counter,
    pub ai_rejected: Counter,
    pub bytes_in: Counter,
    pub bytes_out: Counter,

    pub active_sessions: Gauge,
    pub authenticated_sessions: Gauge,
    pub rooms: Gauge,
    pub members: Gauge,
    pub retry_queue_depth: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render all counters/gauges in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        macro_rules! counter {
            ($name:expr, $field:expr) => {
                out.push_str(&format!("# TYPE {} counter\n{} {}\n", $name, $name, $field.get()));
            };
        }
        macro_rules! gauge {
            ($name:expr, $field:expr) => {
                out.push_str(&format!("# TYPE {} gauge\n{} {}\n", $name, $name, $field.get()));
            };
        }

        counter!("chat_frames_received_handshake_total", self.frames_received_handshake);
        counter!("chat_frames_received_secure_total", self.frames_received_secure);
        counter!("chat_frames_sent_handshake_total", self.frames_sent_handshake);
        counter!("chat_frames_sent_secure_total", self.frames_sent_secure);
        counter!("chat_decrypt_failures_total", self.decrypt_failures);
        counter!("chat_replay_rejections_total", self.replay_rejections);
        counter!("chat_retransmissions_total", self.retransmissions);
        counter!("chat_retries_exhausted_total", self.retries_exhausted);
        counter!("chat_ai_requests_total", self.ai_requests);
        counter!("chat_ai_rejected_total", self.ai_rejected);
        counter!("chat_bytes_in_total", self.bytes_in);
        counter!("chat_bytes_out_total", self.bytes_out);

        gauge!("chat_active_sessions", self.active_sessions);
        gauge!("chat_authenticated_sessions", self.authenticated_sessions);
        gauge!("chat_rooms", self.rooms);
        gauge!("chat_members", self.members);
        gauge!("chat_retry_queue_depth", self.retry_queue_depth);

        out
    }
}

/// Serve `GET /metrics` on `addr` until the process exits. Spawned as its own task by
/// `Server::run`.
pub async fn serve(addr: std::net::SocketAddr, metrics: Arc<Metrics>) {
    let route = warp::path("metrics").and(warp::get()).map(move || {
        warp::reply::with_header(
            metrics.render(),
            "Content-Type",
            "text/plain; version=0.0.4",
        )
    });

    warp::serve(route).run(addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_all_metrics() {
        let metrics = Metrics::new();
        metrics.frames_received_secure.inc();
        metrics.active_sessions.set(3);
        let rendered = metrics.render();
        assert!(rendered.contains("chat_frames_received_secure_total 1"));
        assert!(rendered.contains("chat_active_sessions 3"));
    }
}
