use std::sync::atomic::{AtomicUsize, Ordering};

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref TUNERS_ACTIVE: IntGauge = register_int_gauge!(
        "tvgate_tuners_active",
        "Number of live upstream sessions currently held open"
    )
    .unwrap();
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "tvgate_connections_active",
        "Number of client writers currently holding a socket"
    )
    .unwrap();
    pub static ref RING_LAG_DROPS: IntCounterVec = register_int_counter_vec!(
        "tvgate_ring_lag_dropped_packets",
        "Packets skipped by forced cursor advances, per channel",
        &["channel_id"]
    )
    .unwrap();
    pub static ref CACHE_EVICTIONS: IntCounter = register_int_counter!(
        "tvgate_cache_evicted_blobs",
        "Cache blobs removed by LRU eviction"
    )
    .unwrap();
    pub static ref UPSTREAM_RETRIES: IntCounterVec = register_int_counter_vec!(
        "tvgate_upstream_retries",
        "Upstream fetch attempts beyond the first, per channel",
        &["channel_id"]
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Process-wide status counters behind atomics. The `/api/` status command
/// reads these directly; the prometheus gauges above mirror them for
/// scraping.
#[derive(Debug, Default)]
pub struct StatusCounters {
    tuners: AtomicUsize,
    connections: AtomicUsize,
}

impl StatusCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tuner_opened(&self) {
        self.tuners.fetch_add(1, Ordering::AcqRel);
        TUNERS_ACTIVE.inc();
    }

    pub fn tuner_closed(&self) {
        let prev = self
            .tuners
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        if prev.is_ok() {
            TUNERS_ACTIVE.dec();
        }
    }

    pub fn client_connected(&self) {
        self.connections.fetch_add(1, Ordering::AcqRel);
        CONNECTIONS_ACTIVE.inc();
    }

    pub fn client_disconnected(&self) {
        let prev = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        if prev.is_ok() {
            CONNECTIONS_ACTIVE.dec();
        }
    }

    pub fn tuners_active(&self) -> usize {
        self.tuners.load(Ordering::Acquire)
    }

    pub fn connections_active(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_open_close() {
        let c = StatusCounters::new();
        c.tuner_opened();
        c.tuner_opened();
        c.client_connected();
        assert_eq!(c.tuners_active(), 2);
        assert_eq!(c.connections_active(), 1);

        c.tuner_closed();
        c.client_disconnected();
        assert_eq!(c.tuners_active(), 1);
        assert_eq!(c.connections_active(), 0);
    }

    #[test]
    fn test_counters_never_underflow() {
        let c = StatusCounters::new();
        c.tuner_closed();
        c.client_disconnected();
        assert_eq!(c.tuners_active(), 0);
        assert_eq!(c.connections_active(), 0);
    }
}
