//! Prometheus metrics registry exposed at `GET /metrics` (spec.md §4.4).
//!
//! The teacher has no metrics surface of its own (it is an embedded
//! library, not a service); this follows the pack's established shape for
//! a service-owned `prometheus::Registry` built once at startup and handed
//! to every component that needs to record something (the `vector`/
//! `estuary-flow` manifests both depend on `prometheus` for exactly this).

use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub logs_received_total: IntCounter,
    pub logs_dropped_total: IntCounter,
    pub bytes_written_total: IntCounter,
    pub disk_usage_bytes: IntGauge,
    pub rotations_total: IntCounterVec,
    pub rotation_errors_total: IntCounter,
    pub redactions_total: IntCounterVec,
    pub writer_queue_length: IntGauge,
    pub parse_fallback_total: IntCounter,
    build_info: Gauge,
}

impl Metrics {
    pub fn new(version: &str) -> Self {
        let registry = Registry::new();

        let logs_received_total =
            IntCounter::new("logs_received_total", "total log lines accepted by the ingest server").unwrap();
        let logs_dropped_total =
            IntCounter::new("logs_dropped_total", "total log lines dropped due to backpressure").unwrap();
        let bytes_written_total =
            IntCounter::new("bytes_written_total", "total uncompressed bytes written to shards").unwrap();
        let disk_usage_bytes =
            IntGauge::new("disk_usage_bytes", "current sum of on-disk shard sizes").unwrap();
        let rotations_total = IntCounterVec::new(
            Opts::new("rotations_total", "total shard rotations"),
            &["reason"],
        )
        .unwrap();
        let rotation_errors_total =
            IntCounter::new("rotation_errors_total", "total rotator I/O or compression failures").unwrap();
        let redactions_total = IntCounterVec::new(
            Opts::new("redactions_total", "total substitutions made per redaction pattern"),
            &["pattern"],
        )
        .unwrap();
        let writer_queue_length =
            IntGauge::new("writer_queue_length", "current depth of the writer's bounded queue").unwrap();
        let parse_fallback_total = IntCounter::new(
            "parse_fallback_total",
            "total push values whose timestamp failed to parse and fell back to receive time",
        )
        .unwrap();
        let build_info = Gauge::with_opts(
            Opts::new("build_info", "static build metadata, always 1").const_label("version", version),
        )
        .unwrap();
        build_info.set(1.0);

        for c in [&logs_received_total, &logs_dropped_total, &bytes_written_total, &rotation_errors_total, &parse_fallback_total] {
            registry.register(Box::new(c.clone())).unwrap();
        }
        for g in [&disk_usage_bytes, &writer_queue_length] {
            registry.register(Box::new(g.clone())).unwrap();
        }
        registry.register(Box::new(rotations_total.clone())).unwrap();
        registry.register(Box::new(redactions_total.clone())).unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();

        Metrics {
            registry,
            logs_received_total,
            logs_dropped_total,
            bytes_written_total,
            disk_usage_bytes,
            rotations_total,
            rotation_errors_total,
            redactions_total,
            writer_queue_length,
            parse_fallback_total,
            build_info,
        }
    }

    /// Renders the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&families).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_series() {
        let m = Metrics::new("0.1.0");
        m.logs_received_total.inc();
        m.rotations_total.with_label_values(&["size"]).inc();
        let text = m.render();
        assert!(text.contains("logs_received_total 1"));
        assert!(text.contains("rotations_total"));
        assert!(text.contains("build_info"));
    }
}
