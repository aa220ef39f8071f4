use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Stage labels used by `inference_log_dropped_total`.
pub const DROP_STAGES: [&str; 5] = ["queue", "material", "session", "encode", "publish"];

#[derive(Clone)]
pub struct AuditMetrics {
    pub registry: Registry,
    pub enqueued: IntCounter,
    pub skipped: IntCounter,
    pub published: IntCounter,
    pub dropped: IntCounterVec,
    pub in_flight: IntGauge,
}

impl AuditMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let enqueued = IntCounter::new(
            "inference_log_enqueued_total",
            "Inference log records handed to the background publisher",
        )?;
        let skipped = IntCounter::new(
            "inference_log_skipped_total",
            "Inference log requests for servings without a topic",
        )?;
        let published = IntCounter::new(
            "inference_log_published_total",
            "Inference log records handed to the broker client",
        )?;
        let dropped = IntCounterVec::new(
            Opts::new(
                "inference_log_dropped_total",
                "Inference log records dropped, by the stage that failed",
            ),
            &["stage"],
        )?;
        let in_flight = IntGauge::new(
            "inference_log_in_flight",
            "Inference log publish attempts currently running",
        )?;
        registry.register(Box::new(enqueued.clone()))?;
        registry.register(Box::new(skipped.clone()))?;
        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        // Pre-create every stage so dashboards see zeroes rather than gaps.
        for stage in DROP_STAGES {
            let _ = dropped.with_label_values(&[stage]);
        }
        Ok(Self { registry, enqueued, skipped, published, dropped, in_flight })
    }

    pub fn dropped_at(&self, stage: &str) -> u64 {
        self.dropped.with_label_values(&[stage]).get()
    }

    /// Prometheus text exposition of everything in the registry.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
