use prometheus::core::Collector;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use tracing::warn;

/// Metrics for ingestion pipeline monitoring
#[derive(Clone)]
pub struct IngestMetrics {
    /// Raw messages returned by the bus
    pub messages_polled_total: IntCounter,
    /// Readings acknowledged by the storage cluster
    pub records_written_total: IntCounter,
    /// Messages dropped because they could not be parsed
    pub malformed_messages_total: IntCounter,
    /// Batches the storage cluster rejected or did not acknowledge
    pub batch_write_failures_total: IntCounter,
    /// Successful bus position commits
    pub commits_total: IntCounter,
    /// Storage connection attempts, successful or not
    pub storage_connect_attempts_total: IntCounter,
    /// Latency of acknowledged batch writes
    pub batch_write_duration_seconds: Histogram,
    /// Pipeline lifecycle state (see `PipelineState::as_gauge`)
    pub pipeline_state: IntGauge,
}

impl IngestMetrics {
    /// Create metrics and register them in `registry`.
    ///
    /// Registration failures (duplicate names) are logged and otherwise
    /// ignored so that several pipelines in one process can share the default
    /// registry.
    pub fn new(registry: &Registry) -> Self {
        let messages_polled_total = IntCounter::new(
            "ingest_messages_polled_total",
            "Total number of raw messages returned by the bus",
        )
        .expect("valid metric for ingest_messages_polled_total");

        let records_written_total = IntCounter::new(
            "ingest_records_written_total",
            "Total number of sensor readings written to storage",
        )
        .expect("valid metric for ingest_records_written_total");

        let malformed_messages_total = IntCounter::new(
            "ingest_malformed_messages_total",
            "Total number of messages dropped as malformed",
        )
        .expect("valid metric for ingest_malformed_messages_total");

        let batch_write_failures_total = IntCounter::new(
            "ingest_batch_write_failures_total",
            "Total number of failed storage batch writes",
        )
        .expect("valid metric for ingest_batch_write_failures_total");

        let commits_total = IntCounter::new(
            "ingest_commits_total",
            "Total number of bus position commits",
        )
        .expect("valid metric for ingest_commits_total");

        let storage_connect_attempts_total = IntCounter::new(
            "ingest_storage_connect_attempts_total",
            "Total number of storage connection attempts",
        )
        .expect("valid metric for ingest_storage_connect_attempts_total");

        let batch_write_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ingest_batch_write_duration_seconds",
                "Latency of acknowledged storage batch writes",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )
        .expect("valid metric for ingest_batch_write_duration_seconds");

        let pipeline_state = IntGauge::new(
            "ingest_pipeline_state",
            "Pipeline state (0 = stopped, 1 = connecting, 2 = running, 3 = stopping)",
        )
        .expect("valid metric for ingest_pipeline_state");

        register_all(
            registry,
            vec![
                Box::new(messages_polled_total.clone()),
                Box::new(records_written_total.clone()),
                Box::new(malformed_messages_total.clone()),
                Box::new(batch_write_failures_total.clone()),
                Box::new(commits_total.clone()),
                Box::new(storage_connect_attempts_total.clone()),
                Box::new(batch_write_duration_seconds.clone()),
                Box::new(pipeline_state.clone()),
            ],
        );

        Self {
            messages_polled_total,
            records_written_total,
            malformed_messages_total,
            batch_write_failures_total,
            commits_total,
            storage_connect_attempts_total,
            batch_write_duration_seconds,
            pipeline_state,
        }
    }

    /// Metrics bound to a private registry, for tests and embedded use
    pub fn unregistered() -> Self {
        Self::new(&Registry::new())
    }
}

/// Register each collector, returning how many the registry rejected
fn register_all(registry: &Registry, collectors: Vec<Box<dyn Collector>>) -> usize {
    let mut rejected = 0;
    for collector in collectors {
        let name = collector
            .desc()
            .first()
            .map(|desc| desc.fq_name.clone())
            .unwrap_or_default();
        if let Err(e) = registry.register(collector) {
            warn!(metric = %name, error = %e, "Failed to register metric");
            rejected += 1;
        }
    }
    rejected
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new(prometheus::default_registry())
    }
}
