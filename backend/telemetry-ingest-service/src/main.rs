//! Telemetry ingestion worker
//!
//! Reads sensor readings from Kafka and writes them to Cassandra. Exits with a
//! non-zero status when a batch cannot be written, so the orchestrator restart
//! redelivers the uncommitted batch.
//!
//! Environment variables (defaults in parentheses):
//! - KAFKA_BOOTSTRAP (localhost:9092), KAFKA_TOPIC (sensor-data),
//!   KAFKA_GROUP_ID (cassandra-consumer)
//! - CASSANDRA_HOSTS (127.0.0.1), CASSANDRA_PORT (9042),
//!   CASSANDRA_KEYSPACE (iot_demo), CASSANDRA_TABLE (sensor_data)
//! - CASSANDRA_BATCH_SIZE (100), KAFKA_POLL_TIMEOUT_MS (1000)
//! - APP_HOST (0.0.0.0), PORT (8080), LOG_FORMAT (text | json)

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use prometheus::Registry;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use telemetry_ingest_service::config::Config;
use telemetry_ingest_service::health::{self, HealthState};
use telemetry_ingest_service::metrics::IngestMetrics;
use telemetry_ingest_service::services::{
    KafkaSourceReader, Pipeline, ScyllaBackend, SensorSchema, StorageWriter, WriterOptions,
};

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,telemetry_ingest_service=debug"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env();
    init_tracing(config.as_ref().map(|c| c.app.json_logs).unwrap_or(false));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e).context("Failed to load configuration");
        }
    };

    info!(
        brokers = %config.kafka.brokers,
        topic = %config.kafka.topic,
        group_id = %config.kafka.group_id,
        cassandra = ?config.cassandra.contact_points(),
        keyspace = %config.cassandra.keyspace,
        table = %config.cassandra.table,
        batch_size = config.pipeline.batch_size,
        "Starting telemetry-ingest-service"
    );

    let registry = Registry::new();
    #[cfg(target_os = "linux")]
    {
        use prometheus::process_collector::ProcessCollector;
        if let Err(e) = registry.register(Box::new(ProcessCollector::for_self())) {
            warn!("Failed to register process collector: {}", e);
        }
    }
    let metrics = IngestMetrics::new(&registry);

    // Shutdown flag shared by the connect retry loop and the processing loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let source = KafkaSourceReader::new(config.kafka.clone());
    let writer = StorageWriter::new(
        ScyllaBackend::from_config(&config.cassandra),
        SensorSchema::from_config(&config.cassandra),
        WriterOptions::from_config(&config.cassandra),
        metrics.clone(),
    );
    let mut pipeline = Pipeline::new(source, writer, config.pipeline.clone(), metrics);

    let http_addr = format!("{}:{}", config.app.host, config.app.http_port);
    let health_state = web::Data::new(HealthState::new(pipeline.subscribe_state(), registry));
    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(health_state.clone())
            .configure(health::configure)
    })
    .workers(1)
    .disable_signals()
    .bind(&http_addr)
    .with_context(|| format!("Failed to bind HTTP server on {}", http_addr))?
    .run();
    let http_handle = http_server.handle();

    let mut join_set = JoinSet::new();
    join_set.spawn(async move {
        http_server
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))
    });
    info!("HTTP health server listening on http://{}", http_addr);

    let result = pipeline.run(shutdown_rx).await;

    http_handle.stop(true).await;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{:#}", e),
            Err(e) => warn!("HTTP server task panicked: {}", e),
        }
    }

    match result {
        Ok(()) => {
            info!("telemetry-ingest-service stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Ingestion pipeline failed");
            Err(e).context("Ingestion pipeline failed")
        }
    }
}
