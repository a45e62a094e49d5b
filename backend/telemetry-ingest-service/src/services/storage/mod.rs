//! Storage writer for sensor readings
//!
//! The writer owns the cluster connection lifecycle: it connects with an
//! unbounded fixed-backoff retry (cancellable through the shutdown channel),
//! provisions the keyspace and table idempotently on every successful connect,
//! prepares the insert once and then writes whole batches at LOCAL_QUORUM.
//!
//! The driver is reached through [`StorageBackend`] / [`StorageSession`] so the
//! lifecycle can be exercised without a live cluster.

pub mod cassandra;
pub mod schema;

use async_trait::async_trait;
use resilience::{with_optional_timeout, with_retry_until, RetryConfig, RetryError, TimeoutError};
use scylla::statement::Consistency;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::CassandraConfig;
use crate::error::StorageError;
use crate::metrics::IngestMetrics;
use crate::models::SensorReading;

pub use cassandra::{ScyllaBackend, ScyllaSession};
pub use schema::{Replication, SensorSchema};

/// Consistency of every batch write. Never lowered at runtime.
pub const WRITE_CONSISTENCY: Consistency = Consistency::LocalQuorum;

/// Factory for fresh cluster sessions
#[async_trait]
pub trait StorageBackend: Send + Sync {
    type Session: StorageSession;

    /// Open a brand-new session. Called once per connection attempt.
    async fn open(&self) -> Result<Self::Session, StorageError>;
}

/// One established cluster session
#[async_trait]
pub trait StorageSession: Send + Sync {
    type Prepared: Send + Sync;

    /// Run a schema statement
    async fn execute(&self, cql: &str) -> Result<(), StorageError>;

    async fn use_keyspace(&self, keyspace: &str) -> Result<(), StorageError>;

    async fn prepare(&self, cql: &str) -> Result<Self::Prepared, StorageError>;

    /// Send one atomic batch holding `statement` once per reading and wait for
    /// the acknowledgment
    async fn execute_batch(
        &self,
        statement: &Self::Prepared,
        readings: &[SensorReading],
        consistency: Consistency,
    ) -> Result<(), StorageError>;
}

struct Connection<S: StorageSession> {
    session: S,
    insert: S::Prepared,
}

/// Writer settings derived from [`CassandraConfig`]
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub connect_backoff: Duration,
    pub connect_max_attempts: Option<u32>,
    pub write_timeout: Option<Duration>,
}

impl WriterOptions {
    pub fn from_config(config: &CassandraConfig) -> Self {
        Self {
            connect_backoff: config.connect_backoff,
            connect_max_attempts: config.connect_max_attempts,
            write_timeout: config.write_timeout,
        }
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig::fixed(self.connect_backoff).with_max_retries(
            self.connect_max_attempts
                .map(|attempts| attempts.saturating_sub(1)),
        )
    }
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            connect_backoff: Duration::from_secs(2),
            connect_max_attempts: None,
            write_timeout: None,
        }
    }
}

/// Batched, idempotently provisioned writer for [`SensorReading`]s
pub struct StorageWriter<B: StorageBackend> {
    backend: B,
    schema: SensorSchema,
    options: WriterOptions,
    metrics: IngestMetrics,
    connection: Option<Connection<B::Session>>,
}

impl<B: StorageBackend> StorageWriter<B> {
    pub fn new(
        backend: B,
        schema: SensorSchema,
        options: WriterOptions,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            backend,
            schema,
            options,
            metrics,
            connection: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn schema(&self) -> &SensorSchema {
        &self.schema
    }

    /// Connect, provision the schema and prepare the insert.
    ///
    /// Retries with a fixed backoff until it succeeds, the configured attempt
    /// bound is reached, or `shutdown` turns `true`. Every attempt opens a new
    /// session; a session from a failed attempt is dropped, never reused.
    pub async fn connect(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), StorageError> {
        if self.connection.is_some() {
            return Ok(());
        }

        info!(
            keyspace = %self.schema.keyspace,
            table = %self.schema.table,
            "Connecting to Cassandra"
        );

        let this = &*self;
        let connection = with_retry_until(self.options.retry_config(), shutdown, || {
            this.attempt_connect()
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => StorageError::ConnectCancelled,
            RetryError::MaxRetriesExceeded { last_error, .. } => last_error,
        })?;

        self.connection = Some(connection);
        info!(keyspace = %self.schema.keyspace, "Connected to Cassandra");
        Ok(())
    }

    async fn attempt_connect(&self) -> Result<Connection<B::Session>, StorageError> {
        self.metrics.storage_connect_attempts_total.inc();

        let session = self.backend.open().await?;
        provision_schema(&session, &self.schema).await?;
        session.use_keyspace(&self.schema.keyspace).await?;
        let insert = session.prepare(&self.schema.insert()).await?;

        Ok(Connection { session, insert })
    }

    /// Write `readings` as one LOCAL_QUORUM batch and wait for the acknowledgment.
    ///
    /// A failed batch is not retried here; the caller decides what happens to it.
    pub async fn write_batch(&self, readings: &[SensorReading]) -> Result<(), StorageError> {
        let connection = self.connection.as_ref().ok_or(StorageError::Unavailable)?;
        if readings.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let outcome = with_optional_timeout(
            self.options.write_timeout,
            connection
                .session
                .execute_batch(&connection.insert, readings, WRITE_CONSISTENCY),
        )
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(TimeoutError::Elapsed(limit)) => Err(StorageError::WriteTimeout(limit)),
        };

        match result {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.metrics
                    .batch_write_duration_seconds
                    .observe(elapsed.as_secs_f64());
                self.metrics
                    .records_written_total
                    .inc_by(readings.len() as u64);
                debug!(records = readings.len(), ?elapsed, "Batch acknowledged");
                Ok(())
            }
            Err(e) => {
                self.metrics.batch_write_failures_total.inc();
                warn!(records = readings.len(), error = %e, "Batch write failed");
                Err(e)
            }
        }
    }

    /// Release the session. Safe to call when never connected.
    pub fn close(&mut self) {
        if self.connection.take().is_some() {
            info!("Cassandra session closed");
        }
    }
}

/// Create the keyspace and table when absent. Safe to run on every startup.
pub async fn provision_schema<S: StorageSession>(
    session: &S,
    schema: &SensorSchema,
) -> Result<(), StorageError> {
    debug!(
        keyspace = %schema.keyspace,
        replication = ?schema.replication,
        "Provisioning schema"
    );
    session.execute(&schema.create_keyspace()).await?;
    session.execute(&schema.create_table()).await?;
    Ok(())
}
