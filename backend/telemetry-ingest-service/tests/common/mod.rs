//! In-memory bus and cluster used by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use scylla::statement::Consistency;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use telemetry_ingest_service::config::PipelineConfig;
use telemetry_ingest_service::error::{SourceError, StorageError};
use telemetry_ingest_service::metrics::IngestMetrics;
use telemetry_ingest_service::models::SensorReading;
use telemetry_ingest_service::services::{
    BatchSource, Pipeline, RawMessage, Replication, SensorSchema, StorageBackend, StorageSession,
    StorageWriter, WriterOptions,
};

pub const TOPIC: &str = "sensor-data";

pub fn reading_json(sensor_id: &str, timestamp: &str, value: f64) -> Vec<u8> {
    serde_json::json!({
        "sensor_id": sensor_id,
        "timestamp": timestamp,
        "value": value,
    })
    .to_string()
    .into_bytes()
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BusState {
    log: Vec<Option<Vec<u8>>>,
    /// Next offset the group resumes from
    committed: i64,
    commit_calls: usize,
}

/// Single-partition topic with one consumer group
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn publish(&self, payload: impl Into<Vec<u8>>) {
        self.state.lock().unwrap().log.push(Some(payload.into()));
    }

    pub fn publish_tombstone(&self) {
        self.state.lock().unwrap().log.push(None);
    }

    pub fn committed(&self) -> i64 {
        self.state.lock().unwrap().committed
    }

    pub fn commit_calls(&self) -> usize {
        self.state.lock().unwrap().commit_calls
    }

    /// A fresh group member, as after a process restart
    pub fn reader(&self) -> MemorySource {
        MemorySource {
            bus: self.clone(),
            cursor: None,
            uncommitted_end: None,
            stopped: false,
        }
    }
}

pub struct MemorySource {
    bus: MemoryBus,
    cursor: Option<i64>,
    uncommitted_end: Option<i64>,
    pub stopped: bool,
}

#[async_trait]
impl BatchSource for MemorySource {
    async fn start(&mut self) -> Result<(), SourceError> {
        self.cursor = Some(self.bus.committed());
        self.stopped = false;
        Ok(())
    }

    async fn poll_batch(
        &mut self,
        max_wait: Duration,
        max_records: usize,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let cursor = self.cursor.ok_or(SourceError::NotStarted)?;

        let batch: Vec<RawMessage> = {
            let state = self.bus.state.lock().unwrap();
            state
                .log
                .iter()
                .enumerate()
                .skip(cursor as usize)
                .take(max_records)
                .map(|(offset, payload)| RawMessage {
                    topic: TOPIC.to_string(),
                    partition: 0,
                    offset: offset as i64,
                    payload: payload.clone(),
                })
                .collect()
        };

        if batch.is_empty() {
            tokio::time::sleep(max_wait).await;
            return Ok(batch);
        }

        let end = cursor + batch.len() as i64;
        self.cursor = Some(end);
        self.uncommitted_end = Some(end);
        Ok(batch)
    }

    async fn commit(&mut self) -> Result<(), SourceError> {
        if self.cursor.is_none() {
            return Err(SourceError::NotStarted);
        }
        if let Some(end) = self.uncommitted_end.take() {
            let mut state = self.bus.state.lock().unwrap();
            state.committed = state.committed.max(end);
            state.commit_calls += 1;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SourceError> {
        self.cursor = None;
        self.uncommitted_end = None;
        self.stopped = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ClusterState {
    open_failures: Option<u32>,
    write_failures: u32,
    write_delay: Option<Duration>,
    opens: u32,
    statements: Vec<String>,
    keyspaces: HashSet<String>,
    tables: HashSet<String>,
    used_keyspace: Option<String>,
    rows: BTreeMap<(String, i64), f64>,
    batches: Vec<(usize, Consistency)>,
    writes_started: usize,
}

/// Cluster that behaves like Cassandra for the statements the writer issues:
/// CREATE without IF NOT EXISTS fails on an existing object and inserts are
/// upserts keyed by (sensor_id, timestamp).
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    /// Fail the next `n` connection attempts
    pub fn fail_opens(&self, n: u32) {
        self.state.lock().unwrap().open_failures = Some(n);
    }

    pub fn unreachable(&self) {
        self.state.lock().unwrap().open_failures = Some(u32::MAX);
    }

    /// Reject the next `n` batches
    pub fn fail_writes(&self, n: u32) {
        self.state.lock().unwrap().write_failures = n;
    }

    pub fn delay_writes(&self, delay: Duration) {
        self.state.lock().unwrap().write_delay = Some(delay);
    }

    pub fn opens(&self) -> u32 {
        self.state.lock().unwrap().opens
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn statements_starting_with(&self, prefix: &str) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.starts_with(prefix))
            .count()
    }

    pub fn rows(&self) -> BTreeMap<(String, i64), f64> {
        self.state.lock().unwrap().rows.clone()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }

    pub fn batches(&self) -> Vec<(usize, Consistency)> {
        self.state.lock().unwrap().batches.clone()
    }

    pub fn writes_started(&self) -> usize {
        self.state.lock().unwrap().writes_started
    }

    pub fn used_keyspace(&self) -> Option<String> {
        self.state.lock().unwrap().used_keyspace.clone()
    }
}

#[async_trait]
impl StorageBackend for FakeCluster {
    type Session = FakeSession;

    async fn open(&self) -> Result<FakeSession, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        if let Some(remaining) = state.open_failures.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Connection(
                    "no hosts available".to_string(),
                ));
            }
        }
        Ok(FakeSession {
            cluster: self.clone(),
        })
    }
}

pub struct FakeSession {
    cluster: FakeCluster,
}

/// Name of the object a CREATE statement targets
fn created_object(cql: &str) -> Option<(String, String)> {
    let tokens: Vec<&str> = cql.split_whitespace().collect();
    if tokens.first() != Some(&"CREATE") {
        return None;
    }
    let kind = tokens.get(1)?.to_string();
    let name = if tokens.get(2) == Some(&"IF") {
        tokens.get(5)?
    } else {
        tokens.get(2)?
    };
    let name = name.split('(').next()?.to_string();
    Some((kind, name))
}

#[async_trait]
impl StorageSession for FakeSession {
    type Prepared = String;

    async fn execute(&self, cql: &str) -> Result<(), StorageError> {
        let mut state = self.cluster.state.lock().unwrap();
        state.statements.push(cql.to_string());

        let (kind, name) = created_object(cql)
            .ok_or_else(|| StorageError::Connection(format!("unsupported statement: {}", cql)))?;
        let if_not_exists = cql.contains("IF NOT EXISTS");
        let objects = match kind.as_str() {
            "KEYSPACE" => &mut state.keyspaces,
            "TABLE" => &mut state.tables,
            other => {
                return Err(StorageError::Connection(format!(
                    "unsupported object: {}",
                    other
                )))
            }
        };

        if !objects.insert(name.clone()) && !if_not_exists {
            return Err(StorageError::Connection(format!(
                "{} {} already exists",
                kind, name
            )));
        }
        Ok(())
    }

    async fn use_keyspace(&self, keyspace: &str) -> Result<(), StorageError> {
        let mut state = self.cluster.state.lock().unwrap();
        if !state.keyspaces.contains(keyspace) {
            return Err(StorageError::Connection(format!(
                "keyspace {} does not exist",
                keyspace
            )));
        }
        state.used_keyspace = Some(keyspace.to_string());
        Ok(())
    }

    async fn prepare(&self, cql: &str) -> Result<String, StorageError> {
        Ok(cql.to_string())
    }

    async fn execute_batch(
        &self,
        statement: &String,
        readings: &[SensorReading],
        consistency: Consistency,
    ) -> Result<(), StorageError> {
        let delay = {
            let mut state = self.cluster.state.lock().unwrap();
            state.writes_started += 1;
            state.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.cluster.state.lock().unwrap();
        if state.write_failures > 0 {
            state.write_failures -= 1;
            return Err(StorageError::Write(
                "write timeout: 1 of 2 replicas acknowledged".to_string(),
            ));
        }
        if !statement.starts_with("INSERT INTO") {
            return Err(StorageError::Write(format!(
                "unexpected statement: {}",
                statement
            )));
        }

        for reading in readings {
            state.rows.insert(
                (
                    reading.sensor_id().to_string(),
                    reading.timestamp().timestamp_millis(),
                ),
                reading.value(),
            );
        }
        state.batches.push((readings.len(), consistency));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn schema() -> SensorSchema {
    SensorSchema::new("iot_demo", "sensor_data", Replication::Simple { factor: 1 })
}

pub fn writer(cluster: &FakeCluster, metrics: &IngestMetrics) -> StorageWriter<FakeCluster> {
    StorageWriter::new(
        cluster.clone(),
        schema(),
        WriterOptions::default(),
        metrics.clone(),
    )
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        batch_size: 100,
        poll_timeout: Duration::from_millis(100),
    }
}

pub fn pipeline(
    bus: &MemoryBus,
    cluster: &FakeCluster,
    metrics: &IngestMetrics,
) -> Pipeline<MemorySource, FakeCluster> {
    Pipeline::new(
        bus.reader(),
        writer(cluster, metrics),
        pipeline_config(),
        metrics.clone(),
    )
}

/// Pipeline with the writer connected and the reader started, ready for
/// `run_once`
pub async fn started_pipeline(
    bus: &MemoryBus,
    cluster: &FakeCluster,
    metrics: &IngestMetrics,
) -> Pipeline<MemorySource, FakeCluster> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut writer = writer(cluster, metrics);
    writer.connect(shutdown_rx).await.unwrap();

    let mut source = bus.reader();
    source.start().await.unwrap();

    Pipeline::new(source, writer, pipeline_config(), metrics.clone())
}
