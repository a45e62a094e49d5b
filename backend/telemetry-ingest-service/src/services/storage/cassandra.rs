//! Cassandra / ScyllaDB backend built on the `scylla` driver.

use async_trait::async_trait;
use scylla::batch::{Batch, BatchType};
use scylla::frame::value::CqlTimestamp;
use scylla::load_balancing::DefaultPolicy;
use scylla::prepared_statement::PreparedStatement;
use scylla::query::Query;
use scylla::statement::Consistency;
use scylla::{ExecutionProfile, Session, SessionBuilder};
use std::time::Duration;

use super::{StorageBackend, StorageSession, WRITE_CONSISTENCY};
use crate::config::CassandraConfig;
use crate::error::StorageError;
use crate::models::SensorReading;

/// Opens driver sessions against the configured contact points
#[derive(Clone)]
pub struct ScyllaBackend {
    contact_points: Vec<String>,
    credentials: Option<(String, String)>,
    local_datacenter: Option<String>,
    connect_timeout: Duration,
}

impl ScyllaBackend {
    pub fn from_config(config: &CassandraConfig) -> Self {
        Self {
            contact_points: config.contact_points(),
            credentials: config
                .credentials()
                .map(|(u, p)| (u.to_string(), p.to_string())),
            local_datacenter: config.local_datacenter.clone(),
            connect_timeout: config.connect_timeout,
        }
    }
}

#[async_trait]
impl StorageBackend for ScyllaBackend {
    type Session = ScyllaSession;

    async fn open(&self) -> Result<ScyllaSession, StorageError> {
        let mut builder = SessionBuilder::new()
            .known_nodes(&self.contact_points)
            .connection_timeout(self.connect_timeout);

        if let Some((username, password)) = &self.credentials {
            builder = builder.user(username, password);
        }

        if let Some(dc) = &self.local_datacenter {
            let policy = DefaultPolicy::builder()
                .prefer_datacenter(dc.clone())
                .permit_dc_failover(false)
                .token_aware(true)
                .build();
            let profile = ExecutionProfile::builder()
                .load_balancing_policy(policy)
                .consistency(WRITE_CONSISTENCY)
                .build();
            builder = builder.default_execution_profile_handle(profile.into_handle());
        }

        let session = builder.build().await.map_err(|e| {
            StorageError::Connection(format!("{}: {}", self.contact_points.join(","), e))
        })?;

        Ok(ScyllaSession { session })
    }
}

pub struct ScyllaSession {
    session: Session,
}

#[async_trait]
impl StorageSession for ScyllaSession {
    type Prepared = PreparedStatement;

    async fn execute(&self, cql: &str) -> Result<(), StorageError> {
        self.session
            .query(Query::new(cql), ())
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Connection(format!("schema statement failed: {}", e)))
    }

    async fn use_keyspace(&self, keyspace: &str) -> Result<(), StorageError> {
        self.session
            .use_keyspace(keyspace, false)
            .await
            .map_err(|e| StorageError::Connection(format!("USE {} failed: {}", keyspace, e)))
    }

    async fn prepare(&self, cql: &str) -> Result<PreparedStatement, StorageError> {
        let mut prepared = self
            .session
            .prepare(Query::new(cql))
            .await
            .map_err(|e| StorageError::Connection(format!("prepare failed: {}", e)))?;
        prepared.set_consistency(WRITE_CONSISTENCY);
        Ok(prepared)
    }

    async fn execute_batch(
        &self,
        statement: &PreparedStatement,
        readings: &[SensorReading],
        consistency: Consistency,
    ) -> Result<(), StorageError> {
        let mut batch = Batch::new(BatchType::Logged);
        for _ in readings {
            batch.append_statement(statement.clone());
        }
        batch.set_consistency(consistency);

        let values: Vec<(&str, CqlTimestamp, f64)> = readings
            .iter()
            .map(|r| {
                (
                    r.sensor_id(),
                    CqlTimestamp(r.timestamp().timestamp_millis()),
                    r.value(),
                )
            })
            .collect();

        self.session
            .batch(&batch, values)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Write(e.to_string()))
    }
}
